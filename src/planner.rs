//! Splits a resource into byte-range segments.

use crate::state::{Segment, SegmentStatus};

/// Plans the segments for a resource.
///
/// Unknown or degenerate lengths and servers without range support get a
/// single segment covering the whole resource. Otherwise the resource is cut
/// into `length / segment_size` equal segments (at least one) and the last one
/// absorbs the remainder. The result depends only on the inputs.
pub fn plan_segments(length: Option<u64>, accepts_ranges: bool, segment_size: u64) -> Vec<Segment> {
    let length = length.unwrap_or(1).max(1);
    let segment_size = segment_size.max(1);

    if !accepts_ranges || length == 1 {
        return vec![Segment::new(0, 0, length - 1)];
    }

    let count = (length / segment_size).max(1);
    let per_segment = length / count;
    let remainder = length % count;

    (0..count)
        .map(|i| {
            let start = i * per_segment;
            let mut end = start + per_segment - 1;
            if i == count - 1 {
                end += remainder;
            }
            Segment::new(i as usize, start, end)
        })
        .collect()
}

/// Checks that `segments` are indexed in order and partition `[0, length)`
/// exactly.
pub fn validate_cover(segments: &[Segment], length: u64) -> bool {
    if segments.is_empty() {
        return false;
    }
    let mut next = 0u64;
    for (i, segment) in segments.iter().enumerate() {
        if segment.index != i || segment.start != next || segment.end < segment.start {
            return false;
        }
        next = match segment.end.checked_add(1) {
            Some(next) => next,
            None => return false,
        };
    }
    next == length.max(1)
}

/// Bytes covered by the Completed segments of a plan.
pub fn completed_bytes(segments: &[Segment]) -> u64 {
    segments
        .iter()
        .filter(|s| s.status == SegmentStatus::Completed)
        .map(Segment::len)
        .sum()
}
