use clap::ValueEnum;
use segdl::{ReconcilePolicy, SidecarPolicy};

/// What to do with the resume sidecar after a successful download.
#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum SidecarMode {
    Remove,
    Retain,
}

impl From<SidecarMode> for SidecarPolicy {
    fn from(mode: SidecarMode) -> Self {
        match mode {
            SidecarMode::Remove => SidecarPolicy::Remove,
            SidecarMode::Retain => SidecarPolicy::Retain,
        }
    }
}

/// Which segment size wins when a stored plan disagrees with `--segment-size`.
#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum ConflictMode {
    /// Keep resuming with the stored plan.
    Stored,
    /// Discard the stored plan and start over.
    Replan,
}

impl From<ConflictMode> for ReconcilePolicy {
    fn from(mode: ConflictMode) -> Self {
        match mode {
            ConflictMode::Stored => ReconcilePolicy::PreferStored,
            ConflictMode::Replan => ReconcilePolicy::Replan,
        }
    }
}
