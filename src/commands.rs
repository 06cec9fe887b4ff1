use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indicatif::{HumanBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};
use segdl::state::{self, sidecar_path};
use segdl::utils::filename_from_url;
use segdl::{Config, DownloadError, Downloader, SegmentStatus, TransferSnapshot};
use tokio::fs;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn run_single_download(url: String, output: PathBuf, config: Config) -> Result<()> {
    if !output.exists() {
        fs::create_dir_all(&output).await.context("Failed to create output directory")?;
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, keeping resume state");
            ctrl_c.cancel();
        }
    });

    let show_progress = config.use_stats;
    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    let downloader = Downloader::new(config)
        .with_cancellation(cancel)
        .with_progress(progress_tx);

    let pb = show_progress.then(new_progress_bar);
    let renderer = pb.clone().map(|pb| tokio::spawn(render_progress(pb, progress_rx)));

    let result = downloader.download(&output, &url).await;
    // The downloader owns the sender; dropping it ends the renderer.
    drop(downloader);
    if let Some(renderer) = renderer {
        let _ = renderer.await;
    }

    match result {
        Ok(report) => {
            if let Some(pb) = &pb {
                pb.finish_with_message(format!("Completed   {}", report.path.display()));
            }
            info!(
                path = %report.path.display(),
                bytes = report.bytes,
                attempts = report.attempts,
                resumed = report.resumed,
                "download finished"
            );
            Ok(())
        }
        Err(e) => {
            if let Some(pb) = &pb {
                pb.abandon_with_message(format!("Failed      {}", url));
            }
            if matches!(e, DownloadError::Cancelled) {
                eprintln!("Download interrupted; run the same command again to resume.");
            }
            Err(e).with_context(|| format!("Failed to download {}", url))
        }
    }
}

fn new_progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    pb
}

async fn render_progress(pb: ProgressBar, mut rx: mpsc::UnboundedReceiver<TransferSnapshot>) {
    while let Some(snapshot) = rx.recv().await {
        pb.set_length(snapshot.total_size);
        pb.set_position(snapshot.transferred.min(snapshot.total_size));
        pb.set_message(format!(
            "{:>10}/s  segments {}/{}  {}",
            HumanBytes(snapshot.bytes_per_second as u64),
            snapshot.segments_completed,
            snapshot.segments_total,
            snapshot.filename
        ));
    }
}

/// Prints what the sidecar for `url` in `output` says about the transfer.
pub async fn show_status(output: &Path, url: &str) -> Result<()> {
    let destination = output.join(filename_from_url(url));
    let sidecar = sidecar_path(&destination);

    let Some(saved) = state::load(&sidecar).await else {
        if destination.exists() {
            let size = fs::metadata(&destination).await?.len();
            println!("{:<50} {:<15} {:<15}", "Filename", "Status", "Size");
            println!("{:-<50} {:-<15} {:-<15}", "", "", "");
            println!(
                "{:<50} {:<15} {:<15}",
                destination.display(),
                "Completed",
                format!("{}", HumanBytes(size))
            );
        } else {
            println!("No download state found at {:?}.", sidecar);
            println!("Tip: If you used a custom download directory, please specify it with --download-dir");
        }
        return Ok(());
    };

    let total = saved.planned_length();
    let done = saved.completed_bytes();
    let progress = done as f64 / total as f64 * 100.0;
    let status = if saved.all_complete {
        "Completed"
    } else if saved.failed > 0 {
        "Failing"
    } else {
        "Downloading"
    };

    println!("{:<50} {:<15} {:<15} {:<15}", "Filename", "Status", "Progress", "Size");
    println!("{:-<50} {:-<15} {:-<15} {:-<15}", "", "", "", "");
    println!(
        "{:<50} {:<15} {:<15} {:<15}",
        destination.display(),
        status,
        format!("{:.2}%", progress),
        format!("{}", HumanBytes(total))
    );
    println!();
    println!(
        "Segments: {} completed | {} failed | {} pending | {} total ({} each)",
        saved.completed,
        saved.failed,
        saved.pending(),
        saved.segments.len(),
        HumanBytes(saved.config.segment_size)
    );
    let failed: Vec<String> = saved
        .segments
        .iter()
        .filter(|s| s.status == SegmentStatus::Failed)
        .map(|s| format!("#{} [{}-{}]", s.index, s.start, s.end))
        .collect();
    if !failed.is_empty() {
        println!("Failed segments: {}", failed.join(", "));
    }
    println!("Last update: {}", saved.updated_at.to_rfc3339());

    Ok(())
}
