//! Locating collected test results and archiving fork logs.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Binary summary written by the runner; marks a directory as holding
/// valid results.
pub const RESULTS_MARKER: &str = "results.bin";

/// Local directory the results of `pod` are copied into.
pub fn results_dir(output_dir: &Path, pod: &str) -> PathBuf {
    output_dir.join("test-results-xml").join(pod)
}

/// Local path of the archived log of `pod`.
pub fn log_path(output_dir: &Path, pod: &str) -> PathBuf {
    output_dir.join("logs").join(format!("{}.log", pod))
}

/// Every directory under `root` that directly contains [`RESULTS_MARKER`],
/// sorted. A missing root yields nothing.
pub fn find_result_dirs(root: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file() && entry.file_name() == RESULTS_MARKER)
        .filter_map(|entry| entry.path().parent().map(Path::to_path_buf))
        .collect();
    dirs.sort();
    dirs
}

/// Moves a temporary log into the output tree.
pub async fn archive_log(log: &Path, destination: &Path) -> std::io::Result<()> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::rename(log, destination).await.is_err() {
        // Cross-device: fall back to copy.
        tokio::fs::copy(log, destination).await?;
        let _ = tokio::fs::remove_file(log).await;
    }
    Ok(())
}
