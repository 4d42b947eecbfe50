//! Uploaded-file temp storage and background reaping.
//!
//! Multipart file parts are spilled to uuid-named temp files under the
//! configured upload directory. Temp files are transient by contract: a
//! supervised background task deletes anything older than
//! `UPLOAD_MAX_TEMP_AGE` every `UPLOAD_CLEANUP_INTERVAL`, so an upload that
//! was never consumed (or a crashed handler) cannot leak disk space.

use std::{collections::HashMap, path::PathBuf, time::Duration};

use futures_util::FutureExt;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::UploadConfig;

/// A file received through a multipart form, spilled to disk.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    /// Client-provided file name, when present.
    pub filename: Option<String>,
    /// Temp file holding the upload contents.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    /// Part content type, when the client sent one.
    pub content_type: Option<String>,
    /// Raw part headers.
    pub headers: HashMap<String, String>,
}

/// Allocates a fresh temp path for an upload under the configured directory.
pub(crate) fn temp_path(config: &UploadConfig) -> PathBuf {
    config.temp_dir.join(format!("hibana-upload-{}", Uuid::new_v4()))
}

/// Spawns the temp-file reaper.
///
/// The reaper sweeps the upload directory on the configured interval and
/// deletes temp files older than `max_temp_age`. A panicking sweep is logged
/// and the loop continues; the task stops when the shutdown signal fires.
pub fn spawn_reaper(
    config: UploadConfig,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(config.cleanup_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let dir = config.temp_dir.clone();
                    let max_age = config.max_temp_age;
                    let sweep = std::panic::AssertUnwindSafe(sweep(dir, max_age)).catch_unwind();
                    if let Err(panic) = sweep.await {
                        let detail = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| "upload sweep panicked".to_string());
                        tracing::error!(detail, "upload reaper sweep failed; restarting");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

/// Deletes temp files older than `max_age`. Only files matching the upload
/// naming scheme are touched.
async fn sweep(dir: PathBuf, max_age: Duration) {
    let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
        return;
    };

    let mut removed = 0usize;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with("hibana-upload-") {
            continue;
        }

        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        let age = meta
            .modified()
            .ok()
            .and_then(|m| m.elapsed().ok())
            .unwrap_or(Duration::ZERO);
        if age > max_age && tokio::fs::remove_file(entry.path()).await.is_ok() {
            removed += 1;
        }
    }

    if removed > 0 {
        tracing::debug!(removed, dir = %dir.display(), "reaped stale upload temp files");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: PathBuf) -> UploadConfig {
        UploadConfig {
            max_file_size: 1024,
            temp_dir: dir,
            buffer_size: 1024,
            cleanup_interval: Duration::from_millis(20),
            max_temp_age: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn reaper_removes_stale_temp_files_and_stops_on_shutdown() {
        let dir = std::env::temp_dir().join(format!("hibana-reaper-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let stale = dir.join("hibana-upload-stale");
        tokio::fs::write(&stale, b"old").await.unwrap();
        let unrelated = dir.join("keep.txt");
        tokio::fs::write(&unrelated, b"keep").await.unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = spawn_reaper(test_config(dir.clone()), rx);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!stale.exists());
        assert!(unrelated.exists());

        tx.send(true).unwrap();
        handle.await.unwrap();
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
