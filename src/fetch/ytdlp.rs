//! yt-dlp Fetcher
//!
//! Runs yt-dlp with ffmpeg as the downloader so the clip can be capped at
//! 60 seconds, preferring H.264 and never expanding playlists. Output is
//! written into a scratch directory inside the store and renamed onto the
//! artifact path only after a clean exit, so a failed or interrupted fetch
//! never leaves a file that looks like a cache hit.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{FetchError, Fetcher};
use crate::cache::store::SCRATCH_PREFIX;

/// Default executable name
pub const DEFAULT_PROGRAM: &str = "yt-dlp";

/// Default wall-clock limit for one fetch
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(300);

/// Output duration cap passed to ffmpeg, in seconds
pub const MAX_CLIP_SECS: u32 = 60;

/// Fetcher backed by the yt-dlp command line tool
pub struct YtDlpFetcher {
    /// Executable to run
    program: PathBuf,
    /// Wall-clock limit for the subprocess
    timeout: Duration,
    /// Flips to `true` on process shutdown
    shutdown: Option<watch::Receiver<bool>>,
}

impl YtDlpFetcher {
    /// Create a fetcher with no shutdown hook
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
            shutdown: None,
        }
    }

    /// Kill in-flight fetches when `shutdown` flips to `true`
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }
}

/// Arguments for one invocation writing `file_name` under `output_dir`
pub fn command_args(url: &str, file_name: &str, output_dir: &Path) -> Vec<OsString> {
    vec![
        "--downloader".into(),
        "ffmpeg".into(),
        "--downloader-args".into(),
        format!("ffmpeg:-to {} -loglevel warning", MAX_CLIP_SECS).into(),
        "-S".into(),
        "+vcodec:avc".into(),
        "--no-playlist".into(),
        "-o".into(),
        file_name.into(),
        "-P".into(),
        output_dir.as_os_str().to_owned(),
        url.into(),
    ]
}

/// Resolves once `shutdown` carries `true`; never resolves without a hook
async fn wait_for_shutdown(shutdown: Option<watch::Receiver<bool>>) {
    let stopped = match shutdown {
        Some(mut rx) => rx.wait_for(|stop| *stop).await.map(|_| ()).is_ok(),
        None => false,
    };
    if !stopped {
        // Sender gone or no hook: nothing will ever cancel this fetch
        std::future::pending::<()>().await;
    }
}

#[async_trait]
impl Fetcher for YtDlpFetcher {
    async fn fetch(&self, url: &str, destination: &Path) -> Result<(), FetchError> {
        if self.is_shutting_down() {
            return Err(FetchError::Cancelled);
        }

        let file_name = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or(FetchError::MissingOutput)?;
        let store_root = destination.parent().unwrap_or(Path::new("."));

        // Dropped on every exit path, taking any partial output with it
        let scratch = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(store_root)
            .map_err(FetchError::Scratch)?;

        info!(url = url, output = %file_name, "Fetching clip");

        let mut child = Command::new(&self.program)
            .args(command_args(url, &file_name, scratch.path()))
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(FetchError::Spawn)?;

        let status = tokio::select! {
            status = child.wait() => status.map_err(FetchError::Spawn)?,
            _ = tokio::time::sleep(self.timeout) => {
                warn!(url = url, timeout_secs = self.timeout.as_secs(), "Fetch timed out, killing fetch tool");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill fetch tool");
                }
                return Err(FetchError::TimedOut(self.timeout));
            }
            _ = wait_for_shutdown(self.shutdown.clone()) => {
                debug!(url = url, "Shutdown during fetch, killing fetch tool");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill fetch tool");
                }
                return Err(FetchError::Cancelled);
            }
        };

        if !status.success() {
            return Err(FetchError::Exit(status));
        }

        let produced = scratch.path().join(&file_name);
        if !tokio::fs::try_exists(&produced).await.unwrap_or(false) {
            return Err(FetchError::MissingOutput);
        }

        tokio::fs::rename(&produced, destination)
            .await
            .map_err(FetchError::Publish)?;

        info!(url = url, output = %destination.display(), "Clip stored");
        Ok(())
    }
}
