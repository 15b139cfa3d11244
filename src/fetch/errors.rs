//! Fetch Error Types
//!
//! Failures of a single fetch/transcode invocation. None of these are
//! retried; the pipeline reports them and the requester sees no preview.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

/// Fetch/transcode failure
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Failed to spawn fetch tool: {0}")]
    Spawn(#[source] io::Error),

    #[error("Failed to create fetch scratch directory: {0}")]
    Scratch(#[source] io::Error),

    #[error("Fetch tool exited unsuccessfully ({0})")]
    Exit(ExitStatus),

    #[error("Fetch tool exceeded {0:?} and was killed")]
    TimedOut(Duration),

    #[error("Fetch cancelled by shutdown")]
    Cancelled,

    #[error("Fetch tool reported success but produced no output")]
    MissingOutput,

    #[error("Failed to move fetched clip into the store: {0}")]
    Publish(#[source] io::Error),
}

impl FetchError {
    /// Whether the failure came from the source rather than from this host
    pub fn is_source_failure(&self) -> bool {
        matches!(self, FetchError::Exit(_) | FetchError::MissingOutput)
    }
}
