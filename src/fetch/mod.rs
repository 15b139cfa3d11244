//! Clip fetching
//!
//! The only part of the daemon that touches the network or spawns a
//! process. Kept behind a trait so the pipeline can be driven by fakes.

pub mod errors;
pub mod ytdlp;

use std::path::Path;

use async_trait::async_trait;

pub use errors::FetchError;
pub use ytdlp::YtDlpFetcher;

/// Produces exactly one clip at `destination` on success
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch and transcode `url` into `destination`
    async fn fetch(&self, url: &str, destination: &Path) -> Result<(), FetchError>;
}
