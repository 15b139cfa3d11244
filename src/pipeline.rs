//! Preview Request Pipeline
//!
//! Resolves a source URL to a cached clip: derive key, check the store,
//! fetch on a miss, return the artifact's relative name.
//!
//! Requests are handled concurrently, so fetches are single-flight per key.
//! The first caller for a key runs the fetch; callers arriving while it is in
//! flight wait for it and share its outcome, success or failure. The registry
//! entry is dropped as soon as the fetch settles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::cache::{CacheKey, CacheStore};
use crate::fetch::{FetchError, Fetcher};

/// Relative name of a stored clip, joined with the public base by callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    /// Reference for the artifact stored under `key`
    pub fn for_key(key: &CacheKey) -> Self {
        Self(key.file_name())
    }

    /// File name relative to the store root
    pub fn name(&self) -> &str {
        &self.0
    }

    /// Link to publish: the base address followed by the file name
    pub fn public_url(&self, base_url: &str) -> String {
        format!("{}{}", base_url, self.0)
    }
}

/// Why no preview could be produced
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    #[error("Fetch failed: {0}")]
    Fetch(Arc<FetchError>),

    #[error("In-flight fetch for {0} was abandoned")]
    Abandoned(CacheKey),
}

type FlightOutcome = Result<ArtifactRef, PipelineError>;

/// Request counters
#[derive(Debug, Default)]
pub struct PipelineStats {
    hits: AtomicU64,
    misses: AtomicU64,
    joined: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Requests served from the store
    pub hits: u64,
    /// Requests that started a fetch
    pub misses: u64,
    /// Requests that waited on another request's fetch
    pub joined: u64,
    /// Fetches that failed
    pub failures: u64,
}

impl PipelineStats {
    /// Current counter values
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            joined: self.joined.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

type FlightMap = HashMap<CacheKey, watch::Receiver<Option<FlightOutcome>>>;

enum Role {
    Leader(watch::Sender<Option<FlightOutcome>>),
    Follower(watch::Receiver<Option<FlightOutcome>>),
}

/// Removes a leader's registry entry however the fetch ends
struct FlightGuard<'a> {
    inflight: &'a Mutex<FlightMap>,
    key: &'a CacheKey,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        lock(self.inflight).remove(self.key);
    }
}

fn lock(map: &Mutex<FlightMap>) -> MutexGuard<'_, FlightMap> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// URL to clip resolution with per-key single-flight fetching
pub struct Pipeline {
    store: CacheStore,
    fetcher: Arc<dyn Fetcher>,
    inflight: Mutex<FlightMap>,
    stats: PipelineStats,
}

impl Pipeline {
    /// Create a pipeline over `store` using `fetcher` for misses
    pub fn new(store: CacheStore, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            store,
            fetcher,
            inflight: Mutex::new(HashMap::new()),
            stats: PipelineStats::default(),
        }
    }

    /// Resolve `url` to a stored clip, fetching it if absent
    pub async fn resolve_preview(&self, url: &str) -> Result<ArtifactRef, PipelineError> {
        let key = CacheKey::derive(url);

        if self.store.has(&key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Preview cache HIT");
            return Ok(ArtifactRef::for_key(&key));
        }

        let role = {
            let mut inflight = lock(&self.inflight);
            match inflight.get(&key) {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    // A leader may have settled since the check above
                    if self.store.has(&key) {
                        self.stats.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(ArtifactRef::for_key(&key));
                    }
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(key.clone(), rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Follower(mut rx) => {
                self.stats.joined.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Preview fetch already in flight, waiting");
                let outcome = rx.wait_for(Option::is_some).await.map(|o| (*o).clone());
                match outcome {
                    Ok(Some(outcome)) => outcome,
                    _ => Err(PipelineError::Abandoned(key)),
                }
            }
            Role::Leader(tx) => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Preview cache MISS, fetching");

                let guard = FlightGuard {
                    inflight: &self.inflight,
                    key: &key,
                };
                let path = self.store.artifact_path(&key);
                let outcome = match self.fetcher.fetch(url, &path).await {
                    Ok(()) => Ok(ArtifactRef::for_key(&key)),
                    Err(e) => {
                        self.stats.failures.fetch_add(1, Ordering::Relaxed);
                        Err(PipelineError::Fetch(Arc::new(e)))
                    }
                };

                // Unregister before publishing so late arrivals see the store
                drop(guard);
                tx.send_replace(Some(outcome.clone()));
                outcome
            }
        }
    }

    /// Resolve `url`, logging and swallowing any failure.
    ///
    /// Message handlers use this: an unfetchable link just gets no reply.
    pub async fn preview(&self, url: &str) -> Option<ArtifactRef> {
        match self.resolve_preview(url).await {
            Ok(artifact) => Some(artifact),
            Err(PipelineError::Fetch(e)) if e.is_source_failure() => {
                warn!(url = url, error = %e, "No preview available");
                None
            }
            Err(e) => {
                error!(url = url, error = %e, "Preview fetch failed");
                None
            }
        }
    }

    /// Number of fetches currently running
    pub fn in_flight(&self) -> usize {
        lock(&self.inflight).len()
    }

    /// Request counters
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Store this pipeline writes to
    pub fn store(&self) -> &CacheStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Writes a small dummy clip after an optional gate
    #[derive(Default)]
    struct FakeFetcher {
        calls: AtomicUsize,
        destinations: Mutex<Vec<(String, PathBuf)>>,
        fail: bool,
        gate: Option<Arc<Notify>>,
        hang: bool,
    }

    #[async_trait]
    impl Fetcher for FakeFetcher {
        async fn fetch(&self, url: &str, destination: &Path) -> Result<(), FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.destinations
                .lock()
                .unwrap()
                .push((url.to_string(), destination.to_path_buf()));
            if self.hang {
                std::future::pending::<()>().await;
            }
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                return Err(FetchError::MissingOutput);
            }
            std::fs::write(destination, vec![0u8; 64]).unwrap();
            Ok(())
        }
    }

    fn pipeline(fetcher: Arc<FakeFetcher>) -> (tempfile::TempDir, Arc<Pipeline>) {
        let tmp = tempfile::tempdir().unwrap();
        let store = CacheStore::open(tmp.path()).unwrap();
        (tmp, Arc::new(Pipeline::new(store, fetcher)))
    }

    async fn wait_until_in_flight(pipeline: &Pipeline, n: usize) {
        for _ in 0..1000 {
            if pipeline.in_flight() == n {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("in-flight count never reached {n}");
    }

    #[tokio::test]
    async fn test_miss_then_hit_fetches_once() {
        let fetcher = Arc::new(FakeFetcher::default());
        let (_tmp, pipeline) = pipeline(Arc::clone(&fetcher));

        let first = pipeline.resolve_preview("https://x.com/video/1").await.unwrap();
        let second = pipeline.resolve_preview("https://x.com/video/1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        let stats = pipeline.stats();
        assert_eq!((stats.misses, stats.hits), (1, 1));
    }

    #[tokio::test]
    async fn test_end_to_end_reference() {
        let fetcher = Arc::new(FakeFetcher::default());
        let (tmp, pipeline) = pipeline(Arc::clone(&fetcher));
        let key = CacheKey::derive("https://x.com/video/1");

        let artifact = pipeline.resolve_preview("https://x.com/video/1").await.unwrap();

        assert_eq!(artifact.name(), format!("{}.mp4", key));
        let calls = fetcher.destinations.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![(
                "https://x.com/video/1".to_string(),
                tmp.path().join(format!("{}.mp4", key))
            )]
        );
        assert_eq!(
            artifact.public_url("https://preview.example/"),
            format!("https://preview.example/{}.mp4", key)
        );
    }

    #[tokio::test]
    async fn test_failing_fetcher_yields_no_preview() {
        let fetcher = Arc::new(FakeFetcher {
            fail: true,
            ..FakeFetcher::default()
        });
        let (tmp, pipeline) = pipeline(Arc::clone(&fetcher));

        assert!(pipeline.preview("https://www.tiktok.com/@a/video/9").await.is_none());
        assert!(matches!(
            pipeline.resolve_preview("https://www.tiktok.com/@a/video/9").await,
            Err(PipelineError::Fetch(_))
        ));
        // Failures are not cached, and the registry entry is released
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(pipeline.in_flight(), 0);
        assert_eq!(pipeline.stats().failures, 2);
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_fetch() {
        let gate = Arc::new(Notify::new());
        let fetcher = Arc::new(FakeFetcher {
            gate: Some(Arc::clone(&gate)),
            ..FakeFetcher::default()
        });
        let (_tmp, pipeline) = pipeline(Arc::clone(&fetcher));

        let leader = {
            let p = Arc::clone(&pipeline);
            tokio::spawn(async move { p.resolve_preview("https://reddit.com/r/a/1").await })
        };
        wait_until_in_flight(&pipeline, 1).await;

        let followers: Vec<_> = (0..4)
            .map(|_| {
                let p = Arc::clone(&pipeline);
                tokio::spawn(async move { p.resolve_preview("https://reddit.com/r/a/1").await })
            })
            .collect();
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        gate.notify_one();

        let expected = leader.await.unwrap().unwrap();
        for f in followers {
            assert_eq!(f.await.unwrap().unwrap(), expected);
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_failure() {
        let gate = Arc::new(Notify::new());
        let fetcher = Arc::new(FakeFetcher {
            gate: Some(Arc::clone(&gate)),
            fail: true,
            ..FakeFetcher::default()
        });
        let (_tmp, pipeline) = pipeline(Arc::clone(&fetcher));

        let leader = {
            let p = Arc::clone(&pipeline);
            tokio::spawn(async move { p.resolve_preview("https://instagram.com/reel/z").await })
        };
        wait_until_in_flight(&pipeline, 1).await;

        let follower = {
            let p = Arc::clone(&pipeline);
            tokio::spawn(async move { p.resolve_preview("https://instagram.com/reel/z").await })
        };
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        assert!(leader.await.unwrap().is_err());
        assert!(matches!(follower.await.unwrap(), Err(PipelineError::Fetch(_))));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_keys_fetch_independently() {
        let fetcher = Arc::new(FakeFetcher::default());
        let (_tmp, pipeline) = pipeline(Arc::clone(&fetcher));

        let (a, b) = tokio::join!(
            pipeline.resolve_preview("https://x.com/video/1"),
            pipeline.resolve_preview("https://x.com/video/2"),
        );
        assert_ne!(a.unwrap(), b.unwrap());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_abandoned_leader_releases_followers() {
        let fetcher = Arc::new(FakeFetcher {
            hang: true,
            ..FakeFetcher::default()
        });
        let (_tmp, pipeline) = pipeline(Arc::clone(&fetcher));

        let leader = {
            let p = Arc::clone(&pipeline);
            tokio::spawn(async move { p.resolve_preview("https://x.com/video/3").await })
        };
        wait_until_in_flight(&pipeline, 1).await;

        let follower = {
            let p = Arc::clone(&pipeline);
            tokio::spawn(async move { p.resolve_preview("https://x.com/video/3").await })
        };
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        leader.abort();
        let result = tokio::time::timeout(Duration::from_secs(5), follower)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(PipelineError::Abandoned(_))));
        assert_eq!(pipeline.in_flight(), 0);
    }
}
