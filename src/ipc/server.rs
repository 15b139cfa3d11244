//! Event Socket Server
//!
//! Accepts connections from the gateway bridge on a Unix socket. Message
//! events are acknowledged immediately and processed on their own tasks, so
//! a slow fetch never holds up the connection or other messages.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cache::CapacityPolicy;
use crate::chat::{MessageEvent, MessageHandler};
use crate::ipc::protocol::{
    parse_request, serialize_response, Request, Response, PROTOCOL_VERSION,
};

/// How long shutdown waits for in-flight messages
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// A message with a detected link, queued for processing
type Job = (MessageEvent, String);

/// Unix socket server feeding chat events to the message handler
pub struct IpcServer {
    handler: Arc<MessageHandler>,
    capacity: CapacityPolicy,
    socket_path: PathBuf,
    drain_timeout: Duration,
    listener: Option<UnixListener>,
}

impl IpcServer {
    /// Create a server that will listen on `socket_path`
    pub fn new(
        handler: Arc<MessageHandler>,
        capacity: CapacityPolicy,
        socket_path: PathBuf,
    ) -> Self {
        Self {
            handler,
            capacity,
            socket_path,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            listener: None,
        }
    }

    /// Bind the socket, replacing a stale socket file if present
    pub fn start(&mut self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .context("Failed to remove existing socket file")?;
        }

        let listener =
            UnixListener::bind(&self.socket_path).context("Failed to bind Unix socket")?;

        info!(socket_path = %self.socket_path.display(), "Event socket listening");

        self.listener = Some(listener);
        Ok(())
    }

    /// Serve until `shutdown` flips, then drain in-flight messages
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = self.listener.as_ref().context("Server not started")?;

        let (job_tx, mut job_rx) = mpsc::unbounded_channel::<Job>();
        let mut connections = JoinSet::new();
        let mut jobs = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        connections.spawn(handle_connection(
                            stream,
                            Arc::clone(&self.handler),
                            self.capacity,
                            job_tx.clone(),
                        ));
                    }
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
                Some((event, link)) = job_rx.recv() => {
                    let handler = Arc::clone(&self.handler);
                    jobs.spawn(async move {
                        handler.process(&event, &link).await;
                    });
                }
                Some(joined) = jobs.join_next() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Message task failed");
                    }
                }
                Some(joined) = connections.join_next() => {
                    match joined {
                        Ok(Err(e)) => error!(error = %e, "Connection handler error"),
                        Err(e) if e.is_panic() => error!(error = %e, "Connection handler panicked"),
                        _ => {}
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        connections.abort_all();

        // Jobs queued by connections but not yet started
        job_rx.close();
        while let Ok((event, link)) = job_rx.try_recv() {
            let handler = Arc::clone(&self.handler);
            jobs.spawn(async move {
                handler.process(&event, &link).await;
            });
        }

        if !jobs.is_empty() {
            info!(in_flight = jobs.len(), "Waiting for in-flight messages");
        }
        let drain = async {
            while jobs.join_next().await.is_some() {}
        };
        let drained = tokio::time::timeout(self.drain_timeout, drain).await.is_ok();
        if !drained {
            warn!(remaining = jobs.len(), "Drain timed out, aborting in-flight messages");
            jobs.shutdown().await;
        }

        remove_socket(&self.socket_path);
        info!("Event socket closed");
        Ok(())
    }
}

fn remove_socket(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove socket file");
        }
    }
}

/// Handle a single bridge connection
async fn handle_connection(
    stream: UnixStream,
    handler: Arc<MessageHandler>,
    capacity: CapacityPolicy,
    jobs: mpsc::UnboundedSender<Job>,
) -> Result<()> {
    debug!("New connection");

    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let read = buf_reader
            .read_line(&mut line)
            .await
            .context("Failed to read from socket")?;
        if read == 0 {
            debug!("Connection closed by client");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match parse_request(trimmed.as_bytes()) {
            Ok(request) => process_request(request, &handler, capacity, &jobs).await,
            Err(e) => {
                warn!(error = %e, "Failed to parse request");
                Response::Error {
                    error: format!("Invalid request: {}", e),
                }
            }
        };

        let json = serialize_response(&response).context("Failed to serialize response")?;
        writer
            .write_all(&json)
            .await
            .context("Failed to write response")?;
    }

    Ok(())
}

/// Process one request and build its response
async fn process_request(
    request: Request,
    handler: &MessageHandler,
    capacity: CapacityPolicy,
    jobs: &mpsc::UnboundedSender<Job>,
) -> Response {
    match request {
        Request::MessageCreate(event) => match handler.detect(&event) {
            Some(link) => {
                debug!(message = %event.id, link = %link, "Link detected");
                if jobs.send((event, link.clone())).is_err() {
                    return Response::Error {
                        error: "Shutting down".to_string(),
                    };
                }
                Response::Accepted { link }
            }
            None => Response::Ignored,
        },

        Request::GetStatus => {
            let store = handler.pipeline().store().clone();
            let usage = tokio::task::spawn_blocking(move || store.usage()).await;
            match usage {
                Ok(Ok((artifacts, total_bytes))) => Response::Status {
                    version: PROTOCOL_VERSION,
                    artifacts,
                    total_bytes,
                    max_bytes: capacity.max_bytes,
                    in_flight: handler.pipeline().in_flight(),
                    stats: handler.pipeline().stats(),
                },
                Ok(Err(e)) => Response::Error {
                    error: format!("Failed to read preview store: {}", e),
                },
                Err(e) => Response::Error {
                    error: format!("Status task failed: {}", e),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKey, CacheStore};
    use crate::chat::{LinkDetector, PublishError, Publisher};
    use crate::fetch::{FetchError, Fetcher};
    use crate::pipeline::Pipeline;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StubFetcher;

    #[async_trait]
    impl Fetcher for StubFetcher {
        async fn fetch(&self, _url: &str, destination: &std::path::Path) -> Result<(), FetchError> {
            tokio::fs::write(destination, vec![0u8; 100]).await.unwrap();
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn send_message(&self, _channel_id: &str, content: &str) -> Result<(), PublishError> {
            self.sent.lock().unwrap().push(content.to_string());
            Ok(())
        }

        async fn suppress_embeds(&self, _channel_id: &str, _message_id: &str) -> Result<(), PublishError> {
            Ok(())
        }
    }

    async fn request(
        reader: &mut BufReader<tokio::net::unix::OwnedReadHalf>,
        writer: &mut tokio::net::unix::OwnedWriteHalf,
        line: &str,
    ) -> Response {
        writer.write_all(line.as_bytes()).await.unwrap();
        writer.write_all(b"\n").await.unwrap();
        let mut response = String::new();
        reader.read_line(&mut response).await.unwrap();
        serde_json::from_str(&response).unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_over_socket() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CacheStore::open(tmp.path().join("previews")).unwrap();
        let pipeline = Arc::new(Pipeline::new(store, Arc::new(StubFetcher)));
        let publisher = Arc::new(RecordingPublisher::default());
        let handler = Arc::new(MessageHandler::new(
            pipeline,
            Arc::clone(&publisher) as Arc<dyn Publisher>,
            LinkDetector::new().unwrap(),
            "https://preview.example/".to_string(),
            "bot-1".to_string(),
        ));

        let socket_path = tmp.path().join("events.sock");
        let mut server = IpcServer::new(handler, CapacityPolicy::new(1_000), socket_path.clone());
        server.start().unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server_task = tokio::spawn(async move { server.run(shutdown_rx).await });

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let response = request(
            &mut reader,
            &mut writer,
            r#"{"type":"messageCreate","id":"m1","channelId":"c1","authorId":"u1","content":"see https://x.com/a/status/1"}"#,
        )
        .await;
        assert_eq!(
            response,
            Response::Accepted {
                link: "https://x.com/a/status/1".to_string()
            }
        );

        let response = request(
            &mut reader,
            &mut writer,
            r#"{"type":"messageCreate","id":"m2","channelId":"c1","authorId":"u1","content":"no links here"}"#,
        )
        .await;
        assert_eq!(response, Response::Ignored);

        let response = request(&mut reader, &mut writer, "not json").await;
        assert!(matches!(response, Response::Error { .. }));

        let key = CacheKey::derive("https://x.com/a/status/1");
        let expected = format!("https://preview.example/{}.mp4", key);
        for _ in 0..500 {
            if !publisher.sent.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*publisher.sent.lock().unwrap(), vec![expected]);

        match request(&mut reader, &mut writer, r#"{"type":"getStatus"}"#).await {
            Response::Status {
                artifacts,
                total_bytes,
                max_bytes,
                stats,
                ..
            } => {
                assert_eq!(artifacts, 1);
                assert_eq!(total_bytes, 100);
                assert_eq!(max_bytes, 1_000);
                assert_eq!(stats.misses, 1);
            }
            other => panic!("Expected Status, got {other:?}"),
        }

        shutdown_tx.send(true).unwrap();
        server_task.await.unwrap().unwrap();
        assert!(!socket_path.exists());
    }
}
