//! Per-client relays: one dedicated capture session per HTTP client.
//!
//! A relay is opened when a client requests a synchronized audio+video (or
//! audio-only) stream and closed when that client goes away. There is no
//! retry here; the client reconnects and gets a fresh relay.
//!
//! The session registry is a [`DashMap`], so inserts and removals only lock
//! one shard and never span any I/O.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use nerdcam_common::{Error, RelayId, RelayProfile, Result};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use super::capture::CaptureSession;
use super::commands::{CaptureCommands, SharedSettings};
use crate::config::RelayConfig;
use crate::events::{EventBus, RelayEvent};

struct RelayEntry {
    profile: RelayProfile,
    peer: Option<SocketAddr>,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    bytes_sent: Arc<AtomicU64>,
    session: Arc<Mutex<CaptureSession>>,
}

/// Snapshot of one open relay.
#[derive(Debug, Clone, Serialize)]
pub struct RelayInfo {
    pub id: RelayId,
    pub profile: RelayProfile,
    pub peer: Option<SocketAddr>,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub bytes_sent: u64,
}

/// Opens, tracks, and tears down per-client relays.
pub struct RelayManager {
    commands: Arc<dyn CaptureCommands>,
    settings: SharedSettings,
    config: RelayConfig,
    wait_timeout: Duration,
    sessions: DashMap<RelayId, RelayEntry>,
    events: Arc<EventBus>,
    cancel: CancellationToken,
    opened: AtomicU64,
    closed: AtomicU64,
}

impl RelayManager {
    pub fn new(
        commands: Arc<dyn CaptureCommands>,
        settings: SharedSettings,
        config: RelayConfig,
        wait_timeout: Duration,
        events: Arc<EventBus>,
        shutdown: &CancellationToken,
    ) -> Self {
        Self {
            commands,
            settings,
            config,
            wait_timeout,
            sessions: DashMap::new(),
            events,
            cancel: shutdown.child_token(),
            opened: AtomicU64::new(0),
            closed: AtomicU64::new(0),
        }
    }

    /// Spawn a dedicated capture session and wait for its first bytes.
    ///
    /// # Errors
    ///
    /// [`Error::UpstreamUnavailable`] if the process cannot be started, exits
    /// without output, or produces nothing within the startup timeout. The
    /// session is reaped before the error is returned.
    pub async fn open(
        self: &Arc<Self>,
        profile: RelayProfile,
        peer: Option<SocketAddr>,
    ) -> Result<RelayStream> {
        if self.cancel.is_cancelled() {
            return Err(Error::unavailable("server is shutting down"));
        }

        let settings = *self.settings.read();
        let spec = self.commands.relay(profile, &settings);
        let mut session =
            CaptureSession::start(&spec, settings.transport, self.commands.upstream_uri())
                .map_err(|e| Error::unavailable(format!("relay failed to start: {e}")))?;

        let id = RelayId::new();
        let stdout = session.take_output();
        let pid = session.pid();
        let bytes_sent = Arc::new(AtomicU64::new(0));
        let session = Arc::new(Mutex::new(session));

        self.sessions.insert(
            id,
            RelayEntry {
                profile,
                peer,
                pid,
                started_at: Utc::now(),
                bytes_sent: Arc::clone(&bytes_sent),
                session: Arc::clone(&session),
            },
        );
        self.opened.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            relay_id = %id,
            %profile,
            pid = ?pid,
            peer = ?peer,
            transport = %settings.transport,
            active = self.sessions.len(),
            "Relay opened"
        );
        self.events.publish(RelayEvent::RelayOpened {
            relay_id: id,
            profile,
        });

        let guard = RelayGuard {
            id,
            manager: Arc::clone(self),
            session,
        };

        let Some(stdout) = stdout else {
            guard.close().await;
            return Err(Error::internal("relay process has no output stream"));
        };
        let mut reader = ReaderStream::with_capacity(stdout, 64 * 1024);

        let first = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            first = tokio::time::timeout(self.config.startup_timeout(), reader.next()) => match first {
                Ok(Some(Ok(chunk))) => Some(chunk),
                Ok(Some(Err(e))) => {
                    tracing::debug!(relay_id = %id, error = %e, "Relay output read failed");
                    None
                }
                Ok(None) => None,
                Err(_elapsed) => {
                    tracing::debug!(relay_id = %id, "Relay produced no output within startup timeout");
                    None
                }
            },
        };

        let Some(first) = first else {
            let tail = guard.stderr_tail().await;
            guard.close().await;
            tracing::info!(relay_id = %id, stderr = ?tail, "Relay produced no output");
            return Err(Error::unavailable(match tail.last() {
                Some(line) => format!("relay produced no output: {line}"),
                None => "relay produced no output".to_string(),
            }));
        };
        bytes_sent.fetch_add(first.len() as u64, Ordering::Relaxed);

        Ok(RelayStream {
            id,
            profile,
            first: Some(first),
            reader,
            cancel: self.cancel.child_token(),
            bytes_sent,
            guard,
        })
    }

    /// Kill and reap a relay's session and drop it from the registry.
    /// Closing an unknown or already closed relay is a no-op.
    pub async fn close(&self, id: RelayId) {
        let session = self.sessions.get(&id).map(|e| Arc::clone(&e.session));
        let Some(session) = session else {
            return;
        };

        {
            let mut session = session.lock().await;
            if let Err(e) = session.terminate(self.wait_timeout).await {
                tracing::error!(relay_id = %id, pid = ?session.pid(), error = %e, "Failed to reap relay session");
            }
        }

        if let Some((_, entry)) = self.sessions.remove(&id) {
            self.closed.fetch_add(1, Ordering::Relaxed);
            let bytes_sent = entry.bytes_sent.load(Ordering::Relaxed);
            tracing::info!(
                relay_id = %id,
                profile = %entry.profile,
                bytes_sent,
                active = self.sessions.len(),
                "Relay closed"
            );
            self.events.publish(RelayEvent::RelayClosed {
                relay_id: id,
                profile: entry.profile,
                bytes_sent,
            });
        }
    }

    /// Number of relays whose session has not been reaped yet.
    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn opened_count(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    pub fn closed_count(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn relays(&self) -> Vec<RelayInfo> {
        self.sessions
            .iter()
            .map(|e| RelayInfo {
                id: *e.key(),
                profile: e.profile,
                peer: e.peer,
                pid: e.pid,
                started_at: e.started_at,
                bytes_sent: e.bytes_sent.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// End every relay stream, then kill and reap every relay session.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let ids: Vec<RelayId> = self.sessions.iter().map(|e| *e.key()).collect();
        if !ids.is_empty() {
            tracing::info!(count = ids.len(), "Closing relays");
        }
        futures::future::join_all(ids.into_iter().map(|id| self.close(id))).await;
    }
}

/// Tears the relay down when the response body is dropped.
struct RelayGuard {
    id: RelayId,
    manager: Arc<RelayManager>,
    session: Arc<Mutex<CaptureSession>>,
}

impl RelayGuard {
    async fn close(&self) {
        self.manager.close(self.id).await;
    }

    async fn stderr_tail(&self) -> Vec<String> {
        // Give the drain task a moment to pick up the final lines.
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.session.lock().await.stderr_tail()
    }
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        // Kill right away; reaping needs an await, so it runs in a task.
        if let Ok(mut session) = self.session.try_lock() {
            let _ = session.kill();
        }
        let manager = Arc::clone(&self.manager);
        let id = self.id;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { manager.close(id).await });
        }
    }
}

/// The output of one open relay, ready to become an HTTP body.
pub struct RelayStream {
    id: RelayId,
    profile: RelayProfile,
    first: Option<Bytes>,
    reader: ReaderStream<tokio::process::ChildStdout>,
    cancel: CancellationToken,
    bytes_sent: Arc<AtomicU64>,
    guard: RelayGuard,
}

impl RelayStream {
    pub fn id(&self) -> RelayId {
        self.id
    }

    pub fn profile(&self) -> RelayProfile {
        self.profile
    }

    /// Stream the process output as produced. The relay is torn down when
    /// the returned stream is dropped.
    pub fn into_stream(self) -> impl Stream<Item = std::io::Result<Bytes>> + Send {
        let RelayStream {
            id,
            first,
            mut reader,
            cancel,
            bytes_sent,
            guard,
            ..
        } = self;

        async_stream::stream! {
            let _guard = guard;

            if let Some(first) = first {
                yield Ok(first);
            }

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    chunk = reader.next() => match chunk {
                        Some(Ok(chunk)) => {
                            bytes_sent.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                            yield Ok(chunk);
                        }
                        Some(Err(e)) => {
                            tracing::debug!(relay_id = %id, error = %e, "Relay output read failed");
                            break;
                        }
                        None => {
                            tracing::debug!(relay_id = %id, "Relay output ended");
                            break;
                        }
                    },
                }
            }
        }
    }
}
