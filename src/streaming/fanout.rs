//! MJPEG fanout: every attached client gets the latest shared frame.
//!
//! Wire format (consumed byte-for-byte by external parsers, do not change):
//!
//! ```text
//! --ffmpeg\r\n
//! Content-Type: image/jpeg\r\n
//! Content-Length: <n>\r\n
//! \r\n
//! <n bytes of JPEG>\r\n
//! ```
//!
//! Each client holds a [`FrameCursor`], never a queue. A client whose socket
//! is slow simply picks up whatever frame is newest when it is ready again.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::Stream;
use nerdcam_common::ClientId;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::frame_buffer::{FrameBuffer, FrameCursor};
use crate::events::{EventBus, RelayEvent};

/// Multipart boundary token.
pub const BOUNDARY: &str = "ffmpeg";

/// `Content-Type` of the fanout response.
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=ffmpeg";

/// Encode one frame as a multipart part.
pub fn encode_part(frame: &[u8]) -> Bytes {
    let header = format!(
        "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        frame.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + frame.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(frame);
    part.put_slice(b"\r\n");
    part.freeze()
}

#[derive(Debug)]
struct ClientEntry {
    peer: Option<SocketAddr>,
    attached_at: DateTime<Utc>,
    frames_sent: Arc<AtomicU64>,
}

/// Snapshot of one attached client.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub id: ClientId,
    pub peer: Option<SocketAddr>,
    pub attached_at: DateTime<Utc>,
    pub frames_sent: u64,
}

/// Registry of attached fanout clients.
pub struct FanoutHub {
    frames: FrameBuffer,
    clients: Mutex<HashMap<ClientId, ClientEntry>>,
    events: Arc<EventBus>,
}

impl FanoutHub {
    pub fn new(frames: FrameBuffer, events: Arc<EventBus>) -> Self {
        Self {
            frames,
            clients: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Register a client. Its first part is the next frame published after
    /// this call. `cancel` ends the client's stream (server shutdown).
    pub fn attach(
        self: &Arc<Self>,
        peer: Option<SocketAddr>,
        cancel: CancellationToken,
    ) -> ClientConnection {
        let id = ClientId::new();
        let frames_sent = Arc::new(AtomicU64::new(0));
        let cursor = self.frames.subscribe();

        let count = {
            let mut clients = self.clients.lock();
            clients.insert(
                id,
                ClientEntry {
                    peer,
                    attached_at: Utc::now(),
                    frames_sent: Arc::clone(&frames_sent),
                },
            );
            clients.len()
        };

        tracing::info!(client_id = %id, peer = ?peer, clients = count, "MJPEG client attached");
        self.events.publish(RelayEvent::ClientAttached { client_id: id });

        ClientConnection {
            id,
            hub: Arc::clone(self),
            cursor,
            cancel,
            frames_sent,
        }
    }

    fn detach(&self, id: ClientId) {
        let removed = {
            let mut clients = self.clients.lock();
            clients.remove(&id).map(|entry| (entry, clients.len()))
        };

        if let Some((entry, count)) = removed {
            let frames_sent = entry.frames_sent.load(Ordering::Relaxed);
            tracing::info!(
                client_id = %id,
                peer = ?entry.peer,
                frames_sent,
                clients = count,
                "MJPEG client detached"
            );
            self.events
                .publish(RelayEvent::ClientDetached { client_id: id, frames_sent });
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        self.clients
            .lock()
            .iter()
            .map(|(id, entry)| ClientInfo {
                id: *id,
                peer: entry.peer,
                attached_at: entry.attached_at,
                frames_sent: entry.frames_sent.load(Ordering::Relaxed),
            })
            .collect()
    }
}

/// One attached client. Dropping it detaches the client; the HTTP layer
/// drops the body stream when a write fails or the peer goes away.
pub struct ClientConnection {
    id: ClientId,
    hub: Arc<FanoutHub>,
    cursor: FrameCursor,
    cancel: CancellationToken,
    frames_sent: Arc<AtomicU64>,
}

impl ClientConnection {
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Wait for the next frame and encode it as a multipart part.
    ///
    /// Returns `None` when the connection is cancelled.
    pub async fn next_part(&mut self) -> Option<Bytes> {
        if self.cancel.is_cancelled() {
            return None;
        }

        let frame = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            frame = self.cursor.next_frame() => frame?,
        };

        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        Some(encode_part(&frame.data))
    }

    /// Turn the connection into an HTTP body stream.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
        futures::stream::unfold(self, |mut conn| async move {
            conn.next_part().await.map(|part| (Ok(part), conn))
        })
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.hub.detach(self.id);
    }
}
