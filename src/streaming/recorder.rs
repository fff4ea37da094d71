//! Recording to local MP4 files.
//!
//! At most one recording runs at a time. It is an independent upstream
//! session, separate from the shared source and the relays.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Local;
use nerdcam_common::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;

use super::capture::CaptureSession;
use super::commands::{CaptureCommands, SharedSettings};
use crate::config::RecordingConfig;
use crate::events::{EventBus, RelayEvent};

/// Reported by `GET /api/record`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordingStatus {
    pub recording: bool,
    pub filename: String,
    /// Seconds since the recording started.
    pub elapsed: u64,
}

impl RecordingStatus {
    fn idle() -> Self {
        Self {
            recording: false,
            filename: String::new(),
            elapsed: 0,
        }
    }
}

struct ActiveRecording {
    session: CaptureSession,
    filename: String,
    path: PathBuf,
    started_at: Instant,
}

impl ActiveRecording {
    fn status(&self) -> RecordingStatus {
        RecordingStatus {
            recording: true,
            filename: self.filename.clone(),
            elapsed: self.started_at.elapsed().as_secs(),
        }
    }
}

/// What the recorder is doing. The lock around it is never held across
/// process I/O, so status reads stay immediate.
enum Slot {
    Idle,
    /// A start is waiting out the startup grace period.
    Starting,
    Recording(ActiveRecording),
    /// The process is finalizing the file.
    Stopping {
        filename: String,
        started_at: Instant,
    },
}

pub struct Recorder {
    commands: Arc<dyn CaptureCommands>,
    settings: SharedSettings,
    config: RecordingConfig,
    events: Arc<EventBus>,
    slot: Mutex<Slot>,
    /// Woken whenever the slot leaves `Starting` or `Stopping`.
    settled: Notify,
    closed: AtomicBool,
}

impl Recorder {
    pub fn new(
        commands: Arc<dyn CaptureCommands>,
        settings: SharedSettings,
        config: RecordingConfig,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            commands,
            settings,
            config,
            events,
            slot: Mutex::new(Slot::Idle),
            settled: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Start recording into a new timestamped file.
    ///
    /// # Errors
    ///
    /// - [`Error::Conflict`] if a recording is already running.
    /// - [`Error::UpstreamUnavailable`] if the recorder cannot be started,
    ///   exits within the startup grace period, or the server is stopping.
    pub async fn start(&self) -> Result<RecordingStatus> {
        self.reap_finished().await;
        {
            let mut slot = self.slot.lock();
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::unavailable("server is shutting down"));
            }
            if !matches!(*slot, Slot::Idle) {
                return Err(Error::conflict("already recording"));
            }
            *slot = Slot::Starting;
        }
        let reset = ResetOnDrop::new(self);

        let recording = self.launch().await?;

        // Shutdown may have begun during the grace period and found nothing
        // to stop yet.
        let outcome = {
            let mut slot = self.slot.lock();
            if self.closed.load(Ordering::Acquire) {
                *slot = Slot::Stopping {
                    filename: recording.filename.clone(),
                    started_at: recording.started_at,
                };
                Err(recording)
            } else {
                let status = recording.status();
                *slot = Slot::Recording(recording);
                Ok(status)
            }
        };
        reset.disarm();
        self.settled.notify_waiters();

        match outcome {
            Ok(status) => Ok(status),
            Err(recording) => {
                self.finish(recording).await;
                Err(Error::unavailable("server is shutting down"))
            }
        }
    }

    async fn launch(&self) -> Result<ActiveRecording> {
        tokio::fs::create_dir_all(&self.config.output_dir).await?;
        let filename = format!("nerdcam_{}.mp4", Local::now().format("%Y%m%d_%H%M%S"));
        let path = self.config.output_dir.join(&filename);

        let settings = *self.settings.read();
        let spec = self.commands.recording(&settings, &path);
        let mut session =
            CaptureSession::start(&spec, settings.transport, self.commands.upstream_uri())
                .map_err(|e| Error::unavailable(format!("recorder failed to start: {e}")))?;

        // The recorder writes to a file; keep its stdout drained regardless.
        if let Some(mut stdout) = session.take_output() {
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut stdout, &mut tokio::io::sink()).await;
            });
        }

        if let Ok(status) = session.wait(self.config.startup_grace()).await {
            // Let the stderr drain catch up with the exit.
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            let tail = session.stderr_tail();
            tracing::error!(%status, stderr = ?tail, "Recorder exited immediately");
            let reason = tail.last().cloned().unwrap_or_else(|| status.to_string());
            return Err(Error::unavailable(format!("recorder exited immediately: {reason}")));
        }

        tracing::info!(
            filename = %filename,
            pid = ?session.pid(),
            uri = %session.uri(),
            "Recording started"
        );
        self.events.publish(RelayEvent::RecordingStarted {
            filename: filename.clone(),
        });

        Ok(ActiveRecording {
            session,
            filename,
            path,
            started_at: Instant::now(),
        })
    }

    /// Ask the recorder to finalize the file, killing it if it does not
    /// finish within the stop timeout.
    ///
    /// # Errors
    ///
    /// [`Error::Conflict`] if nothing is recording.
    pub async fn stop(&self) -> Result<RecordingStatus> {
        self.reap_finished().await;
        let recording = self
            .begin_stop()
            .ok_or_else(|| Error::conflict("not recording"))?;
        Ok(self.finish(recording).await)
    }

    pub async fn status(&self) -> RecordingStatus {
        self.reap_finished().await;
        match &*self.slot.lock() {
            Slot::Recording(recording) => recording.status(),
            Slot::Stopping {
                filename,
                started_at,
            } => RecordingStatus {
                recording: true,
                filename: filename.clone(),
                elapsed: started_at.elapsed().as_secs(),
            },
            Slot::Idle | Slot::Starting => RecordingStatus::idle(),
        }
    }

    /// Stop any active recording cleanly, waiting out a start or stop that
    /// is already in progress. Later starts are refused.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        loop {
            let settled = self.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            if let Some(recording) = self.begin_stop() {
                self.finish(recording).await;
                continue;
            }
            if matches!(*self.slot.lock(), Slot::Idle) {
                return;
            }
            settled.await;
        }
    }

    /// Move an active recording to `Stopping` and hand it to the caller.
    fn begin_stop(&self) -> Option<ActiveRecording> {
        let mut slot = self.slot.lock();
        if !matches!(*slot, Slot::Recording(_)) {
            return None;
        }
        let Slot::Recording(recording) = std::mem::replace(&mut *slot, Slot::Idle) else {
            return None;
        };
        *slot = Slot::Stopping {
            filename: recording.filename.clone(),
            started_at: recording.started_at,
        };
        Some(recording)
    }

    async fn finish(&self, mut recording: ActiveRecording) -> RecordingStatus {
        let _reset = ResetOnDrop::new(self);
        let elapsed = recording.started_at.elapsed().as_secs();

        if let Some(mut stdin) = recording.session.take_input() {
            if let Err(e) = stdin.write_all(b"q").await {
                tracing::debug!(error = %e, "Could not ask recorder to finish");
            }
            let _ = stdin.flush().await;
        }

        match recording.session.wait(self.config.stop_timeout()).await {
            Ok(status) => tracing::debug!(%status, "Recorder finished"),
            Err(e) => {
                tracing::info!(error = %e, "Recorder did not finish in time, killing");
                if let Err(e) = recording
                    .session
                    .terminate(self.config.stop_timeout())
                    .await
                {
                    tracing::error!(error = %e, "Failed to reap recorder");
                }
            }
        }

        tracing::info!(
            filename = %recording.filename,
            path = ?recording.path,
            elapsed_secs = elapsed,
            "Recording stopped"
        );
        self.events.publish(RelayEvent::RecordingStopped {
            filename: recording.filename.clone(),
            elapsed_secs: elapsed,
        });

        RecordingStatus {
            recording: false,
            filename: recording.filename,
            elapsed,
        }
    }

    /// Drop a recording whose process already exited (reached `max_seconds`
    /// or crashed).
    async fn reap_finished(&self) {
        let finished = {
            let mut slot = self.slot.lock();
            let exited = match *slot {
                Slot::Recording(ref mut r) => r.session.has_exited(),
                _ => false,
            };
            if !exited {
                return;
            }
            match std::mem::replace(&mut *slot, Slot::Idle) {
                Slot::Recording(recording) => Some(recording),
                _ => None,
            }
        };
        let Some(mut recording) = finished else {
            return;
        };
        self.settled.notify_waiters();

        let _ = recording.session.terminate(self.config.stop_timeout()).await;
        tracing::info!(filename = %recording.filename, "Recording ended on its own");
        self.events.publish(RelayEvent::RecordingStopped {
            filename: recording.filename,
            elapsed_secs: recording.started_at.elapsed().as_secs(),
        });
    }
}

/// Returns the slot to `Idle` when dropped, including when the owning future
/// is cancelled partway through (a dropped request). The process itself is
/// killed on drop.
struct ResetOnDrop<'a> {
    recorder: &'a Recorder,
    armed: bool,
}

impl<'a> ResetOnDrop<'a> {
    fn new(recorder: &'a Recorder) -> Self {
        Self {
            recorder,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.recorder.slot.lock() = Slot::Idle;
            self.recorder.settled.notify_waiters();
        }
    }
}
