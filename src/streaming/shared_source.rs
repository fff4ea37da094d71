//! The shared source: one long-lived upstream capture feeding the
//! [`FrameBuffer`], supervised for silent stalls.
//!
//! A single supervisor task owns the current [`CaptureSession`]. It spawns a
//! session, waits for its first frame, then watches the age of the latest
//! frame. When the age reaches the stale threshold (or the process exits)
//! the session is killed and reaped *before* a replacement is spawned, so
//! two shared sessions never overlap.
//!
//! The upstream drops sessions on a fixed schedule. That shows up here as a
//! routine STALE → RESTARTING → LIVE cycle and is logged at `info`. Only a
//! run of `retry_budget` consecutive attempts without a first frame moves the
//! source to FAILED, which is logged at `warn` and retried with backoff.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nerdcam_common::{Error, LivenessState, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::process::ChildStdout;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::capture::{redact_uri, CaptureSession};
use super::commands::{CaptureCommands, SharedSettings};
use super::demux::{FrameDemuxer, MAX_FRAME_LEN};
use super::frame_buffer::FrameBuffer;
use super::liveness::{is_stale, Backoff, LivenessTracker, StateTransition};
use crate::config::LivenessConfig;
use crate::events::{EventBus, RelayEvent};

const READ_CHUNK: usize = 64 * 1024;

/// Counters exposed through `/api/status` and used by tests to prove that
/// sessions never overlap.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SourceStats {
    pub sessions_started: u64,
    pub sessions_terminated: u64,
    pub active_sessions: u64,
    pub peak_active_sessions: u64,
}

/// How one capture session ended.
#[derive(Debug)]
enum SessionEnd {
    /// Went live, then stopped producing frames or exited.
    Stale,
    /// Restart asked for from outside (settings change).
    RestartRequested,
    /// Never produced a first frame.
    NoFirstFrame(Error),
    Shutdown,
}

struct Inner {
    commands: Arc<dyn CaptureCommands>,
    settings: SharedSettings,
    liveness: LivenessConfig,
    frames: FrameBuffer,
    events: Arc<EventBus>,
    tracker: Mutex<LivenessTracker>,
    state_tx: watch::Sender<LivenessState>,
    restart: Notify,
    cancel: CancellationToken,
    started: AtomicU64,
    terminated: AtomicU64,
    peak: AtomicU64,
}

/// Handle to the shared source. Cheap to share behind an `Arc`.
pub struct SharedSource {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SharedSource {
    /// Create the source. Nothing is spawned until [`SharedSource::start`].
    ///
    /// `shutdown` is the process-wide stop signal; cancelling it stops the
    /// supervisor as well.
    pub fn new(
        commands: Arc<dyn CaptureCommands>,
        settings: SharedSettings,
        liveness: LivenessConfig,
        frames: FrameBuffer,
        events: Arc<EventBus>,
        shutdown: &CancellationToken,
    ) -> Self {
        let (state_tx, _) = watch::channel(LivenessState::Starting);
        Self {
            inner: Arc::new(Inner {
                commands,
                settings,
                liveness,
                frames,
                events,
                tracker: Mutex::new(LivenessTracker::new()),
                state_tx,
                restart: Notify::new(),
                cancel: shutdown.child_token(),
                started: AtomicU64::new(0),
                terminated: AtomicU64::new(0),
                peak: AtomicU64::new(0),
            }),
            task: Mutex::new(None),
        }
    }

    /// Spawn the supervisor task. Calling it again is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() || self.inner.cancel.is_cancelled() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(async move { inner.supervise().await }));
    }

    pub fn is_started(&self) -> bool {
        self.task.lock().is_some()
    }

    pub fn frames(&self) -> &FrameBuffer {
        &self.inner.frames
    }

    pub fn state(&self) -> LivenessState {
        self.inner.tracker.lock().state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LivenessState> {
        self.inner.state_tx.subscribe()
    }

    /// Timestamped transition log, oldest first.
    pub fn transitions(&self) -> Vec<StateTransition> {
        self.inner.tracker.lock().history()
    }

    pub fn stats(&self) -> SourceStats {
        let started = self.inner.started.load(Ordering::SeqCst);
        let terminated = self.inner.terminated.load(Ordering::SeqCst);
        SourceStats {
            sessions_started: started,
            sessions_terminated: terminated,
            active_sessions: started.saturating_sub(terminated),
            peak_active_sessions: self.inner.peak.load(Ordering::SeqCst),
        }
    }

    /// Err with [`Error::UpstreamUnavailable`] while the source is FAILED.
    pub fn ensure_available(&self) -> Result<()> {
        let state = self.state();
        if state.is_serving() {
            Ok(())
        } else {
            Err(Error::unavailable(format!("shared source is {state}")))
        }
    }

    /// Replace the current session (e.g. after a settings change). The old
    /// session is reaped before the new one starts.
    pub fn request_restart(&self) {
        self.inner.restart.notify_one();
    }

    /// Stop the supervisor and wait until its session is killed and reaped.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Shared source supervisor panicked");
            }
        }
    }
}

impl Inner {
    async fn supervise(self: Arc<Self>) {
        let mut failures: u32 = 0;
        let mut backoff = Backoff::new(self.liveness.backoff_initial(), self.liveness.backoff_max());

        tracing::info!(
            uri = %redact_uri(self.commands.upstream_uri()),
            "Shared source starting"
        );

        loop {
            let (end, live_for) = self.run_session().await;
            // Only a session that stayed live for a whole stale threshold
            // resets the retry budget. One that drops straight back out is
            // paced by the backoff instead.
            let steady = live_for.is_some_and(|d| d >= self.liveness.stale_threshold());
            if steady {
                failures = 0;
                backoff.reset();
            }

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Stale if steady => {
                    tracing::info!("Upstream session ended, restarting");
                    self.set_state(LivenessState::Restarting);
                }
                SessionEnd::Stale => {
                    let delay = backoff.next_delay();
                    tracing::info!(
                        live_for = ?live_for,
                        retry_in = ?delay,
                        "Upstream session ended right after going live, restarting after backoff"
                    );
                    self.set_state(LivenessState::Restarting);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.restart.notified() => {}
                    }
                }
                SessionEnd::RestartRequested => {
                    tracing::info!("Shared source restart requested");
                    self.set_state(LivenessState::Restarting);
                }
                SessionEnd::NoFirstFrame(e) => {
                    failures += 1;
                    if failures < self.liveness.retry_budget {
                        tracing::info!(
                            error = %e,
                            attempt = failures,
                            budget = self.liveness.retry_budget,
                            "Capture attempt produced no frame, retrying"
                        );
                        self.set_state(LivenessState::Restarting);
                        continue;
                    }

                    let delay = backoff.next_delay();
                    self.set_state(LivenessState::Failed);
                    tracing::warn!(
                        error = %e,
                        attempts = failures,
                        retry_in = ?delay,
                        "Shared source failed: retry budget exhausted"
                    );

                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.restart.notified() => {}
                    }
                    self.set_state(LivenessState::Restarting);
                }
            }
        }

        tracing::info!("Shared source stopped");
    }

    /// Spawn one session and run it until it ends. The session is always
    /// killed and reaped before this returns.
    ///
    /// Also returns how long the session stayed live, if it went live.
    async fn run_session(&self) -> (SessionEnd, Option<Duration>) {
        if self.cancel.is_cancelled() {
            return (SessionEnd::Shutdown, None);
        }

        let settings = *self.settings.read();
        let spec = self.commands.shared_source(&settings);
        let mut session =
            match CaptureSession::start(&spec, settings.transport, self.commands.upstream_uri()) {
                Ok(session) => session,
                Err(e) => {
                    let end = if e.is_start_failure() {
                        Error::unavailable(e.to_string())
                    } else {
                        e.into()
                    };
                    // Keep a tight failure loop from spinning.
                    tokio::select! {
                        _ = self.cancel.cancelled() => return (SessionEnd::Shutdown, None),
                        _ = tokio::time::sleep(self.liveness.check_interval()) => {}
                    }
                    return (SessionEnd::NoFirstFrame(end), None);
                }
            };

        let started = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        let active = started - self.terminated.load(Ordering::SeqCst);
        self.peak.fetch_max(active, Ordering::SeqCst);

        tracing::debug!(
            pid = ?session.pid(),
            transport = %session.transport(),
            uri = %session.uri(),
            "Capture session spawned"
        );

        let reader_cancel = self.cancel.child_token();
        let mut reader = session.take_output().map(|stdout| {
            tokio::spawn(read_frames(
                stdout,
                self.frames.clone(),
                reader_cancel.clone(),
            ))
        });

        let (end, live_since) = self.monitor(&mut reader).await;
        let live_for = live_since.map(|since| since.elapsed());

        reader_cancel.cancel();
        if let Err(e) = session.terminate(self.liveness.wait_timeout()).await {
            tracing::error!(pid = ?session.pid(), error = %e, "Failed to reap capture session");
        }
        self.terminated.fetch_add(1, Ordering::SeqCst);

        let frames = match reader.take() {
            Some(task) => task.await.unwrap_or(0),
            None => 0,
        };

        let tail = session.stderr_tail();
        if live_for.is_some() {
            tracing::debug!(
                pid = ?session.pid(),
                frames,
                uptime = ?session.uptime(),
                stderr = ?tail,
                "Capture session reaped"
            );
        } else if !matches!(end, SessionEnd::Shutdown) {
            tracing::info!(
                pid = ?session.pid(),
                stderr = ?tail,
                "Capture session produced no frames"
            );
        }

        (end, live_for)
    }

    /// Drive the liveness state machine for one session. `reader` is set to
    /// `None` once the reader task has been awaited to completion.
    ///
    /// Also returns when the session went live, if it did.
    async fn monitor(&self, reader: &mut Option<JoinHandle<u64>>) -> (SessionEnd, Option<Instant>) {
        let mut cursor = self.frames.subscribe();
        let startup = tokio::time::sleep(self.liveness.startup_timeout());
        tokio::pin!(startup);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return (SessionEnd::Shutdown, None),
                _ = self.restart.notified() => return (SessionEnd::RestartRequested, None),
                frame = cursor.next_frame() => {
                    if frame.is_some() {
                        break;
                    }
                    return (SessionEnd::Shutdown, None);
                }
                _ = join_reader(reader) => {
                    // Frames published just before exit still count.
                    if self.frames.current_seq() > cursor.last_seq() {
                        self.set_state(LivenessState::Live);
                        self.set_state(LivenessState::Stale);
                        return (SessionEnd::Stale, Some(Instant::now()));
                    }
                    return (
                        SessionEnd::NoFirstFrame(Error::unavailable(
                            "capture process exited before its first frame",
                        )),
                        None,
                    );
                }
                _ = &mut startup => {
                    return (
                        SessionEnd::NoFirstFrame(Error::UpstreamStartupTimeout(
                            self.liveness.startup_timeout(),
                        )),
                        None,
                    );
                }
            }
        }

        self.set_state(LivenessState::Live);
        let live_since = Some(Instant::now());
        drop(cursor);

        let threshold = self.liveness.stale_threshold();
        let mut tick = tokio::time::interval(self.liveness.check_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return (SessionEnd::Shutdown, live_since),
                _ = self.restart.notified() => return (SessionEnd::RestartRequested, live_since),
                _ = join_reader(reader) => {
                    tracing::debug!("Capture output closed while live");
                    self.set_state(LivenessState::Stale);
                    return (SessionEnd::Stale, live_since);
                }
                _ = tick.tick() => {
                    let now = Instant::now();
                    let last = self.frames.latest().map(|f| f.arrived_at).unwrap_or(now);
                    if is_stale(last, now, threshold) {
                        let age = now.saturating_duration_since(last);
                        tracing::info!(
                            age = ?age,
                            threshold = ?threshold,
                            "No frame within stale threshold"
                        );
                        self.set_state(LivenessState::Stale);
                        return (SessionEnd::Stale, live_since);
                    }
                }
            }
        }
    }

    fn set_state(&self, to: LivenessState) {
        let transition = {
            let mut tracker = self.tracker.lock();
            match tracker.transition(to) {
                Ok(Some(t)) => t,
                Ok(None) => return,
                Err(e) => {
                    tracing::error!(error = %e, "Liveness state machine violation");
                    return;
                }
            }
        };

        tracing::debug!(from = %transition.from, to = %transition.to, "Shared source state changed");
        self.state_tx.send_replace(to);
        self.events.publish(RelayEvent::SourceStateChanged {
            from: transition.from,
            to: transition.to,
        });
    }
}

/// Resolve when the reader task finishes; pending forever if there is none.
async fn join_reader(reader: &mut Option<JoinHandle<u64>>) {
    match reader.as_mut() {
        Some(task) => {
            let _ = task.await;
            *reader = None;
        }
        None => std::future::pending().await,
    }
}

/// Read the capture process's output, split it into frames and publish
/// each one. Returns the number of frames published.
async fn read_frames(mut stdout: ChildStdout, frames: FrameBuffer, cancel: CancellationToken) -> u64 {
    let mut demux = FrameDemuxer::new(MAX_FRAME_LEN);
    let mut buf = vec![0u8; READ_CHUNK];
    let mut published = 0u64;

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            read = stdout.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(error = %e, "Capture output read failed");
                    break;
                }
            },
        };

        demux.push(&buf[..n]);
        while let Some(item) = demux.next_frame() {
            match item {
                Ok(frame) => {
                    let seq = frames.publish(frame);
                    published += 1;
                    if published == 1 {
                        tracing::debug!(seq, "First frame from capture session");
                    }
                }
                Err(e) if e.is_routine() => tracing::info!(error = %e, "Dropped malformed frame"),
                Err(e) => tracing::error!(error = %e, "Frame demultiplexer failed"),
            }
        }
    }

    if let Some(e) = demux.finish() {
        tracing::debug!(error = %e, "Discarded trailing partial frame");
    }
    published
}
