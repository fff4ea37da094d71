//! Process lifecycle management for external media commands.
//!
//! Every [`ProcessHandle::start`] must be paired with a
//! [`ProcessHandle::terminate`] (kill + wait) on every exit path. `kill` is
//! idempotent, so owners may call `terminate` from both a teardown path and a
//! shutdown path without coordinating. Handles are also `kill_on_drop` as a
//! last resort, but owners must not rely on that.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use crate::{Error, Result};

/// What to run: program, arguments, and whether stdin is needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    program: PathBuf,
    args: Vec<String>,
    stdin: bool,
}

impl ProcessSpec {
    /// Create a new spec for the given program path.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: false,
        }
    }

    /// Append a single argument.
    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    /// Append multiple arguments.
    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    /// Keep a pipe to the process's stdin (used to ask ffmpeg to finish).
    pub fn piped_stdin(&mut self) -> &mut Self {
        self.stdin = true;
        self
    }

    /// The program path.
    pub fn program(&self) -> &std::path::Path {
        &self.program
    }

    /// The argument list.
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Short name used in logs and errors.
    pub fn name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }
}

/// A running external process with piped output and diagnostic streams.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    name: String,
    pid: Option<u32>,
}

impl ProcessHandle {
    /// Spawn the process described by `spec`.
    ///
    /// stdout and stderr are always piped; stdin is piped only when the spec
    /// asks for it and is otherwise connected to `/dev/null`.
    ///
    /// # Errors
    ///
    /// - [`Error::ToolNotFound`] if the executable does not exist.
    /// - [`Error::PermissionDenied`] if it cannot be executed.
    /// - [`Error::SpawnFailed`] for any other spawn failure.
    pub fn start(spec: &ProcessSpec) -> Result<Self> {
        let name = spec.name();

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(if spec.stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| Error::from_spawn(name.clone(), e))?;
        let pid = child.id();

        tracing::debug!(tool = %name, pid = ?pid, "Process started");

        Ok(Self { child, name, pid })
    }

    /// OS process id, captured at spawn time.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Short program name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the output stream. Returns `None` after the first call.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Take the diagnostic stream. Returns `None` after the first call.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Take the input pipe, if the spec requested one.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    /// Exit status if the process has already exited, without blocking.
    pub fn try_status(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    /// Send SIGKILL. Safe to call on a process that already exited or was
    /// already reaped.
    pub fn kill(&mut self) -> Result<()> {
        if let Ok(Some(_)) = self.child.try_wait() {
            return Ok(());
        }
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            // tokio reports an already-reaped child as InvalidInput.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Wait for the process to exit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WaitTimeout`] if it is still running after `timeout`.
    pub async fn wait(&mut self, timeout: Duration) -> Result<ExitStatus> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => Ok(status?),
            Err(_elapsed) => Err(Error::WaitTimeout {
                tool: self.name.clone(),
                timeout,
            }),
        }
    }

    /// Kill and reap the process.
    pub async fn terminate(&mut self, timeout: Duration) -> Result<ExitStatus> {
        self.kill()?;
        let status = self.wait(timeout).await?;
        tracing::debug!(tool = %self.name, pid = ?self.pid, %status, "Process reaped");
        Ok(status)
    }
}

/// The last lines a process wrote to its diagnostic stream.
///
/// The stream is drained continuously so a chatty process never blocks on a
/// full stderr pipe.
#[derive(Debug, Clone)]
pub struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl StderrTail {
    /// Start draining `stderr` in a background task, keeping `capacity` lines.
    pub fn spawn(stderr: ChildStderr, capacity: usize) -> Self {
        let tail = Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        };

        let sink = tail.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                        if !line.is_empty() {
                            sink.push(line);
                        }
                    }
                }
            }
        });

        tail
    }

    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Snapshot of the retained lines, oldest first.
    pub fn lines(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().cloned().collect()
    }
}
