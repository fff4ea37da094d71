//! # nerdcam-av
//!
//! Subprocess lifecycle management and ffmpeg command building.
//!
//! This crate provides functionality for:
//! - Starting external media commands with piped output and diagnostic streams
//!   ([`ProcessHandle`]), with idempotent kill and bounded wait
//! - Building the ffmpeg argument lists for the shared MJPEG capture, the
//!   per-client relays, and recordings ([`ffmpeg`])
//! - Detecting external tools and the encoders ffmpeg advertises ([`tools`])
//!
//! ## Example
//!
//! ```no_run
//! use nerdcam_av::{ProcessHandle, ProcessSpec};
//! use std::time::Duration;
//!
//! # async fn example() -> nerdcam_av::Result<()> {
//! let mut spec = ProcessSpec::new("ffmpeg");
//! spec.arg("-version");
//! let mut handle = ProcessHandle::start(&spec)?;
//! let status = handle.terminate(Duration::from_secs(5)).await?;
//! println!("exited: {status}");
//! # Ok(())
//! # }
//! ```

mod error;
pub mod ffmpeg;
pub mod process;
pub mod tools;

// Re-exports
pub use error::{Error, Result};
pub use ffmpeg::{FragmentOptions, InputOptions, ProbeBudget, RecordCodec};
pub use process::{ProcessHandle, ProcessSpec, StderrTail};
pub use tools::{check_tool, check_tools, get_tool_path, require_tool, ToolInfo};
