//! Stream relay engine.
//!
//! - [`SharedSource`]: one supervised upstream capture publishing MJPEG
//!   frames into a [`FrameBuffer`]
//! - [`FanoutHub`]: serves the latest frame to every attached MJPEG client
//! - [`RelayManager`]: one dedicated capture session per A/V relay client
//! - [`Recorder`]: optional recording to local files
//!
//! Every capture process is built by a [`CaptureCommands`] implementation
//! and owned by exactly one of the components above.

mod capture;
mod commands;
mod demux;
mod fanout;
mod frame_buffer;
mod liveness;
mod recorder;
mod relay;
mod shared_source;

pub use capture::{redact_uri, CaptureSession};
pub use commands::{CaptureCommands, FfmpegCommands, SharedSettings, StreamSettings};
pub use demux::{FrameDemuxer, MAX_FRAME_LEN};
pub use fanout::{encode_part, ClientConnection, ClientInfo, FanoutHub, BOUNDARY, CONTENT_TYPE};
pub use frame_buffer::{Frame, FrameBuffer, FrameCursor};
pub use liveness::{is_stale, Backoff, LivenessTracker, StateTransition};
pub use recorder::{Recorder, RecordingStatus};
pub use relay::{RelayInfo, RelayManager, RelayStream};
pub use shared_source::{SharedSource, SourceStats};
