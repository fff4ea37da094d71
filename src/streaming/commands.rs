//! What gets run for each capture pipeline.
//!
//! The relay engine never builds command lines itself; it asks a
//! [`CaptureCommands`] implementation for a [`ProcessSpec`]. Production uses
//! [`FfmpegCommands`]; tests substitute scripted commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use nerdcam_av::ffmpeg::{record_args, relay_args, shared_mjpeg_args};
use nerdcam_av::{FragmentOptions, InputOptions, ProcessSpec, RecordCodec};
use nerdcam_common::{RelayProfile, Transport};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::{Config, ProbeConfig};

/// Stream settings that can change at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamSettings {
    #[serde(rename = "rtsp_transport")]
    pub transport: Transport,
    pub quality: u8,
    pub mic_gain: f32,
}

impl StreamSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            transport: config.upstream.transport,
            quality: config.stream.quality,
            mic_gain: config.stream.mic_gain,
        }
    }
}

/// Settings shared between the HTTP layer and every pipeline.
pub type SharedSettings = Arc<RwLock<StreamSettings>>;

/// Builds the process spec for each kind of capture session.
pub trait CaptureCommands: Send + Sync {
    /// Upstream URI, used for logging (always redacted before use).
    fn upstream_uri(&self) -> &str;

    /// Continuous MJPEG on stdout for the shared source.
    fn shared_source(&self, settings: &StreamSettings) -> ProcessSpec;

    /// Container stream on stdout for one per-client relay.
    fn relay(&self, profile: RelayProfile, settings: &StreamSettings) -> ProcessSpec;

    /// Recording into `output`. Must accept `q` on stdin as a request to
    /// finish the file.
    fn recording(&self, settings: &StreamSettings, output: &Path) -> ProcessSpec;
}

/// ffmpeg-backed capture commands.
#[derive(Debug, Clone)]
pub struct FfmpegCommands {
    ffmpeg: PathBuf,
    uri: String,
    frame_rate: u32,
    audio_bitrate: String,
    probe: ProbeConfig,
    fragments: FragmentOptions,
    codec: RecordCodec,
    compression: u8,
    max_seconds: u64,
}

impl FfmpegCommands {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ffmpeg: config
                .tools
                .ffmpeg
                .clone()
                .unwrap_or_else(|| PathBuf::from("ffmpeg")),
            uri: config.upstream.uri.clone(),
            frame_rate: config.stream.frame_rate,
            audio_bitrate: config.stream.audio_bitrate.clone(),
            probe: config.probe.clone(),
            fragments: config.relay.fragments(),
            codec: config.recording.codec,
            compression: config.recording.compression,
            max_seconds: config.recording.max_seconds,
        }
    }

    fn input(&self, transport: Transport) -> InputOptions<'_> {
        InputOptions {
            uri: &self.uri,
            transport,
            probe: self.probe.budget(transport),
        }
    }
}

impl CaptureCommands for FfmpegCommands {
    fn upstream_uri(&self) -> &str {
        &self.uri
    }

    fn shared_source(&self, settings: &StreamSettings) -> ProcessSpec {
        let mut spec = ProcessSpec::new(&self.ffmpeg);
        spec.args(shared_mjpeg_args(
            &self.input(settings.transport),
            settings.quality,
            self.frame_rate,
        ));
        spec
    }

    fn relay(&self, profile: RelayProfile, settings: &StreamSettings) -> ProcessSpec {
        let mut spec = ProcessSpec::new(&self.ffmpeg);
        spec.args(relay_args(
            &self.input(settings.transport),
            profile,
            settings.mic_gain,
            &self.audio_bitrate,
            self.fragments,
        ));
        spec
    }

    fn recording(&self, settings: &StreamSettings, output: &Path) -> ProcessSpec {
        let mut spec = ProcessSpec::new(&self.ffmpeg);
        spec.args(record_args(
            &self.uri,
            settings.transport,
            self.codec,
            self.compression,
            self.max_seconds,
            output,
        ))
        .piped_stdin();
        spec
    }
}
