//! ffmpeg argument builders for every pipeline nerdcam runs.
//!
//! All builders return plain argument lists; the caller decides which
//! program to run them with.

use std::path::Path;

use nerdcam_common::{RelayProfile, Transport};
use serde::{Deserialize, Serialize};

/// How much of the input ffmpeg may read before deciding on the streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeBudget {
    /// `-probesize` in bytes.
    pub probesize: u64,
    /// `-analyzeduration` in microseconds.
    pub analyzeduration_us: u64,
}

impl ProbeBudget {
    /// Default budget for the given transport. UDP gets the larger one: with
    /// packet loss, ffmpeg needs more input to find both audio and video.
    pub fn default_for(transport: Transport) -> Self {
        match transport {
            Transport::Tcp => Self {
                probesize: 500_000,
                analyzeduration_us: 500_000,
            },
            Transport::Udp => Self {
                probesize: 5_000_000,
                analyzeduration_us: 2_000_000,
            },
        }
    }
}

/// Upstream input options shared by all capture commands.
#[derive(Debug, Clone, Copy)]
pub struct InputOptions<'a> {
    /// Fully formed upstream URI, credentials included.
    pub uri: &'a str,
    pub transport: Transport,
    pub probe: ProbeBudget,
}

impl InputOptions<'_> {
    /// Low-latency input flags followed by `-i <uri>`.
    fn low_latency_args(&self, extra_fflags: &str) -> Vec<String> {
        vec![
            "-fflags".into(),
            format!("+nobuffer+flush_packets{extra_fflags}"),
            "-flags".into(),
            "low_delay".into(),
            "-probesize".into(),
            self.probe.probesize.to_string(),
            "-analyzeduration".into(),
            self.probe.analyzeduration_us.to_string(),
            "-rtsp_transport".into(),
            self.transport.to_string(),
            "-i".into(),
            self.uri.to_string(),
        ]
    }
}

/// Fragment sizing for the fragmented MP4 relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentOptions {
    pub fragment_duration_us: u64,
    pub min_fragment_duration_us: u64,
}

impl Default for FragmentOptions {
    fn default() -> Self {
        Self {
            fragment_duration_us: 500_000,
            min_fragment_duration_us: 250_000,
        }
    }
}

/// Map stream quality 1 (worst) ..= 10 (best) onto the MJPEG `-q:v` scale,
/// where 2 is best and 31 is worst.
pub fn mjpeg_qscale(quality: u8) -> u32 {
    let quality = u32::from(quality.clamp(1, 10));
    2 + (10 - quality) * 29 / 9
}

/// Audio gain filter, e.g. `volume=3.0`.
pub fn volume_filter(gain: f32) -> String {
    format!("volume={gain:.1}")
}

/// Arguments for the shared source: upstream video decoded to a continuous
/// MJPEG stream on stdout, audio dropped.
pub fn shared_mjpeg_args(input: &InputOptions<'_>, quality: u8, frame_rate: u32) -> Vec<String> {
    let mut args = input.low_latency_args("");
    args.extend([
        "-f".to_string(),
        "mjpeg".into(),
        "-q:v".into(),
        mjpeg_qscale(quality).to_string(),
        "-r".into(),
        frame_rate.to_string(),
        "-an".into(),
        "-threads".into(),
        "1".into(),
        "-flush_packets".into(),
        "1".into(),
        "pipe:1".into(),
    ]);
    args
}

/// Arguments for a per-client relay. Video is always passed through; only
/// audio is transcoded.
pub fn relay_args(
    input: &InputOptions<'_>,
    profile: RelayProfile,
    mic_gain: f32,
    audio_bitrate: &str,
    fragments: FragmentOptions,
) -> Vec<String> {
    let mut args = match profile {
        RelayProfile::Fmp4 => input.low_latency_args("+genpts"),
        _ => input.low_latency_args(""),
    };

    let tail: Vec<String> = match profile {
        RelayProfile::Fmp4 => vec![
            "-c:v".into(),
            "copy".into(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            audio_bitrate.into(),
            "-af".into(),
            volume_filter(mic_gain),
            "-f".into(),
            "mp4".into(),
            "-movflags".into(),
            "frag_keyframe+empty_moov+default_base_moof".into(),
            "-frag_duration".into(),
            fragments.fragment_duration_us.to_string(),
            "-min_frag_duration".into(),
            fragments.min_fragment_duration_us.to_string(),
        ],
        RelayProfile::MpegTs => vec![
            "-c:v".into(),
            "copy".into(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            audio_bitrate.into(),
            "-f".into(),
            "mpegts".into(),
            "-muxdelay".into(),
            "0".into(),
            "-muxpreload".into(),
            "0".into(),
        ],
        RelayProfile::Audio => vec![
            "-vn".into(),
            "-af".into(),
            volume_filter(mic_gain),
            "-c:a".into(),
            "libmp3lame".into(),
            "-b:a".into(),
            audio_bitrate.into(),
            "-f".into(),
            "mp3".into(),
        ],
    };

    args.extend(tail);
    args.extend(["-flush_packets", "1", "pipe:1"].map(String::from));
    args
}

/// Video codec used for recordings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordCodec {
    /// Stream copy, no re-encode. Compression is ignored.
    #[default]
    Original,
    SwH264,
    SwH265,
    NvencH264,
    NvencH265,
    NvencAv1,
}

impl RecordCodec {
    /// All codecs, most preferred first.
    pub const PREFERENCE: [RecordCodec; 6] = [
        RecordCodec::NvencH265,
        RecordCodec::NvencH264,
        RecordCodec::NvencAv1,
        RecordCodec::SwH265,
        RecordCodec::SwH264,
        RecordCodec::Original,
    ];

    /// ffmpeg encoder name, or `None` for stream copy.
    pub fn encoder(self) -> Option<&'static str> {
        match self {
            Self::Original => None,
            Self::SwH264 => Some("libx264"),
            Self::SwH265 => Some("libx265"),
            Self::NvencH264 => Some("h264_nvenc"),
            Self::NvencH265 => Some("hevc_nvenc"),
            Self::NvencAv1 => Some("av1_nvenc"),
        }
    }

    /// CRF/CQ range that compression 1..=10 is mapped onto.
    pub fn quality_range(self) -> (u32, u32) {
        match self {
            Self::Original => (0, 0),
            Self::SwH264 | Self::NvencH264 => (16, 38),
            Self::SwH265 => (18, 40),
            Self::NvencH265 => (18, 42),
            Self::NvencAv1 => (22, 48),
        }
    }

    fn is_nvenc(self) -> bool {
        matches!(self, Self::NvencH264 | Self::NvencH265 | Self::NvencAv1)
    }

    /// Whether ffmpeg can use this codec given its advertised encoders.
    pub fn is_supported_by<'a>(self, encoders: impl IntoIterator<Item = &'a str>) -> bool {
        match self.encoder() {
            None => true,
            Some(name) => encoders.into_iter().any(|e| e == name),
        }
    }
}

impl std::fmt::Display for RecordCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Original => "original",
            Self::SwH264 => "sw_h264",
            Self::SwH265 => "sw_h265",
            Self::NvencH264 => "nvenc_h264",
            Self::NvencH265 => "nvenc_h265",
            Self::NvencAv1 => "nvenc_av1",
        };
        write!(f, "{name}")
    }
}

/// Video arguments for a recording at compression 1 (largest) ..= 10 (smallest).
pub fn record_video_args(codec: RecordCodec, compression: u8) -> Vec<String> {
    let Some(encoder) = codec.encoder() else {
        return vec!["-c:v".into(), "copy".into()];
    };

    let (lo, hi) = codec.quality_range();
    let compression = u32::from(compression.clamp(1, 10));
    let q = lo + (compression - 1) * (hi - lo) / 9;

    if codec.is_nvenc() {
        vec![
            "-c:v".into(),
            encoder.into(),
            "-cq".into(),
            q.to_string(),
            "-preset".into(),
            "p4".into(),
        ]
    } else {
        vec![
            "-c:v".into(),
            encoder.into(),
            "-crf".into(),
            q.to_string(),
            "-preset".into(),
            "fast".into(),
        ]
    }
}

/// Arguments for a bounded-length recording into `output`.
pub fn record_args(
    uri: &str,
    transport: Transport,
    codec: RecordCodec,
    compression: u8,
    max_seconds: u64,
    output: &Path,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-rtsp_transport".into(),
        transport.to_string(),
        "-i".into(),
        uri.into(),
    ];
    args.extend(record_video_args(codec, compression));
    args.extend([
        "-c:a".to_string(),
        "aac".into(),
        "-b:a".into(),
        "128k".into(),
        "-t".into(),
        max_seconds.to_string(),
        output.to_string_lossy().to_string(),
    ]);
    args
}
