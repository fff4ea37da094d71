//! Core enums shared by the relay engine, configuration, and HTTP API.
//!
//! All enums serialize in lowercase so they can be used directly in TOML
//! configuration and JSON responses.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transport used to pull the upstream RTSP feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Interleaved RTP over the RTSP TCP connection.
    #[default]
    Tcp,
    /// RTP over UDP. Lossy, and needs a larger startup probe.
    Udp,
}

impl Transport {
    /// Whether packets may be lost in transit.
    pub fn is_reliable(self) -> bool {
        matches!(self, Self::Tcp)
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Transport {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(crate::Error::invalid_input(format!(
                "unknown transport '{other}' (expected tcp or udp)"
            ))),
        }
    }
}

/// Liveness of the shared source's current capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessState {
    /// First capture session spawned, waiting for its first frame.
    Starting,
    /// Frames are arriving within the stale threshold.
    Live,
    /// No frame within the stale threshold; a restart follows immediately.
    Stale,
    /// Previous session killed, replacement spawned and waiting for a frame.
    Restarting,
    /// Restart retry budget exhausted; retrying with backoff.
    Failed,
}

impl LivenessState {
    /// Whether moving from `self` to `next` is a legal state machine edge.
    ///
    /// `Starting` and `Restarting` may fall back to `Restarting` or `Failed`
    /// when an attempt produces no frame. `Live` may go straight to
    /// `Restarting` when a restart is requested explicitly (settings change).
    pub fn can_transition_to(self, next: LivenessState) -> bool {
        use LivenessState::*;
        matches!(
            (self, next),
            (Starting, Live)
                | (Starting, Restarting)
                | (Starting, Failed)
                | (Live, Stale)
                | (Live, Restarting)
                | (Stale, Restarting)
                | (Restarting, Live)
                | (Restarting, Failed)
                | (Failed, Restarting)
        )
    }

    /// Whether clients can be served (or wait for the next frame).
    pub fn is_serving(self) -> bool {
        !matches!(self, Self::Failed)
    }
}

impl fmt::Display for LivenessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Live => write!(f, "live"),
            Self::Stale => write!(f, "stale"),
            Self::Restarting => write!(f, "restarting"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Output container produced by a per-client relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayProfile {
    /// Fragmented MP4: passthrough video, AAC audio. Playable by MSE.
    Fmp4,
    /// MPEG-TS: passthrough video, AAC audio. For VLC/ffplay.
    MpegTs,
    /// MP3 audio only.
    Audio,
}

impl RelayProfile {
    /// HTTP `Content-Type` for the relay body.
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Fmp4 => "video/mp4",
            Self::MpegTs => "video/mp2t",
            Self::Audio => "audio/mpeg",
        }
    }
}

impl fmt::Display for RelayProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fmp4 => write!(f, "fmp4"),
            Self::MpegTs => write!(f, "mpegts"),
            Self::Audio => write!(f, "audio"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_parse_and_display() {
        assert_eq!("tcp".parse::<Transport>().unwrap(), Transport::Tcp);
        assert_eq!("UDP".parse::<Transport>().unwrap(), Transport::Udp);
        assert!("http".parse::<Transport>().is_err());
        assert_eq!(Transport::Udp.to_string(), "udp");
        assert!(Transport::Tcp.is_reliable());
        assert!(!Transport::Udp.is_reliable());
    }

    #[test]
    fn test_liveness_happy_path_edges() {
        use LivenessState::*;
        assert!(Starting.can_transition_to(Live));
        assert!(Live.can_transition_to(Stale));
        assert!(Stale.can_transition_to(Restarting));
        assert!(Restarting.can_transition_to(Live));
        assert!(Restarting.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Restarting));
    }

    #[test]
    fn test_liveness_rejects_skipping_restart() {
        use LivenessState::*;
        assert!(!Stale.can_transition_to(Live));
        assert!(!Failed.can_transition_to(Live));
        assert!(!Live.can_transition_to(Starting));
        assert!(!Live.can_transition_to(Live));
    }

    #[test]
    fn test_liveness_serializes_lowercase() {
        let json = serde_json::to_string(&LivenessState::Restarting).unwrap();
        assert_eq!(json, "\"restarting\"");
        assert!(!LivenessState::Failed.is_serving());
    }

    #[test]
    fn test_relay_profile_content_types() {
        assert_eq!(RelayProfile::Fmp4.content_type(), "video/mp4");
        assert_eq!(RelayProfile::MpegTs.content_type(), "video/mp2t");
        assert_eq!(RelayProfile::Audio.content_type(), "audio/mpeg");
        assert_eq!(RelayProfile::MpegTs.to_string(), "mpegts");
    }
}
