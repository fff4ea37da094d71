use super::{error::ApiError, AppContext};
use crate::streaming::{ClientInfo, RecordingStatus, RelayInfo, SourceStats, StateTransition, StreamSettings};
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use nerdcam_av::RecordCodec;
use nerdcam_common::{Error, LivenessState, Transport};
use serde::{Deserialize, Serialize};

pub fn api_routes() -> Router<AppContext> {
    Router::new()
        .route("/status", get(get_status))
        .route("/settings", get(get_settings).post(update_settings))
        .route("/record", get(get_recording))
        .route("/record/start", post(start_recording))
        .route("/record/stop", post(stop_recording))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub state: LivenessState,
    pub sequence: u64,
    pub last_frame_age_ms: Option<u64>,
    pub source: SourceStats,
    pub fanout_clients: usize,
    pub clients: Vec<ClientInfo>,
    pub active_relays: usize,
    pub relays_opened: u64,
    pub relays_closed: u64,
    pub relays: Vec<RelayInfo>,
    pub recording: RecordingStatus,
    pub transitions: Vec<StateTransition>,
}

async fn get_status(State(ctx): State<AppContext>) -> Json<StatusResponse> {
    let frames = ctx.source.frames();

    Json(StatusResponse {
        state: ctx.source.state(),
        sequence: frames.current_seq(),
        last_frame_age_ms: frames.last_frame_age().map(|d| d.as_millis() as u64),
        source: ctx.source.stats(),
        fanout_clients: ctx.fanout.client_count(),
        clients: ctx.fanout.clients(),
        active_relays: ctx.relays.active_count(),
        relays_opened: ctx.relays.opened_count(),
        relays_closed: ctx.relays.closed_count(),
        relays: ctx.relays.relays(),
        recording: ctx.recorder.status().await,
        transitions: ctx.source.transitions(),
    })
}

#[derive(Debug, Serialize)]
pub struct SettingsResponse {
    #[serde(flatten)]
    pub stream: StreamSettings,
    pub frame_rate: u32,
    pub rec_codec: RecordCodec,
    pub rec_compression: u8,
}

/// Body of `POST /api/settings`. Every field is optional.
#[derive(Debug, Default, Deserialize)]
pub struct SettingsUpdate {
    pub mic_gain: Option<f32>,
    pub rtsp_transport: Option<String>,
    pub quality: Option<u8>,
}

fn settings_response(ctx: &AppContext) -> SettingsResponse {
    SettingsResponse {
        stream: *ctx.settings.read(),
        frame_rate: ctx.config.stream.frame_rate,
        rec_codec: ctx.config.recording.codec,
        rec_compression: ctx.config.recording.compression,
    }
}

async fn get_settings(State(ctx): State<AppContext>) -> Json<SettingsResponse> {
    Json(settings_response(&ctx))
}

/// Validate every field before applying any of them. A transport or quality
/// change replaces the shared source's capture session.
async fn update_settings(
    State(ctx): State<AppContext>,
    Json(update): Json<SettingsUpdate>,
) -> Result<Json<SettingsResponse>, ApiError> {
    let transport = update
        .rtsp_transport
        .as_deref()
        .map(str::parse::<Transport>)
        .transpose()?;

    if let Some(gain) = update.mic_gain {
        crate::config::validate_mic_gain(gain).map_err(|e| Error::invalid_input(e.to_string()))?;
    }
    if let Some(quality) = update.quality {
        if !(1..=10).contains(&quality) {
            return Err(Error::invalid_input(format!("quality must be 1-10, got {quality}")).into());
        }
    }

    let restart = {
        let mut settings = ctx.settings.write();
        let before = *settings;

        if let Some(gain) = update.mic_gain {
            settings.mic_gain = (gain * 10.0).round() / 10.0;
        }
        if let Some(transport) = transport {
            settings.transport = transport;
        }
        if let Some(quality) = update.quality {
            settings.quality = quality;
        }

        if *settings != before {
            tracing::info!(
                transport = %settings.transport,
                quality = settings.quality,
                mic_gain = settings.mic_gain,
                "Stream settings changed"
            );
        }

        settings.transport != before.transport || settings.quality != before.quality
    };

    if restart && ctx.source.is_started() {
        ctx.source.request_restart();
    }

    Ok(Json(settings_response(&ctx)))
}

async fn get_recording(State(ctx): State<AppContext>) -> Json<RecordingStatus> {
    Json(ctx.recorder.status().await)
}

async fn start_recording(State(ctx): State<AppContext>) -> Result<Json<RecordingStatus>, ApiError> {
    Ok(Json(ctx.recorder.start().await?))
}

async fn stop_recording(State(ctx): State<AppContext>) -> Result<Json<RecordingStatus>, ApiError> {
    Ok(Json(ctx.recorder.stop().await?))
}
