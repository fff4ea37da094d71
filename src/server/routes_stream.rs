//! Live stream endpoints.
//!
//! - `GET /api/mjpeg`: shared fanout, `multipart/x-mixed-replace`
//! - `GET /api/snapshot`: latest shared frame as a JPEG
//! - `GET /api/fmp4`: per-client relay, fragmented MP4
//! - `GET /api/stream`: per-client relay, MPEG-TS
//! - `GET /api/audio`: per-client relay, MP3

use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use nerdcam_common::{Error, RelayProfile};

use super::{error::ApiError, AppContext};
use crate::streaming;

pub fn stream_routes() -> Router<AppContext> {
    Router::new()
        .route("/mjpeg", get(mjpeg_handler))
        .route("/snapshot", get(snapshot_handler))
        .route("/fmp4", get(fmp4_handler))
        .route("/stream", get(mpegts_handler))
        .route("/audio", get(audio_handler))
}

fn peer_addr(info: Option<ConnectInfo<SocketAddr>>) -> Option<SocketAddr> {
    info.map(|ConnectInfo(addr)| addr)
}

/// GET /api/mjpeg
pub async fn mjpeg_handler(
    State(ctx): State<AppContext>,
    info: Option<ConnectInfo<SocketAddr>>,
) -> Result<Response, ApiError> {
    ctx.source.start();
    ctx.source.ensure_available()?;

    let conn = ctx
        .fanout
        .attach(peer_addr(info), ctx.shutdown.child_token());

    Ok((
        [
            (header::CONTENT_TYPE, streaming::CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(conn.into_stream()),
    )
        .into_response())
}

/// GET /api/snapshot
pub async fn snapshot_handler(State(ctx): State<AppContext>) -> Result<Response, ApiError> {
    ctx.source.ensure_available()?;
    let frame = ctx
        .source
        .frames()
        .latest()
        .ok_or_else(|| Error::unavailable("no frame captured yet"))?;

    Ok((
        [
            (header::CONTENT_TYPE, "image/jpeg"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        frame.data.clone(),
    )
        .into_response())
}

/// GET /api/fmp4
pub async fn fmp4_handler(
    State(ctx): State<AppContext>,
    info: Option<ConnectInfo<SocketAddr>>,
) -> Result<Response, ApiError> {
    relay_response(&ctx, RelayProfile::Fmp4, peer_addr(info)).await
}

/// GET /api/stream
pub async fn mpegts_handler(
    State(ctx): State<AppContext>,
    info: Option<ConnectInfo<SocketAddr>>,
) -> Result<Response, ApiError> {
    relay_response(&ctx, RelayProfile::MpegTs, peer_addr(info)).await
}

/// GET /api/audio
pub async fn audio_handler(
    State(ctx): State<AppContext>,
    info: Option<ConnectInfo<SocketAddr>>,
) -> Result<Response, ApiError> {
    relay_response(&ctx, RelayProfile::Audio, peer_addr(info)).await
}

async fn relay_response(
    ctx: &AppContext,
    profile: RelayProfile,
    peer: Option<SocketAddr>,
) -> Result<Response, ApiError> {
    let relay = ctx.relays.open(profile, peer).await?;

    Ok((
        [
            (header::CONTENT_TYPE, profile.content_type()),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(relay.into_stream()),
    )
        .into_response())
}
