//! Server-Sent Events of relay activity.
//!
//! Replays recent events for late joiners, then follows the
//! [`EventBus`](crate::events::EventBus) with periodic heartbeats.

use crate::server::AppContext;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Router,
};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

/// Events replayed to a new subscriber.
const REPLAY_EVENTS: usize = 20;

pub fn sse_routes() -> Router<AppContext> {
    Router::new().route("/events", get(events_handler))
}

/// GET /api/events
pub async fn events_handler(
    State(ctx): State<AppContext>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let recent = ctx.events.recent_events(REPLAY_EVENTS);
    let mut rx = ctx.events.subscribe();
    let cancel = ctx.shutdown.child_token();

    let stream = async_stream::stream! {
        for event in recent.into_iter().rev() {
            if let Ok(data) = serde_json::to_string(&event) {
                yield Ok(Event::default().data(data));
            }
        }

        let mut heartbeat = tokio::time::interval(Duration::from_secs(15));

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if let Ok(data) = serde_json::to_string(&event) {
                                yield Ok(Event::default().data(data));
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            tracing::debug!("SSE client lagged by {n} events");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                _ = heartbeat.tick() => {
                    yield Ok(Event::default()
                        .event("heartbeat")
                        .data(r#"{"event_type":"heartbeat"}"#));
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}
