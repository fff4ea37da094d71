use crate::config::Config;
use crate::events::EventBus;
use crate::streaming::{
    CaptureCommands, FanoutHub, FfmpegCommands, FrameBuffer, Recorder, RelayManager,
    SharedSettings, SharedSource, StreamSettings,
};
use anyhow::{Context, Result};
use axum::{
    http::{header, Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use parking_lot::RwLock;
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};

pub mod error;
pub mod routes_api;
pub mod routes_sse;
pub mod routes_stream;

pub use error::ApiError;

/// How long open HTTP connections may take to finish once shutdown begins.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application context.
///
/// Built once at server start and torn down by [`AppContext::shutdown`].
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    /// Runtime-adjustable stream settings (in memory only)
    pub settings: SharedSettings,
    pub events: Arc<EventBus>,
    pub source: Arc<SharedSource>,
    pub fanout: Arc<FanoutHub>,
    pub relays: Arc<RelayManager>,
    pub recorder: Arc<Recorder>,
    /// Process-wide stop signal
    pub shutdown: CancellationToken,
}

impl AppContext {
    pub fn new(config: Config, commands: Arc<dyn CaptureCommands>) -> Self {
        let shutdown = CancellationToken::new();
        let events = Arc::new(EventBus::default());
        let settings = Arc::new(RwLock::new(StreamSettings::from_config(&config)));
        let frames = FrameBuffer::new();

        let source = Arc::new(SharedSource::new(
            Arc::clone(&commands),
            Arc::clone(&settings),
            config.liveness.clone(),
            frames.clone(),
            Arc::clone(&events),
            &shutdown,
        ));
        let fanout = Arc::new(FanoutHub::new(frames, Arc::clone(&events)));
        let relays = Arc::new(RelayManager::new(
            Arc::clone(&commands),
            Arc::clone(&settings),
            config.relay.clone(),
            config.liveness.wait_timeout(),
            Arc::clone(&events),
            &shutdown,
        ));
        let recorder = Arc::new(Recorder::new(
            commands,
            Arc::clone(&settings),
            config.recording.clone(),
            Arc::clone(&events),
        ));

        Self {
            config: Arc::new(config),
            settings,
            events,
            source,
            fanout,
            relays,
            recorder,
            shutdown,
        }
    }

    /// Stop everything and wait until every capture process is reaped.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        tokio::join!(
            self.relays.shutdown(),
            self.recorder.shutdown(),
            self.source.shutdown(),
        );
        tracing::info!("All capture sessions stopped");
    }
}

/// Create the Axum router with all routes
pub fn create_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    let static_dir = ctx.config.server.static_dir.clone();

    let mut app = Router::new()
        .route("/health", get(health_check))
        .nest("/api", api_routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx);

    // Serve the web viewer if a directory is configured
    if let Some(dir) = static_dir {
        if dir.exists() {
            tracing::info!("Serving static files from {:?}", dir);
            let index_path = dir.join("index.html");
            app = app.fallback_service(
                ServeDir::new(&dir)
                    .append_index_html_on_directories(true)
                    .not_found_service(ServeFile::new(index_path)),
            );
        } else {
            tracing::warn!("Static directory does not exist: {:?}", dir);
        }
    }

    app
}

fn api_routes() -> Router<AppContext> {
    routes_stream::stream_routes()
        .merge(routes_api::api_routes())
        .merge(routes_sse::sse_routes())
}

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

/// Start the HTTP server with ffmpeg capture commands and run until
/// Ctrl+C or SIGTERM.
pub async fn start_server(config: Config) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;

    if let Err(e) = nerdcam_av::tools::get_tool_path("ffmpeg", config.tools.ffmpeg.as_deref()) {
        tracing::warn!("{}; every capture session will fail to start", e);
    }

    let commands: Arc<dyn CaptureCommands> = Arc::new(FfmpegCommands::from_config(&config));
    let ctx = AppContext::new(config, commands);

    tracing::info!("Starting server on {}", addr);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    let token = ctx.shutdown.clone();
    let serving = serve(ctx, listener, shutdown_signal());
    tokio::pin!(serving);

    tokio::select! {
        result = &mut serving => return result,
        _ = token.cancelled() => {}
    }

    // A second signal skips the rest of the graceful shutdown. Dropped
    // process handles are killed on the way out.
    tokio::select! {
        result = serving => result,
        _ = shutdown_signal() => {
            tracing::warn!("Second shutdown signal received, exiting immediately");
            Ok(())
        }
    }
}

/// Serve `ctx` on `listener` until `signal` resolves or the shutdown token
/// is cancelled.
///
/// Capture sessions are stopped as soon as shutdown begins, without waiting
/// for HTTP clients. Open connections then get [`DRAIN_TIMEOUT`] to finish
/// before they are abandoned.
pub async fn serve<F>(ctx: AppContext, listener: TcpListener, signal: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    ctx.source.start();

    let app = create_router(ctx.clone());
    let token = ctx.shutdown.clone();

    // Cancelling the token ends every open stream, which lets the graceful
    // drain complete for clients that are still reading.
    let drain_signal = token.clone();
    let mut server = tokio::spawn(
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { drain_signal.cancelled().await })
        .into_future(),
    );

    let early_exit = tokio::select! {
        _ = signal => None,
        _ = token.cancelled() => None,
        joined = &mut server => Some(joined),
    };

    token.cancel();
    ctx.shutdown().await;

    let joined = match early_exit {
        Some(joined) => joined,
        None => match tokio::time::timeout(DRAIN_TIMEOUT, &mut server).await {
            Ok(joined) => joined,
            Err(_) => {
                // A client that stopped reading its socket holds hyper on a
                // blocked write and never sees the end of its stream.
                tracing::warn!(
                    timeout = ?DRAIN_TIMEOUT,
                    "Connections still open after shutdown, abandoning them"
                );
                server.abort();
                Ok(Ok(()))
            }
        },
    };
    joined.context("Server task panicked")??;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                tracing::error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
