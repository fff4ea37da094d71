mod cli;

use nerdcam::{config, server};
use nerdcam_av::tools::{available_encoders, check_tools as detect_tools, get_tool_path};
use nerdcam_av::RecordCodec;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use std::path::{Path, PathBuf};

async fn start_server(
    host: Option<String>,
    port: Option<u16>,
    config_path: Option<&Path>,
) -> Result<()> {
    let mut config = config::load_config_or_default(config_path)?;

    // Override host/port from CLI if specified
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    tracing::info!("Starting nerdcam {}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "Server will listen on {}:{}",
        config.server.host,
        config.server.port
    );

    server::start_server(config).await
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "nerdcam=trace,nerdcam_av=debug,tower_http=debug".to_string()
        } else {
            "nerdcam=debug,nerdcam_av=info,tower_http=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    match cli.command {
        Commands::Start { host, port } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(start_server(host, port, cli.config.as_deref()))
        }
        Commands::CheckTools => check_tools(cli.config.as_deref()),
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("nerdcam {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn check_tools(config_path: Option<&Path>) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    let ffmpeg = get_tool_path("ffmpeg", config.tools.ffmpeg.as_deref()).unwrap_or_else(|_| {
        config
            .tools
            .ffmpeg
            .clone()
            .unwrap_or_else(|| PathBuf::from("ffmpeg"))
    });

    println!("Checking external tools...\n");

    let tools = detect_tools(&ffmpeg);
    let mut ffmpeg_ok = false;

    for (i, tool) in tools.iter().enumerate() {
        let status = if tool.available { "✓" } else { "✗" };
        if i == 0 {
            ffmpeg_ok = tool.available;
        }

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if !ffmpeg_ok {
        println!("ffmpeg is required for streaming and recording. Install it to continue.");
        return Ok(());
    }

    let encoders = available_encoders(&ffmpeg);
    println!("Recording codecs:");
    for codec in RecordCodec::PREFERENCE {
        let supported = codec.is_supported_by(encoders.iter().map(String::as_str));
        let marker = if supported { "✓" } else { "✗" };
        match codec.encoder() {
            Some(encoder) => println!("  {} {} ({})", marker, codec, encoder),
            None => println!("  {} {} (stream copy)", marker, codec),
        }
    }

    let configured = config.recording.codec;
    if !configured.is_supported_by(encoders.iter().map(String::as_str)) {
        println!(
            "\nConfigured recording codec '{}' is not supported by this ffmpeg",
            configured
        );
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = config::load_config(p)?;
            println!("✓ Configuration is valid");
            println!("  Server: {}:{}", config.server.host, config.server.port);
            println!(
                "  Upstream: {} ({})",
                if config.upstream.uri.is_empty() {
                    "<not set>".to_string()
                } else {
                    nerdcam::streaming::redact_uri(&config.upstream.uri)
                },
                config.upstream.transport
            );
            println!(
                "  Stale threshold: {}ms (retry budget {})",
                config.liveness.stale_threshold_ms, config.liveness.retry_budget
            );
            println!(
                "  Recording: {} into {:?}",
                config.recording.codec, config.recording.output_dir
            );
        }
        None => {
            println!("No config file specified, using defaults");
            let config = config::Config::default();
            println!("Default config:");
            println!("  Server: {}:{}", config.server.host, config.server.port);
        }
    }

    Ok(())
}
