mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Environment variable that overrides `upstream.uri`.
pub const UPSTREAM_URI_ENV: &str = "NERDCAM_UPSTREAM_URI";

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let mut config = parse_config(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    apply_env_overrides(&mut config);
    validate_config(&config)?;

    Ok(config)
}

/// Parse configuration from TOML text without validating it
pub fn parse_config(content: &str) -> Result<Config> {
    Ok(toml::from_str(content)?)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    // Try default locations
    let default_paths = [
        "./config.toml",
        "./nerdcam.toml",
        "~/.config/nerdcam/config.toml",
        "/etc/nerdcam/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            return load_config(path);
        }
    }

    // Return default config if no file found
    let mut config = Config::default();
    apply_env_overrides(&mut config);
    validate_config(&config)?;
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(uri) = std::env::var(UPSTREAM_URI_ENV) {
        if !uri.trim().is_empty() {
            config.upstream.uri = uri.trim().to_string();
        }
    }
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    if config.server.port == 0 {
        anyhow::bail!("Server port cannot be 0");
    }

    if config.upstream.uri.is_empty() {
        tracing::warn!(
            "No upstream URI configured; set upstream.uri or {}",
            UPSTREAM_URI_ENV
        );
    }

    let stream = &config.stream;
    if !(1..=10).contains(&stream.quality) {
        anyhow::bail!("Stream quality must be 1-10, got {}", stream.quality);
    }
    if stream.frame_rate == 0 {
        anyhow::bail!("Stream frame rate cannot be 0");
    }
    validate_mic_gain(stream.mic_gain)?;

    let liveness = &config.liveness;
    if liveness.stale_threshold_ms == 0 {
        anyhow::bail!("Stale threshold cannot be 0");
    }
    if liveness.check_interval_ms == 0 {
        anyhow::bail!("Liveness check interval cannot be 0");
    }
    if liveness.check_interval_ms >= liveness.stale_threshold_ms {
        anyhow::bail!(
            "Liveness check interval ({}ms) must be shorter than the stale threshold ({}ms)",
            liveness.check_interval_ms,
            liveness.stale_threshold_ms
        );
    }
    if liveness.startup_timeout_ms == 0 {
        anyhow::bail!("Startup timeout cannot be 0");
    }
    if liveness.retry_budget == 0 {
        anyhow::bail!("Retry budget cannot be 0");
    }
    if liveness.wait_timeout_ms == 0 {
        anyhow::bail!("Wait timeout cannot be 0");
    }
    if liveness.backoff_initial_ms > liveness.backoff_max_ms {
        anyhow::bail!("Initial backoff cannot exceed maximum backoff");
    }

    if config.relay.startup_timeout_ms == 0 {
        anyhow::bail!("Relay startup timeout cannot be 0");
    }

    let recording = &config.recording;
    if !(1..=10).contains(&recording.compression) {
        anyhow::bail!(
            "Recording compression must be 1-10, got {}",
            recording.compression
        );
    }
    if recording.max_seconds == 0 {
        anyhow::bail!("Recording max_seconds cannot be 0");
    }

    if let Some(ffmpeg) = &config.tools.ffmpeg {
        if !ffmpeg.exists() {
            tracing::warn!("Configured ffmpeg does not exist: {:?}", ffmpeg);
        }
    }

    Ok(())
}

/// Mic gain is shared between file validation and runtime settings.
pub fn validate_mic_gain(gain: f32) -> Result<()> {
    if !(1.0..=5.0).contains(&gain) {
        anyhow::bail!("Mic gain must be 1.0-5.0, got {}", gain);
    }
    Ok(())
}
