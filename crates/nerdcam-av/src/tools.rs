//! External tool detection.

use crate::{Error, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Information about an external tool.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    /// Name of the tool.
    pub name: String,
    /// Whether the tool is available.
    pub available: bool,
    /// Version string if available.
    pub version: Option<String>,
    /// Path to the tool executable.
    pub path: Option<PathBuf>,
}

/// Check if a tool is available and get its information.
///
/// # Example
///
/// ```no_run
/// use nerdcam_av::check_tool;
///
/// let info = check_tool("ffmpeg");
/// if info.available {
///     println!("ffmpeg version: {:?}", info.version);
/// }
/// ```
pub fn check_tool(name: &str) -> ToolInfo {
    let result = Command::new(name).arg("-version").output();

    match result {
        Ok(output) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout)
                .lines()
                .next()
                .map(|s| s.to_string());

            let path = which::which(name).ok();

            ToolInfo {
                name: name.to_string(),
                available: true,
                version,
                path,
            }
        }
        _ => ToolInfo {
            name: name.to_string(),
            available: false,
            version: None,
            path: None,
        },
    }
}

/// Check the tools nerdcam shells out to: ffmpeg (required) and ffprobe.
pub fn check_tools(ffmpeg: &Path) -> Vec<ToolInfo> {
    let ffmpeg = ffmpeg.to_string_lossy();
    vec![check_tool(&ffmpeg), check_tool("ffprobe")]
}

/// Require that a tool is available, returning its path.
///
/// # Errors
///
/// Returns an error if the tool is not found.
pub fn require_tool(name: &str) -> Result<PathBuf> {
    which::which(name).map_err(|_| Error::tool_not_found(name))
}

/// Get the path to a tool, preferring a configured path over PATH lookup.
pub fn get_tool_path(name: &str, config_path: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = config_path {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
    }

    require_tool(name)
}

/// Encoders advertised by `ffmpeg -encoders`.
///
/// Returns an empty set if ffmpeg cannot be run.
pub fn available_encoders(ffmpeg: &Path) -> BTreeSet<String> {
    match Command::new(ffmpeg).args(["-hide_banner", "-encoders"]).output() {
        Ok(output) => parse_encoder_list(&String::from_utf8_lossy(&output.stdout)),
        Err(e) => {
            tracing::debug!("Could not list ffmpeg encoders: {}", e);
            BTreeSet::new()
        }
    }
}

/// Parse `ffmpeg -encoders` output: the encoder name is the second column
/// of each listing line (`V....D libx264 ...`).
pub fn parse_encoder_list(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let flags = parts.next()?;
            let name = parts.next()?;
            let is_listing = flags.len() == 6
                && name != "="
                && flags.starts_with(['V', 'A', 'S'])
                && flags.chars().all(|c| c == '.' || c.is_ascii_uppercase());
            is_listing.then(|| name.to_string())
        })
        .collect()
}
