use std::path::{Path, PathBuf};

use super::ChromeError;

/// Browser release channel.
#[derive(Debug, Clone, Copy, Default)]
pub enum Channel {
    #[default]
    Stable,
    Beta,
    Dev,
    Canary,
}

impl Channel {
    /// Parse a channel name as it appears in the config file.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "stable" => Some(Self::Stable),
            "beta" => Some(Self::Beta),
            "dev" => Some(Self::Dev),
            "canary" => Some(Self::Canary),
            _ => None,
        }
    }
}

/// Locate a browser executable.
///
/// Resolution order: an explicit path (config or `--chrome-path`), the
/// `CHROME_PATH` environment variable, then platform-standard locations
/// for the requested channel.
///
/// # Errors
///
/// Returns `ChromeError::NotFound` when no candidate exists on disk.
pub fn locate_browser(channel: Channel, explicit: Option<&Path>) -> Result<PathBuf, ChromeError> {
    let env_override = std::env::var("CHROME_PATH").ok().map(PathBuf::from);
    locate_browser_from(channel, explicit, env_override.as_deref())
}

/// Testable core of [`locate_browser`]: the environment override is a
/// parameter instead of a process-global read.
fn locate_browser_from(
    channel: Channel,
    explicit: Option<&Path>,
    env_override: Option<&Path>,
) -> Result<PathBuf, ChromeError> {
    for candidate in explicit.into_iter().chain(env_override) {
        if candidate.exists() {
            return Ok(candidate.to_path_buf());
        }
    }

    for candidate in candidate_paths(channel) {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(ChromeError::NotFound(format!(
        "no {channel:?}-channel Chrome or Chromium on this system; \
         set CHROME_PATH or pass --chrome-path"
    )))
}

/// All candidate executable paths for the channel on this platform.
fn candidate_paths(channel: Channel) -> Vec<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        let apps: &[&str] = match channel {
            Channel::Stable => &[
                "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
                "/Applications/Chromium.app/Contents/MacOS/Chromium",
            ],
            Channel::Beta => {
                &["/Applications/Google Chrome Beta.app/Contents/MacOS/Google Chrome Beta"]
            }
            Channel::Dev => {
                &["/Applications/Google Chrome Dev.app/Contents/MacOS/Google Chrome Dev"]
            }
            Channel::Canary => {
                &["/Applications/Google Chrome Canary.app/Contents/MacOS/Google Chrome Canary"]
            }
        };
        apps.iter().map(PathBuf::from).collect()
    }

    #[cfg(target_os = "linux")]
    {
        let names: &[&str] = match channel {
            Channel::Stable => &[
                "google-chrome",
                "google-chrome-stable",
                "chromium",
                "chromium-browser",
            ],
            Channel::Beta => &["google-chrome-beta"],
            Channel::Dev => &["google-chrome-unstable"],
            Channel::Canary => &["google-chrome-canary"],
        };

        let path_dirs: Vec<PathBuf> = std::env::var("PATH")
            .unwrap_or_default()
            .split(':')
            .map(PathBuf::from)
            .collect();

        names
            .iter()
            .flat_map(|name| path_dirs.iter().map(move |dir| dir.join(name)))
            .collect()
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        let _ = channel;
        Vec::new()
    }
}
