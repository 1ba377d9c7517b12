use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::telemetry::{DEFAULT_BODY_LIMIT, DEFAULT_CONSOLE_CAPACITY, DEFAULT_NETWORK_CAPACITY};

/// Default per-call CDP deadline in milliseconds.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

// ---------------------------------------------------------------------------
// Config file (parsed from TOML, all fields optional)
// ---------------------------------------------------------------------------

/// `~/.config/browserd/config.toml`, every field optional. Precedence
/// is CLI flags > environment > config file > built-in defaults; clap
/// handles the first two, this file fills the rest.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub browser: BrowserSection,
    pub daemon: DaemonSection,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSection {
    /// Explicit executable path; wins over channel lookup.
    pub executable: Option<String>,
    /// Release channel: stable, beta, dev, canary.
    pub channel: Option<String>,
    pub headless: Option<bool>,
    /// Extra browser arguments appended verbatim.
    pub extra_args: Option<Vec<String>>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    /// Override for the IPC socket path.
    pub socket: Option<String>,
    pub console_capacity: Option<usize>,
    pub network_capacity: Option<usize>,
    /// Cap on captured response bodies, bytes.
    pub body_limit: Option<usize>,
    /// Default per-call CDP deadline, ms. `0` disables it.
    pub call_timeout_ms: Option<u64>,
}

/// Load the config file. A missing file is the empty config; a broken
/// one is reported and ignored so a typo cannot keep the daemon from
/// starting.
#[must_use]
pub fn load_config(explicit: Option<&Path>) -> (Option<PathBuf>, ConfigFile) {
    let path = match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => default_config_path(),
    };

    let Some(path) = path else {
        return (None, ConfigFile::default());
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => (Some(path), config),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unparseable config file");
                (Some(path), ConfigFile::default())
            }
        },
        Err(_) => (None, ConfigFile::default()),
    }
}

/// `~/.config/browserd/config.toml` (or the platform equivalent).
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("browserd").join("config.toml"))
}

// ---------------------------------------------------------------------------
// Resolved settings (defaults applied)
// ---------------------------------------------------------------------------

/// Everything the daemon needs, with every default filled in.
#[derive(Debug, Clone)]
pub struct Settings {
    pub executable: Option<PathBuf>,
    pub channel: String,
    pub headless: bool,
    pub extra_args: Vec<String>,
    pub socket: Option<PathBuf>,
    pub console_capacity: usize,
    pub network_capacity: usize,
    pub body_limit: usize,
    pub call_timeout: Duration,
}

impl Settings {
    /// Merge a parsed config file under already-applied CLI/env values.
    ///
    /// `flags` carries the CLI layer: `None`/empty means "not given",
    /// so the file value (then the default) applies.
    #[must_use]
    pub fn resolve(flags: &SettingsOverride, file: &ConfigFile) -> Self {
        let call_timeout_ms = flags
            .call_timeout_ms
            .or(file.daemon.call_timeout_ms)
            .unwrap_or(DEFAULT_CALL_TIMEOUT_MS);

        Self {
            executable: flags
                .executable
                .clone()
                .or_else(|| file.browser.executable.clone().map(PathBuf::from)),
            channel: flags
                .channel
                .clone()
                .or_else(|| file.browser.channel.clone())
                .unwrap_or_else(|| "stable".to_owned()),
            headless: flags.headless || file.browser.headless.unwrap_or(false),
            extra_args: if flags.extra_args.is_empty() {
                file.browser.extra_args.clone().unwrap_or_default()
            } else {
                flags.extra_args.clone()
            },
            socket: flags
                .socket
                .clone()
                .or_else(|| file.daemon.socket.clone().map(PathBuf::from)),
            console_capacity: flags
                .console_capacity
                .or(file.daemon.console_capacity)
                .unwrap_or(DEFAULT_CONSOLE_CAPACITY),
            network_capacity: flags
                .network_capacity
                .or(file.daemon.network_capacity)
                .unwrap_or(DEFAULT_NETWORK_CAPACITY),
            body_limit: flags
                .body_limit
                .or(file.daemon.body_limit)
                .unwrap_or(DEFAULT_BODY_LIMIT),
            call_timeout: Duration::from_millis(call_timeout_ms),
        }
    }
}

/// The CLI layer of the precedence chain, extracted from clap.
#[derive(Debug, Default, Clone)]
pub struct SettingsOverride {
    pub executable: Option<PathBuf>,
    pub channel: Option<String>,
    pub headless: bool,
    pub extra_args: Vec<String>,
    pub socket: Option<PathBuf>,
    pub console_capacity: Option<usize>,
    pub network_capacity: Option<usize>,
    pub body_limit: Option<usize>,
    pub call_timeout_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sources_yield_defaults() {
        let settings = Settings::resolve(&SettingsOverride::default(), &ConfigFile::default());
        assert_eq!(settings.channel, "stable");
        assert!(!settings.headless);
        assert_eq!(settings.console_capacity, DEFAULT_CONSOLE_CAPACITY);
        assert_eq!(settings.network_capacity, DEFAULT_NETWORK_CAPACITY);
        assert_eq!(settings.body_limit, DEFAULT_BODY_LIMIT);
        assert_eq!(settings.call_timeout, Duration::from_secs(30));
        assert!(settings.socket.is_none());
    }

    #[test]
    fn file_values_apply_when_flags_absent() {
        let file: ConfigFile = toml::from_str(
            r#"
            [browser]
            channel = "beta"
            headless = true
            extra_args = ["--disable-gpu"]

            [daemon]
            console_capacity = 500
            call_timeout_ms = 5000
            "#,
        )
        .unwrap();

        let settings = Settings::resolve(&SettingsOverride::default(), &file);
        assert_eq!(settings.channel, "beta");
        assert!(settings.headless);
        assert_eq!(settings.extra_args, vec!["--disable-gpu"]);
        assert_eq!(settings.console_capacity, 500);
        assert_eq!(settings.call_timeout, Duration::from_secs(5));
    }

    #[test]
    fn flags_win_over_file() {
        let file: ConfigFile = toml::from_str(
            r#"
            [browser]
            channel = "beta"

            [daemon]
            body_limit = 1024
            "#,
        )
        .unwrap();

        let flags = SettingsOverride {
            channel: Some("canary".into()),
            body_limit: Some(2048),
            ..SettingsOverride::default()
        };
        let settings = Settings::resolve(&flags, &file);
        assert_eq!(settings.channel, "canary");
        assert_eq!(settings.body_limit, 2048);
    }

    #[test]
    fn zero_call_timeout_means_no_deadline() {
        let flags = SettingsOverride {
            call_timeout_ms: Some(0),
            ..SettingsOverride::default()
        };
        let settings = Settings::resolve(&flags, &ConfigFile::default());
        assert!(settings.call_timeout.is_zero());
    }

    #[test]
    fn unparseable_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "not [valid toml").unwrap();

        let (loaded_path, config) = load_config(Some(&path));
        assert_eq!(loaded_path, Some(path));
        assert!(config.browser.channel.is_none());
    }

    #[test]
    fn missing_file_is_empty_config() {
        let (path, config) = load_config(Some(Path::new("/nonexistent/browserd.toml")));
        assert!(path.is_none());
        assert!(config.daemon.socket.is_none());
    }
}
