use std::path::PathBuf;

use clap::Parser;

use browserd::config::SettingsOverride;

/// Daemon flags. Command parsing and output formatting live in the
/// client; the daemon only takes startup options.
#[derive(Parser)]
#[command(
    name = "browserd",
    version,
    about = "Persistent browser-control daemon speaking the Chrome DevTools Protocol",
    long_about = "browserd launches and owns a Chrome/Chromium process, keeps a single \
        CDP WebSocket to it, buffers console and network telemetry, and serves \
        structured commands from short-lived clients over a local Unix socket \
        (newline-delimited JSON). It runs in the foreground until SIGINT, SIGTERM, \
        or a shutdown command.",
    term_width = 100
)]
pub struct Cli {
    /// Run the browser headless
    #[arg(long)]
    pub headless: bool,

    /// Path to the browser executable (overrides channel lookup)
    #[arg(long)]
    pub chrome_path: Option<PathBuf>,

    /// Browser release channel: stable, beta, dev, canary
    #[arg(long)]
    pub channel: Option<String>,

    /// Extra browser argument, repeatable
    #[arg(long = "chrome-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub chrome_args: Vec<String>,

    /// IPC socket path (default: $XDG_RUNTIME_DIR/browserd/browserd.sock)
    #[arg(long, env = "BROWSERD_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Config file path (default: ~/.config/browserd/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Console ring capacity
    #[arg(long, value_name = "N")]
    pub console_capacity: Option<usize>,

    /// Network ring capacity
    #[arg(long, value_name = "N")]
    pub network_capacity: Option<usize>,

    /// Response body capture cap in bytes
    #[arg(long, value_name = "BYTES")]
    pub body_limit: Option<usize>,

    /// Default CDP call timeout in milliseconds (0 disables)
    #[arg(long, value_name = "MS")]
    pub timeout: Option<u64>,
}

impl Cli {
    /// The CLI layer of the settings precedence chain.
    #[must_use]
    pub fn overrides(&self) -> SettingsOverride {
        SettingsOverride {
            executable: self.chrome_path.clone(),
            channel: self.channel.clone(),
            headless: self.headless,
            extra_args: self.chrome_args.clone(),
            socket: self.socket.clone(),
            console_capacity: self.console_capacity,
            network_capacity: self.network_capacity,
            body_limit: self.body_limit,
            call_timeout_ms: self.timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_leave_overrides_empty() {
        let cli = Cli::parse_from(["browserd"]);
        let overrides = cli.overrides();
        assert!(!overrides.headless);
        assert!(overrides.executable.is_none());
        assert!(overrides.channel.is_none());
        assert!(overrides.extra_args.is_empty());
        assert!(overrides.call_timeout_ms.is_none());
    }

    #[test]
    fn flags_flow_into_overrides() {
        let cli = Cli::parse_from([
            "browserd",
            "--headless",
            "--channel",
            "beta",
            "--chrome-arg",
            "--disable-gpu",
            "--chrome-arg",
            "--mute-audio",
            "--timeout",
            "5000",
            "--body-limit",
            "4096",
        ]);
        let overrides = cli.overrides();
        assert!(overrides.headless);
        assert_eq!(overrides.channel.as_deref(), Some("beta"));
        assert_eq!(overrides.extra_args, vec!["--disable-gpu", "--mute-audio"]);
        assert_eq!(overrides.call_timeout_ms, Some(5000));
        assert_eq!(overrides.body_limit, Some(4096));
    }
}
