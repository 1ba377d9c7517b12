mod cli;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use browserd::config::{Settings, load_config};
use browserd::daemon;

use cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let (_config_path, config_file) = load_config(cli.config.as_deref());
    let settings = Settings::resolve(&cli.overrides(), &config_file);

    let code = match daemon::run(settings).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "daemon failed");
            e.exit_code()
        }
    };

    std::process::exit(code as i32);
}
