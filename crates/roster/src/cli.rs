//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use roster_service::config::Config;
use roster_service::metrics;
use roster_service::services::SharedServices;

use crate::logging;
use crate::server;

/// Roster commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the web server.
    Run,

    /// Create the database schema and exit.
    Migrate,
}

/// Command line interface parser.
#[derive(Parser, Debug)]
#[command(name = "roster", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long = "config", short = 'c', global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        enable_logs: true,
        ..Default::default()
    });

    // SAFETY: no other threads that could read the environment have been spawned yet.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )
        .context("failed to set up metrics")?;
    }

    match cli.command {
        Command::Run => server::run(config).context("failed to start the server")?,
        Command::Migrate => migrate(config).context("failed to create the database schema")?,
    }

    Ok(())
}

fn migrate(config: Config) -> Result<()> {
    if config.database.url.is_none() {
        anyhow::bail!("no database configured, set `database.url` or DATABASE_URL");
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let services = SharedServices::new(config)?;
        services.bootstrap_schema().await
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        let cli = Cli::try_parse_from(["roster", "run"]).unwrap();
        assert!(matches!(cli.command, Command::Run));
        assert_eq!(cli.config(), None);

        let cli = Cli::try_parse_from(["roster", "migrate", "--config", "roster.yml"]).unwrap();
        assert!(matches!(cli.command, Command::Migrate));
        assert_eq!(cli.config(), Some(Path::new("roster.yml")));

        assert!(Cli::try_parse_from(["roster"]).is_err());
    }
}
