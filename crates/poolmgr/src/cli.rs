//! Exposes the command line application.
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use poolmgr_service::config::Config;
use poolmgr_service::metrics;

use crate::healthcheck;
use crate::logging;
use crate::server;

/// Pool manager commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the web server.
    Run,

    /// Check the health of a running pool manager.
    Healthcheck {
        /// The address of the pool manager to check.
        ///
        /// Defaults to the `bind` address of the configuration.
        #[arg(long)]
        addr: Option<SocketAddr>,

        /// Request timeout in seconds.
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
}

/// Command line interface parser.
#[derive(Parser, Debug)]
#[command(name = "poolmgr", version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Collects the tags attached to every metric.
fn metrics_tags(config: &Config, environment: Option<&str>) -> BTreeMap<String, String> {
    let mut tags = config.metrics.custom_tags.clone();

    if let Some(tag) = config.metrics.hostname_tag.clone() {
        let hostname = hostname::get().ok().and_then(|s| s.into_string().ok());
        if let Some(hostname) = hostname {
            tags.insert(tag, hostname);
        }
    }

    if let (Some(tag), Some(environment)) = (config.metrics.environment_tag.clone(), environment) {
        tags.insert(tag, environment.to_owned());
    }

    tags
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: We are still single-threaded, no runtime has been started yet.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let environment = sentry.options().environment.as_deref();
        let tags = metrics_tags(&config, environment);
        metrics::configure_statsd(&config.metrics.prefix, statsd, tags)
            .context("failed to configure statsd")?;
    }

    match cli.command {
        Command::Run => server::run(config).context("failed to start the server")?,
        Command::Healthcheck { addr, timeout } => healthcheck::healthcheck(config, addr, timeout)?,
    }

    Ok(())
}
