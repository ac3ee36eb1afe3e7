use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use poolmgr_service::config::Config;

/// Checks whether the pool manager listening on `addr` answers its healthcheck.
///
/// Without an explicit `addr`, the `bind` address of the configuration is checked.
pub fn healthcheck(config: Config, addr: Option<SocketAddr>, timeout: u64) -> anyhow::Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(timeout))
        .build()?;

    let addr = match addr {
        Some(addr) => addr,
        None => config
            .bind
            .parse()
            .context("invalid bind address in configuration")?,
    };

    let url = format!("http://{addr}/healthcheck");
    tracing::debug!("Sending request to: {url}");

    match client.get(url).send() {
        Ok(response) if response.status().is_success() => {
            println!("OK");
            Ok(())
        }
        Ok(response) => {
            println!("ERROR");
            Err(anyhow::anyhow!(
                "Pool manager ({addr}) is unhealthy. Status: {}",
                response.status()
            ))
        }
        Err(error) => {
            println!("ERROR");
            Err(anyhow::anyhow!(
                "Failed to check pool manager ({addr}) health: {error}"
            ))
        }
    }
}
