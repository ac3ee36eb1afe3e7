//! The capability to run instances of an environment.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::OrchestratorConfig;
use crate::types::{Environment, Function, ResourceLimits};

/// A running unit of compute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instance {
    /// An identifier assigned by the orchestrator.
    pub id: String,
    /// The `host:port` the instance accepts requests on.
    pub address: String,
}

impl Instance {
    /// The host part of the instance's address.
    pub fn host(&self) -> &str {
        match self.address.rsplit_once(':') {
            Some((host, _)) => host,
            None => &self.address,
        }
    }
}

/// Creates, specializes and tears down instances.
///
/// All methods are attempted exactly once. Retries are up to the callers.
#[async_trait]
pub trait Orchestrator: Send + Sync + 'static {
    /// Starts a new unspecialized instance of the environment.
    async fn create_instance(&self, environment: &Environment) -> Result<Instance>;

    /// Loads the function's package into the instance.
    async fn inject(&self, instance: &Instance, function: &Function) -> Result<()>;

    /// Checks whether the instance accepts connections.
    async fn probe(&self, instance: &Instance) -> Result<()>;

    /// Stops the instance and releases its resources.
    async fn destroy(&self, instance: &Instance) -> Result<()>;
}

#[derive(Serialize)]
struct CreateInstanceRequest<'a> {
    environment: &'a str,
    image: &'a str,
    resources: &'a ResourceLimits,
}

#[derive(Serialize)]
struct FetchRequest<'a> {
    url: &'a str,
    filename: &'a str,
}

/// An [`Orchestrator`] talking to an orchestration agent over HTTP.
///
/// Instances are created and destroyed by the agent. Injection goes directly to the instance: the
/// package is first downloaded by the fetcher running next to the instance, and then loaded by
/// the runtime.
pub struct HttpOrchestrator {
    client: reqwest::Client,
    base_url: Url,
    fetcher_port: u16,
    specialize_path: String,
    probe_timeout: Duration,
}

impl fmt::Debug for HttpOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpOrchestrator")
            .field("base_url", &self.base_url.as_str())
            .field("fetcher_port", &self.fetcher_port)
            .field("specialize_path", &self.specialize_path)
            .finish()
    }
}

impl HttpOrchestrator {
    pub fn new(config: &OrchestratorConfig) -> Result<Self> {
        let base_url = config
            .url
            .clone()
            .context("no orchestrator url configured")?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("failed to create http client")?;

        Ok(Self {
            client,
            base_url,
            fetcher_port: config.fetcher_port,
            specialize_path: config.specialize_path.clone(),
            probe_timeout: config.request_timeout,
        })
    }

    fn instances_url(&self) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("orchestrator url cannot be a base"))?
            .pop_if_empty()
            .extend(["v1", "instances"]);
        Ok(url)
    }
}

async fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("{what} failed with {status}: {body}");
    }
    Ok(response)
}

#[async_trait]
impl Orchestrator for HttpOrchestrator {
    async fn create_instance(&self, environment: &Environment) -> Result<Instance> {
        let request = CreateInstanceRequest {
            environment: &environment.metadata.name,
            image: &environment.image,
            resources: &environment.resources,
        };
        let response = self
            .client
            .post(self.instances_url()?)
            .json(&request)
            .send()
            .await
            .context("failed to reach orchestrator")?;
        let response = check_status(response, "creating instance").await?;
        response
            .json()
            .await
            .context("orchestrator returned a malformed instance")
    }

    async fn inject(&self, instance: &Instance, function: &Function) -> Result<()> {
        let package = function
            .package
            .as_ref()
            .context("function has no package")?;

        let fetch_url = format!("http://{}:{}/", instance.host(), self.fetcher_port);
        let request = FetchRequest {
            url: &package.url,
            filename: "user",
        };
        let response = self
            .client
            .post(&fetch_url)
            .json(&request)
            .send()
            .await
            .context("failed to reach fetcher")?;
        check_status(response, "fetching package").await?;

        let specialize_url = format!("http://{}{}", instance.address, self.specialize_path);
        let response = self
            .client
            .post(&specialize_url)
            .send()
            .await
            .context("failed to reach runtime")?;
        check_status(response, "loading package").await?;

        Ok(())
    }

    async fn probe(&self, instance: &Instance) -> Result<()> {
        let connect = tokio::net::TcpStream::connect(instance.address.as_str());
        tokio::time::timeout(self.probe_timeout, connect)
            .await
            .context("connection timed out")?
            .context("connection refused")?;
        Ok(())
    }

    async fn destroy(&self, instance: &Instance) -> Result<()> {
        let mut url = self.instances_url()?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("orchestrator url cannot be a base"))?
            .push(&instance.id);
        let response = self
            .client
            .delete(url)
            .send()
            .await
            .context("failed to reach orchestrator")?;
        check_status(response, "destroying instance").await?;
        Ok(())
    }
}
