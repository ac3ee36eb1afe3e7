//! Support to read definitions from the controller's REST API.

use std::fmt;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use url::Url;

use super::MetadataStore;
use crate::error::ResolveError;
use crate::types::{Environment, Function, Identity, PackageRef};

/// A [`MetadataStore`] backed by the controller.
#[derive(Clone)]
pub struct ControllerClient {
    client: reqwest::Client,
    base_url: Url,
}

impl fmt::Debug for ControllerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerClient")
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

impl ControllerClient {
    pub fn new(client: reqwest::Client, base_url: Url) -> Self {
        Self { client, base_url }
    }

    /// The URL of a resource of the given `kind`, pinned to the identity's version.
    fn resource_url(&self, kind: &str, identity: &Identity) -> Result<Url, ResolveError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ResolveError::InternalError)?
            .pop_if_empty()
            .extend(["v1", kind, identity.name.as_str()]);
        url.query_pairs_mut().append_pair("uid", &identity.uid);
        Ok(url)
    }

    /// The URL the controller serves a function's raw package from.
    pub fn package_url(&self, function: &Identity) -> Result<Url, ResolveError> {
        let mut url = self.resource_url("functions", function)?;
        url.query_pairs_mut().append_pair("raw", "1");
        Ok(url)
    }

    async fn fetch_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ResolveError> {
        tracing::trace!(url = %url, "Fetching from controller");
        let response = self.client.get(url.clone()).send().await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ResolveError::NotFound(url.path().to_owned()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(%status, %body, "Unexpected response from controller");
            return Err(ResolveError::UpstreamUnavailable(format!(
                "controller responded with {status}"
            )));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl MetadataStore for ControllerClient {
    async fn get_function(&self, function: &Identity) -> Result<Function, ResolveError> {
        let url = self.resource_url("functions", function)?;
        let mut fnc: Function = self.fetch_json(url).await?;
        if fnc.package.is_none() {
            fnc.package = Some(PackageRef {
                url: self.package_url(function)?.into(),
            });
        }
        Ok(fnc)
    }

    async fn get_environment(&self, environment: &Identity) -> Result<Environment, ResolveError> {
        let url = self.resource_url("environments", environment)?;
        self.fetch_json(url).await
    }
}
