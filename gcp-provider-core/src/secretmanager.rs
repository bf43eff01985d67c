//! Google Secret Manager access over its REST api.

use crate::auth::Credentials;
use crate::config::{Endpoints, ProviderConfig, RetryConfig};
use crate::error::{Error, Result, api_error};
use crate::retry::{Exponential, retry};
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use bytes::Bytes;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

mod resource;

pub use resource::ResourceName;

/// Contents of a secret version along with the version number it resolved to, `latest` is never
/// returned here.
#[derive(Clone, PartialEq)]
pub struct SecretPayload {
    pub data: Bytes,
    pub version: String,
}

impl std::fmt::Debug for SecretPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretPayload")
            .field("len", &self.data.len())
            .field("version", &self.version)
            .finish()
    }
}

#[trait_variant::make(Send)]
pub trait SecretFetcher {
    /// Fetches the payload of a secret version.
    async fn fetch(
        &self,
        name: &ResourceName,
        credentials: &Credentials,
        cln_token: &CancellationToken,
    ) -> Result<SecretPayload>;
}

#[derive(Deserialize)]
struct AccessSecretVersionResponse {
    name: String,
    payload: Option<Payload>,
}

#[derive(Deserialize)]
struct Payload {
    #[serde(default)]
    data: String,
}

/// [`SecretFetcher`] backed by the Secret Manager REST api. Transient failures are retried with
/// exponential backoff.
#[derive(Clone)]
pub struct SecretManagerClient {
    http: reqwest::Client,
    endpoints: Endpoints,
    retry: RetryConfig,
}

impl SecretManagerClient {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent())
            .build()
            .map_err(|e| Error::Config(format!("failed to build http client: {e}")))?;

        Ok(Self {
            http,
            endpoints: config.endpoints.clone(),
            retry: config.retry.clone(),
        })
    }

    fn access_url(&self, name: &ResourceName) -> String {
        let base = match name.location() {
            Some(location) => self.endpoints.regional_secret_manager(location),
            None => self.endpoints.secret_manager.clone(),
        };
        format!("{base}/v1/{name}:access")
    }

    /// A single `versions.access` call.
    async fn access(&self, name: &ResourceName, credentials: &Credentials) -> Result<SecretPayload> {
        let response = self
            .http
            .get(self.access_url(name))
            .bearer_auth(credentials.token())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(api_error("secretmanager", status, &body));
        }

        let response: AccessSecretVersionResponse = response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("malformed access response for {name}: {e}")))?;

        let payload = response
            .payload
            .ok_or_else(|| Error::Internal(format!("access response for {name} has no payload")))?;
        let data = BASE64_STANDARD
            .decode(payload.data.as_bytes())
            .map_err(|e| Error::Internal(format!("payload of {name} is not valid base64: {e}")))?;

        // the name returned is always the numbered version, also when `latest` was asked for
        let version = response
            .name
            .rsplit('/')
            .next()
            .filter(|v| !v.is_empty())
            .unwrap_or(name.version())
            .to_string();

        Ok(SecretPayload {
            data: Bytes::from(data),
            version,
        })
    }
}

impl SecretFetcher for SecretManagerClient {
    async fn fetch(
        &self,
        name: &ResourceName,
        credentials: &Credentials,
        cln_token: &CancellationToken,
    ) -> Result<SecretPayload> {
        let payload = retry(
            Exponential::new(&self.retry),
            cln_token,
            || self.access(name, credentials),
            Error::is_transient,
        )
        .await?;
        debug!(resource = %name, version = payload.version, "Fetched secret");
        Ok(payload)
    }
}
