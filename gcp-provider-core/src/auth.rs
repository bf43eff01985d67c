//! Credential resolution. Every Mount call authenticates to Secret Manager as the workload that
//! asked for the mount, never as the provider itself unless the caller explicitly opted into
//! that.
//!
//! The identity is picked in this order:
//! 1. a service account key passed in the node publish secret (`key.json`),
//! 2. the provider's ambient credentials when the request asks for `provider-adc`,
//! 3. workload identity when a binding is configured or can be discovered,
//! 4. the provider's ambient credentials otherwise.

use crate::config::{Endpoints, IdentityBinding, ProviderConfig, RetryConfig};
use crate::error::{Error, Result};
use crate::retry::{Exponential, retry};
use metadata::MetadataClient;
use serde::Deserialize;
use service_account_key::ServiceAccountKey;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod metadata;
mod service_account_key;
mod workload_identity;

/// OAuth2 scope requested for every token.
pub(crate) const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Bearer access token, valid for a single Mount call.
#[derive(Clone, PartialEq)]
pub struct Credentials {
    token: String,
}

impl Credentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credentials(<redacted>)")
    }
}

/// The OAuth2 token response shared by the metadata server and the token endpoint.
#[derive(Deserialize)]
pub(crate) struct TokenResponse {
    pub(crate) access_token: String,
}

/// Service account token minted by the CSI driver for one audience.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountToken {
    pub token: String,
    #[serde(default)]
    pub expiration_timestamp: Option<String>,
}

impl fmt::Debug for ServiceAccountToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountToken")
            .field("expiration_timestamp", &self.expiration_timestamp)
            .finish_non_exhaustive()
    }
}

/// The pod a Mount call is made for.
#[derive(Debug, Clone, Default)]
pub struct PodIdentity {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub service_account: String,
    /// Tokens the driver already minted for the pod, keyed by audience.
    pub tokens: HashMap<String, ServiceAccountToken>,
}

impl PodIdentity {
    fn token_for(&self, audience: &str) -> Option<&str> {
        self.tokens
            .get(audience)
            .map(|t| t.token.as_str())
            .filter(|t| !t.is_empty())
    }
}

/// Whose identity is used when no key is passed with the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthMode {
    /// The pod's own identity.
    #[default]
    PodAdc,
    /// The provider's ambient identity.
    ProviderAdc,
}

/// Per-call inputs that change how credentials are obtained.
#[derive(Clone, Default, PartialEq)]
pub struct AuthOverrides {
    pub mode: AuthMode,
    /// Service account key JSON from the node publish secret.
    pub service_account_key: Option<String>,
}

impl fmt::Debug for AuthOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthOverrides")
            .field("mode", &self.mode)
            .field("service_account_key", &self.service_account_key.is_some())
            .finish()
    }
}

#[trait_variant::make(Send)]
pub trait CredentialResolver {
    /// Resolves the credentials a Mount call made for `pod` authenticates with.
    async fn resolve(
        &self,
        pod: &PodIdentity,
        overrides: &AuthOverrides,
        cln_token: &CancellationToken,
    ) -> Result<Credentials>;
}

/// Builds a Kubernetes client from `kubeconfig`, or the in-cluster configuration when it is not
/// given. `None` when no cluster is reachable, which only disables token requests and service
/// account lookups.
pub async fn kube_client(kubeconfig: Option<&Path>) -> Option<kube::Client> {
    let config = match kubeconfig {
        Some(path) => match kube::config::Kubeconfig::read_from(path) {
            Ok(kubeconfig) => kube::Config::from_custom_kubeconfig(
                kubeconfig,
                &kube::config::KubeConfigOptions::default(),
            )
            .await
            .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        },
        None => kube::Config::infer().await.map_err(|e| e.to_string()),
    };

    let client = config.and_then(|config| kube::Client::try_from(config).map_err(|e| e.to_string()));
    match client {
        Ok(client) => Some(client),
        Err(error) => {
            warn!(%error, "No kubernetes client available, workload identity relies on driver supplied tokens");
            None
        }
    }
}

/// Resolves credentials against the Google and Kubernetes APIs.
pub struct GcpCredentialResolver {
    http: reqwest::Client,
    endpoints: Endpoints,
    retry: RetryConfig,
    kube: Option<kube::Client>,
    identity_binding: Option<IdentityBinding>,
    discovered_binding: OnceCell<Option<IdentityBinding>>,
    application_credentials: Option<PathBuf>,
}

impl GcpCredentialResolver {
    pub fn new(config: &ProviderConfig, kube: Option<kube::Client>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent())
            .build()
            .map_err(|e| Error::Config(format!("failed to build http client: {e}")))?;

        Ok(Self {
            http,
            endpoints: config.endpoints.clone(),
            retry: config.retry.clone(),
            kube,
            identity_binding: config.identity_binding.clone(),
            discovered_binding: OnceCell::new(),
            application_credentials: config.application_credentials.clone(),
        })
    }

    async fn with_retry<T, F, Fut>(&self, cln_token: &CancellationToken, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry(
            Exponential::new(&self.retry),
            cln_token,
            operation,
            Error::is_transient,
        )
        .await
    }

    /// The configured binding, or the one discovered from the metadata server. A successful
    /// discovery is cached for the lifetime of the resolver, a failed one is retried by the next
    /// call.
    async fn identity_binding(
        &self,
        cln_token: &CancellationToken,
    ) -> Result<Option<IdentityBinding>> {
        if let Some(binding) = &self.identity_binding {
            return Ok(Some(binding.clone()));
        }

        let discovered = self
            .discovered_binding
            .get_or_try_init(|| async {
                let metadata = MetadataClient::new(&self.http, &self.endpoints.metadata);
                let binding = self
                    .with_retry(cln_token, || metadata.identity_binding())
                    .await?;
                info!(?binding, "Discovered workload identity binding");
                Ok::<_, Error>(binding)
            })
            .await;

        // only a node that is known to run without workload identity may use ambient credentials
        match discovered {
            Ok(binding) => Ok(binding.clone()),
            Err(Error::Cancelled(msg)) => Err(Error::Cancelled(msg)),
            Err(error) => {
                warn!(%error, "Workload identity binding could not be discovered");
                Err(Error::PermissionDenied(format!(
                    "workload identity binding could not be discovered: {error}"
                )))
            }
        }
    }

    async fn from_key(
        &self,
        key: &ServiceAccountKey,
        cln_token: &CancellationToken,
    ) -> Result<Credentials> {
        self.with_retry(cln_token, || {
            key.exchange(
                &self.http,
                &self.endpoints.oauth2_token,
                CLOUD_PLATFORM_SCOPE,
            )
        })
        .await
    }

    /// Exchanges a token of the pod's Kubernetes service account for Google credentials.
    async fn workload_identity(
        &self,
        pod: &PodIdentity,
        binding: &IdentityBinding,
        cln_token: &CancellationToken,
    ) -> Result<Credentials> {
        let ksa_token = match pod.token_for(&binding.pool) {
            Some(token) => token.to_string(),
            None => {
                let kube = self.kube.as_ref().ok_or_else(|| {
                    Error::PermissionDenied(format!(
                        "no token for audience {} supplied and no kubernetes client available",
                        binding.pool
                    ))
                })?;
                self.with_retry(cln_token, || {
                    workload_identity::request_ksa_token(kube, pod, &binding.pool)
                })
                .await?
            }
        };

        let audience = binding.audience();
        let federated = self
            .with_retry(cln_token, || {
                workload_identity::exchange_at_sts(
                    &self.http,
                    &self.endpoints.sts,
                    &audience,
                    &ksa_token,
                    CLOUD_PLATFORM_SCOPE,
                )
            })
            .await?;

        let gsa = match &self.kube {
            Some(kube) => {
                self.with_retry(cln_token, || workload_identity::bound_gsa(kube, pod))
                    .await?
            }
            None => None,
        };

        let Some(gsa) = gsa else {
            debug!(
                namespace = pod.namespace,
                service_account = pod.service_account,
                "Using federated token"
            );
            return Ok(federated);
        };

        self.with_retry(cln_token, || {
            workload_identity::impersonate(
                &self.http,
                &self.endpoints.iam_credentials,
                &federated,
                &gsa,
                CLOUD_PLATFORM_SCOPE,
            )
        })
        .await
    }

    /// The provider's own identity: the configured key file or the node's service account.
    async fn ambient(&self, cln_token: &CancellationToken) -> Result<Credentials> {
        let credentials = match &self.application_credentials {
            Some(path) => {
                let json = tokio::fs::read_to_string(path).await.map_err(|e| {
                    Error::PermissionDenied(format!(
                        "failed to read credentials file {}: {e}",
                        path.display()
                    ))
                })?;
                let key = ServiceAccountKey::parse(&json).map_err(denied)?;
                self.from_key(&key, cln_token).await
            }
            None => {
                let metadata = MetadataClient::new(&self.http, &self.endpoints.metadata);
                self.with_retry(cln_token, || metadata.default_token())
                    .await
            }
        };
        credentials.map_err(denied)
    }
}

impl CredentialResolver for GcpCredentialResolver {
    async fn resolve(
        &self,
        pod: &PodIdentity,
        overrides: &AuthOverrides,
        cln_token: &CancellationToken,
    ) -> Result<Credentials> {
        if let Some(key_json) = &overrides.service_account_key {
            let key = ServiceAccountKey::parse(key_json)?;
            debug!(
                client_email = key.client_email(),
                "Using service account key from node publish secret"
            );
            return self.from_key(&key, cln_token).await.map_err(denied);
        }

        if overrides.mode == AuthMode::ProviderAdc {
            debug!("Using provider credentials");
            return self.ambient(cln_token).await;
        }

        match self.identity_binding(cln_token).await? {
            Some(binding) => self
                .workload_identity(pod, &binding, cln_token)
                .await
                .map_err(denied),
            None => self.ambient(cln_token).await,
        }
    }
}

/// Credential failures surface as permission errors, only cancellation is kept as is.
fn denied(error: Error) -> Error {
    match error {
        Error::PermissionDenied(_) | Error::Cancelled(_) => error,
        other => Error::PermissionDenied(format!("failed to obtain credentials: {other}")),
    }
}
