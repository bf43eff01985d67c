//! Configuration of the provider. It is built once at startup from the command line and the
//! environment and then shared read-only with every Mount call.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Name reported by `Version` and used as the user-agent product.
pub const RUNTIME_NAME: &str = "secrets-store-csi-driver-provider-gcp";
/// Version of the driver-provider api we implement.
pub const PROVIDER_API_VERSION: &str = "v1alpha1";
/// File name of the unix domain socket inside `TARGET_DIR`.
pub const SOCKET_FILE_NAME: &str = "gcp.sock";

const ENV_TARGET_DIR: &str = "TARGET_DIR";
const DEFAULT_TARGET_DIR: &str = "/etc/kubernetes/secrets-store-csi-providers";
const ENV_APPLICATION_CREDENTIALS: &str = "GOOGLE_APPLICATION_CREDENTIALS";
const ENV_METADATA_HOST: &str = "GCE_METADATA_HOST";
const ENV_SECRET_MANAGER_ENDPOINT: &str = "SECRET_MANAGER_ENDPOINT";
const ENV_REGIONAL_SECRET_MANAGER_ENDPOINT: &str = "REGIONAL_SECRET_MANAGER_ENDPOINT";
const ENV_STS_ENDPOINT: &str = "STS_ENDPOINT";
const ENV_IAM_CREDENTIALS_ENDPOINT: &str = "IAM_CREDENTIALS_ENDPOINT";
const ENV_OAUTH2_TOKEN_ENDPOINT: &str = "OAUTH2_TOKEN_ENDPOINT";

const DEFAULT_MOUNT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound of concurrent Secret Manager calls within one Mount call.
const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 8;
/// Owner read-only, used when neither the object nor the request sets a mode.
pub(crate) const DEFAULT_FILE_MODE: u32 = 0o400;

const DEFAULT_METADATA_ENDPOINT: &str = "http://metadata.google.internal";
const DEFAULT_SECRET_MANAGER_ENDPOINT: &str = "https://secretmanager.googleapis.com";
const DEFAULT_REGIONAL_SECRET_MANAGER_ENDPOINT: &str =
    "https://secretmanager.{location}.rep.googleapis.com";
const DEFAULT_STS_ENDPOINT: &str = "https://sts.googleapis.com";
const DEFAULT_IAM_CREDENTIALS_ENDPOINT: &str = "https://iamcredentials.googleapis.com";
const DEFAULT_OAUTH2_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Path of the unix domain socket the driver connects to.
    pub socket_path: PathBuf,
    /// Optional kubeconfig, in-cluster config is used when absent.
    pub kubeconfig: Option<PathBuf>,
    /// Build version, embedded in the user-agent and the `Version` response.
    pub version: String,
    /// Upper bound of a single Mount call.
    pub mount_timeout: Duration,
    /// How long in-flight calls may run after a shutdown signal.
    pub drain_timeout: Duration,
    pub max_concurrent_fetches: usize,
    pub default_file_mode: u32,
    pub retry: RetryConfig,
    pub endpoints: Endpoints,
    /// Workload identity pool and provider. Discovered from the metadata server when unset.
    pub identity_binding: Option<IdentityBinding>,
    /// Service account key used as the provider's ambient identity.
    pub application_credentials: Option<PathBuf>,
}

impl ProviderConfig {
    pub fn new(version: impl Into<String>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            kubeconfig: None,
            version: version.into(),
            mount_timeout: DEFAULT_MOUNT_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            default_file_mode: DEFAULT_FILE_MODE,
            retry: RetryConfig::default(),
            endpoints: Endpoints::default(),
            identity_binding: None,
            application_credentials: None,
        }
    }

    /// Loads the environment dependent parts of the configuration (socket location, endpoints
    /// and ambient credentials). Everything else keeps its default.
    pub fn load(
        version: impl Into<String>,
        env_vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Result<Self> {
        let env_vars: HashMap<String, String> = env_vars
            .into_iter()
            .map(|(key, val)| (key.into(), val.into()))
            .collect();

        let target_dir = env_vars
            .get(ENV_TARGET_DIR)
            .filter(|dir| !dir.is_empty())
            .map(String::as_str)
            .unwrap_or(DEFAULT_TARGET_DIR);

        let mut config = Self::new(version, PathBuf::from(target_dir).join(SOCKET_FILE_NAME));
        config.endpoints = Endpoints::load(&env_vars)?;
        config.application_credentials = env_vars
            .get(ENV_APPLICATION_CREDENTIALS)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);
        Ok(config)
    }

    /// The user-agent attached to every outbound call.
    pub fn user_agent(&self) -> String {
        format!("{RUNTIME_NAME}/{}", self.version)
    }
}

/// Bounded retry of transient errors at the transport layer.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u16,
    pub base_interval: Duration,
    pub max_interval: Duration,
    /// Between 0.0 and 1.0.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(2),
            jitter: 0.2,
        }
    }
}

/// Base URLs of the Google APIs we talk to.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoints {
    pub metadata: String,
    pub secret_manager: String,
    /// Contains a `{location}` placeholder.
    pub regional_secret_manager: String,
    pub sts: String,
    pub iam_credentials: String,
    pub oauth2_token: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            metadata: DEFAULT_METADATA_ENDPOINT.to_string(),
            secret_manager: DEFAULT_SECRET_MANAGER_ENDPOINT.to_string(),
            regional_secret_manager: DEFAULT_REGIONAL_SECRET_MANAGER_ENDPOINT.to_string(),
            sts: DEFAULT_STS_ENDPOINT.to_string(),
            iam_credentials: DEFAULT_IAM_CREDENTIALS_ENDPOINT.to_string(),
            oauth2_token: DEFAULT_OAUTH2_TOKEN_ENDPOINT.to_string(),
        }
    }
}

impl Endpoints {
    fn load(env_vars: &HashMap<String, String>) -> Result<Self> {
        let get_var = |var: &str| env_vars.get(var).filter(|v| !v.is_empty()).cloned();

        let mut endpoints = Self::default();
        if let Some(host) = get_var(ENV_METADATA_HOST) {
            // GCE_METADATA_HOST is a bare host[:port] by convention
            endpoints.metadata = if host.contains("://") {
                host
            } else {
                format!("http://{host}")
            };
        }
        if let Some(url) = get_var(ENV_SECRET_MANAGER_ENDPOINT) {
            endpoints.secret_manager = url;
        }
        if let Some(url) = get_var(ENV_REGIONAL_SECRET_MANAGER_ENDPOINT) {
            if !url.contains("{location}") {
                return Err(Error::Config(format!(
                    "{ENV_REGIONAL_SECRET_MANAGER_ENDPOINT} must contain a {{location}} placeholder"
                )));
            }
            endpoints.regional_secret_manager = url;
        }
        if let Some(url) = get_var(ENV_STS_ENDPOINT) {
            endpoints.sts = url;
        }
        if let Some(url) = get_var(ENV_IAM_CREDENTIALS_ENDPOINT) {
            endpoints.iam_credentials = url;
        }
        if let Some(url) = get_var(ENV_OAUTH2_TOKEN_ENDPOINT) {
            endpoints.oauth2_token = url;
        }
        Ok(endpoints)
    }

    /// Points every endpoint at a single base url, handy for local emulators and tests.
    pub fn all(base: &str) -> Self {
        Self {
            metadata: base.to_string(),
            secret_manager: base.to_string(),
            regional_secret_manager: format!("{base}/{{location}}"),
            sts: base.to_string(),
            iam_credentials: base.to_string(),
            oauth2_token: format!("{base}/token"),
        }
    }

    pub(crate) fn regional_secret_manager(&self, location: &str) -> String {
        self.regional_secret_manager.replace("{location}", location)
    }
}

/// Workload identity pool (e.g. `my-project.svc.id.goog`) and the identity provider of the
/// cluster (e.g. `https://container.googleapis.com/v1/projects/p/locations/l/clusters/c`).
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityBinding {
    pub pool: String,
    pub provider: String,
}

impl IdentityBinding {
    /// Audience used for the STS token exchange.
    pub(crate) fn audience(&self) -> String {
        format!("identitynamespace:{}:{}", self.pool, self.provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_defaults() {
        let config = ProviderConfig::load("1.2.3", Vec::<(String, String)>::new()).unwrap();
        assert_eq!(
            config.socket_path,
            PathBuf::from("/etc/kubernetes/secrets-store-csi-providers/gcp.sock")
        );
        assert_eq!(config.mount_timeout, Duration::from_secs(30));
        assert_eq!(config.default_file_mode, 0o400);
        assert_eq!(config.endpoints, Endpoints::default());
        assert!(config.application_credentials.is_none());
        assert_eq!(
            config.user_agent(),
            "secrets-store-csi-driver-provider-gcp/1.2.3"
        );
    }

    #[test]
    fn test_load_from_env() {
        let env_vars = [
            ("TARGET_DIR", "/tmp/providers"),
            ("GCE_METADATA_HOST", "127.0.0.1:8080"),
            ("SECRET_MANAGER_ENDPOINT", "http://localhost:9000"),
            ("GOOGLE_APPLICATION_CREDENTIALS", "/var/run/key.json"),
            ("UNRELATED", "value"),
        ];
        let config = ProviderConfig::load("dev", env_vars).unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/providers/gcp.sock"));
        assert_eq!(config.endpoints.metadata, "http://127.0.0.1:8080");
        assert_eq!(config.endpoints.secret_manager, "http://localhost:9000");
        assert_eq!(
            config.application_credentials,
            Some(PathBuf::from("/var/run/key.json"))
        );
    }

    #[test]
    fn test_regional_endpoint_requires_placeholder() {
        let env_vars = [("REGIONAL_SECRET_MANAGER_ENDPOINT", "http://localhost:9000")];
        let result = ProviderConfig::load("dev", env_vars);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_regional_endpoint() {
        let endpoints = Endpoints::default();
        assert_eq!(
            endpoints.regional_secret_manager("us-east1"),
            "https://secretmanager.us-east1.rep.googleapis.com"
        );
    }

    #[test]
    fn test_identity_binding_audience() {
        let binding = IdentityBinding {
            pool: "p.svc.id.goog".to_string(),
            provider: "https://container.googleapis.com/v1/projects/p/locations/l/clusters/c"
                .to_string(),
        };
        assert_eq!(
            binding.audience(),
            "identitynamespace:p.svc.id.goog:https://container.googleapis.com/v1/projects/p/locations/l/clusters/c"
        );
    }
}
