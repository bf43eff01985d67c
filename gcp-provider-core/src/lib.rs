//! Secrets Store CSI driver provider for Google Secret Manager.
//!
//! The CSI driver calls `Mount` over a unix domain socket with the secrets a pod asked for. The
//! provider authenticates as the pod, fetches every secret and returns the file contents along
//! with the resolved versions. Writing the files is left to the driver.

use tokio_util::sync::CancellationToken;
use tracing::info;

pub use crate::error::{Error, Result};

mod error;

pub mod config;
pub use crate::config::ProviderConfig;

/// Credential resolution for Mount calls.
pub mod auth;
/// Secret Manager access.
pub mod secretmanager;

mod retry;

pub mod mount;
pub use crate::mount::MountProcessor;

pub mod service;
pub use crate::service::ProviderService;

pub mod lifecycle;
pub use crate::lifecycle::{LifecycleManager, LifecycleState};

#[cfg(test)]
mod test_utils;

/// Runs the provider until `cln_token` is cancelled and in-flight calls are drained.
pub async fn run(
    config: ProviderConfig,
    kube: Option<kube::Client>,
    cln_token: CancellationToken,
) -> Result<()> {
    info!(
        version = config.version,
        socket_path = ?config.socket_path,
        "Starting secrets store provider"
    );

    let resolver = auth::GcpCredentialResolver::new(&config, kube)?;
    let fetcher = secretmanager::SecretManagerClient::new(&config)?;
    let processor = MountProcessor::new(
        resolver,
        fetcher,
        config.max_concurrent_fetches,
        config.default_file_mode,
    );

    // cancelled by the lifecycle once the drain period is over
    let abort_token = CancellationToken::new();
    let service = ProviderService::new(
        processor,
        config.version.clone(),
        config.mount_timeout,
        abort_token.clone(),
    );

    LifecycleManager::new(config.socket_path.clone(), config.drain_timeout)
        .serve(service, cln_token, abort_token)
        .await
}
