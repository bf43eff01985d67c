//! Helpers shared by the unit tests.

use crate::auth::{AuthOverrides, CredentialResolver, Credentials, PodIdentity};
use crate::error::{Error, Result};
use crate::secretmanager::{ResourceName, SecretFetcher, SecretPayload};
use axum::Router;
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Serves `router` on an ephemeral localhost port and returns its base url. Used to stand in for
/// the Google and Kubernetes APIs.
pub(crate) async fn start_mock_server(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// Runs a future and returns its output if it completes within `duration`.
/// Panics on timeout.
pub(crate) async fn should_not_timeout<F, T>(duration: Duration, future: F) -> T
where
    F: Future<Output = T>,
{
    match timeout(duration, future).await {
        Ok(output) => output,
        Err(_) => panic!("Timed out waiting after {duration:?}"),
    }
}

/// In memory secret store keyed by secret id. Counts calls, concurrency and fetches that were
/// dropped or cancelled before completing.
#[derive(Clone, Default)]
pub(crate) struct FakeFetcher {
    secrets: HashMap<String, (String, Bytes)>,
    delays: HashMap<String, Duration>,
    calls: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    aborted: Arc<AtomicUsize>,
}

impl FakeFetcher {
    pub(crate) fn with_secret(mut self, secret: &str, version: &str, data: &[u8]) -> Self {
        self.secrets.insert(
            secret.to_string(),
            (version.to_string(), Bytes::copy_from_slice(data)),
        );
        self
    }

    pub(crate) fn with_delay(mut self, secret: &str, delay: Duration) -> Self {
        self.delays.insert(secret.to_string(), delay);
        self
    }

    pub(crate) fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    pub(crate) fn max_in_flight(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.max_in_flight)
    }

    pub(crate) fn in_flight(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.in_flight)
    }

    pub(crate) fn aborted(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.aborted)
    }
}

struct InFlightGuard {
    in_flight: Arc<AtomicUsize>,
    aborted: Arc<AtomicUsize>,
    completed: bool,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if !self.completed {
            self.aborted.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl SecretFetcher for FakeFetcher {
    async fn fetch(
        &self,
        name: &ResourceName,
        _credentials: &Credentials,
        cln_token: &CancellationToken,
    ) -> Result<SecretPayload> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let mut guard = InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            aborted: Arc::clone(&self.aborted),
            completed: false,
        };

        if let Some(delay) = self.delays.get(name.secret()) {
            tokio::select! {
                _ = cln_token.cancelled() => {
                    return Err(Error::Cancelled(format!("fetch of {name} cancelled")));
                }
                _ = tokio::time::sleep(*delay) => {}
            }
        }

        let result = match self.secrets.get(name.secret()) {
            Some((version, data)) => Ok(SecretPayload {
                data: data.clone(),
                version: version.clone(),
            }),
            None => Err(Error::NotFound(format!("{name} not found"))),
        };
        guard.completed = true;
        result
    }
}

/// Resolves a fixed token, or denies every pod.
#[derive(Clone, Default)]
pub(crate) struct FakeResolver {
    deny: bool,
    calls: Arc<AtomicUsize>,
}

impl FakeResolver {
    pub(crate) fn denied() -> Self {
        Self {
            deny: true,
            ..Default::default()
        }
    }

    pub(crate) fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl CredentialResolver for FakeResolver {
    async fn resolve(
        &self,
        pod: &PodIdentity,
        _overrides: &AuthOverrides,
        _cln_token: &CancellationToken,
    ) -> Result<Credentials> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.deny {
            return Err(Error::PermissionDenied(format!(
                "{}/{} has no access",
                pod.namespace, pod.service_account
            )));
        }
        Ok(Credentials::new("token"))
    }
}
