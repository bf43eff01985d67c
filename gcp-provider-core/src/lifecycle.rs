//! Owns the unix domain socket the driver connects to and moves the provider through
//! `Initializing -> Listening -> Draining -> Stopped`.
//!
//! The shutdown token unlinks the socket, so no new connections are accepted, and starts
//! draining. In-flight calls get `drain_timeout` to finish, after which the abort token is
//! cancelled and whatever is still running returns `Cancelled`.

use crate::error::{Error, Result};
use gcp_provider_pb::provider::v1alpha1::csi_driver_provider_server::{
    CsiDriverProvider, CsiDriverProviderServer,
};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{info, warn};

/// How long aborted calls get to return before the server is torn down.
const ABORT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Initializing,
    Listening,
    Draining,
    Stopped,
}

pub struct LifecycleManager {
    socket_path: PathBuf,
    drain_timeout: Duration,
    state: watch::Sender<LifecycleState>,
}

impl LifecycleManager {
    pub fn new(socket_path: impl Into<PathBuf>, drain_timeout: Duration) -> Self {
        let (state, _) = watch::channel(LifecycleState::Initializing);
        Self {
            socket_path: socket_path.into(),
            drain_timeout,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Transitions only ever move forward.
    fn advance(&self, next: LifecycleState) {
        self.state.send_if_modified(|state| {
            if next > *state {
                *state = next;
                true
            } else {
                false
            }
        });
    }

    /// Serves `service` on the socket until `shutdown` is cancelled and the drain is over.
    /// Fails with [`Error::Unavailable`] when the socket cannot be bound.
    pub async fn serve<S>(
        &self,
        service: S,
        shutdown: CancellationToken,
        abort: CancellationToken,
    ) -> Result<()>
    where
        S: CsiDriverProvider,
    {
        let listener = match bind(&self.socket_path).await {
            Ok(listener) => listener,
            Err(e) => {
                self.advance(LifecycleState::Stopped);
                return Err(e);
            }
        };

        self.advance(LifecycleState::Listening);
        info!(socket_path = ?self.socket_path, "Listening for the CSI driver");

        let drain_started = async {
            shutdown.cancelled().await;
            // tonic keeps the listener open until the drain is over, unlinking refuses new clients
            remove_socket(&self.socket_path).await;
            self.advance(LifecycleState::Draining);
            info!(drain_timeout = ?self.drain_timeout, "Shutdown requested, draining in-flight calls");
        };

        let server = Server::builder()
            .add_service(CsiDriverProviderServer::new(service))
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), drain_started);
        tokio::pin!(server);

        let drain_expired = async {
            shutdown.cancelled().await;
            tokio::time::sleep(self.drain_timeout).await;
        };

        let result = tokio::select! {
            result = &mut server => result,
            _ = drain_expired => {
                warn!("Drain timeout reached, aborting in-flight calls");
                abort.cancel();
                match tokio::time::timeout(ABORT_GRACE, &mut server).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("Aborted calls did not return in time, closing connections");
                        Ok(())
                    }
                }
            }
        };

        self.advance(LifecycleState::Stopped);
        remove_socket(&self.socket_path).await;
        info!("Provider stopped");

        result.map_err(|e| Error::Internal(format!("gRPC server failed: {e}")))
    }
}

/// Binds the socket. A leftover socket file is removed, unless another process is still
/// listening on it.
async fn bind(socket_path: &Path) -> Result<UnixListener> {
    if tokio::fs::symlink_metadata(socket_path).await.is_ok() {
        if UnixStream::connect(socket_path).await.is_ok() {
            return Err(Error::Unavailable(format!(
                "socket {} is in use by another process",
                socket_path.display()
            )));
        }
        warn!(?socket_path, "Removing stale socket");
        match tokio::fs::remove_file(socket_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::Unavailable(format!(
                    "failed to remove stale socket {}: {e}",
                    socket_path.display()
                )));
            }
        }
    }

    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            Error::Unavailable(format!(
                "failed to create socket directory {}: {e}",
                parent.display()
            ))
        })?;
    }

    UnixListener::bind(socket_path).map_err(|e| {
        Error::Unavailable(format!(
            "failed to bind socket {}: {e}",
            socket_path.display()
        ))
    })
}

async fn remove_socket(socket_path: &Path) {
    match tokio::fs::remove_file(socket_path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(?socket_path, error = %e, "Failed to remove socket"),
    }
}
