//! The `v1alpha1.CSIDriverProvider` gRPC service.

use crate::auth::CredentialResolver;
use crate::config::{PROVIDER_API_VERSION, RUNTIME_NAME};
use crate::error::Error;
use crate::mount::MountProcessor;
use crate::secretmanager::SecretFetcher;
use gcp_provider_pb::provider::v1alpha1::csi_driver_provider_server::CsiDriverProvider;
use gcp_provider_pb::provider::v1alpha1::{
    MountRequest, MountResponse, VersionRequest, VersionResponse,
};
use std::result::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, warn};

/// Serves `Mount` and `Version`. Each Mount call runs under its own deadline and cancellation
/// token, a child of the token the lifecycle cancels when draining runs out of time.
pub struct ProviderService<R, F> {
    processor: Arc<MountProcessor<R, F>>,
    runtime_version: String,
    mount_timeout: Duration,
    cln_token: CancellationToken,
}

impl<R, F> ProviderService<R, F> {
    pub fn new(
        processor: MountProcessor<R, F>,
        runtime_version: impl Into<String>,
        mount_timeout: Duration,
        cln_token: CancellationToken,
    ) -> Self {
        Self {
            processor: Arc::new(processor),
            runtime_version: runtime_version.into(),
            mount_timeout,
            cln_token,
        }
    }
}

#[tonic::async_trait]
impl<R, F> CsiDriverProvider for ProviderService<R, F>
where
    R: CredentialResolver + Send + Sync + 'static,
    F: SecretFetcher + Send + Sync + 'static,
{
    async fn version(
        &self,
        request: Request<VersionRequest>,
    ) -> Result<Response<VersionResponse>, Status> {
        debug!(driver_version = request.get_ref().version, "Received Version");
        Ok(Response::new(VersionResponse {
            version: PROVIDER_API_VERSION.to_string(),
            runtime_name: RUNTIME_NAME.to_string(),
            runtime_version: self.runtime_version.clone(),
        }))
    }

    async fn mount(&self, request: Request<MountRequest>) -> Result<Response<MountResponse>, Status> {
        let request = request.into_inner();

        // cancelled when the call returns, also when the caller went away and tonic dropped us
        let call_token = self.cln_token.child_token();
        let _cancel_on_drop = call_token.clone().drop_guard();

        let result = tokio::time::timeout(
            self.mount_timeout,
            self.processor.mount(&request, &call_token),
        )
        .await
        .unwrap_or_else(|_| {
            Err(Error::DeadlineExceeded(format!(
                "mount did not complete within {:?}",
                self.mount_timeout
            )))
        });

        match result {
            Ok(response) => Ok(Response::new(response)),
            Err(error) => {
                warn!(%error, "Mount failed");
                Err(error.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::MountProcessor;
    use crate::test_utils::{FakeFetcher, FakeResolver, should_not_timeout};
    use std::sync::atomic::Ordering;
    use tonic::Code;

    fn mount_request(secrets: serde_json::Value) -> MountRequest {
        MountRequest {
            attributes: serde_json::json!({
                "secrets": secrets.to_string(),
                "csi.storage.k8s.io/pod.namespace": "default",
                "csi.storage.k8s.io/pod.name": "app-0",
                "csi.storage.k8s.io/pod.uid": "1234-5678",
                "csi.storage.k8s.io/serviceAccount.name": "app",
            })
            .to_string(),
            secrets: String::new(),
            target_path: "/var/lib/kubelet/pods/1234-5678/volumes/secrets".to_string(),
            permission: String::new(),
            current_object_version: vec![],
        }
    }

    fn service(
        resolver: FakeResolver,
        fetcher: FakeFetcher,
        mount_timeout: Duration,
    ) -> ProviderService<FakeResolver, FakeFetcher> {
        ProviderService::new(
            MountProcessor::new(resolver, fetcher, 8, 0o400),
            "1.2.3",
            mount_timeout,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_version() {
        let service = service(
            FakeResolver::default(),
            FakeFetcher::default(),
            Duration::from_secs(1),
        );
        for _ in 0..2 {
            let response = service
                .version(Request::new(VersionRequest {
                    version: "v1alpha1".to_string(),
                }))
                .await
                .unwrap()
                .into_inner();
            assert_eq!(response.version, "v1alpha1");
            assert_eq!(response.runtime_name, "secrets-store-csi-driver-provider-gcp");
            assert_eq!(response.runtime_version, "1.2.3");
        }
    }

    #[tokio::test]
    async fn test_mount() {
        let service = service(
            FakeResolver::default(),
            FakeFetcher::default().with_secret("s1", "3", b"hello"),
            Duration::from_secs(1),
        );
        let response = service
            .mount(Request::new(mount_request(serde_json::json!([
                {"resourceName": "projects/p/secrets/s1/versions/latest", "fileName": "s1.txt"},
            ]))))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.files.len(), 1);
        assert_eq!(response.files[0].contents, b"hello");
        assert_eq!(response.files[0].mode, 256);
        assert_eq!(response.object_version[0].version, "3");
    }

    #[tokio::test]
    async fn test_deadline_cancels_fetches() {
        let fetcher = FakeFetcher::default()
            .with_secret("fast", "1", b"x")
            .with_secret("slow", "1", b"x")
            .with_delay("slow", Duration::from_secs(60));
        let in_flight = fetcher.in_flight();
        let aborted = fetcher.aborted();
        let service = service(FakeResolver::default(), fetcher, Duration::from_millis(50));
        let request = mount_request(serde_json::json!([
            {"resourceName": "projects/p/secrets/fast", "fileName": "fast"},
            {"resourceName": "projects/p/secrets/slow", "fileName": "slow"},
        ]));

        for round in 1..=3 {
            let status = should_not_timeout(
                Duration::from_secs(5),
                service.mount(Request::new(request.clone())),
            )
            .await
            .unwrap_err();
            assert_eq!(status.code(), Code::DeadlineExceeded);
            assert_eq!(in_flight.load(Ordering::SeqCst), 0);
            assert_eq!(aborted.load(Ordering::SeqCst), round);
        }
    }

    #[tokio::test]
    async fn test_abort_token_cancels_mount() {
        let fetcher = FakeFetcher::default()
            .with_secret("slow", "1", b"x")
            .with_delay("slow", Duration::from_secs(60));
        let aborted = fetcher.aborted();
        let cln_token = CancellationToken::new();
        let service = ProviderService::new(
            MountProcessor::new(FakeResolver::default(), fetcher, 8, 0o400),
            "1.2.3",
            Duration::from_secs(30),
            cln_token.clone(),
        );

        let abort = cln_token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            abort.cancel();
        });

        let status = should_not_timeout(
            Duration::from_secs(5),
            service.mount(Request::new(mount_request(serde_json::json!([
                {"resourceName": "projects/p/secrets/slow", "fileName": "slow"},
            ])))),
        )
        .await
        .unwrap_err();
        assert_eq!(status.code(), Code::Cancelled);
        assert_eq!(aborted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let cases = [
            (
                FakeResolver::default(),
                serde_json::json!([{"resourceName": "projects/p/secrets/s1", "fileName": "../s1"}]),
                Code::InvalidArgument,
            ),
            (
                FakeResolver::default(),
                serde_json::json!([]),
                Code::InvalidArgument,
            ),
            (
                FakeResolver::default(),
                serde_json::json!([{"resourceName": "projects/p/secrets/missing", "fileName": "m"}]),
                Code::NotFound,
            ),
            (
                FakeResolver::denied(),
                serde_json::json!([{"resourceName": "projects/p/secrets/s1", "fileName": "s1"}]),
                Code::PermissionDenied,
            ),
        ];

        for (resolver, secrets, code) in cases {
            let service = service(
                resolver,
                FakeFetcher::default().with_secret("s1", "1", b"x"),
                Duration::from_secs(1),
            );
            let status = service
                .mount(Request::new(mount_request(secrets)))
                .await
                .unwrap_err();
            assert_eq!(status.code(), code);
        }
    }

    #[tokio::test]
    async fn test_empty_target_path() {
        let service = service(
            FakeResolver::default(),
            FakeFetcher::default().with_secret("s1", "1", b"x"),
            Duration::from_secs(1),
        );
        let mut request = mount_request(serde_json::json!([
            {"resourceName": "projects/p/secrets/s1", "fileName": "s1"},
        ]));
        request.target_path = String::new();
        let status = service.mount(Request::new(request)).await.unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }
}
