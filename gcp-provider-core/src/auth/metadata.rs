//! The GCE metadata server: the node's default service account token and the cluster attributes
//! the workload identity binding is derived from.

use crate::auth::{Credentials, TokenResponse};
use crate::config::IdentityBinding;
use crate::error::{Error, Result, api_error};
use reqwest::StatusCode;

const METADATA_FLAVOR_HEADER: &str = "Metadata-Flavor";
const METADATA_FLAVOR: &str = "Google";

pub(crate) struct MetadataClient<'a> {
    http: &'a reqwest::Client,
    endpoint: &'a str,
}

impl<'a> MetadataClient<'a> {
    pub(crate) fn new(http: &'a reqwest::Client, endpoint: &'a str) -> Self {
        Self { http, endpoint }
    }

    /// Access token of the node's default service account.
    pub(crate) async fn default_token(&self) -> Result<Credentials> {
        let response = self
            .get("instance/service-accounts/default/token")
            .await?
            .ok_or_else(|| {
                Error::PermissionDenied("node has no default service account".to_string())
            })?;
        let token: TokenResponse = serde_json::from_str(&response)
            .map_err(|e| Error::Internal(format!("malformed metadata token response: {e}")))?;
        Ok(Credentials::new(token.access_token))
    }

    /// Workload identity binding of the cluster the node belongs to. `None` when the node does
    /// not run in a cluster with workload identity.
    pub(crate) async fn identity_binding(&self) -> Result<Option<IdentityBinding>> {
        let Some(project) = self.get("project/project-id").await? else {
            return Ok(None);
        };
        let Some(cluster) = self.get("instance/attributes/cluster-name").await? else {
            return Ok(None);
        };
        let Some(location) = self.get("instance/attributes/cluster-location").await? else {
            return Ok(None);
        };

        Ok(Some(IdentityBinding {
            pool: format!("{}.svc.id.goog", project.trim()),
            provider: format!(
                "https://container.googleapis.com/v1/projects/{}/locations/{}/clusters/{}",
                project.trim(),
                location.trim(),
                cluster.trim()
            ),
        }))
    }

    /// GETs a metadata path, `None` when it does not exist.
    async fn get(&self, path: &str) -> Result<Option<String>> {
        let response = self
            .http
            .get(format!("{}/computeMetadata/v1/{path}", self.endpoint))
            .header(METADATA_FLAVOR_HEADER, METADATA_FLAVOR)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(api_error("metadata server", status, &body));
        }
        Ok(Some(body))
    }
}
