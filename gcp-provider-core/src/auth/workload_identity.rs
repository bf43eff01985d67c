//! Workload identity: a Kubernetes service account token is exchanged at STS for a federated
//! token, which is used as is or to impersonate the Google service account the Kubernetes
//! service account is annotated with.

use crate::auth::{Credentials, PodIdentity};
use crate::error::{Error, Result, api_error};
use k8s_openapi::api::authentication::v1::{BoundObjectReference, TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::Api;
use kube::api::PostParams;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Annotation binding a Kubernetes service account to a Google service account.
const GSA_ANNOTATION: &str = "iam.gke.io/gcp-service-account";

const TOKEN_EXCHANGE_GRANT: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";
const JWT_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:jwt";
const KSA_TOKEN_EXPIRATION_SECS: i64 = 600;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StsRequest<'a> {
    grant_type: &'a str,
    audience: &'a str,
    scope: &'a str,
    requested_token_type: &'a str,
    subject_token: &'a str,
    subject_token_type: &'a str,
}

#[derive(Deserialize)]
struct StsResponse {
    access_token: String,
}

#[derive(Serialize)]
struct GenerateAccessTokenRequest<'a> {
    scope: [&'a str; 1],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateAccessTokenResponse {
    access_token: String,
}

/// Requests a token for the pod's service account with the identity pool as audience, bound to
/// the pod so it is invalidated together with it.
pub(crate) async fn request_ksa_token(
    kube: &kube::Client,
    pod: &PodIdentity,
    audience: &str,
) -> Result<String> {
    let token_request = TokenRequest {
        metadata: Default::default(),
        spec: TokenRequestSpec {
            audiences: vec![audience.to_string()],
            expiration_seconds: Some(KSA_TOKEN_EXPIRATION_SECS),
            bound_object_ref: Some(BoundObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("Pod".to_string()),
                name: Some(pod.name.clone()),
                uid: Some(pod.uid.clone()),
            }),
        },
        status: None,
    };
    let data = serde_json::to_vec(&token_request)
        .map_err(|e| Error::Internal(format!("failed to encode token request: {e}")))?;

    let api: Api<ServiceAccount> = Api::namespaced(kube.clone(), &pod.namespace);
    let response: TokenRequest = api
        .create_subresource("token", &pod.service_account, &PostParams::default(), data)
        .await
        .map_err(|e| kube_error("token request", e))?;

    response
        .status
        .map(|status| status.token)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| {
            Error::PermissionDenied(format!(
                "empty token for service account {}/{}",
                pod.namespace, pod.service_account
            ))
        })
}

/// Google service account the pod's Kubernetes service account is bound to, if any.
pub(crate) async fn bound_gsa(kube: &kube::Client, pod: &PodIdentity) -> Result<Option<String>> {
    let api: Api<ServiceAccount> = Api::namespaced(kube.clone(), &pod.namespace);
    let service_account = api
        .get(&pod.service_account)
        .await
        .map_err(|e| kube_error("service account lookup", e))?;

    let gsa = service_account
        .metadata
        .annotations
        .and_then(|annotations| annotations.get(GSA_ANNOTATION).cloned())
        .filter(|gsa| !gsa.is_empty());
    debug!(
        namespace = pod.namespace,
        service_account = pod.service_account,
        ?gsa,
        "Resolved service account binding"
    );
    Ok(gsa)
}

/// Exchanges the Kubernetes service account token for a federated access token.
pub(crate) async fn exchange_at_sts(
    http: &reqwest::Client,
    sts_endpoint: &str,
    audience: &str,
    ksa_token: &str,
    scope: &str,
) -> Result<Credentials> {
    let request = StsRequest {
        grant_type: TOKEN_EXCHANGE_GRANT,
        audience,
        scope,
        requested_token_type: ACCESS_TOKEN_TYPE,
        subject_token: ksa_token,
        subject_token_type: JWT_TOKEN_TYPE,
    };

    let response = http
        .post(format!("{sts_endpoint}/v1/token"))
        .json(&request)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(api_error("sts", status, &body));
    }

    let token: StsResponse = response
        .json()
        .await
        .map_err(|e| Error::Internal(format!("malformed sts response: {e}")))?;
    Ok(Credentials::new(token.access_token))
}

/// Generates an access token for `gsa` using the federated token.
pub(crate) async fn impersonate(
    http: &reqwest::Client,
    iam_endpoint: &str,
    federated: &Credentials,
    gsa: &str,
    scope: &str,
) -> Result<Credentials> {
    let response = http
        .post(format!(
            "{iam_endpoint}/v1/projects/-/serviceAccounts/{gsa}:generateAccessToken"
        ))
        .bearer_auth(federated.token())
        .json(&GenerateAccessTokenRequest { scope: [scope] })
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(api_error("iamcredentials", status, &body));
    }

    let token: GenerateAccessTokenResponse = response
        .json()
        .await
        .map_err(|e| Error::Internal(format!("malformed generateAccessToken response: {e}")))?;
    Ok(Credentials::new(token.access_token))
}

fn kube_error(action: &str, error: kube::Error) -> Error {
    match error {
        kube::Error::Api(response) if response.code >= 500 => {
            Error::Transient(format!("{action} failed: {}", response.message))
        }
        kube::Error::Api(response) => {
            Error::PermissionDenied(format!("{action} failed: {}", response.message))
        }
        other => Error::Transient(format!("{action} failed: {other}")),
    }
}
