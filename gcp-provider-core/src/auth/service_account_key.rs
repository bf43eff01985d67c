//! Google service account keys, exchanged for an access token with the JWT-bearer grant.

use crate::auth::{Credentials, TokenResponse};
use crate::error::{Error, Result, api_error};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::fmt;

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;

#[derive(Deserialize)]
pub(crate) struct ServiceAccountKey {
    #[serde(rename = "type")]
    key_type: String,
    client_email: String,
    private_key: String,
    #[serde(default)]
    private_key_id: Option<String>,
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

impl ServiceAccountKey {
    pub(crate) fn parse(json: &str) -> Result<Self> {
        let key: ServiceAccountKey = serde_json::from_str(json)
            .map_err(|e| Error::InvalidArgument(format!("malformed service account key: {e}")))?;
        if key.key_type != "service_account" {
            return Err(Error::InvalidArgument(format!(
                "unsupported credential type {:?}, expected service_account",
                key.key_type
            )));
        }
        Ok(key)
    }

    pub(crate) fn client_email(&self) -> &str {
        &self.client_email
    }

    /// Signed RS256 assertion for the token endpoint `audience`.
    fn assertion(&self, audience: &str, scope: &str, now: i64) -> Result<String> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.private_key_id.clone();

        let claims = Claims {
            iss: &self.client_email,
            scope,
            aud: audience,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };

        let key = EncodingKey::from_rsa_pem(self.private_key.as_bytes()).map_err(|e| {
            Error::InvalidArgument(format!("invalid service account private key: {e}"))
        })?;

        jsonwebtoken::encode(&header, &claims, &key)
            .map_err(|e| Error::Internal(format!("failed to sign assertion: {e}")))
    }

    /// Exchanges a self-signed assertion for an access token at `token_endpoint`.
    pub(crate) async fn exchange(
        &self,
        http: &reqwest::Client,
        token_endpoint: &str,
        scope: &str,
    ) -> Result<Credentials> {
        let assertion = self.assertion(token_endpoint, scope, chrono::Utc::now().timestamp())?;

        let response = http
            .post(token_endpoint)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", &assertion)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(api_error("oauth2", status, &body));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("malformed oauth2 token response: {e}")))?;
        Ok(Credentials::new(token.access_token))
    }
}
