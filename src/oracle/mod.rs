//! User identity and organization lookups
//!
//! The platform's user API answers who a caller is, whether they are an
//! admin, and which organizations they belong to. Calls forward the caller's
//! own credentials; this crate never holds user secrets beyond one request.

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::Error;

/// Header carrying a platform API key
pub const API_KEY_HEADER: &str = "X-Domino-Api-Key";

/// Caller credentials forwarded to the user API
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Full `Authorization` header value (e.g. `Bearer <token>`)
    Authorization(String),
    /// Platform API key
    ApiKey(String),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Authorization(_) => f.write_str("Credentials::Authorization(..)"),
            Credentials::ApiKey(_) => f.write_str("Credentials::ApiKey(..)"),
        }
    }
}

/// Authenticated caller as reported by the user API
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    /// Canonical user id, matching the starting-user pod label
    pub canonical_id: String,
    /// Whether the caller is a platform admin
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Deserialize)]
struct Organization {
    name: String,
}

/// Trait abstracting the user API
///
/// Allows mocking user lookups in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentityOracle: Send + Sync {
    /// Resolve the caller's principal
    async fn principal(&self, credentials: &Credentials) -> Result<Principal, Error>;

    /// Names of the organizations the caller belongs to
    async fn organizations(&self, credentials: &Credentials) -> Result<Vec<String>, Error>;
}

/// User API client over HTTP
pub struct HttpIdentityOracle {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpIdentityOracle {
    /// Create a client for the user API at `base_url`
    pub fn new(base_url: impl Into<String>) -> Result<Self, Error> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        credentials: &Credentials,
    ) -> Result<T, Error> {
        let request = self.http_client.get(self.url(path));
        let request = match credentials {
            Credentials::Authorization(value) => {
                request.header(reqwest::header::AUTHORIZATION, value)
            }
            Credentials::ApiKey(key) => request.header(API_KEY_HEADER, key),
        };

        let response = request
            .send()
            .await
            .map_err(|e| Error::oracle(format!("GET {} failed: {}", path, e)))?;

        match response.status() {
            StatusCode::OK => response
                .json::<T>()
                .await
                .map_err(|e| Error::oracle(format!("invalid response from {}: {}", path, e))),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::unauthorized(
                format!("user API rejected credentials for {}", path),
            )),
            status => Err(Error::oracle(format!("GET {} returned {}", path, status))),
        }
    }
}

#[async_trait]
impl IdentityOracle for HttpIdentityOracle {
    async fn principal(&self, credentials: &Credentials) -> Result<Principal, Error> {
        let principal: Principal = self.get_json("/v4/auth/principal", credentials).await?;
        debug!(
            user_id = %principal.canonical_id,
            admin = principal.is_admin,
            "Resolved principal"
        );
        Ok(principal)
    }

    async fn organizations(&self, credentials: &Credentials) -> Result<Vec<String>, Error> {
        let orgs: Vec<Organization> = self
            .get_json("/v4/organizations/self", credentials)
            .await?;
        Ok(orgs.into_iter().map(|o| o.name).collect())
    }
}
