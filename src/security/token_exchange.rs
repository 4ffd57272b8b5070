use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::security::errors::{AuthError, Stage, TransportError};
use crate::security::identity::{read_identity_token, IdentityToken};
use crate::security::token_cache::SessionToken;
use crate::security::vault_client::{error_body, read_body_capped, VaultClient, MAX_RESPONSE_BODY};

#[derive(Serialize)]
struct LoginPayload<'a> {
    role: &'a str,
    jwt: &'a str,
}

/// Envelope returned by `POST /v1/auth/<method>/login`.
#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub lease_id: String,
    #[serde(default)]
    pub renewable: bool,
    #[serde(default)]
    pub lease_duration: u64,
    #[serde(default)]
    pub warnings: Option<Vec<String>>,
    pub auth: Option<LoginAuth>,
}

#[derive(Debug, Deserialize)]
pub struct LoginAuth {
    #[serde(default)]
    pub client_token: String,
    #[serde(default)]
    pub accessor: Option<String>,
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default)]
    pub token_policies: Vec<String>,
    #[serde(default)]
    pub metadata: Option<LoginMetadata>,
    #[serde(default)]
    pub lease_duration: u64,
    #[serde(default)]
    pub renewable: bool,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub orphan: bool,
    #[serde(default)]
    pub num_uses: u64,
}

/// Identity details Kubernetes auth attaches to the issued token.
#[derive(Debug, Default, Deserialize)]
pub struct LoginMetadata {
    pub role: Option<String>,
    pub service_account_name: Option<String>,
    pub service_account_namespace: Option<String>,
    pub service_account_secret_name: Option<String>,
    pub service_account_uid: Option<String>,
}

impl LoginResponse {
    /// Validate the auth block and turn it into a session token.
    pub fn into_session_token(self) -> Result<SessionToken, AuthError> {
        let auth = self
            .auth
            .ok_or_else(|| AuthError::Malformed("auth object missing".to_string()))?;

        if auth.client_token.trim().is_empty() {
            return Err(AuthError::Malformed(
                "auth.client_token missing or empty".to_string(),
            ));
        }
        if auth.lease_duration == 0 {
            return Err(AuthError::Malformed(
                "auth.lease_duration must be positive".to_string(),
            ));
        }

        Ok(SessionToken::with_lease(
            auth.client_token,
            Duration::from_secs(auth.lease_duration),
            auth.renewable,
        )
        .with_accessor(auth.accessor)
        .with_policies(auth.policies))
    }
}

/// Trades a platform identity token for a Vault session token.
///
/// Stateless: every call performs one login request. Caching belongs to
/// [`crate::security::token_cache::TokenCache`].
#[derive(Debug, Clone)]
pub struct TokenExchanger {
    client: VaultClient,
    auth_method: String,
}

impl TokenExchanger {
    pub fn new(client: VaultClient, auth_method: impl Into<String>) -> Self {
        Self {
            client,
            auth_method: auth_method.into().trim_matches('/').to_string(),
        }
    }

    fn login_url(&self) -> String {
        self.client
            .api_url(&format!("auth/{}/login", self.auth_method))
    }

    /// Log in as `role` with the given identity token.
    pub async fn exchange(
        &self,
        role: &str,
        identity: &IdentityToken,
    ) -> Result<SessionToken, AuthError> {
        let url = self.login_url();
        debug!(role = %role, "Logging in to Vault: {}", url);

        let payload = LoginPayload {
            role,
            jwt: identity.as_str(),
        };

        let response = self
            .client
            .http()
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(Stage::Login, &e))?;

        let status = response.status();
        if status == reqwest::StatusCode::FORBIDDEN {
            let body = error_body(response).await;
            warn!(role = %role, status = status.as_u16(), "Vault login permission denied");
            return Err(AuthError::PermissionDenied {
                status: status.as_u16(),
                body,
            });
        }
        if !status.is_success() {
            let body = error_body(response).await;
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let raw = read_body_capped(response, MAX_RESPONSE_BODY, Stage::Login)
            .await?
            .ok_or_else(|| {
                AuthError::Malformed(format!("login body exceeds {MAX_RESPONSE_BODY} bytes"))
            })?;
        let login: LoginResponse = serde_json::from_slice(&raw)
            .map_err(|e| AuthError::Malformed(format!("undecodable body: {e}")))?;

        let token = login.into_session_token()?;
        info!(
            role = %role,
            renewable = token.renewable(),
            expires_at = ?token.expires_at(),
            "Vault login succeeded"
        );
        Ok(token)
    }

    /// Read the identity token from `token_path`, then log in.
    pub async fn exchange_from_file(
        &self,
        role: &str,
        token_path: &Path,
    ) -> Result<SessionToken, AuthError> {
        let identity = read_identity_token(token_path).await?;
        self.exchange(role, &identity).await
    }
}
