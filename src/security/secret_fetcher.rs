use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::security::errors::{FetchError, Stage, TransportError};
use crate::security::vault_client::{
    error_body, read_body_capped, VaultClient, MAX_RESPONSE_BODY, VAULT_TOKEN_HEADER,
};

/// KV v2 read envelope: `GET /v1/<mount>/data/<path>`.
///
/// `data.data` is required and must be an object; anything else is a
/// schema mismatch rather than an empty secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvReadResponse {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub lease_id: String,
    #[serde(default)]
    pub renewable: bool,
    #[serde(default)]
    pub lease_duration: u64,
    pub data: KvData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvData {
    pub data: BTreeMap<String, Value>,
    #[serde(default)]
    pub metadata: Option<SecretMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretMetadata {
    #[serde(default)]
    pub created_time: Option<String>,
    #[serde(default)]
    pub deletion_time: Option<String>,
    #[serde(default)]
    pub destroyed: bool,
    #[serde(default)]
    pub version: Option<u64>,
}

/// A secret as read for one request. Never stored.
#[derive(Clone)]
pub struct SecretPayload {
    pub data: BTreeMap<String, Value>,
    pub lease_duration: Duration,
    pub renewable: bool,
    pub request_id: String,
    pub lease_id: String,
    pub metadata: Option<SecretMetadata>,
}

impl std::fmt::Debug for SecretPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretPayload")
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .field("lease_duration", &self.lease_duration)
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl From<KvReadResponse> for SecretPayload {
    fn from(resp: KvReadResponse) -> Self {
        Self {
            data: resp.data.data,
            lease_duration: Duration::from_secs(resp.lease_duration),
            renewable: resp.renewable,
            request_id: resp.request_id,
            lease_id: resp.lease_id,
            metadata: resp.data.metadata,
        }
    }
}

impl SecretPayload {
    /// `key:value ` for every pair, ordered by key.
    ///
    /// String values are written bare; other JSON values in their JSON form.
    pub fn render_pairs(&self) -> String {
        self.data
            .iter()
            .map(|(key, value)| match value {
                Value::String(s) => format!("{key}:{s} "),
                other => format!("{key}:{other} "),
            })
            .collect()
    }

    /// The secret in the service's KV v2 envelope shape.
    pub fn to_envelope(&self) -> KvReadResponse {
        KvReadResponse {
            request_id: self.request_id.clone(),
            lease_id: self.lease_id.clone(),
            renewable: self.renewable,
            lease_duration: self.lease_duration.as_secs(),
            data: KvData {
                data: self.data.clone(),
                metadata: self.metadata.clone(),
            },
        }
    }
}

/// Reads KV v2 secrets with an already-issued session token.
#[derive(Debug, Clone)]
pub struct SecretFetcher {
    client: VaultClient,
    mount: String,
}

impl SecretFetcher {
    pub fn new(client: VaultClient, mount: impl Into<String>) -> Self {
        Self {
            client,
            mount: mount.into().trim_matches('/').to_string(),
        }
    }

    fn secret_url(&self, path: &str) -> String {
        self.client
            .api_url(&format!("{}/data/{}", self.mount, path))
    }

    /// Fetch the secret stored at `path` under the configured mount.
    pub async fn fetch(&self, path: &str, session_token: &str) -> Result<SecretPayload, FetchError> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return Err(FetchError::InvalidPath("secret path is empty".to_string()));
        }

        let url = self.secret_url(path);
        debug!("Fetching secret from Vault: {}", url);

        let response = self
            .client
            .http()
            .get(&url)
            .header(VAULT_TOKEN_HEADER, session_token)
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(Stage::SecretRead, &e))?;

        let status = response.status();
        if status == reqwest::StatusCode::FORBIDDEN {
            let body = error_body(response).await;
            warn!(path = %path, "Vault denied secret read");
            return Err(FetchError::PermissionDenied {
                status: status.as_u16(),
                body,
            });
        }
        if !status.is_success() {
            let body = error_body(response).await;
            return Err(FetchError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let raw = read_body_capped(response, MAX_RESPONSE_BODY, Stage::SecretRead)
            .await?
            .ok_or_else(|| {
                FetchError::SchemaMismatch(format!("secret body exceeds {MAX_RESPONSE_BODY} bytes"))
            })?;
        let kv: KvReadResponse =
            serde_json::from_slice(&raw).map_err(|e| FetchError::SchemaMismatch(e.to_string()))?;

        let payload = SecretPayload::from(kv);
        debug!(
            path = %path,
            keys = payload.data.len(),
            version = ?payload.metadata.as_ref().and_then(|m| m.version),
            "secret fetched"
        );
        Ok(payload)
    }
}
