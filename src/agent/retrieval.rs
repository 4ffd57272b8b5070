//! Per-request orchestration: authenticate, then fetch.
//!
//! A request walks `Start -> Authenticating -> Fetching -> Responding -> Done`.
//! A failure while authenticating or fetching ends the walk with the matching
//! [`RetrievalError`]; nothing is retried here.
use anyhow::Result;
use thiserror::Error;
use tracing::debug;

use crate::agent::config::{Config, TokenSource};
use crate::security::errors::{AuthError, FetchError};
use crate::security::secret_fetcher::{SecretFetcher, SecretPayload};
use crate::security::token_cache::{SessionToken, TokenCache};
use crate::security::token_exchange::TokenExchanger;
use crate::security::vault_client::VaultClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalStage {
    Start,
    Authenticating,
    Fetching,
    Responding,
    Done,
}

impl std::fmt::Display for RetrievalStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RetrievalStage::Start => "start",
            RetrievalStage::Authenticating => "authenticating",
            RetrievalStage::Fetching => "fetching",
            RetrievalStage::Responding => "responding",
            RetrievalStage::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error)]
pub enum RetrievalError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("secret fetch failed: {0}")]
    Fetch(#[from] FetchError),
}

impl RetrievalError {
    /// Stage the request was in when it failed.
    pub fn stage(&self) -> RetrievalStage {
        match self {
            RetrievalError::Auth(_) => RetrievalStage::Authenticating,
            RetrievalError::Fetch(_) => RetrievalStage::Fetching,
        }
    }
}

/// Shared, clonable handle wiring the token cache to the exchanger and fetcher.
#[derive(Debug, Clone)]
pub struct SecretRetriever {
    source: TokenSource,
    exchanger: TokenExchanger,
    cache: TokenCache,
    fetcher: SecretFetcher,
    default_secret_path: String,
    user_secret_prefix: String,
}

impl SecretRetriever {
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = VaultClient::from_config(config)?;

        let cache = match &config.token_source {
            TokenSource::Static(token) => {
                TokenCache::seeded(SessionToken::non_expiring(token.clone()), config.renew_margin)
            }
            TokenSource::Exchange { .. } => TokenCache::new(config.renew_margin),
        };

        Ok(Self {
            source: config.token_source.clone(),
            exchanger: TokenExchanger::new(client.clone(), config.auth_method.clone()),
            cache,
            fetcher: SecretFetcher::new(client, config.kv_mount.clone()),
            default_secret_path: config.default_secret_path.clone(),
            user_secret_prefix: config.user_secret_prefix.clone(),
        })
    }

    pub fn token_source_kind(&self) -> &'static str {
        self.source.kind()
    }

    pub fn token_cache(&self) -> &TokenCache {
        &self.cache
    }

    pub fn default_secret_path(&self) -> &str {
        &self.default_secret_path
    }

    /// `<prefix>/<user_id>`; the caller validates `user_id`.
    pub fn user_secret_path(&self, user_id: &str) -> String {
        format!("{}/{}", self.user_secret_prefix, user_id)
    }

    /// Current session token, exchanging a fresh one when the cache needs it.
    pub async fn session_token(&self) -> Result<SessionToken, AuthError> {
        self.cache
            .get(|| async {
                match &self.source {
                    TokenSource::Exchange { token_path, role } => {
                        self.exchanger.exchange_from_file(role, token_path).await
                    }
                    TokenSource::Static(token) => Ok(SessionToken::non_expiring(token.clone())),
                }
            })
            .await
    }

    /// Run the authenticate/fetch stages for `path`.
    pub async fn retrieve(&self, path: &str) -> Result<SecretPayload, RetrievalError> {
        debug!(stage = %RetrievalStage::Authenticating, path = %path, "resolving session token");
        let token = self.session_token().await?;

        debug!(stage = %RetrievalStage::Fetching, path = %path, "reading secret");
        let payload = self.fetcher.fetch(path, token.value()).await?;

        debug!(stage = %RetrievalStage::Responding, path = %path, keys = payload.data.len(), "secret ready");
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn config(base_url: String, token_source: TokenSource) -> Config {
        Config {
            vault_addr: base_url,
            port: 0,
            token_source,
            auth_method: "kubernetes".to_string(),
            kv_mount: "secret".to_string(),
            default_secret_path: "creds".to_string(),
            user_secret_prefix: "users".to_string(),
            request_timeout: Duration::from_secs(5),
            renew_margin: Duration::from_secs(30),
        }
    }

    fn secret_body() -> String {
        json!({"data": {"data": {"password": "Hashi123"}, "metadata": {"version": 1}}}).to_string()
    }

    #[tokio::test]
    async fn test_static_source_skips_login() {
        let mut server = Server::new_async().await;
        let login = server
            .mock("POST", "/v1/auth/kubernetes/login")
            .expect(0)
            .create_async()
            .await;
        let secret = server
            .mock("GET", "/v1/secret/data/creds")
            .match_header("X-Vault-Token", Matcher::Exact("dev-only-token".into()))
            .with_status(200)
            .with_body(secret_body())
            .create_async()
            .await;

        let retriever = SecretRetriever::from_config(&config(
            server.url(),
            TokenSource::Static("dev-only-token".to_string()),
        ))
        .unwrap();
        let payload = retriever.retrieve("creds").await.unwrap();

        assert_eq!(payload.data["password"], json!("Hashi123"));
        assert_eq!(retriever.token_source_kind(), "static");
        login.assert_async().await;
        secret.assert_async().await;
    }

    #[tokio::test]
    async fn test_exchange_source_logs_in_once() {
        let mut identity = NamedTempFile::new().unwrap();
        writeln!(identity, "sa-jwt").unwrap();

        let mut server = Server::new_async().await;
        let login = server
            .mock("POST", "/v1/auth/kubernetes/login")
            .match_body(Matcher::Json(json!({"role": "go-app-role", "jwt": "sa-jwt"})))
            .with_status(200)
            .with_body(
                json!({"auth": {"client_token": "hvs.session", "lease_duration": 3600, "renewable": true}})
                    .to_string(),
            )
            .expect(1)
            .create_async()
            .await;
        let secret = server
            .mock("GET", "/v1/secret/data/creds")
            .match_header("X-Vault-Token", Matcher::Exact("hvs.session".into()))
            .with_status(200)
            .with_body(secret_body())
            .expect(2)
            .create_async()
            .await;

        let retriever = SecretRetriever::from_config(&config(
            server.url(),
            TokenSource::Exchange {
                token_path: identity.path().to_path_buf(),
                role: "go-app-role".to_string(),
            },
        ))
        .unwrap();

        retriever.retrieve("creds").await.unwrap();
        retriever.retrieve("creds").await.unwrap();

        login.assert_async().await;
        secret.assert_async().await;
    }

    #[tokio::test]
    async fn test_auth_failure_stops_before_fetch() {
        let mut server = Server::new_async().await;
        let secret = server
            .mock("GET", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let retriever = SecretRetriever::from_config(&config(
            server.url(),
            TokenSource::Exchange {
                token_path: PathBuf::from("/nonexistent/token"),
                role: "go-app-role".to_string(),
            },
        ))
        .unwrap();
        let err = retriever.retrieve("creds").await.unwrap_err();

        assert_eq!(err.stage(), RetrievalStage::Authenticating);
        assert!(matches!(err, RetrievalError::Auth(AuthError::IdentityRead { .. })));
        secret.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_failure_reports_fetching_stage() {
        let mut server = Server::new_async().await;
        let _secret = server
            .mock("GET", "/v1/secret/data/users/u-1")
            .with_status(403)
            .create_async()
            .await;

        let retriever = SecretRetriever::from_config(&config(
            server.url(),
            TokenSource::Static("t".to_string()),
        ))
        .unwrap();
        let path = retriever.user_secret_path("u-1");
        let err = retriever.retrieve(&path).await.unwrap_err();

        assert_eq!(path, "users/u-1");
        assert_eq!(err.stage(), RetrievalStage::Fetching);
        assert!(matches!(err, RetrievalError::Fetch(FetchError::PermissionDenied { .. })));
    }
}
