use anyhow::{Context, Result};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::agent::config::Config;
use crate::security::errors::{Stage, TransportError};

/// Header carrying the session token on every authenticated Vault call.
pub const VAULT_TOKEN_HEADER: &str = "X-Vault-Token";

/// Longest upstream error body kept for logs.
const MAX_ERROR_BODY: usize = 512;

/// Largest success body decoded from Vault.
pub(crate) const MAX_RESPONSE_BODY: usize = 1024 * 1024;

/// HTTP plumbing shared by the token exchanger and the secret fetcher.
///
/// Every request goes through a client built with a per-call timeout, so a
/// stalled upstream surfaces as a transport error instead of a hang.
#[derive(Debug, Clone)]
pub struct VaultClient {
    base_url: String,
    http_client: Client,
}

impl VaultClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .context("creating HTTP client")?;

        let base_url = base_url.trim_end_matches('/').to_string();
        debug!("Vault client initialized with base_url={}", base_url);

        Ok(VaultClient {
            base_url,
            http_client,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(&config.vault_addr, config.request_timeout)
    }

    /// Build `{base_url}/v1/{path}`.
    pub fn api_url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn http(&self) -> &Client {
        &self.http_client
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Drain a failed response body, bounded so a chatty upstream cannot flood logs.
pub(crate) async fn error_body(response: reqwest::Response) -> String {
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

/// Read a success body of at most `limit` bytes.
///
/// Returns `Ok(None)` as soon as the declared or received length passes the
/// limit; the rest of the body is never buffered.
pub(crate) async fn read_body_capped(
    mut response: reqwest::Response,
    limit: usize,
    stage: Stage,
) -> Result<Option<Vec<u8>>, TransportError> {
    if response.content_length().is_some_and(|len| len > limit as u64) {
        return Ok(None);
    }

    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| TransportError::from_reqwest(stage, &e))?
    {
        if body.len() + chunk.len() > limit {
            return Ok(None);
        }
        body.extend_from_slice(&chunk);
    }
    Ok(Some(body))
}

/// Address of a listener that accepts connections and never answers.
#[cfg(test)]
pub(crate) async fn silent_upstream() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    format!("http://{addr}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_url_joins_v1_prefix() {
        let client = VaultClient::new("http://127.0.0.1:8200/", Duration::from_secs(10)).unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:8200");
        assert_eq!(
            client.api_url("auth/kubernetes/login"),
            "http://127.0.0.1:8200/v1/auth/kubernetes/login"
        );
        assert_eq!(
            client.api_url("/secret/data/creds"),
            "http://127.0.0.1:8200/v1/secret/data/creds"
        );
    }

    #[tokio::test]
    async fn test_error_body_is_bounded() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/big")
            .with_status(500)
            .with_body("x".repeat(4096))
            .create_async()
            .await;

        let client = VaultClient::new(&server.url(), Duration::from_secs(5)).unwrap();
        let response = client
            .http()
            .get(format!("{}/big", server.url()))
            .send()
            .await
            .unwrap();
        let body = error_body(response).await;

        assert_eq!(body.len(), MAX_ERROR_BODY);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_read_body_capped() {
        let mut server = mockito::Server::new_async().await;
        let _small = server
            .mock("GET", "/small")
            .with_status(200)
            .with_body("x".repeat(64))
            .create_async()
            .await;
        let _big = server
            .mock("GET", "/big")
            .with_status(200)
            .with_body("x".repeat(65))
            .create_async()
            .await;

        let client = VaultClient::new(&server.url(), Duration::from_secs(5)).unwrap();
        for (path, expected) in [("/small", Some(64)), ("/big", None)] {
            let response = client
                .http()
                .get(format!("{}{}", server.url(), path))
                .send()
                .await
                .unwrap();
            let body = read_body_capped(response, 64, Stage::SecretRead).await.unwrap();
            assert_eq!(body.map(|b| b.len()), expected, "path: {path}");
        }
    }

    #[tokio::test]
    async fn test_silent_upstream_times_out() {
        let url = silent_upstream().await;
        let client = VaultClient::new(&url, Duration::from_millis(200)).unwrap();

        let err = client.http().get(client.api_url("sys/health")).send().await.unwrap_err();
        assert!(err.is_timeout());
    }
}
