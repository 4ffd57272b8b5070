use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::agent::config::Config;
use crate::agent::retrieval::{RetrievalError, RetrievalStage, SecretRetriever};
use crate::security::errors::AuthError;
use crate::security::secret_fetcher::KvReadResponse;

type SharedState = Arc<AppState>;

/// Body returned to clients for every upstream failure.
pub const GENERIC_FAILURE: &str = "failed to retrieve secret";

#[derive(Debug, Clone)]
pub struct AppState {
    pub retriever: SecretRetriever,
}

impl AppState {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            retriever: SecretRetriever::from_config(config)?,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretRequest {
    pub user_id: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
}

/// Log the full failure server-side and hand the client a generic 500.
fn upstream_failure(err: &RetrievalError, path: &str) -> ApiError {
    match err {
        RetrievalError::Auth(auth @ AuthError::PermissionDenied { status, .. }) => {
            error!(
                stage = %err.stage(),
                path = %path,
                upstream_status = status,
                error = %auth,
                "AuthError: Vault login permission denied"
            );
        }
        RetrievalError::Auth(auth) => {
            error!(stage = %err.stage(), path = %path, error = %auth, "AuthError");
        }
        RetrievalError::Fetch(fetch) => {
            error!(
                stage = %err.stage(),
                path = %path,
                upstream_status = ?fetch.status(),
                error = %fetch,
                "FetchError"
            );
        }
    }
    api_error(StatusCode::INTERNAL_SERVER_ERROR, GENERIC_FAILURE)
}

/// A user id must be one literal path segment: `[A-Za-z0-9._-]+`, not `.` or `..`.
///
/// Anything else could be reinterpreted by the URL parser (`\`, `%2e`, `?`, `#`)
/// and move the read outside the user prefix.
fn validate_user_id(user_id: &str) -> Option<&str> {
    let user_id = user_id.trim();
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-');
    if user_id.is_empty() || user_id == "." || user_id == ".." || !user_id.chars().all(allowed) {
        return None;
    }
    Some(user_id)
}

// Health check; never calls Vault
async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    let cache = state.retriever.token_cache();
    Json(json!({
        "status": "ok",
        "token_source": state.retriever.token_source_kind(),
        "token_age_secs": cache.age_seconds().await,
    }))
}

// GET / - configured default secret as `key:value ` text
async fn default_secret(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let path = state.retriever.default_secret_path();
    debug!(stage = %RetrievalStage::Start, path = %path, "GET /");

    let payload = state
        .retriever
        .retrieve(path)
        .await
        .map_err(|e| upstream_failure(&e, path))?;

    debug!(stage = %RetrievalStage::Done, path = %path, "secret served");
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        payload.render_pairs(),
    ))
}

// POST /secret - {"userId": ...} -> full KV envelope for <prefix>/<userId>
async fn user_secret(
    State(state): State<SharedState>,
    body: Result<Json<SecretRequest>, JsonRejection>,
) -> Result<Json<KvReadResponse>, ApiError> {
    let Json(req) = body.map_err(|rejection| {
        warn!(error = %rejection.body_text(), "rejected /secret request body");
        api_error(StatusCode::BAD_REQUEST, "invalid request body")
    })?;

    let user_id = validate_user_id(&req.user_id).ok_or_else(|| {
        warn!("rejected /secret request with invalid userId");
        api_error(StatusCode::BAD_REQUEST, "invalid userId")
    })?;

    let path = state.retriever.user_secret_path(user_id);
    debug!(stage = %RetrievalStage::Start, path = %path, "POST /secret");

    let payload = state
        .retriever
        .retrieve(&path)
        .await
        .map_err(|e| upstream_failure(&e, &path))?;

    debug!(stage = %RetrievalStage::Done, path = %path, "secret served");
    Ok(Json(payload.to_envelope()))
}

pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(default_secret))
        .route("/secret", post(user_secret))
        .route("/health", get(health))
        .with_state(state)
}

pub async fn serve(config: &Config, port: u16) -> Result<()> {
    let state = Arc::new(AppState::new(config)?);

    info!(
        vault_addr = %config.vault_addr,
        token_source = state.retriever.token_source_kind(),
        default_secret_path = %config.default_secret_path,
        "secret proxy configured"
    );

    let app = create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, app).into_future().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_user_id() {
        assert_eq!(validate_user_id(" alice "), Some("alice"));
        assert_eq!(validate_user_id("u-123"), Some("u-123"));
        assert_eq!(validate_user_id(""), None);
        assert_eq!(validate_user_id("   "), None);
        assert_eq!(validate_user_id(".."), None);
        assert_eq!(validate_user_id("../admin"), None);
        assert_eq!(validate_user_id("a/b"), None);
        assert_eq!(validate_user_id("user.name_01"), Some("user.name_01"));
        assert_eq!(validate_user_id("..\\admin"), None);
        assert_eq!(validate_user_id("%2e%2e"), None);
        assert_eq!(validate_user_id("x?a=1"), None);
        assert_eq!(validate_user_id("x#frag"), None);
        assert_eq!(validate_user_id("al ice"), None);
        assert_eq!(validate_user_id("ålice"), None);
    }

    #[tokio::test]
    async fn test_serve_builds_state_and_reports_bind_failure() {
        let taken = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let config = Config {
            vault_addr: "http://127.0.0.1:8200".to_string(),
            port,
            token_source: crate::agent::config::TokenSource::Static("dev-only-token".to_string()),
            auth_method: "kubernetes".to_string(),
            kv_mount: "secret".to_string(),
            default_secret_path: "creds".to_string(),
            user_secret_prefix: "users".to_string(),
            request_timeout: std::time::Duration::from_secs(5),
            renew_margin: std::time::Duration::from_secs(30),
        };

        assert!(serve(&config, port).await.is_err());
    }
}
