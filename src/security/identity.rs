use std::path::Path;

use tracing::debug;

use crate::security::errors::AuthError;

/// Platform-issued identity token (e.g. a Kubernetes service account JWT).
///
/// Read fresh for every exchange and dropped once the login call is built.
#[derive(Clone, PartialEq, Eq)]
pub struct IdentityToken(String);

impl IdentityToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for IdentityToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("IdentityToken(<redacted>)")
    }
}

/// Read the identity token mounted at `path`.
pub async fn read_identity_token(path: &Path) -> Result<IdentityToken, AuthError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| AuthError::IdentityRead {
            path: path.display().to_string(),
            cause: e.to_string(),
        })?;

    let token = raw.trim();
    if token.is_empty() {
        return Err(AuthError::IdentityRead {
            path: path.display().to_string(),
            cause: "token file is empty".to_string(),
        });
    }

    debug!(path = %path.display(), "identity token read");
    Ok(IdentityToken::new(token))
}
