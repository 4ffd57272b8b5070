//! Error taxonomy for the login and secret-read stages.
use thiserror::Error;

/// Which upstream call a transport failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Login,
    SecretRead,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Login => f.write_str("login"),
            Stage::SecretRead => f.write_str("secret read"),
        }
    }
}

/// Network-level failure talking to the secrets service, including timeouts.
#[derive(Debug, Clone, Error)]
#[error("{stage} transport failure{}: {message}", timeout_suffix(.timed_out))]
pub struct TransportError {
    pub stage: Stage,
    pub message: String,
    pub timed_out: bool,
}

fn timeout_suffix(timed_out: &bool) -> &'static str {
    if *timed_out {
        " (timed out)"
    } else {
        ""
    }
}

impl TransportError {
    pub fn from_reqwest(stage: Stage, err: &reqwest::Error) -> Self {
        Self {
            stage,
            message: err.to_string(),
            timed_out: err.is_timeout(),
        }
    }
}

/// A required setting is absent or unusable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("unable to read identity token from {path}: {cause}")]
    IdentityRead { path: String, cause: String },
    #[error("permission denied by login endpoint (status {status})")]
    PermissionDenied { status: u16, body: String },
    #[error("login rejected with status {status}")]
    Rejected { status: u16, body: String },
    #[error("malformed login response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl AuthError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, AuthError::PermissionDenied { .. })
    }
}

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("permission denied reading secret (status {status})")]
    PermissionDenied { status: u16, body: String },
    #[error("secret read failed with status {status}")]
    Rejected { status: u16, body: String },
    #[error("invalid secret path: {0}")]
    InvalidPath(String),
    #[error("schema mismatch in secret response: {0}")]
    SchemaMismatch(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl FetchError {
    /// Upstream HTTP status, when the service answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::PermissionDenied { status, .. } | FetchError::Rejected { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}
