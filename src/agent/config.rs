use std::path::PathBuf;
use std::time::Duration;

use crate::security::errors::ConfigError;

pub const DEFAULT_VAULT_ADDR: &str = "http://127.0.0.1:8200";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_AUTH_METHOD: &str = "kubernetes";
pub const DEFAULT_KV_MOUNT: &str = "secret";
pub const DEFAULT_USER_SECRET_PREFIX: &str = "users";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_RENEW_MARGIN_SECS: u64 = 30;

/// How the proxy obtains the session token it presents to Vault.
#[derive(Clone, PartialEq, Eq)]
pub enum TokenSource {
    /// Read the identity token from `token_path` and log in as `role`.
    Exchange { token_path: PathBuf, role: String },
    /// Use a fixed token; no login is performed.
    Static(String),
}

impl TokenSource {
    pub fn kind(&self) -> &'static str {
        match self {
            TokenSource::Exchange { .. } => "exchange",
            TokenSource::Static(_) => "static",
        }
    }
}

impl std::fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenSource::Exchange { token_path, role } => f
                .debug_struct("Exchange")
                .field("token_path", token_path)
                .field("role", role)
                .finish(),
            TokenSource::Static(_) => f.write_str("Static(<redacted>)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Vault server address, without the `/v1` API prefix.
    pub vault_addr: String,
    pub port: u16,
    pub token_source: TokenSource,
    pub auth_method: String,
    pub kv_mount: String,
    /// Secret served on `GET /`.
    pub default_secret_path: String,
    /// `POST /secret` reads `<prefix>/<userId>`.
    pub user_secret_prefix: String,
    pub request_timeout: Duration,
    pub renew_margin: Duration,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let vault_addr = get("VAULT_ADDR")
            .unwrap_or_else(|| DEFAULT_VAULT_ADDR.to_string())
            .trim_end_matches('/')
            .to_string();
        if !vault_addr.starts_with("http://") && !vault_addr.starts_with("https://") {
            return Err(ConfigError::Invalid {
                name: "VAULT_ADDR",
                reason: format!("expected an http(s) URL, got {vault_addr}"),
            });
        }

        let port = match get("PORT") {
            Some(raw) => raw.parse::<u16>().map_err(|e| ConfigError::Invalid {
                name: "PORT",
                reason: e.to_string(),
            })?,
            None => DEFAULT_PORT,
        };

        let token_source = match get("VAULT_TOKEN_PATH") {
            Some(path) => TokenSource::Exchange {
                token_path: PathBuf::from(path),
                role: get("VAULT_ROLE").ok_or(ConfigError::Missing("VAULT_ROLE"))?,
            },
            None => TokenSource::Static(
                get("VAULT_TOKEN").ok_or(ConfigError::Missing("VAULT_TOKEN"))?,
            ),
        };

        let default_secret_path = get("VAULT_SECRET_PATH")
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty())
            .ok_or(ConfigError::Missing("VAULT_SECRET_PATH"))?;

        let request_timeout = Duration::from_secs(secs_setting(
            &get,
            "VAULT_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
        )?);
        if request_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                name: "VAULT_REQUEST_TIMEOUT_SECS",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(Config {
            vault_addr,
            port,
            token_source,
            auth_method: segment(get("VAULT_AUTH_METHOD"), DEFAULT_AUTH_METHOD),
            kv_mount: segment(get("VAULT_KV_MOUNT"), DEFAULT_KV_MOUNT),
            default_secret_path,
            user_secret_prefix: segment(
                get("VAULT_USER_SECRET_PREFIX"),
                DEFAULT_USER_SECRET_PREFIX,
            ),
            request_timeout,
            renew_margin: Duration::from_secs(secs_setting(
                &get,
                "VAULT_TOKEN_RENEW_MARGIN_SECS",
                DEFAULT_RENEW_MARGIN_SECS,
            )?),
        })
    }
}

fn segment(value: Option<String>, default: &str) -> String {
    value
        .map(|v| v.trim_matches('/').to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn secs_setting<G>(get: &G, name: &'static str, default: u64) -> Result<u64, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => raw.parse::<u64>().map_err(|e| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}
