//! Process configuration from the environment.
//!
//! Everything is an `ORDERBELL_*` variable, loaded after dotenvy has had
//! its chance. Secrets ride in `SecretString` so a stray debug print does
//! not leak them.

use crate::phone::DEFAULT_STAFF_VIEWS;
use anyhow::{Context as _, Result};
use secrecy::{ExposeSecret, SecretString};
use std::net::SocketAddr;
use std::path::PathBuf;

const DEFAULT_BIND: &str = "127.0.0.1:8000";
const DEFAULT_SETTINGS_PATH: &str = "orderbell-settings.json";

#[derive(Debug, Clone)]
pub struct Config {
    pub backend: BackendConfig,
    pub bind: SocketAddr,
    /// Bearer token guarding the `/api` routes; without one the API is
    /// open, which is only sane on a loopback bind.
    pub api_token: Option<SecretString>,
    pub webhook: Option<WebhookConfig>,
    /// Local fallback file for settings.
    pub settings_path: PathBuf,
    /// Glob patterns for staff-facing UI routes.
    pub staff_views: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// `memory:` or the hosted backend origin.
    pub url: String,
    pub api_key: SecretString,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub token: Option<SecretString>,
}

impl Config {
    pub fn from_env() -> Result<Config> {
        let backend = BackendConfig {
            url: env_opt("ORDERBELL_BACKEND_URL").unwrap_or_else(|| "memory:".to_string()),
            api_key: SecretString::from(env_opt("ORDERBELL_BACKEND_KEY").unwrap_or_default()),
        };
        if backend.url.starts_with("http") && backend.api_key.expose_secret().is_empty() {
            anyhow::bail!("ORDERBELL_BACKEND_KEY is required with a hosted backend");
        }

        let bind = env_opt("ORDERBELL_BIND")
            .unwrap_or_else(|| DEFAULT_BIND.to_string())
            .parse()
            .context("invalid ORDERBELL_BIND")?;

        let webhook = env_opt("ORDERBELL_WEBHOOK_URL").map(|url| WebhookConfig {
            url,
            token: env_opt("ORDERBELL_WEBHOOK_TOKEN").map(SecretString::from),
        });

        let staff_views = match env_opt("ORDERBELL_STAFF_VIEWS") {
            Some(raw) => parse_view_list(&raw),
            None => DEFAULT_STAFF_VIEWS.iter().map(|s| s.to_string()).collect(),
        };

        Ok(Config {
            backend,
            bind,
            api_token: env_opt("ORDERBELL_API_TOKEN").map(SecretString::from),
            webhook,
            settings_path: env_opt("ORDERBELL_SETTINGS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH)),
            staff_views,
        })
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Comma-separated glob list, whitespace-tolerant.
fn parse_view_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}
