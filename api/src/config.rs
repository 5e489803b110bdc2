use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::retry::RetryPolicy;

pub const DEFAULT_ACCOUNTS_URL: &str = "https://accounts.spotify.com";
pub const DEFAULT_API_URL: &str = "https://api.spotify.com/v1";

/// Largest page the recently-played endpoint serves.
pub const MAX_RECENTLY_PLAYED_LIMIT: u32 = 50;

#[derive(Debug, Clone)]
pub struct SpotifyConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: Option<String>,
    pub accounts_url: String,
    pub api_url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct IngestConfig {
    pub page_limit: u32,
    pub user_concurrency: usize,
    pub metadata_concurrency: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            page_limit: MAX_RECENTLY_PLAYED_LIMIT,
            user_concurrency: 4,
            metadata_concurrency: 8,
        }
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub spotify: SpotifyConfig,
    pub ingest: IngestConfig,
    pub retry: RetryPolicy,
    /// Bearer secret required by the ingestion trigger when set.
    pub cron_secret: Option<String>,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let page_limit: u32 = parse_env("INGEST_PAGE_LIMIT", MAX_RECENTLY_PLAYED_LIMIT)?;

        Ok(Config {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/listening_vault".to_string()),
            spotify: SpotifyConfig {
                client_id: require_env("SPOTIFY_CLIENT_ID")?,
                client_secret: require_env("SPOTIFY_CLIENT_SECRET")?,
                redirect_uri: optional_env("SPOTIFY_REDIRECT_URI"),
                accounts_url: optional_env("SPOTIFY_ACCOUNTS_URL")
                    .unwrap_or_else(|| DEFAULT_ACCOUNTS_URL.to_string()),
                api_url: optional_env("SPOTIFY_API_URL")
                    .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
                timeout: Duration::from_secs(parse_env("UPSTREAM_TIMEOUT_SECS", 10)?),
            },
            ingest: IngestConfig {
                page_limit: page_limit.clamp(1, MAX_RECENTLY_PLAYED_LIMIT),
                user_concurrency: parse_env::<usize>("INGEST_USER_CONCURRENCY", 4)?.max(1),
                metadata_concurrency: parse_env::<usize>("INGEST_METADATA_CONCURRENCY", 8)?.max(1),
            },
            retry: RetryPolicy {
                max_attempts: parse_env("STORE_MAX_ATTEMPTS", 4)?,
                base_delay: Duration::from_millis(parse_env("STORE_RETRY_BASE_MS", 100)?),
            },
            cron_secret: optional_env("CRON_SECRET"),
            port: parse_env("PORT", 3001)?,
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional_env(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{key} must be a valid number, got '{raw}'")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_falls_back_to_default() {
        let value: u32 = parse_env("VAULT_TEST_SURELY_UNSET_VARIABLE", 17).unwrap();
        assert_eq!(value, 17);
    }

    #[test]
    fn ingest_defaults_match_endpoint_cap() {
        let ingest = IngestConfig::default();
        assert_eq!(ingest.page_limit, MAX_RECENTLY_PLAYED_LIMIT);
        assert!(ingest.user_concurrency >= 1);
    }
}
