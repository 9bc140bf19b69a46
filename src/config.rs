use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_AUTH_BASE_URL: &str = "https://accounts.spotify.com";
pub const DEFAULT_API_BASE_URL: &str = "https://api.spotify.com/v1";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: String,
    pub auth_base_url: String,
    pub api_base_url: String,
    pub storage_path: Option<PathBuf>,
    pub cache_ttl: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "8888".to_string())
            .parse()
            .context("Invalid PORT")?;

        let cache_ttl_secs: u64 = std::env::var("CACHE_TTL_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .context("Invalid CACHE_TTL_SECS")?;

        Ok(Self {
            port,

            client_id: std::env::var("SPOTIFY_CLIENT_ID")
                .context("SPOTIFY_CLIENT_ID must be set")?,

            redirect_uri: std::env::var("SPOTIFY_REDIRECT_URI")
                .unwrap_or_else(|_| format!("http://127.0.0.1:{}/callback", port)),

            scopes: std::env::var("SPOTIFY_SCOPES").unwrap_or_default(),

            auth_base_url: std::env::var("SPOTIFY_AUTH_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_AUTH_BASE_URL.to_string()),

            api_base_url: std::env::var("SPOTIFY_API_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_API_BASE_URL.to_string()),

            storage_path: std::env::var("STORAGE_PATH").ok().map(PathBuf::from),

            cache_ttl: Duration::from_secs(cache_ttl_secs),
        })
    }

    pub fn server_address(&self) -> SocketAddr {
        ([127, 0, 0, 1], self.port).into()
    }

    pub fn authorize_url(&self) -> String {
        format!("{}/authorize", self.auth_base_url.trim_end_matches('/'))
    }

    pub fn token_url(&self) -> String {
        format!("{}/api/token", self.auth_base_url.trim_end_matches('/'))
    }

    #[cfg(test)]
    pub fn for_tests(auth_base_url: &str) -> Self {
        Self {
            port: 8888,
            client_id: "test-client".to_string(),
            redirect_uri: "http://127.0.0.1:8888/callback".to_string(),
            scopes: "user-read-email streaming".to_string(),
            auth_base_url: auth_base_url.to_string(),
            api_base_url: format!("{}/v1", auth_base_url),
            storage_path: None,
            cache_ttl: crate::cache::DEFAULT_TTL,
        }
    }
}
