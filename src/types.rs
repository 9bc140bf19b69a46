use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Seconds shaved off the provider's lifetime so a token is never used right at its edge.
pub const EXPIRY_SAFETY_MARGIN_SECS: i64 = 30;

/// Longest lifetime honored for a token; larger `expires_in` values are clamped.
pub const MAX_TOKEN_LIFETIME_SECS: u64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenType {
    Bearer,
}

/// A persisted credential. `expires_at` is always derived from the local clock
/// at the moment the set is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub token_type: TokenType,
    pub expires_in: u64,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl TokenSet {
    pub fn issue(
        access_token: String,
        expires_in: u64,
        refresh_token: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let expires_in = expires_in.min(MAX_TOKEN_LIFETIME_SECS);
        let lifetime = i64::try_from(expires_in).unwrap_or(0) - EXPIRY_SAFETY_MARGIN_SECS;
        let expires_at = Duration::try_seconds(lifetime)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .unwrap_or(now);
        Self {
            access_token,
            token_type: TokenType::Bearer,
            expires_in,
            expires_at,
            refresh_token,
        }
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }
}

#[derive(Debug, Serialize)]
pub struct TokenRequest {
    pub grant_type: String,
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_verifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl TokenRequest {
    pub fn authorization_code(
        client_id: &str,
        code: &str,
        redirect_uri: &str,
        verifier: &str,
    ) -> Self {
        Self {
            grant_type: "authorization_code".to_string(),
            client_id: client_id.to_string(),
            code: Some(code.to_string()),
            redirect_uri: Some(redirect_uri.to_string()),
            code_verifier: Some(verifier.to_string()),
            refresh_token: None,
        }
    }

    pub fn refresh(client_id: &str, refresh_token: &str) -> Self {
        Self {
            grant_type: "refresh_token".to_string(),
            client_id: client_id.to_string(),
            code: None,
            redirect_uri: None,
            code_verifier: None,
            refresh_token: Some(refresh_token.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
}

// Catalogue shapes returned to the card page.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub url: String,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub width: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artist {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Album {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub images: Vec<Image>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub name: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub preview_url: Option<String>,
    #[serde(default)]
    pub artists: Vec<Artist>,
    #[serde(default)]
    pub album: Album,
}

impl Track {
    pub fn has_preview(&self) -> bool {
        self.preview_url.as_deref().is_some_and(|url| !url.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playlist {
    pub id: String,
    pub name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub images: Vec<Image>,
}

// Spotify sends `"images": null` for some playlists.
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub tracks: Page<Track>,
}

/// Formats a track length as `m:ss`.
pub fn format_duration(ms: u64) -> String {
    let total_seconds = ms / 1000;
    format!("{}:{:02}", total_seconds / 60, total_seconds % 60)
}
