use crate::{
    cache::{ResponseCache, DEFAULT_TTL},
    error::{AppError, Result},
    retry::{parse_retry_after, RetryPolicy},
    session::AuthSession,
    types::{Playlist, SearchResponse, Track},
    AppState,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

/// Spotify Web API client: bearer auth from the session, a short-lived
/// response cache, and bounded 429 retry.
pub struct SpotifyApi {
    session: Arc<AuthSession>,
    http_client: reqwest::Client,
    api_base_url: String,
    cache: ResponseCache<Value>,
    retry: RetryPolicy,
}

impl SpotifyApi {
    pub fn new(session: Arc<AuthSession>, http_client: reqwest::Client, api_base_url: &str) -> Self {
        Self {
            session,
            http_client,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            cache: ResponseCache::new(DEFAULT_TTL),
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache = ResponseCache::new(ttl);
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn endpoint(&self, path: &str, params: &[(&str, String)]) -> Result<Url> {
        Url::parse_with_params(&format!("{}/{}", self.api_base_url, path), params)
            .map_err(|e| AppError::InternalError(e.into()))
    }

    async fn get_json(&self, cache_key: String, url: Url) -> Result<Value> {
        if let Some(cached) = self.cache.get(&cache_key) {
            return Ok(cached);
        }

        let token = self
            .session
            .get_access_token()
            .await
            .ok_or(AppError::Unauthorized)?;

        let mut attempt = 0;
        loop {
            debug!("GET {}", url);
            let response = self
                .http_client
                .get(url.clone())
                .bearer_auth(&token)
                .send()
                .await?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = parse_retry_after(response.headers());
                match self.retry.delay_for(attempt, retry_after) {
                    Some(delay) => {
                        warn!(
                            "Rate limited by Spotify, retrying in {:?} (attempt {})",
                            delay,
                            attempt + 1
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    None => {
                        error!(
                            "Giving up on rate-limited request after {} attempts (Retry-After: {:?})",
                            attempt + 1,
                            retry_after
                        );
                        return Err(AppError::RateLimited {
                            attempts: attempt + 1,
                        });
                    }
                }
            }

            if !status.is_success() {
                let error_text = response.text().await.unwrap_or_default();
                error!("Spotify API request failed with status: {}", status);
                return Err(AppError::Upstream {
                    status: status.as_u16(),
                    message: if error_text.is_empty() {
                        "Spotify API error".to_string()
                    } else {
                        error_text
                    },
                });
            }

            let body: Value = response.json().await?;
            self.cache.set(cache_key, body.clone());
            return Ok(body);
        }
    }

    pub async fn search_tracks(&self, q: &str, limit: u32, offset: u32) -> Result<SearchResponse> {
        let url = self.endpoint(
            "search",
            &[
                ("q", q.to_string()),
                ("type", "track".to_string()),
                ("limit", limit.to_string()),
                ("offset", offset.to_string()),
            ],
        )?;
        let body = self
            .get_json(format!("search:{}:{}:{}", q, limit, offset), url)
            .await?;
        serde_json::from_value(body).map_err(|e| AppError::InternalError(e.into()))
    }

    pub async fn featured_playlists(&self, country: &str, limit: u32) -> Result<Vec<Playlist>> {
        let url = self.endpoint(
            "browse/featured-playlists",
            &[("country", country.to_string()), ("limit", limit.to_string())],
        )?;
        let body = self
            .get_json(format!("featured:{}:{}", country, limit), url)
            .await?;

        Ok(body["playlists"]["items"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| serde_json::from_value(item.clone()).ok())
                    .collect()
            })
            .unwrap_or_default())
    }

    pub async fn playlist_tracks(&self, playlist_id: &str, limit: u32) -> Result<Vec<Track>> {
        let url = self.endpoint(
            &format!("playlists/{}/tracks", playlist_id),
            &[("limit", limit.to_string())],
        )?;
        let body = self
            .get_json(format!("playlist:{}:{}", playlist_id, limit), url)
            .await?;

        // Removed or local tracks come back as null or without an id.
        Ok(body["items"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter(|item| !item["track"].is_null())
                    .filter_map(|item| serde_json::from_value::<Track>(item["track"].clone()).ok())
                    .map(|mut track| {
                        if track.preview_url.as_deref() == Some("") {
                            track.preview_url = None;
                        }
                        track
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Tracks with audio previews for the card's player.
    pub async fn featured_preview_tracks(&self, limit: usize, country: &str) -> Vec<Track> {
        match self.previews_from_featured(limit, country).await {
            Ok(Some(tracks)) => return tracks,
            Ok(None) => debug!("No featured playlist had previewable tracks"),
            Err(e) => {
                warn!("Featured playlists unavailable, searching instead: {}", e);
                match self.search_tracks("love", limit as u32, 0).await {
                    Ok(result) => {
                        return result
                            .tracks
                            .items
                            .into_iter()
                            .filter(Track::has_preview)
                            .take(limit)
                            .collect()
                    }
                    Err(e) => warn!("Preview search failed: {}", e),
                }
            }
        }
        Vec::new()
    }

    async fn previews_from_featured(&self, limit: usize, country: &str) -> Result<Option<Vec<Track>>> {
        for playlist in self.featured_playlists(country, 10).await? {
            let with_preview: Vec<Track> = self
                .playlist_tracks(&playlist.id, 50)
                .await?
                .into_iter()
                .filter(Track::has_preview)
                .collect();
            if !with_preview.is_empty() {
                info!("Using previews from playlist: {}", playlist.name);
                return Ok(Some(with_preview.into_iter().take(limit).collect()));
            }
        }
        Ok(None)
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: String,
    #[serde(default = "default_search_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_search_limit() -> u32 {
    20
}

#[derive(Debug, Deserialize)]
pub struct FeaturedParams {
    #[serde(default = "default_country")]
    pub country: String,
    pub limit: Option<u32>,
}

fn default_country() -> String {
    "US".to_string()
}

#[derive(Debug, Deserialize)]
pub struct LimitParams {
    pub limit: Option<u32>,
}

pub async fn search_handler(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>> {
    Ok(Json(
        state
            .api
            .search_tracks(&params.q, params.limit, params.offset)
            .await?,
    ))
}

pub async fn featured_handler(
    State(state): State<AppState>,
    Query(params): Query<FeaturedParams>,
) -> Result<Json<Vec<Playlist>>> {
    Ok(Json(
        state
            .api
            .featured_playlists(&params.country, params.limit.unwrap_or(10))
            .await?,
    ))
}

pub async fn playlist_tracks_handler(
    State(state): State<AppState>,
    Path(playlist_id): Path<String>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Vec<Track>>> {
    Ok(Json(
        state
            .api
            .playlist_tracks(&playlist_id, params.limit.unwrap_or(50))
            .await?,
    ))
}

pub async fn previews_handler(
    State(state): State<AppState>,
    Query(params): Query<FeaturedParams>,
) -> Json<Vec<Track>> {
    let limit = params.limit.unwrap_or(12) as usize;
    Json(state.api.featured_preview_tracks(limit, &params.country).await)
}
