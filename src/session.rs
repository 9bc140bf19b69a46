//! The Spotify authorization session.
//!
//! `AuthSession` owns the PKCE round trip, the persisted [`TokenSet`] and its
//! silent refresh. It keeps no copy of the token set: every read goes back to
//! the injected storage.

use crate::{
    auth::{
        build_authorization_url, exchange_tokens, generate_code_challenge, generate_code_verifier,
        generate_state,
    },
    config::Config,
    error::{AppError, Result},
    navigator::{scrubbed, Navigator},
    storage::Storage,
    types::{TokenRequest, TokenSet},
};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub const TOKEN_KEY: &str = "spotify_token_set";
pub const VERIFIER_KEY: &str = "spotify_pkce_verifier";
pub const STATE_KEY: &str = "spotify_auth_state";

/// Lifetime assumed for an implicit-grant token that arrives without `expires_in`.
const DEFAULT_IMPLICIT_EXPIRES_IN: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Unauthenticated,
    AuthorizationPending,
    Authenticated,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFlow {
    /// Authorization code with PKCE.
    Code,
    /// Implicit grant; the token comes back in the fragment.
    Token,
}

impl AuthFlow {
    pub fn response_type(&self) -> &'static str {
        match self {
            AuthFlow::Code => "code",
            AuthFlow::Token => "token",
        }
    }
}

/// What a pass over the redirect location did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectOutcome {
    /// Nothing to consume at this location.
    NoRedirect,
    CodeExchanged,
    ImplicitTokenStored,
    /// The code exchange failed and the implicit grant was started instead.
    FellBackToImplicit,
    MissingVerifier,
    StateMismatch,
    ProviderError(String),
    StorageFailed,
}

impl RedirectOutcome {
    pub fn obtained_token(&self) -> bool {
        matches!(
            self,
            RedirectOutcome::CodeExchanged | RedirectOutcome::ImplicitTokenStored
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RedirectOutcome::NoRedirect => "no_redirect",
            RedirectOutcome::CodeExchanged => "code_exchanged",
            RedirectOutcome::ImplicitTokenStored => "implicit_token_stored",
            RedirectOutcome::FellBackToImplicit => "fell_back_to_implicit",
            RedirectOutcome::MissingVerifier => "missing_verifier",
            RedirectOutcome::StateMismatch => "state_mismatch",
            RedirectOutcome::ProviderError(_) => "provider_error",
            RedirectOutcome::StorageFailed => "storage_failed",
        }
    }
}

pub struct AuthSession {
    config: Arc<Config>,
    http_client: reqwest::Client,
    tokens: Arc<dyn Storage>,
    pending: Arc<dyn Storage>,
    // One refresh at a time per process; other callers re-read after it lands.
    refresh_lock: Mutex<()>,
}

impl AuthSession {
    /// `tokens` holds the durable token set; `pending` holds the verifier
    /// between `start_auth` and the redirect.
    pub fn new(
        config: Arc<Config>,
        http_client: reqwest::Client,
        tokens: Arc<dyn Storage>,
        pending: Arc<dyn Storage>,
    ) -> Self {
        let session = Self {
            config,
            http_client,
            tokens,
            pending,
            refresh_lock: Mutex::new(()),
        };
        info!(
            "Auth session ready ({} token storage, {} pending storage): {:?}",
            session.tokens.name(),
            session.pending.name(),
            session.state()
        );
        session
    }

    pub fn start_auth(&self, flow: AuthFlow, nav: &dyn Navigator) -> Result<()> {
        let oauth_state = generate_state();

        let challenge = match flow {
            AuthFlow::Code => {
                let verifier = generate_code_verifier();
                self.pending.set(VERIFIER_KEY, &verifier)?;
                Some(generate_code_challenge(&verifier))
            }
            AuthFlow::Token => None,
        };
        self.pending.set(STATE_KEY, &oauth_state)?;

        let auth_url =
            build_authorization_url(&self.config, flow, &oauth_state, challenge.as_deref())?;
        info!(
            "Starting {} authorization at {}",
            flow.response_type(),
            self.config.authorize_url()
        );
        nav.assign(auth_url);
        Ok(())
    }

    /// True iff this location yielded a token.
    pub async fn handle_redirect(&self, nav: &dyn Navigator) -> bool {
        self.complete_redirect(nav).await.obtained_token()
    }

    pub async fn complete_redirect(&self, nav: &dyn Navigator) -> RedirectOutcome {
        let location = nav.location();

        if let Some(fragment) = location.fragment() {
            let params: HashMap<String, String> = url::form_urlencoded::parse(fragment.as_bytes())
                .into_owned()
                .collect();
            if let Some(access_token) = params.get("access_token") {
                // Only tokens answering our own authorization request are accepted.
                match self.pending.get(STATE_KEY) {
                    Ok(Some(expected)) if params.get("state") == Some(&expected) => {}
                    Ok(_) => {
                        warn!("Ignoring implicit-grant token with missing or mismatched state");
                        return RedirectOutcome::StateMismatch;
                    }
                    Err(e) => {
                        error!("Failed to read authorization state: {}", e);
                        return RedirectOutcome::StorageFailed;
                    }
                }

                let expires_in = params
                    .get("expires_in")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_IMPLICIT_EXPIRES_IN);
                let token = TokenSet::issue(access_token.clone(), expires_in, None, Utc::now());
                if let Err(e) = self.persist(&token) {
                    error!("Failed to store implicit-grant token: {}", e);
                    return RedirectOutcome::StorageFailed;
                }
                self.clear_pending();
                nav.replace_state(scrubbed(&location));
                info!("Stored implicit-grant token");
                return RedirectOutcome::ImplicitTokenStored;
            }
        }

        let query: HashMap<String, String> = location.query_pairs().into_owned().collect();
        if let Some(provider_error) = query.get("error") {
            warn!("Spotify denied authorization: {}", provider_error);
            return RedirectOutcome::ProviderError(provider_error.clone());
        }
        let Some(code) = query.get("code") else {
            return RedirectOutcome::NoRedirect;
        };

        let verifier = match self.pending.get(VERIFIER_KEY) {
            Ok(Some(verifier)) => verifier,
            Ok(None) => {
                debug!("Authorization code present but no verifier pending");
                return RedirectOutcome::MissingVerifier;
            }
            Err(e) => {
                error!("Failed to read PKCE verifier: {}", e);
                return RedirectOutcome::StorageFailed;
            }
        };

        match self.pending.get(STATE_KEY) {
            Ok(Some(expected)) if query.get("state") != Some(&expected) => {
                warn!("Ignoring authorization code with mismatched state");
                return RedirectOutcome::StateMismatch;
            }
            Err(e) => {
                error!("Failed to read authorization state: {}", e);
                return RedirectOutcome::StorageFailed;
            }
            _ => {}
        }

        let request = TokenRequest::authorization_code(
            &self.config.client_id,
            code,
            &self.config.redirect_uri,
            &verifier,
        );

        match exchange_tokens(&self.http_client, &self.config.token_url(), &request).await {
            Ok(response) => {
                let token = TokenSet::issue(
                    response.access_token,
                    response.expires_in,
                    response.refresh_token,
                    Utc::now(),
                );
                if let Err(e) = self.persist(&token) {
                    error!("Failed to store exchanged token: {}", e);
                    return RedirectOutcome::StorageFailed;
                }

                self.clear_pending();
                nav.replace_state(scrubbed(&location));
                info!("Authorization code exchanged");
                RedirectOutcome::CodeExchanged
            }
            Err(e) => {
                warn!(
                    "PKCE token exchange failed, falling back to implicit grant: {}",
                    e
                );
                if let Err(e) = self.start_auth(AuthFlow::Token, nav) {
                    error!("Failed to start implicit grant: {}", e);
                }
                RedirectOutcome::FellBackToImplicit
            }
        }
    }

    /// A bearer token that is valid now, refreshing an expired one when possible.
    pub async fn get_access_token(&self) -> Option<String> {
        let token = self.stored_token()?;
        if token.is_fresh(Utc::now()) {
            return Some(token.access_token);
        }
        if !token.can_refresh() {
            debug!("Token expired and cannot be refreshed");
            return None;
        }

        let _guard = self.refresh_lock.lock().await;

        let token = self.stored_token()?;
        if token.is_fresh(Utc::now()) {
            debug!("Token was refreshed while waiting");
            return Some(token.access_token);
        }
        let refresh_token = token.refresh_token?;

        match self.refresh(&refresh_token).await {
            Ok(refreshed) => Some(refreshed.access_token),
            Err(e) => {
                warn!("Token refresh failed, login required: {}", e);
                if let Err(e) = self.tokens.remove(TOKEN_KEY) {
                    error!("Failed to clear stale token: {}", e);
                }
                None
            }
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet> {
        info!("Token expired, refreshing");
        let request = TokenRequest::refresh(&self.config.client_id, refresh_token);
        let response = exchange_tokens(&self.http_client, &self.config.token_url(), &request)
            .await
            .map_err(|e| AppError::TokenRefreshError(e.to_string()))?;

        // Spotify does not always rotate the refresh token.
        let token = TokenSet::issue(
            response.access_token,
            response.expires_in,
            response
                .refresh_token
                .or_else(|| Some(refresh_token.to_string())),
            Utc::now(),
        );
        // The new access token is still good for this process if the write fails.
        if let Err(e) = self.persist(&token) {
            error!("Failed to store refreshed token: {}", e);
        }
        info!("Token refreshed successfully");
        Ok(token)
    }

    pub fn is_authorized(&self) -> bool {
        self.stored_token()
            .is_some_and(|token| token.is_fresh(Utc::now()))
    }

    pub fn state(&self) -> AuthState {
        match self.stored_token() {
            Some(token) if token.is_fresh(Utc::now()) => AuthState::Authenticated,
            Some(_) => AuthState::Expired,
            None => match self.pending.get(VERIFIER_KEY) {
                Ok(Some(_)) => AuthState::AuthorizationPending,
                _ => AuthState::Unauthenticated,
            },
        }
    }

    pub fn logout(&self) {
        match self.tokens.remove(TOKEN_KEY) {
            Ok(()) => info!("Logged out"),
            Err(e) => error!("Failed to clear token set: {}", e),
        }
    }

    pub fn stored_token(&self) -> Option<TokenSet> {
        let raw = match self.tokens.get(TOKEN_KEY) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!("Failed to read token set: {}", e);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!("Ignoring unreadable token set: {}", e);
                None
            }
        }
    }

    // Clean up PKCE verifier and state
    fn clear_pending(&self) {
        for key in [VERIFIER_KEY, STATE_KEY] {
            if let Err(e) = self.pending.remove(key) {
                warn!("Failed to clear {}: {}", key, e);
            }
        }
    }

    fn persist(&self, token: &TokenSet) -> Result<()> {
        let raw = serde_json::to_string(token)
            .map_err(|e| AppError::Storage(format!("Failed to serialize token set: {}", e)))?;
        self.tokens.set(TOKEN_KEY, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::navigator::BrowserLocation;
    use crate::storage::MemoryStorage;
    use crate::types::MAX_TOKEN_LIFETIME_SECS;
    use chrono::{DateTime, Duration};
    use serde_json::json;
    use url::Url;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CALLBACK: &str = "http://127.0.0.1:8888/callback";

    struct Fixture {
        server: MockServer,
        session: AuthSession,
        tokens: Arc<MemoryStorage>,
        pending: Arc<MemoryStorage>,
    }

    async fn fixture() -> Fixture {
        let server = MockServer::start().await;
        let tokens = Arc::new(MemoryStorage::new());
        let pending = Arc::new(MemoryStorage::new());
        let session = AuthSession::new(
            Arc::new(Config::for_tests(&server.uri())),
            reqwest::Client::new(),
            tokens.clone(),
            pending.clone(),
        );
        Fixture {
            server,
            session,
            tokens,
            pending,
        }
    }

    fn query_param(url: &Url, key: &str) -> Option<String> {
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    fn seed(tokens: &MemoryStorage, token: &TokenSet) {
        tokens
            .set(TOKEN_KEY, &serde_json::to_string(token).unwrap())
            .unwrap();
    }

    fn token_expiring_at(expires_at: DateTime<Utc>, refresh: Option<&str>) -> TokenSet {
        TokenSet {
            access_token: "old-access".into(),
            token_type: crate::types::TokenType::Bearer,
            expires_in: 3600,
            expires_at,
            refresh_token: refresh.map(str::to_string),
        }
    }

    fn start_implicit(f: &Fixture, nav: &BrowserLocation) -> String {
        f.session.start_auth(AuthFlow::Token, nav).unwrap();
        query_param(&nav.pending_navigation().unwrap(), "state").unwrap()
    }

    fn assert_close(actual: DateTime<Utc>, expected: DateTime<Utc>) {
        assert!(
            (actual - expected).num_seconds().abs() <= 5,
            "{} is not within 5s of {}",
            actual,
            expected
        );
    }

    #[tokio::test]
    async fn start_auth_code_sends_challenge_for_stored_verifier() {
        let f = fixture().await;
        let nav = BrowserLocation::new(Url::parse(CALLBACK).unwrap());

        f.session.start_auth(AuthFlow::Code, &nav).unwrap();

        let url = nav.pending_navigation().unwrap();
        let verifier = f.pending.get(VERIFIER_KEY).unwrap().unwrap();
        assert_eq!(verifier.len(), 64);
        assert_eq!(url.path(), "/authorize");
        assert_eq!(query_param(&url, "response_type").as_deref(), Some("code"));
        assert_eq!(
            query_param(&url, "code_challenge_method").as_deref(),
            Some("S256")
        );
        assert_eq!(
            query_param(&url, "code_challenge"),
            Some(generate_code_challenge(&verifier))
        );
        assert_eq!(query_param(&url, "state"), f.pending.get(STATE_KEY).unwrap());
        assert_eq!(query_param(&url, "client_id").as_deref(), Some("test-client"));
        assert_eq!(query_param(&url, "redirect_uri").as_deref(), Some(CALLBACK));
        assert_eq!(f.session.state(), AuthState::AuthorizationPending);
    }

    #[tokio::test]
    async fn second_start_auth_replaces_verifier() {
        let f = fixture().await;
        let nav = BrowserLocation::new(Url::parse(CALLBACK).unwrap());

        f.session.start_auth(AuthFlow::Code, &nav).unwrap();
        let first = f.pending.get(VERIFIER_KEY).unwrap().unwrap();
        f.session.start_auth(AuthFlow::Code, &nav).unwrap();
        let second = f.pending.get(VERIFIER_KEY).unwrap().unwrap();

        assert_ne!(first, second);
        let url = nav.pending_navigation().unwrap();
        assert_eq!(
            query_param(&url, "code_challenge"),
            Some(generate_code_challenge(&second))
        );
    }

    #[tokio::test]
    async fn start_auth_token_flow_stores_no_verifier() {
        let f = fixture().await;
        let nav = BrowserLocation::new(Url::parse(CALLBACK).unwrap());

        f.session.start_auth(AuthFlow::Token, &nav).unwrap();

        let url = nav.pending_navigation().unwrap();
        assert_eq!(query_param(&url, "response_type").as_deref(), Some("token"));
        assert_eq!(query_param(&url, "code_challenge"), None);
        assert_eq!(f.pending.get(VERIFIER_KEY).unwrap(), None);
        assert_eq!(query_param(&url, "state"), f.pending.get(STATE_KEY).unwrap());
    }

    #[tokio::test]
    async fn code_flow_end_to_end() {
        let f = fixture().await;
        let nav = BrowserLocation::new(Url::parse(CALLBACK).unwrap());
        f.session.start_auth(AuthFlow::Code, &nav).unwrap();
        let verifier = f.pending.get(VERIFIER_KEY).unwrap().unwrap();
        let state = query_param(&nav.pending_navigation().unwrap(), "state").unwrap();

        Mock::given(method("POST"))
            .and(path("/api/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=abc"))
            .and(body_string_contains(format!("code_verifier={}", verifier)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "fresh-access",
                "token_type": "Bearer",
                "expires_in": 3600,
                "refresh_token": "fresh-refresh"
            })))
            .expect(1)
            .mount(&f.server)
            .await;

        nav.visit(Url::parse(&format!("{}?code=abc&state={}", CALLBACK, state)).unwrap());

        assert!(f.session.handle_redirect(&nav).await);
        assert!(f.session.is_authorized());
        assert_eq!(f.session.state(), AuthState::Authenticated);
        assert_eq!(f.pending.get(VERIFIER_KEY).unwrap(), None);
        assert_eq!(nav.location().as_str(), CALLBACK);

        let token = f.session.stored_token().unwrap();
        assert_eq!(token.refresh_token.as_deref(), Some("fresh-refresh"));
        assert_close(token.expires_at, Utc::now() + Duration::seconds(3570));

        // The code is gone from the address; nothing is resubmitted.
        assert!(!f.session.handle_redirect(&nav).await);
        assert_eq!(
            f.session.complete_redirect(&nav).await,
            RedirectOutcome::NoRedirect
        );
    }

    #[tokio::test]
    async fn replayed_code_without_verifier_is_not_exchanged() {
        let f = fixture().await;
        let nav = BrowserLocation::new(Url::parse(&format!("{}?code=abc", CALLBACK)).unwrap());

        assert_eq!(
            f.session.complete_redirect(&nav).await,
            RedirectOutcome::MissingVerifier
        );
        assert!(f.server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exchange_failure_falls_back_to_implicit_grant() {
        let f = fixture().await;
        let nav = BrowserLocation::new(Url::parse(CALLBACK).unwrap());
        f.session.start_auth(AuthFlow::Code, &nav).unwrap();
        let state = query_param(&nav.pending_navigation().unwrap(), "state").unwrap();

        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_client"))
            .mount(&f.server)
            .await;

        nav.visit(Url::parse(&format!("{}?code=abc&state={}", CALLBACK, state)).unwrap());
        let outcome = f.session.complete_redirect(&nav).await;

        assert_eq!(outcome, RedirectOutcome::FellBackToImplicit);
        assert!(!outcome.obtained_token());
        assert!(!f.session.is_authorized());
        let next = nav.pending_navigation().unwrap();
        assert_eq!(query_param(&next, "response_type").as_deref(), Some("token"));
        assert_eq!(query_param(&next, "code_challenge"), None);
    }

    #[tokio::test]
    async fn implicit_fragment_is_stored_and_scrubbed() {
        let f = fixture().await;
        let nav = BrowserLocation::new(Url::parse(CALLBACK).unwrap());
        let state = start_implicit(&f, &nav);
        nav.visit(
            Url::parse(&format!(
                "{}#access_token=implicit&token_type=Bearer&expires_in=600&state={}",
                CALLBACK, state
            ))
            .unwrap(),
        );

        assert_eq!(
            f.session.complete_redirect(&nav).await,
            RedirectOutcome::ImplicitTokenStored
        );
        let token = f.session.stored_token().unwrap();
        assert_eq!(token.access_token, "implicit");
        assert_eq!(token.refresh_token, None);
        assert_close(token.expires_at, Utc::now() + Duration::seconds(570));
        assert_eq!(nav.location().fragment(), None);
        assert_eq!(f.pending.get(STATE_KEY).unwrap(), None);

        assert!(!f.session.handle_redirect(&nav).await);
    }

    #[tokio::test]
    async fn implicit_fragment_needs_matching_state() {
        let f = fixture().await;
        let nav = BrowserLocation::new(Url::parse(CALLBACK).unwrap());

        // Nothing was started, so there is no state to match.
        nav.visit(
            Url::parse(&format!("{}#access_token=planted&expires_in=3600", CALLBACK)).unwrap(),
        );
        assert_eq!(
            f.session.complete_redirect(&nav).await,
            RedirectOutcome::StateMismatch
        );

        start_implicit(&f, &nav);
        for fragment in [
            "access_token=planted&expires_in=3600",
            "access_token=planted&expires_in=3600&state=forged",
        ] {
            nav.visit(Url::parse(&format!("{}#{}", CALLBACK, fragment)).unwrap());
            assert_eq!(
                f.session.complete_redirect(&nav).await,
                RedirectOutcome::StateMismatch
            );
            assert!(!nav.was_rewritten());
        }
        assert_eq!(f.tokens.get(TOKEN_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_implicit_lifetime_is_clamped() {
        for expires_in in ["100000000000000000", "18446744073709551615"] {
            let f = fixture().await;
            let nav = BrowserLocation::new(Url::parse(CALLBACK).unwrap());
            let state = start_implicit(&f, &nav);
            nav.visit(
                Url::parse(&format!(
                    "{}#access_token=long&expires_in={}&state={}",
                    CALLBACK, expires_in, state
                ))
                .unwrap(),
            );

            assert!(f.session.handle_redirect(&nav).await);
            assert!(f.session.is_authorized());
            let token = f.session.stored_token().unwrap();
            assert_eq!(token.expires_in, MAX_TOKEN_LIFETIME_SECS);
            assert_close(
                token.expires_at,
                Utc::now() + Duration::seconds(MAX_TOKEN_LIFETIME_SECS as i64 - 30),
            );
        }
    }

    #[tokio::test]
    async fn plain_location_has_no_side_effects() {
        let f = fixture().await;
        let nav = BrowserLocation::new(Url::parse(CALLBACK).unwrap());

        assert!(!f.session.handle_redirect(&nav).await);
        assert!(!nav.was_rewritten());
        assert!(nav.pending_navigation().is_none());
        assert_eq!(f.tokens.get(TOKEN_KEY).unwrap(), None);
        assert!(f.server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mismatched_state_is_rejected() {
        let f = fixture().await;
        let nav = BrowserLocation::new(Url::parse(CALLBACK).unwrap());
        f.session.start_auth(AuthFlow::Code, &nav).unwrap();

        nav.visit(Url::parse(&format!("{}?code=abc&state=forged", CALLBACK)).unwrap());

        assert_eq!(
            f.session.complete_redirect(&nav).await,
            RedirectOutcome::StateMismatch
        );
        assert!(f.pending.get(VERIFIER_KEY).unwrap().is_some());
        assert!(f.server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn provider_error_is_reported() {
        let f = fixture().await;
        let nav =
            BrowserLocation::new(Url::parse(&format!("{}?error=access_denied", CALLBACK)).unwrap());

        assert_eq!(
            f.session.complete_redirect(&nav).await,
            RedirectOutcome::ProviderError("access_denied".into())
        );
    }

    #[tokio::test]
    async fn is_authorized_tracks_expiry() {
        let f = fixture().await;
        assert!(!f.session.is_authorized());
        assert_eq!(f.session.state(), AuthState::Unauthenticated);

        seed(&f.tokens, &TokenSet::issue("a".into(), 3600, None, Utc::now()));
        assert!(f.session.is_authorized());

        seed(
            &f.tokens,
            &token_expiring_at(Utc::now() + Duration::seconds(2), None),
        );
        assert!(f.session.is_authorized());

        seed(
            &f.tokens,
            &token_expiring_at(Utc::now() - Duration::seconds(1), None),
        );
        assert!(!f.session.is_authorized());
        assert_eq!(f.session.state(), AuthState::Expired);
    }

    #[tokio::test]
    async fn fresh_token_is_returned_without_network() {
        let f = fixture().await;
        seed(&f.tokens, &TokenSet::issue("live".into(), 3600, Some("r".into()), Utc::now()));

        assert_eq!(f.session.get_access_token().await.as_deref(), Some("live"));
        assert!(f.server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_keeping_refresh_token() {
        let f = fixture().await;
        let original = token_expiring_at(Utc::now() - Duration::seconds(10), Some("keep-me"));
        seed(&f.tokens, &original);

        Mock::given(method("POST"))
            .and(path("/api/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=keep-me"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new-access",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&f.server)
            .await;

        assert_eq!(
            f.session.get_access_token().await.as_deref(),
            Some("new-access")
        );
        let stored = f.session.stored_token().unwrap();
        assert_eq!(stored.refresh_token.as_deref(), Some("keep-me"));
        assert!(stored.expires_at > original.expires_at);
        assert!(f.session.is_authorized());
    }

    #[tokio::test]
    async fn rotated_refresh_token_replaces_old_one() {
        let f = fixture().await;
        seed(
            &f.tokens,
            &token_expiring_at(Utc::now() - Duration::seconds(10), Some("old")),
        );

        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new-access",
                "token_type": "Bearer",
                "expires_in": 3600,
                "refresh_token": "rotated"
            })))
            .mount(&f.server)
            .await;

        assert!(f.session.get_access_token().await.is_some());
        assert_eq!(
            f.session.stored_token().unwrap().refresh_token.as_deref(),
            Some("rotated")
        );
    }

    #[tokio::test]
    async fn expired_token_without_refresh_token_is_left_alone() {
        let f = fixture().await;
        seed(
            &f.tokens,
            &token_expiring_at(Utc::now() - Duration::seconds(10), None),
        );
        let before = f.tokens.get(TOKEN_KEY).unwrap();

        assert_eq!(f.session.get_access_token().await, None);
        assert_eq!(f.tokens.get(TOKEN_KEY).unwrap(), before);
        assert!(f.server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_refresh_requires_login() {
        let f = fixture().await;
        seed(
            &f.tokens,
            &token_expiring_at(Utc::now() - Duration::seconds(10), Some("revoked")),
        );

        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant"
            })))
            .expect(1)
            .mount(&f.server)
            .await;

        assert_eq!(f.session.get_access_token().await, None);
        assert_eq!(f.session.state(), AuthState::Unauthenticated);
        // No second attempt with the dead refresh token.
        assert_eq!(f.session.get_access_token().await, None);
    }

    /// Reads from the wrapped storage; every write fails.
    struct ReadOnlyStorage(MemoryStorage);

    impl Storage for ReadOnlyStorage {
        fn get(&self, key: &str) -> Result<Option<String>> {
            self.0.get(key)
        }

        fn set(&self, _key: &str, _value: &str) -> Result<()> {
            Err(AppError::Storage("read-only".into()))
        }

        fn remove(&self, _key: &str) -> Result<()> {
            Err(AppError::Storage("read-only".into()))
        }
    }

    #[tokio::test]
    async fn refreshed_token_is_used_when_it_cannot_be_stored() {
        let server = MockServer::start().await;
        let inner = MemoryStorage::new();
        seed(
            &inner,
            &token_expiring_at(Utc::now() - Duration::seconds(10), Some("r")),
        );
        let session = AuthSession::new(
            Arc::new(Config::for_tests(&server.uri())),
            reqwest::Client::new(),
            Arc::new(ReadOnlyStorage(inner)),
            Arc::new(MemoryStorage::new()),
        );

        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "unsaved",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        assert_eq!(session.get_access_token().await.as_deref(), Some("unsaved"));
        assert_eq!(
            session.stored_token().unwrap().refresh_token.as_deref(),
            Some("r")
        );
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let f = fixture().await;
        seed(
            &f.tokens,
            &token_expiring_at(Utc::now() - Duration::seconds(10), Some("once")),
        );

        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "shared",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&f.server)
            .await;

        let (a, b) = tokio::join!(f.session.get_access_token(), f.session.get_access_token());
        assert_eq!(a.as_deref(), Some("shared"));
        assert_eq!(b.as_deref(), Some("shared"));
    }

    #[tokio::test]
    async fn logout_clears_token() {
        let f = fixture().await;
        seed(&f.tokens, &TokenSet::issue("a".into(), 3600, None, Utc::now()));
        assert!(f.session.is_authorized());

        f.session.logout();
        assert!(!f.session.is_authorized());
        assert_eq!(f.session.stored_token(), None);
        f.session.logout();
    }
}
