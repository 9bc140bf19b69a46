use crate::{
    config::Config,
    error::{AppError, Result},
    navigator::{BrowserLocation, Navigator},
    session::{AuthFlow, RedirectOutcome},
    types::{TokenRequest, TokenResponse},
    AppState,
};
use axum::{
    extract::State,
    http::{header, Uri},
    response::{Html, IntoResponse, Redirect, Response},
    Json,
};
use base64::Engine;
use rand::{distributions::Alphanumeric, Rng};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info};
use url::Url;

pub const VERIFIER_LENGTH: usize = 64;
pub const STATE_LENGTH: usize = 16;

fn random_string(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

// Generate PKCE verifier (64 URL-safe characters)
pub fn generate_code_verifier() -> String {
    random_string(VERIFIER_LENGTH)
}

// Generate PKCE challenge from verifier
pub fn generate_code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    let result = hasher.finalize();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(result)
}

// Generate random anti-forgery state parameter
pub fn generate_state() -> String {
    random_string(STATE_LENGTH)
}

/// Authorization URL for either flow; the challenge is only sent for the code flow.
pub fn build_authorization_url(
    config: &Config,
    flow: AuthFlow,
    oauth_state: &str,
    challenge: Option<&str>,
) -> Result<Url> {
    let mut auth_params = vec![
        ("client_id", config.client_id.as_str()),
        ("redirect_uri", config.redirect_uri.as_str()),
        ("state", oauth_state),
        ("scope", config.scopes.as_str()),
        ("response_type", flow.response_type()),
    ];
    if let (AuthFlow::Code, Some(challenge)) = (flow, challenge) {
        auth_params.push(("code_challenge_method", "S256"));
        auth_params.push(("code_challenge", challenge));
    }

    let query = serde_urlencoded::to_string(auth_params)
        .map_err(|e| AppError::InternalError(e.into()))?;
    Url::parse(&format!("{}?{}", config.authorize_url(), query))
        .map_err(|e| AppError::InternalError(e.into()))
}

// Helper function to call the token endpoint
pub async fn exchange_tokens(
    client: &reqwest::Client,
    token_url: &str,
    request: &TokenRequest,
) -> Result<TokenResponse> {
    debug!("Requesting {} grant at: {}", request.grant_type, token_url);

    let response = client
        .post(token_url)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .form(request)
        .send()
        .await
        .map_err(|e| AppError::TokenExchangeError(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        error!("Token endpoint returned {}: {}", status, error_text);
        return Err(AppError::TokenExchangeError(format!(
            "{}: {}",
            status, error_text
        )));
    }

    let response_text = response
        .text()
        .await
        .map_err(|e| AppError::TokenExchangeError(e.to_string()))?;

    let token_response: TokenResponse = serde_json::from_str(&response_text).map_err(|e| {
        AppError::TokenExchangeError(format!("Failed to parse token response: {}", e))
    })?;

    debug!(
        "Token endpoint issued a {} token valid for {}s (scope: {})",
        token_response.token_type,
        token_response.expires_in,
        token_response.scope.as_deref().unwrap_or("none")
    );
    Ok(token_response)
}

fn page_url(config: &Config, uri: &Uri) -> Result<Url> {
    let base = Url::parse(&config.redirect_uri).map_err(|e| AppError::InternalError(e.into()))?;
    base.join(&uri.to_string())
        .map_err(|e| AppError::InternalError(e.into()))
}

// Initiate OAuth login flow
pub async fn login(State(state): State<AppState>, uri: Uri) -> Result<impl IntoResponse> {
    let nav = BrowserLocation::new(page_url(&state.config, &uri)?);
    state.session.start_auth(AuthFlow::Code, &nav)?;

    let auth_url = nav
        .pending_navigation()
        .ok_or_else(|| AppError::InternalError(anyhow::anyhow!("no authorization URL")))?;
    info!("Redirecting to Spotify authorization");
    Ok(Redirect::to(auth_url.as_str()))
}

// Handle the provider redirect (code flow, or the fallback navigation)
pub async fn callback(State(state): State<AppState>, uri: Uri) -> Result<Response> {
    let nav = BrowserLocation::new(page_url(&state.config, &uri)?);
    let outcome = state.session.complete_redirect(&nav).await;
    debug!("Callback outcome: {:?}", outcome);

    if let Some(next) = nav.pending_navigation() {
        return Ok(Redirect::to(next.as_str()).into_response());
    }
    if nav.was_rewritten() {
        return Ok(Redirect::to(nav.location().path()).into_response());
    }

    Ok(Html(callback_page(&outcome)).into_response())
}

// Implicit-grant tokens arrive in the fragment, which only the page can read.
pub async fn callback_fragment(
    State(state): State<AppState>,
    fragment: String,
) -> Result<impl IntoResponse> {
    let mut location = Url::parse(&state.config.redirect_uri)
        .map_err(|e| AppError::InternalError(e.into()))?;
    location.set_fragment(Some(fragment.trim_start_matches('#')));

    let nav = BrowserLocation::new(location);
    let outcome = state.session.complete_redirect(&nav).await;

    Ok(Json(json!({
        "authorized": outcome.obtained_token(),
        "outcome": outcome.as_str(),
    })))
}

// Logout endpoint
pub async fn logout(State(state): State<AppState>) -> impl IntoResponse {
    state.session.logout();
    Json(json!({ "message": "Successfully logged out" }))
}

// Check authentication status
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let token = state.session.stored_token();
    Json(json!({
        "authorized": state.session.is_authorized(),
        "state": state.session.state(),
        "expires_at": token.map(|t| t.expires_at),
    }))
}

fn callback_page(outcome: &RedirectOutcome) -> String {
    format!(
        r#"
<!DOCTYPE html>
<html>
<head>
    <title>Spotify Authorization</title>
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            height: 100vh;
            margin: 0;
            background-color: #fff0f5;
        }}
        .container {{
            text-align: center;
            background: white;
            padding: 2rem;
            border-radius: 12px;
            box-shadow: 0 2px 4px rgba(0,0,0,0.1);
            max-width: 480px;
        }}
        h1 {{
            color: #2d3748;
            margin-bottom: 1rem;
        }}
        p {{
            color: #4a5568;
        }}
        a {{
            display: inline-block;
            margin-top: 1rem;
            padding: 0.5rem 1rem;
            border-radius: 6px;
            background: #16a34a;
            color: white;
            text-decoration: none;
        }}
    </style>
    <script>
        async function finish() {{
            const status = document.getElementById('status');
            const fragment = window.location.hash.replace(/^#/, '');
            if (fragment.includes('access_token=')) {{
                history.replaceState(null, '', window.location.pathname);
                const response = await fetch('/callback/fragment', {{ method: 'POST', body: fragment }});
                const data = await response.json();
                status.textContent = data.authorized ? 'Connected to Spotify.' : 'Authorization failed.';
                return;
            }}
            const response = await fetch('/auth/status');
            const data = await response.json();
            status.textContent = data.authorized ? 'Connected to Spotify.' : 'Please log in again.';
        }}
        window.addEventListener('DOMContentLoaded', finish);
    </script>
</head>
<body>
    <div class="container">
        <h1>Finishing authorization…</h1>
        <p id="status" data-outcome="{}">Checking…</p>
        <a href="/auth/login">Log in with Spotify</a>
    </div>
</body>
</html>
        "#,
        outcome.as_str()
    )
}
