//! Demonstration routes: a profile form protected by a rate limit token.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, State},
    middleware::from_fn_with_state,
    response::{Html, IntoResponse},
    routing::{get, put},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::middleware::{enforce, RouteGuard};
use crate::config::RateLimitingConfig;
use crate::ratelimit::{client_id, WindowEnforcer};

/// Path of the protected form.
pub const PROFILE_PATH: &str = "/profile";

/// State shared by the demo handlers.
#[derive(Debug)]
pub struct DemoState {
    pub enforcer: Arc<WindowEnforcer>,
    pub token_field: String,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
}

/// Submitted profile form.
#[derive(Debug, Deserialize)]
pub struct ProfileForm {
    #[serde(default)]
    pub name: String,
}

/// Build the demo router.
///
/// `GET /profile` renders a form carrying a token; `PUT` and `POST` on the
/// same path are rate limited with the path's configured window.
pub fn router(enforcer: Arc<WindowEnforcer>, config: &RateLimitingConfig) -> Router {
    let guard = RouteGuard::new(enforcer.clone(), &config.token_field)
        .with_window(config.window_for(PROFILE_PATH));

    let state = Arc::new(DemoState {
        enforcer,
        token_field: config.token_field.clone(),
    });

    Router::new()
        .route("/health", get(health))
        .route(
            PROFILE_PATH,
            get(profile_form).merge(
                put(update_profile)
                    .post(update_profile)
                    .route_layer(from_fn_with_state(guard, enforce)),
            ),
        )
        .with_state(state)
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "formgate",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Render the profile form with a token bound to this client and path.
pub async fn profile_form(
    State(state): State<Arc<DemoState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Html<String> {
    let token = state
        .enforcer
        .issue_token(&client_id(&peer), PROFILE_PATH, None);

    Html(format!(
        r#"<!doctype html>
<form method="post" action="{path}">
  <input type="hidden" name="{field}" value="{token}">
  <label>Name <input type="text" name="name"></label>
  <button type="submit">Save</button>
</form>
"#,
        path = PROFILE_PATH,
        field = escape_attr(&state.token_field),
        token = token,
    ))
}

/// Accept a profile update that made it past the rate limit.
pub async fn update_profile(Form(form): Form<ProfileForm>) -> impl IntoResponse {
    info!(name = %form.name, "Profile updated");
    format!("Profile updated: {}", form.name)
}

fn escape_attr(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
