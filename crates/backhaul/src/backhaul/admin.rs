use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Query, Request, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::backhaul::config::{self, Config, TunnelConfig};
use crate::backhaul::tunnel::{
    protocol::token_matches,
    status::{StatusError, StatusProvider},
};

#[derive(Clone)]
pub struct AdminState {
    pub provider: Arc<dyn StatusProvider>,
    pub prom: PrometheusHandle,
    pub config: Arc<Mutex<Config>>,
    /// Where tunnel edits are persisted. `None` keeps them in memory only.
    pub config_path: Option<PathBuf>,
}

impl AdminState {
    fn credentials(&self, cfg: &Config) -> Option<(String, String)> {
        let web = &cfg.web;
        if web.username.is_empty() && web.password.is_empty() {
            return None;
        }
        Some((web.username.clone(), web.password.clone()))
    }
}

pub fn router(state: AdminState) -> Router {
    let shared = Arc::new(state);

    let api = Router::new()
        .route("/api/status", get(status))
        .route("/api/tunnels", post(add_tunnel).delete(remove_tunnel))
        .route("/api/config", get(show_config).post(replace_config))
        .route("/metrics", get(metrics))
        .route_layer(middleware::from_fn_with_state(shared.clone(), require_auth));

    Router::new()
        .route("/health", get(health))
        .merge(api)
        .with_state(shared)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("admin: bind {addr}"))?;
    tracing::info!(admin_addr = %addr, "admin: listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|v| *v).await;
        })
        .await
        .context("admin: serve")?;
    Ok(())
}

async fn require_auth(State(st): State<Arc<AdminState>>, req: Request, next: Next) -> Response {
    let creds = {
        let cfg = st.config.lock().await;
        st.credentials(&cfg)
    };
    match creds {
        None => next.run(req).await,
        Some((user, pass)) if authorized(req.headers(), &user, &pass) => next.run(req).await,
        Some(_) => {
            let mut resp = error(StatusCode::UNAUTHORIZED, "unauthorized").into_response();
            resp.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"backhaul\""),
            );
            resp
        }
    }
}

fn authorized(headers: &HeaderMap, user: &str, pass: &str) -> bool {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some((scheme, encoded)) = value.trim().split_once(' ') else {
        return false;
    };
    if !scheme.eq_ignore_ascii_case("basic") {
        return false;
    }
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((u, p)) = decoded.split_once(':') else {
        return false;
    };
    // Both compared regardless of the first result.
    token_matches(u, user) & token_matches(p, pass)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error(code: StatusCode, msg: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (code, Json(ErrorResponse { error: msg.into() }))
}

fn status_error(err: StatusError) -> (StatusCode, Json<ErrorResponse>) {
    let code = match &err {
        StatusError::Invalid(_) => StatusCode::BAD_REQUEST,
        StatusError::Conflict(_) => StatusCode::CONFLICT,
        StatusError::NotFound(_) => StatusCode::NOT_FOUND,
        StatusError::Unsupported(_) => StatusCode::METHOD_NOT_ALLOWED,
        StatusError::Rejected(_) => StatusCode::BAD_GATEWAY,
        StatusError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error(code, err.to_string())
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn status(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.provider.status().await))
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        st.prom.render(),
    )
}

async fn show_config(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let cfg = st.config.lock().await;
    (StatusCode::OK, Json(cfg.redacted()))
}

#[derive(Debug, Serialize)]
struct ConfigSaved {
    status: &'static str,
    message: &'static str,
}

/// Replaces the whole config document. The running relay or agent keeps its
/// settings until restart.
async fn replace_config(
    State(st): State<Arc<AdminState>>,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Response {
    let Json(doc) = match body {
        Ok(b) => b,
        Err(rej) => return error(StatusCode::BAD_REQUEST, rej.body_text()).into_response(),
    };

    let mut cfg = st.config.lock().await;
    let next = match cfg.replaced_by(doc) {
        Ok(c) => c,
        Err(err) => return error(StatusCode::BAD_REQUEST, format!("{err:#}")).into_response(),
    };
    if let Some(path) = &st.config_path {
        if let Err(err) = config::save_config(path, &next) {
            tracing::warn!(path = %path.display(), err = %format!("{err:#}"), "admin: save config failed");
            return error(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")).into_response();
        }
    }
    *cfg = next;
    tracing::info!("admin: config replaced; restart to apply");

    (
        StatusCode::OK,
        Json(ConfigSaved {
            status: "saved",
            message: "Configuration saved. Restart to apply changes.",
        }),
    )
        .into_response()
}

async fn add_tunnel(
    State(st): State<Arc<AdminState>>,
    body: Result<Json<TunnelConfig>, JsonRejection>,
) -> Response {
    let Json(tunnel) = match body {
        Ok(b) => b,
        Err(rej) => return error(StatusCode::BAD_REQUEST, rej.body_text()).into_response(),
    };

    let added = match st.provider.add_tunnel(tunnel).await {
        Ok(t) => t,
        Err(err) => return status_error(err).into_response(),
    };

    let mut cfg = st.config.lock().await;
    cfg.client.tunnels.retain(|t| t.name != added.name);
    cfg.client.tunnels.push(added.clone());
    persist(&st, &cfg);
    (StatusCode::OK, Json(added)).into_response()
}

#[derive(Debug, Deserialize)]
struct RemoveQuery {
    #[serde(default)]
    name: String,
}

async fn remove_tunnel(
    State(st): State<Arc<AdminState>>,
    Query(q): Query<RemoveQuery>,
) -> Response {
    if q.name.trim().is_empty() {
        return error(StatusCode::BAD_REQUEST, "name is required").into_response();
    }

    let removed = match st.provider.remove_tunnel(&q.name).await {
        Ok(t) => t,
        Err(err) => return status_error(err).into_response(),
    };

    let mut cfg = st.config.lock().await;
    cfg.client.tunnels.retain(|t| t.name != removed.name);
    persist(&st, &cfg);
    (StatusCode::OK, Json(removed)).into_response()
}

/// The edit is already live, so a failed write is logged rather than reported.
fn persist(st: &AdminState, cfg: &Config) {
    let Some(path) = &st.config_path else {
        return;
    };
    match config::save_config(path, cfg) {
        Ok(()) => tracing::debug!(path = %path.display(), "admin: config saved"),
        Err(err) => {
            tracing::warn!(path = %path.display(), err = %format!("{err:#}"), "admin: save config failed")
        }
    }
}
