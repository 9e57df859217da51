//! HTTP side door: health, readiness, Prometheus metrics and the admin API

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, Router},
    Json,
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::channel::ChannelSummary;
use crate::manager::SessionManager;
use crate::metrics::RelayMetrics;
use crate::session::SessionSummary;

#[derive(Clone)]
pub struct HttpState {
    pub manager: Arc<SessionManager>,
    pub metrics: Arc<RelayMetrics>,
}

#[derive(Clone)]
struct AdminState {
    http: HttpState,
    token: String,
}

/// Health and metrics routes, plus the admin routes when `admin_token` is set
pub fn router(state: HttpState, admin_token: Option<String>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state.clone());

    match admin_token.filter(|t| !t.is_empty()) {
        Some(token) => {
            router = router.merge(admin_router(AdminState { http: state, token }));
            info!("Admin API enabled");
        }
        None => info!("No admin token configured, admin API disabled"),
    }

    router.layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/sessions", get(list_sessions))
        .route("/admin/sessions/:id", delete(close_session))
        .route("/admin/channels", get(list_channels))
        .route("/admin/channels/:id", delete(close_channel))
        .route("/admin/stats", get(get_stats))
        .with_state(state)
}

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

/// 503 once the session cap is reached
async fn ready_handler(State(state): State<HttpState>) -> StatusCode {
    if state.manager.has_capacity() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics_handler(State(state): State<HttpState>) -> Response {
    match state.metrics.export() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            warn!("Metrics export failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn check_auth(headers: &HeaderMap, expected: &str) -> Result<(), StatusCode> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .unwrap_or("");

    if !token.is_empty() && token == expected {
        Ok(())
    } else {
        warn!("Admin API authentication failed");
        Err(StatusCode::UNAUTHORIZED)
    }
}

#[derive(Debug, Serialize)]
pub struct ListSessionsResponse {
    pub sessions: Vec<SessionSummary>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct ListChannelsResponse {
    pub channels: Vec<ChannelSummary>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct CloseResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct RelayStats {
    pub connected_sessions: usize,
    pub directory_entries: usize,
    pub active_channels: usize,
    pub total_sessions: u64,
    pub total_channels: u64,
    pub bytes_forwarded: u64,
    pub packets_forwarded: u64,
    pub dropped_datagrams: u64,
    pub uptime_seconds: u64,
}

async fn list_sessions(
    State(state): State<AdminState>,
    headers: HeaderMap,
) -> Result<Json<ListSessionsResponse>, StatusCode> {
    check_auth(&headers, &state.token)?;
    let sessions = state.http.manager.list_sessions();
    let total = sessions.len();
    Ok(Json(ListSessionsResponse { sessions, total }))
}

async fn list_channels(
    State(state): State<AdminState>,
    headers: HeaderMap,
) -> Result<Json<ListChannelsResponse>, StatusCode> {
    check_auth(&headers, &state.token)?;
    let channels = state.http.manager.list_channels();
    let total = channels.len();
    Ok(Json(ListChannelsResponse { channels, total }))
}

async fn close_session(
    State(state): State<AdminState>,
    Path(id): Path<u32>,
    headers: HeaderMap,
) -> Result<Json<CloseResponse>, StatusCode> {
    check_auth(&headers, &state.token)?;
    if !state.http.manager.close_session_by_id(id) {
        return Err(StatusCode::NOT_FOUND);
    }
    info!(session_id = id, "Admin API: session closed");
    Ok(Json(CloseResponse {
        success: true,
        message: format!("Session {} closed", id),
    }))
}

async fn close_channel(
    State(state): State<AdminState>,
    Path(id): Path<u32>,
    headers: HeaderMap,
) -> Result<Json<CloseResponse>, StatusCode> {
    check_auth(&headers, &state.token)?;
    if !state.http.manager.close_channel_by_id(id) {
        return Err(StatusCode::NOT_FOUND);
    }
    info!(channel_id = id, "Admin API: channel closed");
    Ok(Json(CloseResponse {
        success: true,
        message: format!("Channel {} closed", id),
    }))
}

async fn get_stats(
    State(state): State<AdminState>,
    headers: HeaderMap,
) -> Result<Json<RelayStats>, StatusCode> {
    check_auth(&headers, &state.token)?;
    let manager = &state.http.manager;
    let metrics = &state.http.metrics;

    Ok(Json(RelayStats {
        connected_sessions: manager.session_count(),
        directory_entries: manager.directory().len(),
        active_channels: manager.channel_count(),
        total_sessions: metrics.total_sessions(),
        total_channels: metrics.total_channels(),
        bytes_forwarded: metrics.bytes_forwarded(),
        packets_forwarded: metrics.packets_forwarded(),
        dropped_datagrams: metrics.dropped_datagrams(),
        uptime_seconds: metrics.uptime().as_secs(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionType;
    use crate::manager::ManagerConfig;
    use crate::testing::TestRig;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    const TOKEN: &str = "s3cret";

    fn state(rig: &TestRig) -> HttpState {
        HttpState {
            manager: rig.manager.clone(),
            metrics: rig.metrics.clone(),
        }
    }

    fn get_req(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(t) = token {
            builder = builder.header("authorization", format!("Bearer {}", t));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let rig = TestRig::new().await;
        let app = router(state(&rig), None);

        let resp = app.clone().oneshot(get_req("/health", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        rig.metrics.session_opened();
        let resp = app.oneshot(get_req("/metrics", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("natproxy_sessions_total 1"));
    }

    #[tokio::test]
    async fn test_ready_reflects_capacity() {
        let rig = TestRig::with_config(ManagerConfig {
            max_sessions: 1,
            ..ManagerConfig::default()
        })
        .await;
        let app = router(state(&rig), None);

        let resp = app.clone().oneshot(get_req("/ready", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let _session = rig.connect_parked(SessionType::Either).await;
        let resp = app.oneshot(get_req("/ready", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_admin_requires_token() {
        let rig = TestRig::new().await;

        let disabled = router(state(&rig), None);
        let resp = disabled.oneshot(get_req("/admin/stats", Some(TOKEN))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let app = router(state(&rig), Some(TOKEN.into()));
        let resp = app.clone().oneshot(get_req("/admin/stats", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let resp = app.clone().oneshot(get_req("/admin/stats", Some("wrong"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let resp = app.oneshot(get_req("/admin/stats", Some(TOKEN))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_admin_sessions() {
        let rig = TestRig::new().await;
        let app = router(state(&rig), Some(TOKEN.into()));
        let (alice, mut a) = rig.connect(SessionType::Either).await;
        a.login("alice", [0; 4]).await.unwrap();

        let resp = app.clone().oneshot(get_req("/admin/sessions", Some(TOKEN))).await.unwrap();
        let json = body_json(resp).await;
        assert_eq!(json["total"], 1);
        assert_eq!(json["sessions"][0]["guid"], "alice");
        assert_eq!(json["sessions"][0]["id"], 1000);

        let del = |uri: &str| {
            Request::builder()
                .method("DELETE")
                .uri(uri)
                .header("authorization", format!("Bearer {}", TOKEN))
                .body(Body::empty())
                .unwrap()
        };
        let resp = app.clone().oneshot(del("/admin/sessions/4242")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = app.clone().oneshot(del("/admin/sessions/1000")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!alice.is_running());

        let resp = app.oneshot(del("/admin/channels/1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
