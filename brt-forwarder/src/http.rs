/**
 * API REST BRT FORWARDER - Couche HTTP autour du service
 *
 * ROUTES :
 * - POST <receiver.path>          réception d'un payload passerelle, résolution + relais
 * - GET  /api/device/{ble_addr}   dernières valeurs valides connues d'un capteur
 * - GET  /api/cache/stats         taille du cache + état dirty
 * - POST /api/cache/expire        balayage de maintenance (?max_age_days=N)
 * - GET  /health                  toujours accessible, sans token
 *
 * SÉCURITÉ :
 * Si l'auth est active avec au moins un token, le token doit venir du
 * paramètre de query OU du header configurés. Sinon 401.
 * Le relais ne fait jamais échouer la requête : 200 dès que le payload est valide.
 */

use crate::config::AuthConf;
use crate::health::HealthTracker;
use crate::models::GatewayPayload;
use crate::service::ForwarderService;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ForwarderService>,
    pub health: HealthTracker,
    pub auth: Arc<AuthConf>,
    pub max_body_bytes: usize,
}

#[derive(Debug, Deserialize)]
struct ExpireParams {
    max_age_days: u32,
}

pub fn build_router(app_state: AppState, receiver_path: &str) -> Router {
    let protected = Router::new()
        .route(receiver_path, post(receive_data))
        .route("/api/device/{ble_addr}", get(get_device_data))
        .route("/api/cache/stats", get(get_cache_stats))
        .route("/api/cache/expire", post(expire_cache))
        .route_layer(middleware::from_fn_with_state(app_state.clone(), require_token));

    Router::new()
        .route("/health", get(health_check))
        .merge(protected)
        .with_state(app_state)
}

fn error_body(code: StatusCode, msg: &str) -> Response {
    (code, Json(json!({"success": false, "error": msg}))).into_response()
}

fn client_ip(req_headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    req_headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
        .or_else(|| peer.map(|p| p.ip().to_string()))
        .unwrap_or_else(|| "unknown".into())
}

fn peer_of(req: &Request) -> Option<SocketAddr> {
    req.extensions().get::<ConnectInfo<SocketAddr>>().map(|c| c.0)
}

/// Vrai si l'auth est inactive, sans tokens, ou si un token valide est fourni
fn is_authorized(auth: &AuthConf, headers: &HeaderMap, query_token: Option<&str>) -> bool {
    if !auth.enabled || auth.valid_tokens.is_empty() {
        return true;
    }

    let from_header = headers.get(auth.header.as_str()).and_then(|v| v.to_str().ok());
    [query_token, from_header]
        .into_iter()
        .flatten()
        .any(|token| auth.valid_tokens.iter().any(|t| t == token))
}

async fn require_token(State(app): State<AppState>, req: Request, next: Next) -> Response {
    let query_token = Query::<HashMap<String, String>>::try_from_uri(req.uri())
        .ok()
        .and_then(|Query(mut params)| params.remove(&app.auth.query_param));
    if is_authorized(&app.auth, req.headers(), query_token.as_deref()) {
        return next.run(req).await;
    }
    let ip = client_ip(req.headers(), peer_of(&req));
    warn!("authentication failed from {} on {}", ip, req.uri().path());
    error_body(StatusCode::UNAUTHORIZED, "Unauthorized")
}

// POST <receiver.path>
async fn receive_data(State(app): State<AppState>, req: Request) -> Response {
    let ip = client_ip(req.headers(), peer_of(&req));
    let body: Bytes = match axum::body::to_bytes(req.into_body(), app.max_body_bytes).await {
        Ok(b) => b,
        Err(e) => {
            warn!("rejected body from {} (limit {} bytes): {}", ip, app.max_body_bytes, e);
            return error_body(StatusCode::PAYLOAD_TOO_LARGE, "Payload too large");
        }
    };
    debug!("received data: {}", String::from_utf8_lossy(&body));

    let payload: GatewayPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            error!("JSON parsing failed: {}", e);
            return error_body(StatusCode::BAD_REQUEST, "Invalid JSON data");
        }
    };
    if payload.is_empty() {
        error!("empty JSON data received");
        return error_body(StatusCode::BAD_REQUEST, "Empty JSON data");
    }

    let processing = if app.service.processing_enabled() { "enabled" } else { "disabled" };
    info!(
        "received data from {}, seq_no={}, devices={}, processing={}",
        ip,
        payload.seq_label(),
        payload.devices().len(),
        processing
    );

    let forward_results = app.service.process_and_forward(payload).await;
    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": "Data received and forwarded",
            "forward_results": forward_results,
        })),
    )
        .into_response()
}

// GET /api/device/{ble_addr}
async fn get_device_data(State(app): State<AppState>, Path(ble_addr): Path<String>) -> Response {
    match app.service.query_device(&ble_addr) {
        Some(view) => (StatusCode::OK, Json(json!({"success": true, "data": view}))).into_response(),
        None => error_body(StatusCode::NOT_FOUND, "Device not found"),
    }
}

// GET /api/cache/stats
async fn get_cache_stats(State(app): State<AppState>) -> Response {
    Json(app.service.cache_stats()).into_response()
}

// POST /api/cache/expire?max_age_days=N
async fn expire_cache(State(app): State<AppState>, Query(params): Query<ExpireParams>) -> Response {
    let removed = app.service.expire_older_than(params.max_age_days);
    Json(json!({"removed": removed})).into_response()
}

// GET /health
async fn health_check(State(app): State<AppState>) -> Response {
    Json(app.health.report()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::clock::ManualClock;
    use crate::config::ForwardTarget;
    use crate::dispatcher::ForwardDispatcher;
    use crate::resolver::ResolverSettings;
    use brt_devkit::{GatewayPayloadBuilder, MockTarget};
    use std::time::Duration;
    use tokio::net::TcpListener;

    const TOKEN: &str = "your-secret-token-123";

    struct Running {
        base: String,
        cache: Arc<CacheStore>,
        client: reqwest::Client,
    }

    async fn spawn_app(auth: AuthConf, targets: Vec<ForwardTarget>) -> Running {
        spawn_app_with_limit(auth, targets, 2 * 1024 * 1024).await
    }

    async fn spawn_app_with_limit(auth: AuthConf, targets: Vec<ForwardTarget>, max_body_bytes: usize) -> Running {
        let cache = Arc::new(CacheStore::new());
        let service = ForwarderService::new(
            cache.clone(),
            ResolverSettings::new(["co2", "voc"], ["FFFF", "FFFE"], true),
            targets,
            Arc::new(ManualClock::new(1_700_000_000)),
            ForwardDispatcher::new(),
        );
        let state = AppState {
            service: Arc::new(service),
            health: HealthTracker::new(),
            auth: Arc::new(auth),
            max_body_bytes,
        };
        let app = build_router(state, "/receive_brt_data");

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .unwrap();
        });

        Running { base: format!("http://{addr}"), cache, client: reqwest::Client::new() }
    }

    fn auth_on() -> AuthConf {
        AuthConf { enabled: true, valid_tokens: vec![TOKEN.into()], ..AuthConf::default() }
    }

    fn sample() -> serde_json::Value {
        GatewayPayloadBuilder::new(1)
            .device("E7E8F5F8C9A4", 1_700_000_000)
            .metric("co2", "0234")
            .metric("voc", "FFFF")
            .done()
            .build()
    }

    #[test]
    fn test_auth_rules() {
        let auth = auth_on();
        let mut headers = HeaderMap::new();
        assert!(!is_authorized(&auth, &headers, None));
        assert!(is_authorized(&auth, &headers, Some(TOKEN)));
        assert!(!is_authorized(&auth, &headers, Some("wrong")));

        headers.insert("authorization", TOKEN.parse().unwrap());
        assert!(is_authorized(&auth, &headers, None));
        assert!(is_authorized(&auth, &headers, Some("wrong")));

        let empty_list = AuthConf { enabled: true, ..AuthConf::default() };
        assert!(is_authorized(&empty_list, &HeaderMap::new(), None));
        assert!(is_authorized(&AuthConf::default(), &HeaderMap::new(), None));
    }

    #[tokio::test]
    async fn test_health_needs_no_token() {
        let app = spawn_app(auth_on(), Vec::new()).await;
        let resp = app.client.get(format!("{}/health", app.base)).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["version"], crate::health::VERSION);
    }

    #[tokio::test]
    async fn test_receive_requires_token() {
        let app = spawn_app(auth_on(), Vec::new()).await;
        let url = format!("{}/receive_brt_data", app.base);

        let resp = app.client.post(&url).json(&sample()).send().await.unwrap();
        assert_eq!(resp.status(), 401);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body, json!({"success": false, "error": "Unauthorized"}));

        let resp = app.client.post(&url).header("Authorization", TOKEN).json(&sample()).send().await.unwrap();
        assert_eq!(resp.status(), 200);

        let resp = app
            .client
            .post(format!("{url}?auth_token={TOKEN}"))
            .json(&sample())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn test_receive_rejects_bad_payloads() {
        let app = spawn_app(AuthConf::default(), Vec::new()).await;
        let url = format!("{}/receive_brt_data", app.base);

        let resp = app.client.post(&url).body("not json").send().await.unwrap();
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "Invalid JSON data");

        let resp = app.client.post(&url).json(&json!({})).send().await.unwrap();
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "Empty JSON data");
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let app = spawn_app_with_limit(AuthConf::default(), Vec::new(), 256).await;
        let url = format!("{}/receive_brt_data", app.base);

        let big = json!({"seq_no": 1, "note": "x".repeat(1024), "devices": []});
        let resp = app.client.post(&url).json(&big).send().await.unwrap();
        assert_eq!(resp.status(), 413);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "Payload too large");

        let resp = app.client.post(&url).json(&json!({"seq_no": 2, "devices": []})).send().await.unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn test_loose_header_fields_are_forwarded_verbatim() {
        let target = MockTarget::builder().fallback(200).start().await.unwrap();
        let app = spawn_app(
            AuthConf::default(),
            vec![ForwardTarget::new(target.url(), Duration::from_secs(2))],
        )
        .await;

        let raw = json!({
            "seq_no": "12",
            "cmd": "267",
            "cbid": null,
            "devices": [{"ble_addr": "E7E8F5F8C9A4", "scan_time": 1_700_000_000.5, "co2": "0234"}]
        });
        let resp = app
            .client
            .post(format!("{}/receive_brt_data", app.base))
            .json(&raw)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(target.received()[0].body, raw);
        assert_eq!(app.cache.get("E7E8F5F8C9A4", "co2").unwrap().scan_time, 1_700_000_000);
    }

    #[tokio::test]
    async fn test_forward_failure_still_reports_success() {
        let down = MockTarget::builder().fallback(500).start().await.unwrap();
        let up = MockTarget::builder().fallback(200).start().await.unwrap();
        let targets = vec![
            ForwardTarget::new(down.url(), Duration::from_secs(2)),
            ForwardTarget::new(up.url(), Duration::from_secs(2)),
        ];
        let app = spawn_app(AuthConf::default(), targets).await;

        let resp = app
            .client
            .post(format!("{}/receive_brt_data", app.base))
            .json(&sample())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "Data received and forwarded");
        assert_eq!(
            body["forward_results"],
            json!([
                {"url": down.url(), "success": false, "attempts": 1},
                {"url": up.url(), "success": true, "attempts": 1}
            ])
        );
        assert_eq!(app.cache.get("E7E8F5F8C9A4", "co2").unwrap().value, "0234");
    }

    #[tokio::test]
    async fn test_device_query_and_cache_admin() {
        let app = spawn_app(AuthConf::default(), Vec::new()).await;

        let resp = app.client.get(format!("{}/api/device/E7E8F5F8C9A4", app.base)).send().await.unwrap();
        assert_eq!(resp.status(), 404);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "Device not found");

        app.cache.put("E7E8F5F8C9A4", "co2", "0234", 10, 1_000);
        let resp = app.client.get(format!("{}/api/device/E7E8F5F8C9A4", app.base)).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["data"]["ble_addr"], "E7E8F5F8C9A4");
        assert_eq!(
            body["data"]["cached_metrics"]["co2"],
            json!({"value": "0234", "scan_time": 10, "updated_at": 1_000})
        );

        let stats: serde_json::Value = app
            .client
            .get(format!("{}/api/cache/stats", app.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats, json!({"device_count": 1, "metric_count": 1, "dirty": true}));

        let expired: serde_json::Value = app
            .client
            .post(format!("{}/api/cache/expire?max_age_days=30", app.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(expired["removed"], 1);
    }
}
