/**
 * API REST POWERMON - Serveur HTTP principal du kernel
 *
 * RÔLE :
 * Ce module expose l'API REST sécurisée du moniteur de compteurs pour
 * interactions humaines. Interface principale entre frontend et moteurs.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum avec middleware auth API key
 * - Routes organisées : /api/health, /api/areas, /api/monitoring,
 *   /api/pairing, plus le canal push /ws
 * - Sérialisation JSON automatique des réponses
 * - Erreurs métier uniformes : `{"error": "..."}` avec le bon code HTTP
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sauf /api/health et /ws
 * - Validation côté middleware avant traitement métier
 */

use crate::clock::now_rfc3339;
use crate::error::ApiError;
use crate::hub::Hub;
use crate::monitoring::{MonitoringEngine, MonitoringStarted, SessionData, SessionView};
use crate::pairing::{PairingEngine, PairingSession};
use crate::state::AreaRegistry;
use crate::store::SharedStore;
use crate::testrun::{TestEngine, TestResult, TestStarted};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    let path = req.uri().path();

    // Health check et canal push toujours accessibles
    if path.starts_with("/api/health") || path.starts_with("/ws") {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var("POWERMON_API_KEY").unwrap_or_default();
    if expected.is_empty() {
        log::error!("SECURITY: POWERMON_API_KEY not set - API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

#[derive(Clone)]
pub struct AppState {
    pub registry: AreaRegistry,
    pub store: SharedStore,
    pub hub: Hub,
    pub pairing: PairingEngine,
    pub test_engine: TestEngine,
    pub monitoring: MonitoringEngine,
}

#[derive(Debug, Deserialize)]
struct AreaBody {
    #[serde(rename = "areaId")]
    area_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TestResultParams {
    #[serde(rename = "areaId")]
    area_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MonitoringStartBody {
    #[serde(rename = "areaIds")]
    area_ids: Option<Vec<String>>,
    duration: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct PairingStartBody {
    #[serde(rename = "areaId")]
    area_id: Option<String>,
    duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RenameBody {
    ieee_address: Option<String>,
    new_name: Option<String>,
    #[serde(rename = "baseTopic")]
    base_topic: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoveBody {
    ieee_address: Option<String>,
    #[serde(default = "default_force")]
    force: bool,
    #[serde(rename = "baseTopic")]
    base_topic: Option<String>,
}

fn default_force() -> bool {
    true
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(get_health))
        .route("/api/areas", get(get_areas))
        .route("/api/start-test", post(start_test))
        .route("/api/stop-test", post(stop_test))
        .route("/api/test-result", get(get_test_result))
        .route("/api/monitoring/start", post(start_monitoring))
        .route("/api/monitoring/stop/{monitoring_id}", post(stop_monitoring))
        .route("/api/monitoring/sessions", get(list_sessions))
        .route("/api/monitoring/sessions/{monitoring_id}", get(get_session_data))
        .route("/api/pairing/start", post(start_pairing))
        .route("/api/pairing/stop", post(stop_pairing))
        .route("/api/pairing/status", get(get_pairing_status))
        .route("/api/pairing/rename", post(rename_device))
        .route("/api/pairing/remove", post(remove_device))
        .route("/ws", get(ws_upgrade))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

// GET /api/health
async fn get_health(State(app): State<AppState>) -> Json<serde_json::Value> {
    let areas: Vec<serde_json::Value> = app
        .registry
        .areas()
        .iter()
        .map(|a| serde_json::json!({"id": a.id, "name": a.name}))
        .collect();
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": now_rfc3339(),
        "areas": areas,
    }))
}

// GET /api/areas (identités + annuaire + état runtime)
async fn get_areas(State(app): State<AppState>) -> Json<serde_json::Value> {
    let runtime = app.registry.snapshot();
    let areas: Vec<serde_json::Value> = app
        .registry
        .areas()
        .iter()
        .map(|a| {
            let stats = app
                .store
                .lock()
                .device_stats(&a.mqtt_topic)
                .unwrap_or_else(|e| {
                    log::error!("[http] device stats failed for {}: {e}", a.id);
                    Default::default()
                });
            serde_json::json!({
                "id": a.id,
                "name": a.name,
                "mqttTopic": a.mqtt_topic,
                "deviceCount": stats.device_count,
                "devicesOnline": stats.devices_online,
                "devicesOffline": stats.devices_offline,
                "state": runtime.get(&a.id),
            })
        })
        .collect();
    Json(serde_json::json!({ "areas": areas }))
}

// POST /api/start-test
async fn start_test(
    State(app): State<AppState>,
    Json(body): Json<AreaBody>,
) -> Result<Json<TestStarted>, ApiError> {
    let area_id = body
        .area_id
        .ok_or_else(|| ApiError::validation("Missing areaId"))?;
    Ok(Json(app.test_engine.start(&area_id)?))
}

// POST /api/stop-test
async fn stop_test(
    State(app): State<AppState>,
    Json(body): Json<AreaBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let area_id = body
        .area_id
        .ok_or_else(|| ApiError::validation("Missing areaId"))?;
    app.test_engine.stop(&area_id)?;
    Ok(Json(serde_json::json!({ "success": true })))
}

// GET /api/test-result?areaId=
async fn get_test_result(
    State(app): State<AppState>,
    Query(params): Query<TestResultParams>,
) -> Result<Json<TestResult>, ApiError> {
    let area_id = params
        .area_id
        .ok_or_else(|| ApiError::validation("Missing areaId"))?;
    Ok(Json(app.test_engine.result(&area_id)?))
}

// POST /api/monitoring/start
async fn start_monitoring(
    State(app): State<AppState>,
    Json(body): Json<MonitoringStartBody>,
) -> Result<Json<MonitoringStarted>, ApiError> {
    let area_ids = body
        .area_ids
        .ok_or_else(|| ApiError::validation("Missing or invalid areaIds"))?;
    let duration = body
        .duration
        .ok_or_else(|| ApiError::validation("Duration must be between 1 and 12 hours"))?;
    Ok(Json(app.monitoring.start(&area_ids, duration)?))
}

// POST /api/monitoring/stop/{monitoring_id}
async fn stop_monitoring(
    State(app): State<AppState>,
    Path(monitoring_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if app.monitoring.stop(&monitoring_id)? {
        Ok(Json(serde_json::json!({ "success": true })))
    } else {
        Err(ApiError::not_found(
            "Monitoring session not found or already stopped",
        ))
    }
}

// GET /api/monitoring/sessions
async fn list_sessions(
    State(app): State<AppState>,
) -> Result<Json<Vec<SessionView>>, ApiError> {
    Ok(Json(app.monitoring.list_sessions()?))
}

// GET /api/monitoring/sessions/{monitoring_id}
async fn get_session_data(
    State(app): State<AppState>,
    Path(monitoring_id): Path<String>,
) -> Result<Json<SessionData>, ApiError> {
    Ok(Json(app.monitoring.session_data(&monitoring_id)?))
}

// POST /api/pairing/start
async fn start_pairing(
    State(app): State<AppState>,
    Json(body): Json<PairingStartBody>,
) -> Result<Json<PairingSession>, ApiError> {
    let area_id = body
        .area_id
        .ok_or_else(|| ApiError::validation("Missing areaId"))?;
    Ok(Json(app.pairing.start(&area_id, body.duration).await?))
}

// POST /api/pairing/stop
async fn stop_pairing(State(app): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let was_active = app.pairing.stop().await?;
    Ok(Json(serde_json::json!({ "success": true, "wasActive": was_active })))
}

// GET /api/pairing/status
async fn get_pairing_status(State(app): State<AppState>) -> Json<serde_json::Value> {
    match app.pairing.status() {
        Some(session) => Json(serde_json::json!({ "active": true, "session": session })),
        None => Json(serde_json::json!({ "active": false })),
    }
}

// POST /api/pairing/rename
async fn rename_device(
    State(app): State<AppState>,
    Json(body): Json<RenameBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ieee = body
        .ieee_address
        .ok_or_else(|| ApiError::validation("Missing ieee_address"))?;
    let new_name = body
        .new_name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| ApiError::validation("Missing new_name"))?;
    app.pairing.rename(&ieee, &new_name, body.base_topic).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

// POST /api/pairing/remove
async fn remove_device(
    State(app): State<AppState>,
    Json(body): Json<RemoveBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ieee = body
        .ieee_address
        .ok_or_else(|| ApiError::validation("Missing ieee_address"))?;
    app.pairing.remove(&ieee, body.force, body.base_topic).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

// GET /ws (snapshot init puis deltas state_update)
async fn ws_upgrade(State(app): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let snapshot = init_snapshot(&app);
    let hub = app.hub.clone();
    ws.on_upgrade(move |socket| hub.handle_socket(socket, snapshot))
}

/// Snapshot complet envoyé à chaque nouvel observateur : identités de
/// zones, annuaire et état runtime au moment de la connexion.
fn init_snapshot(app: &AppState) -> serde_json::Value {
    let runtime = app.registry.snapshot();
    let areas: Vec<serde_json::Value> = app
        .registry
        .areas()
        .iter()
        .map(|a| {
            let stats = app
                .store
                .lock()
                .device_stats(&a.mqtt_topic)
                .unwrap_or_default();
            serde_json::json!({
                "id": a.id,
                "name": a.name,
                "deviceCount": stats.device_count,
                "devicesOnline": stats.devices_online,
                "devicesOffline": stats.devices_offline,
                "state": runtime.get(&a.id),
            })
        })
        .collect();
    serde_json::json!({ "type": "init", "areas": areas })
}
