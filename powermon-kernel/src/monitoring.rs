/*!
Moteur de monitoring : sessions durables multi-zones de 1 à 12 heures.

Chaque échantillon est persisté tel quel dans le store; les événements
dérivés (state_change, gap, low_lqi) sont évalués indépendamment par
message et persistés à part. Les statistiques par compteur sont re-calculées
à la lecture par scan des lignes durables triées par timestamp : les données
restent exploitables après un redémarrage du process, au prix d'une lecture
O(n).

Invariant : les ensembles de zones des sessions actives sont deux à deux
disjoints, vérifié au démarrage de session contre le shadow mémoire ET les
lignes actives du store.
*/

use crate::clock::{ms_to_rfc3339, now_ms, now_rfc3339};
use crate::error::ApiError;
use crate::hub::Hub;
use crate::models::{AreaStatus, TelemetryIn};
use crate::state::{new_state, AreaRegistry, Shared};
use crate::stats::{MeterReport, MeterTrack, GAP_THRESHOLD_MS, LOW_LQI_THRESHOLD};
use crate::store::{SessionRow, SharedStore};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tokio::task::AbortHandle;

pub const MIN_DURATION_HOURS: u32 = 1;
pub const MAX_DURATION_HOURS: u32 = 12;

/// Image mémoire d'une session active, pour router les messages sans
/// toucher au store. Les derniers états/timestamps par compteur servent à
/// dériver les événements; la vérité durable reste dans les échantillons.
struct Shadow {
    area_ids: HashSet<String>,
    active: bool,
    last_seen_ms: HashMap<String, i64>,
    last_state: HashMap<String, String>,
    state_change_counts: HashMap<String, u64>,
    timer: Option<AbortHandle>,
}

#[derive(Clone)]
pub struct MonitoringEngine {
    registry: AreaRegistry,
    hub: Hub,
    store: SharedStore,
    shadows: Shared<HashMap<String, Shadow>>,
}

#[derive(Debug, Serialize)]
pub struct MonitoringStarted {
    pub success: bool,
    #[serde(rename = "monitoringId")]
    pub monitoring_id: String,
    #[serde(rename = "startTime")]
    pub start_time: String,
    #[serde(rename = "estimatedEndTime")]
    pub estimated_end_time: String,
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    pub id: String,
    #[serde(rename = "areaIds")]
    pub area_ids: Vec<String>,
    #[serde(rename = "areaNames")]
    pub area_names: Vec<String>,
    #[serde(rename = "startTime")]
    pub start_time: String,
    #[serde(rename = "endTime")]
    pub end_time: Option<String>,
    #[serde(rename = "durationSeconds")]
    pub duration_seconds: i64,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct SessionData {
    pub session: SessionView,
    pub meters: Vec<MeterReport>,
}

impl MonitoringEngine {
    pub fn new(registry: AreaRegistry, hub: Hub, store: SharedStore) -> Self {
        Self {
            registry,
            hub,
            store,
            shadows: new_state(HashMap::new()),
        }
    }

    pub fn start(
        &self,
        area_ids: &[String],
        duration_hours: u32,
    ) -> Result<MonitoringStarted, ApiError> {
        if area_ids.is_empty() {
            return Err(ApiError::validation("Missing or invalid areaIds"));
        }
        if !(MIN_DURATION_HOURS..=MAX_DURATION_HOURS).contains(&duration_hours) {
            return Err(ApiError::validation(
                "Duration must be between 1 and 12 hours",
            ));
        }
        for id in area_ids {
            if self.registry.area_by_id(id).is_none() {
                return Err(ApiError::validation("One or more invalid area IDs"));
            }
        }

        let requested: HashSet<&String> = area_ids.iter().collect();

        let start_ms = now_ms();
        let monitoring_id = format!("mon_{start_ms}");
        let duration_seconds = duration_hours as i64 * 3600;
        let start_time = now_rfc3339();

        let row = SessionRow {
            id: monitoring_id.clone(),
            area_ids: area_ids.to_vec(),
            start_time: start_time.clone(),
            end_time: None,
            duration_seconds,
            status: "active".into(),
        };

        // section critique unique : les deux vérifications de disjonction et
        // les deux insertions se font sous le verrou des shadows, pour que
        // deux starts concurrents se sérialisent (même ordre de verrous
        // shadows -> store que stop())
        {
            let mut shadows = self.shadows.lock();

            // disjonction contre les sessions routées en mémoire
            let overlap = shadows
                .values()
                .filter(|s| s.active)
                .any(|s| s.area_ids.iter().any(|id| requested.contains(id)));
            if overlap {
                return Err(ApiError::conflict(
                    "Monitoring already active for one or more selected areas",
                ));
            }

            let store = self.store.lock();
            // et contre les lignes actives du store (sessions survivant à
            // un redémarrage, dont les timers sont perdus)
            let active_rows = store.active_sessions()?;
            let overlap = active_rows
                .iter()
                .any(|row| row.area_ids.iter().any(|id| requested.contains(id)));
            if overlap {
                return Err(ApiError::conflict(
                    "Monitoring already active for one or more selected areas",
                ));
            }

            store.insert_session(&row)?;
            shadows.insert(
                monitoring_id.clone(),
                Shadow {
                    area_ids: area_ids.iter().cloned().collect(),
                    active: true,
                    last_seen_ms: HashMap::new(),
                    last_state: HashMap::new(),
                    state_change_counts: HashMap::new(),
                    timer: None,
                },
            );
        }

        for id in area_ids {
            let mon_id = monitoring_id.clone();
            self.registry.update(id, |rt| {
                rt.status = AreaStatus::Monitoring;
                rt.monitoring_id = Some(mon_id);
            });
            self.hub.broadcast_area(
                id,
                serde_json::json!({"status": "monitoring", "monitoringId": monitoring_id}),
            );
        }

        // auto-stop à l'échéance; le flag actif est re-vérifié au tir
        let engine = self.clone();
        let timer_id = monitoring_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(duration_seconds as u64)).await;
            match engine.stop(&timer_id) {
                Ok(true) => log::info!("[monitoring] session {timer_id} expired"),
                Ok(false) => {} // déjà arrêtée manuellement
                Err(e) => log::error!("[monitoring] auto-stop of {timer_id} failed: {e}"),
            }
        });
        if let Some(shadow) = self.shadows.lock().get_mut(&monitoring_id) {
            shadow.timer = Some(handle.abort_handle());
        }

        log::info!("[monitoring] started session {monitoring_id} for {duration_hours}h");
        Ok(MonitoringStarted {
            success: true,
            monitoring_id,
            start_time,
            estimated_end_time: ms_to_rfc3339(start_ms + duration_seconds * 1000),
        })
    }

    /// Arrêt idempotent. Ok(false) si la session est inconnue ou déjà
    /// arrêtée — jamais une erreur.
    pub fn stop(&self, monitoring_id: &str) -> Result<bool, ApiError> {
        let stopped = self
            .store
            .lock()
            .mark_session_stopped(monitoring_id, &now_rfc3339())?;
        if !stopped {
            return Ok(false);
        }

        // le flag retombe de manière synchrone : les messages suivants sont
        // ignorés immédiatement, les écritures déjà parties se terminent
        let area_ids: Vec<String> = {
            let mut shadows = self.shadows.lock();
            if let Some(mut shadow) = shadows.remove(monitoring_id) {
                shadow.active = false;
                if let Some(timer) = shadow.timer.take() {
                    timer.abort();
                }
                shadow.area_ids.into_iter().collect()
            } else {
                // session d'un run précédent : zones depuis la ligne durable
                self.store
                    .lock()
                    .get_session(monitoring_id)?
                    .map(|row| row.area_ids)
                    .unwrap_or_default()
            }
        };

        for id in &area_ids {
            self.registry.update(id, |rt| {
                rt.status = AreaStatus::Idle;
                rt.monitoring_id = None;
            });
            self.hub
                .broadcast_area(id, serde_json::json!({"status": "idle"}));
        }

        log::info!("[monitoring] stopped session {monitoring_id}");
        Ok(true)
    }

    /// Télémétrie entrante, fan-out vers chaque session active couvrant la
    /// zone (au plus une grâce à l'invariant de disjonction).
    pub fn handle_telemetry(
        &self,
        area_id: &str,
        meter_name: &str,
        telemetry: &TelemetryIn,
        raw: &serde_json::Value,
        now_ms: i64,
    ) {
        let session_ids: Vec<String> = {
            let shadows = self.shadows.lock();
            shadows
                .iter()
                .filter(|(_, s)| s.active && s.area_ids.contains(area_id))
                .map(|(id, _)| id.clone())
                .collect()
        };

        for session_id in session_ids {
            if let Err(e) = self.persist_message(&session_id, meter_name, telemetry, raw, now_ms) {
                log::error!("[monitoring] persist failed for {session_id}/{meter_name}: {e}");
            }
        }
    }

    fn persist_message(
        &self,
        session_id: &str,
        meter_name: &str,
        telemetry: &TelemetryIn,
        raw: &serde_json::Value,
        now_ms: i64,
    ) -> Result<(), ApiError> {
        self.store
            .lock()
            .insert_sample(session_id, meter_name, now_ms, telemetry, raw)?;

        // trois dérivations indépendantes, cumulables sur un même message
        let mut events: Vec<(&str, serde_json::Value)> = Vec::new();
        {
            let mut shadows = self.shadows.lock();
            let Some(shadow) = shadows.get_mut(session_id).filter(|s| s.active) else {
                return Ok(());
            };

            if let Some(state) = &telemetry.state {
                let prev = shadow.last_state.get(meter_name).cloned();
                if let Some(prev) = prev {
                    if prev != *state {
                        let count = shadow
                            .state_change_counts
                            .entry(meter_name.to_string())
                            .or_insert(0);
                        *count += 1;
                        events.push((
                            "state_change",
                            serde_json::json!({"from": prev, "to": state, "count": *count}),
                        ));
                    }
                }
                shadow.last_state.insert(meter_name.to_string(), state.clone());
            }

            if let Some(last_seen) = shadow.last_seen_ms.get(meter_name).copied() {
                let gap = now_ms - last_seen;
                if gap > GAP_THRESHOLD_MS {
                    events.push((
                        "gap",
                        serde_json::json!({"gap_ms": gap, "last_seen": ms_to_rfc3339(last_seen)}),
                    ));
                    log::info!("[monitoring] gap detected for {meter_name}: {}s", gap / 1000);
                }
            }
            shadow.last_seen_ms.insert(meter_name.to_string(), now_ms);

            if let Some(lqi) = telemetry.linkquality {
                if lqi < LOW_LQI_THRESHOLD {
                    events.push(("low_lqi", serde_json::json!({"lqi": lqi})));
                }
            }
        }

        let store = self.store.lock();
        for (event_type, details) in events {
            store.insert_event(session_id, meter_name, event_type, now_ms, &details)?;
        }
        Ok(())
    }

    /// Les 50 sessions les plus récentes, annotées des noms de zones.
    pub fn list_sessions(&self) -> Result<Vec<SessionView>, ApiError> {
        let rows = self.store.lock().recent_sessions(50)?;
        Ok(rows.into_iter().map(|row| self.to_view(row)).collect())
    }

    /// Statistiques par compteur re-calculées par scan complet des
    /// échantillons durables, jamais lues depuis un agrégat pré-calculé.
    pub fn session_data(&self, monitoring_id: &str) -> Result<SessionData, ApiError> {
        let row = self
            .store
            .lock()
            .get_session(monitoring_id)?
            .ok_or_else(|| ApiError::not_found("Monitoring session not found"))?;

        let samples = self.store.lock().samples_for_session(monitoring_id)?;
        let mut tracks: HashMap<String, MeterTrack> = HashMap::new();
        for sample in samples {
            let telemetry = TelemetryIn {
                linkquality: sample.lqi,
                state: sample.state.clone(),
                ..Default::default()
            };
            tracks
                .entry(sample.meter_name)
                .or_default()
                .observe(sample.ts_ms, &telemetry);
        }

        let mut meters: Vec<MeterReport> = tracks
            .iter()
            .map(|(name, track)| track.report(name))
            .collect();
        meters.sort_by(|a, b| a.meter_name.cmp(&b.meter_name));

        Ok(SessionData {
            session: self.to_view(row),
            meters,
        })
    }

    fn to_view(&self, row: SessionRow) -> SessionView {
        let area_names = row
            .area_ids
            .iter()
            .map(|id| self.registry.area_name(id))
            .collect();
        SessionView {
            area_names,
            id: row.id,
            area_ids: row.area_ids,
            start_time: row.start_time,
            end_time: row.end_time,
            duration_seconds: row.duration_seconds,
            status: row.status,
        }
    }
}
