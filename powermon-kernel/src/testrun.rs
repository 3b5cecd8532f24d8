/*!
Moteur de test diagnostique : capture éphémère de 10 minutes par zone.

Tout reste en mémoire : chaque message de télémétrie est replié dans le
MeterTrack du compteur concerné puis oublié. À l'arrêt (manuel ou timer),
les métriques sont gelées et restent lisibles jusqu'au prochain start sur
la même zone.
*/

use crate::clock::{ms_to_rfc3339, now_ms};
use crate::error::ApiError;
use crate::hub::Hub;
use crate::models::{AreaStatus, TelemetryIn};
use crate::state::{new_state, AreaRegistry, Shared};
use crate::stats::{MeterReport, MeterTrack};
use serde::Serialize;
use std::collections::HashMap;
use tokio::task::AbortHandle;

pub const TEST_DURATION_SECS: u64 = 600;

/// Session de test d'une zone. Au plus une active par zone; le dernier
/// snapshot reste lisible (active = false) après l'arrêt.
struct TestRun {
    active: bool,
    started_at_ms: i64,
    duration_secs: u64,
    meters: HashMap<String, MeterTrack>,
    timer: Option<AbortHandle>,
}

#[derive(Clone)]
pub struct TestEngine {
    registry: AreaRegistry,
    hub: Hub,
    tests: Shared<HashMap<String, TestRun>>,
}

#[derive(Debug, Serialize)]
pub struct TestStarted {
    pub success: bool,
    pub duration: u64,
    #[serde(rename = "startTime")]
    pub start_time: String,
}

#[derive(Debug, Serialize)]
pub struct TestResult {
    pub area: AreaInfo,
    #[serde(rename = "startedAt")]
    pub started_at: String,
    #[serde(rename = "durationSeconds")]
    pub duration_seconds: i64,
    pub active: bool,
    pub meters: Vec<MeterReport>,
}

#[derive(Debug, Serialize)]
pub struct AreaInfo {
    pub id: String,
    pub name: String,
}

impl TestEngine {
    pub fn new(registry: AreaRegistry, hub: Hub) -> Self {
        Self {
            registry,
            hub,
            tests: new_state(HashMap::new()),
        }
    }

    pub fn start(&self, area_id: &str) -> Result<TestStarted, ApiError> {
        let area = self
            .registry
            .area_by_id(area_id)
            .ok_or_else(|| ApiError::not_found("Area not found"))?
            .clone();

        {
            let mut tests = self.tests.lock();
            if tests.get(area_id).map(|t| t.active).unwrap_or(false) {
                return Err(ApiError::conflict("Test already running for this area"));
            }
            // écrase le snapshot gelé du test précédent
            tests.insert(
                area_id.to_string(),
                TestRun {
                    active: true,
                    started_at_ms: now_ms(),
                    duration_secs: TEST_DURATION_SECS,
                    meters: HashMap::new(),
                    timer: None,
                },
            );
        }

        self.registry.set_status(area_id, AreaStatus::TestRunning);
        self.hub
            .broadcast_area(area_id, serde_json::json!({"status": "test_running"}));

        // auto-stop armé pour exactement 600s; le flag actif est re-vérifié
        // au tir pour qu'un timer en retard après stop manuel soit un no-op
        let engine = self.clone();
        let id = area_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(TEST_DURATION_SECS)).await;
            engine.auto_stop(&id);
        });
        if let Some(run) = self.tests.lock().get_mut(area_id) {
            run.timer = Some(handle.abort_handle());
        }

        log::info!("[test] started 10-minute test for {}", area.name);
        Ok(TestStarted {
            success: true,
            duration: TEST_DURATION_SECS,
            start_time: crate::clock::now_rfc3339(),
        })
    }

    pub fn stop(&self, area_id: &str) -> Result<(), ApiError> {
        {
            let mut tests = self.tests.lock();
            let run = tests
                .get_mut(area_id)
                .filter(|t| t.active)
                .ok_or_else(|| ApiError::validation("No test running for this area"))?;
            run.active = false;
            if let Some(timer) = run.timer.take() {
                timer.abort();
            }
        }
        self.registry.set_status(area_id, AreaStatus::Idle);
        self.hub
            .broadcast_area(area_id, serde_json::json!({"status": "idle"}));
        log::info!("[test] stopped test for area {area_id}");
        Ok(())
    }

    fn auto_stop(&self, area_id: &str) {
        let stopped = {
            let mut tests = self.tests.lock();
            match tests.get_mut(area_id).filter(|t| t.active) {
                Some(run) => {
                    run.active = false;
                    run.timer = None;
                    true
                }
                None => false,
            }
        };
        if stopped {
            self.registry.set_status(area_id, AreaStatus::Idle);
            self.hub.broadcast_area(
                area_id,
                serde_json::json!({"status": "idle", "testCompleted": true}),
            );
            log::info!("[test] auto-stopped test for area {area_id}");
        }
    }

    /// Télémétrie entrante : ignorée dès que le flag actif est retombé.
    pub fn handle_telemetry(
        &self,
        area_id: &str,
        meter_name: &str,
        telemetry: &TelemetryIn,
        now_ms: i64,
    ) {
        let mut tests = self.tests.lock();
        let Some(run) = tests.get_mut(area_id).filter(|t| t.active) else {
            return;
        };
        let track = run.meters.entry(meter_name.to_string()).or_default();
        let obs = track.observe(now_ms, telemetry);
        if let Some(gap) = obs.gap_ms {
            log::info!("[test] gap detected for {meter_name}: {}s", gap / 1000);
        }
    }

    /// Agrégation au moment de la lecture depuis les métriques en mémoire
    /// (gelées si le test est terminé).
    pub fn result(&self, area_id: &str) -> Result<TestResult, ApiError> {
        let area = self
            .registry
            .area_by_id(area_id)
            .ok_or_else(|| ApiError::not_found("Area not found"))?;

        let tests = self.tests.lock();
        let run = tests
            .get(area_id)
            .ok_or_else(|| ApiError::validation("No test data for this area yet"))?;

        let now = now_ms();
        let end_ms = if run.active {
            now
        } else {
            now.min(run.started_at_ms + (run.duration_secs as i64) * 1000)
        };
        let duration_seconds = ((end_ms - run.started_at_ms) as f64 / 1000.0).round() as i64;

        let mut meters: Vec<MeterReport> = run
            .meters
            .iter()
            .map(|(name, track)| track.report(name))
            .collect();
        meters.sort_by(|a, b| a.meter_name.cmp(&b.meter_name));

        Ok(TestResult {
            area: AreaInfo {
                id: area.id.clone(),
                name: area.name.clone(),
            },
            started_at: ms_to_rfc3339(run.started_at_ms),
            duration_seconds,
            active: run.active,
            meters,
        })
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AreaConf;

    fn engine() -> TestEngine {
        let registry = AreaRegistry::new(vec![AreaConf {
            id: "1".into(),
            name: "100 området".into(),
            mqtt_topic: "zigbee2mqtt".into(),
        }]);
        TestEngine::new(registry, Hub::new())
    }

    fn telemetry(lqi: Option<f64>, state: Option<&str>) -> TelemetryIn {
        TelemetryIn {
            linkquality: lqi,
            state: state.map(Into::into),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn start_rejects_unknown_area_and_double_start() {
        let engine = engine();
        assert!(matches!(engine.start("42"), Err(ApiError::NotFound(_))));
        engine.start("1").unwrap();
        assert!(matches!(engine.start("1"), Err(ApiError::Conflict(_))));
    }

    #[tokio::test]
    async fn stop_without_active_test_is_a_validation_error() {
        let engine = engine();
        assert!(matches!(engine.stop("1"), Err(ApiError::Validation(_))));
    }

    #[tokio::test]
    async fn metrics_freeze_after_stop() {
        let engine = engine();
        engine.start("1").unwrap();
        let base = now_ms();
        engine.handle_telemetry("1", "meter_101", &telemetry(Some(100.0), Some("ON")), base);
        engine.handle_telemetry(
            "1",
            "meter_101",
            &telemetry(Some(150.0), Some("OFF")),
            base + 1_000,
        );
        engine.stop("1").unwrap();

        // après l'arrêt, les messages n'altèrent plus les métriques gelées
        engine.handle_telemetry(
            "1",
            "meter_101",
            &telemetry(Some(10.0), Some("ON")),
            base + 2_000,
        );

        let result = engine.result("1").unwrap();
        assert!(!result.active);
        assert_eq!(result.meters.len(), 1);
        let meter = &result.meters[0];
        assert_eq!(meter.message_count, 2);
        assert_eq!(meter.avg_lqi, Some(125.0));
        assert_eq!(meter.state_changes, 1);

        // le statut de zone est retombé à idle
        assert_eq!(
            engine.registry.runtime("1").unwrap().status,
            AreaStatus::Idle
        );
    }

    #[tokio::test]
    async fn auto_stop_freezes_metrics_and_reverts_status() {
        let engine = engine();
        engine.start("1").unwrap();
        let base = now_ms();
        engine.handle_telemetry("1", "meter_101", &telemetry(Some(100.0), Some("ON")), base);

        engine.auto_stop("1");

        let result = engine.result("1").unwrap();
        assert!(!result.active);
        assert_eq!(result.meters[0].message_count, 1);
        assert_eq!(
            engine.registry.runtime("1").unwrap().status,
            AreaStatus::Idle
        );

        // la télémétrie tardive n'altère plus le snapshot gelé
        engine.handle_telemetry(
            "1",
            "meter_101",
            &telemetry(Some(10.0), Some("OFF")),
            base + 1_000,
        );
        assert_eq!(engine.result("1").unwrap().meters[0].message_count, 1);
    }

    #[tokio::test]
    async fn late_auto_stop_after_manual_stop_is_a_noop() {
        let engine = engine();
        engine.start("1").unwrap();
        engine.stop("1").unwrap();

        // statut sentinelle : un auto-stop qui agirait le remettrait à idle
        engine.registry.set_status("1", AreaStatus::Monitoring);
        engine.auto_stop("1");
        assert_eq!(
            engine.registry.runtime("1").unwrap().status,
            AreaStatus::Monitoring
        );

        // et sans aucun test enregistré, rien ne se passe non plus
        engine.auto_stop("42");
    }

    #[tokio::test]
    async fn restart_overwrites_frozen_snapshot() {
        let engine = engine();
        engine.start("1").unwrap();
        engine.handle_telemetry("1", "meter_101", &telemetry(Some(80.0), None), now_ms());
        engine.stop("1").unwrap();

        engine.start("1").unwrap();
        let result = engine.result("1").unwrap();
        assert!(result.active);
        assert!(result.meters.is_empty());
    }

    #[tokio::test]
    async fn gaps_are_tracked_per_meter() {
        let engine = engine();
        engine.start("1").unwrap();
        let base = now_ms();
        engine.handle_telemetry("1", "meter_101", &telemetry(None, None), base);
        engine.handle_telemetry("1", "meter_101", &telemetry(None, None), base + 95_000);
        engine.handle_telemetry("1", "meter_102", &telemetry(None, None), base + 95_000);

        let result = engine.result("1").unwrap();
        let m101 = result.meters.iter().find(|m| m.meter_name == "meter_101").unwrap();
        let m102 = result.meters.iter().find(|m| m.meter_name == "meter_102").unwrap();
        assert_eq!(m101.gap_count, 1);
        assert_eq!(m101.max_gap_ms, 95_000);
        assert_eq!(m102.gap_count, 0);
    }
}
