/*!
Moteur d'appairage : machine à états join / interview / configuration.

Un seul slot global : une seule fenêtre de join ouverte à la fois, toutes
zones confondues. Après une interview réussie, le compteur est classé
1-phasé ou 3-phasé d'après son modèle et reçoit le profil de configuration
correspondant, puis une impulsion OFF sur le relais comme confirmation
physique. Le ON final n'est envoyé qu'après l'acquittement du renommage
(déclenché par un humain) : la fin d'appairage automatique est découplée du
nommage manuel.
*/

use crate::clock::now_ms;
use crate::config::AreaConf;
use crate::error::ApiError;
use crate::hub::Hub;
use crate::models::{AreaStatus, BridgeEventIn, DeviceRef};
use crate::state::{new_state, AreaRegistry, Shared};
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use std::future::Future;
use tokio::task::AbortHandle;

/// Durée par défaut de la fenêtre de join (valeur max zigbee2mqtt).
pub const DEFAULT_JOIN_WINDOW_SECS: u64 = 254;

/// Modèles de compteurs 3-phasés (détection par sous-chaîne, insensible à
/// la casse).
pub const THREE_PHASE_MODELS: [&str; 3] = ["TS011F", "TOQCB2-80", "SPM02"];

/// Délai entre la publication du profil et l'impulsion OFF de confirmation.
const OFF_PULSE_DELAY_SECS: u64 = 2;
/// Délai entre l'ack de renommage et le ON final.
const ON_AFTER_RENAME_DELAY_SECS: u64 = 1;

/// Publication de commandes vers le bus. Le moteur est générique sur cette
/// couture pour que les tests enregistrent les messages sortants au lieu
/// de les pousser vers un vrai broker.
pub trait BusCommand: Clone + Send + Sync + 'static {
    fn publish_cmd(
        &self,
        topic: String,
        payload: String,
    ) -> impl Future<Output = Result<(), String>> + Send;
}

impl BusCommand for AsyncClient {
    fn publish_cmd(
        &self,
        topic: String,
        payload: String,
    ) -> impl Future<Output = Result<(), String>> + Send {
        let client = self.clone();
        async move {
            client
                .publish(topic, QoS::AtLeastOnce, false, payload)
                .await
                .map_err(|e| e.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingPhase {
    JoinWindowOpen,
    DeviceJoined,
    InterviewStarted,
    InterviewOk,
    InterviewFailed,
}

/// Session d'appairage éphémère : créée au start, détruite au stop.
#[derive(Debug, Clone, Serialize)]
pub struct PairingSession {
    #[serde(rename = "areaId")]
    pub area_id: String,
    #[serde(rename = "baseTopic")]
    pub base_topic: String,
    #[serde(rename = "startedAt")]
    pub started_at_ms: i64,
    pub phase: PairingPhase,
    #[serde(rename = "currentDevice")]
    pub current_device: Option<DeviceRef>,
    #[serde(rename = "deviceModel")]
    pub device_model: Option<String>,
    #[serde(rename = "isThreePhase")]
    pub is_three_phase: bool,
}

#[derive(Clone)]
pub struct PairingEngine<C: BusCommand = AsyncClient> {
    registry: AreaRegistry,
    hub: Hub,
    client: C,
    slot: Shared<Option<PairingSession>>,
    timer: Shared<Option<AbortHandle>>,
}

pub fn is_three_phase(model: &str) -> bool {
    let upper = model.to_uppercase();
    THREE_PHASE_MODELS.iter().any(|m| upper.contains(m))
}

/// Profil de configuration publié sur `<bt>/<device>/set` après interview.
pub fn phase_profile(three_phase: bool) -> serde_json::Value {
    if three_phase {
        serde_json::json!({
            "state": "ON",
            "current_threshold": 63,
            "over_current_setting": "trip",
            "over_voltage_setting": "trip",
            "over_voltage_threshold": 280,
            "under_voltage_setting": "alarm",
            "under_voltage_threshold": 165,
            "temperature_setting": "trip",
            "temperature_threshold": 80,
        })
    } else {
        serde_json::json!({
            "state": "ON",
            "power_outage_memory": "restore",
            "indicator_mode": "on_off",
        })
    }
}

impl<C: BusCommand> PairingEngine<C> {
    pub fn new(registry: AreaRegistry, hub: Hub, client: C) -> Self {
        Self {
            registry,
            hub,
            client,
            slot: new_state(None),
            timer: new_state(None),
        }
    }

    /// Ouvre la fenêtre de join sur une zone. Un seul appairage actif dans
    /// tout le système : le slot est réservé avant le publish pour que deux
    /// starts concurrents ne puissent pas tous deux le voir libre.
    pub async fn start(
        &self,
        area_id: &str,
        duration_secs: Option<u64>,
    ) -> Result<PairingSession, ApiError> {
        let area = self
            .registry
            .area_by_id(area_id)
            .ok_or_else(|| ApiError::validation("Invalid areaId"))?
            .clone();
        let duration = duration_secs.unwrap_or(DEFAULT_JOIN_WINDOW_SECS);

        let session = PairingSession {
            area_id: area.id.clone(),
            base_topic: area.mqtt_topic.clone(),
            started_at_ms: now_ms(),
            phase: PairingPhase::JoinWindowOpen,
            current_device: None,
            device_model: None,
            is_three_phase: false,
        };
        {
            let mut slot = self.slot.lock();
            if slot.is_some() {
                return Err(ApiError::conflict("Pairing already active"));
            }
            *slot = Some(session.clone());
        }

        let topic = format!("{}/bridge/request/permit_join", area.mqtt_topic);
        let payload = serde_json::json!({ "time": duration }).to_string();
        if let Err(e) = self.client.publish_cmd(topic, payload).await {
            // échec d'ouverture : la réservation est rendue
            *self.slot.lock() = None;
            return Err(ApiError::upstream(format!(
                "Failed to send permit_join command: {e}"
            )));
        }
        self.registry.update(&area.id, |rt| rt.current_device = None);

        self.hub.broadcast_area(
            &area.id,
            serde_json::json!({"pairing": "started", "duration": duration}),
        );

        // fermeture automatique à l'échéance de la fenêtre
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(duration)).await;
            if engine.slot.lock().is_some() {
                log::info!("[pairing] join window expired, closing");
                let _ = engine.stop().await;
            }
        });
        if let Some(old) = self.timer.lock().replace(handle.abort_handle()) {
            old.abort();
        }

        log::info!(
            "[pairing] started on {} for {duration} seconds",
            area.mqtt_topic
        );
        Ok(session)
    }

    /// Ferme la fenêtre de join et détruit la session, quelle que soit la
    /// phase d'interview en cours. No-op si aucun appairage actif.
    pub async fn stop(&self) -> Result<bool, ApiError> {
        let Some(session) = self.slot.lock().take() else {
            return Ok(false);
        };
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }

        let topic = format!("{}/bridge/request/permit_join", session.base_topic);
        let payload = serde_json::json!({ "time": 0 }).to_string();
        if let Err(e) = self.client.publish_cmd(topic, payload).await {
            // la session est détruite quand même, on ne la ressuscite pas
            log::error!("[pairing] failed to close join window: {e}");
        }

        self.registry.update(&session.area_id, |rt| {
            rt.status = AreaStatus::Idle;
            rt.current_device = None;
        });
        self.hub.broadcast_area(
            &session.area_id,
            serde_json::json!({"pairing": "stopped", "status": "idle"}),
        );
        log::info!("[pairing] stopped on {}", session.base_topic);
        Ok(true)
    }

    pub fn status(&self) -> Option<PairingSession> {
        self.slot.lock().clone()
    }

    /// Commande de renommage, relayée au bridge. L'ack reviendra sur
    /// `<bt>/bridge/response/device/rename`.
    pub async fn rename(
        &self,
        ieee_address: &str,
        new_name: &str,
        base_topic: Option<String>,
    ) -> Result<(), ApiError> {
        let base = base_topic
            .or_else(|| self.slot.lock().as_ref().map(|s| s.base_topic.clone()))
            .ok_or_else(|| ApiError::validation("No active pairing and no baseTopic given"))?;

        let topic = format!("{base}/bridge/request/device/rename");
        let payload = serde_json::json!({ "from": ieee_address, "to": new_name }).to_string();
        log::info!("[pairing] renaming {ieee_address} to \"{new_name}\"");
        self.client
            .publish_cmd(topic, payload)
            .await
            .map_err(|e| ApiError::upstream(format!("Failed to send rename command: {e}")))
    }

    /// Retrait manuel d'un compteur, disponible après une interview ratée.
    pub async fn remove(
        &self,
        ieee_address: &str,
        force: bool,
        base_topic: Option<String>,
    ) -> Result<(), ApiError> {
        let base = base_topic
            .or_else(|| self.slot.lock().as_ref().map(|s| s.base_topic.clone()))
            .ok_or_else(|| ApiError::validation("No active pairing and no baseTopic given"))?;

        let topic = format!("{base}/bridge/request/device/remove");
        let payload = serde_json::json!({ "id": ieee_address, "force": force }).to_string();
        log::info!("[pairing] removing device {ieee_address} (force: {force})");
        self.client
            .publish_cmd(topic, payload)
            .await
            .map_err(|e| ApiError::upstream(format!("Failed to send remove command: {e}")))
    }

    /// Événement bridge entrant. Ignoré si aucun appairage actif ou si la
    /// zone n'est pas celle de la session en cours.
    pub async fn handle_bridge_event(&self, area: &AreaConf, event: BridgeEventIn) {
        {
            let slot = self.slot.lock();
            match slot.as_ref() {
                Some(s) if s.base_topic == area.mqtt_topic => {}
                _ => return,
            }
        }

        match event.event_type.as_str() {
            "device_joined" => self.on_device_joined(area, &event.data),
            "device_interview" => self.on_device_interview(area, &event.data).await,
            "device_announce" => self.on_device_announce(area, &event.data),
            _ => {}
        }
    }

    fn on_device_joined(&self, area: &AreaConf, data: &serde_json::Value) {
        let device = DeviceRef {
            ieee_address: str_field(data, "ieee_address"),
            friendly_name: str_field(data, "friendly_name"),
            model: data["definition"]["model"].as_str().map(Into::into),
        };
        log::info!("[pairing] [{}] device joined: {}", area.name, device.friendly_name);

        if let Some(session) = self.slot.lock().as_mut() {
            session.phase = PairingPhase::DeviceJoined;
            session.current_device = Some(device.clone());
        }
        self.registry.update(&area.id, |rt| {
            rt.status = AreaStatus::DeviceJoined;
            rt.current_device = Some(device.clone());
        });
        self.hub.broadcast_area(
            &area.id,
            serde_json::json!({"status": "device_joined", "currentDevice": device}),
        );
    }

    async fn on_device_interview(&self, area: &AreaConf, data: &serde_json::Value) {
        let ieee = str_field(data, "ieee_address");
        let status = str_field(data, "status");

        // l'interview ne concerne que le compteur en cours
        let device = {
            let slot = self.slot.lock();
            match slot.as_ref().and_then(|s| s.current_device.clone()) {
                Some(d) if d.ieee_address == ieee => d,
                _ => return,
            }
        };

        match status.as_str() {
            "started" => {
                if let Some(session) = self.slot.lock().as_mut() {
                    session.phase = PairingPhase::InterviewStarted;
                }
                self.hub.broadcast_area(
                    &area.id,
                    serde_json::json!({"pairing": "interview_started", "ieeeAddress": ieee}),
                );
            }
            "successful" => {
                let model = data["definition"]["model"]
                    .as_str()
                    .unwrap_or("Unknown")
                    .to_string();
                let three_phase = is_three_phase(&model);
                log::info!(
                    "[pairing] [{}] interview successful: {} ({} meter, model {model})",
                    area.name,
                    device.friendly_name,
                    if three_phase { "3-phase" } else { "1-phase" }
                );

                if let Some(session) = self.slot.lock().as_mut() {
                    session.phase = PairingPhase::InterviewOk;
                    session.device_model = Some(model.clone());
                    session.is_three_phase = three_phase;
                }
                self.registry.set_status(&area.id, AreaStatus::InterviewOk);

                self.configure_meter(area, &device.friendly_name, three_phase)
                    .await;

                // impulsion OFF différée : confirmation physique visible
                let engine = self.clone();
                let base = area.mqtt_topic.clone();
                let area_id = area.id.clone();
                let name = device.friendly_name.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(std::time::Duration::from_secs(OFF_PULSE_DELAY_SECS)).await;
                    engine.send_relay_command(&base, &area_id, &name, "OFF").await;
                });

                self.hub.broadcast_area(
                    &area.id,
                    serde_json::json!({
                        "status": "interview_ok",
                        "model": model,
                        "isThreePhase": three_phase,
                    }),
                );
            }
            "failed" => {
                log::warn!(
                    "[pairing] [{}] interview failed: {}",
                    area.name,
                    device.friendly_name
                );
                if let Some(session) = self.slot.lock().as_mut() {
                    session.phase = PairingPhase::InterviewFailed;
                }
                self.registry.set_status(&area.id, AreaStatus::InterviewFailed);
                self.hub.broadcast_area(
                    &area.id,
                    serde_json::json!({"status": "interview_failed", "ieeeAddress": ieee}),
                );
            }
            _ => {}
        }
    }

    fn on_device_announce(&self, area: &AreaConf, data: &serde_json::Value) {
        let ieee = str_field(data, "ieee_address");
        let matches = self
            .slot
            .lock()
            .as_ref()
            .and_then(|s| s.current_device.as_ref().map(|d| d.ieee_address == ieee))
            .unwrap_or(false);
        if matches {
            // ré-annonce après cycle d'alimentation
            self.hub.broadcast_area(
                &area.id,
                serde_json::json!({"pairing": "device_announce", "ieeeAddress": ieee}),
            );
        }
    }

    /// Ack de renommage du bridge : déclenche le ON final différé sur le
    /// nouveau nom. C'est l'étape pilotée par l'humain qui clôt le cycle.
    pub async fn handle_rename_response(&self, area: &AreaConf, payload: serde_json::Value) {
        let active_here = self
            .slot
            .lock()
            .as_ref()
            .map(|s| s.base_topic == area.mqtt_topic)
            .unwrap_or(false);
        if !active_here {
            return;
        }

        self.hub.broadcast_area(
            &area.id,
            serde_json::json!({"pairing": "rename_response", "response": payload}),
        );

        if payload["status"] == "ok" {
            if let Some(new_name) = payload["data"]["to"].as_str() {
                log::info!("[pairing] rename successful, sending ON to: {new_name}");
                let engine = self.clone();
                let base = area.mqtt_topic.clone();
                let area_id = area.id.clone();
                let name = new_name.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(std::time::Duration::from_secs(ON_AFTER_RENAME_DELAY_SECS))
                        .await;
                    engine.send_relay_command(&base, &area_id, &name, "ON").await;
                    engine.hub.broadcast_area(
                        &area_id,
                        serde_json::json!({
                            "pairing": "relay_test_complete",
                            "friendlyName": name,
                            "success": true,
                        }),
                    );
                });
            }
        }
    }

    /// Publie le profil de phase sur le topic de commande du compteur.
    /// Un échec est loggé et diffusé mais ne fait pas reculer la machine à
    /// états, et il n'y a pas de retry.
    async fn configure_meter(&self, area: &AreaConf, friendly_name: &str, three_phase: bool) {
        let profile = phase_profile(three_phase);
        let topic = format!("{}/{friendly_name}/set", area.mqtt_topic);
        match self.client.publish_cmd(topic, profile.to_string()).await {
            Ok(()) => {
                log::info!(
                    "[pairing] auto-configured {friendly_name} ({})",
                    if three_phase { "3-phase" } else { "1-phase" }
                );
                self.hub.broadcast_area(
                    &area.id,
                    serde_json::json!({
                        "pairing": "auto_config_success",
                        "friendlyName": friendly_name,
                        "config": profile,
                    }),
                );
            }
            Err(e) => {
                log::error!("[pairing] failed to auto-configure {friendly_name}: {e}");
                self.hub.broadcast_area(
                    &area.id,
                    serde_json::json!({
                        "pairing": "auto_config_failed",
                        "friendlyName": friendly_name,
                        "error": e,
                    }),
                );
            }
        }
    }

    async fn send_relay_command(&self, base_topic: &str, area_id: &str, name: &str, state: &str) {
        let topic = format!("{base_topic}/{name}/set");
        let payload = serde_json::json!({ "state": state }).to_string();
        match self.client.publish_cmd(topic, payload).await {
            Ok(()) => {
                log::info!("[pairing] sent {state} to {name}");
                self.hub.broadcast_area(
                    area_id,
                    serde_json::json!({
                        "pairing": "relay_command_sent",
                        "friendlyName": name,
                        "state": state,
                    }),
                );
            }
            Err(e) => {
                log::error!("[pairing] failed to send {state} to {name}: {e}");
                self.hub.broadcast_area(
                    area_id,
                    serde_json::json!({
                        "pairing": "relay_command_failed",
                        "friendlyName": name,
                        "state": state,
                        "error": e,
                    }),
                );
            }
        }
    }
}

fn str_field(data: &serde_json::Value, key: &str) -> String {
    data[key].as_str().unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::Message;
    use powermon_devkit::{z2m, MockMqttClient};
    use std::sync::Arc;

    impl BusCommand for MockMqttClient {
        fn publish_cmd(
            &self,
            topic: String,
            payload: String,
        ) -> impl Future<Output = Result<(), String>> + Send {
            let client = self.clone();
            async move {
                client
                    .publish(topic, QoS::AtLeastOnce, false, payload.into_bytes())
                    .await
                    .map_err(|e| e.to_string())
            }
        }
    }

    /// Bus injoignable : toute commande échoue.
    #[derive(Clone)]
    struct DeadBus;

    impl BusCommand for DeadBus {
        fn publish_cmd(
            &self,
            _topic: String,
            _payload: String,
        ) -> impl Future<Output = Result<(), String>> + Send {
            async { Err("connection refused".to_string()) }
        }
    }

    fn areas() -> Vec<AreaConf> {
        vec![
            AreaConf {
                id: "1".into(),
                name: "100 området".into(),
                mqtt_topic: "zigbee2mqtt".into(),
            },
            AreaConf {
                id: "7".into(),
                name: "3-fasede målere".into(),
                mqtt_topic: "zigbee2mqtt_3p".into(),
            },
        ]
    }

    fn engine() -> (PairingEngine<MockMqttClient>, MockMqttClient) {
        let bus = MockMqttClient::new();
        let engine = PairingEngine::new(AreaRegistry::new(areas()), Hub::new(), bus.clone());
        (engine, bus)
    }

    fn bridge_event(payload: serde_json::Value) -> BridgeEventIn {
        serde_json::from_value(payload).unwrap()
    }

    #[test]
    fn three_phase_detection_is_case_insensitive_substring() {
        assert!(is_three_phase("TOQCB2-80"));
        assert!(is_three_phase("toqcb2-80"));
        assert!(is_three_phase("TS011F_plug_1"));
        assert!(is_three_phase("SPM02"));
        assert!(!is_three_phase("TO-Q-SY1-JZT"));
        assert!(!is_three_phase("Unknown"));
    }

    #[test]
    fn three_phase_profile_carries_trip_thresholds() {
        let profile = phase_profile(true);
        assert_eq!(profile["current_threshold"], 63);
        assert_eq!(profile["over_voltage_threshold"], 280);
        assert_eq!(profile["under_voltage_threshold"], 165);
        assert_eq!(profile["temperature_threshold"], 80);
        assert_eq!(profile["state"], "ON");
    }

    #[test]
    fn single_phase_profile_sets_restore_and_indicator() {
        let profile = phase_profile(false);
        assert_eq!(profile["power_outage_memory"], "restore");
        assert_eq!(profile["indicator_mode"], "on_off");
        assert!(profile.get("current_threshold").is_none());
    }

    #[tokio::test]
    async fn start_and_stop_publish_permit_join() {
        let (engine, bus) = engine();
        engine.start("1", Some(60)).await.unwrap();

        let open: serde_json::Value = bus
            .get_last_json_message("zigbee2mqtt/bridge/request/permit_join")
            .unwrap()
            .unwrap();
        assert_eq!(open["time"], 60);

        engine.stop().await.unwrap();
        let close: serde_json::Value = bus
            .get_last_json_message("zigbee2mqtt/bridge/request/permit_join")
            .unwrap()
            .unwrap();
        assert_eq!(close["time"], 0);
    }

    #[tokio::test]
    async fn start_defaults_to_full_join_window() {
        let (engine, bus) = engine();
        engine.start("7", None).await.unwrap();
        let open: serde_json::Value = bus
            .get_last_json_message("zigbee2mqtt_3p/bridge/request/permit_join")
            .unwrap()
            .unwrap();
        assert_eq!(open["time"], 254);
    }

    #[tokio::test]
    async fn single_global_slot() {
        let (engine, _bus) = engine();
        engine.start("1", Some(60)).await.unwrap();
        assert!(matches!(
            engine.start("7", Some(60)).await,
            Err(ApiError::Conflict(_))
        ));
        // stop libère le slot
        assert!(engine.stop().await.unwrap());
        assert!(!engine.stop().await.unwrap()); // déjà inactif
        engine.start("7", None).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_starts_reserve_the_slot_once() {
        for _ in 0..100 {
            let (engine, bus) = engine();
            let barrier = Arc::new(tokio::sync::Barrier::new(2));

            let e1 = engine.clone();
            let b1 = barrier.clone();
            let h1 = tokio::spawn(async move {
                b1.wait().await;
                e1.start("1", Some(60)).await
            });
            let e2 = engine.clone();
            let b2 = barrier.clone();
            let h2 = tokio::spawn(async move {
                b2.wait().await;
                e2.start("7", Some(60)).await
            });

            let r1 = h1.await.unwrap();
            let r2 = h2.await.unwrap();
            // exactement un gagnant, une seule fenêtre ouverte sur le bus
            assert!(r1.is_ok() != r2.is_ok());
            let opened = bus
                .get_published_messages()
                .iter()
                .filter(|m| m.topic.ends_with("/bridge/request/permit_join"))
                .count();
            assert_eq!(opened, 1);
            assert!(engine.status().is_some());
        }
    }

    #[tokio::test]
    async fn failed_permit_join_releases_the_slot() {
        let engine = PairingEngine::new(AreaRegistry::new(areas()), Hub::new(), DeadBus);
        assert!(matches!(
            engine.start("1", Some(60)).await,
            Err(ApiError::Upstream(_))
        ));
        assert!(engine.status().is_none());
        // le slot n'est pas resté réservé : un retry renvoie Upstream, pas
        // Conflict
        assert!(matches!(
            engine.start("1", Some(60)).await,
            Err(ApiError::Upstream(_))
        ));
    }

    #[tokio::test]
    async fn start_rejects_unknown_area() {
        let (engine, _bus) = engine();
        assert!(matches!(
            engine.start("42", None).await,
            Err(ApiError::Validation(_))
        ));
        assert!(engine.status().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn full_interview_cycle_configures_and_pulses_off() {
        let (engine, bus) = engine();
        let area = engine.registry.area_by_id("7").unwrap().clone();
        engine.start("7", Some(254)).await.unwrap();

        engine
            .handle_bridge_event(&area, bridge_event(z2m::device_joined("0xabc", "0xabc")))
            .await;
        let session = engine.status().unwrap();
        assert_eq!(session.phase, PairingPhase::DeviceJoined);
        assert_eq!(
            session.current_device.as_ref().unwrap().ieee_address,
            "0xabc"
        );
        assert_eq!(
            engine.registry.runtime("7").unwrap().status,
            AreaStatus::DeviceJoined
        );

        engine
            .handle_bridge_event(&area, bridge_event(z2m::device_interview("0xabc", "started")))
            .await;
        assert_eq!(engine.status().unwrap().phase, PairingPhase::InterviewStarted);

        engine
            .handle_bridge_event(
                &area,
                bridge_event(z2m::device_interview_successful("0xabc", "TOQCB2-80")),
            )
            .await;
        let session = engine.status().unwrap();
        assert_eq!(session.phase, PairingPhase::InterviewOk);
        assert_eq!(session.device_model.as_deref(), Some("TOQCB2-80"));
        assert!(session.is_three_phase);
        assert_eq!(
            engine.registry.runtime("7").unwrap().status,
            AreaStatus::InterviewOk
        );

        // le profil 3-phasé part immédiatement sur le topic de commande
        let config: serde_json::Value = bus
            .get_last_json_message("zigbee2mqtt_3p/0xabc/set")
            .unwrap()
            .unwrap();
        assert_eq!(config["current_threshold"], 63);
        assert_eq!(config["over_voltage_threshold"], 280);

        // l'impulsion OFF suit après le délai
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        let last: serde_json::Value = bus
            .get_last_json_message("zigbee2mqtt_3p/0xabc/set")
            .unwrap()
            .unwrap();
        assert_eq!(last["state"], "OFF");
    }

    #[tokio::test]
    async fn interview_for_other_device_is_ignored() {
        let (engine, _bus) = engine();
        let area = engine.registry.area_by_id("1").unwrap().clone();
        engine.start("1", Some(254)).await.unwrap();
        engine
            .handle_bridge_event(&area, bridge_event(z2m::device_joined("0xabc", "0xabc")))
            .await;
        // interview d'un autre ieee -> pas de transition
        engine
            .handle_bridge_event(&area, bridge_event(z2m::device_interview("0xdef", "failed")))
            .await;
        assert_eq!(engine.status().unwrap().phase, PairingPhase::DeviceJoined);
    }

    #[tokio::test]
    async fn failed_interview_marks_area() {
        let (engine, _bus) = engine();
        let area = engine.registry.area_by_id("1").unwrap().clone();
        engine.start("1", None).await.unwrap();
        engine
            .handle_bridge_event(&area, bridge_event(z2m::device_joined("0xabc", "0xabc")))
            .await;
        engine
            .handle_bridge_event(&area, bridge_event(z2m::device_interview("0xabc", "failed")))
            .await;
        assert_eq!(engine.status().unwrap().phase, PairingPhase::InterviewFailed);
        assert_eq!(
            engine.registry.runtime("1").unwrap().status,
            AreaStatus::InterviewFailed
        );
    }

    #[tokio::test]
    async fn events_from_other_areas_are_ignored() {
        let (engine, _bus) = engine();
        let other = engine.registry.area_by_id("7").unwrap().clone();
        engine.start("1", None).await.unwrap();
        engine
            .handle_bridge_event(&other, bridge_event(z2m::device_joined("0xabc", "0xabc")))
            .await;
        assert_eq!(engine.status().unwrap().phase, PairingPhase::JoinWindowOpen);
    }

    #[tokio::test]
    async fn rename_and_remove_publish_bridge_requests() {
        let (engine, bus) = engine();
        // avec un base topic explicite, pas besoin de session
        engine
            .rename("0xabc", "meter_101", Some("zigbee2mqtt".into()))
            .await
            .unwrap();
        let rename: serde_json::Value = bus
            .get_last_json_message("zigbee2mqtt/bridge/request/device/rename")
            .unwrap()
            .unwrap();
        assert_eq!(rename["from"], "0xabc");
        assert_eq!(rename["to"], "meter_101");

        engine
            .remove("0xabc", true, Some("zigbee2mqtt".into()))
            .await
            .unwrap();
        let remove: serde_json::Value = bus
            .get_last_json_message("zigbee2mqtt/bridge/request/device/remove")
            .unwrap()
            .unwrap();
        assert_eq!(remove["id"], "0xabc");
        assert_eq!(remove["force"], true);
    }

    #[tokio::test]
    async fn rename_without_session_or_topic_is_validation_error() {
        let (engine, _bus) = engine();
        assert!(matches!(
            engine.rename("0xabc", "meter_101", None).await,
            Err(ApiError::Validation(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn rename_ack_sends_on_and_broadcasts_completion() {
        let (engine, bus) = engine();
        let area = engine.registry.area_by_id("1").unwrap().clone();
        engine.start("1", Some(254)).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        engine.hub.register(tx);

        engine
            .handle_rename_response(&area, z2m::rename_response_ok("0xabc", "meter_101"))
            .await;
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;

        let on: serde_json::Value = bus
            .get_last_json_message("zigbee2mqtt/meter_101/set")
            .unwrap()
            .unwrap();
        assert_eq!(on["state"], "ON");

        let mut seen = Vec::new();
        while let Ok(Message::Text(text)) = rx.try_recv() {
            seen.push(text.to_string());
        }
        assert!(seen.iter().any(|m| m.contains("relay_command_sent")));
        assert!(seen.iter().any(|m| m.contains("relay_test_complete")));
    }

    #[tokio::test]
    async fn failed_rename_ack_sends_nothing() {
        let (engine, bus) = engine();
        let area = engine.registry.area_by_id("1").unwrap().clone();
        engine.start("1", Some(254)).await.unwrap();
        engine
            .handle_rename_response(&area, z2m::rename_response_error("name already in use"))
            .await;
        assert!(bus
            .find_messages_by_topic("zigbee2mqtt/meter_101/set")
            .is_empty());
    }
}
