/*!
Écoute du bus MQTT : connexion au broker, souscriptions par zone et routage
des messages vers les moteurs.

RÔLE :
- une seule connexion partagée pour tout le process (commandes sortantes et
  écoute entrante);
- souscription `<base>/#` pour chaque zone configurée, re-jouée à chaque
  ConnAck pour survivre aux reconnexions;
- routage : événements bridge et ack de renommage vers l'appairage,
  télémétrie des compteurs vers le test, le monitoring et l'annuaire.

Les payloads non-JSON sont abandonnés silencieusement : le bus transporte
aussi des messages qui ne nous concernent pas.
*/

use crate::clock::{now_ms, now_rfc3339};
use crate::models::{BridgeEventIn, TelemetryIn};
use crate::monitoring::MonitoringEngine;
use crate::pairing::PairingEngine;
use crate::state::AreaRegistry;
use crate::store::SharedStore;
use crate::testrun::TestEngine;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::time::Duration;

const RECONNECT_BACKOFF_MIN: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(30);

pub fn create_mqtt_client(cfg: &crate::config::MqttConf) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new("powermon-kernel", &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(15));
    if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
        opts.set_credentials(user, pass);
    }
    AsyncClient::new(opts, 64)
}

/// Routeur des messages entrants vers les moteurs. Cloné dans la tâche
/// d'écoute, tous les champs sont des poignées partagées.
#[derive(Clone)]
pub struct BusRouter {
    pub registry: AreaRegistry,
    pub pairing: PairingEngine,
    pub test_engine: TestEngine,
    pub monitoring: MonitoringEngine,
    pub store: SharedStore,
}

impl BusRouter {
    pub async fn dispatch(&self, topic: &str, payload: &[u8]) {
        let Some(area) = self.registry.resolve_topic(topic) else {
            return;
        };
        let area = area.clone();

        let Ok(text) = std::str::from_utf8(payload) else {
            return;
        };
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => {
                log::debug!("[mqtt] non-JSON payload on {topic}, dropped");
                return;
            }
        };

        if topic == format!("{}/bridge/event", area.mqtt_topic) {
            if let Ok(event) = serde_json::from_value::<BridgeEventIn>(value) {
                self.pairing.handle_bridge_event(&area, event).await;
            }
            return;
        }
        if topic == format!("{}/bridge/response/device/rename", area.mqtt_topic) {
            self.pairing.handle_rename_response(&area, value).await;
            return;
        }

        // tout le reste est de la télémétrie potentielle
        let Some(meter) = meter_name(topic, &area.mqtt_topic) else {
            return;
        };
        let telemetry: TelemetryIn = serde_json::from_value(value.clone()).unwrap_or_default();
        let now = now_ms();

        self.test_engine
            .handle_telemetry(&area.id, meter, &telemetry, now);
        self.monitoring
            .handle_telemetry(&area.id, meter, &telemetry, &value, now);

        // annuaire durable : dernier état connu par compteur
        if let Err(e) = self.store.lock().upsert_meter_status(
            meter,
            topic,
            telemetry.state.as_deref(),
            &now_rfc3339(),
        ) {
            log::error!("[mqtt] meter upsert failed for {meter}: {e}");
        }
    }
}

/// Extrait le nom du compteur d'un topic de télémétrie.
///
/// Seuls les topics `<base>/<nom>` à un seul segment comptent : les
/// sous-topics (`/availability`, `/set`, `/get`) et l'arborescence
/// `bridge/...` sont écartés.
fn meter_name<'a>(topic: &'a str, base_topic: &str) -> Option<&'a str> {
    let rel = topic.strip_prefix(base_topic)?.strip_prefix('/')?;
    if rel.is_empty() || rel.contains('/') || rel == "bridge" || rel == "availability" {
        return None;
    }
    Some(rel)
}

/// Boucle d'écoute, détachée pour la durée de vie du process. La
/// reconnexion est gérée par l'eventloop; en cas d'erreur on temporise avec
/// un backoff borné avant de re-poller.
pub fn spawn_bus_listener(
    mut eventloop: EventLoop,
    client: AsyncClient,
    router: BusRouter,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = RECONNECT_BACKOFF_MIN;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    backoff = RECONNECT_BACKOFF_MIN;
                    log::info!("[mqtt] connected to broker");
                    for area in router.registry.areas() {
                        let filter = format!("{}/#", area.mqtt_topic);
                        match client.subscribe(&filter, QoS::AtLeastOnce).await {
                            Ok(()) => log::info!("[mqtt] subscribed to {filter}"),
                            Err(e) => log::error!("[mqtt] subscribe {filter} failed: {e}"),
                        }
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    router.dispatch(&publish.topic, &publish.payload).await;
                }
                Ok(_) => {}
                Err(e) => {
                    log::error!(
                        "[mqtt] connection error: {e}, retrying in {}s",
                        backoff.as_secs()
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AreaConf;
    use crate::hub::Hub;
    use crate::pairing::PairingPhase;
    use crate::store::PowerStore;
    use powermon_devkit::z2m;

    #[test]
    fn meter_name_only_matches_single_segment_topics() {
        assert_eq!(meter_name("zigbee2mqtt/meter_101", "zigbee2mqtt"), Some("meter_101"));
        assert_eq!(meter_name("zigbee2mqtt/meter_101/availability", "zigbee2mqtt"), None);
        assert_eq!(meter_name("zigbee2mqtt/meter_101/set", "zigbee2mqtt"), None);
        assert_eq!(meter_name("zigbee2mqtt/bridge", "zigbee2mqtt"), None);
        assert_eq!(meter_name("zigbee2mqtt/bridge/state", "zigbee2mqtt"), None);
        assert_eq!(meter_name("zigbee2mqtt/availability", "zigbee2mqtt"), None);
        assert_eq!(meter_name("zigbee2mqtt", "zigbee2mqtt"), None);
    }

    // l'eventloop est rendu à l'appelant : le garder vivant permet au
    // client de bufferiser ses publications sans broker
    fn router() -> (BusRouter, EventLoop) {
        let registry = AreaRegistry::new(vec![
            AreaConf {
                id: "1".into(),
                name: "100 området".into(),
                mqtt_topic: "zigbee2mqtt".into(),
            },
            AreaConf {
                id: "2".into(),
                name: "200 området".into(),
                mqtt_topic: "zigbee2mqtt_area2".into(),
            },
        ]);
        let hub = Hub::new();
        let store = PowerStore::open_in_memory().unwrap().into_shared();
        let (client, eventloop) =
            AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 32);
        let router = BusRouter {
            pairing: PairingEngine::new(registry.clone(), hub.clone(), client),
            test_engine: TestEngine::new(registry.clone(), hub.clone()),
            monitoring: MonitoringEngine::new(registry.clone(), hub, store.clone()),
            registry,
            store,
        };
        (router, eventloop)
    }

    #[tokio::test]
    async fn telemetry_reaches_test_engine_and_directory() {
        let (router, _eventloop) = router();
        router.test_engine.start("1").unwrap();

        let payload =
            serde_json::to_vec(&z2m::telemetry_full(100.0, "ON", 230.0, 0.2, 42.0, 1.5)).unwrap();
        router.dispatch("zigbee2mqtt/meter_101", &payload).await;
        // sous-topic : ignoré
        router
            .dispatch("zigbee2mqtt/meter_101/availability", br#"{"state": "online"}"#)
            .await;
        // autre zone : pas de test actif là-bas, pas de trace
        router
            .dispatch("zigbee2mqtt_area2/meter_201", br#"{"linkquality": 50}"#)
            .await;

        let result = router.test_engine.result("1").unwrap();
        assert_eq!(result.meters.len(), 1);
        assert_eq!(result.meters[0].message_count, 1);

        let stats = router.store.lock().device_stats("zigbee2mqtt").unwrap();
        assert_eq!(stats.device_count, 1);
        assert_eq!(stats.devices_online, 1);
    }

    #[tokio::test]
    async fn bridge_events_route_to_pairing() {
        let (router, _eventloop) = router();
        router.pairing.start("1", Some(254)).await.unwrap();

        let payload = serde_json::to_vec(&z2m::device_joined("0xabc", "0xabc")).unwrap();
        router.dispatch("zigbee2mqtt/bridge/event", &payload).await;
        let session = router.pairing.status().unwrap();
        assert_eq!(session.phase, PairingPhase::DeviceJoined);
    }

    #[tokio::test]
    async fn garbage_payloads_are_dropped() {
        let (router, _eventloop) = router();
        router.test_engine.start("1").unwrap();
        router.dispatch("zigbee2mqtt/meter_101", b"not json").await;
        router.dispatch("zigbee2mqtt/meter_101", &[0xff, 0xfe]).await;
        router.dispatch("unknown_topic/meter", br#"{"power": 1}"#).await;

        let result = router.test_engine.result("1").unwrap();
        assert!(result.meters.is_empty());
    }
}
