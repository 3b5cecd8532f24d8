/**
 * POWERMON KERNEL - Point d'entrée principal du moniteur de compteurs
 *
 * RÔLE : Orchestration de tous les modules : config, store durable, MQTT,
 * moteurs (appairage, test, monitoring), HTTP + WebSocket.
 *
 * ARCHITECTURE : Event-driven via MQTT + API REST + push temps réel.
 * UTILITÉ : Backend unique de la flotte de compteurs, par zones de camping.
 */

mod clock;
mod config;
mod error;
mod http;
mod hub;
mod models;
mod monitoring;
mod mqtt;
mod pairing;
mod state;
mod stats;
mod store;
mod testrun;

use crate::config::load_config;
use crate::http::AppState;
use crate::hub::Hub;
use crate::monitoring::MonitoringEngine;
use crate::mqtt::BusRouter;
use crate::pairing::PairingEngine;
use crate::state::AreaRegistry;
use crate::store::PowerStore;
use crate::testrun::TestEngine;

use std::net::SocketAddr;
use std::path::Path;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    // variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();
    env_logger::init();

    let cfg = load_config().await;
    log::info!(
        "[kernel] {} areas configured, broker {}:{}",
        cfg.areas.len(),
        cfg.mqtt.host,
        cfg.mqtt.port
    );

    // store durable (sessions de monitoring + annuaire des compteurs)
    if let Some(parent) = Path::new(&cfg.db_path).parent() {
        std::fs::create_dir_all(parent).unwrap_or_else(|e| {
            log::warn!("[kernel] failed to create data dir: {e}");
        });
    }
    let store = match PowerStore::open(&cfg.db_path) {
        Ok(store) => store.into_shared(),
        Err(e) => {
            log::error!("[kernel] failed to open store at {}: {e}", cfg.db_path);
            std::process::exit(1);
        }
    };

    let registry = AreaRegistry::new(cfg.areas.clone());
    let hub = Hub::new();

    // client MQTT partagé : commandes sortantes + écoute du bus
    let (mqtt_client, eventloop) = mqtt::create_mqtt_client(&cfg.mqtt);

    let pairing = PairingEngine::new(registry.clone(), hub.clone(), mqtt_client.clone());
    let test_engine = TestEngine::new(registry.clone(), hub.clone());
    let monitoring = MonitoringEngine::new(registry.clone(), hub.clone(), store.clone());

    mqtt::spawn_bus_listener(
        eventloop,
        mqtt_client,
        BusRouter {
            registry: registry.clone(),
            pairing: pairing.clone(),
            test_engine: test_engine.clone(),
            monitoring: monitoring.clone(),
            store: store.clone(),
        },
    );

    // fabrique l'état unique pour Axum
    let app_state = AppState {
        registry,
        store,
        hub,
        pairing,
        test_engine,
        monitoring,
    };

    // HTTP + WebSocket
    let app = http::build_router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    log::info!("[kernel] listening on http://{addr}");
    let listener = TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
