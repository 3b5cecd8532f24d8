use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PowerConfig {
    pub mqtt: MqttConf,
    pub areas: Vec<AreaConf>,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Identité statique d'une zone : chargée au démarrage, immuable ensuite.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AreaConf {
    pub id: String,
    pub name: String,
    pub mqtt_topic: String, // base topic zigbee2mqtt (ex: "zigbee2mqtt_area2")
}

fn default_http_port() -> u16 {
    3001
}

fn default_db_path() -> String {
    "./data/powermon.db".into()
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConf {
                host: "localhost".into(),
                port: 1883,
                username: None,
                password: None,
            },
            areas: Vec::new(),
            http_port: default_http_port(),
            db_path: default_db_path(),
        }
    }
}

pub async fn load_config() -> PowerConfig {
    let path = std::env::var("POWERMON_CONFIG").unwrap_or_else(|_| "powermon.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            return PowerConfig::default();
        }
        serde_yaml::from_str(&txt).unwrap_or_else(|e| {
            log::error!("[kernel] config invalide: {e}");
            PowerConfig::default()
        })
    } else {
        log::warn!("[kernel] pas de powermon.yaml, usage config par défaut");
        PowerConfig::default()
    }
}
