use serde::{Deserialize, Serialize};

/// Statut runtime d'une zone, diffusé tel quel aux observateurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AreaStatus {
    #[default]
    Idle,
    DeviceJoined,
    InterviewOk,
    InterviewFailed,
    TestRunning,
    Monitoring,
}

/// Référence vers le compteur en cours d'appairage dans une zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRef {
    pub ieee_address: String,
    pub friendly_name: String,
    pub model: Option<String>,
}

/// État mutable par zone (écrit par un seul moteur à la fois).
#[derive(Debug, Clone, Serialize, Default)]
pub struct AreaRuntime {
    pub status: AreaStatus,
    #[serde(rename = "currentDevice")]
    pub current_device: Option<DeviceRef>,
    #[serde(rename = "monitoringId")]
    pub monitoring_id: Option<String>,
}

/// Télémétrie d'un compteur, décodée de manière permissive : tous les
/// champs sont optionnels, les payloads partiels sont la norme sur le bus.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryIn {
    pub linkquality: Option<f64>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub power: Option<f64>,
    pub energy: Option<f64>,
    pub state: Option<String>,
}

/// Événement bridge zigbee2mqtt (`<bt>/bridge/event`).
#[derive(Debug, Deserialize)]
pub struct BridgeEventIn {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Compteurs online/offline d'une zone, issus de l'annuaire durable.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DeviceStats {
    #[serde(rename = "deviceCount")]
    pub device_count: u32,
    #[serde(rename = "devicesOnline")]
    pub devices_online: u32,
    #[serde(rename = "devicesOffline")]
    pub devices_offline: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_tolerates_partial_payloads() {
        let t: TelemetryIn = serde_json::from_str(r#"{"power": 120.5}"#).unwrap();
        assert_eq!(t.power, Some(120.5));
        assert!(t.linkquality.is_none());
        assert!(t.state.is_none());

        let t: TelemetryIn =
            serde_json::from_str(r#"{"linkquality": 84, "state": "ON", "extra": true}"#).unwrap();
        assert_eq!(t.linkquality, Some(84.0));
        assert_eq!(t.state.as_deref(), Some("ON"));
    }

    #[test]
    fn area_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&AreaStatus::TestRunning).unwrap(),
            "\"test_running\""
        );
        assert_eq!(
            serde_json::to_string(&AreaStatus::InterviewOk).unwrap(),
            "\"interview_ok\""
        );
    }
}
