/*!
Constructeurs de payloads zigbee2mqtt pour les tests.

Fabrique les messages que le bridge émet réellement sur le bus :
événements d'appairage (`bridge/event`), acks de renommage
(`bridge/response/device/rename`) et télémétrie des compteurs.
*/

use serde_json::Value;

/// `bridge/event` de type `device_joined`
pub fn device_joined<S: Into<String>>(ieee_address: S, friendly_name: S) -> Value {
    serde_json::json!({
        "type": "device_joined",
        "data": {
            "ieee_address": ieee_address.into(),
            "friendly_name": friendly_name.into(),
        }
    })
}

/// `bridge/event` de type `device_interview` (status: started|failed)
pub fn device_interview<S: Into<String>>(ieee_address: S, status: S) -> Value {
    serde_json::json!({
        "type": "device_interview",
        "data": {
            "ieee_address": ieee_address.into(),
            "status": status.into(),
        }
    })
}

/// `device_interview` réussie, avec le modèle détecté par le bridge
pub fn device_interview_successful<S: Into<String>>(ieee_address: S, model: S) -> Value {
    serde_json::json!({
        "type": "device_interview",
        "data": {
            "ieee_address": ieee_address.into(),
            "status": "successful",
            "definition": { "model": model.into() },
        }
    })
}

/// `bridge/event` de type `device_announce` (ré-annonce après cycle
/// d'alimentation)
pub fn device_announce<S: Into<String>>(ieee_address: S) -> Value {
    serde_json::json!({
        "type": "device_announce",
        "data": { "ieee_address": ieee_address.into() }
    })
}

/// Ack de `bridge/response/device/rename`
pub fn rename_response_ok<S: Into<String>>(from: S, to: S) -> Value {
    serde_json::json!({
        "status": "ok",
        "data": { "from": from.into(), "to": to.into() }
    })
}

pub fn rename_response_error<S: Into<String>>(error: S) -> Value {
    serde_json::json!({
        "status": "error",
        "error": error.into(),
    })
}

/// Télémétrie minimale d'un compteur (linkquality + état du relais)
pub fn telemetry(linkquality: f64, state: &str) -> Value {
    serde_json::json!({
        "linkquality": linkquality,
        "state": state,
    })
}

/// Télémétrie complète avec mesures électriques
pub fn telemetry_full(
    linkquality: f64,
    state: &str,
    voltage: f64,
    current: f64,
    power: f64,
    energy: f64,
) -> Value {
    serde_json::json!({
        "linkquality": linkquality,
        "state": state,
        "voltage": voltage,
        "current": current,
        "power": power,
        "energy": energy,
    })
}
