/*!
# Powermon DevKit - Stubs et Utilitaires pour Développement

Bibliothèque facilitant le développement autour du kernel powermon avec:
- Stub MQTT pour tests sans broker
- Constructeurs de payloads zigbee2mqtt (événements bridge, télémétrie)
*/

pub mod mqtt_stub;
pub mod z2m;

pub use mqtt_stub::MockMqttClient;
