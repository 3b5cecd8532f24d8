use crate::config::AreaConf;
use crate::models::{AreaRuntime, AreaStatus};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Registre des zones : identités statiques + état runtime mutable par zone.
///
/// Les identités (id, nom, base topic) sont chargées une fois au démarrage
/// et immuables ensuite. L'état runtime (status, compteur en cours, session
/// de monitoring) est écrit par un seul moteur à la fois par zone, lu par le
/// hub de diffusion et par l'API.
#[derive(Clone)]
pub struct AreaRegistry {
    areas: Arc<Vec<AreaConf>>,
    runtime: Shared<HashMap<String, AreaRuntime>>,
}

impl AreaRegistry {
    pub fn new(areas: Vec<AreaConf>) -> Self {
        let runtime = areas
            .iter()
            .map(|a| (a.id.clone(), AreaRuntime::default()))
            .collect();
        Self {
            areas: Arc::new(areas),
            runtime: new_state(runtime),
        }
    }

    pub fn areas(&self) -> &[AreaConf] {
        &self.areas
    }

    pub fn area_by_id(&self, id: &str) -> Option<&AreaConf> {
        self.areas.iter().find(|a| a.id == id)
    }

    pub fn area_name(&self, id: &str) -> String {
        self.area_by_id(id)
            .map(|a| a.name.clone())
            .unwrap_or_else(|| format!("Area {id}"))
    }

    /// Résout la zone propriétaire d'un topic MQTT.
    ///
    /// Match par préfixe : le topic est soit exactement le base topic, soit
    /// `<base>/...`. Le match le plus long gagne, pour qu'une zone dont le
    /// topic est préfixe d'une autre (`zigbee2mqtt` vs `zigbee2mqtt_area2`)
    /// ne capture pas les messages de sa voisine.
    pub fn resolve_topic(&self, topic: &str) -> Option<&AreaConf> {
        self.areas
            .iter()
            .filter(|a| {
                topic == a.mqtt_topic || topic.starts_with(&format!("{}/", a.mqtt_topic))
            })
            .max_by_key(|a| a.mqtt_topic.len())
    }

    pub fn runtime(&self, area_id: &str) -> Option<AreaRuntime> {
        self.runtime.lock().get(area_id).cloned()
    }

    pub fn set_status(&self, area_id: &str, status: AreaStatus) {
        if let Some(rt) = self.runtime.lock().get_mut(area_id) {
            rt.status = status;
        }
    }

    /// Mutation arbitraire de l'état runtime d'une zone, sous verrou.
    pub fn update<F: FnOnce(&mut AreaRuntime)>(&self, area_id: &str, f: F) {
        if let Some(rt) = self.runtime.lock().get_mut(area_id) {
            f(rt);
        }
    }

    pub fn snapshot(&self) -> HashMap<String, AreaRuntime> {
        self.runtime.lock().clone()
    }
}
