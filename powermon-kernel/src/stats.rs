/*!
Agrégateur de statistiques par compteur.

Partagé par les deux chemins de lecture : le moteur de test (accumulation
en mémoire au fil des messages) et le moteur de monitoring (re-calcul par
scan des lignes durables triées par timestamp). Mêmes règles des deux
côtés : LQI moyen arrondi à une décimale, gap = intervalle inter-messages
supérieur à 90 s, changement d'état par comparaison séquentielle.
*/

use crate::models::TelemetryIn;
use serde::Serialize;

/// Intervalle inter-messages au-delà duquel on enregistre un gap.
pub const GAP_THRESHOLD_MS: i64 = 90_000;

/// LQI en dessous duquel le monitoring émet un événement low_lqi.
pub const LOW_LQI_THRESHOLD: f64 = 80.0;

/// Gap enregistré : durée + timestamp du dernier message avant le trou.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GapRecord {
    pub duration_ms: i64,
    pub last_seen_ms: i64,
}

/// Accumulateur de métriques pour UN compteur dans UNE session.
///
/// Un objet typé par compteur plutôt que des maps parallèles : les métriques
/// d'un compteur restent atomiques entre elles.
#[derive(Debug, Clone, Default)]
pub struct MeterTrack {
    pub message_count: u64,
    pub lqi_samples: Vec<f64>,
    pub state_changes: u64,
    pub last_state: Option<String>,
    pub last_seen_ms: Option<i64>,
    pub gaps: Vec<GapRecord>,
}

/// Résultat d'observation d'un message, pour que l'appelant puisse dériver
/// ses propres événements (state_change / gap sont indépendants).
#[derive(Debug, Clone, Copy, Default)]
pub struct Observation {
    pub state_changed: bool,
    pub gap_ms: Option<i64>,
}

impl MeterTrack {
    /// Intègre un message de télémétrie horodaté `now_ms`.
    pub fn observe(&mut self, now_ms: i64, telemetry: &TelemetryIn) -> Observation {
        let mut obs = Observation::default();
        self.message_count += 1;

        if let Some(lqi) = telemetry.linkquality {
            self.lqi_samples.push(lqi);
        }

        if let Some(state) = &telemetry.state {
            if let Some(prev) = &self.last_state {
                if prev != state {
                    self.state_changes += 1;
                    obs.state_changed = true;
                }
            }
            self.last_state = Some(state.clone());
        }

        if let Some(last_seen) = self.last_seen_ms {
            let gap = now_ms - last_seen;
            if gap > GAP_THRESHOLD_MS {
                self.gaps.push(GapRecord {
                    duration_ms: gap,
                    last_seen_ms: last_seen,
                });
                obs.gap_ms = Some(gap);
            }
        }
        self.last_seen_ms = Some(now_ms);

        obs
    }

    pub fn avg_lqi(&self) -> Option<f64> {
        if self.lqi_samples.is_empty() {
            return None;
        }
        let mean = self.lqi_samples.iter().sum::<f64>() / self.lqi_samples.len() as f64;
        Some(round1(mean))
    }

    pub fn max_gap_ms(&self) -> i64 {
        self.gaps.iter().map(|g| g.duration_ms).max().unwrap_or(0)
    }

    pub fn report(&self, meter_name: &str) -> MeterReport {
        MeterReport {
            meter_name: meter_name.to_string(),
            message_count: self.message_count,
            avg_lqi: self.avg_lqi(),
            state_changes: self.state_changes,
            gap_count: self.gaps.len() as u64,
            max_gap_ms: self.max_gap_ms(),
        }
    }
}

/// Statistiques agrégées d'un compteur, format commun test/monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct MeterReport {
    #[serde(rename = "meterName")]
    pub meter_name: String,
    #[serde(rename = "messageCount")]
    pub message_count: u64,
    #[serde(rename = "avgLqi")]
    pub avg_lqi: Option<f64>,
    #[serde(rename = "stateChanges")]
    pub state_changes: u64,
    #[serde(rename = "gapCount")]
    pub gap_count: u64,
    #[serde(rename = "maxGapMs")]
    pub max_gap_ms: i64,
}

pub fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}
