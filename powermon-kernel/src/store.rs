/*!
Store durable SQLite : sessions de monitoring, échantillons bruts,
événements dérivés et annuaire des compteurs.

Chaque échantillon de monitoring est persisté tel quel (payload brut
inclus) : c'est la source de vérité, les statistiques sont re-calculées au
moment de la lecture. Migrations par `PRAGMA user_version`.
*/

use crate::models::TelemetryIn;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = "
CREATE TABLE monitoring_sessions (
    id               TEXT PRIMARY KEY,
    area_ids         TEXT NOT NULL,
    start_time       TEXT NOT NULL,
    end_time         TEXT,
    duration_seconds INTEGER NOT NULL,
    status           TEXT NOT NULL
);

CREATE TABLE monitoring_data (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    monitoring_id TEXT NOT NULL,
    meter_name    TEXT NOT NULL,
    ts_ms         INTEGER NOT NULL,
    lqi           REAL,
    voltage       REAL,
    current       REAL,
    power         REAL,
    energy        REAL,
    state         TEXT,
    raw_json      TEXT NOT NULL
);
CREATE INDEX idx_monitoring_data_session ON monitoring_data(monitoring_id, ts_ms);

CREATE TABLE monitoring_events (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    monitoring_id TEXT NOT NULL,
    meter_name    TEXT NOT NULL,
    event_type    TEXT NOT NULL,
    ts_ms         INTEGER NOT NULL,
    details_json  TEXT NOT NULL
);
CREATE INDEX idx_monitoring_events_session ON monitoring_events(monitoring_id);

CREATE TABLE power_meters (
    name         TEXT PRIMARY KEY,
    mqtt_topic   TEXT NOT NULL,
    power_status TEXT,
    last_seen    TEXT
);
";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub area_ids: Vec<String>,
    pub start_time: String,
    pub end_time: Option<String>,
    pub duration_seconds: i64,
    pub status: String,
}

impl SessionRow {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

/// Ligne d'échantillon relue pour l'agrégation (sous-ensemble des colonnes,
/// comme le chemin de lecture original).
#[derive(Debug, Clone)]
pub struct SampleRow {
    pub meter_name: String,
    pub ts_ms: i64,
    pub lqi: Option<f64>,
    pub state: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EventRow {
    pub meter_name: String,
    pub event_type: String,
    pub ts_ms: i64,
    pub details: serde_json::Value,
}

pub struct PowerStore {
    conn: Connection,
}

pub type SharedStore = Arc<Mutex<PowerStore>>;

impl PowerStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    fn schema_version(&self) -> Result<i64, StoreError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StoreError> {
        let current = self.schema_version()?;
        if current > SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchemaVersion {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }
        if current < 1 {
            self.conn.execute_batch(SCHEMA_V1)?;
            self.conn.execute("PRAGMA user_version = 1", [])?;
        }
        Ok(())
    }

    // ----- sessions de monitoring -----

    pub fn insert_session(&self, session: &SessionRow) -> Result<(), StoreError> {
        let area_ids = serde_json::to_string(&session.area_ids)?;
        self.conn.execute(
            "INSERT INTO monitoring_sessions (id, area_ids, start_time, end_time, duration_seconds, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session.id,
                area_ids,
                session.start_time,
                session.end_time,
                session.duration_seconds,
                session.status,
            ],
        )?;
        Ok(())
    }

    pub fn get_session(&self, id: &str) -> Result<Option<SessionRow>, StoreError> {
        self.conn
            .query_row(
                "SELECT id, area_ids, start_time, end_time, duration_seconds, status
                 FROM monitoring_sessions WHERE id = ?1",
                params![id],
                row_to_session,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn active_sessions(&self) -> Result<Vec<SessionRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, area_ids, start_time, end_time, duration_seconds, status
             FROM monitoring_sessions WHERE status = 'active'",
        )?;
        let rows = stmt
            .query_map([], row_to_session)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Les N sessions les plus récentes, triées par start_time décroissant.
    pub fn recent_sessions(&self, limit: u32) -> Result<Vec<SessionRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, area_ids, start_time, end_time, duration_seconds, status
             FROM monitoring_sessions ORDER BY start_time DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], row_to_session)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Marque une session active comme arrêtée. Retourne false si la session
    /// est inconnue ou déjà arrêtée (stop idempotent).
    pub fn mark_session_stopped(&self, id: &str, end_time: &str) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE monitoring_sessions SET end_time = ?2, status = 'stopped'
             WHERE id = ?1 AND status = 'active'",
            params![id, end_time],
        )?;
        Ok(changed > 0)
    }

    // ----- échantillons et événements dérivés -----

    pub fn insert_sample(
        &self,
        monitoring_id: &str,
        meter_name: &str,
        ts_ms: i64,
        telemetry: &TelemetryIn,
        raw: &serde_json::Value,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO monitoring_data
             (monitoring_id, meter_name, ts_ms, lqi, voltage, current, power, energy, state, raw_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                monitoring_id,
                meter_name,
                ts_ms,
                telemetry.linkquality,
                telemetry.voltage,
                telemetry.current,
                telemetry.power,
                telemetry.energy,
                telemetry.state,
                serde_json::to_string(raw)?,
            ],
        )?;
        Ok(())
    }

    pub fn insert_event(
        &self,
        monitoring_id: &str,
        meter_name: &str,
        event_type: &str,
        ts_ms: i64,
        details: &serde_json::Value,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO monitoring_events (monitoring_id, meter_name, event_type, ts_ms, details_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                monitoring_id,
                meter_name,
                event_type,
                ts_ms,
                serde_json::to_string(details)?,
            ],
        )?;
        Ok(())
    }

    /// Échantillons d'une session triés par timestamp croissant : l'ordre
    /// d'insertion ne compte pas, le tri se fait ici avant agrégation.
    pub fn samples_for_session(&self, monitoring_id: &str) -> Result<Vec<SampleRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT meter_name, ts_ms, lqi, state FROM monitoring_data
             WHERE monitoring_id = ?1 ORDER BY ts_ms ASC",
        )?;
        let rows = stmt
            .query_map(params![monitoring_id], |row| {
                Ok(SampleRow {
                    meter_name: row.get(0)?,
                    ts_ms: row.get(1)?,
                    lqi: row.get(2)?,
                    state: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn events_for_session(&self, monitoring_id: &str) -> Result<Vec<EventRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT meter_name, event_type, ts_ms, details_json FROM monitoring_events
             WHERE monitoring_id = ?1 ORDER BY ts_ms ASC",
        )?;
        let rows = stmt
            .query_map(params![monitoring_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(meter_name, event_type, ts_ms, details)| {
                Ok(EventRow {
                    meter_name,
                    event_type,
                    ts_ms,
                    details: serde_json::from_str(&details)?,
                })
            })
            .collect()
    }

    // ----- annuaire des compteurs -----

    pub fn upsert_meter_status(
        &self,
        name: &str,
        mqtt_topic: &str,
        power_status: Option<&str>,
        last_seen: &str,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO power_meters (name, mqtt_topic, power_status, last_seen)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                mqtt_topic = excluded.mqtt_topic,
                power_status = COALESCE(excluded.power_status, power_meters.power_status),
                last_seen = excluded.last_seen",
            params![name, mqtt_topic, power_status, last_seen],
        )?;
        Ok(())
    }

    /// Compteurs online/offline d'une zone par match de préfixe topic.
    ///
    /// Filtrage en Rust avec la même règle que la résolution de topic, pour
    /// que le base topic `zigbee2mqtt` n'avale pas les lignes
    /// `zigbee2mqtt_areaN/...`.
    pub fn device_stats(&self, base_topic: &str) -> Result<crate::models::DeviceStats, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT mqtt_topic, power_status FROM power_meters")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let prefix = format!("{base_topic}/");
        let mut stats = crate::models::DeviceStats::default();
        for (topic, status) in rows {
            if topic != base_topic && !topic.starts_with(&prefix) {
                continue;
            }
            stats.device_count += 1;
            if status.as_deref() == Some("ON") {
                stats.devices_online += 1;
            } else {
                stats.devices_offline += 1;
            }
        }
        Ok(stats)
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    let area_ids_json: String = row.get(1)?;
    let area_ids = serde_json::from_str(&area_ids_json).unwrap_or_default();
    Ok(SessionRow {
        id: row.get(0)?,
        area_ids,
        start_time: row.get(2)?,
        end_time: row.get(3)?,
        duration_seconds: row.get(4)?,
        status: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, areas: &[&str], start: &str, status: &str) -> SessionRow {
        SessionRow {
            id: id.into(),
            area_ids: areas.iter().map(|s| s.to_string()).collect(),
            start_time: start.into(),
            end_time: None,
            duration_seconds: 3600,
            status: status.into(),
        }
    }

    #[test]
    fn session_roundtrip_and_idempotent_stop() {
        let store = PowerStore::open_in_memory().unwrap();
        store
            .insert_session(&session("mon_1", &["1", "2"], "2026-08-29T10:00:00Z", "active"))
            .unwrap();

        let loaded = store.get_session("mon_1").unwrap().unwrap();
        assert_eq!(loaded.area_ids, vec!["1", "2"]);
        assert!(loaded.is_active());

        assert!(store.mark_session_stopped("mon_1", "2026-08-29T11:00:00Z").unwrap());
        // déjà arrêtée -> false
        assert!(!store.mark_session_stopped("mon_1", "2026-08-29T12:00:00Z").unwrap());
        // inconnue -> false
        assert!(!store.mark_session_stopped("mon_x", "2026-08-29T12:00:00Z").unwrap());

        let loaded = store.get_session("mon_1").unwrap().unwrap();
        assert_eq!(loaded.status, "stopped");
        assert_eq!(loaded.end_time.as_deref(), Some("2026-08-29T11:00:00Z"));
    }

    #[test]
    fn recent_sessions_ordered_and_limited() {
        let store = PowerStore::open_in_memory().unwrap();
        for i in 0..5 {
            store
                .insert_session(&session(
                    &format!("mon_{i}"),
                    &["1"],
                    &format!("2026-08-2{i}T10:00:00Z"),
                    "stopped",
                ))
                .unwrap();
        }
        let recent = store.recent_sessions(3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].id, "mon_4");
        assert_eq!(recent[2].id, "mon_2");
    }

    #[test]
    fn samples_come_back_sorted_by_timestamp() {
        let store = PowerStore::open_in_memory().unwrap();
        let raw = serde_json::json!({"linkquality": 90});
        let t = TelemetryIn {
            linkquality: Some(90.0),
            ..Default::default()
        };
        // insertion volontairement désordonnée
        for ts in [3_000, 1_000, 2_000] {
            store.insert_sample("mon_1", "meter_101", ts, &t, &raw).unwrap();
        }
        let rows = store.samples_for_session("mon_1").unwrap();
        let times: Vec<i64> = rows.iter().map(|r| r.ts_ms).collect();
        assert_eq!(times, vec![1_000, 2_000, 3_000]);
        assert_eq!(rows[0].lqi, Some(90.0));
    }

    #[test]
    fn events_roundtrip() {
        let store = PowerStore::open_in_memory().unwrap();
        store
            .insert_event("mon_1", "meter_101", "low_lqi", 1_000, &serde_json::json!({"lqi": 42}))
            .unwrap();
        let events = store.events_for_session("mon_1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "low_lqi");
        assert_eq!(events[0].details["lqi"], 42);
    }

    #[test]
    fn device_stats_respects_topic_prefix_boundaries() {
        let store = PowerStore::open_in_memory().unwrap();
        let now = "2026-08-29T10:00:00Z";
        store.upsert_meter_status("m1", "zigbee2mqtt/m1", Some("ON"), now).unwrap();
        store.upsert_meter_status("m2", "zigbee2mqtt/m2", Some("OFF"), now).unwrap();
        store.upsert_meter_status("m3", "zigbee2mqtt_area2/m3", Some("ON"), now).unwrap();

        let stats = store.device_stats("zigbee2mqtt").unwrap();
        assert_eq!(stats.device_count, 2);
        assert_eq!(stats.devices_online, 1);
        assert_eq!(stats.devices_offline, 1);

        let stats = store.device_stats("zigbee2mqtt_area2").unwrap();
        assert_eq!(stats.device_count, 1);
        assert_eq!(stats.devices_online, 1);
    }

    #[test]
    fn upsert_keeps_last_status_when_payload_has_none() {
        let store = PowerStore::open_in_memory().unwrap();
        store.upsert_meter_status("m1", "z/m1", Some("ON"), "t1").unwrap();
        store.upsert_meter_status("m1", "z/m1", None, "t2").unwrap();
        let stats = store.device_stats("z").unwrap();
        assert_eq!(stats.devices_online, 1);
    }

    #[test]
    fn open_on_disk_migrates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("powermon.db");
        {
            let store = PowerStore::open(&path).unwrap();
            store
                .insert_session(&session("mon_1", &["1"], "2026-08-29T10:00:00Z", "active"))
                .unwrap();
        }
        let store = PowerStore::open(&path).unwrap();
        assert_eq!(store.active_sessions().unwrap().len(), 1);
    }
}
