use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use fogwatch_core::convert::{parse_date, parse_timestamp};
use fogwatch_core::row::{DetectionRow, FoggingLogRow, SensorRow, UserSessionRow};
use fogwatch_core::{MosquitoLevel, NewFoggingLog, SensorId, UserId};
use jiff::Timestamp;
use serde_json::Value;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, broadcast};
use ulid::Ulid;

use super::{
    Backend, CHANGE_CHANNEL_CAPACITY, ChangeKind, SessionFilter, Table, TableChange,
};
use crate::auth::Credentials;

#[derive(Debug, thiserror::Error)]
pub enum InMemoryError {
    #[error("{0} is unavailable")]
    Unavailable(Table),
    #[error("sensor {0} not found")]
    SensorNotFound(SensorId),
}

/// In-process backend.
///
/// Intended for tests and local demos. Joins are resolved at read time and
/// every write publishes a change notification. Outages and slow reads can be
/// simulated per table.
#[derive(Clone)]
pub struct InMemoryBackend {
    tables: Arc<RwLock<Tables>>,
    gate: Arc<RwLock<()>>,
    changes: broadcast::Sender<TableChange>,
}

#[derive(Default)]
struct Tables {
    sensors: Vec<SensorRow>,
    detections: Vec<DetectionRow>,
    fogging_logs: Vec<FoggingLogRow>,
    sessions: Vec<UserSessionRow>,
    unavailable: HashSet<Table>,
    failing_reads: HashSet<Table>,
    reads: HashMap<Table, usize>,
}

impl Tables {
    fn check(&self, table: Table) -> Result<(), InMemoryError> {
        if self.unavailable.contains(&table) {
            return Err(InMemoryError::Unavailable(table));
        }

        Ok(())
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            gate: Arc::new(RwLock::new(())),
            changes,
        }
    }

    fn notify(&self, table: Table, kind: ChangeKind) {
        // No receivers is fine.
        let _ = self.changes.send(TableChange { table, kind });
    }

    /// Inserts or replaces a sensor, as an external update would.
    pub async fn upsert_sensor(&self, row: SensorRow) {
        let kind = {
            let mut tables = self.tables.write().await;
            match tables.sensors.iter_mut().find(|s| s.id == row.id) {
                Some(existing) => {
                    *existing = row;
                    ChangeKind::Update
                }
                None => {
                    tables.sensors.push(row);
                    ChangeKind::Insert
                }
            }
        };

        self.notify(Table::Sensors, kind);
    }

    /// Records a detection. The `sensor` field is ignored; the join is
    /// resolved when detections are listed.
    pub async fn insert_detection(&self, row: DetectionRow) {
        self.tables.write().await.detections.push(DetectionRow {
            sensor: None,
            ..row
        });
        self.notify(Table::Detections, ChangeKind::Insert);
    }

    /// Records a fogging log as-is, bypassing the sensor update.
    pub async fn insert_log_row(&self, row: FoggingLogRow) {
        self.tables.write().await.fogging_logs.push(row);
        self.notify(Table::FoggingLogs, ChangeKind::Insert);
    }

    pub async fn insert_session(&self, row: UserSessionRow) {
        self.tables.write().await.sessions.push(row);
        self.notify(Table::UserSessions, ChangeKind::Insert);
    }

    /// Makes every operation on `table` fail until switched back.
    pub async fn set_unavailable(&self, table: Table, unavailable: bool) {
        let mut tables = self.tables.write().await;
        if unavailable {
            tables.unavailable.insert(table);
        } else {
            tables.unavailable.remove(&table);
        }
    }

    /// Makes list requests on `table` fail while writes keep working.
    pub async fn set_reads_failing(&self, table: Table, failing: bool) {
        let mut tables = self.tables.write().await;
        if failing {
            tables.failing_reads.insert(table);
        } else {
            tables.failing_reads.remove(&table);
        }
    }

    /// Holds all reads until the returned guard is dropped.
    pub async fn pause_reads(&self) -> OwnedRwLockWriteGuard<()> {
        Arc::clone(&self.gate).write_owned().await
    }

    /// Number of list requests served for `table`.
    pub async fn read_count(&self, table: Table) -> usize {
        self.tables
            .read()
            .await
            .reads
            .get(&table)
            .copied()
            .unwrap_or_default()
    }

    async fn begin_read(&self, table: Table) -> Result<(), InMemoryError> {
        let _permit = self.gate.read().await;

        let mut tables = self.tables.write().await;
        *tables.reads.entry(table).or_default() += 1;
        if tables.failing_reads.contains(&table) {
            return Err(InMemoryError::Unavailable(table));
        }
        tables.check(table)
    }
}

fn sort_newest_first<T, K, F>(rows: &mut [T], key: F)
where
    K: Ord,
    F: Fn(&T) -> Option<K>,
{
    rows.sort_by(|a, b| key(b).cmp(&key(a)));
}

#[async_trait]
impl Backend for InMemoryBackend {
    type Error = InMemoryError;

    async fn list_sensors(&self, _credentials: &Credentials) -> Result<Vec<SensorRow>, Self::Error> {
        self.begin_read(Table::Sensors).await?;

        let mut sensors = self.tables.read().await.sensors.clone();
        sort_newest_first(&mut sensors, |s| {
            s.last_updated.as_deref().and_then(parse_timestamp)
        });

        Ok(sensors)
    }

    async fn list_detections(
        &self,
        _credentials: &Credentials,
    ) -> Result<Vec<DetectionRow>, Self::Error> {
        self.begin_read(Table::Detections).await?;

        let tables = self.tables.read().await;
        let mut detections: Vec<DetectionRow> = tables
            .detections
            .iter()
            .map(|detection| DetectionRow {
                sensor: tables
                    .sensors
                    .iter()
                    .find(|sensor| sensor.id == detection.sensor_id)
                    .cloned(),
                ..detection.clone()
            })
            .collect();
        sort_newest_first(&mut detections, |d| {
            d.timestamp.as_deref().and_then(parse_timestamp)
        });

        Ok(detections)
    }

    async fn list_fogging_logs(
        &self,
        _credentials: &Credentials,
    ) -> Result<Vec<FoggingLogRow>, Self::Error> {
        self.begin_read(Table::FoggingLogs).await?;

        let mut logs = self.tables.read().await.fogging_logs.clone();
        sort_newest_first(&mut logs, |l| l.date.as_deref().and_then(parse_date));

        Ok(logs)
    }

    async fn insert_fogging_log(
        &self,
        _credentials: &Credentials,
        log: &NewFoggingLog,
    ) -> Result<(), Self::Error> {
        {
            let mut tables = self.tables.write().await;
            tables.check(Table::FoggingLogs)?;
            tables.fogging_logs.push(FoggingLogRow {
                id: Ulid::new().to_string(),
                sensor_id: log.sensor_id.to_string(),
                date: Some(log.date.to_string()),
                notes: log.notes.as_deref().map(str::to_owned),
            });
        }

        self.notify(Table::FoggingLogs, ChangeKind::Insert);
        Ok(())
    }

    async fn mark_sensor_fogged(
        &self,
        _credentials: &Credentials,
        sensor_id: &SensorId,
        date: jiff::civil::Date,
    ) -> Result<(), Self::Error> {
        {
            let mut tables = self.tables.write().await;
            tables.check(Table::Sensors)?;

            let sensor = tables
                .sensors
                .iter_mut()
                .find(|s| s.id == sensor_id.as_str())
                .ok_or_else(|| InMemoryError::SensorNotFound(sensor_id.clone()))?;

            sensor.mosquito_level = Some(Value::from(MosquitoLevel::Low.as_str()));
            sensor.last_fogged = Some(date.to_string());
        }

        self.notify(Table::Sensors, ChangeKind::Update);
        Ok(())
    }

    async fn list_sessions(
        &self,
        _credentials: &Credentials,
        filter: &SessionFilter,
    ) -> Result<Vec<UserSessionRow>, Self::Error> {
        self.begin_read(Table::UserSessions).await?;

        let mut sessions: Vec<UserSessionRow> = self
            .tables
            .read()
            .await
            .sessions
            .iter()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect();
        sort_newest_first(&mut sessions, |s| {
            s.login_time.as_deref().and_then(parse_timestamp)
        });

        Ok(sessions)
    }

    async fn open_session(
        &self,
        _credentials: &Credentials,
        user_id: &UserId,
        email: &str,
    ) -> Result<(), Self::Error> {
        let now = Timestamp::now().to_string();
        {
            let mut tables = self.tables.write().await;
            tables.check(Table::UserSessions)?;
            tables.sessions.push(UserSessionRow {
                id: Ulid::new().to_string(),
                user_id: user_id.to_string(),
                email: Some(email.to_owned()),
                login_time: Some(now.clone()),
                logout_time: None,
                created_at: Some(now),
                is_active: Some(true),
            });
        }

        self.notify(Table::UserSessions, ChangeKind::Insert);
        Ok(())
    }

    async fn close_session(
        &self,
        _credentials: &Credentials,
        user_id: &UserId,
        logout_time: Timestamp,
    ) -> Result<bool, Self::Error> {
        let closed = {
            let mut tables = self.tables.write().await;
            tables.check(Table::UserSessions)?;

            let latest = tables
                .sessions
                .iter_mut()
                .filter(|s| s.user_id == user_id.as_str() && s.is_active == Some(true))
                .max_by_key(|s| s.login_time.as_deref().and_then(parse_timestamp));

            match latest {
                Some(session) => {
                    session.logout_time = Some(logout_time.to_string());
                    session.is_active = Some(false);
                    true
                }
                None => false,
            }
        };

        if closed {
            self.notify(Table::UserSessions, ChangeKind::Update);
        }

        Ok(closed)
    }

    fn subscribe(&self) -> broadcast::Receiver<TableChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sensor(id: &str, last_updated: &str) -> SensorRow {
        SensorRow {
            id: id.to_owned(),
            name: Some(format!("Sensor {id}")),
            location: Some("Quezon Hall".to_owned()),
            status: Some(json!("active")),
            mosquito_level: Some(json!("high")),
            last_updated: Some(last_updated.to_owned()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn sensors_are_listed_newest_first() {
        let backend = InMemoryBackend::new();
        backend.upsert_sensor(sensor("old", "2024-06-01T00:00:00Z")).await;
        backend.upsert_sensor(sensor("new", "2024-06-01T00:00:00.5Z")).await;
        backend.upsert_sensor(sensor("broken", "n/a")).await;

        let rows = backend.list_sensors(&Credentials::anonymous()).await.unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.id.as_str()).collect();

        assert_eq!(ids, ["new", "old", "broken"]);
    }

    #[tokio::test]
    async fn detections_embed_their_sensor() {
        let backend = InMemoryBackend::new();
        backend.upsert_sensor(sensor("s1", "2024-06-01T00:00:00Z")).await;
        backend
            .insert_detection(DetectionRow {
                id: "d1".to_owned(),
                sensor_id: "s1".to_owned(),
                timestamp: Some("2024-06-01T01:00:00Z".to_owned()),
                ..Default::default()
            })
            .await;
        backend
            .insert_detection(DetectionRow {
                id: "orphan".to_owned(),
                sensor_id: "gone".to_owned(),
                timestamp: Some("2024-06-01T00:30:00Z".to_owned()),
                ..Default::default()
            })
            .await;

        let rows = backend
            .list_detections(&Credentials::anonymous())
            .await
            .unwrap();

        assert_eq!(rows[0].sensor.as_ref().map(|s| s.id.as_str()), Some("s1"));
        assert_eq!(rows[1].sensor, None);
    }

    #[tokio::test]
    async fn unavailable_table_fails_reads_and_counts_them() {
        let backend = InMemoryBackend::new();
        backend.set_unavailable(Table::Sensors, true).await;

        let err = backend
            .list_sensors(&Credentials::anonymous())
            .await
            .unwrap_err();

        assert!(matches!(err, InMemoryError::Unavailable(Table::Sensors)));
        assert_eq!(backend.read_count(Table::Sensors).await, 1);
    }

    #[tokio::test]
    async fn writes_publish_changes() {
        let backend = InMemoryBackend::new();
        let mut changes = backend.subscribe();

        backend
            .open_session(&Credentials::anonymous(), &UserId::from("u1"), "a@b.c")
            .await
            .unwrap();

        let change = changes.recv().await.unwrap();
        assert_eq!(change.table, Table::UserSessions);
        assert_eq!(change.kind, ChangeKind::Insert);
    }

    #[tokio::test]
    async fn close_session_picks_most_recent_active() {
        let backend = InMemoryBackend::new();
        for (id, login) in [("first", "2024-06-01T08:00:00Z"), ("second", "2024-06-01T09:00:00Z")] {
            backend
                .insert_session(UserSessionRow {
                    id: id.to_owned(),
                    user_id: "u1".to_owned(),
                    login_time: Some(login.to_owned()),
                    is_active: Some(true),
                    ..Default::default()
                })
                .await;
        }

        let closed = backend
            .close_session(
                &Credentials::anonymous(),
                &UserId::from("u1"),
                "2024-06-01T10:00:00Z".parse().unwrap(),
            )
            .await
            .unwrap();
        assert!(closed);

        let rows = backend
            .list_sessions(&Credentials::anonymous(), &SessionFilter::default())
            .await
            .unwrap();
        let second = rows.iter().find(|r| r.id == "second").unwrap();
        let first = rows.iter().find(|r| r.id == "first").unwrap();

        assert_eq!(second.is_active, Some(false));
        assert_eq!(second.logout_time.as_deref(), Some("2024-06-01T10:00:00Z"));
        assert_eq!(first.is_active, Some(true));
    }
}
