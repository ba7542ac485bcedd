use std::path::Path;

use async_trait::async_trait;
use fogwatch_core::row::{DetectionRow, FoggingLogRow, SensorRow, UserSessionRow};
use fogwatch_core::{MosquitoLevel, NewFoggingLog, SensorId, UserId};
use jiff::Timestamp;
use serde_json::Value;
use sqlx::{
    Executor, QueryBuilder, Row, Sqlite, SqlitePool,
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
};
use tokio::sync::broadcast;
use tracing::debug;
use ulid::Ulid;

use super::{
    Backend, CHANGE_CHANNEL_CAPACITY, ChangeKind, FoggingWriteError, SessionFilter, Table,
    TableChange, escape_like,
};
use crate::auth::Credentials;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, thiserror::Error)]
pub enum SqliteBackendError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("sensor {0} not found")]
    SensorNotFound(SensorId),
}

/// SQLite-backed store with the same table layout as the hosted service.
///
/// Unlike the hosted service this backend has transactions, so
/// [`Backend::record_fogging`] commits the log and the sensor update together.
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
    changes: broadcast::Sender<TableChange>,
}

impl SqliteBackend {
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, SqliteBackendError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        Self::with_pool(pool).await
    }

    pub async fn new_in_memory() -> Result<Self, SqliteBackendError> {
        // Every connection to `:memory:` opens a separate database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, SqliteBackendError> {
        MIGRATOR.run(&pool).await?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        Ok(Self { pool, changes })
    }

    fn notify(&self, table: Table, kind: ChangeKind) {
        let _ = self.changes.send(TableChange { table, kind });
    }

    /// Inserts or replaces a sensor, as an external update would.
    pub async fn upsert_sensor(&self, row: &SensorRow) -> Result<(), SqliteBackendError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO sensors
                (id, name, location, status, mosquito_level, last_updated, last_fogged, coordinates)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(row.id.clone())
        .bind(row.name.clone().unwrap_or_default())
        .bind(row.location.clone().unwrap_or_default())
        .bind(row.status.as_ref().map(value_text))
        .bind(row.mosquito_level.as_ref().map(value_text))
        .bind(row.last_updated.clone())
        .bind(row.last_fogged.clone())
        .bind(row.coordinates.as_ref().map(Value::to_string))
        .execute(&self.pool)
        .await?;

        self.notify(Table::Sensors, ChangeKind::Update);
        Ok(())
    }

    /// Records a detection. The embedded `sensor` is ignored.
    pub async fn insert_detection(&self, row: &DetectionRow) -> Result<(), SqliteBackendError> {
        sqlx::query(
            r#"
            INSERT INTO detections (id, sensor_id, image_url, confidence, timestamp)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(row.id.clone())
        .bind(row.sensor_id.clone())
        .bind(row.image_url.clone())
        .bind(row.confidence)
        .bind(row.timestamp.clone())
        .execute(&self.pool)
        .await?;

        self.notify(Table::Detections, ChangeKind::Insert);
        Ok(())
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

async fn insert_log<'e, E>(executor: E, log: &NewFoggingLog) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("INSERT INTO fogging_logs (id, sensor_id, date, notes) VALUES (?, ?, ?, ?)")
        .bind(Ulid::new().to_string())
        .bind(log.sensor_id.to_string())
        .bind(log.date.to_string())
        .bind(log.notes.as_deref().map(str::to_owned))
        .execute(executor)
        .await?;

    Ok(())
}

/// Returns the number of sensors touched.
async fn mark_fogged<'e, E>(
    executor: E,
    sensor_id: &SensorId,
    date: jiff::civil::Date,
) -> Result<u64, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("UPDATE sensors SET mosquito_level = ?, last_fogged = ? WHERE id = ?")
        .bind(MosquitoLevel::Low.as_str())
        .bind(date.to_string())
        .bind(sensor_id.to_string())
        .execute(executor)
        .await?;

    Ok(result.rows_affected())
}

fn sensor_from_sql(r: &SqliteRow, prefix: &str) -> Result<Option<SensorRow>, sqlx::Error> {
    let column = |name: &str| format!("{prefix}{name}");

    let Some(id) = r.try_get::<Option<String>, _>(column("id").as_str())? else {
        return Ok(None);
    };

    Ok(Some(SensorRow {
        id,
        name: r.try_get(column("name").as_str())?,
        location: r.try_get(column("location").as_str())?,
        status: r
            .try_get::<Option<String>, _>(column("status").as_str())?
            .map(Value::String),
        mosquito_level: r
            .try_get::<Option<String>, _>(column("mosquito_level").as_str())?
            .map(Value::String),
        last_updated: r.try_get(column("last_updated").as_str())?,
        last_fogged: r.try_get(column("last_fogged").as_str())?,
        coordinates: r
            .try_get::<Option<String>, _>(column("coordinates").as_str())?
            .and_then(|raw| serde_json::from_str(&raw).ok()),
    }))
}

fn session_from_sql(r: &SqliteRow) -> Result<UserSessionRow, sqlx::Error> {
    Ok(UserSessionRow {
        id: r.try_get("id")?,
        user_id: r.try_get("user_id")?,
        email: r.try_get("email")?,
        login_time: r.try_get("login_time")?,
        logout_time: r.try_get("logout_time")?,
        created_at: r.try_get("created_at")?,
        is_active: Some(r.try_get::<i64, _>("is_active")? != 0),
    })
}

#[async_trait]
impl Backend for SqliteBackend {
    type Error = SqliteBackendError;

    async fn list_sensors(&self, _credentials: &Credentials) -> Result<Vec<SensorRow>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, location, status, mosquito_level, last_updated, last_fogged, coordinates
            FROM sensors
            ORDER BY julianday(last_updated) DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut sensors = Vec::with_capacity(rows.len());
        for r in &rows {
            if let Some(sensor) = sensor_from_sql(r, "")? {
                sensors.push(sensor);
            }
        }

        Ok(sensors)
    }

    async fn list_detections(
        &self,
        _credentials: &Credentials,
    ) -> Result<Vec<DetectionRow>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT d.id, d.sensor_id, d.image_url, d.confidence, d.timestamp,
                   s.id AS s_id, s.name AS s_name, s.location AS s_location,
                   s.status AS s_status, s.mosquito_level AS s_mosquito_level,
                   s.last_updated AS s_last_updated, s.last_fogged AS s_last_fogged,
                   s.coordinates AS s_coordinates
            FROM detections d
            LEFT JOIN sensors s ON s.id = d.sensor_id
            ORDER BY julianday(d.timestamp) DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut detections = Vec::with_capacity(rows.len());
        for r in &rows {
            detections.push(DetectionRow {
                id: r.try_get("id")?,
                sensor_id: r.try_get("sensor_id")?,
                image_url: r.try_get("image_url")?,
                confidence: r.try_get("confidence")?,
                timestamp: r.try_get("timestamp")?,
                sensor: sensor_from_sql(r, "s_")?,
            });
        }

        Ok(detections)
    }

    async fn list_fogging_logs(
        &self,
        _credentials: &Credentials,
    ) -> Result<Vec<FoggingLogRow>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, sensor_id, date, notes
            FROM fogging_logs
            ORDER BY julianday(date) DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                Ok(FoggingLogRow {
                    id: r.try_get("id")?,
                    sensor_id: r.try_get("sensor_id")?,
                    date: r.try_get("date")?,
                    notes: r.try_get("notes")?,
                })
            })
            .collect()
    }

    async fn insert_fogging_log(
        &self,
        _credentials: &Credentials,
        log: &NewFoggingLog,
    ) -> Result<(), Self::Error> {
        insert_log(&self.pool, log).await?;
        self.notify(Table::FoggingLogs, ChangeKind::Insert);

        Ok(())
    }

    async fn mark_sensor_fogged(
        &self,
        _credentials: &Credentials,
        sensor_id: &SensorId,
        date: jiff::civil::Date,
    ) -> Result<(), Self::Error> {
        if mark_fogged(&self.pool, sensor_id, date).await? == 0 {
            return Err(SqliteBackendError::SensorNotFound(sensor_id.clone()));
        }
        self.notify(Table::Sensors, ChangeKind::Update);

        Ok(())
    }

    async fn record_fogging(
        &self,
        _credentials: &Credentials,
        log: &NewFoggingLog,
    ) -> Result<(), FoggingWriteError<Self::Error>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| FoggingWriteError::Insert(e.into()))?;

        insert_log(&mut *tx, log)
            .await
            .map_err(|e| FoggingWriteError::Insert(e.into()))?;

        let touched = mark_fogged(&mut *tx, &log.sensor_id, log.date)
            .await
            .map_err(|e| FoggingWriteError::SensorUpdate(e.into()))?;
        if touched == 0 {
            // Dropping the transaction rolls the insert back.
            debug!(sensor_id = %log.sensor_id, "fogging target missing, rolling back");
            return Err(FoggingWriteError::SensorUpdate(
                SqliteBackendError::SensorNotFound(log.sensor_id.clone()),
            ));
        }

        tx.commit()
            .await
            .map_err(|e| FoggingWriteError::SensorUpdate(e.into()))?;

        self.notify(Table::FoggingLogs, ChangeKind::Insert);
        self.notify(Table::Sensors, ChangeKind::Update);
        Ok(())
    }

    async fn list_sessions(
        &self,
        _credentials: &Credentials,
        filter: &SessionFilter,
    ) -> Result<Vec<UserSessionRow>, Self::Error> {
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT id, user_id, email, login_time, logout_time, created_at, is_active \
             FROM user_sessions WHERE 1 = 1",
        );

        if let Some(active) = filter.active {
            query.push(" AND is_active = ").push_bind(i64::from(active));
        }
        if let Some(email) = &filter.email {
            query
                .push(" AND lower(email) LIKE ")
                .push_bind(format!("%{}%", escape_like(&email.to_lowercase())))
                .push(" ESCAPE '\\'");
        }
        if let Some(from) = filter.from {
            query
                .push(" AND julianday(login_time) >= julianday(")
                .push_bind(from.to_string())
                .push(")");
        }
        if let Some(to) = filter.to {
            query
                .push(" AND julianday(login_time) <= julianday(")
                .push_bind(to.to_string())
                .push(")");
        }
        query.push(" ORDER BY julianday(login_time) DESC");

        let rows = query.build().fetch_all(&self.pool).await?;
        let sessions = rows
            .iter()
            .map(session_from_sql)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(sessions)
    }

    async fn open_session(
        &self,
        _credentials: &Credentials,
        user_id: &UserId,
        email: &str,
    ) -> Result<(), Self::Error> {
        let now = Timestamp::now().to_string();

        sqlx::query(
            r#"
            INSERT INTO user_sessions (id, user_id, email, login_time, created_at, is_active)
            VALUES (?, ?, ?, ?, ?, 1)
            "#,
        )
        .bind(Ulid::new().to_string())
        .bind(user_id.to_string())
        .bind(email.to_owned())
        .bind(now.clone())
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.notify(Table::UserSessions, ChangeKind::Insert);
        Ok(())
    }

    async fn close_session(
        &self,
        _credentials: &Credentials,
        user_id: &UserId,
        logout_time: Timestamp,
    ) -> Result<bool, Self::Error> {
        let result = sqlx::query(
            r#"
            UPDATE user_sessions SET logout_time = ?, is_active = 0
            WHERE id = (
                SELECT id FROM user_sessions
                WHERE user_id = ? AND is_active = 1
                ORDER BY julianday(login_time) DESC
                LIMIT 1
            )
            "#,
        )
        .bind(logout_time.to_string())
        .bind(user_id.to_string())
        .execute(&self.pool)
        .await?;

        let closed = result.rows_affected() > 0;
        if closed {
            self.notify(Table::UserSessions, ChangeKind::Update);
        }

        Ok(closed)
    }

    fn subscribe(&self) -> broadcast::Receiver<TableChange> {
        self.changes.subscribe()
    }
}
