pub mod memory;
pub mod realtime;
pub mod rest;
pub mod sqlite;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use fogwatch_core::convert::parse_timestamp;
use fogwatch_core::row::{DetectionRow, FoggingLogRow, SensorRow, UserSessionRow};
use fogwatch_core::{NewFoggingLog, SensorId, UserId};
use jiff::Timestamp;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::{CredentialSource, Credentials};

/// Capacity of the per-backend change notification channel.
pub(crate) const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Tables exposed by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Sensors,
    Detections,
    FoggingLogs,
    UserSessions,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sensors => "sensors",
            Self::Detections => "detections",
            Self::FoggingLogs => "fogging_logs",
            Self::UserSessions => "user_sessions",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [
            Self::Sensors,
            Self::Detections,
            Self::FoggingLogs,
            Self::UserSessions,
        ]
        .into_iter()
        .find(|table| table.as_str() == name)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Notification that rows of a table changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableChange {
    pub table: Table,
    pub kind: ChangeKind,
}

/// Filters for the session history query. Every field is optional and unset
/// fields do not constrain the result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    pub active: Option<bool>,
    /// Case-insensitive substring of the email.
    pub email: Option<String>,
    /// Inclusive lower bound on login time.
    pub from: Option<Timestamp>,
    /// Inclusive upper bound on login time.
    pub to: Option<Timestamp>,
}

impl SessionFilter {
    /// Evaluates the filter against a raw row, for backends that filter
    /// in-process.
    pub fn matches(&self, row: &UserSessionRow) -> bool {
        if let Some(active) = self.active
            && row.is_active.unwrap_or(false) != active
        {
            return false;
        }

        if let Some(pattern) = &self.email {
            let email = row.email.as_deref().unwrap_or_default().to_lowercase();
            if !email.contains(&pattern.to_lowercase()) {
                return false;
            }
        }

        if self.from.is_none() && self.to.is_none() {
            return true;
        }

        let Some(login) = row.login_time.as_deref().and_then(parse_timestamp) else {
            return false;
        };

        match (&self.from, &self.to) {
            (Some(from), _) if login < *from => false,
            (_, Some(to)) if login > *to => false,
            _ => true,
        }
    }
}

/// Escapes the `LIKE` wildcards `%` and `_` so the email filter matches them
/// literally. Patterns are matched with `\` as the escape character.
pub(crate) fn escape_like(pattern: &str) -> String {
    let mut escaped = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Failure of the two-step fogging write.
#[derive(Debug, thiserror::Error)]
pub enum FoggingWriteError<E: std::error::Error + 'static> {
    #[error("failed to insert fogging log: {0}")]
    Insert(#[source] E),
    /// The log row exists but the sensor still carries its old risk level.
    #[error("fogging log saved but sensor update failed: {0}")]
    SensorUpdate(#[source] E),
}

/// Data access to the hosted backend.
///
/// Listing operations return every row, newest first by the table's
/// timestamp column. Rows are returned as the backend stores them; callers
/// run them through [`fogwatch_core::convert`].
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Sensors ordered by `last_updated` descending.
    async fn list_sensors(&self, credentials: &Credentials) -> Result<Vec<SensorRow>, Self::Error>;

    /// Detections ordered by `timestamp` descending, each with its sensor
    /// embedded.
    async fn list_detections(
        &self,
        credentials: &Credentials,
    ) -> Result<Vec<DetectionRow>, Self::Error>;

    /// Fogging logs ordered by `date` descending.
    async fn list_fogging_logs(
        &self,
        credentials: &Credentials,
    ) -> Result<Vec<FoggingLogRow>, Self::Error>;

    async fn insert_fogging_log(
        &self,
        credentials: &Credentials,
        log: &NewFoggingLog,
    ) -> Result<(), Self::Error>;

    /// Resets the sensor's risk level to `low` and records the fogging date.
    async fn mark_sensor_fogged(
        &self,
        credentials: &Credentials,
        sensor_id: &SensorId,
        date: jiff::civil::Date,
    ) -> Result<(), Self::Error>;

    /// Inserts the log, then marks the sensor as fogged.
    ///
    /// The default runs two independent writes; a failure of the second one
    /// leaves the log in place. Backends with transactions should override
    /// this and commit both writes together.
    async fn record_fogging(
        &self,
        credentials: &Credentials,
        log: &NewFoggingLog,
    ) -> Result<(), FoggingWriteError<Self::Error>> {
        self.insert_fogging_log(credentials, log)
            .await
            .map_err(FoggingWriteError::Insert)?;

        self.mark_sensor_fogged(credentials, &log.sensor_id, log.date)
            .await
            .map_err(FoggingWriteError::SensorUpdate)?;

        Ok(())
    }

    /// Sessions matching `filter`, ordered by `login_time` descending.
    async fn list_sessions(
        &self,
        credentials: &Credentials,
        filter: &SessionFilter,
    ) -> Result<Vec<UserSessionRow>, Self::Error>;

    /// Opens an active session record for the user.
    async fn open_session(
        &self,
        credentials: &Credentials,
        user_id: &UserId,
        email: &str,
    ) -> Result<(), Self::Error>;

    /// Closes the user's most recent active session. Returns `false` when the
    /// user has no active session.
    async fn close_session(
        &self,
        credentials: &Credentials,
        user_id: &UserId,
        logout_time: Timestamp,
    ) -> Result<bool, Self::Error>;

    /// Subscribes to change notifications. Receivers see every table; callers
    /// filter for the ones they watch.
    fn subscribe(&self) -> broadcast::Receiver<TableChange>;

    /// Starts relaying changes made by other clients into [`subscribe`]
    /// receivers, for backends that need a live connection for that. Returns
    /// `None` when every change already passes through this process.
    ///
    /// [`subscribe`]: Backend::subscribe
    fn listen(
        &self,
        _credentials: Arc<dyn CredentialSource>,
        _cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(email: &str, login: &str, active: bool) -> UserSessionRow {
        UserSessionRow {
            id: "s".to_owned(),
            user_id: "u".to_owned(),
            email: Some(email.to_owned()),
            login_time: Some(login.to_owned()),
            is_active: Some(active),
            ..Default::default()
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = SessionFilter::default();
        assert!(filter.matches(&row("a@b.c", "garbage", false)));
    }

    #[test]
    fn email_filter_is_case_insensitive_substring() {
        let filter = SessionFilter {
            email: Some("OPS".to_owned()),
            ..Default::default()
        };

        assert!(filter.matches(&row("field-ops@up.edu.ph", "2024-06-01T00:00:00Z", true)));
        assert!(!filter.matches(&row("admin@up.edu.ph", "2024-06-01T00:00:00Z", true)));
    }

    #[test]
    fn like_wildcards_are_escaped() {
        assert_eq!(escape_like("field_ops"), "field\\_ops");
        assert_eq!(escape_like("100%"), "100\\%");
        assert_eq!(escape_like("a\\b"), "a\\\\b");
        assert_eq!(escape_like("plain"), "plain");
    }

    #[test]
    fn date_range_is_inclusive() {
        let filter = SessionFilter {
            from: Some("2024-06-01T00:00:00Z".parse().unwrap()),
            to: Some("2024-06-02T00:00:00Z".parse().unwrap()),
            ..Default::default()
        };

        assert!(filter.matches(&row("a", "2024-06-01T00:00:00Z", true)));
        assert!(filter.matches(&row("a", "2024-06-02T00:00:00Z", true)));
        assert!(!filter.matches(&row("a", "2024-06-02T00:00:01Z", true)));
        assert!(!filter.matches(&row("a", "not a time", true)));
    }

    #[test]
    fn active_filter_checks_flag() {
        let filter = SessionFilter {
            active: Some(false),
            ..Default::default()
        };

        assert!(filter.matches(&row("a", "2024-06-01T00:00:00Z", false)));
        assert!(!filter.matches(&row("a", "2024-06-01T00:00:00Z", true)));
    }
}
