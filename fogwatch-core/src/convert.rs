//! Conversion of backend rows into the typed model.
//!
//! Nothing here fails: unrecognized or missing values degrade to the
//! defaults documented on each function.

use jiff::{Timestamp, civil, tz::TimeZone};
use serde_json::Value;

use crate::row::{DetectionRow, FoggingLogRow, SensorRow, UserSessionRow};
use crate::{
    Coordinates, Detection, DetectionId, FoggingLog, FoggingLogId, MosquitoLevel, Sensor,
    SensorId, SensorStatus, SessionId, UserId, UserSession,
};

/// Maps a raw status to a [`SensorStatus`], falling back to `inactive`.
pub fn validate_sensor_status(raw: Option<&Value>) -> SensorStatus {
    match raw.and_then(Value::as_str) {
        Some("active") => SensorStatus::Active,
        Some("inactive") => SensorStatus::Inactive,
        Some("maintenance") => SensorStatus::Maintenance,
        _ => SensorStatus::Inactive,
    }
}

/// Maps a raw risk level to a [`MosquitoLevel`], falling back to `low`.
pub fn validate_mosquito_level(raw: Option<&Value>) -> MosquitoLevel {
    match raw.and_then(Value::as_str) {
        Some("low") => MosquitoLevel::Low,
        Some("medium") => MosquitoLevel::Medium,
        Some("high") => MosquitoLevel::High,
        _ => MosquitoLevel::Low,
    }
}

/// Parses a backend timestamp.
///
/// Accepts RFC 3339 with an offset, or a civil date-time without one which is
/// read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<Timestamp> {
    let raw = raw.trim();
    if let Ok(ts) = raw.parse::<Timestamp>() {
        return Some(ts);
    }

    // Postgres `timestamp` columns render with a space separator.
    let normalized = raw.replacen(' ', "T", 1);
    if let Ok(ts) = normalized.parse::<Timestamp>() {
        return Some(ts);
    }

    normalized
        .parse::<civil::DateTime>()
        .ok()
        .and_then(|dt| dt.to_zoned(TimeZone::UTC).ok())
        .map(|zoned| zoned.timestamp())
}

/// Parses a backend date, accepting a full timestamp as well.
pub fn parse_date(raw: &str) -> Option<civil::Date> {
    let raw = raw.trim();
    if let Ok(date) = raw.parse::<civil::Date>() {
        return Some(date);
    }

    parse_timestamp(raw).map(|ts| ts.to_zoned(TimeZone::UTC).date())
}

fn parse_coordinates(raw: Option<&Value>) -> Option<Coordinates> {
    let object = raw?.as_object()?;
    let lat = object.get("lat")?.as_f64()?;
    let lng = object.get("lng")?.as_f64()?;

    Some(Coordinates { lat, lng })
}

fn required_timestamp(raw: Option<&str>) -> Timestamp {
    raw.and_then(parse_timestamp).unwrap_or(Timestamp::UNIX_EPOCH)
}

/// Converts a sensor row, validating status and risk level.
pub fn sensor_from_row(row: &SensorRow) -> Sensor {
    Sensor {
        id: SensorId::from(row.id.as_str()),
        name: row.name.as_deref().unwrap_or_default().into(),
        location: row.location.as_deref().unwrap_or_default().into(),
        status: validate_sensor_status(row.status.as_ref()),
        mosquito_level: validate_mosquito_level(row.mosquito_level.as_ref()),
        last_updated: required_timestamp(row.last_updated.as_deref()),
        last_fogged: row.last_fogged.as_deref().and_then(parse_date),
        coordinates: parse_coordinates(row.coordinates.as_ref()),
    }
}

/// Converts a detection row. The embedded sensor, if any, goes through
/// [`sensor_from_row`] like any standalone sensor.
pub fn detection_from_row(row: &DetectionRow) -> Detection {
    Detection {
        id: DetectionId::from(row.id.as_str()),
        sensor_id: SensorId::from(row.sensor_id.as_str()),
        image_url: row.image_url.as_deref().unwrap_or_default().into(),
        confidence: row.confidence.unwrap_or_default(),
        timestamp: required_timestamp(row.timestamp.as_deref()),
        sensor: row.sensor.as_ref().map(sensor_from_row),
    }
}

/// Converts a fogging log row. A missing or malformed date reads as the epoch
/// date so the entry still shows up in history.
pub fn fogging_log_from_row(row: &FoggingLogRow) -> FoggingLog {
    FoggingLog {
        id: FoggingLogId::from(row.id.as_str()),
        sensor_id: SensorId::from(row.sensor_id.as_str()),
        date: row
            .date
            .as_deref()
            .and_then(parse_date)
            .unwrap_or(civil::date(1970, 1, 1)),
        notes: row.notes.as_deref().map(Into::into),
    }
}

pub fn session_from_row(row: &UserSessionRow) -> UserSession {
    UserSession {
        id: SessionId::from(row.id.as_str()),
        user_id: UserId::from(row.user_id.as_str()),
        email: row.email.as_deref().unwrap_or_default().into(),
        login_time: required_timestamp(row.login_time.as_deref()),
        logout_time: row.logout_time.as_deref().and_then(parse_timestamp),
        created_at: row.created_at.as_deref().and_then(parse_timestamp),
        is_active: row.is_active.unwrap_or(false),
    }
}
