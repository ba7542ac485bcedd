pub mod convert;
pub mod row;
pub mod session;
pub mod stats;

use std::fmt;

use serde::{Deserialize, Serialize};

// Identifiers and labels are never resized after they are read from the
// backend, so we keep them as `Box<str>` rather than `String`.
type BoxStr = Box<str>;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub BoxStr);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.into())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value.into_boxed_str())
            }
        }
    };
}

string_id!(
    /// Unique identifier for a deployed sensor.
    SensorId
);
string_id!(
    /// Unique identifier for a detection event.
    DetectionId
);
string_id!(
    /// Unique identifier for a fogging log entry.
    FoggingLogId
);
string_id!(
    /// Unique identifier for a login session record.
    SessionId
);
string_id!(
    /// Identity of an authenticated user, as issued by the auth service.
    UserId
);

/// A deployed monitoring device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    /// Stable identity of this sensor.
    pub id: SensorId,
    /// Human readable name.
    pub name: BoxStr,
    /// Location label, e.g. a building or street.
    pub location: BoxStr,
    /// Operational state.
    pub status: SensorStatus,
    /// Current mosquito risk tier.
    pub mosquito_level: MosquitoLevel,
    /// Time of the last report from this sensor.
    pub last_updated: jiff::Timestamp,
    /// Date of the last treatment at this sensor's location.
    pub last_fogged: Option<jiff::civil::Date>,
    /// Position of the sensor, when known.
    pub coordinates: Option<Coordinates>,
}

/// Operational state of a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorStatus {
    Active,
    #[default]
    Inactive,
    Maintenance,
}

impl SensorStatus {
    pub const ALL: [SensorStatus; 3] = [Self::Active, Self::Inactive, Self::Maintenance];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for SensorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mosquito risk tier derived from a sensor's recent detections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MosquitoLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl MosquitoLevel {
    pub const ALL: [MosquitoLevel; 3] = [Self::Low, Self::Medium, Self::High];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for MosquitoLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Geographic position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

/// A recorded mosquito-presence event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Unique id for this detection.
    pub id: DetectionId,
    /// Sensor that captured the detection.
    pub sensor_id: SensorId,
    /// Reference to the captured image.
    pub image_url: BoxStr,
    /// Classifier confidence in the range 0–1.
    pub confidence: f64,
    /// Time of the detection event.
    pub timestamp: jiff::Timestamp,
    /// Snapshot of the owning sensor, joined at fetch time.
    pub sensor: Option<Sensor>,
}

/// A treatment applied at a sensor's location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoggingLog {
    pub id: FoggingLogId,
    pub sensor_id: SensorId,
    pub date: jiff::civil::Date,
    pub notes: Option<BoxStr>,
}

/// A fogging log as submitted by an operator, before the backend assigns an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFoggingLog {
    pub sensor_id: SensorId,
    pub date: jiff::civil::Date,
    pub notes: Option<BoxStr>,
}

impl NewFoggingLog {
    /// Builds a submission, treating blank notes as absent.
    pub fn new(sensor_id: SensorId, date: jiff::civil::Date, notes: Option<&str>) -> Self {
        let notes = notes
            .map(str::trim)
            .filter(|notes| !notes.is_empty())
            .map(Into::into);

        Self {
            sensor_id,
            date,
            notes,
        }
    }
}

/// A login session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSession {
    pub id: SessionId,
    pub user_id: UserId,
    pub email: BoxStr,
    pub login_time: jiff::Timestamp,
    pub logout_time: Option<jiff::Timestamp>,
    pub created_at: Option<jiff::Timestamp>,
    /// Still open. Sessions left behind by a crash stay active.
    pub is_active: bool,
}
