//! Loosely typed rows as the backend returns them.
//!
//! Only identity fields are required. Everything the backend may send in an
//! unexpected shape is kept untyped here and interpreted by [`crate::convert`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorRow {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub status: Option<Value>,
    #[serde(default)]
    pub mosquito_level: Option<Value>,
    #[serde(default)]
    pub last_updated: Option<String>,
    #[serde(default)]
    pub last_fogged: Option<String>,
    #[serde(default)]
    pub coordinates: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionRow {
    pub id: String,
    pub sensor_id: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Sensor embedded by the backend's join expansion.
    #[serde(default)]
    pub sensor: Option<SensorRow>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FoggingLogRow {
    pub id: String,
    pub sensor_id: String,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserSessionRow {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub login_time: Option<String>,
    #[serde(default)]
    pub logout_time: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
}
