use fogwatch_client::DashboardSnapshot;
use fogwatch_core::Sensor;
use fogwatch_core::stats::DetectionSummary;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DashboardResponse {
    #[serde(flatten)]
    pub snapshot: DashboardSnapshot,
    pub high_risk_sensors: Vec<Sensor>,
    pub recent_detections: Vec<DetectionSummary>,
}

#[derive(Debug, Deserialize)]
pub struct FoggingLogRequest {
    pub sensor_id: String,
    /// Defaults to today.
    pub date: Option<jiff::civil::Date>,
    pub notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionQueryParams {
    pub active: Option<bool>,
    pub email: Option<String>,
    pub from: Option<Timestamp>,
    pub to: Option<Timestamp>,
}
