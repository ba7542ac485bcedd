//! Demo deployment for the in-memory backend.

use fogwatch_client::backend::memory::InMemoryBackend;
use fogwatch_core::row::{DetectionRow, FoggingLogRow, SensorRow};
use fogwatch_core::{MosquitoLevel, SensorStatus};
use jiff::{SignedDuration, Timestamp};
use serde_json::json;
use tracing::info;

struct DemoSensor {
    id: &'static str,
    name: &'static str,
    location: &'static str,
    status: SensorStatus,
    level: MosquitoLevel,
    lat: f64,
    lng: f64,
}

const SENSORS: &[DemoSensor] = &[
    DemoSensor {
        id: "sensor-quezon-hall",
        name: "Quezon Hall",
        location: "UP Diliman Quezon Hall",
        status: SensorStatus::Active,
        level: MosquitoLevel::High,
        lat: 14.6549,
        lng: 121.0645,
    },
    DemoSensor {
        id: "sensor-academic-oval",
        name: "Academic Oval",
        location: "Diliman Oval",
        status: SensorStatus::Active,
        level: MosquitoLevel::Medium,
        lat: 14.6537,
        lng: 121.0686,
    },
    DemoSensor {
        id: "sensor-lagoon",
        name: "Sunken Garden",
        location: "Sunken Garden",
        status: SensorStatus::Active,
        level: MosquitoLevel::High,
        lat: 14.6566,
        lng: 121.0702,
    },
    DemoSensor {
        id: "sensor-vinzons",
        name: "Vinzons Hall",
        location: "Vinzons Hall",
        status: SensorStatus::Maintenance,
        level: MosquitoLevel::Low,
        lat: 14.6541,
        lng: 121.0731,
    },
    DemoSensor {
        id: "sensor-library",
        name: "Main Library",
        location: "Gonzalez Hall",
        status: SensorStatus::Inactive,
        level: MosquitoLevel::Low,
        lat: 14.6557,
        lng: 121.0668,
    },
];

fn ago(now: Timestamp, minutes: i64) -> String {
    now.saturating_sub(SignedDuration::from_mins(minutes))
        .unwrap_or(now)
        .to_string()
}

/// Fills `backend` with a small campus deployment whose timestamps are
/// relative to now.
pub async fn demo(backend: &InMemoryBackend) {
    let now = Timestamp::now();

    for (i, sensor) in SENSORS.iter().enumerate() {
        backend
            .upsert_sensor(SensorRow {
                id: sensor.id.to_owned(),
                name: Some(sensor.name.to_owned()),
                location: Some(sensor.location.to_owned()),
                status: Some(json!(sensor.status)),
                mosquito_level: Some(json!(sensor.level)),
                last_updated: Some(ago(now, 5 * i as i64)),
                last_fogged: None,
                coordinates: Some(json!({ "lat": sensor.lat, "lng": sensor.lng })),
            })
            .await;
    }

    let detections = [
        ("sensor-quezon-hall", 12, 0.94),
        ("sensor-quezon-hall", 47, 0.81),
        ("sensor-lagoon", 95, 0.88),
        ("sensor-academic-oval", 60 * 30, 0.67),
    ];
    for (n, (sensor_id, minutes, confidence)) in detections.into_iter().enumerate() {
        backend
            .insert_detection(DetectionRow {
                id: format!("detection-{n}"),
                sensor_id: sensor_id.to_owned(),
                image_url: Some(format!("https://images.fogwatch.local/detections/{n}.jpg")),
                confidence: Some(confidence),
                timestamp: Some(ago(now, minutes)),
                sensor: None,
            })
            .await;
    }

    backend
        .insert_log_row(FoggingLogRow {
            id: "fogging-0".to_owned(),
            sensor_id: "sensor-vinzons".to_owned(),
            date: Some(ago(now, 60 * 24 * 3)),
            notes: Some("Routine treatment around the canal".to_owned()),
        })
        .await;

    info!(
        sensors = SENSORS.len(),
        detections = detections.len(),
        "seeded demo deployment"
    );
}
