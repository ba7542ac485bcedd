//! Dashboard counters derived from the aggregated datasets.

use jiff::{Timestamp, Zoned};
use serde::Serialize;

use crate::{Detection, MosquitoLevel, Sensor, SensorStatus};

/// Counters shown on the dashboard status cards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DashboardStats {
    pub active_sensors: usize,
    pub alert_locations: usize,
    pub detections_today: usize,
}

impl DashboardStats {
    /// `now` fixes both the calendar day and the time zone it is measured in.
    pub fn compute(sensors: &[Sensor], detections: &[Detection], now: &Zoned) -> Self {
        Self {
            active_sensors: active_sensor_count(sensors),
            alert_locations: alert_location_count(sensors),
            detections_today: detections_today_count(detections, now),
        }
    }
}

pub fn active_sensor_count(sensors: &[Sensor]) -> usize {
    sensors
        .iter()
        .filter(|sensor| sensor.status == SensorStatus::Active)
        .count()
}

pub fn alert_location_count(sensors: &[Sensor]) -> usize {
    high_risk_sensors(sensors).count()
}

pub fn high_risk_sensors(sensors: &[Sensor]) -> impl Iterator<Item = &Sensor> {
    sensors
        .iter()
        .filter(|sensor| sensor.mosquito_level == MosquitoLevel::High)
}

/// Bounds of the calendar day containing `now`, as `[start, end)`.
pub fn day_bounds(now: &Zoned) -> Option<(Timestamp, Timestamp)> {
    let start = now.start_of_day().ok()?;
    let end = now.tomorrow().ok()?.start_of_day().ok()?;

    Some((start.timestamp(), end.timestamp()))
}

/// Detections whose timestamp falls within the calendar day of `now`, in
/// `now`'s time zone.
pub fn detections_today_count(detections: &[Detection], now: &Zoned) -> usize {
    let Some((start, end)) = day_bounds(now) else {
        return 0;
    };

    detections
        .iter()
        .filter(|detection| detection.timestamp >= start && detection.timestamp < end)
        .count()
}

/// Gallery entry for a detection, with fallbacks for a missing sensor join.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionSummary {
    pub id: Box<str>,
    pub image_url: Box<str>,
    pub timestamp: Timestamp,
    pub confidence: f64,
    pub sensor_name: Box<str>,
    pub location: Box<str>,
}

impl From<&Detection> for DetectionSummary {
    fn from(detection: &Detection) -> Self {
        let (sensor_name, location) = match &detection.sensor {
            Some(sensor) => (sensor.name.clone(), sensor.location.clone()),
            None => ("Unknown Sensor".into(), "Unknown Location".into()),
        };

        Self {
            id: detection.id.0.clone(),
            image_url: detection.image_url.clone(),
            timestamp: detection.timestamp,
            confidence: detection.confidence,
            sensor_name,
            location,
        }
    }
}

#[cfg(test)]
mod tests {
    use jiff::civil::date;
    use jiff::tz::{self, TimeZone};

    use super::*;
    use crate::{DetectionId, SensorId};

    fn manila() -> TimeZone {
        tz::offset(8).to_time_zone()
    }

    fn sensor(id: &str, status: SensorStatus, level: MosquitoLevel) -> Sensor {
        Sensor {
            id: SensorId::from(id),
            name: format!("Sensor {id}").into(),
            location: "Academic Oval".into(),
            status,
            mosquito_level: level,
            last_updated: Timestamp::UNIX_EPOCH,
            last_fogged: None,
            coordinates: None,
        }
    }

    fn detection_at(id: &str, zoned: Zoned) -> Detection {
        Detection {
            id: DetectionId::from(id),
            sensor_id: SensorId::from("s1"),
            image_url: "https://img/d.jpg".into(),
            confidence: 0.8,
            timestamp: zoned.timestamp(),
            sensor: None,
        }
    }

    #[test]
    fn counts_active_and_alert_sensors() {
        let sensors = vec![
            sensor("a", SensorStatus::Active, MosquitoLevel::High),
            sensor("b", SensorStatus::Active, MosquitoLevel::Low),
            sensor("c", SensorStatus::Maintenance, MosquitoLevel::High),
            sensor("d", SensorStatus::Inactive, MosquitoLevel::Medium),
        ];

        assert_eq!(active_sensor_count(&sensors), 2);
        assert_eq!(alert_location_count(&sensors), 2);

        let ids: Vec<_> = high_risk_sensors(&sensors)
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(ids, ["a", "c"]);
    }

    #[test]
    fn today_boundary_is_local_midnight() {
        let tz = manila();
        let now = date(2024, 6, 2).at(15, 0, 0, 0).to_zoned(tz.clone()).unwrap();

        let detections = vec![
            detection_at(
                "yesterday",
                date(2024, 6, 1).at(23, 59, 59, 0).to_zoned(tz.clone()).unwrap(),
            ),
            detection_at(
                "midnight",
                date(2024, 6, 2).at(0, 0, 0, 0).to_zoned(tz.clone()).unwrap(),
            ),
            detection_at(
                "late",
                date(2024, 6, 2).at(23, 59, 59, 0).to_zoned(tz.clone()).unwrap(),
            ),
            detection_at(
                "tomorrow",
                date(2024, 6, 3).at(0, 0, 0, 0).to_zoned(tz).unwrap(),
            ),
        ];

        assert_eq!(detections_today_count(&detections, &now), 2);
    }

    #[test]
    fn today_depends_on_time_zone() {
        // 2024-06-01T20:00Z is already June 2nd in Manila.
        let detection = detection_at(
            "d",
            date(2024, 6, 1).at(20, 0, 0, 0).to_zoned(TimeZone::UTC).unwrap(),
        );
        let now_manila = date(2024, 6, 2).at(9, 0, 0, 0).to_zoned(manila()).unwrap();
        let now_utc = date(2024, 6, 2).at(9, 0, 0, 0).to_zoned(TimeZone::UTC).unwrap();

        assert_eq!(detections_today_count(&[detection.clone()], &now_manila), 1);
        assert_eq!(detections_today_count(&[detection], &now_utc), 0);
    }

    #[test]
    fn summary_falls_back_without_sensor() {
        let now = date(2024, 6, 2).at(9, 0, 0, 0).to_zoned(manila()).unwrap();
        let mut detection = detection_at("d", now);

        let summary = DetectionSummary::from(&detection);
        assert_eq!(&*summary.sensor_name, "Unknown Sensor");
        assert_eq!(&*summary.location, "Unknown Location");

        detection.sensor = Some(sensor("s1", SensorStatus::Active, MosquitoLevel::Low));
        let summary = DetectionSummary::from(&detection);
        assert_eq!(&*summary.sensor_name, "Sensor s1");
        assert_eq!(&*summary.location, "Academic Oval");
    }

    #[test]
    fn stats_compute_combines_counters() {
        let now = date(2024, 6, 2).at(9, 0, 0, 0).to_zoned(manila()).unwrap();
        let sensors = vec![sensor("a", SensorStatus::Active, MosquitoLevel::High)];
        let detections = vec![detection_at("d", now.clone())];

        assert_eq!(
            DashboardStats::compute(&sensors, &detections, &now),
            DashboardStats {
                active_sensors: 1,
                alert_locations: 1,
                detections_today: 1,
            }
        );
    }
}
