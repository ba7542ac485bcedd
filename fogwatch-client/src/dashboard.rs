use std::sync::Arc;

use fogwatch_core::stats::{self, DashboardStats, DetectionSummary};
use fogwatch_core::{Detection, FoggingLog, Sensor, SensorId};
use jiff::Zoned;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use crate::auth::Credentials;
use crate::backend::Backend;
use crate::store::{
    DetectionStore, FoggingLogStore, ResourceStatus, SensorStore, StoreError,
};

/// Loading and error state merged across the three dashboard resources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CombinedStatus {
    pub loading: bool,
    pub error: Option<String>,
}

/// Merges per-resource statuses, given in sensors, detections, logs order.
///
/// Loading while any resource is loading; the error is the first one present.
pub fn combine(statuses: [&ResourceStatus; 3]) -> CombinedStatus {
    CombinedStatus {
        loading: statuses.iter().any(|status| status.loading),
        error: statuses.iter().find_map(|status| status.error.clone()),
    }
}

/// Everything the dashboard view renders, taken at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardSnapshot {
    pub sensors: Vec<Sensor>,
    pub detections: Vec<Detection>,
    pub fogging_logs: Vec<FoggingLog>,
    #[serde(flatten)]
    pub status: CombinedStatus,
    pub stats: DashboardStats,
}

impl DashboardSnapshot {
    pub fn high_risk_sensors(&self) -> impl Iterator<Item = &Sensor> {
        stats::high_risk_sensors(&self.sensors)
    }

    pub fn detection_summaries(&self) -> Vec<DetectionSummary> {
        self.detections.iter().map(DetectionSummary::from).collect()
    }
}

/// Aggregates the sensor, detection and fogging-log stores.
pub struct Dashboard<B> {
    sensors: SensorStore<B>,
    detections: DetectionStore<B>,
    fogging_logs: FoggingLogStore<B>,
    initialized: Arc<OnceCell<()>>,
}

impl<B> Clone for Dashboard<B> {
    fn clone(&self) -> Self {
        Self {
            sensors: self.sensors.clone(),
            detections: self.detections.clone(),
            fogging_logs: self.fogging_logs.clone(),
            initialized: Arc::clone(&self.initialized),
        }
    }
}

impl<B: Backend> Dashboard<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            sensors: SensorStore::new(Arc::clone(&backend)),
            detections: DetectionStore::new(Arc::clone(&backend)),
            fogging_logs: FoggingLogStore::new(backend),
            initialized: Arc::new(OnceCell::new()),
        }
    }

    /// Loads all three resources concurrently. Only the first call on a
    /// dashboard (or any of its clones) fetches; later and concurrent calls
    /// wait for it and return. Fetch failures end up in the combined status.
    #[instrument(skip_all)]
    pub async fn initialize(&self, credentials: &Credentials) {
        self.initialized
            .get_or_init(|| async {
                self.fetch_all(credentials).await;
                info!("dashboard initialized");
            })
            .await;
    }

    /// Reloads all three resources concurrently, whether or not the dashboard
    /// was initialized before. Marks it initialized.
    #[instrument(skip_all)]
    pub async fn refresh(&self, credentials: &Credentials) {
        if self.is_initialized() {
            self.fetch_all(credentials).await;
        } else {
            self.initialize(credentials).await;
        }
    }

    async fn fetch_all(&self, credentials: &Credentials) {
        let (sensors, detections, logs) = tokio::join!(
            self.sensors.fetch(credentials),
            self.detections.fetch(credentials),
            self.fogging_logs.fetch(credentials),
        );
        debug!(
            sensors = sensors.is_ok(),
            detections = detections.is_ok(),
            fogging_logs = logs.is_ok(),
            "dashboard fetched"
        );
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }

    pub async fn fetch_sensors(&self, credentials: &Credentials) -> Result<Vec<Sensor>, StoreError> {
        self.sensors.fetch(credentials).await
    }

    pub async fn fetch_detections(
        &self,
        credentials: &Credentials,
    ) -> Result<Vec<Detection>, StoreError> {
        self.detections.fetch(credentials).await
    }

    pub async fn fetch_fogging_logs(
        &self,
        credentials: &Credentials,
    ) -> Result<Vec<FoggingLog>, StoreError> {
        self.fogging_logs.fetch(credentials).await
    }

    /// Logs a treatment, then refreshes sensors so the reset risk level shows.
    /// A failed sensor refresh after a successful write is only logged.
    pub async fn log_fogging(
        &self,
        credentials: &Credentials,
        sensor_id: SensorId,
        date: jiff::civil::Date,
        notes: Option<&str>,
    ) -> Result<(), StoreError> {
        self.fogging_logs
            .log_fogging(credentials, sensor_id, date, notes)
            .await?;
        if let Err(e) = self.sensors.fetch(credentials).await {
            warn!(error = %e, "fogging logged but refetching sensors failed");
        }

        Ok(())
    }

    pub async fn status(&self) -> CombinedStatus {
        let (sensors, detections, logs) = tokio::join!(
            self.sensors.status(),
            self.detections.status(),
            self.fogging_logs.status(),
        );

        combine([&sensors, &detections, &logs])
    }

    /// Current collections and statistics, with "today" taken from `now`.
    pub async fn snapshot(&self, now: &Zoned) -> DashboardSnapshot {
        let (sensors, detections, logs) = tokio::join!(
            self.sensors.state(),
            self.detections.state(),
            self.fogging_logs.state(),
        );

        let status = combine([&sensors.status(), &detections.status(), &logs.status()]);
        let stats = DashboardStats::compute(&sensors.items, &detections.items, now);

        DashboardSnapshot {
            sensors: sensors.items,
            detections: detections.items,
            fogging_logs: logs.items,
            status,
            stats,
        }
    }
}
