//! Per-resource stores.
//!
//! Each store owns one collection together with its loading flag and last
//! error. Handles are cheap to clone and share the same state.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use fogwatch_core::convert::{detection_from_row, fogging_log_from_row, sensor_from_row};
use fogwatch_core::{Detection, FoggingLog, NewFoggingLog, Sensor, SensorId};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::auth::Credentials;
use crate::backend::{Backend, FoggingWriteError, Table};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("failed to fetch {table}: {message}")]
    Fetch { table: Table, message: String },
    #[error("failed to log fogging: {0}")]
    LogInsert(String),
    #[error("fogging logged but sensor update failed: {0}")]
    SensorUpdate(String),
}

impl<E: std::error::Error + 'static> From<FoggingWriteError<E>> for StoreError {
    fn from(err: FoggingWriteError<E>) -> Self {
        match err {
            FoggingWriteError::Insert(e) => Self::LogInsert(e.to_string()),
            FoggingWriteError::SensorUpdate(e) => Self::SensorUpdate(e.to_string()),
        }
    }
}

/// Loading flag and last error of a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceStatus {
    pub loading: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceState<T> {
    pub items: Vec<T>,
    /// True while at least one fetch is in flight.
    pub loading: bool,
    pub error: Option<String>,
    in_flight: usize,
    issued: u64,
    applied: u64,
}

impl<T> Default for ResourceState<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            loading: false,
            error: None,
            in_flight: 0,
            issued: 0,
            applied: 0,
        }
    }
}

impl<T> ResourceState<T> {
    /// Registers a new fetch and returns its sequence number.
    fn begin_fetch(&mut self) -> u64 {
        self.in_flight += 1;
        self.issued += 1;
        self.loading = true;
        self.issued
    }

    /// Marks fetch `seq` as finished. Returns whether its result is the
    /// newest one seen so far and should replace the current state.
    fn finish_fetch(&mut self, seq: u64) -> bool {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.loading = self.in_flight > 0;

        if seq < self.applied {
            return false;
        }
        self.applied = seq;
        true
    }

    /// Forgets a fetch that was dropped before its response arrived.
    fn abandon_fetch(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.loading = self.in_flight > 0;
    }

    pub fn status(&self) -> ResourceStatus {
        ResourceStatus {
            loading: self.loading,
            error: self.error.clone(),
        }
    }
}

pub(crate) type SharedState<T> = Arc<RwLock<ResourceState<T>>>;

/// Releases the in-flight slot of a fetch whose future is dropped early, such
/// as a request handler cancelled by a disconnecting client.
struct InFlight<T: Send + Sync + 'static> {
    state: SharedState<T>,
    armed: bool,
}

impl<T: Send + Sync + 'static> Drop for InFlight<T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        if let Ok(mut state) = self.state.try_write() {
            state.abandon_fetch();
        } else if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let state = Arc::clone(&self.state);
            runtime.spawn(async move { state.write().await.abandon_fetch() });
        }
    }
}

/// Runs `request` against `state`: raises the loading flag, replaces the
/// collection on success, records the error otherwise, and lowers the flag
/// once no other fetch is in flight. A failed request leaves the previous
/// collection in place.
///
/// Fetches may overlap. A response that arrives after a newer one has already
/// been applied is returned to its caller but does not touch the state.
pub(crate) async fn fetch_into<T, R, E, F>(
    shared: &SharedState<T>,
    table: Table,
    request: F,
    convert: fn(&R) -> T,
) -> Result<Vec<T>, StoreError>
where
    T: Clone + Send + Sync + 'static,
    E: Display,
    F: Future<Output = Result<Vec<R>, E>>,
{
    let seq = shared.write().await.begin_fetch();
    let mut in_flight = InFlight {
        state: Arc::clone(shared),
        armed: true,
    };
    let result = request.await;

    let mut state = shared.write().await;
    in_flight.armed = false;
    let current = state.finish_fetch(seq);

    match result {
        Ok(rows) => {
            let items: Vec<T> = rows.iter().map(convert).collect();
            debug!(%table, count = items.len(), seq, current, "fetched rows");

            if current {
                state.items = items.clone();
                state.error = None;
            }

            Ok(items)
        }
        Err(e) => {
            error!(%table, error = %e, seq, "fetch failed");
            let err = StoreError::Fetch {
                table,
                message: e.to_string(),
            };
            if current {
                state.error = Some(err.to_string());
            }

            Err(err)
        }
    }
}

macro_rules! resource_store {
    ($(#[$meta:meta])* $name:ident, $item:ty) => {
        $(#[$meta])*
        pub struct $name<B> {
            backend: Arc<B>,
            state: SharedState<$item>,
        }

        impl<B> Clone for $name<B> {
            fn clone(&self) -> Self {
                Self {
                    backend: Arc::clone(&self.backend),
                    state: Arc::clone(&self.state),
                }
            }
        }

        impl<B: Backend> $name<B> {
            pub fn new(backend: Arc<B>) -> Self {
                Self {
                    backend,
                    state: Arc::default(),
                }
            }

            pub async fn state(&self) -> ResourceState<$item> {
                self.state.read().await.clone()
            }

            pub async fn items(&self) -> Vec<$item> {
                self.state.read().await.items.clone()
            }

            pub async fn status(&self) -> ResourceStatus {
                self.state.read().await.status()
            }
        }
    };
}

resource_store!(
    /// Sensors, newest report first.
    SensorStore,
    Sensor
);
resource_store!(
    /// Detections with their sensor embedded, newest first.
    DetectionStore,
    Detection
);
resource_store!(
    /// Fogging logs, most recent date first.
    FoggingLogStore,
    FoggingLog
);

impl<B: Backend> SensorStore<B> {
    pub async fn fetch(&self, credentials: &Credentials) -> Result<Vec<Sensor>, StoreError> {
        fetch_into(
            &self.state,
            Table::Sensors,
            self.backend.list_sensors(credentials),
            sensor_from_row,
        )
        .await
    }
}

impl<B: Backend> DetectionStore<B> {
    pub async fn fetch(&self, credentials: &Credentials) -> Result<Vec<Detection>, StoreError> {
        fetch_into(
            &self.state,
            Table::Detections,
            self.backend.list_detections(credentials),
            detection_from_row,
        )
        .await
    }
}

impl<B: Backend> FoggingLogStore<B> {
    pub async fn fetch(&self, credentials: &Credentials) -> Result<Vec<FoggingLog>, StoreError> {
        fetch_into(
            &self.state,
            Table::FoggingLogs,
            self.backend.list_fogging_logs(credentials),
            fogging_log_from_row,
        )
        .await
    }

    /// Records a treatment at `sensor_id` and resets that sensor's risk level
    /// to low, then refetches the logs.
    ///
    /// Once the write has gone through this returns `Ok`; a failed refetch is
    /// only logged and left in the store's error.
    pub async fn log_fogging(
        &self,
        credentials: &Credentials,
        sensor_id: SensorId,
        date: jiff::civil::Date,
        notes: Option<&str>,
    ) -> Result<(), StoreError> {
        let log = NewFoggingLog::new(sensor_id, date, notes);

        if let Err(e) = self.backend.record_fogging(credentials, &log).await {
            let err = StoreError::from(e);
            error!(sensor_id = %log.sensor_id, error = %err, "failed to log fogging");
            self.state.write().await.error = Some(err.to_string());

            return Err(err);
        }
        info!(sensor_id = %log.sensor_id, %date, "logged fogging");

        if let Err(e) = self.fetch(credentials).await {
            warn!(error = %e, "fogging logged but refetching logs failed");
        }
        Ok(())
    }
}
