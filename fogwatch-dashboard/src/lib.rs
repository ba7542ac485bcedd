pub mod api;
pub mod config;
pub mod seed;

use std::sync::Arc;

use fogwatch_client::{CredentialSource, Credentials, Dashboard, SessionStore};
use jiff::Zoned;
use jiff::tz::TimeZone;
use tokio::sync::Mutex;

// AppState must be defined in lib.rs to be visible to all modules
pub struct AppState<B> {
    pub dashboard: Dashboard<B>,
    pub sessions: SessionStore<B>,
    /// Credentials of the operator the server signed in as, refreshed as
    /// they approach expiry.
    pub auth: Arc<dyn CredentialSource>,
    pub time_zone: TimeZone,
    /// Serializes session queries, which share the store's filter.
    pub session_query: Arc<Mutex<()>>,
}

impl<B> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            dashboard: self.dashboard.clone(),
            sessions: self.sessions.clone(),
            auth: Arc::clone(&self.auth),
            time_zone: self.time_zone.clone(),
            session_query: Arc::clone(&self.session_query),
        }
    }
}

impl<B> AppState<B> {
    pub fn new(
        dashboard: Dashboard<B>,
        sessions: SessionStore<B>,
        auth: Arc<dyn CredentialSource>,
        time_zone: TimeZone,
    ) -> Self {
        Self {
            dashboard,
            sessions,
            auth,
            time_zone,
            session_query: Arc::default(),
        }
    }

    pub async fn credentials(&self) -> Credentials {
        self.auth.credentials().await
    }

    pub fn now(&self) -> Zoned {
        Zoned::now().with_time_zone(self.time_zone.clone())
    }
}
