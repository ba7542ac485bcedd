//! Login-session history.

use std::sync::Arc;

use fogwatch_core::convert::session_from_row;
use fogwatch_core::session::SessionView;
use fogwatch_core::UserSession;
use jiff::Timestamp;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{CredentialSource, Credentials};
use crate::backend::{Backend, SessionFilter, Table};
use crate::store::{ResourceState, ResourceStatus, SharedState, StoreError, fetch_into};

/// Session records matching the current filter, most recent login first.
pub struct SessionStore<B> {
    backend: Arc<B>,
    state: SharedState<UserSession>,
    filter: Arc<RwLock<SessionFilter>>,
}

impl<B> Clone for SessionStore<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            state: Arc::clone(&self.state),
            filter: Arc::clone(&self.filter),
        }
    }
}

impl<B: Backend> SessionStore<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            state: Arc::default(),
            filter: Arc::default(),
        }
    }

    /// Replaces the filter. Takes effect on the next fetch.
    pub async fn set_filter(&self, filter: SessionFilter) {
        *self.filter.write().await = filter;
    }

    pub async fn filter(&self) -> SessionFilter {
        self.filter.read().await.clone()
    }

    pub async fn fetch(&self, credentials: &Credentials) -> Result<Vec<UserSession>, StoreError> {
        let filter = self.filter().await;

        fetch_into(
            &self.state,
            Table::UserSessions,
            self.backend.list_sessions(credentials, &filter),
            session_from_row,
        )
        .await
    }

    pub async fn state(&self) -> ResourceState<UserSession> {
        self.state.read().await.clone()
    }

    pub async fn status(&self) -> ResourceStatus {
        self.state.read().await.status()
    }

    /// Sessions with durations measured to `now`.
    pub async fn views(&self, now: Timestamp) -> Vec<SessionView> {
        self.state
            .read()
            .await
            .items
            .iter()
            .cloned()
            .map(|session| SessionView::new(session, now))
            .collect()
    }

    /// Refetches on every change to the sessions table until `cancel` fires.
    ///
    /// Each notification triggers a full refetch with credentials taken from
    /// `credentials` at that moment; bursts are not coalesced.
    pub fn watch<C>(&self, credentials: C, cancel: CancellationToken) -> JoinHandle<()>
    where
        C: CredentialSource,
    {
        let store = self.clone();
        let mut changes = self.backend.subscribe();

        tokio::spawn(async move {
            info!("watching login sessions");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    change = changes.recv() => match change {
                        Ok(change) if change.table == Table::UserSessions => {
                            debug!(kind = ?change.kind, "login sessions changed");
                            // Failures are already recorded in the store.
                            let _ = store.fetch(&credentials.credentials().await).await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "missed session notifications, refetching");
                            let _ = store.fetch(&credentials.credentials().await).await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }

            info!("stopped watching login sessions");
        })
    }
}
