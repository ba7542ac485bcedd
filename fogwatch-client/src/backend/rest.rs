//! Client for the hosted backend's REST interface.
//!
//! Rows are served by a PostgREST endpoint under `/rest/v1` and users are
//! authenticated by the auth endpoint under `/auth/v1`. Every request carries
//! the project's public key in the `apikey` header and a bearer token, which is
//! the user's access token when signed in and the public key otherwise.

use std::sync::Arc;

use async_trait::async_trait;
use fogwatch_core::row::{DetectionRow, FoggingLogRow, SensorRow, UserSessionRow};
use fogwatch_core::{MosquitoLevel, NewFoggingLog, SensorId, UserId};
use jiff::{SignedDuration, Timestamp};
use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::realtime::RealtimeListener;
use super::{
    Backend, CHANGE_CHANNEL_CAPACITY, ChangeKind, SessionFilter, Table, TableChange, escape_like,
};
use crate::auth::{AuthSession, AuthUser, Authenticator, CredentialSource, Credentials};

/// Tables whose changes by other clients are relayed over the realtime feed.
const REALTIME_TABLES: [Table; 1] = [Table::UserSessions];

/// Columns of the sensor embedded in each detection.
const DETECTION_SELECT: &str = "*,sensor:sensor_id(id,name,location,status,mosquito_level,last_updated,last_fogged,coordinates)";

#[derive(Debug, thiserror::Error)]
pub enum RestError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("sensor {0} not found")]
    SensorNotFound(SensorId),
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("session has no refresh token")]
    MissingRefreshToken,
}

#[derive(Clone)]
pub struct RestBackend {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
    changes: broadcast::Sender<TableChange>,
}

impl RestBackend {
    pub fn new(url: &str, anon_key: &str) -> Result<Self, RestError> {
        if url.is_empty() {
            return Err(RestError::Config("url is empty".into()));
        }
        if anon_key.is_empty() {
            return Err(RestError::Config("anon_key is empty".into()));
        }

        let http = reqwest::Client::builder().build()?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        Ok(Self {
            http,
            base_url: url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            changes,
        })
    }

    fn rest_url(&self, table: Table) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1{path}", self.base_url)
    }

    fn request(&self, method: Method, url: String, credentials: &Credentials) -> RequestBuilder {
        let token = credentials.access_token().unwrap_or(&self.anon_key);

        self.http
            .request(method, url)
            .header("apikey", &self.anon_key)
            .bearer_auth(token)
    }

    fn notify(&self, table: Table, kind: ChangeKind) {
        let _ = self.changes.send(TableChange { table, kind });
    }

    /// Fetches every row of `table`, newest first by `order_column`.
    async fn select<T>(
        &self,
        credentials: &Credentials,
        table: Table,
        select: &str,
        order_column: &str,
        filters: &[(&str, String)],
    ) -> Result<Vec<T>, RestError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let order = format!("{order_column}.desc");
        let response = self
            .request(Method::GET, self.rest_url(table), credentials)
            .query(&[("select", select), ("order", order.as_str())])
            .query(filters)
            .send()
            .await?;

        Ok(check(response).await?.json().await?)
    }
}

/// Turns a non-success response into [`RestError::Api`], using the message
/// from the body when there is one.
async fn check(response: Response) -> Result<Response, RestError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|value| {
            ["message", "msg", "error_description", "error"]
                .iter()
                .find_map(|key| value.get(key)?.as_str().map(str::to_owned))
        })
        .or_else(|| (!body.is_empty()).then_some(body))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown").into());

    Err(RestError::Api {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl Backend for RestBackend {
    type Error = RestError;

    async fn list_sensors(&self, credentials: &Credentials) -> Result<Vec<SensorRow>, Self::Error> {
        self.select(credentials, Table::Sensors, "*", "last_updated", &[])
            .await
    }

    async fn list_detections(
        &self,
        credentials: &Credentials,
    ) -> Result<Vec<DetectionRow>, Self::Error> {
        self.select(
            credentials,
            Table::Detections,
            DETECTION_SELECT,
            "timestamp",
            &[],
        )
        .await
    }

    async fn list_fogging_logs(
        &self,
        credentials: &Credentials,
    ) -> Result<Vec<FoggingLogRow>, Self::Error> {
        self.select(credentials, Table::FoggingLogs, "*", "date", &[])
            .await
    }

    async fn insert_fogging_log(
        &self,
        credentials: &Credentials,
        log: &NewFoggingLog,
    ) -> Result<(), Self::Error> {
        let body = json!([{
            "sensor_id": log.sensor_id,
            "date": log.date.to_string(),
            "notes": log.notes,
        }]);

        let response = self
            .request(Method::POST, self.rest_url(Table::FoggingLogs), credentials)
            .header("Prefer", "return=minimal")
            .json(&body)
            .send()
            .await?;
        check(response).await?;

        self.notify(Table::FoggingLogs, ChangeKind::Insert);
        Ok(())
    }

    async fn mark_sensor_fogged(
        &self,
        credentials: &Credentials,
        sensor_id: &SensorId,
        date: jiff::civil::Date,
    ) -> Result<(), Self::Error> {
        let body = json!({
            "mosquito_level": MosquitoLevel::Low,
            "last_fogged": date.to_string(),
        });

        let response = self
            .request(Method::PATCH, self.rest_url(Table::Sensors), credentials)
            .query(&[("id", format!("eq.{sensor_id}"))])
            .header("Prefer", "return=representation")
            .json(&body)
            .send()
            .await?;
        let updated: Vec<SensorRow> = check(response).await?.json().await?;

        if updated.is_empty() {
            return Err(RestError::SensorNotFound(sensor_id.clone()));
        }

        self.notify(Table::Sensors, ChangeKind::Update);
        Ok(())
    }

    async fn list_sessions(
        &self,
        credentials: &Credentials,
        filter: &SessionFilter,
    ) -> Result<Vec<UserSessionRow>, Self::Error> {
        let mut filters = Vec::new();
        if let Some(active) = filter.active {
            filters.push(("is_active", format!("eq.{active}")));
        }
        if let Some(email) = &filter.email {
            filters.push(("email", format!("ilike.*{}*", escape_like(email))));
        }
        if let Some(from) = filter.from {
            filters.push(("login_time", format!("gte.{from}")));
        }
        if let Some(to) = filter.to {
            filters.push(("login_time", format!("lte.{to}")));
        }

        self.select(credentials, Table::UserSessions, "*", "login_time", &filters)
            .await
    }

    async fn open_session(
        &self,
        credentials: &Credentials,
        user_id: &UserId,
        email: &str,
    ) -> Result<(), Self::Error> {
        let body = json!({
            "user_id": user_id,
            "email": email,
            "login_time": Timestamp::now().to_string(),
            "is_active": true,
        });

        let response = self
            .request(Method::POST, self.rest_url(Table::UserSessions), credentials)
            .header("Prefer", "return=minimal")
            .json(&body)
            .send()
            .await?;
        check(response).await?;

        self.notify(Table::UserSessions, ChangeKind::Insert);
        Ok(())
    }

    async fn close_session(
        &self,
        credentials: &Credentials,
        user_id: &UserId,
        logout_time: Timestamp,
    ) -> Result<bool, Self::Error> {
        #[derive(Deserialize)]
        struct SessionKey {
            id: String,
        }

        let response = self
            .request(Method::GET, self.rest_url(Table::UserSessions), credentials)
            .query(&[
                ("select", "id".to_owned()),
                ("user_id", format!("eq.{user_id}")),
                ("is_active", "eq.true".to_owned()),
                ("order", "login_time.desc".to_owned()),
                ("limit", "1".to_owned()),
            ])
            .send()
            .await?;
        let latest: Vec<SessionKey> = check(response).await?.json().await?;

        let Some(session) = latest.into_iter().next() else {
            return Ok(false);
        };

        let body = json!({
            "logout_time": logout_time.to_string(),
            "is_active": false,
        });
        let response = self
            .request(Method::PATCH, self.rest_url(Table::UserSessions), credentials)
            .query(&[("id", format!("eq.{}", session.id))])
            .header("Prefer", "return=minimal")
            .json(&body)
            .send()
            .await?;
        check(response).await?;

        debug!(session_id = %session.id, "closed login session");
        self.notify(Table::UserSessions, ChangeKind::Update);
        Ok(true)
    }

    fn subscribe(&self) -> broadcast::Receiver<TableChange> {
        self.changes.subscribe()
    }

    fn listen(
        &self,
        credentials: Arc<dyn CredentialSource>,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let listener = RealtimeListener::new(
            &self.base_url,
            &self.anon_key,
            REALTIME_TABLES.to_vec(),
            self.changes.clone(),
            credentials,
        );

        Some(listener.spawn(cancel))
    }
}


#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    expires_at: Option<i64>,
    user: UserResponse,
}

#[derive(Deserialize)]
struct UserResponse {
    id: String,
    email: Option<String>,
}

impl From<UserResponse> for AuthUser {
    fn from(user: UserResponse) -> Self {
        Self {
            id: UserId::from(user.id),
            email: user.email.unwrap_or_default().into(),
        }
    }
}

impl TokenResponse {
    fn into_session(self) -> AuthSession {
        let expires_at = match (self.expires_at, self.expires_in) {
            (Some(at), _) => Timestamp::from_second(at).ok(),
            (None, Some(seconds)) => Timestamp::now()
                .checked_add(SignedDuration::from_secs(seconds))
                .ok(),
            (None, None) => None,
        };

        AuthSession {
            access_token: self.access_token.into(),
            refresh_token: self.refresh_token.map(Into::into),
            expires_at,
            user: self.user.into(),
        }
    }
}

#[async_trait]
impl Authenticator for RestBackend {
    type Error = RestError;

    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, Self::Error> {
        let response = self
            .request(Method::POST, self.auth_url("/token"), &Credentials::anonymous())
            .query(&[("grant_type", "password")])
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;
        let token: TokenResponse = check(response).await?.json().await?;

        Ok(token.into_session())
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthUser, Self::Error> {
        let response = self
            .request(Method::POST, self.auth_url("/signup"), &Credentials::anonymous())
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;
        let mut body: Value = check(response).await?.json().await?;

        // With email confirmation enabled the user comes back bare, otherwise
        // wrapped in a session.
        let user = match body.get_mut("user") {
            Some(user) => user.take(),
            None => body,
        };
        let user: UserResponse =
            serde_json::from_value(user).map_err(|e| RestError::Decode(e.to_string()))?;

        Ok(user.into())
    }

    async fn sign_out(&self, session: &AuthSession) -> Result<(), Self::Error> {
        let response = self
            .request(Method::POST, self.auth_url("/logout"), &session.credentials())
            .send()
            .await?;
        check(response).await?;

        Ok(())
    }

    async fn refresh(&self, session: &AuthSession) -> Result<AuthSession, Self::Error> {
        let refresh_token = session
            .refresh_token
            .as_deref()
            .ok_or(RestError::MissingRefreshToken)?;

        let response = self
            .request(Method::POST, self.auth_url("/token"), &Credentials::anonymous())
            .query(&[("grant_type", "refresh_token")])
            .json(&json!({ "refresh_token": refresh_token }))
            .send()
            .await?;
        let token: TokenResponse = check(response).await?.json().await?;

        Ok(token.into_session())
    }
}
