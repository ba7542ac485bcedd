//! Authentication and login-session bookkeeping.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use fogwatch_core::UserId;
use jiff::{SignedDuration, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::backend::Backend;

const AUTH_EVENT_CAPACITY: usize = 16;

/// Access tokens this close to expiry are refreshed before use.
const REFRESH_MARGIN: SignedDuration = SignedDuration::from_secs(60);

/// Bearer credentials attached to every backend request.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    access_token: Option<Box<str>>,
}

impl Credentials {
    /// Requests made with only the public project key.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn bearer(token: impl Into<Box<str>>) -> Self {
        Self {
            access_token: Some(token.into()),
        }
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.access_token {
            Some(_) => "bearer",
            None => "anonymous",
        };
        f.debug_tuple("Credentials").field(&kind).finish()
    }
}

impl From<&AuthSession> for Credentials {
    fn from(session: &AuthSession) -> Self {
        Self::bearer(session.access_token.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: UserId,
    pub email: Box<str>,
}

/// The result of a successful sign-in.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub access_token: Box<str>,
    pub refresh_token: Option<Box<str>>,
    pub expires_at: Option<Timestamp>,
    pub user: AuthUser,
}

impl AuthSession {
    pub fn credentials(&self) -> Credentials {
        Credentials::from(self)
    }

    /// Whether the access token expires within [`REFRESH_MARGIN`] of `now`.
    /// Sessions without an expiry never do.
    pub fn expires_soon(&self, now: Timestamp) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at.duration_since(now) <= REFRESH_MARGIN)
    }
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("user", &self.user)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Email/password authentication.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, Self::Error>;

    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthUser, Self::Error>;

    async fn sign_out(&self, session: &AuthSession) -> Result<(), Self::Error>;

    /// Exchanges the session's refresh token for a new session.
    async fn refresh(&self, session: &AuthSession) -> Result<AuthSession, Self::Error>;
}

/// Supplies the credentials for the next backend request.
#[async_trait]
pub trait CredentialSource: Send + Sync + 'static {
    async fn credentials(&self) -> Credentials;
}

#[async_trait]
impl CredentialSource for Credentials {
    async fn credentials(&self) -> Credentials {
        self.clone()
    }
}

#[async_trait]
impl<C: CredentialSource + ?Sized> CredentialSource for Arc<C> {
    async fn credentials(&self) -> Credentials {
        (**self).credentials().await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LocalAuthError {
    #[error("invalid login credentials")]
    InvalidCredentials,
    #[error("user {0} is already registered")]
    AlreadyRegistered(String),
    #[error("{0} must not be empty")]
    MissingField(&'static str),
    #[error("session has no refresh token")]
    MissingRefreshToken,
}

struct LocalUser {
    id: UserId,
    email: Box<str>,
    password: Box<str>,
}

/// Authenticator over a fixed set of configured users, for local setups
/// without a hosted auth service. Passwords are compared in plain text.
#[derive(Clone, Default)]
pub struct LocalAuthenticator {
    users: Arc<RwLock<HashMap<String, LocalUser>>>,
    token_lifetime: Option<SignedDuration>,
}

impl LocalAuthenticator {
    pub fn new<I, E, P>(users: I) -> Self
    where
        I: IntoIterator<Item = (E, P)>,
        E: AsRef<str>,
        P: AsRef<str>,
    {
        let users = users
            .into_iter()
            .map(|(email, password)| {
                let email = email.as_ref();
                (email.to_lowercase(), local_user(email, password.as_ref()))
            })
            .collect();

        Self {
            users: Arc::new(RwLock::new(users)),
            token_lifetime: None,
        }
    }

    /// Issues sessions that expire after `lifetime` and must be refreshed.
    /// Without it local sessions never expire.
    pub fn with_token_lifetime(mut self, lifetime: SignedDuration) -> Self {
        self.token_lifetime = Some(lifetime);
        self
    }

    fn issue(&self, user: &LocalUser) -> AuthSession {
        let now = Timestamp::now();

        AuthSession {
            access_token: Ulid::new().to_string().into(),
            refresh_token: self
                .token_lifetime
                .map(|_| Ulid::new().to_string().into()),
            expires_at: self
                .token_lifetime
                .and_then(|lifetime| now.checked_add(lifetime).ok()),
            user: AuthUser {
                id: user.id.clone(),
                email: user.email.clone(),
            },
        }
    }
}

fn local_user(email: &str, password: &str) -> LocalUser {
    // Derived from the email so that session history survives restarts.
    LocalUser {
        id: UserId::from(format!("local:{}", email.to_lowercase())),
        email: email.into(),
        password: password.into(),
    }
}

#[async_trait]
impl Authenticator for LocalAuthenticator {
    type Error = LocalAuthError;

    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, Self::Error> {
        let users = self.users.read().await;
        let user = users
            .get(&email.to_lowercase())
            .filter(|user| &*user.password == password)
            .ok_or(LocalAuthError::InvalidCredentials)?;

        Ok(self.issue(user))
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthUser, Self::Error> {
        let email = email.trim();
        if email.is_empty() {
            return Err(LocalAuthError::MissingField("email"));
        }
        if password.is_empty() {
            return Err(LocalAuthError::MissingField("password"));
        }

        let mut users = self.users.write().await;
        let key = email.to_lowercase();
        if users.contains_key(&key) {
            return Err(LocalAuthError::AlreadyRegistered(email.to_owned()));
        }

        let user = local_user(email, password);
        let auth_user = AuthUser {
            id: user.id.clone(),
            email: user.email.clone(),
        };
        users.insert(key, user);

        Ok(auth_user)
    }

    async fn sign_out(&self, _session: &AuthSession) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn refresh(&self, session: &AuthSession) -> Result<AuthSession, Self::Error> {
        if session.refresh_token.is_none() {
            return Err(LocalAuthError::MissingRefreshToken);
        }

        let users = self.users.read().await;
        let user = users
            .get(&session.user.email.to_lowercase())
            .ok_or(LocalAuthError::InvalidCredentials)?;

        Ok(self.issue(user))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError<E: std::error::Error + 'static> {
    #[error(transparent)]
    Auth(E),
    #[error("no user is signed in")]
    NotSignedIn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn(AuthUser),
    SignedOut(AuthUser),
}

/// Tracks the signed-in user and mirrors sign-in/sign-out into the
/// `user_sessions` table.
///
/// Recording is best effort: a failure to open or close the session record
/// is logged and never fails the authentication call itself. A process that
/// exits without signing out leaves its session active.
pub struct SessionTracker<A, B> {
    auth: Arc<A>,
    backend: Arc<B>,
    current: Arc<RwLock<Option<AuthSession>>>,
    events: broadcast::Sender<AuthEvent>,
}

impl<A, B> Clone for SessionTracker<A, B> {
    fn clone(&self) -> Self {
        Self {
            auth: Arc::clone(&self.auth),
            backend: Arc::clone(&self.backend),
            current: Arc::clone(&self.current),
            events: self.events.clone(),
        }
    }
}

impl<A, B> SessionTracker<A, B>
where
    A: Authenticator,
    B: Backend,
{
    pub fn new(auth: Arc<A>, backend: Arc<B>) -> Self {
        let (events, _) = broadcast::channel(AUTH_EVENT_CAPACITY);

        Self {
            auth,
            backend,
            current: Arc::new(RwLock::new(None)),
            events,
        }
    }

    pub async fn sign_in(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, AuthError<A::Error>> {
        let session = self
            .auth
            .sign_in(email, password)
            .await
            .map_err(AuthError::Auth)?;
        let user = &session.user;

        if let Err(e) = self
            .backend
            .open_session(&session.credentials(), &user.id, &user.email)
            .await
        {
            warn!(user_id = %user.id, error = %e, "failed to record login session");
        }

        *self.current.write().await = Some(session.clone());
        info!(user_id = %user.id, email = %user.email, "signed in");
        let _ = self.events.send(AuthEvent::SignedIn(user.clone()));

        Ok(session)
    }

    pub async fn sign_up(&self, email: &str, password: &str) -> Result<AuthUser, AuthError<A::Error>> {
        let user = self
            .auth
            .sign_up(email, password)
            .await
            .map_err(AuthError::Auth)?;
        info!(user_id = %user.id, email = %user.email, "registered user");

        Ok(user)
    }

    /// Closes the user's most recent active session record, then signs out.
    pub async fn sign_out(&self) -> Result<(), AuthError<A::Error>> {
        let session = self
            .current
            .write()
            .await
            .take()
            .ok_or(AuthError::NotSignedIn)?;
        let user = &session.user;

        match self
            .backend
            .close_session(&session.credentials(), &user.id, Timestamp::now())
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(user_id = %user.id, "no active login session to close"),
            Err(e) => warn!(user_id = %user.id, error = %e, "failed to close login session"),
        }

        let result = self.auth.sign_out(&session).await.map_err(AuthError::Auth);
        info!(user_id = %user.id, "signed out");
        let _ = self.events.send(AuthEvent::SignedOut(user.clone()));

        result
    }

    pub async fn current(&self) -> Option<AuthSession> {
        self.current.read().await.clone()
    }

    /// Exchanges the current session for a fresh one.
    pub async fn refresh(&self) -> Result<AuthSession, AuthError<A::Error>> {
        let mut current = self.current.write().await;
        let session = current.as_mut().ok_or(AuthError::NotSignedIn)?;

        let fresh = self.auth.refresh(session).await.map_err(AuthError::Auth)?;
        debug!(user_id = %fresh.user.id, expires_at = ?fresh.expires_at, "refreshed access token");
        *session = fresh.clone();

        Ok(fresh)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}

/// Credentials of the signed-in user, refreshed first when the access token
/// is about to expire, or anonymous ones. A failed refresh is logged and the
/// old token is handed out; the backend then reports the expiry.
#[async_trait]
impl<A, B> CredentialSource for SessionTracker<A, B>
where
    A: Authenticator,
    B: Backend,
{
    async fn credentials(&self) -> Credentials {
        let now = Timestamp::now();
        {
            let current = self.current.read().await;
            match current.as_ref() {
                None => return Credentials::anonymous(),
                Some(session) if !session.expires_soon(now) => return session.credentials(),
                Some(_) => {}
            }
        }

        let mut current = self.current.write().await;
        let Some(session) = current.as_mut() else {
            return Credentials::anonymous();
        };
        // Another caller may have refreshed while this one waited.
        if session.expires_soon(now) {
            match self.auth.refresh(session).await {
                Ok(fresh) => {
                    debug!(user_id = %fresh.user.id, expires_at = ?fresh.expires_at, "refreshed access token");
                    *session = fresh;
                }
                Err(e) => warn!(user_id = %session.user.id, error = %e, "failed to refresh access token"),
            }
        }

        session.credentials()
    }
}
