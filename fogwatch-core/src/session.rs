//! Client-side derivations over login sessions.

use std::fmt;

use jiff::Timestamp;
use serde::{Serialize, Serializer};

use crate::UserSession;

/// How long a session lasted, or has lasted so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDuration {
    /// Session still open; seconds since login.
    Active { seconds: i64 },
    /// Session closed; seconds between login and logout.
    Ended { seconds: i64 },
    /// Closed without a logout time. Renders as an empty string.
    Unknown,
}

impl SessionDuration {
    pub fn of(session: &UserSession, now: Timestamp) -> Self {
        if session.is_active {
            return Self::Active {
                seconds: elapsed(session.login_time, now),
            };
        }

        match session.logout_time {
            Some(logout) => Self::Ended {
                seconds: elapsed(session.login_time, logout),
            },
            None => Self::Unknown,
        }
    }
}

fn elapsed(from: Timestamp, to: Timestamp) -> i64 {
    (to.as_second() - from.as_second()).max(0)
}

fn hours_minutes(seconds: i64) -> (i64, i64) {
    let minutes = seconds / 60;
    (minutes / 60, minutes % 60)
}

impl fmt::Display for SessionDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Active { seconds } => {
                let (hours, minutes) = hours_minutes(seconds);
                write!(f, "Active ({hours}h {minutes}m)")
            }
            Self::Ended { seconds } => {
                let (hours, minutes) = hours_minutes(seconds);
                write!(f, "{hours}h {minutes}m")
            }
            Self::Unknown => Ok(()),
        }
    }
}

impl Serialize for SessionDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A session paired with its derived duration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub session: UserSession,
    pub duration: SessionDuration,
}

impl SessionView {
    pub fn new(session: UserSession, now: Timestamp) -> Self {
        let duration = SessionDuration::of(&session, now);
        Self { session, duration }
    }
}
