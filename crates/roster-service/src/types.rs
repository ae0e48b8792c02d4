//! Types shared between the store, the read path and the HTTP endpoints.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A user as persisted in the store.
///
/// The `id` is assigned by the store on creation. Only the names can change afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub created_at: DateTime<Utc>,
}

/// Payload for creating a new user.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NewUser {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

impl NewUser {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.first_name.is_empty() || self.last_name.is_empty() {
            return Err(ValidationError::MissingNames);
        }
        Ok(())
    }
}

/// A partial update of a user.
///
/// Fields that are `None` keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserPatch {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl UserPatch {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.first_name.is_none() && self.last_name.is_none() {
            return Err(ValidationError::EmptyPatch);
        }
        if self.first_name.as_deref() == Some("") {
            return Err(ValidationError::EmptyField("firstName"));
        }
        if self.last_name.as_deref() == Some("") {
            return Err(ValidationError::EmptyField("lastName"));
        }
        Ok(())
    }
}

/// A rejected create or update payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("firstName and lastName are required")]
    MissingNames,
    #[error("no fields to update")]
    EmptyPatch,
    #[error("{0} cannot be empty")]
    EmptyField(&'static str),
}

/// Which path of the read coordinator produced a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Served from the in-process cache.
    Cache,
    /// Served by joining a fetch that another request was already running.
    Shared,
    /// Served by a store read issued on behalf of this request.
    Db,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Cache => "cache",
            Source::Shared => "shared",
            Source::Db => "db",
        }
    }
}

impl AsRef<str> for Source {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user together with the provenance of the lookup that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub user: User,
    pub source: Source,
}

/// The terminal failure of a read.
///
/// This is cloned to every follower of a shared fetch, so it only carries owned, cheap data.
/// A cache miss is not part of this: it is recovered from inside the reader.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The store has no user with this id.
    #[error("user not found")]
    NotFound,
    /// The read did not complete within its time budget.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The request that issued the read went away.
    #[error("request canceled")]
    Canceled,
    /// Any other store failure. The message is for logs only.
    #[error("store failure: {0}")]
    Store(String),
}

impl FetchError {
    /// Whether this failure is caused by the request's own deadline or cancellation.
    pub fn is_deadline(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Canceled)
    }
}
