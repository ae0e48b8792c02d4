//! The durable user store and its implementations.
//!
//! The read path only ever calls [`UserStore::fetch_by_id`]. A call is cancelled by dropping its
//! future, which both implementations tolerate at any await point.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{FetchError, NewUser, User, UserPatch};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// An error returned by a [`UserStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// No user with the requested id exists.
    #[error("user not found")]
    NotFound,
    /// A user with the same first and last name already exists.
    #[error("user already exists")]
    Conflict,
    #[error("database query failed")]
    Database(#[from] tokio_postgres::Error),
    #[error("failed to get a database connection")]
    Pool(#[from] deadpool_postgres::PoolError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The call did not complete within the request's time budget.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    /// The request that issued the call went away.
    #[error("store call canceled")]
    Canceled,
}

impl StoreError {
    /// Whether the call was abandoned, so it is unknown whether a write took effect.
    pub fn is_abandoned(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Canceled)
    }
}

impl From<StoreError> for FetchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => FetchError::NotFound,
            StoreError::Timeout(budget) => FetchError::Timeout(budget),
            StoreError::Canceled => FetchError::Canceled,
            err => {
                let message = match std::error::Error::source(&err) {
                    Some(source) => format!("{err}: {source}"),
                    None => err.to_string(),
                };
                FetchError::Store(message)
            }
        }
    }
}

/// Persistent storage of users.
#[async_trait]
pub trait UserStore: fmt::Debug + Send + Sync + 'static {
    /// Loads the user with the given id.
    ///
    /// An id that cannot belong to any user is reported as [`StoreError::NotFound`].
    async fn fetch_by_id(&self, id: &str) -> Result<User, StoreError>;

    /// Loads all users ordered by id.
    async fn list(&self) -> Result<Vec<User>, StoreError>;

    /// Inserts a new user and returns it with its assigned id.
    async fn create(&self, user: &NewUser) -> Result<User, StoreError>;

    /// Applies `patch` to an existing user and returns the updated user.
    async fn update_by_id(&self, id: &str, patch: &UserPatch) -> Result<User, StoreError>;

    /// Removes a user.
    async fn delete_by_id(&self, id: &str) -> Result<(), StoreError>;

    /// Checks that the store can serve requests.
    async fn ping(&self) -> Result<(), StoreError>;
}

pub type StoreRef = Arc<dyn UserStore>;

/// Parses a user id as assigned by the stores.
///
/// Ids are positive integers rendered as strings.
pub fn parse_id(id: &str) -> Option<i64> {
    id.parse::<i64>().ok().filter(|id| *id > 0)
}
