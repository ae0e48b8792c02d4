//! Changes to users, and keeping the read path consistent with them.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cache::TtlCache;
use crate::config::Writes;
use crate::deadline::Deadline;
use crate::inflight::InflightRegistry;
use crate::store::{StoreError, StoreRef};
use crate::types::{FetchError, NewUser, User, UserPatch};

/// Performs writes against the store.
///
/// Once an update or delete has been committed, the cached user is removed and a read that is
/// still running for it is detached, so no lookup afterwards sees the previous state. A write
/// that fails leaves the cache alone, unless it was abandoned halfway and may have committed.
#[derive(Clone, Debug)]
pub struct UserWriter {
    cache: Arc<TtlCache>,
    inflight: InflightRegistry,
    store: StoreRef,
    config: Writes,
}

impl UserWriter {
    pub fn new(
        cache: Arc<TtlCache>,
        inflight: InflightRegistry,
        store: StoreRef,
        config: Writes,
    ) -> Self {
        Self {
            cache,
            inflight,
            store,
            config,
        }
    }

    /// Creates the scope of a store call on behalf of a request that is cancelled with `parent`.
    pub fn deadline(&self, parent: &CancellationToken) -> Deadline {
        Deadline::new(parent, self.config.timeout)
    }

    pub async fn list(&self, deadline: &Deadline) -> Result<Vec<User>, StoreError> {
        bounded(deadline, self.store.list()).await
    }

    pub async fn create(&self, user: &NewUser, deadline: &Deadline) -> Result<User, StoreError> {
        let user = bounded(deadline, self.store.create(user)).await?;
        tracing::debug!(user_id = %user.id, "created user");
        Ok(user)
    }

    pub async fn update(
        &self,
        id: &str,
        patch: &UserPatch,
        deadline: &Deadline,
    ) -> Result<User, StoreError> {
        let result = bounded(deadline, self.store.update_by_id(id, patch)).await;
        self.invalidate_after(id, &result);
        result
    }

    pub async fn delete(&self, id: &str, deadline: &Deadline) -> Result<(), StoreError> {
        let result = bounded(deadline, self.store.delete_by_id(id)).await;
        self.invalidate_after(id, &result);
        result
    }

    pub async fn ping(&self, deadline: &Deadline) -> Result<(), StoreError> {
        bounded(deadline, self.store.ping()).await
    }

    fn invalidate_after<T>(&self, id: &str, result: &Result<T, StoreError>) {
        match result {
            Ok(_) => {}
            Err(err) if err.is_abandoned() => {
                tracing::debug!(user_id = %id, "invalidating after abandoned write");
            }
            Err(_) => return,
        }

        self.cache.invalidate(id);
        self.inflight.detach(id);
        metric!(counter("users.invalidated") += 1);
    }
}

/// Runs a store call within `deadline`.
async fn bounded<T, F>(deadline: &Deadline, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match deadline.run(call).await {
        Ok(result) => result,
        Err(FetchError::Timeout(budget)) => Err(StoreError::Timeout(budget)),
        Err(_) => Err(StoreError::Canceled),
    }
}
