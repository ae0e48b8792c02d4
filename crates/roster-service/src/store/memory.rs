use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::{StoreError, UserStore, parse_id};
use crate::types::{NewUser, User, UserPatch};

#[derive(Debug, Default)]
struct Table {
    next_id: i64,
    rows: BTreeMap<i64, User>,
}

impl Table {
    fn has_name(&self, first_name: &str, last_name: &str) -> bool {
        self.rows
            .values()
            .any(|user| user.first_name == first_name && user.last_name == last_name)
    }

    fn insert(&mut self, first_name: &str, last_name: &str) -> User {
        self.next_id += 1;
        let user = User {
            id: self.next_id.to_string(),
            first_name: first_name.to_owned(),
            last_name: last_name.to_owned(),
            created_at: Utc::now(),
        };
        self.rows.insert(self.next_id, user.clone());
        user
    }
}

/// A [`UserStore`] that keeps users in process memory.
///
/// Used when no database is configured. Every call can be slowed down by a fixed latency and
/// made to fail, which lets tests shape the timing of the read path.
#[derive(Debug, Default)]
pub struct MemoryStore {
    table: Mutex<Table>,
    latency: Mutex<Duration>,
    failure: Mutex<Option<String>>,
    reads: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store whose calls each take `latency` before touching the data.
    pub fn with_latency(latency: Duration) -> Self {
        let store = Self::new();
        store.set_latency(latency);
        store
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Makes every following call fail with `message`, or succeed again with `None`.
    pub fn set_failure(&self, message: Option<&str>) {
        *self.failure.lock() = message.map(ToOwned::to_owned);
    }

    /// The number of [`fetch_by_id`](UserStore::fetch_by_id) calls that reached the data.
    ///
    /// Calls that were dropped while waiting out the latency are not counted.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Inserts a user without latency or failure injection.
    pub fn insert(&self, first_name: &str, last_name: &str) -> User {
        self.table.lock().insert(first_name, last_name)
    }

    async fn roundtrip(&self) -> Result<(), StoreError> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match &*self.failure.lock() {
            Some(message) => Err(StoreError::Unavailable(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn fetch_by_id(&self, id: &str) -> Result<User, StoreError> {
        self.roundtrip().await?;
        self.reads.fetch_add(1, Ordering::SeqCst);

        let id = parse_id(id).ok_or(StoreError::NotFound)?;
        self.table
            .lock()
            .rows
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list(&self) -> Result<Vec<User>, StoreError> {
        self.roundtrip().await?;
        Ok(self.table.lock().rows.values().cloned().collect())
    }

    async fn create(&self, user: &NewUser) -> Result<User, StoreError> {
        self.roundtrip().await?;

        let mut table = self.table.lock();
        if table.has_name(&user.first_name, &user.last_name) {
            return Err(StoreError::Conflict);
        }
        Ok(table.insert(&user.first_name, &user.last_name))
    }

    async fn update_by_id(&self, id: &str, patch: &UserPatch) -> Result<User, StoreError> {
        self.roundtrip().await?;

        let id = parse_id(id).ok_or(StoreError::NotFound)?;
        let mut table = self.table.lock();
        let current = table.rows.get(&id).ok_or(StoreError::NotFound)?;

        let mut updated = current.clone();
        if let Some(first_name) = &patch.first_name {
            updated.first_name = first_name.clone();
        }
        if let Some(last_name) = &patch.last_name {
            updated.last_name = last_name.clone();
        }

        let conflict = table.rows.values().any(|other| {
            other.id != updated.id
                && other.first_name == updated.first_name
                && other.last_name == updated.last_name
        });
        if conflict {
            return Err(StoreError::Conflict);
        }

        table.rows.insert(id, updated.clone());
        Ok(updated)
    }

    async fn delete_by_id(&self, id: &str) -> Result<(), StoreError> {
        self.roundtrip().await?;

        let id = parse_id(id).ok_or(StoreError::NotFound)?;
        match self.table.lock().rows.remove(&id) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.roundtrip().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn new_user(first_name: &str, last_name: &str) -> NewUser {
        NewUser {
            first_name: first_name.into(),
            last_name: last_name.into(),
        }
    }

    #[tokio::test]
    async fn test_create_assigns_sequential_ids() {
        let store = MemoryStore::new();
        let ada = store.create(&new_user("Ada", "Lovelace")).await.unwrap();
        let alan = store.create(&new_user("Alan", "Turing")).await.unwrap();

        assert_eq!(ada.id, "1");
        assert_eq!(alan.id, "2");

        let names: Vec<_> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|user| user.first_name)
            .collect();
        assert_eq!(names, ["Ada", "Alan"]);
    }

    #[tokio::test]
    async fn test_duplicate_names_conflict() {
        let store = MemoryStore::new();
        store.create(&new_user("Ada", "Lovelace")).await.unwrap();
        let result = store.create(&new_user("Ada", "Lovelace")).await;
        assert!(matches!(result, Err(StoreError::Conflict)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicate_creates() {
        let store = Arc::new(MemoryStore::new());

        let creates = (0..16).map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.create(&new_user("Ada", "Lovelace")).await })
        });
        let results: Vec<_> = futures::future::join_all(creates)
            .await
            .into_iter()
            .map(|result| result.unwrap())
            .collect();

        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|result| result.as_ref().err())
            .all(|err| matches!(err, StoreError::Conflict)));
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_keeps_unset_fields() {
        let store = MemoryStore::new();
        let ada = store.insert("Ada", "Lovelace");

        let patch = UserPatch {
            first_name: Some("Augusta".into()),
            last_name: None,
        };
        let updated = store.update_by_id(&ada.id, &patch).await.unwrap();
        assert_eq!(updated.first_name, "Augusta");
        assert_eq!(updated.last_name, "Lovelace");
        assert_eq!(updated.created_at, ada.created_at);
    }

    #[tokio::test]
    async fn test_missing_users() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.fetch_by_id("7").await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store.fetch_by_id("not-a-number").await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store.delete_by_id("7").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryStore::new();
        let ada = store.insert("Ada", "Lovelace");
        store.delete_by_id(&ada.id).await.unwrap();
        assert!(matches!(
            store.fetch_by_id(&ada.id).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_and_failure_injection() {
        let store = MemoryStore::with_latency(Duration::from_millis(100));
        let ada = store.insert("Ada", "Lovelace");

        let started = tokio::time::Instant::now();
        store.fetch_by_id(&ada.id).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(100));
        assert_eq!(store.reads(), 1);

        store.set_failure(Some("connection reset"));
        assert!(matches!(
            store.ping().await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.fetch_by_id(&ada.id).await.is_err());
        assert_eq!(store.reads(), 1);
    }
}
