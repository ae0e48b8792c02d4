//! Provides the internal shared roster services and a way to initialize them.
//!
//! [`SharedServices`] wires the store, the cache and the in-flight registry into a
//! [`UserReader`] and a [`UserWriter`] according to the provided [`Config`]. Both share the
//! same cache and registry, which is what keeps reads consistent with writes.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::cache::TtlCache;
use crate::config::Config;
use crate::inflight::InflightRegistry;
use crate::reader::UserReader;
use crate::store::{MemoryStore, PostgresStore, StoreRef};
use crate::writer::UserWriter;

#[derive(Debug)]
pub struct SharedServices {
    pub config: Config,
    pub cache: Arc<TtlCache>,
    pub inflight: InflightRegistry,
    pub reader: UserReader,
    pub writer: UserWriter,
    postgres: Option<PostgresStore>,
}

impl SharedServices {
    /// Creates the services, backed by PostgreSQL if a database URL is configured.
    pub fn new(config: Config) -> Result<Self> {
        match config.database.url.clone() {
            Some(url) => {
                let postgres = PostgresStore::connect(&url, &config.database)
                    .context("failed to set up the database pool")?;
                let store: StoreRef = Arc::new(postgres.clone());
                let mut services = Self::with_store(config, store);
                services.postgres = Some(postgres);
                Ok(services)
            }
            None => {
                tracing::warn!("no database configured, users are kept in memory");
                Ok(Self::with_store(config, Arc::new(MemoryStore::new())))
            }
        }
    }

    /// Creates the services on top of an existing store.
    pub fn with_store(config: Config, store: StoreRef) -> Self {
        let cache = Arc::new(TtlCache::new());
        let inflight = InflightRegistry::new();

        let reader = UserReader::new(
            Arc::clone(&cache),
            inflight.clone(),
            Arc::clone(&store),
            config.reads,
        );
        let writer = UserWriter::new(Arc::clone(&cache), inflight.clone(), store, config.writes);

        Self {
            config,
            cache,
            inflight,
            reader,
            writer,
            postgres: None,
        }
    }

    /// Creates the database schema if needed.
    ///
    /// This is a no-op for the in-memory store.
    pub async fn bootstrap_schema(&self) -> Result<()> {
        if let Some(postgres) = &self.postgres {
            postgres
                .bootstrap_schema()
                .await
                .context("failed to create the users table")?;
        }
        Ok(())
    }
}
