//! Provides the [`RequestService`] that the HTTP endpoints are served from.
//!
//! The service is a cheap handle to the process-wide [`SharedServices`]. Every request clones
//! it, so all requests share the same cache and the same in-flight registry.

use std::sync::Arc;

use anyhow::Result;
use roster_service::config::Config;
use roster_service::reader::UserReader;
use roster_service::services::SharedServices;
use roster_service::writer::UserWriter;

#[derive(Clone, Debug)]
pub struct RequestService {
    inner: Arc<SharedServices>,
}

impl RequestService {
    /// Creates a new [`RequestService`] and bootstraps the database schema if needed.
    pub async fn create(config: Config) -> Result<Self> {
        let services = SharedServices::new(config)?;
        services.bootstrap_schema().await?;
        Ok(Self::from_services(services))
    }

    pub fn from_services(services: SharedServices) -> Self {
        Self {
            inner: Arc::new(services),
        }
    }

    pub fn reader(&self) -> &UserReader {
        &self.inner.reader
    }

    pub fn writer(&self) -> &UserWriter {
        &self.inner.writer
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}
