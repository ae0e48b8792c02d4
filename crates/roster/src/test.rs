//! Helpers for testing the web server.
//!
//! Next to the helpers of the `roster-test` crate, this spins up the full application on top of
//! an in-memory store, so tests can seed users and inject latency or failures.

use std::sync::Arc;

use roster_service::config::Config;
use roster_service::services::SharedServices;
use roster_service::store::MemoryStore;

use crate::endpoints;
use crate::service::RequestService;

pub use roster_test::*;

/// Creates a [`RequestService`] backed by the given in-memory store.
pub(crate) fn service_with_store(config: Config, store: Arc<MemoryStore>) -> RequestService {
    RequestService::from_services(SharedServices::with_store(config, store))
}

/// Serves the full application on top of the given in-memory store.
pub(crate) fn server_with_store(config: Config, store: Arc<MemoryStore>) -> Server {
    Server::with_router(endpoints::create_app(service_with_store(config, store)))
}

/// Serves the full application with the default config and an empty in-memory store.
pub(crate) fn server_with_default_service() -> (Server, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let server = server_with_store(Config::default(), Arc::clone(&store));
    (server, store)
}
