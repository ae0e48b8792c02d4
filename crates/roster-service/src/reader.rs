//! Lookups of users by id.
//!
//! A lookup first consults the [`TtlCache`]. How a miss is resolved depends on the configured
//! [`ReadPolicy`]:
//!
//! - With [`ReadPolicy::Dedupe`], concurrent lookups of the same id are coalesced through the
//!   [`InflightRegistry`]. The first caller spawns the store read and everyone else waits for
//!   its outcome. The read is bound to the first caller's deadline but not to its cancellation,
//!   so the others are still served if that client goes away.
//! - With [`ReadPolicy::Race`], every lookup spawns a cache attempt and a store read side by
//!   side and takes whichever succeeds first. The other one is cancelled.
//!
//! Either way a user read from the store is written to the cache before it is returned.

use std::sync::Arc;

use sentry::{Hub, SentryFutureExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cache::TtlCache;
use crate::config::{ReadPolicy, Reads};
use crate::deadline::Deadline;
use crate::inflight::{InflightRegistry, Leader, Role};
use crate::store::{StoreError, StoreRef};
use crate::types::{FetchError, Fetched, Source, User};
use crate::utils::futures::{m, measure};

/// The result of one side of a race.
#[derive(Debug)]
enum Attempt {
    Found(User),
    /// The cache had nothing. This only means the store has to decide.
    Missed,
    Failed(FetchError),
}

/// Serves lookups of single users.
#[derive(Clone, Debug)]
pub struct UserReader {
    cache: Arc<TtlCache>,
    inflight: InflightRegistry,
    store: StoreRef,
    config: Reads,
}

impl UserReader {
    pub fn new(
        cache: Arc<TtlCache>,
        inflight: InflightRegistry,
        store: StoreRef,
        config: Reads,
    ) -> Self {
        Self {
            cache,
            inflight,
            store,
            config,
        }
    }

    /// Creates the scope of a lookup on behalf of a request that is cancelled with `parent`.
    pub fn deadline(&self, parent: &CancellationToken) -> Deadline {
        Deadline::new(parent, self.config.timeout)
    }

    /// Looks up the user with the given id within `deadline`.
    #[tracing::instrument(skip_all, fields(user_id = %id))]
    pub async fn get(&self, id: &str, deadline: &Deadline) -> Result<Fetched, FetchError> {
        let result = match self.config.policy {
            ReadPolicy::Dedupe => self.get_deduplicated(id, deadline).await,
            ReadPolicy::Race => self.get_raced(id, deadline).await,
        };

        match &result {
            Ok(fetched) => {
                metric!(counter("users.fetch") += 1, "source" => fetched.source.as_str());
            }
            Err(err) => {
                metric!(
                    counter("users.fetch") += 1,
                    "source" => "none",
                    "error" => error_kind(err),
                );
            }
        }
        result
    }

    async fn get_deduplicated(
        &self,
        id: &str,
        deadline: &Deadline,
    ) -> Result<Fetched, FetchError> {
        if let Some(user) = self.cache.get(id) {
            return Ok(Fetched {
                user,
                source: Source::Cache,
            });
        }

        match self.inflight.join_or_lead(id) {
            Role::Follower(subscription) => {
                let user = deadline.run(subscription.recv()).await??;
                Ok(Fetched {
                    user,
                    source: Source::Shared,
                })
            }
            Role::Leader(leader) => {
                // The previous read of this id may have completed between the cache check and
                // taking the lead.
                if let Some(user) = self.cache.get(id) {
                    leader.publish(Ok(user.clone()));
                    return Ok(Fetched {
                        user,
                        source: Source::Cache,
                    });
                }

                let subscription = leader.subscribe();
                self.spawn_store_read(id, leader, deadline.detached());

                let user = deadline.run(subscription.recv()).await??;
                Ok(Fetched {
                    user,
                    source: Source::Db,
                })
            }
        }
    }

    /// Reads `id` from the store in the background and publishes the outcome through `leader`.
    fn spawn_store_read(&self, id: &str, leader: Leader, deadline: Deadline) {
        let store = Arc::clone(&self.store);
        let cache = Arc::clone(&self.cache);
        let ttl = self.config.cache_ttl;
        let reservation = cache.reserve(id);
        let id = id.to_owned();

        let read = async move {
            let read = async {
                match deadline.run(store.fetch_by_id(&id)).await {
                    Ok(Ok(user)) => Ok(user),
                    Ok(Err(err)) => Err(store_failure(&id, err)),
                    Err(err) => Err(err),
                }
            };
            let outcome = measure("users.store_read", m::result, read).await;

            if let Ok(user) = &outcome {
                // A write that committed during the read detached it, invalidated the
                // reservation, or both.
                if leader.is_stale() || !cache.put_reserved(reservation, user.clone(), ttl) {
                    tracing::debug!(user_id = %id, "not caching user changed during read");
                }
            }
            leader.publish(outcome);
        };

        tokio::spawn(read.bind_hub(Hub::new_from_top(Hub::current())));
    }

    async fn get_raced(&self, id: &str, deadline: &Deadline) -> Result<Fetched, FetchError> {
        let race = deadline.child();
        // Cancels whichever attempt is still running once this returns.
        let _race_guard = race.token().clone().drop_guard();
        let mut reservation = Some(self.cache.reserve(id));
        let (tx, mut rx) = mpsc::channel(2);

        let cache_attempt = {
            let cache = Arc::clone(&self.cache);
            let latency = self.config.race_cache_latency;
            let id = id.to_owned();
            async move {
                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }
                match cache.get(&id) {
                    Some(user) => Attempt::Found(user),
                    None => Attempt::Missed,
                }
            }
        };
        spawn_attempt(Source::Cache, cache_attempt, race.clone(), tx.clone());

        let store_attempt = {
            let store = Arc::clone(&self.store);
            let id = id.to_owned();
            async move {
                match store.fetch_by_id(&id).await {
                    Ok(user) => Attempt::Found(user),
                    Err(err) => Attempt::Failed(store_failure(&id, err)),
                }
            }
        };
        spawn_attempt(Source::Db, store_attempt, race, tx);

        let mut failure = None;
        loop {
            tokio::select! {
                biased;
                received = rx.recv() => match received {
                    Some((source, Attempt::Found(user))) => {
                        if let (Source::Db, Some(reservation)) = (source, reservation.take()) {
                            let ttl = self.config.cache_ttl;
                            if !self.cache.put_reserved(reservation, user.clone(), ttl) {
                                tracing::debug!(
                                    user_id = %id,
                                    "not caching user changed during read"
                                );
                            }
                        }
                        metric!(counter("users.race.won") += 1, "source" => source.as_str());
                        return Ok(Fetched { user, source });
                    }
                    Some((_, Attempt::Missed)) => {}
                    Some((_, Attempt::Failed(err))) => failure = Some(err),
                    None => {
                        return Err(failure.unwrap_or_else(|| {
                            FetchError::Store("race ended without a result".into())
                        }));
                    }
                },
                err = deadline.expired() => return Err(err),
            }
        }
    }
}

/// Runs one side of a race and reports its result, unless the race is over by then.
fn spawn_attempt<F>(
    source: Source,
    attempt: F,
    race: Deadline,
    tx: mpsc::Sender<(Source, Attempt)>,
) where
    F: Future<Output = Attempt> + Send + 'static,
{
    let attempt = async move {
        if let Ok(attempt) = race.run(attempt).await {
            // The receiver is gone once the race has been decided.
            let _ = tx.send((source, attempt)).await;
        }
    };
    tokio::spawn(attempt.bind_hub(Hub::new_from_top(Hub::current())));
}

/// Converts a store error for the read path, logging everything but a missing user.
fn store_failure(id: &str, err: StoreError) -> FetchError {
    if !matches!(err, StoreError::NotFound) {
        tracing::error!(
            error = &err as &dyn std::error::Error,
            user_id = %id,
            "failed to read user from store"
        );
    }
    err.into()
}

fn error_kind(err: &FetchError) -> &'static str {
    match err {
        FetchError::NotFound => "not_found",
        FetchError::Timeout(_) => "timeout",
        FetchError::Canceled => "canceled",
        FetchError::Store(_) => "store",
    }
}
