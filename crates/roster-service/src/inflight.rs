//! Bookkeeping of running store reads, so that concurrent lookups of one id share a single read.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::types::{FetchError, User};
use crate::utils::futures::CallOnDrop;

type Outcome = Result<User, FetchError>;
type SharedOutcome = Shared<oneshot::Receiver<Outcome>>;

/// A running read for one key.
struct Slot {
    /// Distinguishes this read from earlier and later ones for the same key.
    episode: u64,
    channel: SharedOutcome,
    /// Set once a write made the outcome of this read outdated.
    stale: Arc<AtomicBool>,
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("episode", &self.episode)
            .field("stale", &self.stale)
            .finish()
    }
}

#[derive(Debug, Default)]
struct Inner {
    slots: Mutex<HashMap<String, Slot>>,
    next_episode: AtomicU64,
}

/// Tracks which keys currently have a read in progress.
///
/// The first caller for a key becomes its [`Leader`] and is responsible for publishing the
/// outcome. Everyone arriving while the read runs gets a [`Subscription`] to the same outcome.
#[derive(Clone, Debug, Default)]
pub struct InflightRegistry {
    inner: Arc<Inner>,
}

/// The part a caller plays in the read of a key.
#[derive(Debug)]
pub enum Role {
    /// No read was running. The caller must perform it and [`publish`](Leader::publish) the
    /// outcome.
    Leader(Leader),
    /// A read is running and this will resolve to its outcome.
    Follower(Subscription),
}

impl InflightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the running read for `key`, or registers a new one if there is none.
    ///
    /// The check and the registration happen under a single lock acquisition, so of any number
    /// of concurrent callers exactly one becomes the leader.
    pub fn join_or_lead(&self, key: &str) -> Role {
        let mut slots = self.inner.slots.lock();

        if let Some(slot) = slots.get(key) {
            metric!(counter("users.inflight.follower") += 1);
            return Role::Follower(Subscription {
                channel: slot.channel.clone(),
            });
        }

        let episode = self.inner.next_episode.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();
        let stale = Arc::new(AtomicBool::new(false));

        slots.insert(
            key.to_owned(),
            Slot {
                episode,
                channel: channel.clone(),
                stale: Arc::clone(&stale),
            },
        );
        metric!(gauge("users.inflight.slots") = slots.len() as u64);
        drop(slots);

        let release = {
            let inner = Arc::clone(&self.inner);
            let key = key.to_owned();
            CallOnDrop::new(move || {
                let mut slots = inner.slots.lock();
                // A write may have detached this read and a newer one may have taken its place.
                if slots.get(&key).is_some_and(|slot| slot.episode == episode) {
                    slots.remove(&key);
                }
            })
        };

        metric!(counter("users.inflight.leader") += 1);
        Role::Leader(Leader {
            sender,
            channel,
            stale,
            release,
        })
    }

    /// Forgets the running read for `key`, if any.
    ///
    /// Callers that already joined still receive its outcome, but the leader will see
    /// [`Leader::is_stale`] and callers arriving from now on start a fresh read.
    pub fn detach(&self, key: &str) {
        if let Some(slot) = self.inner.slots.lock().remove(key) {
            slot.stale.store(true, Ordering::Release);
            metric!(counter("users.inflight.detached") += 1);
        }
    }

    /// The number of keys with a read in progress.
    pub fn len(&self) -> usize {
        self.inner.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The obligation to perform a read and publish its outcome.
///
/// Dropping the leader without publishing releases the slot, and everyone waiting on it
/// receives a [`FetchError::Store`].
pub struct Leader {
    sender: oneshot::Sender<Outcome>,
    channel: SharedOutcome,
    stale: Arc<AtomicBool>,
    release: CallOnDrop,
}

impl fmt::Debug for Leader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Leader")
            .field("stale", &self.is_stale())
            .finish()
    }
}

impl Leader {
    /// Whether a write happened since this read was registered.
    ///
    /// The outcome of a stale read must not be put into the cache.
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Returns a subscription to the outcome this leader is going to publish.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            channel: self.channel.clone(),
        }
    }

    /// Hands `outcome` to all subscribers, then releases the slot.
    pub fn publish(self, outcome: Outcome) {
        let Leader {
            sender, release, ..
        } = self;
        // Nobody may be listening anymore, which is fine.
        let _ = sender.send(outcome);
        drop(release);
    }
}

/// A pending outcome of a read performed by somebody else.
#[derive(Clone)]
pub struct Subscription {
    channel: SharedOutcome,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("ready", &self.channel.peek().is_some())
            .finish()
    }
}

impl Subscription {
    /// Waits for the leader to publish.
    pub async fn recv(self) -> Outcome {
        match self.channel.await {
            Ok(outcome) => outcome,
            Err(_) => Err(FetchError::Store("fetch abandoned".into())),
        }
    }
}
