use crate::{
    cache::KeyedCache,
    config::Config,
    fetch::{Fetch, FetchSource, KeyOf, Reference},
    job::Block,
    scheduler::{Scheduler, SchedulerError},
    task::{Context, Job, Task, TaskId, TaskState},
};
use either::Either;
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

/// A fetched value handed to the caller of [Loader::load].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery<K, V> {
    /// The key that was requested.
    pub key: K,
    /// The fetch task that produced the value.
    pub fetch: TaskId,
    pub value: V,
}

/// The tasks scheduled for a [Loader::load] call that missed the cache.
///
/// The ids let the caller tell, once a [Delivery] arrives, whether it still
/// belongs to the request the caller is waiting on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pending<K> {
    pub key: K,
    pub fetch: TaskId,
    pub deliver: TaskId,
}

struct InFlight<S: FetchSource> {
    fetch: Task<Fetch<S>>,
    followers: Vec<Arc<dyn Job>>,
}

impl<S: FetchSource> InFlight<S> {
    /// Whether another delivery can still be attached to the fetch.
    fn is_usable(&self) -> bool {
        !self.fetch.is_cancelled()
            && (self.fetch.state() != TaskState::Finished || self.fetch.output().is_some())
    }

    fn cancel(&self) {
        self.fetch.cancel();
        for follower in &self.followers {
            follower.cancel();
        }
    }
}

/// Fetches in flight, by key.
struct Registry<S: FetchSource> {
    entries: HashMap<KeyOf<S>, InFlight<S>>,
    /// Bumped whenever a store forgets its entry. Its value is cached by
    /// then, so a load that missed the cache before the bump has to look
    /// again.
    settled: u64,
}

impl<S: FetchSource> Default for Registry<S> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            settled: 0,
        }
    }
}

impl<S: FetchSource> Registry<S> {
    /// Decides how a load that missed the cache goes on. `settled` is the
    /// counter as read before the cache lookup.
    fn claim(&self, key: &KeyOf<S>, settled: u64) -> Claim<S> {
        match self.entries.get(key) {
            Some(entry) if entry.is_usable() => Claim::Join(entry.fetch.clone()),
            _ if self.settled != settled => Claim::Retry,
            _ => Claim::Start,
        }
    }
}

enum Claim<S: FetchSource> {
    /// Attach to this fetch.
    Join(Task<Fetch<S>>),
    /// Nothing usable is in flight, start a fetch.
    Start,
    /// A value may have been cached since the lookup, look again.
    Retry,
}

type InFlightMap<S> = Arc<Mutex<Registry<S>>>;

/// Loads values through a [KeyedCache], fetching them from a [FetchSource]
/// on a miss.
///
/// A miss schedules three tasks: a fetch, a store into the cache and a
/// delivery to the caller. Store and delivery both depend on the fetch, so
/// they run after it has finished, whatever its outcome. They skip their
/// action if the fetch produced nothing.
pub struct Loader<S: FetchSource> {
    source: Arc<S>,
    cache: KeyedCache<KeyOf<S>, S::Payload>,
    scheduler: Scheduler,
    fetch_timeout: Option<Duration>,
    in_flight: InFlightMap<S>,
}

impl<S: FetchSource> Loader<S> {
    pub fn new(
        source: S,
        cache: KeyedCache<KeyOf<S>, S::Payload>,
        scheduler: Scheduler,
        config: &Config,
    ) -> Self {
        Self {
            source: Arc::new(source),
            cache,
            scheduler,
            fetch_timeout: config.fetch_timeout,
            in_flight: Arc::default(),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn cache(&self) -> &KeyedCache<KeyOf<S>, S::Payload> {
        &self.cache
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Returns the cached value for the reference, or schedules it to be
    /// fetched, cached and passed to `deliver`.
    ///
    /// If the key is already being fetched, only a new delivery is attached
    /// to the running fetch. `deliver` is never called if the fetch fails or
    /// either task is cancelled first.
    pub async fn load<F>(
        &self,
        reference: S::Reference,
        deliver: F,
    ) -> Result<Either<S::Payload, Pending<KeyOf<S>>>, SchedulerError>
    where
        F: FnOnce(Delivery<KeyOf<S>, S::Payload>) + Send + 'static,
    {
        let key = reference.key();
        let (mut in_flight, fetch) = loop {
            let settled = self.in_flight().settled;
            if let Some(value) = self.cache.get(&key).await {
                tracing::trace!(?key, "cache hit");
                return Ok(Either::Left(value));
            }
            let mut in_flight = self.in_flight();
            match in_flight.claim(&key, settled) {
                Claim::Join(fetch) => {
                    tracing::debug!(?key, fetch = %fetch.id(), "joining in-flight fetch");
                    break (in_flight, fetch);
                }
                Claim::Start => {
                    let entry = self.spawn_fetch(reference)?;
                    let fetch = entry.fetch.clone();
                    // A replaced entry belongs to a fetch that is cancelled
                    // or failed, so nothing is lost by forgetting it.
                    in_flight.entries.insert(key.clone(), entry);
                    break (in_flight, fetch);
                }
                Claim::Retry => tracing::trace!(?key, "a store landed during lookup"),
            }
        };

        let delivery = Task::new(Block::new({
            let fetch = fetch.clone();
            let key = key.clone();
            move |cx: &Context| {
                if cx.is_cancelled() {
                    return;
                }
                if let Some(value) = fetch.output() {
                    deliver(Delivery {
                        key,
                        fetch: fetch.id(),
                        value: value.clone(),
                    });
                }
            }
        }));
        delivery.add_dependency(&fetch);
        let deliver_id = self.scheduler.add(&delivery)?;
        if let Some(entry) = in_flight.entries.get_mut(&key) {
            entry.followers.push(delivery.as_job());
        }

        Ok(Either::Right(Pending {
            key,
            fetch: fetch.id(),
            deliver: deliver_id,
        }))
    }

    /// Cancels everything in flight for the key. Returns `false` if nothing
    /// was.
    pub fn cancel(&self, key: &KeyOf<S>) -> bool {
        let entry = self.in_flight().entries.remove(key);
        match entry {
            Some(entry) => {
                tracing::debug!(?key, fetch = %entry.fetch.id(), "cancelling load");
                entry.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every load in flight.
    pub fn cancel_all(&self) {
        let entries: Vec<_> = self.in_flight().entries.drain().collect();
        tracing::debug!(count = entries.len(), "cancelling all loads");
        for (_, entry) in entries {
            entry.cancel();
        }
    }

    /// Whether the key is currently being fetched.
    pub fn is_loading(&self, key: &KeyOf<S>) -> bool {
        self.in_flight()
            .entries
            .get(key)
            .is_some_and(|entry| entry.fetch.state() != TaskState::Finished)
    }

    fn in_flight(&self) -> MutexGuard<'_, Registry<S>> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedules a fetch and the store that follows it.
    fn spawn_fetch(&self, reference: S::Reference) -> Result<InFlight<S>, SchedulerError> {
        let key = reference.key();
        let fetch = Task::new(
            Fetch::new(Arc::clone(&self.source), reference).with_timeout(self.fetch_timeout),
        );

        let store = Task::new(Block::new({
            let fetch = fetch.clone();
            let cache = self.cache.clone();
            let in_flight = Arc::downgrade(&self.in_flight);
            move |cx: &Context| {
                if !cx.is_cancelled() {
                    if let Some(value) = fetch.output() {
                        cache.put(key.clone(), value.clone());
                    }
                }
                let Some(in_flight) = in_flight.upgrade() else {
                    return;
                };
                // Only forget the entry if no newer fetch replaced it.
                let mut in_flight = in_flight.lock().unwrap_or_else(PoisonError::into_inner);
                if in_flight
                    .entries
                    .get(&key)
                    .is_some_and(|entry| entry.fetch.id() == fetch.id())
                {
                    in_flight.entries.remove(&key);
                    in_flight.settled += 1;
                }
            }
        }));
        store.add_dependency(&fetch);

        self.scheduler.add(&fetch)?;
        self.scheduler.add(&store)?;
        Ok(InFlight {
            fetch,
            followers: vec![store.as_job()],
        })
    }
}

impl<S: FetchSource> fmt::Debug for Loader<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("in_flight", &self.in_flight().entries.len())
            .field("scheduler", &self.scheduler)
            .field("fetch_timeout", &self.fetch_timeout)
            .finish()
    }
}
