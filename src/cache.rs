use async_trait::async_trait;
use std::{collections::HashMap, fmt, hash::Hash, thread};
use tokio::sync::{mpsc, oneshot};

/// A store of previously computed values, looked up by key.
#[async_trait]
pub trait Cache: Send + Sync {
    /// The type of key values are stored under.
    type Key;

    /// The type of stored values.
    type Value;

    /// Records a value for the key without waiting for the write to be
    /// applied. Writes are applied in the order they were issued.
    fn put(&self, key: Self::Key, value: Self::Value);

    /// Waits for all previously issued writes to be applied and then returns
    /// the value stored for the key, if any.
    async fn get(&self, key: &Self::Key) -> Option<Self::Value>;
}

enum Command<K, V> {
    Put(K, V),
    Get(K, oneshot::Sender<Option<V>>),
    Len(oneshot::Sender<usize>),
}

/// An unbounded, thread-safe [Cache] backed by a single owner.
///
/// The underlying map lives on a dedicated worker thread. Every operation is
/// sent to that thread over one FIFO channel, so all reads and writes issued
/// through any clone of the cache are applied in a single total order and
/// the map itself is never shared.
///
/// Cloning the cache is cheap and yields another handle to the same map. The
/// worker thread exits once the last handle is dropped.
pub struct KeyedCache<K, V> {
    commands: mpsc::UnboundedSender<Command<K, V>>,
}

impl<K, V> KeyedCache<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Creates an empty cache and spawns its worker thread.
    pub fn new() -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        thread::spawn(move || serve(rx));
        Self { commands }
    }

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// Returns immediately; the write is applied asynchronously but before
    /// any operation issued after this call returns.
    pub fn put(&self, key: K, value: V) {
        tracing::trace!(?key, "cache put");
        if self.commands.send(Command::Put(key, value)).is_err() {
            tracing::error!("cache worker is gone, dropping write");
        }
    }

    /// Returns the value stored under `key` once all earlier writes have
    /// been applied.
    pub async fn get(&self, key: &K) -> Option<V> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Get(key.clone(), tx)).ok()?;
        rx.await.ok().flatten()
    }

    /// Like [KeyedCache::get], but blocks the current thread instead of
    /// suspending.
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context.
    pub fn get_blocking(&self, key: &K) -> Option<V> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Get(key.clone(), tx)).ok()?;
        rx.blocking_recv().ok().flatten()
    }

    /// Returns the number of stored entries once all earlier writes have
    /// been applied.
    pub async fn len(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Len(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or_default()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl<K, V> Default for KeyedCache<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Clone for KeyedCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
        }
    }
}

impl<K, V> fmt::Debug for KeyedCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedCache")
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}

#[async_trait]
impl<K, V> Cache for KeyedCache<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    type Key = K;
    type Value = V;

    fn put(&self, key: K, value: V) {
        KeyedCache::put(self, key, value)
    }

    async fn get(&self, key: &K) -> Option<V> {
        KeyedCache::get(self, key).await
    }
}

/// Applies commands to the map, in arrival order, until every sender is
/// dropped.
fn serve<K, V>(mut commands: mpsc::UnboundedReceiver<Command<K, V>>)
where
    K: Eq + Hash,
    V: Clone,
{
    let mut entries = HashMap::new();
    while let Some(command) = commands.blocking_recv() {
        match command {
            Command::Put(key, value) => {
                entries.insert(key, value);
            }
            // The requester may have given up waiting.
            Command::Get(key, reply) => {
                let _ = reply.send(entries.get(&key).cloned());
            }
            Command::Len(reply) => {
                let _ = reply.send(entries.len());
            }
        }
    }
    tracing::trace!(entries = entries.len(), "cache worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_key_is_absent() {
        let cache = KeyedCache::<u32, Vec<u8>>::new();
        assert_eq!(cache.get(&7).await, None);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn put_is_visible_to_next_get() {
        let cache = KeyedCache::new();
        cache.put(7, vec![0x01, 0x02]);
        assert_eq!(cache.get(&7).await, Some(vec![0x01, 0x02]));
        assert_eq!(cache.get(&7).await, Some(vec![0x01, 0x02]));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn last_write_wins() {
        let cache = KeyedCache::new();
        cache.put("photo", 1);
        cache.put("photo", 2);
        assert_eq!(cache.get(&"photo").await, Some(2));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn clones_share_entries() {
        let cache = KeyedCache::new();
        let other = cache.clone();
        other.put(1u64, "one");
        assert_eq!(cache.get(&1).await, Some("one"));
    }

    #[test]
    fn blocking_get_outside_runtime() {
        let cache = KeyedCache::new();
        cache.put(3u8, 'c');
        assert_eq!(cache.get_blocking(&3), Some('c'));
        assert_eq!(cache.get_blocking(&4), None);
    }

    #[test]
    fn writes_from_many_threads() {
        let cache = KeyedCache::new();
        let writers: Vec<_> = (0..8u32)
            .map(|t| {
                let cache = cache.clone();
                thread::spawn(move || {
                    for i in 0..100u32 {
                        let key = t * 1000 + i;
                        cache.put(key, key * 2);
                        assert_eq!(cache.get_blocking(&key), Some(key * 2));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        for t in 0..8u32 {
            for i in 0..100u32 {
                let key = t * 1000 + i;
                assert_eq!(cache.get_blocking(&key), Some(key * 2));
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_puts_then_gets() {
        let cache = KeyedCache::new();
        let mut writers = tokio::task::JoinSet::new();
        for key in 0..256u64 {
            let cache = cache.clone();
            writers.spawn(async move { cache.put(key, key.to_be_bytes().to_vec()) });
        }
        while let Some(joined) = writers.join_next().await {
            joined.unwrap();
        }

        let mut readers = tokio::task::JoinSet::new();
        for key in 0..256u64 {
            let cache = cache.clone();
            readers.spawn(async move { (key, cache.get(&key).await) });
        }
        while let Some(joined) = readers.join_next().await {
            let (key, value) = joined.unwrap();
            assert_eq!(value, Some(key.to_be_bytes().to_vec()));
        }
        assert_eq!(cache.len().await, 256);
    }
}
