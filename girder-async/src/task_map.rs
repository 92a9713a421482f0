//! Memoized async task map
//!
//! A keyed, at-most-once computation pool: the first request for a key
//! spawns its reader on the runtime, later requests share the result.
//! Requests issued from within a computation record dependency edges,
//! so a request that would close a cycle is rejected with a fatal error
//! naming the key chain instead of deadlocking.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// Failure of one computation; `fatal` failures prevent dependents from
/// ever observing a value.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{msg}")]
pub struct Failure {
    pub msg: String,
    pub fatal: bool,
}

impl Failure {
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            fatal: true,
        }
    }
}

/// Sink for diagnostics; the bool marks fatal messages.
pub type Logger = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// A logger that drops everything.
pub fn null_logger() -> Logger {
    Arc::new(|_, _| {})
}

pub type ReaderFuture<V> = Pin<Box<dyn Future<Output = Result<V, Failure>> + Send>>;

/// Producer of values: invoked at most once per key, on the runtime.
/// The context allows the computation to await other keys of the same
/// map and to emit non-fatal diagnostics.
pub type Reader<K, V> = Arc<dyn Fn(TaskContext<K, V>, K) -> ReaderFuture<V> + Send + Sync>;

enum Entry<V> {
    Pending {
        waiters: Vec<oneshot::Sender<Result<V, Failure>>>,
    },
    Ready(V),
    Failed(Failure),
}

struct MapState<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// consumer key -> keys its computation currently awaits
    waiting_on: HashMap<K, HashSet<K>>,
}

impl<K: Eq + Hash + Clone + Debug, V> MapState<K, V> {
    /// Is `target` reachable from `from` along the awaited-by edges?
    fn reaches(&self, from: &K, target: &K) -> bool {
        let mut stack = vec![from.clone()];
        let mut seen = HashSet::new();
        while let Some(key) = stack.pop() {
            if &key == target {
                return true;
            }
            if !seen.insert(key.clone()) {
                continue;
            }
            if let Some(next) = self.waiting_on.get(&key) {
                stack.extend(next.iter().cloned());
            }
        }
        false
    }
}

/// The memoized map. Values must be cheap to clone (share via `Arc`).
pub struct AsyncTaskMap<K, V> {
    state: Mutex<MapState<K, V>>,
    reader: Reader<K, V>,
    logger: Logger,
}

/// Handle passed to a computation for requesting sub-keys and logging.
pub struct TaskContext<K, V> {
    map: Arc<AsyncTaskMap<K, V>>,
    key: K,
}

impl<K, V> TaskContext<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// The key whose computation this context belongs to.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Await the values for `keys`, in order. A request that would make
    /// the current key transitively wait on itself fails fatally with
    /// the cycle chain.
    pub async fn deps(&self, keys: Vec<K>) -> Result<Vec<V>, Failure> {
        self.map.request(Some(self.key.clone()), keys).await
    }

    /// Emit a non-fatal diagnostic.
    pub fn log(&self, msg: &str) {
        (self.map.logger)(msg, false);
    }
}

impl<K, V> AsyncTaskMap<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(reader: Reader<K, V>, logger: Logger) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MapState {
                entries: HashMap::new(),
                waiting_on: HashMap::new(),
            }),
            reader,
            logger,
        })
    }

    /// Top-level entry: await the values for `keys` in order.
    pub async fn consume(self: &Arc<Self>, keys: Vec<K>) -> Result<Vec<V>, Failure> {
        self.request(None, keys).await
    }

    /// Value for a key if already computed.
    pub fn get_ready(&self, key: &K) -> Option<V> {
        let state = self.state.lock().expect("task map state poisoned");
        match state.entries.get(key) {
            Some(Entry::Ready(value)) => Some(value.clone()),
            _ => None,
        }
    }

    async fn request(self: &Arc<Self>, consumer: Option<K>, keys: Vec<K>) -> Result<Vec<V>, Failure> {
        enum Pending<V> {
            Ready(Result<V, Failure>),
            Waiting(oneshot::Receiver<Result<V, Failure>>),
        }
        let mut slots = Vec::with_capacity(keys.len());
        let mut to_spawn = Vec::new();
        {
            let mut state = self.state.lock().expect("task map state poisoned");
            if let Some(consumer_key) = &consumer {
                // record dependency edges, then refuse requests that
                // would close a cycle
                let pending_keys: Vec<K> = keys
                    .iter()
                    .filter(|k| {
                        !matches!(
                            state.entries.get(k),
                            Some(Entry::Ready(_)) | Some(Entry::Failed(_))
                        )
                    })
                    .cloned()
                    .collect();
                state
                    .waiting_on
                    .entry(consumer_key.clone())
                    .or_default()
                    .extend(pending_keys.iter().cloned());
                for key in &pending_keys {
                    if state.reaches(key, consumer_key) {
                        let failure = Failure::fatal(format!(
                            "Cyclic dependency detected: {:?} requested while computing {:?}, which it transitively waits on",
                            key, consumer_key
                        ));
                        (self.logger)(&failure.msg, true);
                        return Err(failure);
                    }
                }
            }
            for key in &keys {
                match state.entries.get_mut(key) {
                    Some(Entry::Ready(value)) => slots.push(Pending::Ready(Ok(value.clone()))),
                    Some(Entry::Failed(failure)) => {
                        slots.push(Pending::Ready(Err(failure.clone())))
                    }
                    Some(Entry::Pending { waiters }) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        slots.push(Pending::Waiting(rx));
                    }
                    None => {
                        let (tx, rx) = oneshot::channel();
                        state
                            .entries
                            .insert(key.clone(), Entry::Pending { waiters: vec![tx] });
                        to_spawn.push(key.clone());
                        slots.push(Pending::Waiting(rx));
                    }
                }
            }
        }
        for key in to_spawn {
            let map = self.clone();
            let reader = self.reader.clone();
            tokio::spawn(async move {
                let ctx = TaskContext {
                    map: map.clone(),
                    key: key.clone(),
                };
                let result = reader(ctx, key.clone()).await;
                map.complete(&key, result);
            });
        }
        let mut values = Vec::with_capacity(slots.len());
        let mut first_failure: Option<Failure> = None;
        for slot in slots {
            let outcome = match slot {
                Pending::Ready(outcome) => outcome,
                Pending::Waiting(rx) => match rx.await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Failure::fatal("Computation dropped without a value")),
                },
            };
            match outcome {
                Ok(value) => values.push(value),
                Err(failure) => {
                    if first_failure.is_none() {
                        first_failure = Some(failure);
                    }
                }
            }
        }
        if let Some(consumer_key) = &consumer {
            let mut state = self.state.lock().expect("task map state poisoned");
            if let Some(edges) = state.waiting_on.get_mut(consumer_key) {
                for key in &keys {
                    edges.remove(key);
                }
                if edges.is_empty() {
                    state.waiting_on.remove(consumer_key);
                }
            }
        }
        match first_failure {
            Some(failure) => Err(failure),
            None => Ok(values),
        }
    }

    fn complete(self: &Arc<Self>, key: &K, result: Result<V, Failure>) {
        let waiters = {
            let mut state = self.state.lock().expect("task map state poisoned");
            state.waiting_on.remove(key);
            let entry = match &result {
                Ok(value) => Entry::Ready(value.clone()),
                Err(failure) => Entry::Failed(failure.clone()),
            };
            match state.entries.insert(key.clone(), entry) {
                Some(Entry::Pending { waiters }) => waiters,
                _ => Vec::new(),
            }
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_reader(
        counter: Arc<AtomicUsize>,
    ) -> Reader<String, Arc<String>> {
        Arc::new(move |_ctx, key: String| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(format!("value-of-{}", key)))
            })
        })
    }

    #[tokio::test]
    async fn test_values_in_key_order() {
        let counter = Arc::new(AtomicUsize::new(0));
        let map = AsyncTaskMap::new(counting_reader(counter), null_logger());
        let values = map
            .consume(vec!["b".to_string(), "a".to_string()])
            .await
            .expect("computes");
        assert_eq!(*values[0], "value-of-b");
        assert_eq!(*values[1], "value-of-a");
    }

    #[tokio::test]
    async fn test_at_most_once_computation() {
        let counter = Arc::new(AtomicUsize::new(0));
        let map = AsyncTaskMap::new(counting_reader(counter.clone()), null_logger());
        let a = map.consume(vec!["k".to_string()]);
        let b = map.consume(vec!["k".to_string()]);
        let (ra, rb) = tokio::join!(a, b);
        assert!(ra.is_ok() && rb.is_ok());
        let again = map.consume(vec!["k".to_string()]).await.expect("cached");
        assert_eq!(*again[0], "value-of-k");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_propagates_and_is_cached() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let reader: Reader<String, Arc<String>> = Arc::new(move |_ctx, key: String| {
            let attempts = attempts_clone.clone();
            Box::pin(async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Failure::fatal(format!("cannot compute {}", key)))
            })
        });
        let map = AsyncTaskMap::new(reader, null_logger());
        let first = map.consume(vec!["bad".to_string()]).await;
        assert!(first.is_err());
        let second = map.consume(vec!["bad".to_string()]).await;
        assert!(second.expect_err("cached failure").fatal);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fan_out_through_context() {
        let reader: Reader<String, Arc<String>> = Arc::new(|ctx, key: String| {
            Box::pin(async move {
                if key == "root" {
                    let deps = ctx
                        .deps(vec!["left".to_string(), "right".to_string()])
                        .await?;
                    Ok(Arc::new(format!("{}+{}", deps[0], deps[1])))
                } else {
                    Ok(Arc::new(key))
                }
            })
        });
        let map = AsyncTaskMap::new(reader, null_logger());
        let values = map.consume(vec!["root".to_string()]).await.expect("computes");
        assert_eq!(*values[0], "left+right");
    }

    #[tokio::test]
    async fn test_cycle_detected() {
        // k1 waits on k2, k2 waits on k1: one consumer gets the cycle
        // error, the other observes a downstream failure
        let reader: Reader<String, Arc<String>> = Arc::new(|ctx, key: String| {
            Box::pin(async move {
                let other = if key == "k1" { "k2" } else { "k1" };
                let deps = ctx.deps(vec![other.to_string()]).await?;
                Ok(Arc::new(format!("{} via {}", key, deps[0])))
            })
        });
        let logged = Arc::new(Mutex::new(Vec::<(String, bool)>::new()));
        let logged_clone = logged.clone();
        let logger: Logger = Arc::new(move |msg, fatal| {
            logged_clone
                .lock()
                .expect("log lock")
                .push((msg.to_string(), fatal));
        });
        let map = AsyncTaskMap::new(reader, logger);
        let result = map.consume(vec!["k1".to_string()]).await;
        let failure = result.expect_err("cycle must fail");
        assert!(failure.fatal);
        let logs = logged.lock().expect("log lock");
        assert!(logs
            .iter()
            .any(|(msg, fatal)| *fatal && msg.contains("Cyclic dependency")));
    }

    #[tokio::test]
    async fn test_diamond_is_not_a_cycle() {
        // root -> {a, b} -> shared: the shared leaf is awaited twice
        // but never cyclically
        let reader: Reader<String, Arc<String>> = Arc::new(|ctx, key: String| {
            Box::pin(async move {
                match key.as_str() {
                    "root" => {
                        let deps = ctx.deps(vec!["a".to_string(), "b".to_string()]).await?;
                        Ok(Arc::new(format!("root({},{})", deps[0], deps[1])))
                    }
                    "a" | "b" => {
                        let deps = ctx.deps(vec!["shared".to_string()]).await?;
                        Ok(Arc::new(format!("{}<{}>", key, deps[0])))
                    }
                    _ => Ok(Arc::new(key)),
                }
            })
        });
        let map = AsyncTaskMap::new(reader, null_logger());
        let values = map.consume(vec!["root".to_string()]).await.expect("computes");
        assert_eq!(*values[0], "root(a<shared>,b<shared>)");
    }
}
