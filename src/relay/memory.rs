//! In-process relay used by the demo binary and tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, trace};
use serde_json::Value;
use tokio::sync::mpsc;

use super::{Collection, DocChange, DocPath, SignalingRelay, Subscription, TxOutcome, TxWrite};
use crate::error::RelayError;

#[derive(Debug, Clone)]
enum Target {
    Doc(DocPath),
    Collection(Collection),
}

impl Target {
    fn matches(&self, path: &DocPath) -> bool {
        match self {
            Self::Doc(p) => p == path,
            Self::Collection(c) => path.collection().as_ref() == Some(c),
        }
    }
}

struct Subscriber {
    target: Target,
    tx: mpsc::UnboundedSender<DocChange>,
}

struct Inner {
    docs: Mutex<BTreeMap<DocPath, Value>>,
    subscribers: DashMap<u64, Subscriber>,
    writes: DashMap<DocPath, usize>,
    next_subscriber: AtomicU64,
    next_auto_id: AtomicU64,
    available: AtomicBool,
}

/// A [`SignalingRelay`] kept entirely in memory.
///
/// Clones share the same store, so several participants can be wired to one
/// relay. Writes notify subscribers while the store lock is held, so every
/// subscriber observes changes to a single document in commit order.
#[derive(Clone)]
pub struct MemoryRelay {
    inner: Arc<Inner>,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                docs: Mutex::new(BTreeMap::new()),
                subscribers: DashMap::new(),
                writes: DashMap::new(),
                next_subscriber: AtomicU64::new(1),
                next_auto_id: AtomicU64::new(1),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Simulate an outage: every operation fails with
    /// [`RelayError::Unavailable`] until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Number of successful writes (set, add, committed transaction, delete)
    /// to `path`.
    pub fn write_count(&self, path: &DocPath) -> usize {
        self.inner.writes.get(path).map(|c| *c).unwrap_or(0)
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    fn docs(&self) -> MutexGuard<'_, BTreeMap<DocPath, Value>> {
        self.inner
            .docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), RelayError> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RelayError::Unavailable("memory relay offline".into()))
        }
    }

    fn record_write(&self, path: &DocPath, value: Option<Value>) {
        *self.inner.writes.entry(path.clone()).or_insert(0) += 1;
        let change = DocChange {
            path: path.clone(),
            value,
        };
        for sub in self.inner.subscribers.iter() {
            if sub.target.matches(path) {
                // A closed receiver is removed by its cancel hook.
                let _ = sub.tx.send(change.clone());
            }
        }
    }

    fn register(&self, target: Target, initial: Vec<DocChange>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        for change in initial {
            let _ = tx.send(change);
        }
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        trace!("relay subscriber {id} registered for {target:?}");
        self.inner.subscribers.insert(id, Subscriber { target, tx });

        let inner = Arc::downgrade(&self.inner);
        Subscription::new(rx, move || {
            if let Some(inner) = inner.upgrade() {
                inner.subscribers.remove(&id);
            }
        })
    }
}

#[async_trait]
impl SignalingRelay for MemoryRelay {
    async fn get(&self, path: &DocPath) -> Result<Option<Value>, RelayError> {
        self.check_available()?;
        Ok(self.docs().get(path).cloned())
    }

    async fn set(&self, path: &DocPath, value: Value) -> Result<(), RelayError> {
        self.check_available()?;
        let mut docs = self.docs();
        docs.insert(path.clone(), value.clone());
        self.record_write(path, Some(value));
        Ok(())
    }

    async fn add(&self, collection: &Collection, value: Value) -> Result<DocPath, RelayError> {
        self.check_available()?;
        let mut docs = self.docs();
        let seq = self.inner.next_auto_id.fetch_add(1, Ordering::Relaxed);
        let path = collection.doc(format!("{seq:012}"));
        docs.insert(path.clone(), value.clone());
        self.record_write(&path, Some(value));
        Ok(path)
    }

    async fn delete(&self, path: &DocPath) -> Result<(), RelayError> {
        self.check_available()?;
        let mut docs = self.docs();
        if docs.remove(path).is_some() {
            self.record_write(path, None);
        }
        Ok(())
    }

    async fn list(&self, collection: &Collection) -> Result<Vec<(DocPath, Value)>, RelayError> {
        self.check_available()?;
        Ok(self
            .docs()
            .iter()
            .filter(|(path, _)| path.collection().as_ref() == Some(collection))
            .map(|(path, value)| (path.clone(), value.clone()))
            .collect())
    }

    async fn transact(
        &self,
        path: &DocPath,
        body: &mut (dyn for<'v> FnMut(Option<&'v Value>) -> TxWrite + Send),
    ) -> Result<TxOutcome, RelayError> {
        self.check_available()?;
        let mut docs = self.docs();
        match body(docs.get(path)) {
            TxWrite::Put(value) => {
                docs.insert(path.clone(), value.clone());
                self.record_write(path, Some(value.clone()));
                Ok(TxOutcome {
                    committed: true,
                    value: Some(value),
                })
            }
            TxWrite::Abort => {
                debug!("transaction on {path} aborted");
                Ok(TxOutcome {
                    committed: false,
                    value: docs.get(path).cloned(),
                })
            }
        }
    }

    async fn subscribe_doc(&self, path: &DocPath) -> Result<Subscription, RelayError> {
        self.check_available()?;
        let docs = self.docs();
        let initial = docs
            .get(path)
            .map(|value| DocChange {
                path: path.clone(),
                value: Some(value.clone()),
            })
            .into_iter()
            .collect();
        Ok(self.register(Target::Doc(path.clone()), initial))
    }

    async fn subscribe_collection(
        &self,
        collection: &Collection,
    ) -> Result<Subscription, RelayError> {
        self.check_available()?;
        let docs = self.docs();
        let initial = docs
            .iter()
            .filter(|(path, _)| path.collection().as_ref() == Some(collection))
            .map(|(path, value)| DocChange {
                path: path.clone(),
                value: Some(value.clone()),
            })
            .collect();
        Ok(self.register(Target::Collection(collection.clone()), initial))
    }
}
