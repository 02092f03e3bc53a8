//! In-memory document store used by tests and local tooling.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use bson::Document;
use tokio::sync::broadcast;

use ledger_core::error::StoreError;

use super::{ensure_id, BatchOp, ChangeEvent, DocumentStore, Filter};

const EVENT_CAPACITY: usize = 64;

/// Hash-map backed [`DocumentStore`] with the same observable semantics as
/// the MongoDB implementation, including change events and atomic batches.
pub struct MemoryStore {
    collections: RwLock<HashMap<String, BTreeMap<String, Document>>>,
    senders: Mutex<HashMap<String, broadcast::Sender<ChangeEvent>>>,
    atomic_batches: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            senders: Mutex::new(HashMap::new()),
            atomic_batches: true,
        }
    }

    /// A store that refuses batches, for exercising sequential fallbacks.
    pub fn without_batches() -> Self {
        Self {
            atomic_batches: false,
            ..Self::new()
        }
    }

    fn notify(&self, collection: &str) {
        let senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = senders.get(collection) {
            // Nobody listening is fine.
            let _ = sender.send(ChangeEvent {
                collection: collection.to_string(),
            });
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn matches_filters(doc: &Document, filters: &[Filter]) -> bool {
    filters
        .iter()
        .all(|filter| doc.get(&filter.field) == Some(&filter.value))
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let map = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(map.get(collection).and_then(|docs| docs.get(id)).cloned())
    }

    async fn insert(&self, collection: &str, mut doc: Document) -> Result<String, StoreError> {
        let id = ensure_id(&mut doc);
        {
            let mut map = self
                .collections
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let docs = map.entry(collection.to_string()).or_default();
            if docs.contains_key(&id) {
                return Err(StoreError::Backend(anyhow::anyhow!(
                    "duplicate _id {id} in {collection}"
                )));
            }
            docs.insert(id.clone(), doc);
        }
        self.notify(collection);
        Ok(id)
    }

    async fn update(&self, collection: &str, id: &str, patch: Document) -> Result<(), StoreError> {
        {
            let mut map = self
                .collections
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let doc = map
                .get_mut(collection)
                .and_then(|docs| docs.get_mut(id))
                .ok_or_else(|| {
                    StoreError::Backend(anyhow::anyhow!("document {id} missing in {collection}"))
                })?;
            for (key, value) in patch {
                doc.insert(key, value);
            }
        }
        self.notify(collection);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let existed = {
            let mut map = self
                .collections
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            map.get_mut(collection)
                .and_then(|docs| docs.remove(id))
                .is_some()
        };
        if existed {
            self.notify(collection);
        }
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        filters: &[Filter],
    ) -> Result<Vec<Document>, StoreError> {
        let map = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(docs) = map.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(docs
            .values()
            .filter(|doc| matches_filters(doc, filters))
            .cloned()
            .collect())
    }

    fn supports_batch(&self) -> bool {
        self.atomic_batches
    }

    async fn commit_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        if !self.atomic_batches {
            return Err(StoreError::BatchUnsupported);
        }

        let mut touched: Vec<&'static str> = Vec::new();
        {
            let mut map = self
                .collections
                .write()
                .unwrap_or_else(PoisonError::into_inner);

            // Validate first so a bad op leaves nothing behind.
            for op in &ops {
                match op {
                    BatchOp::Insert { collection, doc } => {
                        if let Ok(id) = doc.get_str("_id") {
                            if map
                                .get(*collection)
                                .is_some_and(|docs| docs.contains_key(id))
                            {
                                return Err(StoreError::Backend(anyhow::anyhow!(
                                    "duplicate _id {id} in {collection}"
                                )));
                            }
                        }
                    }
                    BatchOp::Update { collection, id, .. } => {
                        if !map
                            .get(*collection)
                            .is_some_and(|docs| docs.contains_key(id))
                        {
                            return Err(StoreError::Backend(anyhow::anyhow!(
                                "document {id} missing in {collection}"
                            )));
                        }
                    }
                    BatchOp::Delete { .. } => {}
                }
            }

            for op in ops {
                match op {
                    BatchOp::Insert {
                        collection,
                        mut doc,
                    } => {
                        let id = ensure_id(&mut doc);
                        map.entry(collection.to_string()).or_default().insert(id, doc);
                        touched.push(collection);
                    }
                    BatchOp::Update {
                        collection,
                        id,
                        patch,
                    } => {
                        if let Some(doc) = map.get_mut(collection).and_then(|docs| docs.get_mut(&id))
                        {
                            for (key, value) in patch {
                                doc.insert(key, value);
                            }
                        }
                        touched.push(collection);
                    }
                    BatchOp::Delete { collection, id } => {
                        if let Some(docs) = map.get_mut(collection) {
                            docs.remove(&id);
                        }
                        touched.push(collection);
                    }
                }
            }
        }

        touched.sort_unstable();
        touched.dedup();
        for collection in touched {
            self.notify(collection);
        }
        Ok(())
    }

    fn subscribe(&self, collection: &str) -> broadcast::Receiver<ChangeEvent> {
        let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        senders
            .entry(collection.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_CAPACITY).0)
            .subscribe()
    }
}
