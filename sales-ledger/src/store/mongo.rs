//! MongoDB-backed document store.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use bson::{doc, Document};
use futures::{StreamExt, TryStreamExt};
use mongodb::options::ClientOptions;
use mongodb::{Client, Database};
use secrecy::ExposeSecret;
use tokio::sync::broadcast;
use tracing::warn;

use ledger_core::error::StoreError;

use crate::config::DatabaseConfig;

use super::{ensure_id, BatchOp, ChangeEvent, DocumentStore, Filter};

const EVENT_CAPACITY: usize = 64;

/// [`DocumentStore`] over a MongoDB database.
///
/// Batches run inside a client session transaction and change feeds use
/// change streams, so both need a replica set; standalone deployments should
/// opt out with [`MongoStore::without_transactions`].
pub struct MongoStore {
    client: Client,
    db: Database,
    senders: Mutex<HashMap<String, broadcast::Sender<ChangeEvent>>>,
    transactions: bool,
}

impl MongoStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let mut options = ClientOptions::parse(config.url.expose_secret())
            .await
            .map_err(map_mongo_error)?;
        options.app_name = Some("sales-ledger".to_string());

        let client = Client::with_options(options).map_err(map_mongo_error)?;
        let db = client.database(&config.db_name);

        Ok(Self {
            client,
            db,
            senders: Mutex::new(HashMap::new()),
            transactions: true,
        })
    }

    /// For deployments without a replica set; batches then report
    /// unsupported and callers fall back to sequential writes.
    pub fn without_transactions(mut self) -> Self {
        self.transactions = false;
        self
    }
}

fn map_mongo_error(e: mongodb::error::Error) -> StoreError {
    use mongodb::error::ErrorKind;
    match e.kind.as_ref() {
        ErrorKind::Io(_) | ErrorKind::ServerSelection { .. } => {
            StoreError::Unavailable(e.to_string())
        }
        _ => StoreError::Backend(e.into()),
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        self.db
            .collection::<Document>(collection)
            .find_one(doc! { "_id": id }, None)
            .await
            .map_err(map_mongo_error)
    }

    async fn insert(&self, collection: &str, mut doc: Document) -> Result<String, StoreError> {
        let id = ensure_id(&mut doc);
        self.db
            .collection::<Document>(collection)
            .insert_one(doc, None)
            .await
            .map_err(map_mongo_error)?;
        Ok(id)
    }

    async fn update(&self, collection: &str, id: &str, patch: Document) -> Result<(), StoreError> {
        let result = self
            .db
            .collection::<Document>(collection)
            .update_one(doc! { "_id": id }, doc! { "$set": patch }, None)
            .await
            .map_err(map_mongo_error)?;

        if result.matched_count == 0 {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "document {id} missing in {collection}"
            )));
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        self.db
            .collection::<Document>(collection)
            .delete_one(doc! { "_id": id }, None)
            .await
            .map_err(map_mongo_error)?;
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        filters: &[Filter],
    ) -> Result<Vec<Document>, StoreError> {
        let mut filter = Document::new();
        for f in filters {
            filter.insert(f.field.clone(), f.value.clone());
        }

        let cursor = self
            .db
            .collection::<Document>(collection)
            .find(filter, None)
            .await
            .map_err(map_mongo_error)?;
        cursor.try_collect().await.map_err(map_mongo_error)
    }

    fn supports_batch(&self) -> bool {
        self.transactions
    }

    async fn commit_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        if !self.transactions {
            return Err(StoreError::BatchUnsupported);
        }

        let mut session = self
            .client
            .start_session(None)
            .await
            .map_err(map_mongo_error)?;
        session
            .start_transaction(None)
            .await
            .map_err(map_mongo_error)?;

        for op in ops {
            let result = match op {
                BatchOp::Insert {
                    collection,
                    mut doc,
                } => {
                    ensure_id(&mut doc);
                    self.db
                        .collection::<Document>(collection)
                        .insert_one_with_session(doc, None, &mut session)
                        .await
                        .map(|_| ())
                }
                BatchOp::Update {
                    collection,
                    id,
                    patch,
                } => self
                    .db
                    .collection::<Document>(collection)
                    .update_one_with_session(
                        doc! { "_id": &id },
                        doc! { "$set": patch },
                        None,
                        &mut session,
                    )
                    .await
                    .map(|_| ()),
                BatchOp::Delete { collection, id } => self
                    .db
                    .collection::<Document>(collection)
                    .delete_one_with_session(doc! { "_id": &id }, None, &mut session)
                    .await
                    .map(|_| ()),
            };

            if let Err(e) = result {
                if let Err(abort_err) = session.abort_transaction().await {
                    warn!(error = %abort_err, "failed to abort store transaction");
                }
                return Err(map_mongo_error(e));
            }
        }

        session.commit_transaction().await.map_err(map_mongo_error)
    }

    fn subscribe(&self, collection: &str) -> broadcast::Receiver<ChangeEvent> {
        let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = senders.get(collection) {
            return sender.subscribe();
        }

        let (sender, receiver) = broadcast::channel(EVENT_CAPACITY);
        senders.insert(collection.to_string(), sender.clone());

        let coll = self.db.collection::<Document>(collection);
        let name = collection.to_string();
        tokio::spawn(async move {
            let mut stream = match coll.watch(None, None).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(collection = %name, error = %e, "change stream unavailable");
                    return;
                }
            };

            while let Some(event) = stream.next().await {
                match event {
                    Ok(_) => {
                        let _ = sender.send(ChangeEvent {
                            collection: name.clone(),
                        });
                    }
                    Err(e) => {
                        warn!(collection = %name, error = %e, "change stream error, stopping watch");
                        break;
                    }
                }
            }
        });

        receiver
    }
}
