use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::warn;

use super::{merge_fields, Collection, Document, DocumentChange, FieldFilter, SourceOfRecord};
use crate::errors::StoreError;

const CHANGE_BUFFER: usize = 256;

#[derive(Clone, Debug)]
struct StoredDocument {
    body: Document,
    revision: u64,
}

#[derive(Debug, Default)]
struct State {
    documents: HashMap<(Collection, String), StoredDocument>,
    revision: u64,
}

/// In-process source of record with a live change feed.
pub struct InMemoryDocumentStore {
    state: RwLock<State>,
    changes: broadcast::Sender<DocumentChange>,
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self { state: RwLock::new(State::default()), changes }
    }
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn publish(&self, collection: Collection, id: &str) {
        // No subscribers is fine.
        let _ = self.changes.send(DocumentChange { collection, id: id.to_string() });
    }
}

#[async_trait]
impl SourceOfRecord for InMemoryDocumentStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get_document(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<Document>, StoreError> {
        let state = self.state.read().await;
        Ok(state.documents.get(&(collection, id.to_string())).map(|stored| stored.body.clone()))
    }

    async fn set_document(
        &self,
        collection: Collection,
        id: &str,
        document: Document,
    ) -> Result<(), StoreError> {
        {
            let mut state = self.state.write().await;
            state.revision += 1;
            let revision = state.revision;
            state
                .documents
                .insert((collection, id.to_string()), StoredDocument { body: document, revision });
        }
        self.publish(collection, id);
        Ok(())
    }

    async fn update_document(
        &self,
        collection: Collection,
        id: &str,
        fields: Document,
    ) -> Result<(), StoreError> {
        {
            let mut state = self.state.write().await;
            state.revision += 1;
            let revision = state.revision;
            let stored = state.documents.get_mut(&(collection, id.to_string())).ok_or_else(|| {
                StoreError::NotFound { collection: collection.to_string(), id: id.to_string() }
            })?;
            merge_fields(&mut stored.body, fields);
            stored.revision = revision;
        }
        self.publish(collection, id);
        Ok(())
    }

    async fn delete_document(&self, collection: Collection, id: &str) -> Result<(), StoreError> {
        let removed = self.state.write().await.documents.remove(&(collection, id.to_string()));
        if removed.is_some() {
            self.publish(collection, id);
        }
        Ok(())
    }

    async fn query_one(
        &self,
        collection: Collection,
        filters: &[FieldFilter],
    ) -> Result<Option<(String, Document)>, StoreError> {
        let state = self.state.read().await;
        let found = state
            .documents
            .iter()
            .filter(|((stored_collection, _), _)| *stored_collection == collection)
            .filter(|(_, stored)| filters.iter().all(|filter| filter.matches(&stored.body)))
            .max_by_key(|(_, stored)| stored.revision)
            .map(|((_, id), stored)| (id.clone(), stored.body.clone()));
        Ok(found)
    }

    async fn subscribe(
        &self,
        collection: Collection,
    ) -> Result<mpsc::Receiver<DocumentChange>, StoreError> {
        let mut changes = self.changes.subscribe();
        let (sender, receiver) = mpsc::channel(CHANGE_BUFFER);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sender.closed() => break,
                    received = changes.recv() => match received {
                        Ok(change) if change.collection == collection => {
                            if sender.send(change).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(
                                event_name = "store.documents.watch_lagged",
                                collection = %collection,
                                skipped,
                                "document watcher fell behind; some changes were dropped"
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(receiver)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
