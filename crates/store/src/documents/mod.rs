use std::fmt;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::errors::StoreError;

pub mod memory;
pub mod sql;

pub use memory::InMemoryDocumentStore;
pub use sql::SqlDocumentStore;

pub type Document = Map<String, Value>;

/// Durable collections the coordination layer reads and writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Collection {
    /// One document per tenant holding OAuth tokens and installation metadata.
    Installations,
    /// One document per tenant domain holding client credentials and overrides.
    Secrets,
    /// Shared settings; the `ai` document carries defaults for every tenant.
    Settings,
    /// Agent definitions, queried by `tenantId` and `isActive`.
    Agents,
}

impl Collection {
    pub const ALL: [Collection; 4] =
        [Collection::Installations, Collection::Secrets, Collection::Settings, Collection::Agents];

    pub fn base_name(self) -> &'static str {
        match self {
            Self::Installations => "installations",
            Self::Secrets => "secrets",
            Self::Settings => "settings",
            Self::Agents => "agents",
        }
    }

    pub fn qualified_name(self, prefix: &str) -> String {
        format!("{prefix}{}", self.base_name())
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.base_name())
    }
}

/// Top-level field equality used by [`SourceOfRecord::query_one`].
#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    pub field: String,
    pub equals: Value,
}

impl FieldFilter {
    pub fn new(field: impl Into<String>, equals: impl Into<Value>) -> Self {
        Self { field: field.into(), equals: equals.into() }
    }

    pub fn matches(&self, document: &Document) -> bool {
        document.get(&self.field).unwrap_or(&Value::Null) == &self.equals
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocumentChange {
    pub collection: Collection,
    pub id: String,
}

/// Durable document database. The only durable home for tenant tokens.
#[async_trait]
pub trait SourceOfRecord: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn get_document(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<Document>, StoreError>;

    /// Creates or replaces the whole document.
    async fn set_document(
        &self,
        collection: Collection,
        id: &str,
        document: Document,
    ) -> Result<(), StoreError>;

    /// Merges top-level fields into an existing document. A `null` value removes the
    /// field; any other value, nested objects included, replaces it whole.
    async fn update_document(
        &self,
        collection: Collection,
        id: &str,
        fields: Document,
    ) -> Result<(), StoreError>;

    async fn delete_document(&self, collection: Collection, id: &str) -> Result<(), StoreError>;

    /// Most recently updated document matching every filter.
    async fn query_one(
        &self,
        collection: Collection,
        filters: &[FieldFilter],
    ) -> Result<Option<(String, Document)>, StoreError>;

    /// Streams changes to `collection` made after the call. The feed ends when
    /// the receiver is dropped.
    async fn subscribe(
        &self,
        collection: Collection,
    ) -> Result<mpsc::Receiver<DocumentChange>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

pub(crate) fn merge_fields(target: &mut Document, fields: Document) {
    for (key, value) in fields {
        if value.is_null() {
            target.remove(&key);
        } else {
            target.insert(key, value);
        }
    }
}
