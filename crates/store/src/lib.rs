pub mod connection;
pub mod documents;
pub mod errors;
pub mod kv;
pub mod migrations;

pub use connection::{connect, connect_from_config, connect_with_settings, DbPool};
pub use documents::{
    Collection, Document, DocumentChange, FieldFilter, InMemoryDocumentStore, SourceOfRecord,
    SqlDocumentStore,
};
pub use errors::StoreError;
pub use kv::{
    connect_key_value_store, KeyValueStore, LocalKeyValueStore, LockLease, RedisKeyValueStore,
};
