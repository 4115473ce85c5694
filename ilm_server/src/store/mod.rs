//! Record store adapter — per-table document operations without
//! cross-record transactions.
//!
//! Every manager receives an explicit `Arc<dyn RecordStore>` handle; there is
//! no process-wide session.

pub mod memory;
pub mod postgres;

use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::StoreError;

pub use memory::MemoryStore;
pub use postgres::PgDocumentStore;

/// Entity tables known to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Projects,
    Images,
    Tests,
    Builds,
    Registries,
    Events,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Projects => "projects",
            Table::Images => "images",
            Table::Tests => "tests",
            Table::Builds => "builds",
            Table::Registries => "registries",
            Table::Events => "events",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conjunction of top-level field equalities. An empty filter matches every
/// document in the table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter(Map<String, Value>);

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: &str) -> Self {
        Self::eq("id", id)
    }

    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self::default().and(field, value)
    }

    pub fn and(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.0.insert(field.to_string(), value.into());
        self
    }

    pub fn matches(&self, doc: &Value) -> bool {
        self.0.iter().all(|(field, expected)| doc.get(field) == Some(expected))
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

/// Acknowledgement of an insert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertResponse {
    pub generated_keys: Vec<String>,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert one document. Any `id` in `doc` is ignored; the store generates it.
    async fn insert(&self, table: Table, doc: Value) -> Result<InsertResponse, StoreError>;

    /// All documents matching `filter`, in insertion order.
    async fn filter(&self, table: Table, filter: &Filter) -> Result<Vec<Value>, StoreError>;

    /// Merge the top-level keys of `patch` into every matching document.
    /// Returns the number of documents matched.
    async fn update(&self, table: Table, filter: &Filter, patch: Value) -> Result<u64, StoreError>;

    /// In every matching document, replace the element of array `field`
    /// whose value at the object path `key` equals that of `element`, or
    /// append `element` if none does. Each document is rewritten in one step,
    /// so concurrent calls on the same record never lose an element.
    /// Returns the number of documents matched.
    async fn upsert_element(
        &self,
        table: Table,
        filter: &Filter,
        field: &str,
        key: &[&str],
        element: Value,
    ) -> Result<u64, StoreError>;

    /// Delete every matching document. Returns the number removed.
    async fn delete(&self, table: Table, filter: &Filter) -> Result<u64, StoreError>;

    /// Every document in the table ordered by one top-level field.
    async fn order_by(
        &self,
        table: Table,
        field: &str,
        ascending: bool,
    ) -> Result<Vec<Value>, StoreError>;
}

/// Serialize a record into its stored form. The identity is owned by the
/// store and never written from the client side.
pub fn to_document<T: Serialize>(record: &T) -> Result<Value, StoreError> {
    let mut doc = serde_json::to_value(record)?;
    if let Some(map) = doc.as_object_mut() {
        map.remove("id");
    }
    Ok(doc)
}

pub fn from_document<T: DeserializeOwned>(doc: Value) -> Result<T, StoreError> {
    Ok(serde_json::from_value(doc)?)
}

/// First document matching `filter`, decoded.
pub async fn fetch_one<T: DeserializeOwned>(
    store: &dyn RecordStore,
    table: Table,
    filter: &Filter,
) -> Result<Option<T>, StoreError> {
    store
        .filter(table, filter)
        .await?
        .into_iter()
        .next()
        .map(from_document)
        .transpose()
}

pub async fn fetch_all<T: DeserializeOwned>(
    store: &dyn RecordStore,
    table: Table,
    filter: &Filter,
) -> Result<Vec<T>, StoreError> {
    store
        .filter(table, filter)
        .await?
        .into_iter()
        .map(from_document)
        .collect()
}
