//! In-memory record store.
//!
//! Used when no `DATABASE_URL` is configured and by every test. Documents are
//! kept per table in insertion order; identities are UUIDv4 strings.
//! Faults can be scheduled per table and operation to exercise partial
//! cascades.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{Filter, InsertResponse, RecordStore, Table};
use crate::error::StoreError;

/// Store operation a fault can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Filter,
    Update,
    Delete,
}

#[derive(Debug)]
struct Fault {
    table: Table,
    op: Operation,
    /// Calls left before the fault fires (1 = the next call).
    countdown: usize,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<Table, Vec<Value>>>,
    faults: Mutex<Vec<Fault>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `nth` next `op` against `table` fail (1-based). Each fault
    /// fires once.
    pub fn fail_nth(&self, table: Table, op: Operation, nth: usize) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Fault {
                table,
                op,
                countdown: nth.max(1),
            });
    }

    /// Number of documents currently held by `table`.
    pub async fn len(&self, table: Table) -> usize {
        self.tables.read().await.get(&table).map_or(0, Vec::len)
    }

    fn check_fault(&self, table: Table, op: Operation) -> Result<(), StoreError> {
        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        // Faults on the same table and operation are consumed in order.
        let Some(idx) = faults.iter().position(|f| f.table == table && f.op == op) else {
            return Ok(());
        };
        faults[idx].countdown -= 1;
        if faults[idx].countdown > 0 {
            return Ok(());
        }
        faults.remove(idx);
        Err(StoreError::Query(format!("injected {op:?} fault on {table}")))
    }
}

fn compare_field(a: &Value, b: &Value, field: &str) -> Ordering {
    match (a.get(field), b.get(field)) {
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        // Missing or null fields sort first.
        (None | Some(Value::Null), Some(_)) => Ordering::Less,
        (Some(_), None | Some(Value::Null)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert(&self, table: Table, mut doc: Value) -> Result<InsertResponse, StoreError> {
        self.check_fault(table, Operation::Insert)?;
        let Some(map) = doc.as_object_mut() else {
            return Err(StoreError::Query(format!(
                "{table}: only JSON objects can be stored"
            )));
        };
        let id = uuid::Uuid::new_v4().to_string();
        map.insert("id".to_string(), Value::String(id.clone()));

        self.tables.write().await.entry(table).or_default().push(doc);
        Ok(InsertResponse {
            generated_keys: vec![id],
        })
    }

    async fn filter(&self, table: Table, filter: &Filter) -> Result<Vec<Value>, StoreError> {
        self.check_fault(table, Operation::Filter)?;
        let tables = self.tables.read().await;
        Ok(tables
            .get(&table)
            .map(|docs| docs.iter().filter(|doc| filter.matches(doc)).cloned().collect())
            .unwrap_or_default())
    }

    async fn update(&self, table: Table, filter: &Filter, patch: Value) -> Result<u64, StoreError> {
        self.check_fault(table, Operation::Update)?;
        let Value::Object(patch) = patch else {
            return Err(StoreError::Query(format!("{table}: update patch must be an object")));
        };
        let mut tables = self.tables.write().await;
        let mut matched = 0;
        for doc in tables.entry(table).or_default().iter_mut() {
            if !filter.matches(doc) {
                continue;
            }
            if let Some(map) = doc.as_object_mut() {
                for (key, value) in &patch {
                    if key != "id" {
                        map.insert(key.clone(), value.clone());
                    }
                }
            }
            matched += 1;
        }
        Ok(matched)
    }

    async fn upsert_element(
        &self,
        table: Table,
        filter: &Filter,
        field: &str,
        key: &[&str],
        element: Value,
    ) -> Result<u64, StoreError> {
        self.check_fault(table, Operation::Update)?;
        let pointer: String = key.iter().map(|k| format!("/{k}")).collect();
        let wanted = element.pointer(&pointer).cloned();

        let mut tables = self.tables.write().await;
        let mut matched = 0;
        for doc in tables.entry(table).or_default().iter_mut() {
            if !filter.matches(doc) {
                continue;
            }
            let Some(map) = doc.as_object_mut() else {
                continue;
            };
            let slot = map
                .entry(field.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if !slot.is_array() {
                *slot = Value::Array(Vec::new());
            }
            if let Value::Array(items) = slot {
                let existing = wanted.as_ref().and_then(|wanted| {
                    items
                        .iter()
                        .position(|item| item.pointer(&pointer) == Some(wanted))
                });
                match existing {
                    Some(idx) => items[idx] = element.clone(),
                    None => items.push(element.clone()),
                }
            }
            matched += 1;
        }
        Ok(matched)
    }

    async fn delete(&self, table: Table, filter: &Filter) -> Result<u64, StoreError> {
        self.check_fault(table, Operation::Delete)?;
        let mut tables = self.tables.write().await;
        let docs = tables.entry(table).or_default();
        let before = docs.len();
        docs.retain(|doc| !filter.matches(doc));
        Ok((before - docs.len()) as u64)
    }

    async fn order_by(
        &self,
        table: Table,
        field: &str,
        ascending: bool,
    ) -> Result<Vec<Value>, StoreError> {
        self.check_fault(table, Operation::Filter)?;
        let mut docs = self.tables.read().await.get(&table).cloned().unwrap_or_default();
        docs.sort_by(|a, b| {
            let ord = compare_field(a, b, field);
            if ascending {
                ord
            } else {
                ord.reverse()
            }
        });
        Ok(docs)
    }
}
