//! Identity allocation for inserted records.

use serde_json::Value;

use crate::error::StoreError;
use crate::store::{InsertResponse, RecordStore, Table};

/// Identity assigned by the store for an insert, or `None` if the store
/// reported no generated key. Never fabricated on the client side.
pub fn allocate(response: &InsertResponse) -> Option<String> {
    response
        .generated_keys
        .first()
        .filter(|key| !key.is_empty())
        .cloned()
}

/// Insert `doc` and return its identity. A missing identity is an insert
/// failure: callers must not go on to write dependents.
pub async fn insert_with_identity(
    store: &dyn RecordStore,
    table: Table,
    doc: Value,
) -> Result<String, StoreError> {
    let response = store.insert(table, doc).await?;
    allocate(&response).ok_or(StoreError::NoGeneratedKey { table })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn takes_first_generated_key() {
        let response = InsertResponse {
            generated_keys: vec!["a".into(), "b".into()],
        };
        assert_eq!(allocate(&response).as_deref(), Some("a"));
    }

    #[test]
    fn empty_response_yields_no_identity() {
        assert_eq!(allocate(&InsertResponse::default()), None);
        let blank = InsertResponse {
            generated_keys: vec![String::new()],
        };
        assert_eq!(allocate(&blank), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_inserts_never_share_an_identity() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for n in 0..64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                insert_with_identity(&*store, Table::Projects, serde_json::json!({"name": n}))
                    .await
            }));
        }

        let mut ids = HashSet::new();
        for handle in handles {
            let id = handle.await.unwrap().unwrap();
            assert!(ids.insert(id));
        }
        assert_eq!(ids.len(), 64);
    }
}
