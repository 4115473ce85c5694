//! PostgreSQL-backed document store.
//!
//! All tables share one `ilm_documents` relation keyed by `(tbl, id)` with
//! the record in a JSONB `body`. Filters use containment (`@>`), updates use
//! top-level merge (`||`), and array upserts rebuild the array inside a
//! single `UPDATE`. Each call runs on its own pooled connection, so
//! multi-document writes are as non-atomic as with any other backend.

use async_trait::async_trait;
use diesel::sql_types::{Array, Jsonb, Text};
use diesel::QueryableByName;
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde_json::Value;

use super::{Filter, InsertResponse, RecordStore, Table};
use crate::error::StoreError;

pub type DocumentPool = Pool<AsyncPgConnection>;

#[derive(Debug, QueryableByName)]
struct DocumentRow {
    #[diesel(sql_type = Jsonb)]
    body: Value,
}

#[derive(Debug, QueryableByName)]
struct IdRow {
    #[diesel(sql_type = Text)]
    id: String,
}

#[derive(Clone)]
pub struct PgDocumentStore {
    pool: DocumentPool,
}

impl PgDocumentStore {
    /// Open a pool against `database_url`. Connections are established lazily.
    pub fn connect(database_url: &str, max_size: usize) -> Result<Self, StoreError> {
        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = Pool::builder(manager)
            .max_size(max_size)
            .build()
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &DocumentPool {
        &self.pool
    }

    /// Close the pool; in-flight connections are dropped when returned.
    pub fn close(&self) {
        self.pool.close();
    }

    async fn conn(&self) -> Result<Object<AsyncPgConnection>, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(format!("document pool: {e}")))
    }
}

/// Field names are interpolated into `ORDER BY`, so only plain identifiers
/// are accepted.
fn checked_field(field: &str) -> Result<&str, StoreError> {
    if !field.is_empty() && field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(field)
    } else {
        Err(StoreError::Query(format!("invalid order field: {field:?}")))
    }
}

#[async_trait]
impl RecordStore for PgDocumentStore {
    async fn insert(&self, table: Table, doc: Value) -> Result<InsertResponse, StoreError> {
        let mut conn = self.conn().await?;
        let rows: Vec<IdRow> = diesel::sql_query(
            "INSERT INTO ilm_documents (tbl, id, body) \
             SELECT $1, generated.new_id, jsonb_set($2::jsonb - 'id', '{id}', to_jsonb(generated.new_id)) \
             FROM (SELECT gen_random_uuid()::text AS new_id) AS generated \
             RETURNING id",
        )
        .bind::<Text, _>(table.as_str())
        .bind::<Jsonb, _>(doc)
        .load(&mut *conn)
        .await?;

        Ok(InsertResponse {
            generated_keys: rows.into_iter().map(|row| row.id).collect(),
        })
    }

    async fn filter(&self, table: Table, filter: &Filter) -> Result<Vec<Value>, StoreError> {
        let mut conn = self.conn().await?;
        let rows: Vec<DocumentRow> = diesel::sql_query(
            "SELECT body FROM ilm_documents \
             WHERE tbl = $1 AND body @> $2::jsonb \
             ORDER BY create_date ASC, id ASC",
        )
        .bind::<Text, _>(table.as_str())
        .bind::<Jsonb, _>(filter.to_value())
        .load(&mut *conn)
        .await?;
        Ok(rows.into_iter().map(|row| row.body).collect())
    }

    async fn update(&self, table: Table, filter: &Filter, patch: Value) -> Result<u64, StoreError> {
        if !patch.is_object() {
            return Err(StoreError::Query(format!("{table}: update patch must be an object")));
        }
        let mut conn = self.conn().await?;
        let matched = diesel::sql_query(
            "UPDATE ilm_documents SET body = body || ($3::jsonb - 'id') \
             WHERE tbl = $1 AND body @> $2::jsonb",
        )
        .bind::<Text, _>(table.as_str())
        .bind::<Jsonb, _>(filter.to_value())
        .bind::<Jsonb, _>(patch)
        .execute(&mut *conn)
        .await?;
        Ok(matched as u64)
    }

    async fn upsert_element(
        &self,
        table: Table,
        filter: &Filter,
        field: &str,
        key: &[&str],
        element: Value,
    ) -> Result<u64, StoreError> {
        let mut conn = self.conn().await?;
        // Row-level UPDATE: concurrent callers serialize on the row lock and
        // each recomputes the array from the latest committed body.
        let matched = diesel::sql_query(
            "UPDATE ilm_documents SET body = jsonb_set(body, ARRAY[$3::text], ( \
                 SELECT CASE \
                     WHEN bool_or(existing.elem #> $4::text[] = $5::jsonb #> $4::text[]) \
                     THEN jsonb_agg(CASE WHEN existing.elem #> $4::text[] = $5::jsonb #> $4::text[] \
                                         THEN $5::jsonb ELSE existing.elem END \
                                    ORDER BY existing.pos) \
                     ELSE COALESCE(jsonb_agg(existing.elem ORDER BY existing.pos), '[]'::jsonb) \
                          || jsonb_build_array($5::jsonb) \
                 END \
                 FROM jsonb_array_elements( \
                     CASE WHEN jsonb_typeof(body -> $3::text) = 'array' \
                          THEN body -> $3::text ELSE '[]'::jsonb END \
                 ) WITH ORDINALITY AS existing(elem, pos) \
             )) \
             WHERE tbl = $1 AND body @> $2::jsonb",
        )
        .bind::<Text, _>(table.as_str())
        .bind::<Jsonb, _>(filter.to_value())
        .bind::<Text, _>(field)
        .bind::<Array<Text>, _>(key.iter().map(|k| k.to_string()).collect::<Vec<_>>())
        .bind::<Jsonb, _>(element)
        .execute(&mut *conn)
        .await?;
        Ok(matched as u64)
    }

    async fn delete(&self, table: Table, filter: &Filter) -> Result<u64, StoreError> {
        let mut conn = self.conn().await?;
        let removed = diesel::sql_query(
            "DELETE FROM ilm_documents WHERE tbl = $1 AND body @> $2::jsonb",
        )
        .bind::<Text, _>(table.as_str())
        .bind::<Jsonb, _>(filter.to_value())
        .execute(&mut *conn)
        .await?;
        Ok(removed as u64)
    }

    async fn order_by(
        &self,
        table: Table,
        field: &str,
        ascending: bool,
    ) -> Result<Vec<Value>, StoreError> {
        let field = checked_field(field)?;
        let direction = if ascending { "ASC" } else { "DESC" };
        let mut conn = self.conn().await?;
        let rows: Vec<DocumentRow> = diesel::sql_query(format!(
            "SELECT body FROM ilm_documents WHERE tbl = $1 \
             ORDER BY body ->> '{field}' {direction} NULLS FIRST, create_date ASC"
        ))
        .bind::<Text, _>(table.as_str())
        .load(&mut *conn)
        .await?;
        Ok(rows.into_iter().map(|row| row.body).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_field_must_be_an_identifier() {
        assert!(checked_field("creationTime").is_ok());
        assert!(checked_field("creation_time").is_ok());
        assert!(checked_field("").is_err());
        assert!(checked_field("x'; DROP TABLE ilm_documents; --").is_err());
    }
}
