//! Schema for the PostgreSQL document store.

use diesel_async::SimpleAsyncConnection;

use crate::store::PgDocumentStore;

/// Creates the shared document relation. Safe to run repeatedly.
pub const MIGRATION_SQL: &str = r#"
-- ================================================================
-- ILM document store (one relation, one logical table per `tbl`)
-- ================================================================

CREATE TABLE IF NOT EXISTS ilm_documents (
    tbl             VARCHAR(32) NOT NULL,
    id              TEXT NOT NULL,
    body            JSONB NOT NULL,
    create_date     TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),
    PRIMARY KEY (tbl, id)
);

CREATE INDEX IF NOT EXISTS idx_ilm_documents_body ON ilm_documents USING GIN (body jsonb_path_ops);
CREATE INDEX IF NOT EXISTS idx_ilm_documents_project ON ilm_documents (tbl, (body ->> 'projectId'));
CREATE INDEX IF NOT EXISTS idx_ilm_documents_created ON ilm_documents (tbl, create_date);
"#;

/// Run the document store migration.
pub async fn run_migration(store: &PgDocumentStore) -> anyhow::Result<()> {
    let mut conn = store
        .pool()
        .get()
        .await
        .map_err(|e| anyhow::anyhow!("document pool: {e}"))?;
    conn.batch_execute(MIGRATION_SQL)
        .await
        .map_err(|e| anyhow::anyhow!("ILM migration failed: {e}"))?;
    Ok(())
}
