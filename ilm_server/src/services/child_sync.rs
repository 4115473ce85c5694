//! Parent/child bookkeeping for project images and tests.
//!
//! Children carry their owner in `projectId`; the project keeps a parallel id
//! list (`imageids`/`testids`). The store offers no diffing primitive, so a
//! rewritten child list is reconciled by replace-all: every existing child of
//! the parent is deleted and the desired list is inserted fresh. Each
//! delete/insert stands alone; a failure is recorded and the pass continues.
//! Nothing is undone, and unchanged children come back with new identities.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;

use crate::error::{ManagerError, ManagerResult, StoreError};
use crate::models::image::Image;
use crate::models::project::Project;
use crate::models::test::Test;
use crate::services::identity::insert_with_identity;
use crate::store::{fetch_all, fetch_one, to_document, Filter, RecordStore, Table};

/// Field holding the parent reference on every child document.
pub const PARENT_FIELD: &str = "projectId";

/// Which id list on the project indexes a child collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildIndex {
    Images,
    Tests,
}

impl ChildIndex {
    pub fn field(&self) -> &'static str {
        match self {
            ChildIndex::Images => "imageids",
            ChildIndex::Tests => "testids",
        }
    }

    pub fn collection(&self) -> &'static str {
        match self {
            ChildIndex::Images => "images",
            ChildIndex::Tests => "tests",
        }
    }

    pub fn ids<'a>(&self, project: &'a Project) -> &'a Vec<String> {
        match self {
            ChildIndex::Images => &project.image_ids,
            ChildIndex::Tests => &project.test_ids,
        }
    }

    fn ids_mut<'a>(&self, project: &'a mut Project) -> &'a mut Vec<String> {
        match self {
            ChildIndex::Images => &mut project.image_ids,
            ChildIndex::Tests => &mut project.test_ids,
        }
    }
}

/// A record owned by a project.
pub trait ChildRecord: Serialize + DeserializeOwned + Send + Sync {
    const TABLE: Table;
    const INDEX: ChildIndex;

    fn id(&self) -> Option<&str>;
    fn set_id(&mut self, id: Option<String>);
    fn project_id(&self) -> &str;
    fn set_project_id(&mut self, project_id: &str);
}

impl ChildRecord for Image {
    const TABLE: Table = Table::Images;
    const INDEX: ChildIndex = ChildIndex::Images;

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn set_id(&mut self, id: Option<String>) {
        self.id = id;
    }

    fn project_id(&self) -> &str {
        &self.project_id
    }

    fn set_project_id(&mut self, project_id: &str) {
        self.project_id = project_id.to_string();
    }
}

impl ChildRecord for Test {
    const TABLE: Table = Table::Tests;
    const INDEX: ChildIndex = ChildIndex::Tests;

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn set_id(&mut self, id: Option<String>) {
        self.id = id;
    }

    fn project_id(&self) -> &str {
        &self.project_id
    }

    fn set_project_id(&mut self, project_id: &str) {
        self.project_id = project_id.to_string();
    }
}

/// Outcome of one pass over a child collection.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub collection: &'static str,
    pub removed: usize,
    /// Identities of the children now persisted, in desired-list order.
    pub inserted: Vec<String>,
    pub failures: Vec<StoreError>,
}

impl SyncReport {
    pub fn new(index: ChildIndex) -> Self {
        Self {
            collection: index.collection(),
            ..Self::default()
        }
    }

    /// A pass that could not start because the existing children could not
    /// be read. Nothing was changed; `current` are still the live children.
    pub fn unreadable(
        index: ChildIndex,
        parent_id: &str,
        current: &[String],
        err: StoreError,
    ) -> Self {
        let mut report = Self::new(index);
        report.inserted = current.to_vec();
        report.record_failure(parent_id, "read", err);
        report
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn record_failure(&mut self, parent_id: &str, action: &str, err: StoreError) {
        tracing::warn!(
            project_id = %parent_id,
            collection = self.collection,
            action,
            "Child cascade step failed: {err}"
        );
        crate::metrics::cascade_failure(self.collection);
        self.failures.push(err);
    }
}

/// Fold reports into a single `ChildCollection` error carrying the first
/// failure encountered, or `None` if every step succeeded.
pub fn collection_error(parent_id: &str, reports: Vec<SyncReport>) -> Option<ManagerError> {
    let failed = reports.iter().map(|r| r.failures.len()).sum();
    let (collection, first) = reports
        .into_iter()
        .find_map(|r| r.failures.into_iter().next().map(|e| (r.collection, e)))?;
    Some(ManagerError::ChildCollection {
        parent: parent_id.to_string(),
        collection,
        failed,
        first: Box::new(first),
    })
}

/// A store failure while maintaining the parent's id list happens after the
/// child write already succeeded, so it is reported as a cascade failure.
pub fn index_error(parent_id: &str, index: ChildIndex, err: ManagerError) -> ManagerError {
    match err {
        ManagerError::Store(e) => {
            crate::metrics::cascade_failure(index.collection());
            ManagerError::ChildCollection {
                parent: parent_id.to_string(),
                collection: index.collection(),
                failed: 1,
                first: Box::new(e),
            }
        }
        other => other,
    }
}

/// Children whose parent reference is `parent_id` (reverse lookup).
pub async fn read_children<C: ChildRecord>(
    store: &dyn RecordStore,
    parent_id: &str,
) -> Result<Vec<C>, StoreError> {
    fetch_all(store, C::TABLE, &Filter::eq(PARENT_FIELD, parent_id)).await
}

/// Delete every child of `parent_id`, one record at a time.
pub async fn delete_children<C: ChildRecord>(
    store: &dyn RecordStore,
    parent_id: &str,
) -> Result<SyncReport, StoreError> {
    let existing = store
        .filter(C::TABLE, &Filter::eq(PARENT_FIELD, parent_id))
        .await?;

    let mut report = SyncReport::new(C::INDEX);
    for doc in existing {
        let Some(child_id) = doc.get("id").and_then(|v| v.as_str()) else {
            continue;
        };
        match store.delete(C::TABLE, &Filter::by_id(child_id)).await {
            Ok(removed) => report.removed += removed as usize,
            Err(e) => report.record_failure(parent_id, "delete", e),
        }
    }
    Ok(report)
}

/// Stamp `parent_id` onto each child and insert it. On success the child's
/// identity is replaced by the store-generated one; on failure it is cleared.
pub async fn insert_children<C: ChildRecord>(
    store: &dyn RecordStore,
    parent_id: &str,
    desired: &mut [C],
) -> SyncReport {
    let mut report = SyncReport::new(C::INDEX);
    for child in desired.iter_mut() {
        child.set_project_id(parent_id);
        let inserted = match to_document(child) {
            Ok(doc) => insert_with_identity(store, C::TABLE, doc).await,
            Err(e) => Err(e),
        };
        match inserted {
            Ok(id) => {
                child.set_id(Some(id.clone()));
                report.inserted.push(id);
            }
            Err(e) => {
                child.set_id(None);
                report.record_failure(parent_id, "insert", e);
            }
        }
    }
    report
}

/// Replace-all reconciliation of one child collection.
///
/// Fails only if the initial read of the existing children fails; every
/// later step is independent and reported through [`SyncReport::failures`].
pub async fn replace_all<C: ChildRecord>(
    store: &dyn RecordStore,
    parent_id: &str,
    desired: &mut [C],
) -> Result<SyncReport, StoreError> {
    let mut report = delete_children::<C>(store, parent_id).await?;
    let inserted = insert_children(store, parent_id, desired).await;
    report.inserted = inserted.inserted;
    report.failures.extend(inserted.failures);

    crate::metrics::child_sync_records(report.collection, report.removed + report.inserted.len());
    tracing::debug!(
        project_id = %parent_id,
        collection = report.collection,
        removed = report.removed,
        inserted = report.inserted.len(),
        "Child collection replaced"
    );
    Ok(report)
}

/// Add `child_id` to the project's id list unless already present.
/// Read-modify-write on the parent; not atomic with the child write.
pub async fn link_child(
    store: &dyn RecordStore,
    index: ChildIndex,
    project_id: &str,
    child_id: &str,
) -> ManagerResult<bool> {
    let mut project: Project = fetch_one(store, Table::Projects, &Filter::by_id(project_id))
        .await?
        .ok_or_else(|| ManagerError::not_found("project", project_id))?;

    let ids = index.ids_mut(&mut project);
    if ids.iter().any(|id| id == child_id) {
        return Ok(false);
    }
    ids.push(child_id.to_string());
    write_index(store, index, project_id, ids).await?;
    Ok(true)
}

/// Remove `child_id` from the project's id list. Returns `false` when the
/// project is gone or did not list the child.
pub async fn unlink_child(
    store: &dyn RecordStore,
    index: ChildIndex,
    project_id: &str,
    child_id: &str,
) -> ManagerResult<bool> {
    let Some(mut project) =
        fetch_one::<Project>(store, Table::Projects, &Filter::by_id(project_id)).await?
    else {
        return Ok(false);
    };

    let ids = index.ids_mut(&mut project);
    let before = ids.len();
    ids.retain(|id| id != child_id);
    if ids.len() == before {
        return Ok(false);
    }
    write_index(store, index, project_id, ids).await?;
    Ok(true)
}

async fn write_index(
    store: &dyn RecordStore,
    index: ChildIndex,
    project_id: &str,
    ids: &[String],
) -> Result<(), StoreError> {
    let mut patch = serde_json::Map::new();
    patch.insert(index.field().to_string(), json!(ids));
    store
        .update(Table::Projects, &Filter::by_id(project_id), patch.into())
        .await?;
    Ok(())
}
