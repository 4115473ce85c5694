//! Project CRUD with cascades to the project's images and tests.
//!
//! Writes are ordered parent-first so the parent identity can be stamped on
//! the children. None of the multi-record sequences are atomic: a failed
//! child step is reported as [`ManagerError::ChildCollection`] and the parent
//! record is left as written.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use crate::audit::{AuditEmitter, SECURITY_TAG};
use crate::error::{ManagerError, ManagerResult, StoreError};
use crate::models::image::Image;
use crate::models::project::{Project, ProjectActionStatus, PROJECT_STATUS_NEW};
use crate::models::test::Test;
use crate::models::timestamp;
use crate::services::child_sync::{self, ChildRecord};
use crate::services::identity::insert_with_identity;
use crate::store::{fetch_one, from_document, Filter, RecordStore, Table};

pub struct ProjectService {
    store: Arc<dyn RecordStore>,
    audit: AuditEmitter,
    author: String,
    updater: String,
}

impl ProjectService {
    pub fn new(store: Arc<dyn RecordStore>, audit: AuditEmitter) -> Self {
        Self {
            store,
            audit,
            author: "author".to_string(),
            updater: "updater".to_string(),
        }
    }

    /// Names stamped into `author` on save and `updatedBy` on update.
    pub fn with_identities(mut self, author: impl Into<String>, updater: impl Into<String>) -> Self {
        self.author = author.into();
        self.updater = updater.into();
        self
    }

    /// All projects by creation time, without embedded images or tests.
    pub async fn list(&self) -> ManagerResult<Vec<Project>> {
        let docs = self
            .store
            .order_by(Table::Projects, "creationTime", true)
            .await?;
        let projects = docs
            .into_iter()
            .map(from_document)
            .collect::<Result<Vec<Project>, _>>()?;
        Ok(projects)
    }

    /// The project with its images and tests, resolved through its id lists.
    /// Ids without a backing record are skipped.
    pub async fn get(&self, id: &str) -> ManagerResult<Project> {
        let mut project = self
            .find(id)
            .await?
            .ok_or_else(|| ManagerError::not_found("project", id))?;

        project.images = self.resolve::<Image>(&project.image_ids).await?;
        project.tests = self.resolve::<Test>(&project.test_ids).await?;
        Ok(project)
    }

    /// Insert a new project and then each of its images and tests.
    ///
    /// On return `project.id` and the children's ids hold the store-assigned
    /// identities, including when a child insert failed.
    pub async fn save(&self, project: &mut Project) -> ManagerResult<String> {
        if let Some(existing) = project.id.as_deref().filter(|id| !id.is_empty()) {
            if self.find(existing).await?.is_some() {
                return Err(ManagerError::AlreadyExists {
                    kind: "project",
                    id: existing.to_string(),
                });
            }
        }

        let now = Utc::now();
        project.creation_time = Some(now);
        project.update_time = Some(now);
        project.action_status = ProjectActionStatus::New;
        project.status = PROJECT_STATUS_NEW.to_string();
        project.author = self.author.clone();
        project.image_ids.clear();
        project.test_ids.clear();

        let doc = project.document().map_err(StoreError::from)?;
        let id = insert_with_identity(&*self.store, Table::Projects, doc).await?;
        project.id = Some(id.clone());

        let mut images = child_sync::insert_children(&*self.store, &id, &mut project.images).await;
        let tests = child_sync::insert_children(&*self.store, &id, &mut project.tests).await;
        project.image_ids = images.inserted.clone();
        project.test_ids = tests.inserted.clone();

        let linked = self
            .store
            .update(
                Table::Projects,
                &Filter::by_id(&id),
                json!({ "imageids": project.image_ids, "testids": project.test_ids }),
            )
            .await;
        if let Err(e) = linked {
            // Children are persisted but unlisted.
            images.record_failure(&id, "index", e);
        }

        self.audit.log_event(
            "add-project",
            format!("id={}, name={}", id, project.name),
            &[SECURITY_TAG],
        );
        tracing::info!(
            project_id = %id,
            images = project.image_ids.len(),
            tests = project.test_ids.len(),
            "Project saved"
        );

        match child_sync::collection_error(&id, vec![images, tests]) {
            Some(err) => Err(err),
            None => Ok(id),
        }
    }

    /// Overwrite the project's scalar fields and replace its image and test
    /// collections with `project.images`/`project.tests`.
    ///
    /// An unknown identity is ignored so retrying callers stay idempotent.
    /// Children come back with new identities even when unchanged. Once the
    /// scalar write has landed every later step runs, the id lists are
    /// rewritten from what actually persisted, and the update is audited.
    pub async fn update(&self, project: &mut Project) -> ManagerResult<()> {
        let Some(id) = project.id.clone() else {
            return Ok(());
        };
        let Some(mut stored) = self.find(&id).await? else {
            tracing::debug!(project_id = %id, "Update of unknown project ignored");
            return Ok(());
        };

        stored.name = project.name.clone();
        stored.description = project.description.clone();
        stored.status = project.status.clone();
        stored.action_status = project.action_status;
        stored.needs_build = project.needs_build;
        self.store
            .update(
                Table::Projects,
                &Filter::by_id(&id),
                json!({
                    "name": stored.name,
                    "description": stored.description,
                    "status": stored.status,
                    "actionStatus": stored.action_status,
                    "needsBuild": stored.needs_build,
                }),
            )
            .await?;

        let mut images = self
            .replace_children(&id, &stored.image_ids, &mut project.images)
            .await;
        let tests = self
            .replace_children(&id, &stored.test_ids, &mut project.tests)
            .await;

        stored.image_ids = images.inserted.clone();
        stored.test_ids = tests.inserted.clone();
        let now = Utc::now();
        stored.updated_by = self.updater.clone();
        stored.update_time = Some(now);
        let indexed = self
            .store
            .update(
                Table::Projects,
                &Filter::by_id(&id),
                json!({
                    "imageids": stored.image_ids,
                    "testids": stored.test_ids,
                    "updatedBy": stored.updated_by,
                    "updateTime": timestamp::format(&now),
                }),
            )
            .await;
        if let Err(e) = indexed {
            images.record_failure(&id, "index", e);
        }

        stored.images = std::mem::take(&mut project.images);
        stored.tests = std::mem::take(&mut project.tests);
        *project = stored;

        self.audit.log_event(
            "update-project",
            format!("id={}, name={}", id, project.name),
            &[SECURITY_TAG],
        );
        tracing::info!(project_id = %id, "Project updated");

        match child_sync::collection_error(&id, vec![images, tests]) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Delete the project, then every image and test that references it.
    /// Child deletes are best-effort; the project is already gone when a
    /// `ChildCollection` error is returned.
    pub async fn delete(&self, project: &Project) -> ManagerResult<()> {
        let id = project.id.as_deref().unwrap_or_default();
        let removed = self.store.delete(Table::Projects, &Filter::by_id(id)).await?;
        if removed == 0 {
            return Err(ManagerError::not_found("project", id));
        }

        let mut reports = Vec::with_capacity(2);
        reports.push(self.cascade_delete::<Image>(id).await);
        reports.push(self.cascade_delete::<Test>(id).await);

        self.audit.log_event(
            "delete-project",
            format!("id={}, name={}", id, project.name),
            &[SECURITY_TAG],
        );
        tracing::info!(project_id = %id, "Project deleted");

        match child_sync::collection_error(id, reports) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Remove every project record. Images and tests are left untouched.
    pub async fn delete_all(&self) -> ManagerResult<()> {
        let removed = self.store.delete(Table::Projects, &Filter::all()).await?;
        tracing::info!(removed, "All projects deleted");
        Ok(())
    }

    /// The bare project record, without children.
    pub(crate) async fn find(&self, id: &str) -> ManagerResult<Option<Project>> {
        Ok(fetch_one(&*self.store, Table::Projects, &Filter::by_id(id)).await?)
    }

    async fn resolve<C: ChildRecord>(&self, ids: &[String]) -> ManagerResult<Vec<C>> {
        let mut children = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(child) = fetch_one(&*self.store, C::TABLE, &Filter::by_id(id)).await? {
                children.push(child);
            }
        }
        Ok(children)
    }

    async fn cascade_delete<C: ChildRecord>(&self, id: &str) -> child_sync::SyncReport {
        match child_sync::delete_children::<C>(&*self.store, id).await {
            Ok(report) => report,
            // The children could not even be listed; report the whole
            // collection as failed.
            Err(e) => child_sync::SyncReport::unreadable(C::INDEX, id, &[], e),
        }
    }

    /// Replace-all that reports an unreadable collection instead of failing,
    /// keeping its current children listed.
    async fn replace_children<C: ChildRecord>(
        &self,
        id: &str,
        current: &[String],
        desired: &mut [C],
    ) -> child_sync::SyncReport {
        match child_sync::replace_all(&*self.store, id, desired).await {
            Ok(report) => report,
            Err(e) => {
                for child in desired.iter_mut() {
                    child.set_id(None);
                }
                child_sync::SyncReport::unreadable(C::INDEX, id, current, e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::Harness;
    use crate::store::memory::Operation;

    fn sample_project() -> Project {
        Project::new("p1", "demo")
            .with_images(vec![Image::new("img1", "busybox", "latest")])
            .with_tests(vec![Test::new("smoke")])
    }

    #[tokio::test]
    async fn save_then_get_returns_children_and_defaults() {
        let h = Harness::new();
        let mut project = Project::new("p1", "demo")
            .with_images(vec![Image::new("img1", "busybox", "latest")]);

        let id = h.projects.save(&mut project).await.unwrap();
        let fetched = h.projects.get(&id).await.unwrap();

        assert_eq!(fetched.images.len(), 1);
        assert_eq!(fetched.images[0].name, "img1");
        assert_eq!(fetched.images[0].project_id, id);
        assert_eq!(fetched.action_status, ProjectActionStatus::New);
        assert_eq!(fetched.status, "new");
        assert_eq!(fetched.author, "author");
        assert!(fetched.creation_time.is_some());
        assert_eq!(fetched.image_ids, project.image_ids);
        assert_eq!(h.finish().await, vec!["add-project"]);
    }

    #[tokio::test]
    async fn save_rejects_an_identity_that_already_resolves() {
        let h = Harness::new();
        let mut project = sample_project();
        h.projects.save(&mut project).await.unwrap();

        let err = h.projects.save(&mut project).await.unwrap_err();
        assert!(matches!(err, ManagerError::AlreadyExists { kind: "project", .. }));
    }

    #[tokio::test]
    async fn save_with_failing_child_keeps_parent_and_partial_children() {
        let h = Harness::new();
        h.store.fail_nth(Table::Images, Operation::Insert, 2);
        let mut project = Project::new("p", "").with_images(vec![
            Image::new("a", "a", "1"),
            Image::new("b", "b", "1"),
            Image::new("c", "c", "1"),
        ]);

        let err = h.projects.save(&mut project).await.unwrap_err();
        assert!(matches!(
            err,
            ManagerError::ChildCollection { collection: "images", failed: 1, .. }
        ));

        let id = project.id.clone().unwrap();
        let fetched = h.projects.get(&id).await.unwrap();
        let names: Vec<_> = fetched.images.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
        // Audited even though the cascade was partial.
        assert_eq!(h.finish().await, vec!["add-project"]);
    }

    #[tokio::test]
    async fn list_is_ordered_by_creation_and_has_no_children() {
        let h = Harness::new();
        for name in ["first", "second", "third"] {
            let mut project = Project::new(name, "").with_tests(vec![Test::new("t")]);
            h.projects.save(&mut project).await.unwrap();
        }

        let listed = h.projects.list().await.unwrap();
        let names: Vec<_> = listed.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second", "third"]);
        assert!(listed.iter().all(|p| p.tests.is_empty() && p.test_ids.len() == 1));
    }

    #[tokio::test]
    async fn get_unknown_project_is_not_found() {
        let h = Harness::new();
        let err = h.projects.get("missing").await.unwrap_err();
        assert!(matches!(err, ManagerError::NotFound { kind: "project", .. }));
    }

    #[tokio::test]
    async fn get_skips_ids_without_records() {
        let h = Harness::new();
        let mut project = sample_project();
        let id = h.projects.save(&mut project).await.unwrap();
        h.store
            .delete(Table::Images, &Filter::by_id(&project.image_ids[0]))
            .await
            .unwrap();

        let fetched = h.projects.get(&id).await.unwrap();
        assert!(fetched.images.is_empty());
        assert_eq!(fetched.image_ids.len(), 1);
        assert_eq!(fetched.tests.len(), 1);
    }

    #[tokio::test]
    async fn update_replaces_children_by_content() {
        let h = Harness::new();
        let mut project = sample_project();
        let id = h.projects.save(&mut project).await.unwrap();
        let old_image_id = project.image_ids[0].clone();

        let mut changed = h.projects.get(&id).await.unwrap();
        changed.name = "renamed".into();
        changed.needs_build = true;
        changed.images = vec![Image::new("img2", "alpine", "3"), Image::new("img3", "debian", "12")];
        h.projects.update(&mut changed).await.unwrap();

        let fetched = h.projects.get(&id).await.unwrap();
        assert_eq!(fetched.name, "renamed");
        assert!(fetched.needs_build);
        assert_eq!(fetched.updated_by, "updater");
        let names: Vec<_> = fetched.images.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["img2", "img3"]);
        assert_eq!(fetched.tests.len(), 1);

        let leftovers = h
            .store
            .filter(Table::Images, &Filter::by_id(&old_image_id))
            .await
            .unwrap();
        assert!(leftovers.is_empty());
        let all_children = child_sync::read_children::<Image>(&*h.store, &id).await.unwrap();
        assert_eq!(all_children.len(), 2);
    }

    #[tokio::test]
    async fn repeated_update_yields_same_content_new_identities() {
        let h = Harness::new();
        let mut project = sample_project();
        let id = h.projects.save(&mut project).await.unwrap();

        let mut first = h.projects.get(&id).await.unwrap();
        h.projects.update(&mut first).await.unwrap();
        let after_first = h.projects.get(&id).await.unwrap();

        let mut second = h.projects.get(&id).await.unwrap();
        h.projects.update(&mut second).await.unwrap();
        let after_second = h.projects.get(&id).await.unwrap();

        let content = |p: &Project| -> Vec<(String, String)> {
            p.images.iter().map(|i| (i.name.clone(), i.tag.clone())).collect()
        };
        assert_eq!(content(&after_first), content(&after_second));
        assert_eq!(after_first.tests[0].name, after_second.tests[0].name);
        assert_ne!(after_first.image_ids, after_second.image_ids);
    }

    #[tokio::test]
    async fn update_of_unknown_project_is_a_silent_no_op() {
        let h = Harness::new();
        let mut ghost = Project {
            id: Some("ghost".into()),
            ..sample_project()
        };
        h.projects.update(&mut ghost).await.unwrap();
        assert_eq!(h.store.len(Table::Images).await, 0);
        assert!(h.finish().await.is_empty());
    }

    #[tokio::test]
    async fn delete_cascades_to_children() {
        let h = Harness::new();
        let mut project = sample_project();
        let id = h.projects.save(&mut project).await.unwrap();

        h.projects.delete(&project).await.unwrap();

        assert!(matches!(
            h.projects.get(&id).await,
            Err(ManagerError::NotFound { .. })
        ));
        assert!(child_sync::read_children::<Image>(&*h.store, &id).await.unwrap().is_empty());
        assert!(child_sync::read_children::<Test>(&*h.store, &id).await.unwrap().is_empty());
        assert_eq!(h.finish().await, vec!["add-project", "delete-project"]);
    }

    #[tokio::test]
    async fn delete_missing_project_is_not_found() {
        let h = Harness::new();
        let ghost = Project {
            id: Some("ghost".into()),
            ..Project::default()
        };
        let err = h.projects.delete(&ghost).await.unwrap_err();
        assert!(matches!(err, ManagerError::NotFound { kind: "project", .. }));
    }

    #[tokio::test]
    async fn delete_continues_past_failed_child_and_reports_it() {
        let h = Harness::new();
        let mut project = Project::new("p", "")
            .with_images(vec![Image::new("a", "a", "1"), Image::new("b", "b", "1")])
            .with_tests(vec![Test::new("t")]);
        let id = h.projects.save(&mut project).await.unwrap();

        h.store.fail_nth(Table::Images, Operation::Delete, 1);
        let err = h.projects.delete(&project).await.unwrap_err();
        assert!(matches!(
            err,
            ManagerError::ChildCollection { collection: "images", failed: 1, .. }
        ));

        assert!(h.projects.find(&id).await.unwrap().is_none());
        assert_eq!(child_sync::read_children::<Image>(&*h.store, &id).await.unwrap().len(), 1);
        assert!(child_sync::read_children::<Test>(&*h.store, &id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_all_does_not_cascade() {
        let h = Harness::new();
        let mut project = sample_project();
        h.projects.save(&mut project).await.unwrap();

        h.projects.delete_all().await.unwrap();
        assert_eq!(h.store.len(Table::Projects).await, 0);
        assert_eq!(h.store.len(Table::Images).await, 1);
        assert_eq!(h.store.len(Table::Tests).await, 1);
    }

    #[tokio::test]
    async fn save_reports_failed_index_write_as_child_failure() {
        let h = Harness::new();
        h.store.fail_nth(Table::Projects, Operation::Update, 1);
        let mut project = sample_project();

        let err = h.projects.save(&mut project).await.unwrap_err();
        assert!(matches!(
            err,
            ManagerError::ChildCollection { failed: 1, .. }
        ));

        let id = project.id.clone().unwrap();
        assert_eq!(project.image_ids.len(), 1);
        assert!(h.projects.get(&id).await.unwrap().image_ids.is_empty());
        assert_eq!(h.images.list_by_project(&id).await.unwrap().len(), 1);
        assert_eq!(h.finish().await, vec!["add-project"]);
    }

    #[tokio::test]
    async fn update_with_unreadable_tests_still_relists_images() {
        let h = Harness::new();
        let mut project = sample_project();
        let id = h.projects.save(&mut project).await.unwrap();
        let test_ids = project.test_ids.clone();

        h.store.fail_nth(Table::Tests, Operation::Filter, 1);
        project.images = vec![Image::new("img2", "alpine", "3")];
        let err = h.projects.update(&mut project).await.unwrap_err();
        assert!(matches!(
            err,
            ManagerError::ChildCollection { collection: "tests", failed: 1, .. }
        ));

        let fetched = h.projects.get(&id).await.unwrap();
        assert_eq!(fetched.images.len(), 1);
        assert_eq!(fetched.images[0].name, "img2");
        assert_eq!(fetched.test_ids, test_ids);
        assert_eq!(fetched.tests.len(), 1);
        assert!(h.integrity.scan().await.unwrap().is_clean());
        assert_eq!(h.finish().await, vec!["add-project", "update-project"]);
    }

    #[tokio::test]
    async fn update_reports_failed_index_write_and_still_audits() {
        let h = Harness::new();
        let mut project = sample_project();
        h.projects.save(&mut project).await.unwrap();

        // First write is the scalar fields, second the id lists.
        h.store.fail_nth(Table::Projects, Operation::Update, 2);
        project.name = "renamed".into();
        let err = h.projects.update(&mut project).await.unwrap_err();
        assert!(matches!(
            err,
            ManagerError::ChildCollection { failed: 1, .. }
        ));
        assert_eq!(project.name, "renamed");
        assert_eq!(h.finish().await, vec!["add-project", "update-project"]);
    }
}
