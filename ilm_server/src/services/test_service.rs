//! Test CRUD. A test is owned by one project and listed in its `testids`.

use std::sync::Arc;

use serde_json::json;

use crate::audit::{AuditEmitter, SECURITY_TAG};
use crate::error::{ManagerError, ManagerResult};
use crate::models::project::Project;
use crate::models::test::Test;
use crate::services::child_sync::{self, ChildIndex};
use crate::services::identity::insert_with_identity;
use crate::store::{fetch_one, to_document, Filter, RecordStore, Table};

pub struct TestService {
    store: Arc<dyn RecordStore>,
    audit: AuditEmitter,
}

impl TestService {
    pub fn new(store: Arc<dyn RecordStore>, audit: AuditEmitter) -> Self {
        Self { store, audit }
    }

    /// The project's tests in `testids` order. Ids without a record are
    /// skipped.
    pub async fn get_all(&self, project_id: &str) -> ManagerResult<Vec<Test>> {
        let project: Project = fetch_one(&*self.store, Table::Projects, &Filter::by_id(project_id))
            .await?
            .ok_or_else(|| ManagerError::not_found("project", project_id))?;

        let mut tests = Vec::with_capacity(project.test_ids.len());
        for id in &project.test_ids {
            match self.find(id).await? {
                Some(test) => tests.push(test),
                None => tracing::debug!(project_id, test_id = %id, "Skipping dangling test id"),
            }
        }
        Ok(tests)
    }

    pub async fn get(&self, test_id: &str) -> ManagerResult<Test> {
        self.find(test_id)
            .await?
            .ok_or_else(|| ManagerError::not_found("test", test_id))
    }

    /// Insert the test under `project_id` and append it to the project's
    /// `testids`. If the second step fails the test is left unreferenced.
    pub async fn create(&self, project_id: &str, test: &mut Test) -> ManagerResult<String> {
        let exists = self
            .store
            .filter(Table::Projects, &Filter::by_id(project_id))
            .await?;
        if exists.is_empty() {
            return Err(ManagerError::not_found("project", project_id));
        }

        test.project_id = project_id.to_string();
        let id = insert_with_identity(&*self.store, Table::Tests, to_document(test)?).await?;
        test.id = Some(id.clone());

        let linked = child_sync::link_child(&*self.store, ChildIndex::Tests, project_id, &id).await;

        self.audit
            .log_event("add-test", format!("id={id}"), &[SECURITY_TAG]);
        tracing::info!(project_id, test_id = %id, "Test created");

        linked.map_err(|e| child_sync::index_error(project_id, ChildIndex::Tests, e))?;
        Ok(id)
    }

    /// Overwrite every mutable field in one write. Unknown tests are ignored.
    pub async fn update(&self, test: &Test) -> ManagerResult<()> {
        let Some(id) = test.id.as_deref() else {
            return Ok(());
        };
        if self.find(id).await?.is_none() {
            tracing::debug!(test_id = %id, "Update of unknown test ignored");
            return Ok(());
        }

        self.store
            .update(
                Table::Tests,
                &Filter::by_id(id),
                json!({
                    "name": test.name,
                    "description": test.description,
                    "targets": test.targets,
                    "selectedTestType": test.selected_test_type,
                    "provider": test.provider,
                    "tagging": test.tagging,
                    "parameters": test.parameters,
                }),
            )
            .await?;

        self.audit
            .log_event("update-test", format!("id={id}"), &[SECURITY_TAG]);
        tracing::info!(test_id = %id, "Test updated");
        Ok(())
    }

    /// Delete the test and drop it from the project's `testids`. A test
    /// owned by another project is not found.
    pub async fn delete(&self, project_id: &str, test_id: &str) -> ManagerResult<()> {
        let removed = self
            .store
            .delete(
                Table::Tests,
                &Filter::by_id(test_id).and(child_sync::PARENT_FIELD, project_id),
            )
            .await?;
        if removed == 0 {
            return Err(ManagerError::not_found("test", test_id));
        }

        let unlinked =
            child_sync::unlink_child(&*self.store, ChildIndex::Tests, project_id, test_id).await;

        self.audit
            .log_event("delete-test", format!("id={test_id}"), &[SECURITY_TAG]);
        tracing::info!(project_id, test_id, "Test deleted");

        unlinked.map_err(|e| child_sync::index_error(project_id, ChildIndex::Tests, e))?;
        Ok(())
    }

    /// Remove every test record. Project id lists are left untouched.
    pub async fn delete_all(&self) -> ManagerResult<()> {
        let removed = self.store.delete(Table::Tests, &Filter::all()).await?;
        tracing::info!(removed, "All tests deleted");
        Ok(())
    }

    async fn find(&self, test_id: &str) -> ManagerResult<Option<Test>> {
        Ok(fetch_one(&*self.store, Table::Tests, &Filter::by_id(test_id)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::target_artifact::{ImageArtifact, TargetArtifact};
    use crate::models::test::{Provider, Tagging};
    use crate::services::testing::Harness;
    use crate::store::memory::Operation;

    async fn saved_project(h: &Harness) -> String {
        let mut project = Project::new("p1", "");
        h.projects.save(&mut project).await.unwrap()
    }

    #[tokio::test]
    async fn create_then_delete_maintains_test_ids() {
        let h = Harness::new();
        let project_id = saved_project(&h).await;

        let mut test = Test::new("t1");
        let test_id = h.tests.create(&project_id, &mut test).await.unwrap();
        assert_eq!(test.project_id, project_id);
        let project = h.projects.get(&project_id).await.unwrap();
        assert!(project.test_ids.contains(&test_id));
        assert_eq!(project.tests[0].name, "t1");

        h.tests.delete(&project_id, &test_id).await.unwrap();
        let project = h.projects.get(&project_id).await.unwrap();
        assert!(!project.test_ids.contains(&test_id));
        assert!(matches!(
            h.tests.get(&test_id).await,
            Err(ManagerError::NotFound { kind: "test", .. })
        ));

        assert_eq!(
            h.finish().await,
            vec!["add-project", "add-test", "delete-test"]
        );
    }

    #[tokio::test]
    async fn create_under_missing_project_is_not_found() {
        let h = Harness::new();
        let err = h.tests.create("ghost", &mut Test::new("t")).await.unwrap_err();
        assert!(matches!(err, ManagerError::NotFound { kind: "project", .. }));
        assert_eq!(h.store.len(Table::Tests).await, 0);
    }

    #[tokio::test]
    async fn failed_link_leaves_an_orphan_and_reports_it() {
        let h = Harness::new();
        let project_id = saved_project(&h).await;
        h.store.fail_nth(Table::Projects, Operation::Update, 1);

        let mut test = Test::new("t1");
        let err = h.tests.create(&project_id, &mut test).await.unwrap_err();
        assert!(matches!(
            err,
            ManagerError::ChildCollection { collection: "tests", failed: 1, .. }
        ));

        let orphan = h.tests.get(test.id.as_deref().unwrap()).await.unwrap();
        assert_eq!(orphan.project_id, project_id);
        assert!(h.projects.get(&project_id).await.unwrap().test_ids.is_empty());
    }

    #[tokio::test]
    async fn get_all_skips_dangling_ids() {
        let h = Harness::new();
        let project_id = saved_project(&h).await;
        let first = h.tests.create(&project_id, &mut Test::new("a")).await.unwrap();
        h.tests.create(&project_id, &mut Test::new("b")).await.unwrap();
        h.store
            .delete(Table::Tests, &Filter::by_id(&first))
            .await
            .unwrap();

        let tests = h.tests.get_all(&project_id).await.unwrap();
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].name, "b");
    }

    #[tokio::test]
    async fn update_overwrites_mutable_fields() {
        let h = Harness::new();
        let project_id = saved_project(&h).await;
        let mut test = Test::new("t1");
        let id = h.tests.create(&project_id, &mut test).await.unwrap();

        test.name = "t1-renamed".into();
        test.targets = vec![TargetArtifact::image("img", ImageArtifact::default())];
        test.provider = Provider {
            provider_type: "clair".into(),
            provider_name: "clair-local".into(),
            provider_test: "vuln".into(),
        };
        test.tagging = Tagging {
            on_success: "passed".into(),
            on_failure: "failed".into(),
            from_tag: "latest".into(),
        };
        h.tests.update(&test).await.unwrap();

        let stored = h.tests.get(&id).await.unwrap();
        assert_eq!(stored, test);
        assert_eq!(
            h.finish().await,
            vec!["add-project", "add-test", "update-test"]
        );
    }

    #[tokio::test]
    async fn update_unknown_test_is_ignored() {
        let h = Harness::new();
        let ghost = Test {
            id: Some("ghost".into()),
            ..Test::new("t")
        };
        h.tests.update(&ghost).await.unwrap();
        assert_eq!(h.store.len(Table::Tests).await, 0);
        assert!(h.finish().await.is_empty());
    }

    #[tokio::test]
    async fn delete_unknown_test_is_not_found() {
        let h = Harness::new();
        let project_id = saved_project(&h).await;
        let err = h.tests.delete(&project_id, "ghost").await.unwrap_err();
        assert!(matches!(err, ManagerError::NotFound { kind: "test", .. }));
    }

    #[tokio::test]
    async fn delete_through_another_project_is_not_found() {
        let h = Harness::new();
        let owner = saved_project(&h).await;
        let other = saved_project(&h).await;
        let test_id = h.tests.create(&owner, &mut Test::new("t")).await.unwrap();

        let err = h.tests.delete(&other, &test_id).await.unwrap_err();
        assert!(matches!(err, ManagerError::NotFound { kind: "test", .. }));
        assert!(h.tests.get(&test_id).await.is_ok());
        assert!(h.projects.get(&owner).await.unwrap().test_ids.contains(&test_id));
    }
}
