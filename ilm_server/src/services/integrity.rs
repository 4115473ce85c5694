//! Read-only scan for broken parent/child links.
//!
//! Partial cascades leave two kinds of damage: ids in a project's
//! `imageids`/`testids` with no backing record, and child records that point
//! at a missing project or are not listed by their project. Nothing here
//! repairs either; a later project update or delete does.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use crate::error::ManagerResult;
use crate::models::image::Image;
use crate::models::project::Project;
use crate::models::test::Test;
use crate::services::child_sync::{ChildIndex, ChildRecord};
use crate::store::{fetch_all, Filter, RecordStore, Table};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DanglingId {
    pub project_id: String,
    pub collection: &'static str,
    pub child_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanReason {
    MissingParent,
    Unlisted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Orphan {
    pub collection: &'static str,
    pub child_id: String,
    pub project_id: String,
    pub reason: OrphanReason,
}

#[derive(Debug, Default, Serialize)]
pub struct IntegrityReport {
    pub dangling: Vec<DanglingId>,
    pub orphans: Vec<Orphan>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.dangling.is_empty() && self.orphans.is_empty()
    }
}

pub struct IntegrityService {
    store: Arc<dyn RecordStore>,
}

impl IntegrityService {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn scan(&self) -> ManagerResult<IntegrityReport> {
        let projects: Vec<Project> =
            fetch_all(&*self.store, Table::Projects, &Filter::all()).await?;
        let by_id: HashMap<&str, &Project> = projects
            .iter()
            .filter_map(|p| p.id.as_deref().map(|id| (id, p)))
            .collect();

        let mut report = IntegrityReport::default();
        self.scan_collection::<Image>(&by_id, &mut report).await?;
        self.scan_collection::<Test>(&by_id, &mut report).await?;

        tracing::info!(
            projects = projects.len(),
            dangling = report.dangling.len(),
            orphans = report.orphans.len(),
            "Integrity scan finished"
        );
        Ok(report)
    }

    async fn scan_collection<C: ChildRecord>(
        &self,
        projects: &HashMap<&str, &Project>,
        report: &mut IntegrityReport,
    ) -> ManagerResult<()> {
        let index: ChildIndex = C::INDEX;
        let children: Vec<C> = fetch_all(&*self.store, C::TABLE, &Filter::all()).await?;
        let live: HashSet<&str> = children.iter().filter_map(|c| c.id()).collect();

        for (project_id, project) in projects {
            for child_id in index.ids(project) {
                if !live.contains(child_id.as_str()) {
                    report.dangling.push(DanglingId {
                        project_id: project_id.to_string(),
                        collection: index.collection(),
                        child_id: child_id.clone(),
                    });
                }
            }
        }

        for child in &children {
            let Some(child_id) = child.id() else {
                continue;
            };
            let reason = match projects.get(child.project_id()) {
                None => OrphanReason::MissingParent,
                Some(project) if !index.ids(project).iter().any(|id| id == child_id) => {
                    OrphanReason::Unlisted
                }
                Some(_) => continue,
            };
            report.orphans.push(Orphan {
                collection: index.collection(),
                child_id: child_id.to_string(),
                project_id: child.project_id().to_string(),
                reason,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::identity::insert_with_identity;
    use crate::services::testing::Harness;
    use crate::store::memory::Operation;
    use crate::store::to_document;

    #[tokio::test]
    async fn consistent_store_is_clean() {
        let h = Harness::new();
        let mut project = Project::new("p", "")
            .with_images(vec![Image::new("a", "a", "1")])
            .with_tests(vec![Test::new("t")]);
        h.projects.save(&mut project).await.unwrap();

        assert!(h.integrity.scan().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn reports_dangling_ids_and_orphans() {
        let h = Harness::new();
        let mut project = Project::new("p", "").with_images(vec![Image::new("a", "a", "1")]);
        let project_id = h.projects.save(&mut project).await.unwrap();
        let image_id = project.image_ids[0].clone();
        h.store
            .delete(Table::Images, &Filter::by_id(&image_id))
            .await
            .unwrap();

        // Test inserted but never linked.
        h.store.fail_nth(Table::Projects, Operation::Update, 1);
        let mut test = Test::new("t");
        assert!(h.tests.create(&project_id, &mut test).await.is_err());

        // Image pointing at a project that does not exist.
        let mut stray = Image::new("s", "s", "1");
        stray.project_id = "ghost".into();
        let stray_id = insert_with_identity(&*h.store, Table::Images, to_document(&stray).unwrap())
            .await
            .unwrap();

        let report = h.integrity.scan().await.unwrap();
        assert_eq!(
            report.dangling,
            vec![DanglingId {
                project_id: project_id.clone(),
                collection: "images",
                child_id: image_id,
            }]
        );
        assert_eq!(report.orphans.len(), 2);
        assert!(report.orphans.contains(&Orphan {
            collection: "images",
            child_id: stray_id,
            project_id: "ghost".into(),
            reason: OrphanReason::MissingParent,
        }));
        assert!(report.orphans.contains(&Orphan {
            collection: "tests",
            child_id: test.id.unwrap(),
            project_id,
            reason: OrphanReason::Unlisted,
        }));
    }
}
