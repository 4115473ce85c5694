//! Build lifecycle: creation from a test snapshot, guarded status
//! transitions, and result aggregation.
//!
//! Results live inside the build document and are upserted by target id in
//! one store write, so executors reporting at the same instant never lose an
//! entry. Every status write is conditional on the status it was decided
//! from; when another caller moved the build first, the decision is taken
//! again against the stored status.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::audit::{AuditEmitter, SECURITY_TAG};
use crate::error::{ManagerError, ManagerResult, StoreError};
use crate::models::build::{
    Build, BuildAction, BuildConfig, BuildResult, BuildStatus, BuildStatusLabel,
};
use crate::models::project::ProjectActionStatus;
use crate::models::test::Test;
use crate::models::timestamp;
use crate::services::build_state::{self, Aggregate, Transition};
use crate::services::identity::insert_with_identity;
use crate::store::{fetch_all, fetch_one, to_document, Filter, RecordStore, Table};

/// Path of the key results are replaced by.
const RESULT_KEY: [&str; 2] = ["targetArtifact", "id"];

/// Status re-checks before a transition gives up. Statuses only move
/// forward, so two concurrent moves are the most a transition can observe.
const MAX_STATUS_RETRIES: usize = 4;

pub struct BuildService {
    store: Arc<dyn RecordStore>,
    audit: AuditEmitter,
}

impl BuildService {
    pub fn new(store: Arc<dyn RecordStore>, audit: AuditEmitter) -> Self {
        Self { store, audit }
    }

    /// Builds of one test, oldest first.
    pub async fn get_builds(&self, project_id: &str, test_id: &str) -> ManagerResult<Vec<Build>> {
        let filter = Filter::eq("projectId", project_id).and("testId", test_id);
        Ok(fetch_all(&*self.store, Table::Builds, &filter).await?)
    }

    pub async fn get_build(
        &self,
        project_id: &str,
        test_id: &str,
        build_id: &str,
    ) -> ManagerResult<Build> {
        let filter = scoped(project_id, test_id, build_id);
        fetch_one(&*self.store, Table::Builds, &filter)
            .await?
            .ok_or_else(|| ManagerError::not_found("build", build_id))
    }

    pub async fn get_build_by_id(&self, build_id: &str) -> ManagerResult<Build> {
        fetch_one(&*self.store, Table::Builds, &Filter::by_id(build_id))
            .await?
            .ok_or_else(|| ManagerError::not_found("build", build_id))
    }

    pub async fn get_build_status(
        &self,
        project_id: &str,
        test_id: &str,
        build_id: &str,
    ) -> ManagerResult<BuildStatusLabel> {
        Ok(self.get_build(project_id, test_id, build_id).await?.status.status)
    }

    pub async fn get_build_results(
        &self,
        project_id: &str,
        test_id: &str,
        build_id: &str,
    ) -> ManagerResult<Vec<BuildResult>> {
        Ok(self.get_build(project_id, test_id, build_id).await?.results)
    }

    /// Snapshot the test into a new build in status `new`. Only the `start`
    /// action creates builds.
    pub async fn create_build(
        &self,
        project_id: &str,
        test_id: &str,
        action: BuildAction,
    ) -> ManagerResult<String> {
        if let BuildAction::Stop = action {
            return Err(ManagerError::InvalidAction {
                action: "stop".to_string(),
            });
        }

        let test: Test = fetch_one(&*self.store, Table::Tests, &Filter::by_id(test_id))
            .await?
            .filter(|t: &Test| t.project_id == project_id)
            .ok_or_else(|| ManagerError::not_found("test", test_id))?;

        let mut build = Build {
            start_time: Some(Utc::now()),
            config: BuildConfig::from(&test),
            status: BuildStatus::default(),
            results: Vec::new(),
            test_id: test_id.to_string(),
            project_id: project_id.to_string(),
            ..Build::default()
        };
        let id = insert_with_identity(&*self.store, Table::Builds, to_document(&build)?).await?;
        build.status.build_id = id.clone();
        self.store
            .update(
                Table::Builds,
                &Filter::by_id(&id),
                json!({ "status": build.status }),
            )
            .await?;

        crate::metrics::build_status_changed(BuildStatusLabel::New.as_str());
        self.audit.log_event(
            "add-build",
            format!("id={id}, testId={test_id}"),
            &[SECURITY_TAG],
        );
        tracing::info!(
            build_id = %id,
            project_id,
            test_id,
            targets = build.config.targets.len(),
            "Build created"
        );
        Ok(id)
    }

    /// The executor accepted the build.
    pub async fn mark_running(&self, build_id: &str) -> ManagerResult<BuildStatusLabel> {
        self.update_build_status(build_id, BuildStatusLabel::Running)
            .await
    }

    /// Apply a user action: `stop` abandons outstanding targets, `start`
    /// moves a new build to `running`.
    pub async fn update_build(
        &self,
        project_id: &str,
        test_id: &str,
        build_id: &str,
        action: BuildAction,
    ) -> ManagerResult<BuildStatusLabel> {
        let mut build = self.get_build(project_id, test_id, build_id).await?;
        let to = match action {
            BuildAction::Start => BuildStatusLabel::Running,
            BuildAction::Stop => BuildStatusLabel::Stopped,
        };
        self.transition(&mut build, to).await
    }

    /// Move the build to `status`. Re-applying the current status is a
    /// no-op; leaving a terminal status is rejected.
    pub async fn update_build_status(
        &self,
        build_id: &str,
        status: BuildStatusLabel,
    ) -> ManagerResult<BuildStatusLabel> {
        let mut build = self.get_build_by_id(build_id).await?;
        self.transition(&mut build, status).await
    }

    /// Record one target's result and re-evaluate aggregation.
    ///
    /// A resend for the same target replaces the earlier entry. Results that
    /// arrive after the build reached a terminal status are dropped.
    pub async fn record_result(
        &self,
        build_id: &str,
        mut result: BuildResult,
    ) -> ManagerResult<BuildStatusLabel> {
        let target_id = result.target_artifact.id.clone();
        result.build_id = build_id.to_string();
        result.time_stamp.get_or_insert_with(Utc::now);
        let element = serde_json::to_value(&result).map_err(StoreError::from)?;

        for _ in 0..MAX_STATUS_RETRIES {
            let mut build = self.get_build_by_id(build_id).await?;
            if !build.config.targets.iter().any(|t| t.id == target_id) {
                return Err(ManagerError::UnknownTarget {
                    build_id: build_id.to_string(),
                    target_id,
                });
            }
            if build.status.status == BuildStatusLabel::New {
                self.advance(&mut build, BuildStatusLabel::Running).await?;
            }
            let current = build.status.status;
            if current.is_terminal() {
                tracing::debug!(build_id, target_id = %target_id, status = %current, "Late result ignored");
                return Ok(current);
            }

            // Only lands while the build still has the status read above.
            let recorded = self
                .store
                .upsert_element(
                    Table::Builds,
                    &status_guard(build_id, &build.status)?,
                    "results",
                    &RESULT_KEY,
                    element.clone(),
                )
                .await?;
            if recorded == 0 {
                tracing::debug!(build_id, target_id = %target_id, "Build changed while recording; re-reading");
                continue;
            }
            tracing::info!(build_id, target_id = %target_id, "Build result recorded");

            // Re-read so results recorded concurrently are counted.
            let mut build = self.get_build_by_id(build_id).await?;
            return self.settle(&mut build).await;
        }
        Err(status_contended(build_id))
    }

    /// Record a batch of results in order; returns the final status.
    pub async fn update_build_results(
        &self,
        build_id: &str,
        results: Vec<BuildResult>,
    ) -> ManagerResult<BuildStatusLabel> {
        self.get_build_by_id(build_id).await?;
        for result in results {
            self.record_result(build_id, result).await?;
        }

        // A build without targets completes on the first report.
        let mut build = self.get_build_by_id(build_id).await?;
        self.settle(&mut build).await
    }

    pub async fn delete_build(
        &self,
        project_id: &str,
        test_id: &str,
        build_id: &str,
    ) -> ManagerResult<()> {
        let removed = self
            .store
            .delete(Table::Builds, &scoped(project_id, test_id, build_id))
            .await?;
        if removed == 0 {
            return Err(ManagerError::not_found("build", build_id));
        }
        self.audit
            .log_event("delete-build", format!("id={build_id}"), &[SECURITY_TAG]);
        tracing::info!(build_id, "Build deleted");
        Ok(())
    }

    pub async fn delete_all_builds(&self) -> ManagerResult<()> {
        let removed = self.store.delete(Table::Builds, &Filter::all()).await?;
        tracing::info!(removed, "All builds deleted");
        Ok(())
    }

    /// Apply `to` unless another caller moved the build first, in which
    /// case the move is re-checked against the stored status.
    async fn transition(
        &self,
        build: &mut Build,
        to: BuildStatusLabel,
    ) -> ManagerResult<BuildStatusLabel> {
        let build_id = build.id.clone().unwrap_or_default();
        for _ in 0..MAX_STATUS_RETRIES {
            let from = build.status.status;
            match build_state::check_transition(from, to) {
                None => {
                    tracing::warn!(build_id = %build_id, %from, %to, "Rejected build transition");
                    return Err(ManagerError::InvalidTransition { build_id, from, to });
                }
                Some(Transition::Unchanged) => return Ok(from),
                Some(Transition::Advance) => {}
            }

            let now = Utc::now();
            let mut status = build.status.clone();
            status.status = to;
            let mut patch = Map::new();
            patch.insert(
                "status".into(),
                serde_json::to_value(&status).map_err(StoreError::from)?,
            );
            if to.is_terminal() {
                patch.insert("endTime".into(), Value::String(timestamp::format(&now)));
            }
            let matched = self
                .store
                .update(Table::Builds, &status_guard(&build_id, &build.status)?, patch.into())
                .await?;
            if matched == 0 {
                tracing::debug!(build_id = %build_id, %from, %to, "Build status moved; re-checking");
                *build = self.get_build_by_id(&build_id).await?;
                continue;
            }

            build.status = status;
            if to.is_terminal() {
                build.end_time = Some(now);
            }
            crate::metrics::build_status_changed(to.as_str());
            self.audit.log_event(
                "update-build",
                format!("id={build_id}, status={to}"),
                &[SECURITY_TAG],
            );
            tracing::info!(build_id = %build_id, %from, %to, "Build status changed");

            self.roll_up(build, to).await;
            return Ok(to);
        }
        Err(status_contended(&build_id))
    }

    /// Transition driven by executor reports. A build that reached a
    /// terminal status in the meantime keeps it.
    async fn advance(
        &self,
        build: &mut Build,
        to: BuildStatusLabel,
    ) -> ManagerResult<BuildStatusLabel> {
        match self.transition(build, to).await {
            Err(ManagerError::InvalidTransition { from, .. }) if from.is_terminal() => Ok(from),
            other => other,
        }
    }

    /// Finish a running build once every declared target has reported.
    async fn settle(&self, build: &mut Build) -> ManagerResult<BuildStatusLabel> {
        let current = build.status.status;
        if current != BuildStatusLabel::Running {
            return Ok(current);
        }
        match build_state::aggregate(&build.config.targets, &build.results) {
            Aggregate::Complete(label) => self.advance(build, label).await,
            Aggregate::Pending { remaining } => {
                tracing::debug!(
                    build_id = build.id.as_deref().unwrap_or_default(),
                    remaining = remaining.len(),
                    "Build awaiting results"
                );
                Ok(current)
            }
        }
    }

    /// Reflect a build transition on its project. Failures are logged only;
    /// the build status is already written.
    async fn roll_up(&self, build: &Build, status: BuildStatusLabel) {
        let now = Utc::now();
        let patch = match status {
            BuildStatusLabel::Running => json!({
                "actionStatus": ProjectActionStatus::InProgress,
                "lastRunTime": timestamp::format(&now),
            }),
            BuildStatusLabel::Stopped => json!({
                "actionStatus": ProjectActionStatus::Stopped,
                "status": status.as_str(),
            }),
            BuildStatusLabel::FinishedSuccess | BuildStatusLabel::FinishedFailed => json!({
                "actionStatus": ProjectActionStatus::Finished,
                "status": status.as_str(),
            }),
            BuildStatusLabel::New => return,
        };
        if let Err(e) = self
            .store
            .update(Table::Projects, &Filter::by_id(&build.project_id), patch)
            .await
        {
            tracing::warn!(
                project_id = %build.project_id,
                status = %status,
                "Project roll-up failed: {e}"
            );
        }
    }
}

/// Matches the build only while it still carries `status`.
fn status_guard(build_id: &str, status: &BuildStatus) -> Result<Filter, StoreError> {
    Ok(Filter::by_id(build_id).and("status", serde_json::to_value(status)?))
}

fn status_contended(build_id: &str) -> ManagerError {
    ManagerError::Store(StoreError::Query(format!(
        "build {build_id}: status kept changing during update"
    )))
}

fn scoped(project_id: &str, test_id: &str, build_id: &str) -> Filter {
    Filter::by_id(build_id)
        .and("projectId", project_id)
        .and("testId", test_id)
}
