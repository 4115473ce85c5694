//! ilm.build — One execution of a test against its target artifacts.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::target_artifact::TargetArtifact;
use super::test::Test;
use crate::error::ManagerError;

/// Status of a build. `Stopped`, `FinishedSuccess` and `FinishedFailed` are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatusLabel {
    #[default]
    New,
    Running,
    Stopped,
    FinishedSuccess,
    FinishedFailed,
}

impl BuildStatusLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatusLabel::New => "new",
            BuildStatusLabel::Running => "running",
            BuildStatusLabel::Stopped => "stopped",
            BuildStatusLabel::FinishedSuccess => "finished_success",
            BuildStatusLabel::FinishedFailed => "finished_failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatusLabel::Stopped
                | BuildStatusLabel::FinishedSuccess
                | BuildStatusLabel::FinishedFailed
        )
    }
}

impl fmt::Display for BuildStatusLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Actions a caller may request on a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildAction {
    Start,
    Stop,
}

impl FromStr for BuildAction {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(BuildAction::Start),
            "stop" => Ok(BuildAction::Stop),
            other => Err(ManagerError::InvalidAction {
                action: other.to_string(),
            }),
        }
    }
}

/// Snapshot of the test definition taken when the build was created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildConfig {
    pub name: String,
    pub description: String,
    pub targets: Vec<TargetArtifact>,
    pub selected_test_type: String,
    pub provider_id: String,
}

impl From<&Test> for BuildConfig {
    fn from(test: &Test) -> Self {
        Self {
            name: test.name.clone(),
            description: test.description.clone(),
            targets: test.targets.clone(),
            selected_test_type: test.selected_test_type.clone(),
            provider_id: test.provider.provider_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub build_id: String,
    pub status: BuildStatusLabel,
}

/// Outcome of running the build's test against a single target artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub build_id: String,
    pub target_artifact: TargetArtifact,
    #[serde(default)]
    pub result_entries: Vec<String>,
    pub successful: bool,
    #[serde(default, with = "super::timestamp")]
    pub time_stamp: Option<DateTime<Utc>>,
}

impl BuildResult {
    pub fn new(target_artifact: TargetArtifact, result_entries: Vec<String>, successful: bool) -> Self {
        Self {
            id: None,
            build_id: String::new(),
            target_artifact,
            result_entries,
            successful,
            time_stamp: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Build {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(with = "super::timestamp")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(with = "super::timestamp")]
    pub end_time: Option<DateTime<Utc>>,
    pub config: BuildConfig,
    pub status: BuildStatus,
    pub results: Vec<BuildResult>,
    pub test_id: String,
    pub project_id: String,
}
