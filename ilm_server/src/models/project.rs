//! ilm.project — A named group of images and tests that are built together.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::image::Image;
use super::test::Test;

/// Progress of the project's most recent build run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectActionStatus {
    #[default]
    New,
    InProgress,
    Stopped,
    Finished,
}

/// Status label given to a freshly saved project.
pub const PROJECT_STATUS_NEW: &str = "new";

/// A project record.
///
/// `images` and `tests` are never written to the project document: children
/// live in their own tables and are linked through `image_ids`/`test_ids`
/// plus the children's own `project_id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Project {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub description: String,
    pub status: String,
    pub action_status: ProjectActionStatus,
    #[serde(rename = "imageids")]
    pub image_ids: Vec<String>,
    #[serde(rename = "testids")]
    pub test_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<Image>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<Test>,
    pub needs_build: bool,
    #[serde(with = "super::timestamp")]
    pub creation_time: Option<DateTime<Utc>>,
    #[serde(with = "super::timestamp")]
    pub update_time: Option<DateTime<Utc>>,
    #[serde(with = "super::timestamp")]
    pub last_run_time: Option<DateTime<Utc>>,
    pub author: String,
    pub updated_by: String,
}

impl Project {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn with_images(mut self, images: Vec<Image>) -> Self {
        self.images = images;
        self
    }

    pub fn with_tests(mut self, tests: Vec<Test>) -> Self {
        self.tests = tests;
        self
    }

    /// The stored form: no identity, no embedded children.
    pub fn document(&self) -> Result<serde_json::Value, serde_json::Error> {
        let mut doc = serde_json::to_value(self)?;
        if let Some(map) = doc.as_object_mut() {
            map.remove("id");
            map.remove("images");
            map.remove("tests");
        }
        Ok(doc)
    }
}
