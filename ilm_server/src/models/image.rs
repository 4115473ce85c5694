//! ilm.image — A container image tracked by a project.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Image {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Display name; also the repository name used when pulling.
    pub name: String,
    pub image_id: String,
    pub tag: String,
    pub ilm_tags: Vec<String>,
    pub description: String,
    pub registry_id: String,
    pub registry_domain: String,
    pub location: String,
    pub skip_image_build: bool,
    pub project_id: String,
}

impl Image {
    pub fn new(name: impl Into<String>, image_id: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image_id: image_id.into(),
            tag: tag.into(),
            ..Self::default()
        }
    }

    /// Reference usable by a container runtime pull, e.g. `registry:5000/app:1.2`.
    pub fn pullable_name(&self) -> String {
        if self.registry_domain.is_empty() {
            format!("{}:{}", self.name, self.tag)
        } else {
            format!("{}/{}:{}", self.registry_domain, self.name, self.tag)
        }
    }
}
