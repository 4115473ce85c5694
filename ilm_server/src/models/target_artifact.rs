//! ilm.target_artifact — The unit a test is run against.

use serde::{Deserialize, Serialize};

/// Discriminator value for image targets.
pub const TARGET_ARTIFACT_IMAGE_TYPE: &str = "image";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetArtifact {
    pub id: String,
    pub artifact: Artifact,
}

/// Artifact payload, tagged by its `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Artifact {
    Image(ImageArtifact),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageArtifact {
    pub name: String,
    pub image_id: String,
    pub tag: String,
    pub description: String,
    pub ilm_tags: Vec<String>,
    pub location: String,
    pub project_id: String,
    pub registry_id: String,
    pub registry_domain: String,
}

impl TargetArtifact {
    pub fn image(id: impl Into<String>, artifact: ImageArtifact) -> Self {
        Self {
            id: id.into(),
            artifact: Artifact::Image(artifact),
        }
    }

    pub fn artifact_type(&self) -> &'static str {
        match self.artifact {
            Artifact::Image(_) => TARGET_ARTIFACT_IMAGE_TYPE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_is_tagged_by_type() {
        let target = TargetArtifact::image(
            "t-1",
            ImageArtifact {
                name: "busybox".into(),
                tag: "latest".into(),
                ..ImageArtifact::default()
            },
        );
        let value = serde_json::to_value(&target).unwrap();
        assert_eq!(value["artifact"]["type"], "image");
        assert_eq!(value["artifact"]["name"], "busybox");
        assert_eq!(target.artifact_type(), "image");
    }

    #[test]
    fn unknown_type_is_rejected() {
        let raw = json!({"id": "t-2", "artifact": {"type": "helm-chart", "name": "x"}});
        assert!(serde_json::from_value::<TargetArtifact>(raw).is_err());
    }
}
