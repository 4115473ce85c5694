//! Image CRUD. Images are owned by a project and listed in its `imageids`;
//! the registry domain is resolved from the `registries` table on create.

use std::sync::Arc;

use serde_json::json;

use crate::audit::{AuditEmitter, SECURITY_TAG};
use crate::error::{ManagerError, ManagerResult};
use crate::models::image::Image;
use crate::models::project::Project;
use crate::models::registry::Registry;
use crate::services::child_sync::{self, ChildIndex};
use crate::services::identity::insert_with_identity;
use crate::store::{fetch_one, to_document, Filter, RecordStore, Table};

pub struct ImageService {
    store: Arc<dyn RecordStore>,
    audit: AuditEmitter,
}

impl ImageService {
    pub fn new(store: Arc<dyn RecordStore>, audit: AuditEmitter) -> Self {
        Self { store, audit }
    }

    /// The project's images in `imageids` order; dangling ids are skipped.
    pub async fn get_all(&self, project_id: &str) -> ManagerResult<Vec<Image>> {
        let project: Project = fetch_one(&*self.store, Table::Projects, &Filter::by_id(project_id))
            .await?
            .ok_or_else(|| ManagerError::not_found("project", project_id))?;

        let mut images = Vec::with_capacity(project.image_ids.len());
        for id in &project.image_ids {
            if let Some(image) = self.find(id).await? {
                images.push(image);
            }
        }
        Ok(images)
    }

    /// Images whose parent reference is `project_id`, listed or not.
    pub async fn list_by_project(&self, project_id: &str) -> ManagerResult<Vec<Image>> {
        Ok(child_sync::read_children(&*self.store, project_id).await?)
    }

    pub async fn get(&self, image_id: &str) -> ManagerResult<Image> {
        self.find(image_id)
            .await?
            .ok_or_else(|| ManagerError::not_found("image", image_id))
    }

    pub async fn create(&self, project_id: &str, image: &mut Image) -> ManagerResult<String> {
        let exists = self
            .store
            .filter(Table::Projects, &Filter::by_id(project_id))
            .await?;
        if exists.is_empty() {
            return Err(ManagerError::not_found("project", project_id));
        }

        image.project_id = project_id.to_string();
        if let Some(domain) = self.registry_domain(&image.registry_id).await? {
            image.registry_domain = domain;
        }
        let id = insert_with_identity(&*self.store, Table::Images, to_document(image)?).await?;
        image.id = Some(id.clone());

        let linked =
            child_sync::link_child(&*self.store, ChildIndex::Images, project_id, &id).await;

        self.audit.log_event(
            "add-image",
            format!("id={id}, name={}", image.pullable_name()),
            &[SECURITY_TAG],
        );
        tracing::info!(project_id, image_id = %id, "Image created");

        linked.map_err(|e| child_sync::index_error(project_id, ChildIndex::Images, e))?;
        Ok(id)
    }

    /// Overwrite the image's mutable fields. Unknown images are ignored.
    pub async fn update(&self, image: &Image) -> ManagerResult<()> {
        let Some(id) = image.id.as_deref() else {
            return Ok(());
        };
        if self.find(id).await?.is_none() {
            return Ok(());
        }

        self.store
            .update(
                Table::Images,
                &Filter::by_id(id),
                json!({
                    "name": image.name,
                    "imageId": image.image_id,
                    "tag": image.tag,
                    "ilmTags": image.ilm_tags,
                    "description": image.description,
                    "registryId": image.registry_id,
                    "registryDomain": image.registry_domain,
                    "location": image.location,
                    "skipImageBuild": image.skip_image_build,
                }),
            )
            .await?;

        self.audit
            .log_event("update-image", format!("id={id}"), &[SECURITY_TAG]);
        Ok(())
    }

    /// Attach a lifecycle tag to the image. Returns `false` if it was
    /// already present.
    pub async fn update_ilm_tags(&self, image_id: &str, ilm_tag: &str) -> ManagerResult<bool> {
        let mut image = self.get(image_id).await?;
        if image.ilm_tags.iter().any(|t| t == ilm_tag) {
            return Ok(false);
        }
        image.ilm_tags.push(ilm_tag.to_string());
        self.store
            .update(
                Table::Images,
                &Filter::by_id(image_id),
                json!({ "ilmTags": image.ilm_tags }),
            )
            .await?;

        self.audit.log_event(
            "update-image",
            format!("id={image_id}, ilmTag={ilm_tag}"),
            &[SECURITY_TAG],
        );
        Ok(true)
    }

    /// Delete the image and drop it from the project's `imageids`. An image
    /// owned by another project is not found.
    pub async fn delete(&self, project_id: &str, image_id: &str) -> ManagerResult<()> {
        let removed = self
            .store
            .delete(
                Table::Images,
                &Filter::by_id(image_id).and(child_sync::PARENT_FIELD, project_id),
            )
            .await?;
        if removed == 0 {
            return Err(ManagerError::not_found("image", image_id));
        }

        let unlinked =
            child_sync::unlink_child(&*self.store, ChildIndex::Images, project_id, image_id).await;

        self.audit
            .log_event("delete-image", format!("id={image_id}"), &[SECURITY_TAG]);
        tracing::info!(project_id, image_id, "Image deleted");

        unlinked.map_err(|e| child_sync::index_error(project_id, ChildIndex::Images, e))?;
        Ok(())
    }

    pub async fn delete_all(&self) -> ManagerResult<()> {
        let removed = self.store.delete(Table::Images, &Filter::all()).await?;
        tracing::info!(removed, "All images deleted");
        Ok(())
    }

    async fn find(&self, image_id: &str) -> ManagerResult<Option<Image>> {
        Ok(fetch_one(&*self.store, Table::Images, &Filter::by_id(image_id)).await?)
    }

    async fn registry_domain(&self, registry_id: &str) -> ManagerResult<Option<String>> {
        if registry_id.is_empty() {
            return Ok(None);
        }
        let registry: Option<Registry> =
            fetch_one(&*self.store, Table::Registries, &Filter::by_id(registry_id)).await?;
        if registry.is_none() {
            tracing::warn!(registry_id, "Image references an unknown registry");
        }
        Ok(registry.map(|r| r.domain().to_string()))
    }
}
