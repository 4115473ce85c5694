//! Error kinds surfaced by the record store and the lifecycle managers.

use crate::models::build::BuildStatusLabel;
use crate::store::Table;

/// Failures raised by a [`RecordStore`](crate::store::RecordStore) backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("store query failed: {0}")]
    Query(String),

    #[error("document serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The insert was acknowledged but the store reported no generated key.
    #[error("insert into {table} returned no generated key")]
    NoGeneratedKey { table: Table },
}

impl From<diesel::result::Error> for StoreError {
    fn from(err: diesel::result::Error) -> Self {
        StoreError::Query(err.to_string())
    }
}

/// Errors returned by the project, image, test and build managers.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("{kind} {id} does not exist")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: &'static str, id: String },

    /// A cascade step on a dependent collection failed after the primary
    /// write succeeded. The parent record is left as written.
    #[error("{failed} {collection} operation(s) failed for project {parent}: {first}")]
    ChildCollection {
        parent: String,
        collection: &'static str,
        failed: usize,
        first: Box<StoreError>,
    },

    #[error("build {build_id} cannot move from {from} to {to}")]
    InvalidTransition {
        build_id: String,
        from: BuildStatusLabel,
        to: BuildStatusLabel,
    },

    #[error("unsupported build action: {action}")]
    InvalidAction { action: String },

    #[error("build {build_id} does not target artifact {target_id}")]
    UnknownTarget { build_id: String, target_id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ManagerError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        ManagerError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

pub type ManagerResult<T> = Result<T, ManagerError>;
