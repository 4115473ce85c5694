//! ILM data models — documents stored in the record store.

pub mod build;
pub mod image;
pub mod project;
pub mod registry;
pub mod target_artifact;
pub mod timestamp;
