//! Lifecycle managers — consistency rules over the record store.

pub mod build_service;
pub mod build_state;
pub mod child_sync;
pub mod identity;
pub mod image_service;
pub mod integrity;
pub mod project_service;
pub mod test_service;

#[cfg(test)]
pub(crate) mod testing;
