//! Image lifecycle manager.
//!
//! Projects own images and tests; tests produce builds, and builds collect
//! one result per target artifact. Records live in a document store without
//! cross-record transactions, so every cascade here is ordered and
//! best-effort, and partial failures are reported instead of rolled back.

pub mod audit;
pub mod config;
pub mod error;
pub mod metrics;
pub mod migration;
pub mod models;
pub mod services;
pub mod store;
