//! Berth-State: persistence for Berth release orchestration
//!
//! This crate owns the records the orchestration engine reads and mutates,
//! the storage traits it is written against, and two implementations of
//! them: an in-memory fake and a SurrealDB-backed store.
//!
//! ## Key Components
//!
//! - `model`: catalog records (projects, environments, extensions, secrets,
//!   services) and release records (`Release`, `ReleaseExtension`)
//! - `CatalogStore` / `ReleaseStore`: async storage traits
//! - `MemoryStore`: in-memory fake for tests
//! - `SurrealStore`: SurrealDB implementation (`mem://`, `surrealkv://`, `ws(s)://`)

pub mod connect;
mod error;
pub mod fakes;
pub mod ids;
pub mod migrations;
pub mod model;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use connect::CloudConfig;
pub use error::{StateError, StorageError};
pub use fakes::MemoryStore;
pub use ids::*;
pub use model::*;
pub use schema::{DocRow, Document, DOC_SCHEMA_VERSION};
pub use storage_traits::{CatalogStore, Datastore, ReleaseStore, StorageResult};
pub use surreal_store::SurrealStore;

/// Result type for connection and schema setup
pub type Result<T> = std::result::Result<T, StateError>;
