//! DBaaS common types
//!
//! Domain records shared by every layer of the control plane (instances,
//! hosts, infras, volumes, snapshots, migration and maintenance records) and
//! the data-access trait the workflow steps use to read and mutate them.
//!
//! The persistence layer itself lives outside this workspace; [`MemoryStore`]
//! is the in-process implementation used by tests and local tooling.

pub mod error;
pub mod memory;
pub mod model;
pub mod store;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use model::*;
pub use store::Store;

pub type Result<T> = std::result::Result<T, StoreError>;
