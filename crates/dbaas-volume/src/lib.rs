//! DBaaS volume layer
//!
//! Everything that talks to the external volume-management service:
//!
//! - [`VolumeProvider`]: the raw HTTP operations, one call per endpoint
//! - [`VolumeProviderClient`]: the `reqwest` implementation, bound to one
//!   environment's credentials
//! - [`VolumeManager`] / [`SnapshotManager`]: provider calls combined with
//!   the record bookkeeping the workflow steps rely on
//! - [`poll_until`]: the fixed-budget polling loop used for every wait
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │   VolumeManager          SnapshotManager      │
//! │        │                      │               │
//! │        └──────────┬───────────┘               │
//! │                   ▼                           │
//! │           ProviderFactory                     │
//! │   environment + namespace -> VolumeProvider   │
//! │                   │                           │
//! │                   ▼                           │
//! │   {endpoint}/{project}/{environment}/...      │
//! └───────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod manager;
pub mod poll;
pub mod provider;
pub mod snapshot;

pub use client::{HttpProviderFactory, VolumeProviderClient};
pub use config::{Credential, PollingConfig, ProviderConfig};
pub use error::*;
pub use manager::{InfraScope, VolumeManager, VolumeSpec};
pub use poll::{poll_until, PollPolicy, Timeout};
pub use provider::*;
pub use snapshot::{SnapshotBackend, SnapshotManager};
