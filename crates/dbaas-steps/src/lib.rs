//! DBaaS workflow steps
//!
//! The reversible units pipelines are assembled from. Each step is gated on
//! the instance it runs for, performs one forward effect against the volume
//! provider, a host or the database engine, and knows how to compensate it
//! (or declares that it cannot).
//!
//! - [`traits`]: `Gated` / `Doable` / `Undoable` / `Step` and the symmetric
//!   do/undo helper
//! - [`context`]: the per-run [`StepContext`] and its collaborators
//! - [`gating`] and [`select`]: role predicates and the host, volume,
//!   snapshot and environment selectors steps are parameterized with
//! - [`steps`]: the step catalog, one constructor per named variant

pub mod capability;
pub mod config;
pub mod context;
pub mod error;
pub mod gating;
pub mod select;
pub mod steps;
pub mod traits;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use capability::{BinlogPosition, EngineDriver, HostVmProvider, RemoteExecutor, Row, ScriptOutput, Vars};
pub use config::StepsConfig;
pub use context::{Services, StepContext};
pub use error::{EngineError, ErrorKind, RemoteError, Result, StepError};
pub use gating::{first_node, last_node, Gate, Pinned, Role};
pub use traits::{run_do, run_undo, Direction, Doable, Gated, Outcome, Reversibility, Step, Undoable};
