pub mod artifacts;
pub mod container;
pub mod executor;
pub mod monitor;
pub mod registry;
pub mod runner;

pub use artifacts::Artifact;
pub use container::{CommandResult, ContainerHandle};
pub use executor::{CodeExecutor, Engine, ExecutionResult, SharedEngine};
pub use monitor::{PeakStats, StatsMonitor, StatsSample};
pub use registry::{SandboxRegistry, SessionId};
pub use runner::{Language, TIMEOUT_EXIT_CODE};
