//! Template-driven micro-benchmark generation and latency modeling.
//!
//! The pipeline runs in four stages: load the snippet catalog, merge snippets
//! into category templates and compile them, execute the resulting programs
//! on a pinned core, then fit per-operation linear latency models from the
//! recorded cycle counts.

pub mod catalog;
pub mod compile;
pub mod error;
pub mod model;
pub mod params;
pub mod results;
pub mod runner;
pub mod stats;
pub mod template;

pub use catalog::{Catalog, Category};
pub use compile::{CompileReport, CompilerConfig};
pub use error::{BuildError, ModelError, RunError};
pub use model::{analyze, Analysis};
pub use params::{expand_sweep, ParameterSet, SweepSpec};
pub use results::{ResultLog, RunOutcome, RunRecord};
pub use runner::{Controller, Launcher, ProcessLauncher, RunConfig, StubLauncher};
