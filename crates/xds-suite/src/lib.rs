//! Suite orchestration for the discovery conformance harness.
//!
//! Selects scenarios per protocol variant by tag, runs them on isolated
//! sessions and folds step results into per-variant and suite totals.

pub mod catalog;
pub mod orchestrator;
pub mod report;
pub mod scenario;
pub mod steps;
pub mod tags;

pub use catalog::{builtin, load_scenarios, CatalogError};
pub use orchestrator::{SuiteConfig, SuiteError, SuiteOrchestrator};
pub use report::write_results;
pub use scenario::{Keyword, Scenario, Step, StepAction};
pub use steps::{run_step, StepError};
pub use tags::{TagError, TagExpression};
