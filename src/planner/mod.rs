//! Planning module for provisioning operations.
//!
//! This module compares the resource graph against recorded state,
//! turns the difference into an ordered plan, and executes it.

mod diff;
mod executor;
mod plan;

pub use diff::{DiffDetail, DiffEngine, DiffResult, DiffType, NewValue, ReplacementPolicy, ResourceDiff};
pub use executor::{DEFAULT_PARALLELISM, ExecutionResult, PlanExecutor, StepReport, StepStatus};
pub use plan::{Plan, PlanStep, StepAction};
