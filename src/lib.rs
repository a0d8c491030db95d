// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Halldyll Provision
//!
//! A declarative, dependency-aware resource provisioning engine with persisted state.
//!
//! ## Overview
//!
//! A stack file declares the resources you want and how they reference each
//! other. Halldyll works out what has to change and applies it:
//!
//! - Resources and their references form a dependency graph, validated up front
//! - The last applied state is persisted locally or in S3, with locking
//! - Every run diffs the graph against state and produces an ordered plan
//! - Plans execute concurrently, respecting dependencies, through a provider
//!
//! ## Architecture
//!
//! 1. **Graph**: built from `halldyll.stack.yaml`
//! 2. **State**: the last applied snapshot
//! 3. **Planner**: diffs the two, orders the steps and executes them
//! 4. **Provider**: performs create/update/delete/read calls
//!
//! ## Modules
//!
//! - [`config`]: Stack file parsing and validation
//! - [`graph`]: Resource declarations and the dependency graph
//! - [`state`]: State storage backends (local, S3)
//! - [`planner`]: Diff computation, planning and execution
//! - [`provider`]: Provider contract, retries, HTTP and in-memory providers
//! - [`engine`]: Orchestration of plan, apply, destroy, drift and refresh
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: my-stack
//!   environment: dev
//!
//! resources:
//!   - name: my-test-bucket
//!     type: bucket
//!     properties:
//!       bucket: my-test-bucket
//!
//! exports:
//!   bucket_arn: { $ref: bucket.my-test-bucket, output: arn }
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, StackConfig};
pub use engine::{DriftReport, Engine, RunReport};
pub use error::{HalldyllError, Result};
pub use graph::{GraphBuilder, ResourceGraph, ResourceId};
pub use planner::{DiffEngine, Plan, PlanExecutor};
pub use provider::{HttpProvider, MemoryProvider, Provider, ProviderAdapter, RetryPolicy};
pub use state::{LocalStateStore, S3StateStore, StateSnapshot, StateStore};
