//! Resource graph module.
//!
//! Declarations are collected by [`GraphBuilder`] into an owned, immutable
//! [`ResourceGraph`] that is passed explicitly to the planner and executor.

mod builder;
mod resource;

pub use builder::{GraphBuilder, ResourceGraph};
pub use resource::{Properties, PropertyValue, Reference, Resource, ResourceId};
