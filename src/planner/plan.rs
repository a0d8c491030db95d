//! Plan types and construction.
//!
//! This module turns a [`DiffResult`] into an ordered list of steps with
//! explicit dependencies. Creates and updates follow the resource graph;
//! deletes run in reverse of the recorded dependencies.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

use crate::error::{PlanError, Result};
use crate::graph::{ResourceGraph, ResourceId};
use crate::state::StateSnapshot;

use super::diff::{DiffDetail, DiffResult, DiffType};

/// A complete execution plan.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Stack hash this plan is based on.
    pub config_hash: String,
    /// Serial of the state snapshot this plan was computed against.
    pub state_serial: u64,
    /// Steps in dependency order.
    pub steps: Vec<PlanStep>,
}

/// A single planned step.
#[derive(Debug, Clone, Serialize)]
pub struct PlanStep {
    /// What to do.
    pub action: StepAction,
    /// Resource the step applies to.
    pub resource: ResourceId,
    /// Attribute changes behind this step.
    pub changes: Vec<DiffDetail>,
    /// Provider identity, for steps on existing resources.
    pub provider_id: Option<String>,
    /// Whether this step is half of a replacement.
    pub replacement: bool,
    /// Why this step exists.
    pub reason: String,
    /// Indices of steps that must finish first. Always earlier in the plan.
    pub dependencies: Vec<usize>,
}

/// Types of steps in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    /// Create a resource.
    Create,
    /// Update a resource in place.
    Update,
    /// Delete a resource.
    Delete,
    /// Nothing to do; exposes recorded outputs to dependents.
    NoOp,
}

impl Plan {
    /// Builds a plan from a diff.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::DependencyResolutionFailed`] if the step
    /// dependencies cannot be ordered.
    pub fn from_diff(
        diff: &DiffResult,
        graph: &ResourceGraph,
        state: Option<&StateSnapshot>,
        config_hash: &str,
    ) -> Result<Self> {
        let mut steps: Vec<PlanStep> = Vec::new();
        let mut final_step: HashMap<ResourceId, usize> = HashMap::new();
        let mut delete_step: HashMap<ResourceId, usize> = HashMap::new();

        for resource_diff in &diff.diffs {
            let id = &resource_diff.id;
            let step = |action, replacement, reason: &str| PlanStep {
                action,
                resource: id.clone(),
                changes: resource_diff.details.clone(),
                provider_id: resource_diff.provider_id.clone(),
                replacement,
                reason: reason.to_string(),
                dependencies: Vec::new(),
            };

            let last = match resource_diff.diff_type {
                DiffType::Create => push(&mut steps, step(StepAction::Create, false, "declared but not in state")),
                DiffType::Update => push(&mut steps, step(StepAction::Update, false, "properties changed")),
                DiffType::NoChange => push(&mut steps, step(StepAction::NoOp, false, "up to date")),
                DiffType::Delete => {
                    let idx = push(&mut steps, step(StepAction::Delete, false, "no longer declared"));
                    delete_step.insert(id.clone(), idx);
                    idx
                }
                DiffType::Replace => {
                    let delete = push(
                        &mut steps,
                        step(StepAction::Delete, true, "replacing: property cannot change in place"),
                    );
                    delete_step.insert(id.clone(), delete);

                    let mut create = step(StepAction::Create, true, "replacing: property cannot change in place");
                    create.provider_id = None;
                    create.dependencies.push(delete);
                    push(&mut steps, create)
                }
            };
            final_step.insert(id.clone(), last);
        }

        let mut extra: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); steps.len()];

        for (idx, step) in steps.iter().enumerate() {
            let id = &step.resource;

            if step.action == StepAction::Delete {
                let recorded_dependents = state.map(|s| s.recorded_dependents(id)).unwrap_or_default();
                if step.replacement {
                    // Dependents being torn down go first.
                    for dependent in recorded_dependents {
                        if let Some(&dep_delete) = delete_step.get(dependent) {
                            extra[idx].insert(dep_delete);
                        }
                    }
                } else {
                    for dependent in recorded_dependents {
                        if let Some(&dep_final) = final_step.get(dependent) {
                            extra[idx].insert(dep_final);
                        }
                    }
                }
            } else {
                for dependency in graph.dependencies_of(id) {
                    if let Some(&dep_final) = final_step.get(dependency) {
                        extra[idx].insert(dep_final);
                    }
                }
            }
        }

        for (step, deps) in steps.iter_mut().zip(extra) {
            for dep in deps {
                if !step.dependencies.contains(&dep) {
                    step.dependencies.push(dep);
                }
            }
        }

        Ok(Self {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            state_serial: state.map_or(0, |s| s.serial),
            steps: sort_steps(steps)?,
        })
    }

    /// Creates an empty plan (no changes needed).
    #[must_use]
    pub fn empty(config_hash: &str) -> Self {
        Self {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            state_serial: 0,
            steps: Vec::new(),
        }
    }

    /// Returns true if the plan has no steps at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns the number of steps.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.steps.len()
    }

    fn count(&self, action: StepAction) -> usize {
        self.steps.iter().filter(|s| s.action == action).count()
    }

    /// Returns the number of create steps.
    #[must_use]
    pub fn create_count(&self) -> usize {
        self.count(StepAction::Create)
    }

    /// Returns the number of update steps.
    #[must_use]
    pub fn update_count(&self) -> usize {
        self.count(StepAction::Update)
    }

    /// Returns the number of delete steps.
    #[must_use]
    pub fn delete_count(&self) -> usize {
        self.count(StepAction::Delete)
    }

    /// Returns the number of no-op steps.
    #[must_use]
    pub fn noop_count(&self) -> usize {
        self.count(StepAction::NoOp)
    }

    /// Returns the number of resources being replaced.
    #[must_use]
    pub fn replace_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.replacement && s.action == StepAction::Create)
            .count()
    }

    /// Returns true if any step would call the provider.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.steps.iter().any(|s| s.action != StepAction::NoOp)
    }

    /// Returns steps that can be executed immediately (no dependencies).
    #[must_use]
    pub fn ready_steps(&self) -> Vec<(usize, &PlanStep)> {
        self.steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.dependencies.is_empty())
            .collect()
    }

    /// Gets steps that depend on a specific step index.
    #[must_use]
    pub fn dependent_steps(&self, step_idx: usize) -> Vec<(usize, &PlanStep)> {
        self.steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.dependencies.contains(&step_idx))
            .collect()
    }
}

fn push(steps: &mut Vec<PlanStep>, step: PlanStep) -> usize {
    steps.push(step);
    steps.len() - 1
}

/// Stable topological sort; ties keep construction order. Indices are remapped.
fn sort_steps(steps: Vec<PlanStep>) -> Result<Vec<PlanStep>> {
    let n = steps.len();
    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

    for (idx, step) in steps.iter().enumerate() {
        for &dep in &step.dependencies {
            if dep >= n || dep == idx {
                return Err(PlanError::DependencyResolutionFailed {
                    message: format!("step {idx} ({}) has invalid dependency {dep}", step.resource),
                }
                .into());
            }
            in_degree[idx] += 1;
            dependents[dep].push(idx);
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(idx) = ready.pop_first() {
        order.push(idx);
        for &dependent in &dependents[idx] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() != n {
        let stuck: Vec<String> = (0..n)
            .filter(|&i| in_degree[i] > 0)
            .map(|i| format!("{} {}", steps[i].action, steps[i].resource))
            .collect();
        return Err(PlanError::DependencyResolutionFailed {
            message: format!("circular step dependencies between: {}", stuck.join(", ")),
        }
        .into());
    }

    let mut new_index = vec![0usize; n];
    for (position, &old) in order.iter().enumerate() {
        new_index[old] = position;
    }

    let mut slots: Vec<Option<PlanStep>> = steps.into_iter().map(Some).collect();
    let mut sorted = Vec::with_capacity(n);
    for old in order {
        if let Some(mut step) = slots[old].take() {
            step.dependencies = step.dependencies.iter().map(|&d| new_index[d]).collect();
            step.dependencies.sort_unstable();
            sorted.push(step);
        }
    }

    Ok(sorted)
}

impl PlanStep {
    /// Returns a human-readable description of the step.
    #[must_use]
    pub fn description(&self) -> String {
        let replacing = if self.replacement { " (replacement)" } else { "" };
        match self.action {
            StepAction::Create => format!("Create '{}'{replacing}", self.resource),
            StepAction::Update => format!("Update '{}'", self.resource),
            StepAction::Delete => format!("Delete '{}'{replacing}", self.resource),
            StepAction::NoOp => format!("No change for '{}'", self.resource),
        }
    }
}

impl std::fmt::Display for StepAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoOp => "noop",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlanStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.action, self.resource)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.has_changes() {
            return write!(f, "No changes required");
        }

        writeln!(
            f,
            "Plan: {} to create, {} to update, {} to delete, {} unchanged",
            self.create_count(),
            self.update_count(),
            self.delete_count(),
            self.noop_count()
        )?;
        for (i, step) in self.steps.iter().enumerate() {
            if step.action != StepAction::NoOp {
                writeln!(f, "  {i}. {step}")?;
            }
        }

        Ok(())
    }
}
