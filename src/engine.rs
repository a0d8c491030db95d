//! Provisioning engine.
//!
//! Orchestrates a run: build the graph, lock the state, diff, plan, execute,
//! resolve exports and save. Drift checks and refreshes go through the same
//! provider adapter.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, StackConfig};
use crate::error::{HalldyllError, PlanError, Result};
use crate::graph::{GraphBuilder, Properties, PropertyValue, ResourceGraph, ResourceId};
use crate::planner::{DiffEngine, ExecutionResult, Plan, PlanExecutor, ReplacementPolicy};
use crate::provider::ProviderAdapter;
use crate::state::{HistoryEntry, Operation, StateSnapshot, StateStore, generate_holder_id};

/// Provisioning engine for one stack.
pub struct Engine<'a> {
    /// Stack configuration.
    config: &'a StackConfig,
    /// State store.
    store: &'a dyn StateStore,
    /// Provider plus retry policy.
    adapter: ProviderAdapter,
    /// Configuration hasher.
    hasher: ConfigHasher,
    /// Maximum concurrent steps.
    parallelism: usize,
    /// Cancellation signal for apply and destroy.
    cancel: Option<watch::Receiver<bool>>,
}

/// Result of an apply or destroy run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    /// The plan that was executed.
    pub plan: Plan,
    /// Per-step results.
    pub execution: ExecutionResult,
    /// Resolved exports after the run.
    pub exports: BTreeMap<String, serde_json::Value>,
}

/// How a recorded resource differs from what the provider reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriftKind {
    /// The provider no longer knows the resource.
    Missing,
    /// Outputs differ from the recorded ones.
    Changed {
        /// Output names whose values differ.
        fields: Vec<String>,
    },
}

/// A single drifted resource.
#[derive(Debug, Clone, Serialize)]
pub struct DriftEntry {
    /// Logical identity.
    pub resource: ResourceId,
    /// Provider identity from state.
    pub provider_id: String,
    /// What drifted.
    #[serde(flatten)]
    pub kind: DriftKind,
}

/// Report of drift detection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriftReport {
    /// Resources that have drifted.
    pub drifted: Vec<DriftEntry>,
    /// Number of records checked.
    pub checked: usize,
}

impl<'a> Engine<'a> {
    /// Creates an engine using the stack's engine settings.
    #[must_use]
    pub const fn new(config: &'a StackConfig, store: &'a dyn StateStore, adapter: ProviderAdapter) -> Self {
        Self {
            config,
            store,
            adapter,
            hasher: ConfigHasher::new(),
            parallelism: config.engine.parallelism,
            cancel: None,
        }
    }

    /// Overrides the configured parallelism.
    #[must_use]
    pub const fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Stops dispatching steps once `cancel` turns `true`.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Builds the desired resource graph.
    ///
    /// # Errors
    ///
    /// Returns a graph error for duplicates, unknown references or cycles.
    pub fn graph(&self) -> Result<ResourceGraph> {
        GraphBuilder::from_config(self.config).build()
    }

    /// Loads the current snapshot, or an empty one for a new stack.
    ///
    /// # Errors
    ///
    /// Returns an error if stored state cannot be read or is corrupt.
    pub async fn load_state(&self) -> Result<StateSnapshot> {
        Ok(self.store.load().await?.unwrap_or_else(|| {
            StateSnapshot::new(&self.config.project.name, &self.config.project.environment)
        }))
    }

    /// Computes the plan for the stack without touching the provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph is invalid or state cannot be loaded.
    pub async fn plan(&self) -> Result<Plan> {
        let graph = self.graph()?;
        let state = self.load_state().await?;
        self.plan_for(&graph, &state)
    }

    /// Applies the stack.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph is invalid, the state is locked or
    /// corrupt, or the final save fails. Step failures are reported in the
    /// result instead.
    pub async fn apply(&self) -> Result<RunReport> {
        let graph = self.graph()?;
        info!(
            "Applying {}/{} ({} resources)",
            self.config.project.name,
            self.config.project.environment,
            graph.len()
        );
        self.locked(Operation::Apply, graph, None).await
    }

    /// Applies the stack only if it would execute `approved`.
    ///
    /// The plan is recomputed under the lock; a different stack hash or
    /// state serial means someone changed things after the plan was shown.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Stale`] if the stack or state moved on, plus
    /// everything [`Engine::apply`] can return.
    pub async fn apply_approved(&self, approved: &Plan) -> Result<RunReport> {
        let graph = self.graph()?;
        self.locked(Operation::Apply, graph, Some(approved)).await
    }

    /// Deletes every recorded resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the state is locked or corrupt, or the final save
    /// fails.
    pub async fn destroy(&self) -> Result<RunReport> {
        info!(
            "Destroying {}/{}",
            self.config.project.name, self.config.project.environment
        );
        self.locked(Operation::Destroy, ResourceGraph::default(), None).await
    }

    /// Compares recorded outputs with what the provider reports.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded or a read fails.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        let state = self.load_state().await?;
        self.observe(&state).await
    }

    /// Writes observed outputs back into state and drops missing records.
    ///
    /// # Errors
    ///
    /// Returns an error if the state is locked, a read fails, or the save
    /// fails.
    pub async fn refresh(&self) -> Result<DriftReport> {
        let lock = self.store.acquire_lock(&generate_holder_id()).await?;
        let result = self.refresh_locked().await;
        self.release(&lock.lock_id).await;
        result
    }

    /// Exports recorded by the last apply.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded.
    pub async fn exports(&self) -> Result<BTreeMap<String, serde_json::Value>> {
        Ok(self.load_state().await?.exports)
    }

    fn plan_for(&self, graph: &ResourceGraph, state: &StateSnapshot) -> Result<Plan> {
        let diff = DiffEngine::new()
            .with_policy(ReplacementPolicy::from_config(&self.config.engine))
            .compute_diff(graph, Some(state));
        info!(
            "Diff: {} creates, {} updates, {} replaces, {} deletes, {} unchanged",
            diff.creates, diff.updates, diff.replaces, diff.deletes, diff.unchanged
        );
        Plan::from_diff(&diff, graph, Some(state), &self.hasher.hash_stack(self.config))
    }

    async fn locked(
        &self,
        operation: Operation,
        graph: ResourceGraph,
        approved: Option<&Plan>,
    ) -> Result<RunReport> {
        let lock = self.store.acquire_lock(&generate_holder_id()).await?;
        debug!("Acquired state lock {}", lock.lock_id);

        let result = self.run(operation, &graph, approved).await;
        self.release(&lock.lock_id).await;
        result
    }

    async fn release(&self, lock_id: &str) {
        if let Err(e) = self.store.release_lock(lock_id).await {
            error!("Failed to release state lock {lock_id}: {e}");
        }
    }

    async fn run(
        &self,
        operation: Operation,
        graph: &ResourceGraph,
        approved: Option<&Plan>,
    ) -> Result<RunReport> {
        let mut state = self.load_state().await?;
        let plan = self.plan_for(graph, &state)?;
        if let Some(approved) = approved {
            ensure_current(approved, &plan)?;
        }

        let mut executor = PlanExecutor::new(self.adapter.clone(), self.store)
            .with_parallelism(self.parallelism)
            .with_checkpoint(self.config.engine.checkpoint);
        if let Some(cancel) = &self.cancel {
            executor = executor.with_cancellation(cancel.clone());
        }

        let execution = executor.execute(&plan, graph, &mut state).await?;
        let config_hash = self.hasher.hash_stack(self.config);

        match operation {
            Operation::Destroy if execution.success => state.exports.clear(),
            Operation::Destroy => {}
            _ => state.exports = self.resolve_exports(&state),
        }
        state.config_hash.clone_from(&config_hash);

        let mut entry = HistoryEntry::new(operation, &config_hash).with_counts(
            execution.applied,
            execution.failed,
            execution.skipped,
        );
        if execution.cancelled > 0 {
            entry = entry.failed(&format!("{} step(s) cancelled", execution.cancelled));
        }
        state.add_history(entry);
        state.touch();
        self.store.save(&state).await?;

        Ok(RunReport {
            plan,
            execution,
            exports: state.exports,
        })
    }

    fn resolve_exports(&self, state: &StateSnapshot) -> BTreeMap<String, serde_json::Value> {
        let outputs = state.outputs();
        let mut exports = BTreeMap::new();

        for (name, value) in &self.config.exports {
            match value {
                PropertyValue::Literal(v) => {
                    exports.insert(name.clone(), v.clone());
                }
                PropertyValue::Reference(reference) => match reference.lookup(&outputs) {
                    Some(v) => {
                        exports.insert(name.clone(), v.clone());
                    }
                    None => warn!(
                        "Export '{name}' is unresolved: {}.{} has no value",
                        reference.target, reference.output
                    ),
                },
            }
        }

        exports
    }

    async fn observe(&self, state: &StateSnapshot) -> Result<DriftReport> {
        Ok(self.read_all(state).await?.0)
    }

    /// Reads every recorded resource, returning drift plus changed outputs.
    async fn read_all(
        &self,
        state: &StateSnapshot,
    ) -> Result<(DriftReport, BTreeMap<ResourceId, Properties>)> {
        let mut report = DriftReport {
            drifted: Vec::new(),
            checked: state.resources.len(),
        };
        let mut observed_outputs = BTreeMap::new();

        for (id, record) in &state.resources {
            let observed = self
                .adapter
                .read(&id.resource_type, &record.provider_id)
                .await?;

            let kind = match observed {
                None => DriftKind::Missing,
                Some(outputs) => {
                    let fields: Vec<String> = record
                        .outputs
                        .keys()
                        .chain(outputs.keys())
                        .filter(|key| record.outputs.get(*key) != outputs.get(*key))
                        .cloned()
                        .collect::<BTreeSet<_>>()
                        .into_iter()
                        .collect();
                    if fields.is_empty() {
                        continue;
                    }
                    observed_outputs.insert(id.clone(), outputs);
                    DriftKind::Changed { fields }
                }
            };

            debug!("{id} drifted: {kind}");
            report.drifted.push(DriftEntry {
                resource: id.clone(),
                provider_id: record.provider_id.clone(),
                kind,
            });
        }

        info!(
            "Drift check: {} of {} resources drifted",
            report.drifted.len(),
            report.checked
        );
        Ok((report, observed_outputs))
    }

    async fn refresh_locked(&self) -> Result<DriftReport> {
        let mut state = self.load_state().await?;
        let (report, mut observed) = self.read_all(&state).await?;

        for entry in &report.drifted {
            if entry.kind == DriftKind::Missing {
                info!("{} no longer exists; dropping it from state", entry.resource);
                state.remove(&entry.resource);
            } else if let (Some(outputs), Some(record)) = (
                observed.remove(&entry.resource),
                state.resources.get_mut(&entry.resource),
            ) {
                record.outputs = outputs;
                record.updated_at = chrono::Utc::now();
            }
        }

        let hash = state.config_hash.clone();
        state.add_history(HistoryEntry::new(Operation::Refresh, &hash).with_counts(
            report.drifted.len(),
            0,
            0,
        ));
        state.touch();
        self.store.save(&state).await?;
        Ok(report)
    }
}

fn ensure_current(approved: &Plan, current: &Plan) -> Result<()> {
    let message = if approved.config_hash != current.config_hash {
        String::from("the stack configuration changed")
    } else if approved.state_serial != current.state_serial {
        format!(
            "state moved from serial {} to {}",
            approved.state_serial, current.state_serial
        )
    } else {
        return Ok(());
    };
    Err(HalldyllError::Plan(PlanError::Stale { message }))
}

impl RunReport {
    /// True when every step applied; failed, skipped or cancelled steps
    /// all make the run unsuccessful.
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        self.execution.success
    }
}

impl DriftReport {
    /// Returns true if any resource drifted.
    #[must_use]
    pub fn has_drift(&self) -> bool {
        !self.drifted.is_empty()
    }
}

impl std::fmt::Display for DriftKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => write!(f, "missing"),
            Self::Changed { fields } => write!(f, "changed: {}", fields.join(", ")),
        }
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.drifted.is_empty() {
            return write!(f, "No drift detected across {} resources", self.checked);
        }
        writeln!(f, "Drift detected:")?;
        for entry in &self.drifted {
            writeln!(f, "  - {} ({}): {}", entry.resource, entry.provider_id, entry.kind)?;
        }
        Ok(())
    }
}
