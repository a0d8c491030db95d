//! Plan executor for applying plans against a provider.
//!
//! Steps are dispatched as soon as every dependency is terminal, up to the
//! configured parallelism. The scheduler loop is the only writer of the state
//! snapshot: provider calls run in spawned tasks, and their results are folded
//! into state one at a time as they complete.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::ConfigHasher;
use crate::error::{ExecutionError, HalldyllError, Result};
use crate::graph::{Properties, ResourceGraph, ResourceId};
use crate::provider::{PropertyDiff, ProviderAdapter, diff_properties};
use crate::state::{StateRecord, StateSnapshot, StateStore};

use super::plan::{Plan, PlanStep, StepAction};

/// Default number of steps applied concurrently.
pub const DEFAULT_PARALLELISM: usize = 10;

/// Executor for plans.
pub struct PlanExecutor<'a> {
    /// Provider plus retry policy.
    adapter: ProviderAdapter,
    /// Where checkpoints and the final snapshot go.
    store: &'a dyn StateStore,
    /// Maximum concurrent provider steps.
    parallelism: usize,
    /// Save after every successful provider step.
    checkpoint: bool,
    /// Flips to `true` to stop dispatching.
    cancel: Option<watch::Receiver<bool>>,
    /// Properties hasher.
    hasher: ConfigHasher,
}

/// Status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not started yet.
    Pending,
    /// Provider call in progress.
    Running,
    /// Finished successfully.
    Applied,
    /// Finished with an error.
    Failed,
    /// Not run because a dependency did not apply.
    Skipped,
    /// Not run because the run was cancelled.
    Cancelled,
}

/// Result of executing a single step.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    /// Step index in the plan.
    pub index: usize,
    /// What the step did.
    pub action: StepAction,
    /// Resource the step applies to.
    pub resource: ResourceId,
    /// Final status.
    pub status: StepStatus,
    /// Provider identity after the step, if any.
    pub provider_id: Option<String>,
    /// Error message (if failed, skipped or cancelled).
    pub error: Option<String>,
    /// Wall time of the step.
    pub duration_ms: u64,
}

/// Result of executing the entire plan.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Individual step reports, in plan order.
    pub steps: Vec<StepReport>,
    /// Steps applied with a provider change.
    pub applied: usize,
    /// Steps that failed.
    pub failed: usize,
    /// Steps skipped due to failed dependencies.
    pub skipped: usize,
    /// Steps never started because of cancellation.
    pub cancelled: usize,
    /// No-op steps.
    pub noop: usize,
    /// Whether every step applied.
    pub success: bool,
    /// Total wall time.
    pub duration_ms: u64,
}

/// Provider work handed to a spawned task.
enum Work {
    Create {
        resource_type: String,
        properties: Properties,
    },
    Update {
        resource_type: String,
        provider_id: String,
        diff: PropertyDiff,
        properties: Properties,
    },
    Delete {
        resource_type: String,
        provider_id: String,
    },
}

/// What a successful step changed.
enum Outcome {
    Created {
        provider_id: String,
        properties: Properties,
        outputs: Properties,
    },
    Updated {
        properties: Properties,
        outputs: Properties,
        called_provider: bool,
    },
    Deleted {
        called_provider: bool,
    },
    Unchanged,
}

/// A step either completes without the provider or needs a task.
enum Prepared {
    Inline(std::result::Result<Outcome, HalldyllError>),
    Work(Work),
}

type TaskOutput = (usize, std::result::Result<Outcome, HalldyllError>, Duration);

/// Mutable bookkeeping of one run.
struct Run {
    reports: Vec<StepReport>,
    remaining: Vec<usize>,
    dependents: Vec<Vec<usize>>,
    ready: BTreeSet<usize>,
    outputs: BTreeMap<ResourceId, Properties>,
}

impl<'a> PlanExecutor<'a> {
    /// Creates a new plan executor.
    #[must_use]
    pub fn new(adapter: ProviderAdapter, store: &'a dyn StateStore) -> Self {
        Self {
            adapter,
            store,
            parallelism: DEFAULT_PARALLELISM,
            checkpoint: true,
            cancel: None,
            hasher: ConfigHasher::new(),
        }
    }

    /// Sets the maximum number of concurrent steps (at least 1).
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Sets whether state is saved after every successful step.
    #[must_use]
    pub const fn with_checkpoint(mut self, checkpoint: bool) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    /// Stops dispatching new steps once `cancel` turns `true`.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Executes a plan, updating `state` as steps succeed.
    ///
    /// Step failures never abort the run; they are reported per step.
    ///
    /// # Errors
    ///
    /// Returns an error only if the final state save fails.
    pub async fn execute(
        &self,
        plan: &Plan,
        graph: &ResourceGraph,
        state: &mut StateSnapshot,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        info!(
            "Executing plan with {} steps (parallelism {})",
            plan.len(),
            self.parallelism
        );

        let mut run = Run::new(plan);
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut tasks: JoinSet<TaskOutput> = JoinSet::new();
        let mut cancel = self.cancel.clone();
        let mut cancelled = false;

        loop {
            if let Some(rx) = &cancel
                && *rx.borrow()
            {
                cancelled = true;
            }

            if !cancelled {
                while let Some(&idx) = run.ready.first() {
                    let step = &plan.steps[idx];
                    match self.prepare(step, graph, state, &run.outputs) {
                        Prepared::Inline(result) => {
                            run.ready.remove(&idx);
                            self.complete(plan, graph, state, &mut run, idx, result, Duration::ZERO)
                                .await;
                        }
                        Prepared::Work(work) => {
                            let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                                break;
                            };
                            run.ready.remove(&idx);
                            run.reports[idx].status = StepStatus::Running;
                            debug!("Dispatching step {idx}: {step}");

                            let adapter = self.adapter.clone();
                            tasks.spawn(async move {
                                let begun = Instant::now();
                                let result = match tokio::spawn(perform(adapter, work)).await {
                                    Ok(result) => result,
                                    Err(e) => Err(ExecutionError::TaskFailed {
                                        message: e.to_string(),
                                    }
                                    .into()),
                                };
                                drop(permit);
                                (idx, result, begun.elapsed())
                            });
                        }
                    }
                }
            }

            if tasks.is_empty() {
                break;
            }

            let watching = cancel.is_some() && !cancelled;
            tokio::select! {
                joined = tasks.join_next() => {
                    match joined {
                        Some(Ok((idx, result, elapsed))) => {
                            self.complete(plan, graph, state, &mut run, idx, result, elapsed).await;
                        }
                        Some(Err(e)) => error!("Step task aborted: {e}"),
                        None => {}
                    }
                }
                changed = async {
                    match cancel.as_mut() {
                        Some(rx) => rx.changed().await,
                        None => std::future::pending().await,
                    }
                }, if watching => {
                    if changed.is_err() {
                        cancel = None;
                    } else if cancel.as_ref().is_some_and(|rx| *rx.borrow()) {
                        warn!("Cancellation requested; waiting for {} in-flight step(s)", tasks.len());
                        cancelled = true;
                    }
                }
            }
        }

        for report in &mut run.reports {
            if report.status == StepStatus::Pending {
                report.status = StepStatus::Cancelled;
                report.error = Some(ExecutionError::Cancelled.to_string());
            }
        }

        state.touch();
        self.store.save(state).await?;

        let result = ExecutionResult::from_reports(run.reports, started.elapsed());
        info!(
            "Execution finished: {} applied, {} failed, {} skipped, {} cancelled, {} unchanged",
            result.applied, result.failed, result.skipped, result.cancelled, result.noop
        );
        Ok(result)
    }

    /// Resolves a step into provider work, or completes it without the provider.
    fn prepare(
        &self,
        step: &PlanStep,
        graph: &ResourceGraph,
        state: &StateSnapshot,
        outputs: &BTreeMap<ResourceId, Properties>,
    ) -> Prepared {
        let id = &step.resource;
        let resource_type = id.resource_type.clone();

        match step.action {
            StepAction::NoOp => Prepared::Inline(Ok(Outcome::Unchanged)),
            StepAction::Delete => {
                let provider_id = step
                    .provider_id
                    .clone()
                    .or_else(|| state.get(id).map(|r| r.provider_id.clone()));
                match provider_id {
                    Some(provider_id) => Prepared::Work(Work::Delete {
                        resource_type,
                        provider_id,
                    }),
                    None => {
                        debug!("{id} has no provider identity; nothing to delete");
                        Prepared::Inline(Ok(Outcome::Deleted {
                            called_provider: false,
                        }))
                    }
                }
            }
            StepAction::Create | StepAction::Update => {
                let Some(resource) = graph.get(id) else {
                    return Prepared::Inline(Err(HalldyllError::internal(format!(
                        "{id} is planned but not declared"
                    ))));
                };

                let properties = match resource.resolve(outputs) {
                    Ok(properties) => properties,
                    Err(reference) => {
                        return Prepared::Inline(Err(ExecutionError::UnresolvedReference {
                            target: reference.target.to_string(),
                            output: reference.output,
                        }
                        .into()));
                    }
                };

                if step.action == StepAction::Create {
                    return Prepared::Work(Work::Create {
                        resource_type,
                        properties,
                    });
                }

                let Some(record) = state.get(id) else {
                    return Prepared::Inline(Err(ExecutionError::MissingProviderId {
                        resource: id.to_string(),
                    }
                    .into()));
                };

                let diff = diff_properties(&record.properties, &properties);
                if diff.is_empty() {
                    debug!("{id} resolved to its recorded properties; no update needed");
                    return Prepared::Inline(Ok(Outcome::Updated {
                        properties,
                        outputs: record.outputs.clone(),
                        called_provider: false,
                    }));
                }

                Prepared::Work(Work::Update {
                    resource_type,
                    provider_id: record.provider_id.clone(),
                    diff,
                    properties,
                })
            }
        }
    }

    /// Folds a finished step into state and unblocks or skips dependents.
    #[allow(clippy::too_many_arguments)]
    async fn complete(
        &self,
        plan: &Plan,
        graph: &ResourceGraph,
        state: &mut StateSnapshot,
        run: &mut Run,
        idx: usize,
        result: std::result::Result<Outcome, HalldyllError>,
        elapsed: Duration,
    ) {
        let step = &plan.steps[idx];
        let id = &step.resource;
        run.reports[idx].duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("{} failed: {e}", step.description());
                run.reports[idx].status = StepStatus::Failed;
                run.reports[idx].error = Some(e.to_string());
                run.skip_dependents_of(idx, id);
                return;
            }
        };

        let dependencies = graph.get(id).map(|r| r.dependencies()).unwrap_or_default();
        let mut changed = true;

        match outcome {
            Outcome::Created {
                provider_id,
                properties,
                outputs,
            } => {
                info!("Created {id} ({provider_id})");
                let hash = self.hasher.hash_properties(&properties);
                run.reports[idx].provider_id = Some(provider_id.clone());
                run.outputs.insert(id.clone(), outputs.clone());
                state.set(
                    id.clone(),
                    StateRecord::new(provider_id, properties, outputs, dependencies, hash),
                );
            }
            Outcome::Updated {
                properties,
                outputs,
                called_provider,
            } => {
                changed = called_provider;
                let hash = self.hasher.hash_properties(&properties);
                if let Some(record) = state.get(id) {
                    if called_provider {
                        info!("Updated {id} ({})", record.provider_id);
                    }
                    run.reports[idx].provider_id = Some(record.provider_id.clone());
                    let updated = record.updated(properties, outputs.clone(), dependencies, hash);
                    state.set(id.clone(), updated);
                }
                run.outputs.insert(id.clone(), outputs);
            }
            Outcome::Deleted { called_provider } => {
                changed = called_provider;
                if called_provider {
                    info!("Deleted {id}");
                }
                state.remove(id);
                run.outputs.remove(id);
            }
            Outcome::Unchanged => {
                changed = false;
                if let Some(record) = state.resources.get_mut(id) {
                    record.dependencies = dependencies;
                    run.reports[idx].provider_id = Some(record.provider_id.clone());
                    run.outputs.insert(id.clone(), record.outputs.clone());
                }
            }
        }

        run.reports[idx].status = StepStatus::Applied;
        run.release_dependents_of(idx);

        if changed && self.checkpoint {
            state.touch();
            if let Err(e) = self.store.save(state).await {
                error!("Checkpoint save after {id} failed: {e}");
            }
        }
    }
}

/// Performs provider work inside a spawned task.
async fn perform(adapter: ProviderAdapter, work: Work) -> std::result::Result<Outcome, HalldyllError> {
    match work {
        Work::Create {
            resource_type,
            properties,
        } => {
            let created = adapter.create(&resource_type, &properties).await?;
            Ok(Outcome::Created {
                provider_id: created.provider_id,
                properties,
                outputs: created.outputs,
            })
        }
        Work::Update {
            resource_type,
            provider_id,
            diff,
            properties,
        } => {
            let outputs = adapter.update(&resource_type, &provider_id, &diff).await?;
            Ok(Outcome::Updated {
                properties,
                outputs,
                called_provider: true,
            })
        }
        Work::Delete {
            resource_type,
            provider_id,
        } => {
            adapter.delete(&resource_type, &provider_id).await?;
            Ok(Outcome::Deleted {
                called_provider: true,
            })
        }
    }
}

impl Run {
    fn new(plan: &Plan) -> Self {
        let n = plan.steps.len();
        let mut dependents = vec![Vec::new(); n];
        let mut remaining = vec![0; n];

        for (idx, step) in plan.steps.iter().enumerate() {
            remaining[idx] = step.dependencies.len();
            for &dep in &step.dependencies {
                dependents[dep].push(idx);
            }
        }

        let reports = plan
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| StepReport {
                index,
                action: step.action,
                resource: step.resource.clone(),
                status: StepStatus::Pending,
                provider_id: step.provider_id.clone(),
                error: None,
                duration_ms: 0,
            })
            .collect();

        let ready = (0..n).filter(|&i| remaining[i] == 0).collect();

        Self {
            reports,
            remaining,
            dependents,
            ready,
            outputs: BTreeMap::new(),
        }
    }

    fn release_dependents_of(&mut self, idx: usize) {
        for &dependent in &self.dependents[idx] {
            self.remaining[dependent] -= 1;
            if self.remaining[dependent] == 0 && self.reports[dependent].status == StepStatus::Pending {
                self.ready.insert(dependent);
            }
        }
    }

    fn skip_dependents_of(&mut self, idx: usize, failed: &ResourceId) {
        let mut stack = vec![idx];
        while let Some(current) = stack.pop() {
            for &dependent in &self.dependents[current] {
                let report = &mut self.reports[dependent];
                if report.status == StepStatus::Pending {
                    warn!("Skipping {} {}: {failed} did not apply", report.action, report.resource);
                    report.status = StepStatus::Skipped;
                    report.error = Some(
                        ExecutionError::DependencyFailed {
                            dependency: failed.to_string(),
                        }
                        .to_string(),
                    );
                    self.ready.remove(&dependent);
                    stack.push(dependent);
                }
            }
        }
    }
}

impl ExecutionResult {
    fn from_reports(steps: Vec<StepReport>, elapsed: Duration) -> Self {
        let count = |status: StepStatus| steps.iter().filter(|s| s.status == status).count();
        let noop = steps
            .iter()
            .filter(|s| s.status == StepStatus::Applied && s.action == StepAction::NoOp)
            .count();
        let applied = count(StepStatus::Applied) - noop;
        let failed = count(StepStatus::Failed);
        let skipped = count(StepStatus::Skipped);
        let cancelled = count(StepStatus::Cancelled);

        Self {
            applied,
            failed,
            skipped,
            cancelled,
            noop,
            success: failed == 0 && skipped == 0 && cancelled == 0,
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            steps,
        }
    }

    /// Report for the step acting on `resource` with `action`.
    #[must_use]
    pub fn step(&self, action: StepAction, resource: &ResourceId) -> Option<&StepReport> {
        self.steps
            .iter()
            .find(|s| s.action == action && &s.resource == resource)
    }

    /// Reports with the given status.
    #[must_use]
    pub fn with_status(&self, status: StepStatus) -> Vec<&StepReport> {
        self.steps.iter().filter(|s| s.status == status).collect()
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBuilder, Reference, Resource};
    use crate::planner::DiffEngine;
    use crate::provider::{CallKind, MemoryProvider, RetryPolicy};
    use crate::state::LocalStateStore;
    use serde_json::json;
    use tempfile::TempDir;

    struct Harness {
        provider: Arc<MemoryProvider>,
        store: LocalStateStore,
        _dir: TempDir,
    }

    impl Harness {
        fn new(provider: MemoryProvider) -> Self {
            let dir = TempDir::new().expect("temp dir");
            Self {
                provider: Arc::new(provider),
                store: LocalStateStore::with_base_dir(dir.path()),
                _dir: dir,
            }
        }

        fn adapter(&self) -> ProviderAdapter {
            ProviderAdapter::new(self.provider.clone(), RetryPolicy::none())
        }

        async fn apply(
            &self,
            graph: &ResourceGraph,
            state: &mut StateSnapshot,
            parallelism: usize,
        ) -> ExecutionResult {
            let diff = DiffEngine::new().compute_diff(graph, Some(&*state));
            let plan = Plan::from_diff(&diff, graph, Some(&*state), "hash").expect("plan");
            PlanExecutor::new(self.adapter(), &self.store)
                .with_parallelism(parallelism)
                .execute(&plan, graph, state)
                .await
                .expect("execute")
        }
    }

    fn bucket_and_policy() -> ResourceGraph {
        GraphBuilder::new()
            .resource(Resource::new("bucket", "logs").with_property("bucket", json!("logs")))
            .resource(
                Resource::new("policy", "read")
                    .with_property("resource", Reference::new(ResourceId::new("bucket", "logs"), "arn")),
            )
            .build()
            .expect("graph")
    }

    fn independent(count: usize) -> ResourceGraph {
        let mut builder = GraphBuilder::new();
        for i in 0..count {
            builder.add(Resource::new("bucket", format!("b{i}")).with_property("n", json!(i)));
        }
        builder.build().expect("graph")
    }

    #[tokio::test]
    async fn test_references_resolve_from_applied_dependencies() {
        let harness = Harness::new(MemoryProvider::new());
        let graph = bucket_and_policy();
        let mut state = StateSnapshot::new("demo", "dev");

        let result = harness.apply(&graph, &mut state, 4).await;
        assert!(result.success);
        assert_eq!(result.applied, 2);

        let bucket = state.get(&ResourceId::new("bucket", "logs")).expect("bucket record");
        let policy = state.get(&ResourceId::new("policy", "read")).expect("policy record");
        assert_eq!(policy.properties["resource"], bucket.outputs["arn"]);
        assert!(policy.dependencies.contains(&ResourceId::new("bucket", "logs")));

        let saved = harness.store.load().await.expect("load").expect("saved");
        assert_eq!(saved.resources, state.resources);
    }

    #[tokio::test]
    async fn test_second_apply_makes_no_provider_calls() {
        let harness = Harness::new(MemoryProvider::new());
        let graph = bucket_and_policy();
        let mut state = StateSnapshot::new("demo", "dev");

        harness.apply(&graph, &mut state, 4).await;
        let calls = harness.provider.call_count();

        let second = harness.apply(&graph, &mut state, 4).await;
        assert!(second.success);
        assert_eq!(second.applied, 0);
        assert_eq!(second.noop, 2);
        assert_eq!(harness.provider.call_count(), calls);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_only() {
        let provider = MemoryProvider::new();
        provider.fail_when("bucket", json!("logs"));
        let harness = Harness::new(provider);

        let graph = GraphBuilder::new()
            .resource(Resource::new("bucket", "logs").with_property("bucket", json!("logs")))
            .resource(
                Resource::new("policy", "read")
                    .with_property("resource", Reference::new(ResourceId::new("bucket", "logs"), "arn")),
            )
            .resource(Resource::new("bucket", "other").with_property("bucket", json!("other")))
            .build()
            .expect("graph");
        let mut state = StateSnapshot::new("demo", "dev");

        let result = harness.apply(&graph, &mut state, 4).await;

        assert!(!result.success);
        assert_eq!(result.failed, 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.applied, 1);

        let policy = result
            .step(StepAction::Create, &ResourceId::new("policy", "read"))
            .expect("policy step");
        assert_eq!(policy.status, StepStatus::Skipped);
        assert!(policy.error.as_deref().is_some_and(|e| e.contains("bucket.logs")));

        assert!(state.get(&ResourceId::new("policy", "read")).is_none());
        assert!(state.get(&ResourceId::new("bucket", "logs")).is_none());
        assert!(state.get(&ResourceId::new("bucket", "other")).is_some());
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let harness = Harness::new(MemoryProvider::new().with_latency(Duration::from_millis(20)));
        let graph = independent(8);
        let mut state = StateSnapshot::new("demo", "dev");

        let result = harness.apply(&graph, &mut state, 3).await;

        assert!(result.success);
        assert_eq!(result.applied, 8);
        assert!(harness.provider.peak_in_flight() <= 3);
        assert!(harness.provider.peak_in_flight() >= 2);
    }

    #[tokio::test]
    async fn test_parallelism_of_one_is_sequential() {
        let harness = Harness::new(MemoryProvider::new().with_latency(Duration::from_millis(5)));
        let graph = independent(4);
        let mut state = StateSnapshot::new("demo", "dev");

        harness.apply(&graph, &mut state, 1).await;
        assert_eq!(harness.provider.peak_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_makes_no_calls() {
        let harness = Harness::new(MemoryProvider::new());
        let graph = independent(3);
        let mut state = StateSnapshot::new("demo", "dev");
        let (_tx, rx) = watch::channel(true);

        let diff = DiffEngine::new().compute_diff(&graph, Some(&state));
        let plan = Plan::from_diff(&diff, &graph, Some(&state), "hash").expect("plan");
        let result = PlanExecutor::new(harness.adapter(), &harness.store)
            .with_cancellation(rx)
            .execute(&plan, &graph, &mut state)
            .await
            .expect("execute");

        assert_eq!(result.cancelled, 3);
        assert!(!result.success);
        assert_eq!(harness.provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_lets_in_flight_steps_finish() {
        let harness = Harness::new(MemoryProvider::new().with_latency(Duration::from_millis(60)));
        let graph = independent(3);
        let mut state = StateSnapshot::new("demo", "dev");
        let (tx, rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(15)).await;
            let _ = tx.send(true);
            tokio::time::sleep(Duration::from_millis(500)).await;
        });

        let diff = DiffEngine::new().compute_diff(&graph, Some(&state));
        let plan = Plan::from_diff(&diff, &graph, Some(&state), "hash").expect("plan");
        let result = PlanExecutor::new(harness.adapter(), &harness.store)
            .with_parallelism(1)
            .with_cancellation(rx)
            .execute(&plan, &graph, &mut state)
            .await
            .expect("execute");

        assert_eq!(result.applied, 1);
        assert_eq!(result.cancelled, 2);
        assert_eq!(state.resources.len(), 1);

        let saved = harness.store.load().await.expect("load").expect("saved");
        assert_eq!(saved.resources.len(), 1);
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let harness = Harness::new(MemoryProvider::new());
        let mut state = StateSnapshot::new("demo", "dev");
        harness.apply(&bucket_and_policy(), &mut state, 2).await;

        let bucket_id = ResourceId::new("bucket", "logs");
        let changed = GraphBuilder::new()
            .resource(
                Resource::new("bucket", "logs")
                    .with_property("bucket", json!("logs"))
                    .with_property("acl", json!("private")),
            )
            .build()
            .expect("graph");

        let result = harness.apply(&changed, &mut state, 2).await;
        assert!(result.success);
        assert_eq!(harness.provider.count(CallKind::Update), 1);
        assert_eq!(harness.provider.count(CallKind::Delete), 1);
        assert_eq!(state.resources.len(), 1);
        assert_eq!(
            state.get(&bucket_id).map(|r| r.properties["acl"].clone()),
            Some(json!("private"))
        );
    }

    #[tokio::test]
    async fn test_delete_without_provider_id_is_already_gone() {
        let harness = Harness::new(MemoryProvider::new());
        let mut state = StateSnapshot::new("demo", "dev");
        let plan = Plan {
            created_at: chrono::Utc::now(),
            config_hash: String::new(),
            state_serial: 0,
            steps: vec![PlanStep {
                action: StepAction::Delete,
                resource: ResourceId::new("bucket", "ghost"),
                changes: Vec::new(),
                provider_id: None,
                replacement: false,
                reason: String::new(),
                dependencies: Vec::new(),
            }],
        };

        let result = PlanExecutor::new(harness.adapter(), &harness.store)
            .execute(&plan, &ResourceGraph::default(), &mut state)
            .await
            .expect("execute");

        assert!(result.success);
        assert_eq!(harness.provider.call_count(), 0);
    }
}
