use super::pool::{WorkerPool, WorkerPools};
use super::registry::{StepContext, StepDescriptor, StepRegistry};
use super::reporter::StateReporter;
use super::retry::RetryPolicy;
use super::step_executor::{StepExecutor, StepOutcome};
use super::validator::ValidatedWorkflow;
use crate::error::NodeFailure;
use crate::events::{Event, EventLog, EventType};
use crate::settings::EngineSettings;
use crate::tenant::TenantId;
use crate::types::{
    NodeId, ProvisioningStatus, StepOutputs, WorkflowDirection, WorkflowId, WorkflowNode,
};
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Outputs of a node that completed, `None` if it failed
type NodeRun = Option<Arc<StepOutputs>>;

/// Completion signal of one node, awaited by each of its dependents
type WorkflowProcess = Shared<BoxFuture<'static, NodeRun>>;

/// Identity of one execution
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub workflow_id: WorkflowId,
    pub tenant_id: Option<TenantId>,
    pub direction: WorkflowDirection,
}

/// Outcome of a drained execution
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    /// COMPLETED or FAILED
    pub status: ProvisioningStatus,
    pub completed: Vec<NodeId>,
    pub failed: Vec<NodeId>,
    pub deadline_exceeded: bool,
    pub cancelled: bool,
    pub duration: Duration,
}

impl ExecutionReport {
    /// Summary for the workflow state, `None` on success
    pub fn error(&self) -> Option<String> {
        if self.status == ProvisioningStatus::Completed {
            return None;
        }
        let mut reasons = Vec::new();
        if self.cancelled {
            reasons.push("execution was cancelled".to_string());
        }
        if self.deadline_exceeded {
            reasons.push("execution exceeded its deadline".to_string());
        }
        if !self.failed.is_empty() {
            let failed: Vec<&str> = self.failed.iter().map(NodeId::as_str).collect();
            reasons.push(format!("failed nodes: {}", failed.join(", ")));
        }
        Some(reasons.join("; "))
    }
}

/// Drives a validated workflow to a terminal state.
///
/// Every node becomes a shared future that waits for its direct
/// predecessors, then either runs its step on the direction's worker pool
/// or fails without dispatch. Execution always drains every branch.
pub struct WorkflowScheduler {
    registry: Arc<StepRegistry>,
    step_executor: Arc<StepExecutor>,
    event_log: Arc<dyn EventLog>,
    pools: WorkerPools,
    retry_policy: RetryPolicy,
    request_timeout: Duration,
}

/// Everything a node's process needs, shared by all processes of one run
struct Dispatch {
    ctx: ExecutionContext,
    step_executor: Arc<StepExecutor>,
    event_log: Arc<dyn EventLog>,
    reporter: Arc<StateReporter>,
    pool: WorkerPool,
    retry_policy: RetryPolicy,
    deadline: Instant,
    cancel: CancellationToken,
}

impl WorkflowScheduler {
    pub fn new(
        registry: Arc<StepRegistry>,
        settings: &EngineSettings,
        pools: WorkerPools,
        event_log: Arc<dyn EventLog>,
    ) -> Self {
        Self {
            registry,
            step_executor: Arc::new(StepExecutor::new(event_log.clone())),
            event_log,
            pools,
            retry_policy: RetryPolicy::from_settings(settings),
            request_timeout: settings.request_timeout(),
        }
    }

    pub fn registry(&self) -> &Arc<StepRegistry> {
        &self.registry
    }

    /// Run the workflow until every node is COMPLETED or FAILED.
    ///
    /// `reporter` must already have begun the execution. Node transitions go
    /// through it; the overall status is left to the caller, which decides
    /// what the finished state looks like.
    pub async fn execute(
        &self,
        ctx: ExecutionContext,
        workflow: &ValidatedWorkflow,
        reporter: Arc<StateReporter>,
        cancel: CancellationToken,
    ) -> ExecutionReport {
        let started = Instant::now();
        let direction = ctx.direction;
        let workflow_id = ctx.workflow_id.clone();

        tracing::info!(
            "Starting {} execution of workflow {} ({} nodes, {} layers)",
            direction,
            workflow_id,
            workflow.plan.len(),
            workflow.plan.layers().len()
        );

        let dispatch = Arc::new(Dispatch {
            ctx,
            step_executor: self.step_executor.clone(),
            event_log: self.event_log.clone(),
            reporter,
            pool: self.pools.for_direction(direction).clone(),
            retry_policy: self.retry_policy,
            deadline: started + self.request_timeout,
            cancel,
        });

        dispatch
            .emit(EventType::WorkflowStarted {
                direction,
                node_count: workflow.plan.len(),
            })
            .await;

        // Plan order guarantees every predecessor's process exists first.
        let mut processes: HashMap<NodeId, WorkflowProcess> = HashMap::new();
        let mut order = Vec::with_capacity(workflow.plan.len());
        for (layer, ids) in workflow.plan.layers().iter().enumerate() {
            for id in ids {
                let Some(node) = workflow.dag.node(id).cloned() else {
                    continue;
                };
                dispatch
                    .emit(EventType::StepScheduled {
                        node_id: id.clone(),
                        step_type: node.step_type.clone(),
                        layer,
                    })
                    .await;

                let predecessors: Vec<(NodeId, WorkflowProcess)> = workflow
                    .dag
                    .dependencies(id)
                    .into_iter()
                    .filter_map(|dep| processes.get(&dep).map(|p| (dep, p.clone())))
                    .collect();
                let descriptor = self.registry.get(&node.step_type).cloned();

                let process = run_node(dispatch.clone(), node, descriptor, predecessors)
                    .boxed()
                    .shared();
                processes.insert(id.clone(), process.clone());
                order.push((id.clone(), process));
            }
        }

        let results = join_all(order.iter().map(|(_, process)| process.clone())).await;

        let mut completed = Vec::new();
        let mut failed = Vec::new();
        for ((id, _), result) in order.iter().zip(results) {
            match result {
                Some(_) => completed.push(id.clone()),
                None => failed.push(id.clone()),
            }
        }
        completed.sort();
        failed.sort();

        let deadline_exceeded = Instant::now() > dispatch.deadline;
        let cancelled = dispatch.cancel.is_cancelled();
        let status = if failed.is_empty() && !deadline_exceeded && !cancelled {
            ProvisioningStatus::Completed
        } else {
            ProvisioningStatus::Failed
        };
        let duration = started.elapsed();
        let duration_ms = duration.as_millis() as u64;

        if cancelled {
            dispatch
                .emit(EventType::WorkflowCancelled {
                    reason: "superseded".to_string(),
                })
                .await;
        }
        match status {
            ProvisioningStatus::Completed => {
                tracing::info!(
                    "Workflow {} {} completed in {}ms",
                    workflow_id,
                    direction,
                    duration_ms
                );
                dispatch
                    .emit(EventType::WorkflowCompleted {
                        direction,
                        duration_ms,
                    })
                    .await;
            }
            _ => {
                tracing::warn!(
                    "Workflow {} {} failed: {} completed, {} failed",
                    workflow_id,
                    direction,
                    completed.len(),
                    failed.len()
                );
                dispatch
                    .emit(EventType::WorkflowFailed {
                        direction,
                        failed_nodes: failed.clone(),
                        duration_ms,
                    })
                    .await;
            }
        }

        ExecutionReport {
            status,
            completed,
            failed,
            deadline_exceeded,
            cancelled,
            duration,
        }
    }
}

/// Process of a single node
async fn run_node(
    dispatch: Arc<Dispatch>,
    node: WorkflowNode,
    descriptor: Option<StepDescriptor>,
    predecessors: Vec<(NodeId, WorkflowProcess)>,
) -> NodeRun {
    let results = join_all(predecessors.iter().map(|(_, p)| p.clone())).await;

    let mut upstream = BTreeMap::new();
    for ((dep, _), result) in predecessors.iter().zip(results) {
        match result {
            Some(outputs) => {
                upstream.insert(dep.clone(), outputs.as_ref().clone());
            }
            None => {
                return dispatch
                    .skip(&node.id, NodeFailure::UpstreamFailed { node: dep.clone() })
                    .await;
            }
        }
    }

    let Some(descriptor) = descriptor else {
        let failure = NodeFailure::Terminal {
            message: format!("unknown step type '{}'", node.step_type),
        };
        return dispatch.skip(&node.id, failure).await;
    };

    let inputs = match StepExecutor::bind_inputs(&node, &descriptor, &upstream) {
        Ok(inputs) => inputs,
        Err(failure) => return dispatch.skip(&node.id, failure).await,
    };

    let _slot = dispatch.pool.acquire().await;

    if dispatch.cancel.is_cancelled() {
        return dispatch.skip(&node.id, NodeFailure::Cancelled).await;
    }
    let now = Instant::now();
    if now >= dispatch.deadline {
        return dispatch.skip(&node.id, NodeFailure::DeadlineExceeded).await;
    }

    dispatch.reporter.node_started(&node.id).await;

    let step_ctx = StepContext {
        workflow_id: dispatch.ctx.workflow_id.clone(),
        node_id: node.id.clone(),
        tenant_id: dispatch.ctx.tenant_id.clone(),
        attempt: 0,
    };
    let policy = dispatch
        .retry_policy
        .capped(dispatch.deadline.saturating_duration_since(now));
    let resource = descriptor.resource.clone();
    let executor = dispatch.step_executor.clone();

    let handle = tokio::spawn(async move {
        executor
            .execute(step_ctx, &descriptor, inputs, policy)
            .await
    });
    let outcome = match handle.await {
        Ok(outcome) => outcome,
        Err(e) => StepOutcome::Failed {
            failure: NodeFailure::Panicked {
                message: e.to_string(),
            },
            attempts: 1,
        },
    };

    match outcome {
        StepOutcome::Completed { outputs, attempts } => {
            dispatch
                .reporter
                .node_completed(&node.id, outputs.clone(), attempts, resource.as_ref())
                .await;
            Some(Arc::new(outputs))
        }
        StepOutcome::Failed { failure, attempts } => {
            dispatch.reporter.node_failed(&node.id, failure, attempts).await;
            None
        }
    }
}

impl Dispatch {
    /// Fail a node without running its step
    async fn skip(&self, id: &NodeId, failure: NodeFailure) -> NodeRun {
        tracing::info!("Skipping step {}: {}", id, failure);
        self.emit(EventType::StepSkipped {
            node_id: id.clone(),
            failure: failure.clone(),
        })
        .await;
        self.reporter.node_failed(id, failure, 0).await;
        None
    }

    async fn emit(&self, event_type: EventType) {
        if let Err(e) = self
            .event_log
            .append(Event::new(self.ctx.workflow_id.clone(), event_type))
            .await
        {
            tracing::error!(
                "Failed to append event for workflow {}: {}",
                self.ctx.workflow_id,
                e
            );
        }
    }
}
