use super::registry::{StepContext, StepDescriptor};
use super::retry::RetryPolicy;
use crate::error::{NodeFailure, StepError};
use crate::events::{Event, EventLog, EventType};
use crate::types::{NodeId, StepInputs, StepOutputs, WorkflowNode};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;

/// Result of running one node to completion or failure
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed { outputs: StepOutputs, attempts: u32 },
    Failed { failure: NodeFailure, attempts: u32 },
}

impl StepOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Completed { attempts, .. } | Self::Failed { attempts, .. } => *attempts,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Binds inputs for a node and runs its step with retry
pub struct StepExecutor {
    event_log: Arc<dyn EventLog>,
}

impl StepExecutor {
    pub fn new(event_log: Arc<dyn EventLog>) -> Self {
        Self { event_log }
    }

    /// Assemble the inputs of a node.
    ///
    /// Optional defaults come first, then literal inputs, then values bound
    /// from predecessor outputs. A binding whose source output is absent
    /// fails the node.
    pub fn bind_inputs(
        node: &WorkflowNode,
        descriptor: &StepDescriptor,
        upstream: &BTreeMap<NodeId, StepOutputs>,
    ) -> Result<StepInputs, NodeFailure> {
        let mut inputs = descriptor.optional_inputs.clone();
        inputs.extend(
            node.user_inputs
                .iter()
                .map(|(name, value)| (name.clone(), value.clone())),
        );

        for (input, binding) in &node.previous_node_inputs {
            let value = upstream
                .get(&binding.node)
                .and_then(|outputs| outputs.get(&binding.output))
                .ok_or_else(|| NodeFailure::MissingInput {
                    input: input.clone(),
                    source_node: binding.node.clone(),
                    output: binding.output.clone(),
                })?;
            inputs.insert(input.clone(), value.clone());
        }

        Ok(inputs)
    }

    /// Run the step until it succeeds, fails terminally, or the retry budget
    /// is spent. Only transient errors are retried.
    pub async fn execute(
        &self,
        ctx: StepContext,
        descriptor: &StepDescriptor,
        inputs: StepInputs,
        policy: RetryPolicy,
    ) -> StepOutcome {
        let start = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let attempt_ctx = StepContext {
                attempt,
                ..ctx.clone()
            };

            tracing::info!(
                "Executing step {} ({}) attempt {} for workflow {}",
                ctx.node_id,
                descriptor.step_type,
                attempt,
                ctx.workflow_id
            );
            self.emit(
                &ctx,
                EventType::StepStarted {
                    node_id: ctx.node_id.clone(),
                    attempt,
                },
            )
            .await;

            let error = match descriptor.step.run(&attempt_ctx, inputs.clone()).await {
                Ok(outputs) => {
                    self.emit(
                        &ctx,
                        EventType::StepCompleted {
                            node_id: ctx.node_id.clone(),
                            attempts: attempt,
                            duration_ms: start.elapsed().as_millis() as u64,
                        },
                    )
                    .await;
                    return StepOutcome::Completed {
                        outputs,
                        attempts: attempt,
                    };
                }
                Err(StepError::Terminal(message)) => {
                    return self
                        .fail(&ctx, NodeFailure::Terminal { message }, attempt)
                        .await;
                }
                Err(StepError::Transient(message)) => message,
            };

            let Some(delay) = policy.next_delay(attempt, start.elapsed()) else {
                let failure = NodeFailure::Timeout {
                    attempts: attempt,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                    last_error: error,
                };
                return self.fail(&ctx, failure, attempt).await;
            };

            tracing::warn!(
                "Step {} failed transiently ({}), retrying in {:?}",
                ctx.node_id,
                error,
                delay
            );
            self.emit(
                &ctx,
                EventType::StepRetrying {
                    node_id: ctx.node_id.clone(),
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    error,
                },
            )
            .await;

            tokio::time::sleep(delay).await;
        }
    }

    async fn fail(&self, ctx: &StepContext, failure: NodeFailure, attempts: u32) -> StepOutcome {
        tracing::warn!("Step {} failed: {}", ctx.node_id, failure);
        self.emit(
            ctx,
            EventType::StepFailed {
                node_id: ctx.node_id.clone(),
                failure: failure.clone(),
            },
        )
        .await;
        StepOutcome::Failed { failure, attempts }
    }

    /// Event log failures never change the outcome of a step
    async fn emit(&self, ctx: &StepContext, event_type: EventType) {
        if let Err(e) = self
            .event_log
            .append(Event::new(ctx.workflow_id.clone(), event_type))
            .await
        {
            tracing::error!("Failed to append event for workflow {}: {}", ctx.workflow_id, e);
        }
    }
}
