use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Immutable configuration snapshot handed to the engine components.
///
/// Read once at construction; nothing re-polls it mid-execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Feature switch for the whole workflow surface
    pub enabled: bool,
    /// Maximum number of stored workflows
    pub max_workflows: usize,
    /// Maximum number of nodes in one template
    pub max_workflow_steps: usize,
    /// Overall deadline of one workflow execution
    pub request_timeout_secs: u64,
    /// Retry budget of a single step
    pub task_retry_duration_secs: u64,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub multi_tenancy_enabled: bool,
    pub workflow_thread_pool_size: usize,
    pub provision_thread_pool_size: usize,
    pub deprovision_thread_pool_size: usize,
    pub max_active_provisions_per_tenant: usize,
    pub max_active_deprovisions_per_tenant: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_workflows: 1000,
            max_workflow_steps: 50,
            request_timeout_secs: 10,
            task_retry_duration_secs: 60,
            retry_initial_backoff_ms: 100,
            retry_max_backoff_ms: 5000,
            multi_tenancy_enabled: false,
            workflow_thread_pool_size: 4,
            provision_thread_pool_size: 8,
            deprovision_thread_pool_size: 4,
            max_active_provisions_per_tenant: 2,
            max_active_deprovisions_per_tenant: 1,
        }
    }
}

impl EngineSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Step retry budget, never longer than the workflow deadline
    pub fn task_retry_duration(&self) -> Duration {
        Duration::from_secs(self.task_retry_duration_secs).min(self.request_timeout())
    }

    pub fn retry_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_initial_backoff_ms)
    }

    pub fn retry_max_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_max_backoff_ms.max(self.retry_initial_backoff_ms))
    }
}
