use crate::settings::EngineSettings;
use crate::types::WorkflowDirection;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded pool of concurrently running tasks of one class
#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: &'static str,
    size: usize,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(name: &'static str, size: usize) -> Self {
        let size = size.max(1);
        Self {
            name,
            size,
            permits: Arc::new(Semaphore::new(size)),
        }
    }

    /// Pool sized `max(configured, available processors - 1)`, at least one
    pub fn scaled(name: &'static str, configured: usize) -> Self {
        let processors = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(name, configured.max(processors.saturating_sub(1)))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots not currently held
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a free slot. The slot is returned when the permit drops.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        self.permits
            .clone()
            .acquire_owned()
            .await
            // The semaphore is never closed.
            .unwrap_or_else(|_| unreachable!("worker pool {} closed", self.name))
    }
}

/// The three independently sized pools of the engine
#[derive(Debug, Clone)]
pub struct WorkerPools {
    /// Bookkeeping: completion handling and state reporting
    pub workflow: WorkerPool,
    pub provision: WorkerPool,
    pub deprovision: WorkerPool,
}

impl WorkerPools {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            workflow: WorkerPool::scaled("workflow", settings.workflow_thread_pool_size),
            provision: WorkerPool::scaled("provision", settings.provision_thread_pool_size),
            deprovision: WorkerPool::scaled("deprovision", settings.deprovision_thread_pool_size),
        }
    }

    /// Pool running the steps of a workflow direction
    pub fn for_direction(&self, direction: WorkflowDirection) -> &WorkerPool {
        match direction {
            WorkflowDirection::Provision => &self.provision,
            WorkflowDirection::Deprovision => &self.deprovision,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaled_pool_has_at_least_configured_size() {
        let pool = WorkerPool::scaled("p", 3);
        assert!(pool.size() >= 3);
        let pool = WorkerPool::scaled("p", 0);
        assert!(pool.size() >= 1);
    }

    #[tokio::test]
    async fn test_permits_bound_concurrency() {
        let pool = WorkerPool::new("p", 2);
        let a = pool.acquire().await;
        let _b = pool.acquire().await;
        assert_eq!(pool.available(), 0);
        drop(a);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_pool_for_direction() {
        let pools = WorkerPools::from_settings(&EngineSettings::default());
        assert_eq!(pools.for_direction(WorkflowDirection::Provision).name(), "provision");
        assert_eq!(pools.for_direction(WorkflowDirection::Deprovision).name(), "deprovision");
    }
}
