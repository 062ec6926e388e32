pub mod dag;
pub mod lifecycle;
pub mod pool;
pub mod registry;
pub mod remote;
pub mod reporter;
pub mod retry;
pub mod scheduler;
pub mod step_executor;
pub mod validator;

pub use dag::{ExecutionPlan, WorkflowDag};
pub use lifecycle::{reprovision_diff, teardown_template, ReprovisionDiff, Teardown};
pub use pool::{WorkerPool, WorkerPools};
pub use registry::{
    NoOpStep, ResourceSpec, StepContext, StepDescriptor, StepMetadata, StepRegistry, WorkflowStep,
};
pub use remote::{RemoteActionStep, RemoteClient, SimulatedRemoteClient};
pub use reporter::StateReporter;
pub use retry::RetryPolicy;
pub use scheduler::{ExecutionContext, ExecutionReport, WorkflowScheduler};
pub use step_executor::{StepExecutor, StepOutcome};
pub use validator::{GraphValidator, ValidatedWorkflow};
