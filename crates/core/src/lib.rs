// Workflow DAG engine for provisioning AI resources

pub mod error;
pub mod events;
pub mod service;
pub mod settings;
pub mod storage;
pub mod tenant;
pub mod types;
pub mod workflow;

pub use error::{NodeFailure, StepError, ValidationError, WorkflowError, WorkflowResult};
pub use service::WorkflowService;
pub use settings::EngineSettings;
pub use tenant::{AdmissionPermit, TenantAdmissionController, TenantId};
pub use types::*;
