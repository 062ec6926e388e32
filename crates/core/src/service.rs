use crate::error::{WorkflowError, WorkflowResult};
use crate::events::{Event, EventLog};
use crate::settings::EngineSettings;
use crate::storage::WorkflowStore;
use crate::tenant::{AdmissionPermit, TenantAdmissionController, TenantId};
use crate::types::{
    NodeId, ProvisioningStatus, ResourceCreated, Template, Workflow, WorkflowDirection,
    WorkflowId, WorkflowState,
};
use crate::workflow::lifecycle::{reprovision_diff, teardown_template};
use crate::workflow::{
    ExecutionContext, ExecutionReport, GraphValidator, StateReporter, StepMetadata, StepRegistry,
    ValidatedWorkflow, WorkerPools, WorkflowScheduler,
};
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Storage scope plus workflow id
type RunKey = (Option<TenantId>, WorkflowId);

/// An execution that has been admitted and not yet finalized
struct ActiveRun {
    run_id: uuid::Uuid,
    direction: WorkflowDirection,
    cancel: CancellationToken,
    done: Shared<BoxFuture<'static, ()>>,
}

/// How the state is finalized once an execution drains
enum Completion {
    Provision { workflow: Workflow },
    Deprovision { teardown: BTreeMap<NodeId, ResourceCreated> },
}

/// Request-handling facade over validation, admission, scheduling and
/// persistence of workflows
pub struct WorkflowService {
    settings: Arc<EngineSettings>,
    store: Arc<dyn WorkflowStore>,
    event_log: Arc<dyn EventLog>,
    validator: GraphValidator,
    scheduler: Arc<WorkflowScheduler>,
    admission: TenantAdmissionController,
    pools: WorkerPools,
    active: Arc<Mutex<HashMap<RunKey, ActiveRun>>>,
}

impl WorkflowService {
    pub fn new(
        settings: EngineSettings,
        registry: Arc<StepRegistry>,
        store: Arc<dyn WorkflowStore>,
        event_log: Arc<dyn EventLog>,
    ) -> Self {
        let settings = Arc::new(settings);
        let pools = WorkerPools::from_settings(&settings);

        tracing::info!(
            "Workflow service ready: {} step types, pools workflow={} provision={} deprovision={}",
            registry.list().len(),
            pools.workflow.size(),
            pools.provision.size(),
            pools.deprovision.size()
        );

        Self {
            validator: GraphValidator::new(registry.clone(), &settings),
            scheduler: Arc::new(WorkflowScheduler::new(
                registry,
                &settings,
                pools.clone(),
                event_log.clone(),
            )),
            admission: TenantAdmissionController::new(&settings),
            settings,
            store,
            event_log,
            pools,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn admission(&self) -> &TenantAdmissionController {
        &self.admission
    }

    fn ensure_enabled(&self) -> WorkflowResult<()> {
        if self.settings.enabled {
            Ok(())
        } else {
            Err(WorkflowError::Disabled)
        }
    }

    /// Storage scope of a request. Tenants only partition storage when
    /// multi-tenancy is enabled, and then every request must name one.
    fn scope(&self, tenant: Option<&TenantId>) -> WorkflowResult<Option<TenantId>> {
        if !self.settings.multi_tenancy_enabled {
            return Ok(None);
        }
        match tenant {
            None => Err(WorkflowError::invalid(
                "a tenant id is required when multi-tenancy is enabled",
            )),
            Some(tenant) if tenant.0.trim().is_empty() => {
                Err(WorkflowError::invalid("tenant id must not be blank"))
            }
            Some(tenant) if tenant.0 == TenantId::DEFAULT => Err(WorkflowError::invalid(
                format!("tenant id {} is reserved", tenant),
            )),
            Some(tenant) => Ok(Some(tenant.clone())),
        }
    }

    async fn active_direction(&self, key: &RunKey) -> Option<WorkflowDirection> {
        self.active.lock().await.get(key).map(|run| run.direction)
    }

    fn load_workflow(&self, scope: Option<&TenantId>, id: &WorkflowId) -> WorkflowResult<Workflow> {
        self.store
            .get_workflow(scope, id)?
            .ok_or_else(|| WorkflowError::NotFound(id.clone()))
    }

    fn load_state(&self, scope: Option<&TenantId>, id: &WorkflowId) -> WorkflowResult<WorkflowState> {
        Ok(self
            .store
            .get_state(scope, id)?
            .unwrap_or_else(|| WorkflowState::new(id.clone(), scope.cloned())))
    }

    /// Validate and store a new template
    pub fn create_workflow(
        &self,
        tenant: Option<&TenantId>,
        mut template: Template,
    ) -> WorkflowResult<Workflow> {
        self.ensure_enabled()?;
        let scope = self.scope(tenant)?;
        self.validator.validate(&template)?;

        let max = self.settings.max_workflows;
        if self.store.count_workflows()? >= max {
            return Err(WorkflowError::LimitExceeded { max });
        }

        if scope.is_some() {
            template.tenant_id = scope.clone();
        }

        let now = Utc::now();
        let workflow = Workflow {
            id: WorkflowId::generate(),
            template,
            created_at: now,
            updated_at: now,
            last_provisioned_at: None,
        };
        self.store.put_workflow(scope.as_ref(), &workflow)?;
        self.store.put_state(
            scope.as_ref(),
            &WorkflowState::new(workflow.id.clone(), scope.clone()),
        )?;

        tracing::info!("Created workflow {} ({})", workflow.id, workflow.template.name);
        Ok(workflow)
    }

    /// Store a new template and start provisioning it. When the provision is
    /// refused nothing stays stored.
    pub async fn create_and_provision(
        &self,
        tenant: Option<&TenantId>,
        template: Template,
    ) -> WorkflowResult<(Workflow, WorkflowState)> {
        let workflow = self.create_workflow(tenant, template)?;
        match self.provision(tenant, &workflow.id).await {
            Ok(state) => Ok((workflow, state)),
            Err(e) => {
                let scope = self.scope(tenant)?;
                let rollback = self
                    .store
                    .delete_state(scope.as_ref(), &workflow.id)
                    .and_then(|_| self.store.delete_workflow(scope.as_ref(), &workflow.id));
                if let Err(cleanup) = rollback {
                    tracing::error!("Failed to roll back workflow {}: {:#}", workflow.id, cleanup);
                }
                Err(e)
            }
        }
    }

    pub fn get_workflow(&self, tenant: Option<&TenantId>, id: &WorkflowId) -> WorkflowResult<Workflow> {
        self.ensure_enabled()?;
        self.load_workflow(self.scope(tenant)?.as_ref(), id)
    }

    /// Replace the template of a workflow that has not been provisioned
    pub fn update_workflow(
        &self,
        tenant: Option<&TenantId>,
        id: &WorkflowId,
        mut template: Template,
    ) -> WorkflowResult<Workflow> {
        self.ensure_enabled()?;
        let scope = self.scope(tenant)?;
        let mut workflow = self.load_workflow(scope.as_ref(), id)?;
        let state = self.load_state(scope.as_ref(), id)?;

        if state.status != ProvisioningStatus::NotStarted || !state.resources_created.is_empty() {
            return Err(WorkflowError::invalid(format!(
                "workflow {} is {:?}; use reprovision to change a provisioned template",
                id, state.status
            )));
        }

        self.validator.validate(&template)?;
        if scope.is_some() {
            template.tenant_id = scope.clone();
        }
        workflow.template = template;
        workflow.updated_at = Utc::now();
        self.store.put_workflow(scope.as_ref(), &workflow)?;

        tracing::info!("Updated workflow {}", id);
        Ok(workflow)
    }

    /// Delete a workflow and its state. Refused while resources exist.
    pub async fn delete_workflow(&self, tenant: Option<&TenantId>, id: &WorkflowId) -> WorkflowResult<()> {
        self.ensure_enabled()?;
        let scope = self.scope(tenant)?;
        self.load_workflow(scope.as_ref(), id)?;

        if self.active.lock().await.contains_key(&(scope.clone(), id.clone())) {
            return Err(WorkflowError::invalid(format!("workflow {} has an active execution", id)));
        }
        let state = self.load_state(scope.as_ref(), id)?;
        if !state.resources_created.is_empty() {
            return Err(WorkflowError::invalid(format!(
                "workflow {} still owns {} resources; deprovision first",
                id,
                state.resources_created.len()
            )));
        }

        self.store.delete_state(scope.as_ref(), id)?;
        self.store.delete_workflow(scope.as_ref(), id)?;
        tracing::info!("Deleted workflow {}", id);
        Ok(())
    }

    /// Current state of a workflow
    pub fn get_state(&self, tenant: Option<&TenantId>, id: &WorkflowId) -> WorkflowResult<WorkflowState> {
        self.ensure_enabled()?;
        let scope = self.scope(tenant)?;
        self.load_workflow(scope.as_ref(), id)?;
        self.load_state(scope.as_ref(), id)
    }

    /// Lifecycle events of a workflow, oldest first
    pub async fn get_events(&self, tenant: Option<&TenantId>, id: &WorkflowId) -> WorkflowResult<Vec<Event>> {
        self.ensure_enabled()?;
        self.load_workflow(self.scope(tenant)?.as_ref(), id)?;
        Ok(self.event_log.get_workflow_events(id).await?)
    }

    pub fn list_step_types(&self) -> WorkflowResult<Vec<StepMetadata>> {
        self.ensure_enabled()?;
        Ok(self.validator.registry().list())
    }

    /// Start provisioning. Returns once the execution is admitted and started.
    pub async fn provision(&self, tenant: Option<&TenantId>, id: &WorkflowId) -> WorkflowResult<WorkflowState> {
        self.ensure_enabled()?;
        let scope = self.scope(tenant)?;
        let workflow = self.load_workflow(scope.as_ref(), id)?;
        let state = self.load_state(scope.as_ref(), id)?;

        if let Some(direction) = self.active_direction(&(scope.clone(), id.clone())).await {
            return Err(WorkflowError::invalid(format!(
                "workflow {} already has an active {}",
                id, direction
            )));
        }
        if state.status.is_active() {
            tracing::warn!(
                "Workflow {} was left {:?} by an interrupted execution",
                id,
                state.status
            );
        }
        if state.status == ProvisioningStatus::Completed || !state.resources_created.is_empty() {
            return Err(WorkflowError::invalid(format!(
                "workflow {} is already provisioned; deprovision it or use reprovision",
                id
            )));
        }

        let validated = self.validator.plan(&workflow.template)?;
        let permit = self.admission.try_acquire(tenant, WorkflowDirection::Provision)?;

        let state = WorkflowState::new(id.clone(), scope.clone());
        self.start_run(
            scope,
            tenant.cloned(),
            WorkflowDirection::Provision,
            validated,
            state,
            permit,
            Completion::Provision { workflow },
        )
        .await
    }

    /// Apply an updated template to a provisioned workflow, rerunning only
    /// what changed
    pub async fn reprovision(
        &self,
        tenant: Option<&TenantId>,
        id: &WorkflowId,
        mut template: Template,
    ) -> WorkflowResult<WorkflowState> {
        self.ensure_enabled()?;
        let scope = self.scope(tenant)?;
        let mut workflow = self.load_workflow(scope.as_ref(), id)?;
        let mut state = self.load_state(scope.as_ref(), id)?;

        if state.status != ProvisioningStatus::Completed {
            return Err(WorkflowError::invalid(format!(
                "workflow {} is {:?}; only a provisioned workflow can be reprovisioned",
                id, state.status
            )));
        }

        if scope.is_some() {
            template.tenant_id = scope.clone();
        }
        let updated_dag = self.validator.validate(&template)?;
        let diff = reprovision_diff(&workflow.template, &template, &updated_dag, &state)?;

        workflow.template = template;
        workflow.updated_at = Utc::now();

        if diff.rerun.is_empty() {
            tracing::info!("Reprovision of workflow {} has nothing to run", id);
            self.store.put_workflow(scope.as_ref(), &workflow)?;
            if !diff.removed.is_empty() {
                for node in &diff.removed {
                    state.nodes.remove(node);
                }
                state.updated_at = Utc::now();
                self.store.put_state(scope.as_ref(), &state)?;
            }
            return Ok(state);
        }

        let validated = self.validator.plan(&diff.reduced)?;
        let permit = self.admission.try_acquire(tenant, WorkflowDirection::Provision)?;

        tracing::info!(
            "Reprovisioning workflow {}: rerunning {} of {} nodes",
            id,
            diff.rerun.len(),
            workflow.template.nodes.len()
        );
        self.store.put_workflow(scope.as_ref(), &workflow)?;
        for node in &diff.removed {
            state.nodes.remove(node);
        }

        self.start_run(
            scope,
            tenant.cloned(),
            WorkflowDirection::Provision,
            validated,
            state,
            permit,
            Completion::Provision { workflow },
        )
        .await
    }

    /// Tear down every resource the workflow created.
    ///
    /// An in-flight provision is cancelled first; its running steps finish
    /// and their resources are torn down too.
    pub async fn deprovision(&self, tenant: Option<&TenantId>, id: &WorkflowId) -> WorkflowResult<WorkflowState> {
        self.ensure_enabled()?;
        let scope = self.scope(tenant)?;
        let workflow = self.load_workflow(scope.as_ref(), id)?;
        let key = (scope.clone(), id.clone());

        if self.active_direction(&key).await == Some(WorkflowDirection::Deprovision) {
            return Err(WorkflowError::invalid(format!(
                "workflow {} is already deprovisioning",
                id
            )));
        }

        let permit = self.admission.try_acquire(tenant, WorkflowDirection::Deprovision)?;
        self.cancel_run(&key).await;

        let mut state = self.settle_idle_state(&key).await?;
        if state.resources_created.is_empty() {
            return Ok(state);
        }

        let provisioned = self.validator.validate(&workflow.template)?;
        let teardown = teardown_template(
            &workflow.template.name,
            self.validator.registry(),
            &provisioned,
            &state.resources_created,
        )?;
        let validated = self.validator.plan(&teardown.template)?;

        state.nodes.clear();
        self.start_run(
            scope,
            tenant.cloned(),
            WorkflowDirection::Deprovision,
            validated,
            state,
            permit,
            Completion::Deprovision {
                teardown: teardown.resources,
            },
        )
        .await
    }

    /// Wait until the active execution of a workflow, if any, is finalized
    pub async fn wait_for_completion(&self, tenant: Option<&TenantId>, id: &WorkflowId) {
        let Ok(scope) = self.scope(tenant) else {
            return;
        };
        let key = (scope, id.clone());
        let done = self.active.lock().await.get(&key).map(|run| run.done.clone());
        if let Some(done) = done {
            done.await;
        }
    }

    /// Load the state of a workflow that has no registered run.
    ///
    /// A workflow without resources is reset to NOT_STARTED while the run map
    /// is still locked, so no execution admitted meanwhile is overwritten.
    /// A status left in flight by an interrupted process is treated as stale.
    async fn settle_idle_state(&self, key: &RunKey) -> WorkflowResult<WorkflowState> {
        let active = self.active.lock().await;
        if let Some(run) = active.get(key) {
            return Err(WorkflowError::invalid(format!(
                "workflow {} already has an active {}",
                key.1, run.direction
            )));
        }

        let mut state = self.load_state(key.0.as_ref(), &key.1)?;
        if state.status.is_active() {
            tracing::warn!(
                "Workflow {} was left {:?} by an interrupted execution",
                key.1,
                state.status
            );
        }
        if state.resources_created.is_empty() {
            state.status = ProvisioningStatus::NotStarted;
            state.nodes.clear();
            state.error = None;
            state.provision_start_time = None;
            state.provision_end_time = None;
            state.updated_at = Utc::now();
            self.store.put_state(key.0.as_ref(), &state)?;
            tracing::info!("Workflow {} has no resources to deprovision", key.1);
        }
        Ok(state)
    }

    /// Cancel an in-flight provision and wait for it to drain
    async fn cancel_run(&self, key: &RunKey) {
        let running = self.active.lock().await.get(key).and_then(|run| {
            (run.direction == WorkflowDirection::Provision)
                .then(|| (run.cancel.clone(), run.done.clone()))
        });
        if let Some((cancel, done)) = running {
            tracing::info!("Cancelling in-flight provision of workflow {}", key.1);
            cancel.cancel();
            done.await;
        }
    }

    /// Register the execution and hand it to the runtime. The spawned task
    /// is the completion callback: it finalizes the state, deregisters the
    /// run and releases the admission slot.
    #[allow(clippy::too_many_arguments)]
    async fn start_run(
        &self,
        scope: Option<TenantId>,
        tenant: Option<TenantId>,
        direction: WorkflowDirection,
        validated: ValidatedWorkflow,
        state: WorkflowState,
        permit: AdmissionPermit,
        completion: Completion,
    ) -> WorkflowResult<WorkflowState> {
        let workflow_id = state.workflow_id.clone();
        let key = (scope.clone(), workflow_id.clone());

        let mut active = self.active.lock().await;
        if let Some(run) = active.get(&key) {
            return Err(WorkflowError::invalid(format!(
                "workflow {} already has an active {}",
                workflow_id, run.direction
            )));
        }

        let reporter = Arc::new(StateReporter::new(
            self.store.clone(),
            self.event_log.clone(),
            state,
        ));
        reporter
            .begin(
                direction,
                validated
                    .dag
                    .nodes()
                    .map(|n| (n.id.clone(), n.step_type.clone())),
            )
            .await;
        let snapshot = reporter.snapshot().await;

        let run_id = uuid::Uuid::new_v4();
        let cancel = CancellationToken::new();
        let ctx = ExecutionContext {
            workflow_id: workflow_id.clone(),
            tenant_id: tenant,
            direction,
        };

        let handle = tokio::spawn({
            let scheduler = self.scheduler.clone();
            let store = self.store.clone();
            let active = self.active.clone();
            let bookkeeping = self.pools.workflow.clone();
            let cancel = cancel.clone();
            let key = key.clone();
            async move {
                let report = scheduler
                    .execute(ctx, &validated, reporter.clone(), cancel)
                    .await;

                let _slot = bookkeeping.acquire().await;
                complete(completion, &report, &reporter, store.as_ref(), key.0.as_ref()).await;

                let mut active = active.lock().await;
                if active.get(&key).map(|run| run.run_id) == Some(run_id) {
                    active.remove(&key);
                }
                drop(active);
                drop(permit);
            }
        });

        active.insert(
            key,
            ActiveRun {
                run_id,
                direction,
                cancel,
                done: handle.map(|_| ()).boxed().shared(),
            },
        );

        tracing::info!("Started {} of workflow {}", direction, workflow_id);
        Ok(snapshot)
    }
}

/// Finalize the state of a drained execution
async fn complete(
    completion: Completion,
    report: &ExecutionReport,
    reporter: &StateReporter,
    store: &dyn WorkflowStore,
    scope: Option<&TenantId>,
) {
    match completion {
        Completion::Provision { mut workflow } => {
            reporter.finish(report.status, report.error()).await;
            if report.status == ProvisioningStatus::Completed {
                workflow.last_provisioned_at = Some(Utc::now());
                if let Err(e) = store.put_workflow(scope, &workflow) {
                    tracing::error!("Failed to record provisioning of {}: {:#}", workflow.id, e);
                }
            }
        }
        Completion::Deprovision { teardown } => {
            if report.status == ProvisioningStatus::Completed {
                reporter
                    .update(|state| {
                        state.status = ProvisioningStatus::NotStarted;
                        state.nodes.clear();
                        state.resources_created.clear();
                        state.error = None;
                        state.provision_start_time = None;
                        state.provision_end_time = None;
                    })
                    .await;
                return;
            }

            let deleted: HashSet<(NodeId, String)> = report
                .completed
                .iter()
                .filter_map(|id| teardown.get(id))
                .map(|r| (r.node_id.clone(), r.resource_type.clone()))
                .collect();
            let error = report.error();
            reporter
                .update(|state| {
                    state.resources_created.retain(|r| {
                        !deleted.contains(&(r.node_id.clone(), r.resource_type.clone()))
                    });
                    state.status = ProvisioningStatus::Failed;
                    state.error = error;
                })
                .await;
        }
    }
}
