use super::ApiResult;
use crate::config::AppState;
use crate::middleware::extract_tenant_from_headers;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use weaver_core::{
    events::Event, workflow::StepMetadata, Template, Workflow, WorkflowId, WorkflowState,
};

#[derive(Debug, Default, Deserialize)]
pub struct CreateWorkflowParams {
    /// Start provisioning right after the template is stored
    #[serde(default)]
    pub provision: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkflowResponse {
    pub workflow: Workflow,
    pub state: WorkflowState,
}

/// Validate and store a new workflow template. With `?provision=true` a
/// refused provision leaves nothing stored.
pub async fn create_workflow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<CreateWorkflowParams>,
    Json(template): Json<Template>,
) -> ApiResult<(StatusCode, Json<WorkflowResponse>)> {
    let tenant = extract_tenant_from_headers(&headers);
    let (workflow, workflow_state) = if params.provision {
        state
            .service
            .create_and_provision(tenant.as_ref(), template)
            .await?
    } else {
        let workflow = state.service.create_workflow(tenant.as_ref(), template)?;
        let workflow_state = state.service.get_state(tenant.as_ref(), &workflow.id)?;
        (workflow, workflow_state)
    };
    tracing::info!("Created workflow {}", workflow.id);

    Ok((
        StatusCode::CREATED,
        Json(WorkflowResponse {
            workflow,
            state: workflow_state,
        }),
    ))
}

/// Get a stored workflow
pub async fn get_workflow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<Workflow>> {
    let tenant = extract_tenant_from_headers(&headers);
    let workflow = state
        .service
        .get_workflow(tenant.as_ref(), &WorkflowId::new(workflow_id))?;
    Ok(Json(workflow))
}

/// Replace the template of a workflow that was never provisioned
pub async fn update_workflow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(workflow_id): Path<String>,
    Json(template): Json<Template>,
) -> ApiResult<Json<Workflow>> {
    let tenant = extract_tenant_from_headers(&headers);
    let workflow = state.service.update_workflow(
        tenant.as_ref(),
        &WorkflowId::new(workflow_id),
        template,
    )?;
    Ok(Json(workflow))
}

/// Delete a workflow with no live resources
pub async fn delete_workflow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(workflow_id): Path<String>,
) -> ApiResult<StatusCode> {
    let tenant = extract_tenant_from_headers(&headers);
    state
        .service
        .delete_workflow(tenant.as_ref(), &WorkflowId::new(workflow_id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn provision_workflow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(workflow_id): Path<String>,
) -> ApiResult<(StatusCode, Json<WorkflowState>)> {
    let tenant = extract_tenant_from_headers(&headers);
    let workflow_state = state
        .service
        .provision(tenant.as_ref(), &WorkflowId::new(workflow_id))
        .await?;
    Ok((StatusCode::ACCEPTED, Json(workflow_state)))
}

pub async fn reprovision_workflow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(workflow_id): Path<String>,
    Json(template): Json<Template>,
) -> ApiResult<(StatusCode, Json<WorkflowState>)> {
    let tenant = extract_tenant_from_headers(&headers);
    let workflow_state = state
        .service
        .reprovision(tenant.as_ref(), &WorkflowId::new(workflow_id), template)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(workflow_state)))
}

pub async fn deprovision_workflow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(workflow_id): Path<String>,
) -> ApiResult<(StatusCode, Json<WorkflowState>)> {
    let tenant = extract_tenant_from_headers(&headers);
    let workflow_state = state
        .service
        .deprovision(tenant.as_ref(), &WorkflowId::new(workflow_id))
        .await?;
    Ok((StatusCode::ACCEPTED, Json(workflow_state)))
}

/// Get the provisioning state of a workflow
pub async fn get_workflow_state(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<WorkflowState>> {
    let tenant = extract_tenant_from_headers(&headers);
    let workflow_state = state
        .service
        .get_state(tenant.as_ref(), &WorkflowId::new(workflow_id))?;
    Ok(Json(workflow_state))
}

/// Get events for a workflow
pub async fn get_workflow_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<GetWorkflowEventsResponse>> {
    let tenant = extract_tenant_from_headers(&headers);
    let events = state
        .service
        .get_events(tenant.as_ref(), &WorkflowId::new(workflow_id))
        .await?;

    Ok(Json(GetWorkflowEventsResponse { events }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetWorkflowEventsResponse {
    pub events: Vec<Event>,
}

/// List the registered step types
pub async fn list_step_types(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ListStepTypesResponse>> {
    let step_types = state.service.list_step_types()?;
    Ok(Json(ListStepTypesResponse { step_types }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListStepTypesResponse {
    pub step_types: Vec<StepMetadata>,
}
