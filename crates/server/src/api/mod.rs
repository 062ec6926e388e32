use crate::config::{AppState, ServerConfig};
use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use weaver_core::WorkflowError;

mod handlers;

/// Start the API server
pub async fn serve(addr: &str, config: ServerConfig) -> Result<()> {
    let state = AppState::new(&config)?;

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Create the API router
fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/step-types", get(handlers::list_step_types))
        .route("/api/workflows", post(handlers::create_workflow))
        .route(
            "/api/workflows/{workflow_id}",
            get(handlers::get_workflow)
                .put(handlers::update_workflow)
                .delete(handlers::delete_workflow),
        )
        .route(
            "/api/workflows/{workflow_id}/provision",
            post(handlers::provision_workflow),
        )
        .route(
            "/api/workflows/{workflow_id}/reprovision",
            post(handlers::reprovision_workflow),
        )
        .route(
            "/api/workflows/{workflow_id}/deprovision",
            post(handlers::deprovision_workflow),
        )
        .route(
            "/api/workflows/{workflow_id}/state",
            get(handlers::get_workflow_state),
        )
        .route(
            "/api/workflows/{workflow_id}/events",
            get(handlers::get_workflow_events),
        )
        // Middleware
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "weaver",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// API error type
pub struct ApiError(WorkflowError);

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            WorkflowError::Validation(_) | WorkflowError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            WorkflowError::NotFound(_) => StatusCode::NOT_FOUND,
            WorkflowError::AdmissionRejected { .. } | WorkflowError::LimitExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            WorkflowError::Disabled => StatusCode::FORBIDDEN,
            WorkflowError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_msg = self.0.to_string();
        let details = std::iter::successors(std::error::Error::source(&self.0), |e| e.source())
            .map(|e| e.to_string())
            .filter(|e| !error_msg.contains(e.as_str()))
            .collect::<Vec<_>>()
            .join(": ");

        if status.is_server_error() {
            tracing::error!("Request failed: {}", error_msg);
        }

        let response = if details.is_empty() {
            ErrorResponse::new(error_msg)
        } else {
            ErrorResponse::with_details(error_msg, details)
        };

        (status, Json(response)).into_response()
    }
}

impl From<WorkflowError> for ApiError {
    fn from(err: WorkflowError) -> Self {
        Self(err)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::middleware::TENANT_HEADER;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use weaver_core::{EngineSettings, TenantId, WorkflowId, WorkflowService};

    fn test_state(engine: EngineSettings) -> AppState {
        let config = ServerConfig {
            storage: StorageConfig {
                in_memory: true,
                ..Default::default()
            },
            engine,
            ..Default::default()
        };
        AppState::new(&config).unwrap()
    }

    fn search_template() -> Value {
        json!({
            "name": "semantic search",
            "nodes": [
                {
                    "id": "create_connector",
                    "type": "create_connector",
                    "user_inputs": { "name": "openai", "protocol": "http" }
                },
                {
                    "id": "register_model",
                    "type": "register_remote_model",
                    "user_inputs": { "name": "embedder" },
                    "previous_node_inputs": {
                        "connector_id": { "node": "create_connector", "output": "connector_id" }
                    }
                },
                {
                    "id": "deploy_model",
                    "type": "deploy_model",
                    "previous_node_inputs": {
                        "model_id": { "node": "register_model", "output": "model_id" }
                    }
                }
            ]
        })
    }

    async fn send(
        app: &Router,
        method: Method,
        uri: &str,
        tenant: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(tenant) = tenant {
            builder = builder.header(TENANT_HEADER, tenant);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn create(app: &Router, tenant: Option<&str>) -> String {
        let (status, body) = send(
            app,
            Method::POST,
            "/api/workflows",
            tenant,
            Some(search_template()),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["workflow"]["id"].as_str().unwrap().to_string()
    }

    async fn wait(service: &Arc<WorkflowService>, tenant: Option<&str>, id: &str) {
        let tenant = tenant.map(TenantId::new);
        service
            .wait_for_completion(tenant.as_ref(), &WorkflowId::new(id))
            .await;
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = create_router(test_state(EngineSettings::default()));
        let (status, body) = send(&app, Method::GET, "/api/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_create_provision_and_read_state() {
        let state = test_state(EngineSettings::default());
        let service = state.service.clone();
        let app = create_router(state);

        let id = create(&app, None).await;
        let uri = format!("/api/workflows/{}", id);

        let (status, body) = send(&app, Method::GET, &format!("{}/state", uri), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "NOT_STARTED");

        let (status, body) =
            send(&app, Method::POST, &format!("{}/provision", uri), None, None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "PROVISIONING");

        wait(&service, None, &id).await;

        let (status, body) = send(&app, Method::GET, &format!("{}/state", uri), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "COMPLETED");
        assert_eq!(body["resources_created"].as_array().unwrap().len(), 3);

        let (status, body) = send(&app, Method::GET, &format!("{}/events", uri), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body["events"].as_array().unwrap().is_empty());

        // Provisioned workflows keep their resources until deprovisioned
        let (status, _) = send(&app, Method::DELETE, &uri, None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) =
            send(&app, Method::POST, &format!("{}/deprovision", uri), None, None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        wait(&service, None, &id).await;

        let (status, _) = send(&app, Method::DELETE, &uri, None, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, Method::GET, &uri, None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_create_with_provision_flag() {
        let state = test_state(EngineSettings::default());
        let service = state.service.clone();
        let app = create_router(state);

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/workflows?provision=true",
            None,
            Some(search_template()),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["state"]["status"], "PROVISIONING");

        let id = body["workflow"]["id"].as_str().unwrap().to_string();
        wait(&service, None, &id).await;
        let state = service.get_state(None, &WorkflowId::new(id)).unwrap();
        assert_eq!(state.resources_created.len(), 3);
    }

    #[tokio::test]
    async fn test_cyclic_template_is_bad_request() {
        let app = create_router(test_state(EngineSettings::default()));
        let template = json!({
            "name": "loop",
            "nodes": [
                { "id": "a", "type": "noop" },
                { "id": "b", "type": "noop" }
            ],
            "edges": [
                { "source": "a", "dest": "b" },
                { "source": "b", "dest": "a" }
            ]
        });

        let (status, body) =
            send(&app, Method::POST, "/api/workflows", None, Some(template)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("invalid template"));
    }

    #[tokio::test]
    async fn test_unknown_workflow_is_not_found() {
        let app = create_router(test_state(EngineSettings::default()));
        let (status, body) = send(&app, Method::GET, "/api/workflows/missing", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn test_disabled_engine_is_forbidden() {
        let app = create_router(test_state(EngineSettings {
            enabled: false,
            ..Default::default()
        }));
        let (status, _) = send(&app, Method::GET, "/api/step-types", None, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_admission_rejection_is_too_many_requests() {
        let app = create_router(test_state(EngineSettings {
            max_active_provisions_per_tenant: 0,
            ..Default::default()
        }));
        let id = create(&app, None).await;

        let (status, body) = send(
            &app,
            Method::POST,
            &format!("/api/workflows/{}/provision", id),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(body["error"].as_str().unwrap().contains("active"));
    }

    #[tokio::test]
    async fn test_tenant_header_scopes_workflows() {
        let app = create_router(test_state(EngineSettings {
            multi_tenancy_enabled: true,
            ..Default::default()
        }));
        let id = create(&app, Some("acme")).await;
        let uri = format!("/api/workflows/{}", id);

        let (status, body) = send(&app, Method::GET, &uri, Some("acme"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["template"]["tenant_id"], "acme");

        let (status, _) = send(&app, Method::GET, &uri, Some("globex"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&app, Method::GET, &uri, None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("tenant"));
    }

    #[tokio::test]
    async fn test_refused_provision_on_create_is_rolled_back() {
        let app = create_router(test_state(EngineSettings {
            max_workflows: 1,
            max_active_provisions_per_tenant: 0,
            ..Default::default()
        }));

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/workflows?provision=true",
            None,
            Some(search_template()),
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

        // The refused workflow does not count against the limit.
        create(&app, None).await;
    }

    #[tokio::test]
    async fn test_list_step_types() {
        let app = create_router(test_state(EngineSettings::default()));
        let (status, body) = send(&app, Method::GET, "/api/step-types", None, None).await;
        assert_eq!(status, StatusCode::OK);

        let types: Vec<&str> = body["step_types"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|t| t["step_type"].as_str())
            .collect();
        assert!(types.contains(&"create_connector"));
        assert!(types.contains(&"deploy_model"));
    }
}
