use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{MatchedPath, Path, Request, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json,
    Router,
};
use serde_json::{json, Value};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    config::PoolDefaults,
    dispatcher::Dispatcher,
    http_objects::{
        AcceptedResponse,
        ApiError,
        CreateManagerRequest,
        CreateManagerResponse,
        DispatchWorkflowRequest,
    },
    pool::{ContainerStatus, ContainerSummary, MinIdlePolicy, PoolStatus},
    registry::{CreateOutcome, PoolRegistry},
    workflow::{WorkflowEngine, WorkflowError, WorkflowRunInfo, WorkflowStatus},
};

#[derive(OpenApi)]
#[openapi(
        paths(
            create_manager,
            dispatch,
            dispatch_workflow,
            manager_status,
            workflow_status,
        ),
        components(
            schemas(
                ApiError,
                CreateManagerRequest,
                CreateManagerResponse,
                DispatchWorkflowRequest,
                AcceptedResponse,
                PoolStatus,
                ContainerSummary,
                ContainerStatus,
                MinIdlePolicy,
                WorkflowRunInfo,
                WorkflowStatus,
            )
        ),
        tags(
            (name = "warmpool", description = "Warm container pool API")
        )
    )]
struct ApiDoc;

#[derive(Clone)]
pub struct RouteState {
    pub registry: Arc<PoolRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub engine: Arc<WorkflowEngine>,
    pub pool_defaults: Arc<PoolDefaults>,
}

pub fn create_routes(route_state: RouteState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .merge(SwaggerUi::new("/docs/swagger").url("/docs/openapi.json", ApiDoc::openapi()))
        .route("/", get(index))
        .route(
            "/create_manager",
            post(create_manager).with_state(route_state.clone()),
        )
        .route(
            "/dispatch/{function_name}",
            post(dispatch).with_state(route_state.clone()),
        )
        .route(
            "/dispatch_workflow",
            post(dispatch_workflow).with_state(route_state.clone()),
        )
        .route(
            "/manager_status/{function_name}",
            get(manager_status).with_state(route_state.clone()),
        )
        .route(
            "/workflows/{workflow_id}",
            get(workflow_status).with_state(route_state.clone()),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    let method = req.method();
                    let uri = req.uri();

                    let matched_path = req
                        .extensions()
                        .get::<MatchedPath>()
                        .map(|matched_path| matched_path.as_str());

                    tracing::debug_span!("request", %method, %uri, matched_path)
                })
                .on_failure(()),
        )
        .layer(cors)
}

async fn index() -> &'static str {
    "warmpool controller"
}

/// Create the container pool for a function
#[utoipa::path(
    post,
    path = "/create_manager",
    request_body = CreateManagerRequest,
    tag = "pools",
    responses(
        (status = 201, description = "Pool created", body = CreateManagerResponse),
        (status = 200, description = "Pool already exists", body = CreateManagerResponse),
        (status = BAD_REQUEST, description = "Missing function_name or malformed field", body = ApiError)
    ),
)]
async fn create_manager(
    State(state): State<RouteState>,
    body: Bytes,
) -> Result<(StatusCode, Json<CreateManagerResponse>), ApiError> {
    let request: CreateManagerRequest = if body.is_empty() {
        CreateManagerRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(&format!("invalid create_manager request: {}", e)))?
    };
    let spec = request
        .into_pool_spec()
        .ok_or_else(|| ApiError::bad_request("function_name is required"))?;
    let function = spec.function_name.clone();

    match state.registry.create(state.pool_defaults.pool_config(&spec)) {
        CreateOutcome::Created(_) => Ok((
            StatusCode::CREATED,
            Json(CreateManagerResponse {
                status: "created".to_string(),
                function,
                message: None,
            }),
        )),
        CreateOutcome::Exists(_) => Ok((
            StatusCode::OK,
            Json(CreateManagerResponse {
                status: "exists".to_string(),
                message: Some(format!("pool for {} already exists", function)),
                function,
            }),
        )),
    }
}

/// Run a payload on a warm container of the function
#[utoipa::path(
    post,
    path = "/dispatch/{function_name}",
    request_body(
        content = Object,
        description = "Forwarded to the function as is. A missing or invalid body is sent as `{}`."
    ),
    tag = "dispatch",
    params(("function_name" = String, Path, description = "Function to run")),
    responses(
        (status = 200, description = "Function response with status and container"),
        (status = NOT_FOUND, description = "Unknown function", body = ApiError),
        (status = INTERNAL_SERVER_ERROR, description = "No container could be provisioned", body = ApiError),
        (status = BAD_GATEWAY, description = "The container failed the request", body = ApiError),
        (status = GATEWAY_TIMEOUT, description = "The container did not answer in time", body = ApiError)
    ),
)]
async fn dispatch(
    State(state): State<RouteState>,
    Path(function_name): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let payload: Value = serde_json::from_slice(&body).unwrap_or_else(|_| json!({}));
    let outcome = state.dispatcher.dispatch(&function_name, &payload).await?;

    let mut response = match outcome.body {
        Value::Object(map) => map,
        other => {
            let mut map = serde_json::Map::new();
            map.insert("result".to_string(), other);
            map
        }
    };
    response.insert("status".to_string(), json!("success"));
    response.insert("container".to_string(), json!(outcome.container_id));
    let status = StatusCode::from_u16(outcome.status_code).unwrap_or(StatusCode::OK);
    Ok((status, Json(Value::Object(response))).into_response())
}

/// Start a workflow run in the background
#[utoipa::path(
    post,
    path = "/dispatch_workflow",
    request_body = DispatchWorkflowRequest,
    tag = "workflows",
    responses(
        (status = 202, description = "Workflow accepted", body = AcceptedResponse),
        (status = BAD_REQUEST, description = "Unknown workflow name", body = ApiError)
    ),
)]
async fn dispatch_workflow(
    State(state): State<RouteState>,
    body: Bytes,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let request: DispatchWorkflowRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(&format!("invalid workflow request: {}", e)))?;
    let handle = state
        .engine
        .run_workflow(&request.workflow_name, request.payload)
        .map_err(|e| match e {
            WorkflowError::UnknownWorkflow(_) => ApiError::bad_request("unknown workflow name"),
            other => ApiError::internal_error(&other.to_string()),
        })?;
    info!(
        workflow_id = handle.id(),
        workflow = %request.workflow_name,
        "Workflow dispatched"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "accepted".to_string(),
            workflow_id: handle.id().to_string(),
        }),
    ))
}

/// Container counts and states of a function's pool
#[utoipa::path(
    get,
    path = "/manager_status/{function_name}",
    tag = "pools",
    params(("function_name" = String, Path, description = "Function of the pool")),
    responses(
        (status = 200, description = "Pool status", body = PoolStatus),
        (status = NOT_FOUND, description = "Unknown function", body = ApiError)
    ),
)]
async fn manager_status(
    State(state): State<RouteState>,
    Path(function_name): Path<String>,
) -> Result<Json<PoolStatus>, ApiError> {
    let pool = state
        .registry
        .get(&function_name)
        .ok_or_else(|| ApiError::not_found("unknown function"))?;
    Ok(Json(pool.status()))
}

/// Status of a workflow run
#[utoipa::path(
    get,
    path = "/workflows/{workflow_id}",
    tag = "workflows",
    params(("workflow_id" = String, Path, description = "Id returned by dispatch_workflow")),
    responses(
        (status = 200, description = "Workflow run status", body = WorkflowRunInfo),
        (status = NOT_FOUND, description = "Unknown workflow run", body = ApiError)
    ),
)]
async fn workflow_status(
    State(state): State<RouteState>,
    Path(workflow_id): Path<String>,
) -> Result<Json<WorkflowRunInfo>, ApiError> {
    state
        .engine
        .runs()
        .get(&workflow_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("unknown workflow run"))
}
