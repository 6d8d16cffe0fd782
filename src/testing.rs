//! Test doubles: a container runtime whose "containers" are in-process proxy
//! servers on ephemeral loopback ports.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Mutex,
        MutexGuard,
    },
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json,
    Router,
};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::{
    config::ServerConfig,
    dispatcher::{DispatchSettings, Dispatcher},
    health::HealthProber,
    metrics::Metrics,
    pool::{PoolConfig, ReadinessConfig},
    proxy_client::ProxyClient,
    registry::PoolRegistry,
    routes::{create_routes, RouteState},
    runtime::{
        container_name,
        ContainerHandle,
        ContainerRuntime,
        ContainerSpec,
        RuntimeError,
        RuntimeStatus,
    },
    workflow::WorkflowEngine,
};

/// Pool config with fast readiness polling.
pub fn test_pool_config(function_name: &str) -> PoolConfig {
    let mut config = PoolConfig::new(function_name);
    config.readiness = ReadinessConfig {
        timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(20),
    };
    config
}

pub fn test_dispatch_settings() -> DispatchSettings {
    DispatchSettings {
        init_timeout: Duration::from_secs(2),
        run_timeout: Duration::from_secs(2),
        retry_backoff: Duration::from_millis(10),
        retry_backoff_max: Duration::from_millis(50),
        ..Default::default()
    }
}

#[derive(Debug, Clone)]
pub enum ReplyBody {
    Json(Value),
    Raw(String),
}

/// What the fake proxy answers to `POST /run`.
#[derive(Debug, Clone)]
pub struct ProxyReply {
    pub status: u16,
    pub body: ReplyBody,
    pub delay: Duration,
}

impl ProxyReply {
    pub fn ok(body: Value) -> Self {
        Self::status(200, body)
    }

    pub fn status(status: u16, body: Value) -> Self {
        Self {
            status,
            body: ReplyBody::Json(body),
            delay: Duration::ZERO,
        }
    }

    pub fn raw(text: &str) -> Self {
        Self {
            status: 200,
            body: ReplyBody::Raw(text.to_string()),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type ReplyFn = dyn Fn(&str, Value) -> ProxyReply + Send + Sync;

struct Behavior {
    ready: bool,
    missing_image: bool,
    fail_stop: bool,
    status_delay: Duration,
    init_status: u16,
    reply: Arc<ReplyFn>,
}

struct MockContainer {
    handle: ContainerHandle,
    running: bool,
    server: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Calls {
    init: Vec<(String, Value)>,
    run: Vec<(String, Value)>,
}

struct Shared {
    behavior: Mutex<Behavior>,
    containers: Mutex<HashMap<String, MockContainer>>,
    calls: Mutex<Calls>,
    started: AtomicUsize,
    stopped: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

/// In-memory [`ContainerRuntime`]. Every started container is an axum server
/// speaking the proxy protocol (`/status`, `/init`, `/run`).
#[derive(Clone)]
pub struct MockRuntime {
    shared: Arc<Shared>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    /// Ready containers whose `/run` echoes the payload.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                behavior: Mutex::new(Behavior {
                    ready: true,
                    missing_image: false,
                    fail_stop: false,
                    status_delay: Duration::ZERO,
                    init_status: 200,
                    reply: Arc::new(|function: &str, payload: Value| {
                        ProxyReply::ok(json!({"function": function, "echo": payload}))
                    }),
                }),
                containers: Mutex::new(HashMap::new()),
                calls: Mutex::new(Calls::default()),
                started: AtomicUsize::new(0),
                stopped: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set_reply<F>(&self, reply: F)
    where
        F: Fn(&str, Value) -> ProxyReply + Send + Sync + 'static,
    {
        lock(&self.shared.behavior).reply = Arc::new(reply);
    }

    pub fn set_ready(&self, ready: bool) {
        lock(&self.shared.behavior).ready = ready;
    }

    pub fn set_missing_image(&self, missing: bool) {
        lock(&self.shared.behavior).missing_image = missing;
    }

    pub fn set_fail_stop(&self, fail: bool) {
        lock(&self.shared.behavior).fail_stop = fail;
    }

    /// Delay every container state query by `delay`.
    pub fn set_status_delay(&self, delay: Duration) {
        lock(&self.shared.behavior).status_delay = delay;
    }

    pub fn set_init_status(&self, status: u16) {
        lock(&self.shared.behavior).init_status = status;
    }

    /// The container exits: its proxy goes away and the runtime reports it
    /// as exited.
    pub async fn kill(&self, container_id: &str) {
        let server = {
            let mut containers = lock(&self.shared.containers);
            containers.get_mut(container_id).and_then(|c| {
                c.running = false;
                c.server.take()
            })
        };
        abort_server(server).await;
    }

    /// The proxy dies while the runtime still reports the container running.
    pub async fn crash_proxy(&self, container_id: &str) {
        let server = lock(&self.shared.containers)
            .get_mut(container_id)
            .and_then(|c| c.server.take());
        abort_server(server).await;
    }

    pub fn started(&self) -> usize {
        self.shared.started.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Containers the runtime reports as running.
    pub fn running(&self) -> usize {
        lock(&self.shared.containers)
            .values()
            .filter(|c| c.running)
            .count()
    }

    pub fn container_ids(&self) -> Vec<String> {
        lock(&self.shared.containers).keys().cloned().collect()
    }

    /// `(function, body)` of every `/init` call.
    pub fn init_calls(&self) -> Vec<(String, Value)> {
        lock(&self.shared.calls).init.clone()
    }

    /// `(function, payload)` of every `/run` call.
    pub fn run_calls(&self) -> Vec<(String, Value)> {
        lock(&self.shared.calls).run.clone()
    }

    /// Highest number of `/run` requests served at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.shared.max_in_flight.load(Ordering::SeqCst)
    }
}

async fn abort_server(server: Option<JoinHandle<()>>) {
    if let Some(server) = server {
        server.abort();
        let _ = server.await;
    }
}

#[derive(Clone)]
struct ProxyState {
    shared: Arc<Shared>,
    function: String,
}

async fn proxy_status(State(state): State<ProxyState>) -> Response {
    if lock(&state.shared.behavior).ready {
        (StatusCode::OK, Json(json!({"status": "new"}))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "starting"})),
        )
            .into_response()
    }
}

async fn proxy_init(State(state): State<ProxyState>, Json(body): Json<Value>) -> Response {
    lock(&state.shared.calls)
        .init
        .push((state.function.clone(), body));
    let status = lock(&state.shared.behavior).init_status;
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({"status": "initialized"}))).into_response()
}

async fn proxy_run(State(state): State<ProxyState>, Json(payload): Json<Value>) -> Response {
    lock(&state.shared.calls)
        .run
        .push((state.function.clone(), payload.clone()));
    let now = state.shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.shared.max_in_flight.fetch_max(now, Ordering::SeqCst);

    let reply_fn = lock(&state.shared.behavior).reply.clone();
    let reply = reply_fn(&state.function, payload);
    if !reply.delay.is_zero() {
        tokio::time::sleep(reply.delay).await;
    }
    state.shared.in_flight.fetch_sub(1, Ordering::SeqCst);

    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match reply.body {
        ReplyBody::Json(body) => (status, Json(body)).into_response(),
        ReplyBody::Raw(text) => (status, text).into_response(),
    }
}

fn proxy_router(shared: Arc<Shared>, function: String) -> Router {
    Router::new()
        .route("/status", get(proxy_status))
        .route("/init", post(proxy_init))
        .route("/run", post(proxy_run))
        .with_state(ProxyState { shared, function })
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn start(&self, spec: ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        if lock(&self.shared.behavior).missing_image {
            return Err(RuntimeError::ImageNotFound(spec.image));
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow!(e))?;
        let endpoint: SocketAddr = listener.local_addr().map_err(|e| anyhow!(e))?;
        let router = proxy_router(self.shared.clone(), spec.function_name.clone());
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        let handle = ContainerHandle {
            id: format!(
                "{}{}",
                uuid::Uuid::new_v4().simple(),
                uuid::Uuid::new_v4().simple()
            ),
            name: container_name(&spec.function_name),
            endpoint,
        };
        lock(&self.shared.containers).insert(
            handle.id.clone(),
            MockContainer {
                handle: handle.clone(),
                running: true,
                server: Some(server),
            },
        );
        self.shared.started.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    async fn stop(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        if lock(&self.shared.behavior).fail_stop {
            return Err(RuntimeError::Other(anyhow!("daemon refused to stop container")));
        }
        self.kill(&handle.id).await;
        self.shared.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        let removed = lock(&self.shared.containers).remove(&handle.id);
        abort_server(removed.and_then(|c| c.server)).await;
        Ok(())
    }

    async fn status(&self, handle: &ContainerHandle) -> Result<RuntimeStatus, RuntimeError> {
        let delay = lock(&self.shared.behavior).status_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let running = lock(&self.shared.containers)
            .get(&handle.id)
            .map(|c| c.running)
            .unwrap_or(false);
        Ok(if running {
            RuntimeStatus::Running
        } else {
            RuntimeStatus::Exited
        })
    }

    async fn list_managed(&self) -> Result<Vec<String>, RuntimeError> {
        Ok(lock(&self.shared.containers)
            .values()
            .map(|c| c.handle.name.clone())
            .collect())
    }

    async fn remove_by_name(&self, name: &str) -> Result<(), RuntimeError> {
        let removed: Vec<MockContainer> = {
            let mut containers = lock(&self.shared.containers);
            let ids: Vec<String> = containers
                .values()
                .filter(|c| c.handle.name == name)
                .map(|c| c.handle.id.clone())
                .collect();
            ids.iter().filter_map(|id| containers.remove(id)).collect()
        };
        for container in removed {
            abort_server(container.server).await;
        }
        Ok(())
    }
}

/// The full service stack on top of a [`MockRuntime`].
pub struct TestService {
    pub runtime: Arc<MockRuntime>,
    pub registry: Arc<PoolRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub engine: Arc<WorkflowEngine>,
    pub config: ServerConfig,
}

impl TestService {
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(mut config: ServerConfig) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(crate::tracing::get_env_filter())
            .with_test_writer()
            .try_init();

        config.pool_defaults.readiness_timeout_secs = 2;
        config.pool_defaults.readiness_poll_interval_ms = 20;

        let runtime = Arc::new(MockRuntime::new());
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(PoolRegistry::new(
            runtime.clone(),
            HealthProber::new(),
            metrics.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            ProxyClient::new(),
            test_dispatch_settings(),
            metrics.clone(),
        ));
        let engine = Arc::new(WorkflowEngine::new(
            dispatcher.clone(),
            &config.workflows,
            metrics,
        ));
        Self {
            runtime,
            registry,
            dispatcher,
            engine,
            config,
        }
    }

    /// Create a pool with the configured defaults.
    pub fn create_pool(&self, function_name: &str) {
        let config = self.config.pool_defaults.pool_config(&crate::config::PoolSpec {
            function_name: function_name.to_string(),
            ..Default::default()
        });
        self.registry.create(config);
    }

    pub fn route_state(&self) -> RouteState {
        RouteState {
            registry: self.registry.clone(),
            dispatcher: self.dispatcher.clone(),
            engine: self.engine.clone(),
            pool_defaults: Arc::new(self.config.pool_defaults.clone()),
        }
    }

    /// Serve the HTTP API on an ephemeral port and return its base URL.
    pub async fn serve(&self) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = create_routes(self.route_state());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }
}
