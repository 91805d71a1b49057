use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agreement_retirement_api::{
    init_logging, AuditSink, EnforcementAdapter, EnforcementDecision, HttpAuditSink, LogAuditSink,
    LogFormat, QueuedAuditSink, RetireRequest, RetirementPage, RetirementService,
    API_CONTRACT_VERSION,
};
use agreement_retirement_core::{
    InMemoryRetirementStore, QuerySpec, RetirementError, RetirementOutcome, RetirementQuery,
    RetirementRecord, RetirementStore, SystemClock,
};
use agreement_retirement_monitor::{
    CancellationToken, HttpAgreementSource, MonitorConfig, MonitorStatus, PolicyComplianceMonitor,
};
use agreement_retirement_store_sqlite::{SqliteRetirementStore, SqliteStoreOptions};
use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::Serialize;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const ACTOR_HEADER: &str = "x-actor";
const DEFAULT_ACTOR: &str = "management-api";

#[derive(Clone)]
struct ServiceState {
    service: Arc<RetirementService>,
    enforcement: EnforcementAdapter,
    monitor: Option<Arc<PolicyComplianceMonitor>>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    kind: &'static str,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    audit_failures: u64,
}

#[derive(Debug, Clone, Serialize)]
struct MonitorStatusResponse {
    enabled: bool,
    status: Option<MonitorStatus>,
}

#[derive(Debug, Parser)]
#[command(name = "agreement-retirement-service")]
#[command(about = "HTTP service for agreement retirement and policy compliance monitoring")]
struct Args {
    #[arg(long, env = "AR_DB", default_value = "./agreement_retirement.sqlite3")]
    db: PathBuf,
    /// Keep retirements in process memory instead of the database file.
    #[arg(long, env = "AR_IN_MEMORY")]
    in_memory: bool,
    #[arg(long, env = "AR_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, env = "AR_BUSY_TIMEOUT_MS", default_value_t = 5_000)]
    busy_timeout_ms: u64,
    /// Agreement listing endpoint; the monitor only runs when this is set.
    #[arg(long, env = "AR_SOURCE_URL")]
    source_url: Option<String>,
    #[arg(long, env = "AR_SOURCE_TIMEOUT_MS", default_value_t = 10_000)]
    source_timeout_ms: u64,
    #[arg(long, env = "AR_MONITOR_INTERVAL_SECS", default_value_t = 60)]
    monitor_interval_secs: u64,
    #[arg(long, env = "AR_MONITOR_STORE_TIMEOUT_MS", default_value_t = 5_000)]
    monitor_store_timeout_ms: u64,
    #[arg(long, env = "AR_DISABLE_MONITOR")]
    disable_monitor: bool,
    /// Logging service endpoint receiving retirement events; events are only logged when unset.
    #[arg(long, env = "AR_AUDIT_URL")]
    audit_url: Option<String>,
    #[arg(long, env = "AR_AUDIT_TIMEOUT_MS", default_value_t = 5_000)]
    audit_timeout_ms: u64,
    #[arg(long, env = "AR_AUDIT_QUEUE_CAPACITY", default_value_t = 1_024)]
    audit_queue_capacity: usize,
    #[arg(long, env = "AR_LOG_FORMAT", default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            kind,
            error: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_argument", message)
    }
}

impl From<RetirementError> for ServiceError {
    fn from(err: RetirementError) -> Self {
        let (status, kind) = match &err {
            RetirementError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "invalid_argument"),
            RetirementError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            RetirementError::TransientStoreFailure(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "transient_store_failure")
            }
            RetirementError::ExternalDependencyUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "external_dependency_unavailable")
            }
            RetirementError::Persistence(_) => (StatusCode::INTERNAL_SERVER_ERROR, "persistence"),
        };
        if status.is_server_error() {
            tracing::warn!(error = %err, "request failed");
        }
        Self::new(status, kind, err.to_string())
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

/// Run a synchronous service call on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, RetirementError> + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result.map_err(ServiceError::from),
        Err(err) => Err(ServiceError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            format!("request task failed: {err}"),
        )),
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/retirements", post(retire).get(list_retirements))
        .route("/v1/retirements/request", post(query_retirements))
        .route("/v1/retirements/:agreement_id", get(show_retirement))
        .route("/v1/enforcement/:agreement_id", get(check_enforcement))
        .route("/v1/monitor/status", get(monitor_status))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_format, "info")?;

    let store: Arc<dyn RetirementStore> = if args.in_memory {
        tracing::warn!("using in-memory retirement store; retirements will not survive restart");
        Arc::new(InMemoryRetirementStore::new())
    } else {
        let options = SqliteStoreOptions { busy_timeout: Duration::from_millis(args.busy_timeout_ms) };
        Arc::new(
            SqliteRetirementStore::open(&args.db, options)
                .with_context(|| format!("failed to open retirement store {}", args.db.display()))?,
        )
    };

    let delivery: Arc<dyn AuditSink> = match &args.audit_url {
        Some(url) => Arc::new(HttpAuditSink::new(url.clone(), Duration::from_millis(args.audit_timeout_ms))),
        None => Arc::new(LogAuditSink),
    };
    let audit = Arc::new(
        QueuedAuditSink::spawn(delivery, args.audit_queue_capacity)
            .context("failed to start audit publisher")?,
    );

    let audit_sink: Arc<dyn AuditSink> = Arc::clone(&audit) as Arc<dyn AuditSink>;
    let service = Arc::new(RetirementService::new(store, audit_sink, Arc::new(SystemClock)));
    let token = CancellationToken::new();

    let monitor = match (&args.source_url, args.disable_monitor) {
        (Some(url), false) => Some(Arc::new(PolicyComplianceMonitor::new(
            Arc::clone(&service),
            Arc::new(HttpAgreementSource::new(url.clone(), Duration::from_millis(args.source_timeout_ms))),
            MonitorConfig {
                interval: Duration::from_secs(args.monitor_interval_secs.max(1)),
                source_timeout: Duration::from_millis(args.source_timeout_ms),
                store_timeout: Duration::from_millis(args.monitor_store_timeout_ms),
            },
        ))),
        _ => {
            tracing::info!("policy monitor disabled");
            None
        }
    };
    let monitor_task = monitor.as_ref().map(|monitor| tokio::spawn(Arc::clone(monitor).run(token.clone())));

    let state = ServiceState {
        enforcement: EnforcementAdapter::new(Arc::clone(&service)),
        service,
        monitor,
    };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "agreement retirement service listening");

    let shutdown = token.clone();
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
            }
            shutdown.cancel();
        })
        .await?;

    token.cancel();
    if let Some(task) = monitor_task {
        if let Err(err) = task.await {
            tracing::error!(error = %err, "policy monitor task failed");
        }
    }
    audit.shutdown();
    tracing::info!("agreement retirement service stopped");
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok", audit_failures: state.service.audit_failures() }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

fn actor_from(headers: &HeaderMap) -> String {
    headers
        .get(ACTOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_ACTOR)
        .to_string()
}

async fn retire(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    request: Result<Json<RetireRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ServiceEnvelope<RetirementOutcome>>), ServiceError> {
    let Json(request) = request.map_err(|rejection| ServiceError::bad_request(rejection.body_text()))?;
    let actor = actor_from(&headers);
    let service = Arc::clone(&state.service);
    let outcome =
        blocking(move || service.retire(&request.agreement_id, &request.reason, &actor)).await?;
    let status = if outcome.was_new { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(envelope(outcome))))
}

async fn list_retirements(
    State(state): State<ServiceState>,
    query: Result<Query<RetirementQuery>, QueryRejection>,
) -> Result<Json<ServiceEnvelope<RetirementPage>>, ServiceError> {
    let Query(query) = query.map_err(|rejection| ServiceError::bad_request(rejection.body_text()))?;
    let service = Arc::clone(&state.service);
    let page = blocking(move || service.find(&query)).await?;
    Ok(Json(envelope(page)))
}

async fn query_retirements(
    State(state): State<ServiceState>,
    spec: Result<Json<QuerySpec>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<RetirementPage>>, ServiceError> {
    let Json(spec) = spec.map_err(|rejection| ServiceError::bad_request(rejection.body_text()))?;
    let service = Arc::clone(&state.service);
    let page = blocking(move || service.query(&spec)).await?;
    Ok(Json(envelope(page)))
}

async fn show_retirement(
    State(state): State<ServiceState>,
    Path(agreement_id): Path<String>,
) -> Result<Json<ServiceEnvelope<RetirementRecord>>, ServiceError> {
    let service = Arc::clone(&state.service);
    let record = blocking(move || {
        service
            .get(&agreement_id)?
            .ok_or_else(|| RetirementError::NotFound(format!("agreement {agreement_id} is not retired")))
    })
    .await?;
    Ok(Json(envelope(record)))
}

async fn check_enforcement(
    State(state): State<ServiceState>,
    Path(agreement_id): Path<String>,
) -> Result<Json<ServiceEnvelope<EnforcementDecision>>, ServiceError> {
    let enforcement = state.enforcement.clone();
    let decision = blocking(move || Ok(enforcement.check_allowed(&agreement_id))).await?;
    Ok(Json(envelope(decision)))
}

async fn monitor_status(State(state): State<ServiceState>) -> Json<ServiceEnvelope<MonitorStatusResponse>> {
    Json(envelope(MonitorStatusResponse {
        enabled: state.monitor.is_some(),
        status: state.monitor.as_ref().map(|monitor| monitor.status()),
    }))
}
