//! perfcore service
//!
//! Runs the performance core in-process and exposes it over HTTP.
//!
//! # Endpoints
//!
//! ```text
//! ┌────────────────────────────── API server ───────────────────────────────┐
//! │  GET  /metrics            Prometheus text exposition                   │
//! │  GET  /dashboard          Snapshot of every component (JSON)           │
//! │  GET  /report             Latest performance report (JSON)             │
//! │  GET  /alerts?window=N    Alerts raised in the last N seconds          │
//! │  POST /admin/thresholds   Replace alert thresholds (JSON)              │
//! │  POST /admin/rules        Replace the alert rule set (JSON array)      │
//! │  POST /admin/optimize?category=cache|memory|cleanup|all                │
//! ├───────────────────────────── Health server ─────────────────────────────┤
//! │  GET  /livez  /readyz  /healthz                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use perfcore::memory::{ProcessMemoryProbe, TrackingAllocator};
use perfcore::monitor::{HealthStatus, ProcessRuntimeStats, RequestTracker, Severity};
use perfcore::{Error, MetricsExporter, PerfConfig, PerformanceDashboard, StoreClient};

#[global_allocator]
static GLOBAL: TrackingAllocator = TrackingAllocator;

// =============================================================================
// CLI Arguments
// =============================================================================

/// perfcore - self-regulating cache, memory and metrics core
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, short, env = "PERFCORE_CONFIG")]
    config: Option<PathBuf>,

    /// API server bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8080")]
    api_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Shared store call timeout in milliseconds (overrides the config file)
    #[arg(long, env = "STORE_TIMEOUT_MS")]
    store_timeout_ms: Option<u64>,

    /// Heap budget in bytes used for pressure ratios (overrides the config file)
    #[arg(long, env = "MEMORY_BUDGET_BYTES")]
    memory_budget_bytes: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<PerfConfig> {
        let mut config = match &self.config {
            Some(path) => PerfConfig::load(path)
                .with_context(|| format!("loading configuration from {}", path.display()))?,
            None => PerfConfig::default(),
        };

        if let Some(ms) = self.store_timeout_ms {
            config.store.timeout = Duration::from_millis(ms);
        }
        if let Some(budget) = self.memory_budget_bytes {
            config.memory.memory_budget_bytes = budget;
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

struct AppState {
    dashboard: PerformanceDashboard,
    exporter: MetricsExporter,
    tracker: Arc<RequestTracker>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = args.load_config()?;

    info!("Starting perfcore");
    info!("  Store timeout: {:?}", config.store.timeout);
    info!("  Memory budget: {} bytes", config.memory.memory_budget_bytes);
    info!("  Realtime interval: {:?}", config.monitor.realtime_interval);
    info!("  Alert rules: {}", config.initial_rules().len());

    let store = Arc::new(config.in_memory_store());
    let tracker = Arc::new(RequestTracker::new());
    let dashboard = PerformanceDashboard::assemble(
        &config,
        store.clone(),
        Arc::new(ProcessMemoryProbe::new(config.memory.memory_budget_bytes)),
        Arc::new(ProcessRuntimeStats::new(tracker.clone())),
    )?;

    let restored = dashboard.monitor().restore_history().await;
    if restored > 0 {
        info!(buckets = restored, "Restored metric history");
    }

    let state = Arc::new(AppState {
        dashboard,
        exporter: MetricsExporter::new()?,
        tracker,
    });

    state.dashboard.start();
    spawn_alert_logger(&state);

    // Start health server
    let health_addr = parse_addr(&args.health_addr, "health")?;
    let health_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = serve(health_addr, health_state, health_handler).await {
            error!("Health server error: {}", e);
        }
    });

    // Start API server
    let api_addr = parse_addr(&args.api_addr, "API")?;
    let api_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = serve(api_addr, api_state, api_handler).await {
            error!("API server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    state.dashboard.stop().await;
    log_store_health(&store);

    info!("perfcore shutdown complete");
    Ok(())
}

fn spawn_alert_logger(state: &Arc<AppState>) {
    let mut alerts = state.dashboard.monitor().subscribe_alerts();
    tokio::spawn(async move {
        loop {
            match alerts.recv().await {
                Ok(event) => match event.severity {
                    Severity::Critical => error!(alert = %event.id, "{}", event.message),
                    Severity::Warning => warn!(alert = %event.id, "{}", event.message),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Alert logger lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn log_store_health(store: &StoreClient) {
    let health = store.health();
    info!(
        failures = health.failures,
        timeouts = health.timeouts,
        "Shared store health at shutdown"
    );
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "hyper_util=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// HTTP plumbing
// =============================================================================

type HttpResponse = Response<Full<Bytes>>;

fn parse_addr(addr: &str, server: &str) -> anyhow::Result<SocketAddr> {
    addr.parse()
        .with_context(|| format!("invalid {} server address '{}'", server, addr))
}

async fn serve<H, Fut>(addr: SocketAddr, state: Arc<AppState>, handler: H) -> anyhow::Result<()>
where
    H: Fn(Arc<AppState>, Request<Incoming>) -> Fut + Copy + Send + Sync + 'static,
    Fut: std::future::Future<Output = HttpResponse> + Send + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!("Listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await.context("accept error")?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(handler(state, req).await) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Connection error: {}", e);
            }
        });
    }
}

fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> HttpResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

fn text(status: StatusCode, body: impl Into<String>) -> HttpResponse {
    respond(status, "text/plain; charset=utf-8", body.into())
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> HttpResponse {
    match serde_json::to_vec(value) {
        Ok(body) => respond(status, "application/json", body),
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn error_response(err: &Error) -> HttpResponse {
    let status = match err {
        Error::Config(_) | Error::ConfigParse(_) | Error::Serialization(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json(status, &serde_json::json!({ "error": err.to_string() }))
}

fn query_param<'a>(req: &'a Request<Incoming>, name: &str) -> Option<&'a str> {
    req.uri().query()?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then_some(value)
    })
}

async fn read_json(req: Request<Incoming>) -> Result<serde_json::Value, HttpResponse> {
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| text(StatusCode::BAD_REQUEST, e.to_string()))?
        .to_bytes();
    serde_json::from_slice(&body)
        .map_err(|e| error_response(&Error::config(format!("malformed JSON body: {}", e))))
}

// =============================================================================
// Health Server
// =============================================================================

async fn health_handler(state: Arc<AppState>, req: Request<Incoming>) -> HttpResponse {
    let health = state.dashboard.health();
    match req.uri().path() {
        "/livez" => {
            let check = health.liveness_check();
            let status = if check.status == HealthStatus::Healthy {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json(status, &check)
        }
        "/readyz" => {
            let response = state.dashboard.readiness().await;
            let status = if response.status.is_operational() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json(status, &response)
        }
        "/healthz" => {
            let response = state.dashboard.health_check().await;
            let status = if response.status.is_operational() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json(status, &response)
        }
        _ => text(StatusCode::NOT_FOUND, "not found"),
    }
}

// =============================================================================
// API Server
// =============================================================================

async fn api_handler(state: Arc<AppState>, req: Request<Incoming>) -> HttpResponse {
    let mut request = state.tracker.begin();
    let response = route(&state, req).await;
    if response.status().is_server_error() {
        request.fail();
    }
    response
}

async fn route(state: &AppState, req: Request<Incoming>) -> HttpResponse {
    let dashboard = &state.dashboard;
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (method, path.as_str()) {
        (Method::GET, "/metrics") => {
            state.exporter.update(dashboard);
            match state.exporter.render() {
                Ok(body) => respond(StatusCode::OK, &state.exporter.content_type(), body),
                Err(e) => error_response(&e),
            }
        }
        (Method::GET, "/dashboard") => json(StatusCode::OK, &dashboard.snapshot()),
        (Method::GET, "/report") => json(StatusCode::OK, &dashboard.report().await),
        (Method::GET, "/alerts") => {
            let window = query_param(&req, "window")
                .and_then(|w| w.parse().ok())
                .unwrap_or(3600);
            let severity = match query_param(&req, "severity") {
                Some("warning") => Some(Severity::Warning),
                Some("critical") => Some(Severity::Critical),
                _ => None,
            };
            json(
                StatusCode::OK,
                &dashboard.recent_alerts(Duration::from_secs(window), severity),
            )
        }
        (Method::POST, "/admin/thresholds") => match read_json(req).await {
            Ok(payload) => match dashboard.update_thresholds_json(&payload) {
                Ok(()) => json(StatusCode::OK, &dashboard.monitor().thresholds()),
                Err(e) => error_response(&e),
            },
            Err(response) => response,
        },
        (Method::POST, "/admin/rules") => match read_json(req).await {
            Ok(payload) => match dashboard.update_rules_json(&payload) {
                Ok(()) => json(StatusCode::OK, &dashboard.monitor().rules()),
                Err(e) => error_response(&e),
            },
            Err(response) => response,
        },
        (Method::POST, "/admin/optimize") => {
            let category = query_param(&req, "category").unwrap_or("all");
            match dashboard.optimize_named(category).await {
                Ok(report) => json(StatusCode::OK, &report),
                Err(e) => error_response(&e),
            }
        }
        _ => text(StatusCode::NOT_FOUND, "not found"),
    }
}
