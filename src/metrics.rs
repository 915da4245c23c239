//! Prometheus metrics for the agent engines
//!
//! Metrics are registered in the default registry and optionally served as
//! text on `GET /metrics`.

use std::convert::Infallible;
use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Encoder, Gauge, Histogram, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Creation Engine
    // ─────────────────────────────────────────────────────────────────────────────

    /// Creation jobs by outcome.
    ///
    /// Labels:
    /// - outcome: "completed", "aborted", "start_failed", "dropped", "failed"
    pub static ref CREATE_JOBS: CounterVec = register_counter_vec!(
        "nodevisor_create_jobs_total",
        "Creation jobs dequeued, by outcome",
        &["outcome"]
    ).expect("failed to register CREATE_JOBS metric");

    /// Cycles where the node was saturated and no job was dequeued.
    pub static ref ADMISSION_SKIPPED: Counter = register_counter!(
        "nodevisor_admission_skipped_total",
        "Creation cycles skipped because the load average exceeded the threshold"
    ).expect("failed to register ADMISSION_SKIPPED metric");

    /// Last 5-minute load average read by admission control.
    pub static ref LOAD_AVERAGE: Gauge = register_gauge!(
        "nodevisor_load_average",
        "5-minute load average seen by admission control"
    ).expect("failed to register LOAD_AVERAGE metric");

    /// Time from dequeue to domain start.
    pub static ref CREATE_DURATION: Histogram = register_histogram!(
        "nodevisor_create_duration_seconds",
        "Time to provision, define and start a guest",
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    ).expect("failed to register CREATE_DURATION metric");

    /// Scene cleanup passes.
    ///
    /// Labels:
    /// - result: "removed", "missing", "failed"
    pub static ref SCENE_CLEANUPS: CounterVec = register_counter_vec!(
        "nodevisor_scene_cleanups_total",
        "Reclamations of partially created guests",
        &["result"]
    ).expect("failed to register SCENE_CLEANUPS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Operate Engine
    // ─────────────────────────────────────────────────────────────────────────────

    /// Instructions handled.
    ///
    /// Labels:
    /// - action: wire name of the action ("unsupported" for unknown ones)
    /// - outcome: "dispatched", "noop", "unknown_guest", "failed"
    pub static ref INSTRUCTIONS: CounterVec = register_counter_vec!(
        "nodevisor_instructions_total",
        "Lifecycle instructions handled, by action and outcome",
        &["action", "outcome"]
    ).expect("failed to register INSTRUCTIONS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Supervision
    // ─────────────────────────────────────────────────────────────────────────────

    /// Errors caught by an engine's per-iteration handler.
    pub static ref ENGINE_ERRORS: CounterVec = register_counter_vec!(
        "nodevisor_engine_errors_total",
        "Errors and panics caught at an engine iteration boundary",
        &["engine"]
    ).expect("failed to register ENGINE_ERRORS metric");

    /// Engines currently running.
    pub static ref LIVE_WORKERS: Gauge = register_gauge!(
        "nodevisor_live_workers",
        "Engine workers currently running"
    ).expect("failed to register LIVE_WORKERS metric");
}

/// Render every registered metric in the Prometheus text format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buf) {
        warn!(error = %e, "failed to encode metrics");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn handle(req: Request<hyper::body::Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = if req.uri().path() == "/metrics" {
        Response::builder()
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(Full::new(Bytes::from(render())))
    } else {
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new()))
    };

    // builder only fails on invalid header input, which is static here
    Ok(response.unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))))
}

/// Serve `/metrics` on `addr` until `cancel` fires
pub async fn serve(addr: SocketAddr, cancel: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "metrics endpoint listening");

    loop {
        let (stream, _) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            if let Err(e) = http1::Builder::new().serve_connection(io, service_fn(handle)).await {
                warn!(error = %e, "metrics connection error");
            }
        });
    }

    info!("metrics endpoint stopped");
    Ok(())
}
