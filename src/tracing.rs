//! Logging and OpenTelemetry tracing
//!
//! Every engine iteration that touches a guest runs inside a span carrying the
//! guest's uuid and a per-attempt `trace_id`, so log lines of one creation or
//! instruction can be correlated in Loki or Tempo.
//!
//! ```text
//! nodevisor → fmt layer (stdout, plain or JSON)
//!           → OTLP (gRPC) → OTel Collector → Tempo   (only with otlp_endpoint)
//! ```

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::TelemetryConfig;
use crate::error::{AgentError, Result};

/// Filter used when `RUST_LOG` is not set
const DEFAULT_FILTER: &str = "info,nodevisor=debug";

fn default_filter(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        DEFAULT_FILTER
    }
}

/// Install the global subscriber
///
/// `RUST_LOG` overrides the level filter. Spans are exported over OTLP only
/// when `telemetry.otlp_endpoint` is configured.
pub fn init_tracing(service_name: &str, telemetry: &TelemetryConfig, debug: bool) -> Result<()> {
    let otel_layer = match telemetry.otlp_endpoint.as_deref() {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint);

            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(exporter)
                .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(vec![
                    KeyValue::new("service.name", service_name.to_string()),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])))
                .install_batch(runtime::Tokio)
                .map_err(|e| AgentError::Telemetry(e.to_string()))?;

            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let (json_layer, plain_layer) = if telemetry.log_json {
        (Some(tracing_subscriber::fmt::layer().json().with_target(true)), None)
    } else {
        let layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false);
        (None, Some(layer))
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(debug)));

    tracing_subscriber::registry()
        .with(filter)
        .with(otel_layer)
        .with(json_layer)
        .with(plain_layer)
        .try_init()
        .map_err(|e| AgentError::Telemetry(e.to_string()))?;

    tracing::info!(
        service = service_name,
        otlp_endpoint = telemetry.otlp_endpoint.as_deref().unwrap_or("disabled"),
        "tracing initialized"
    );

    Ok(())
}

/// Flush pending spans to the collector
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
    tracing::info!("tracing shutdown complete");
}
