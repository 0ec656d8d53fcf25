//! Tracing initialization with optional OpenTelemetry OTLP export.
//!
//! Export is enabled when `OTEL_EXPORTER_OTLP_ENDPOINT` is set; otherwise
//! only the console layer runs. The returned guard flushes pending spans on
//! shutdown.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Guard that flushes OpenTelemetry spans when dropped.
pub struct TracingGuard {
    provider: Option<SdkTracerProvider>,
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.force_flush() {
                eprintln!("[telemetry] flush error: {e}");
            }
            if let Err(e) = provider.shutdown() {
                eprintln!("[telemetry] shutdown error: {e}");
            }
        }
    }
}

/// Initialize the tracing subscriber.
///
/// `default_filter` applies when `RUST_LOG` is unset (e.g. "info",
/// "warden=debug"). `json` switches the console layer to JSON lines.
pub fn init_tracing(service_name: &str, default_filter: &str, json: bool) -> TracingGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();
    let (provider, otel_init_error) = match &otlp_endpoint {
        Some(endpoint) => match init_otlp_tracer(service_name, endpoint) {
            Ok(p) => (Some(p), None),
            Err(e) => (None, Some(e.to_string())),
        },
        None => (None, None),
    };

    if json {
        let otel_layer = provider
            .as_ref()
            .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer(service_name.to_string())));
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .with(otel_layer)
            .init();
    } else {
        let otel_layer = provider
            .as_ref()
            .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer(service_name.to_string())));
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .with(otel_layer)
            .init();
    }

    if let Some(error) = otel_init_error {
        tracing::warn!(error = %error, "failed to initialize opentelemetry, using console only");
    } else if let Some(endpoint) = otlp_endpoint {
        tracing::info!(endpoint = %endpoint, "opentelemetry export enabled");
    }

    TracingGuard { provider }
}

fn init_otlp_tracer(
    service_name: &str,
    endpoint: &str,
) -> Result<SdkTracerProvider, Box<dyn std::error::Error + Send + Sync>> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::Resource;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            Resource::builder_empty()
                .with_service_name(service_name.to_string())
                .build(),
        )
        .build();

    Ok(provider)
}
