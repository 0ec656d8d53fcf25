use anyhow::Result;
use clap::Parser;
use tracing::info;

use warden::config::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    let mut settings = Settings::parse();

    // Initialize tracing with optional OTLP export (endpoint via
    // OTEL_EXPORTER_OTLP_ENDPOINT)
    let _tracing_guard = warden::telemetry::init_tracing("warden", &settings.log_filter(), settings.json);

    // Function platforms buffer whole responses, so SSE streaming cannot work
    if std::env::var_os("AWS_LAMBDA_FUNCTION_NAME").is_some() {
        settings.disable_streaming = true;
        info!("function platform detected, streaming disabled");
    }

    info!(listen = %settings.listen_addr, "starting warden gateway");

    warden::gateway::run(settings).await
}
