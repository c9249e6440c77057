use crate::config::{LogFormat, TelemetryConfig};
use anyhow::{Context, Error};
use opentelemetry::global;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_FILTER: &str = "alldownloads=info";

pub fn init(config: &TelemetryConfig) -> Result<(), Error> {
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))
        .context("invalid log filter")?;

    // Exported only when a collector is configured.
    let telemetry = match &config.jaeger_endpoint {
        Some(endpoint) => {
            global::set_text_map_propagator(opentelemetry_jaeger::Propagator::new());

            let tracer = opentelemetry_jaeger::new_collector_pipeline()
                .with_endpoint(endpoint)
                .with_service_name("alldownloads")
                .with_isahc()
                .with_timeout(std::time::Duration::from_secs(2))
                .install_batch(opentelemetry::runtime::Tokio)
                .context("failed to install jaeger pipeline")?;

            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let (text, json) = match config.log_format {
        LogFormat::Text => (Some(fmt::layer()), None),
        LogFormat::Json => (None, Some(fmt::layer().json())),
    };

    tracing_subscriber::registry()
        .with(telemetry)
        .with(filter_layer)
        .with(text)
        .with(json)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(())
}

pub fn shutdown() {
    global::shutdown_tracer_provider();
}
