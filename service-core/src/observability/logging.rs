use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use std::str::FromStr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer, Registry};

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

/// What the global subscriber should emit.
#[derive(Debug, Clone)]
pub struct LogSettings<'a> {
    pub service_name: &'a str,
    /// Fallback filter when `RUST_LOG` is unset.
    pub log_level: &'a str,
    pub format: LogFormat,
    pub otlp_endpoint: Option<&'a str>,
}

fn otlp_layer(
    service_name: &str,
    endpoint: &str,
) -> Option<Box<dyn Layer<Registry> + Send + Sync>> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint);

    match opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
            KeyValue::new("service.name", service_name.to_string()),
        ])))
        .install_batch(runtime::Tokio)
    {
        Ok(tracer) => Some(tracing_opentelemetry::layer().with_tracer(tracer).boxed()),
        Err(e) => {
            eprintln!(
                "OTLP exporter for '{}' at '{}' failed to start: {}",
                service_name, endpoint, e
            );
            None
        }
    }
}

/// Install the global subscriber. A failed OTLP exporter leaves plain
/// logging in place.
pub fn init_tracing(settings: &LogSettings<'_>) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(settings.log_level));

    let telemetry = settings
        .otlp_endpoint
        .and_then(|endpoint| otlp_layer(settings.service_name, endpoint));

    let fmt_layer = match settings.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .json()
            .flatten_event(true)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(telemetry)
        .with(fmt_layer)
        .with(env_filter)
        .init();
}
