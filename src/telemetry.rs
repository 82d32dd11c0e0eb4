use opentelemetry::trace::TraceId;
use tracing_subscriber::{prelude::*, EnvFilter, Layer, Registry};

/// Output format of the log lines
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Single line human readable output
    #[default]
    Compact,
    /// One JSON object per line, for log aggregation in the cluster
    Json,
}

/// Fetch an opentelemetry::trace::TraceId as hex through the full tracing stack
pub fn get_trace_id() -> Option<TraceId> {
    use opentelemetry::trace::TraceContextExt as _; // opentelemetry::Context -> opentelemetry::trace::Span
    use tracing_opentelemetry::OpenTelemetrySpanExt as _; // tracing::Span to opentelemetry::Context

    match tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
    {
        TraceId::INVALID => None,
        valid => Some(valid),
    }
}

#[cfg(feature = "telemetry")]
fn init_tracer_provider(
    otlp_endpoint: String,
) -> anyhow::Result<opentelemetry_sdk::trace::SdkTracerProvider> {
    use opentelemetry_otlp::{SpanExporter, WithExportConfig};
    use opentelemetry_sdk::{trace::SdkTracerProvider, Resource};

    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(otlp_endpoint)
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            Resource::builder()
                .with_service_name("member-operator")
                .build(),
        )
        .build())
}

fn fmt_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    match format {
        LogFormat::Compact => tracing_subscriber::fmt::layer().compact().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .boxed(),
    }
}

/// Initialize tracing
///
/// Spans are exported over OTLP when built with the `telemetry` feature and an endpoint is given.
pub fn init(format: LogFormat, otlp_endpoint: Option<String>) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or(EnvFilter::try_new("info"))?;

    #[cfg(feature = "telemetry")]
    let telemetry = match otlp_endpoint {
        Some(endpoint) => {
            use opentelemetry::trace::TracerProvider;
            let provider = init_tracer_provider(endpoint)?;
            let tracer = provider.tracer("member-operator");
            // Set the global tracer provider so it stays alive
            opentelemetry::global::set_tracer_provider(provider);
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };
    #[cfg(not(feature = "telemetry"))]
    if otlp_endpoint.is_some() {
        eprintln!("built without the telemetry feature, not exporting traces");
    }

    // Decide on layers
    #[cfg(feature = "telemetry")]
    let collector = Registry::default()
        .with(telemetry)
        .with(fmt_layer(format))
        .with(env_filter);
    #[cfg(not(feature = "telemetry"))]
    let collector = Registry::default()
        .with(fmt_layer(format))
        .with(env_filter);

    tracing::subscriber::set_global_default(collector)?;
    Ok(())
}
