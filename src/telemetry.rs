use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::{Protocol, WithExportConfig};
use opentelemetry_sdk::{Resource, trace as sdktrace};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const OTLP_ENDPOINT_VAR: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Installs the global subscriber: fmt output filtered by `RUST_LOG`
/// (default `info`), plus span export over OTLP/HTTP when
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
pub fn init_tracing(service_name: &'static str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let otel_layer = std::env::var(OTLP_ENDPOINT_VAR)
        .ok()
        .filter(|endpoint| !endpoint.is_empty())
        .and_then(|endpoint| {
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_http()
                .with_protocol(Protocol::HttpBinary)
                .with_endpoint(format!("{}/v1/traces", endpoint.trim_end_matches('/')))
                .build()
                .map_err(|e| eprintln!("[reconcile] OTLP exporter disabled: {}", e))
                .ok()?;
            let resource = Resource::builder_empty()
                .with_attributes(vec![KeyValue::new("service.name", service_name)])
                .build();
            let tracer_provider = sdktrace::SdkTracerProvider::builder()
                .with_simple_exporter(exporter)
                .with_resource(resource)
                .build();
            let tracer = tracer_provider.tracer(service_name);
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        });

    if let Err(e) = tracing_subscriber::registry()
        .with(filter)
        .with(otel_layer)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("[reconcile] tracing subscriber not installed: {}", e);
    }
}
