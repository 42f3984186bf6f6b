//! Logging and optional OpenTelemetry export.
//!
//! Spans are exported over OTLP/gRPC only when `OTEL_EXPORTER_OTLP_ENDPOINT`
//! is set; otherwise only the fmt layer is installed.

use anyhow::{Context, Result, anyhow};
use base64::{Engine, engine::general_purpose};
use once_cell::sync::OnceCell;
use opentelemetry::{KeyValue, global, propagation::TextMapCompositePropagator, trace::TracerProvider as _};
use opentelemetry_otlp::{Compression, WithExportConfig, WithTonicConfig};
use opentelemetry_sdk::{
    Resource,
    propagation::{BaggagePropagator, TraceContextPropagator},
    trace::{SdkTracerProvider, Tracer},
};
use std::{env::var, time::Duration};
use tonic::{
    metadata::{Ascii, Binary, MetadataKey, MetadataMap, MetadataValue},
    transport::ClientTlsConfig,
};
use tracing::{Level, debug};
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};
use ulid::Ulid;

static TRACER_PROVIDER: OnceCell<SdkTracerProvider> = OnceCell::new();

/// Parse `OTEL_EXPORTER_OTLP_HEADERS` (`k1=v1,k2=v2`) into gRPC metadata.
///
/// Keys ending in `-bin` carry base64 values and become binary metadata.
/// Pairs without `=` are skipped.
fn otlp_metadata(raw: &str) -> Result<MetadataMap> {
    let mut metadata = MetadataMap::new();
    for (key, value) in raw
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.trim().to_ascii_lowercase(), value.trim()))
        .filter(|(key, _)| !key.is_empty())
    {
        if key.ends_with("-bin") {
            let bytes = general_purpose::STANDARD
                .decode(value)
                .map_err(|err| anyhow!("header {key} is not valid base64: {err}"))?;
            let name = MetadataKey::<Binary>::from_bytes(key.as_bytes())
                .map_err(|err| anyhow!("invalid header name {key}: {err}"))?;
            metadata.insert_bin(name, MetadataValue::from_bytes(&bytes));
        } else {
            let name = MetadataKey::<Ascii>::from_bytes(key.as_bytes())
                .map_err(|err| anyhow!("invalid header name {key}: {err}"))?;
            let value: MetadataValue<Ascii> = value
                .parse()
                .map_err(|err| anyhow!("invalid value for header {key}: {err}"))?;
            metadata.insert(name, value);
        }
    }
    Ok(metadata)
}

/// gRPC endpoints without a scheme default to `https`.
fn with_scheme(endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("https://{}", endpoint.trim_end_matches('/'))
    }
}

fn tls_host(endpoint: &str) -> Option<&str> {
    endpoint
        .strip_prefix("https://")?
        .split('/')
        .next()?
        .split(':')
        .next()
        .filter(|host| !host.is_empty())
}

fn init_tracer(endpoint: &str) -> Result<Tracer> {
    if let Ok(protocol) = var("OTEL_EXPORTER_OTLP_PROTOCOL")
        && protocol != "grpc"
    {
        debug!("OTEL_EXPORTER_OTLP_PROTOCOL={protocol} ignored, exporting over gRPC");
    }

    let endpoint = with_scheme(endpoint);
    let mut builder = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .with_compression(Compression::Gzip)
        .with_timeout(Duration::from_secs(3));

    if let Some(host) = tls_host(&endpoint) {
        builder = builder.with_tls_config(
            ClientTlsConfig::new()
                .domain_name(host.to_string())
                .with_native_roots(),
        );
    }

    if let Ok(raw) = var("OTEL_EXPORTER_OTLP_HEADERS") {
        builder = builder.with_metadata(otlp_metadata(&raw)?);
    }

    let exporter = builder.build().context("Failed to build OTLP exporter")?;

    let instance_id = var("OTEL_SERVICE_INSTANCE_ID").unwrap_or_else(|_| Ulid::new().to_string());
    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            Resource::builder_empty()
                .with_attributes(vec![
                    KeyValue::new("service.name", env!("CARGO_PKG_NAME")),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                    KeyValue::new("service.instance.id", instance_id),
                ])
                .build(),
        )
        .build();

    let _ = TRACER_PROVIDER.set(provider.clone());

    global::set_tracer_provider(provider.clone());
    global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ]));

    Ok(provider.tracer(env!("CARGO_PKG_NAME")))
}

/// Install the global subscriber.
///
/// `RUST_LOG` directives override `verbosity_level`.
///
/// # Errors
///
/// Returns an error if the exporter or the subscriber cannot be installed
pub fn init(verbosity_level: Option<Level>) -> Result<()> {
    let fmt_layer = fmt::layer()
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_target(false)
        .pretty();

    let filter = EnvFilter::builder()
        .with_default_directive(verbosity_level.unwrap_or(Level::ERROR).into())
        .from_env_lossy()
        .add_directive("hyper=error".parse()?)
        .add_directive("tokio=error".parse()?)
        .add_directive("sqlx=warn".parse()?)
        .add_directive("opentelemetry_sdk=warn".parse()?);

    if let Ok(endpoint) = var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        let tracer = init_tracer(&endpoint)?;
        let subscriber = Registry::default()
            .with(fmt_layer)
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .with(filter);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = Registry::default().with(fmt_layer).with(filter);
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}

/// Flush and stop the exporter, if one was installed.
pub fn shutdown_tracer() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        debug!("shutting down tracer provider");
        if let Err(err) = provider.shutdown() {
            debug!("tracer provider shutdown: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_from_header_list() -> Result<()> {
        let metadata = otlp_metadata("Authorization = Bearer abc , x-tenant=acme")?;
        assert_eq!(metadata.len(), 2);
        assert_eq!(
            metadata.get("authorization").and_then(|v| v.to_str().ok()),
            Some("Bearer abc")
        );
        Ok(())
    }

    #[test]
    fn metadata_skips_pairs_without_value() -> Result<()> {
        assert!(otlp_metadata("")?.is_empty());
        assert_eq!(otlp_metadata("a=1,malformed,b=2")?.len(), 2);
        Ok(())
    }

    #[test]
    fn binary_metadata_must_be_base64() -> Result<()> {
        assert_eq!(otlp_metadata("trace-bin=YmluYXJ5")?.len(), 1);
        let err = otlp_metadata("trace-bin=not base64!!")
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(err.contains("not valid base64"));
        Ok(())
    }

    #[test]
    fn endpoints_default_to_https() {
        assert_eq!(with_scheme("http://localhost:4317"), "http://localhost:4317");
        assert_eq!(with_scheme("collector:4317/"), "https://collector:4317");
        assert_eq!(
            with_scheme("https://otel.example.com:4317/v1/traces"),
            "https://otel.example.com:4317/v1/traces"
        );
    }

    #[test]
    fn tls_only_for_https_endpoints() {
        assert_eq!(tls_host("https://otel.example.com:4317/x"), Some("otel.example.com"));
        assert_eq!(tls_host("http://localhost:4317"), None);
    }

    #[test]
    fn shutdown_without_provider_is_a_noop() {
        shutdown_tracer();
    }
}
