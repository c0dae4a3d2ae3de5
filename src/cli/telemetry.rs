//! Log output and, when an OTLP endpoint is configured, span export over gRPC.

use anyhow::{anyhow, Context, Result};
use once_cell::sync::OnceCell;
use opentelemetry::{global, trace::TracerProvider as _, KeyValue};
use opentelemetry_otlp::{WithExportConfig, WithTonicConfig};
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    runtime,
    trace::{Tracer, TracerProvider},
    Resource,
};
use std::{env::var, time::Duration};
use tonic::{
    metadata::{MetadataKey, MetadataMap},
    transport::ClientTlsConfig,
};
use tracing::{debug, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};
use ulid::Ulid;

const ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
const HEADERS_ENV: &str = "OTEL_EXPORTER_OTLP_HEADERS";

static TRACER_PROVIDER: OnceCell<TracerProvider> = OnceCell::new();

#[derive(Debug)]
struct ExporterSettings {
    endpoint: String,
    metadata: MetadataMap,
}

impl ExporterSettings {
    /// `None` unless the endpoint variable is set.
    fn from_env() -> Result<Option<Self>> {
        let Ok(endpoint) = var(ENDPOINT_ENV) else {
            return Ok(None);
        };
        let endpoint = if endpoint.contains("://") {
            endpoint
        } else {
            format!("https://{}", endpoint.trim_end_matches('/'))
        };
        let metadata = match var(HEADERS_ENV) {
            Ok(headers) => {
                parse_metadata(&headers).with_context(|| format!("Invalid {HEADERS_ENV}"))?
            }
            Err(_) => MetadataMap::new(),
        };
        Ok(Some(Self { endpoint, metadata }))
    }
}

/// `key=value` pairs separated by commas, e.g. an API key for a hosted collector.
fn parse_metadata(headers: &str) -> Result<MetadataMap> {
    let mut metadata = MetadataMap::new();
    for pair in headers.split(',').filter(|pair| !pair.trim().is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("expected key=value, got {pair:?}"))?;
        let key = MetadataKey::from_bytes(key.trim().to_ascii_lowercase().as_bytes())
            .map_err(|e| anyhow!("invalid header name {key:?}: {e}"))?;
        let value = value
            .trim()
            .parse()
            .map_err(|e| anyhow!("invalid value for header {}: {e}", key.as_str()))?;
        metadata.insert(key, value);
    }
    Ok(metadata)
}

fn init_tracer(settings: ExporterSettings) -> Result<Tracer> {
    let mut builder = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&settings.endpoint)
        .with_timeout(Duration::from_secs(3))
        .with_metadata(settings.metadata);
    if settings.endpoint.starts_with("https://") {
        builder = builder.with_tls_config(ClientTlsConfig::new().with_native_roots());
    }
    let exporter = builder.build()?;

    let instance_id = var("OTEL_SERVICE_INSTANCE_ID").unwrap_or_else(|_| Ulid::new().to_string());
    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(Resource::new(vec![
            KeyValue::new("service.name", env!("CARGO_PKG_NAME")),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            KeyValue::new("service.instance.id", instance_id),
        ]))
        .build();

    let _ = TRACER_PROVIDER.set(provider.clone());
    global::set_tracer_provider(provider.clone());
    global::set_text_map_propagator(TraceContextPropagator::new());

    Ok(provider.tracer(env!("CARGO_PKG_NAME")))
}

/// Install the global subscriber. Spans are exported only when
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
///
/// # Errors
///
/// Returns an error if the exporter settings are invalid or a subscriber is already set.
pub fn init(verbosity_level: Option<Level>) -> Result<()> {
    let fmt_layer = fmt::layer()
        .with_file(false)
        .with_line_number(false)
        .with_target(false)
        .pretty();

    let filter = EnvFilter::builder()
        .with_default_directive(verbosity_level.unwrap_or(Level::ERROR).into())
        .from_env_lossy()
        .add_directive("hyper=error".parse()?)
        .add_directive("sqlx=warn".parse()?)
        .add_directive("opentelemetry_sdk=warn".parse()?);

    let subscriber = Registry::default().with(fmt_layer).with(filter);
    match ExporterSettings::from_env()? {
        Some(settings) => {
            let otel_layer = tracing_opentelemetry::layer().with_tracer(init_tracer(settings)?);
            tracing::subscriber::set_global_default(subscriber.with(otel_layer))?;
        }
        None => tracing::subscriber::set_global_default(subscriber)?,
    }
    Ok(())
}

/// Flush pending spans. Does nothing when export was never enabled.
pub fn shutdown_tracer() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        debug!("shutting down tracer provider");
        let _ = provider.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_endpoint_disables_export() -> Result<()> {
        temp_env::with_vars(
            [(ENDPOINT_ENV, None::<&str>), (HEADERS_ENV, Some("x-api-key=abc"))],
            || {
                assert!(ExporterSettings::from_env()?.is_none());
                Ok(())
            },
        )
    }

    #[test]
    fn endpoint_without_scheme_uses_tls() -> Result<()> {
        temp_env::with_vars(
            [
                (ENDPOINT_ENV, Some("collector.example.com:4317/")),
                (HEADERS_ENV, None),
            ],
            || {
                let settings = ExporterSettings::from_env()?.ok_or_else(|| anyhow!("disabled"))?;
                assert_eq!(settings.endpoint, "https://collector.example.com:4317");
                assert!(settings.metadata.is_empty());
                Ok(())
            },
        )
    }

    #[test]
    fn headers_become_metadata() -> Result<()> {
        let metadata = parse_metadata(" X-Api-Key = abc ,tenant=keyward,")?;
        assert_eq!(metadata.len(), 2);
        assert_eq!(
            metadata.get("x-api-key").and_then(|v| v.to_str().ok()),
            Some("abc")
        );
        assert!(parse_metadata("").is_ok_and(|m| m.is_empty()));
        Ok(())
    }

    #[test]
    fn malformed_headers_are_rejected() {
        assert!(parse_metadata("x-api-key").is_err());
        assert!(parse_metadata("bad key=1").is_err());
        temp_env::with_vars(
            [
                (ENDPOINT_ENV, Some("http://localhost:4317")),
                (HEADERS_ENV, Some("novalue")),
            ],
            || {
                let err = ExporterSettings::from_env().err().map(|e| e.to_string());
                assert_eq!(err.as_deref(), Some("Invalid OTEL_EXPORTER_OTLP_HEADERS"));
            },
        );
    }

    #[test]
    fn shutdown_without_provider() {
        shutdown_tracer();
    }
}
