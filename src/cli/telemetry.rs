//! Log output and the optional OTLP span exporter.
//!
//! Spans are exported over gRPC when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
//! `AUTHFLOW_LOG_FORMAT=json` switches the console output to one JSON object
//! per line.

use anyhow::{Context, Result, anyhow};
use base64::{Engine, engine::general_purpose};
use once_cell::sync::OnceCell;
use opentelemetry::propagation::TextMapCompositePropagator;
use opentelemetry::{KeyValue, global, trace::TracerProvider as _};
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
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt};
use ulid::Ulid;

const ENV_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
const ENV_HEADERS: &str = "OTEL_EXPORTER_OTLP_HEADERS";
const ENV_PROTOCOL: &str = "OTEL_EXPORTER_OTLP_PROTOCOL";
const ENV_INSTANCE_ID: &str = "OTEL_SERVICE_INSTANCE_ID";
const ENV_LOG_FORMAT: &str = "AUTHFLOW_LOG_FORMAT";
const EXPORT_TIMEOUT: Duration = Duration::from_secs(3);

static TRACER_PROVIDER: OnceCell<SdkTracerProvider> = OnceCell::new();

/// Exporter settings read from the standard `OTEL_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OtlpSettings {
    endpoint: String,
    headers: Vec<(String, String)>,
    instance_id: String,
}

impl OtlpSettings {
    fn from_env() -> Option<Self> {
        let endpoint = var(ENV_ENDPOINT).ok()?;
        if let Ok(protocol) = var(ENV_PROTOCOL)
            && protocol != "grpc"
        {
            debug!("{ENV_PROTOCOL}='{protocol}' ignored, spans are exported over gRPC");
        }
        Some(Self {
            endpoint: with_scheme(&endpoint),
            headers: var(ENV_HEADERS)
                .map(|raw| parse_header_pairs(&raw))
                .unwrap_or_default(),
            instance_id: var(ENV_INSTANCE_ID).unwrap_or_else(|_| Ulid::new().to_string()),
        })
    }

    /// Host to verify when the endpoint is `https`.
    fn tls_domain(&self) -> Option<&str> {
        self.endpoint
            .strip_prefix("https://")
            .and_then(|rest| rest.split('/').next())
            .and_then(|authority| authority.split(':').next())
            .filter(|host| !host.is_empty())
    }

    fn metadata(&self) -> Result<MetadataMap> {
        let mut metadata = MetadataMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let name = name.to_ascii_lowercase();
            if name.ends_with("-bin") {
                let bytes = general_purpose::STANDARD
                    .decode(value.as_bytes())
                    .map_err(|err| anyhow!("header {name}: value is not base64: {err}"))?;
                let key = MetadataKey::<Binary>::from_bytes(name.as_bytes())
                    .map_err(|err| anyhow!("header {name}: invalid binary key: {err}"))?;
                metadata.insert_bin(key, MetadataValue::from_bytes(&bytes));
            } else {
                let key = MetadataKey::<Ascii>::from_bytes(name.as_bytes())
                    .map_err(|err| anyhow!("header {name}: invalid key: {err}"))?;
                let value: MetadataValue<Ascii> = value
                    .parse()
                    .map_err(|err| anyhow!("header {name}: invalid value: {err}"))?;
                metadata.insert(key, value);
            }
        }
        Ok(metadata)
    }

    fn tracer(&self) -> Result<Tracer> {
        let mut builder = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(&self.endpoint)
            .with_compression(Compression::Gzip)
            .with_timeout(EXPORT_TIMEOUT);

        if let Some(domain) = self.tls_domain() {
            builder = builder.with_tls_config(
                ClientTlsConfig::new()
                    .domain_name(domain.to_string())
                    .with_native_roots(),
            );
        }
        if !self.headers.is_empty() {
            builder = builder.with_metadata(self.metadata()?);
        }

        let exporter = builder.build().context("Failed to build OTLP exporter")?;
        let provider = SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(
                Resource::builder_empty()
                    .with_attributes(vec![
                        KeyValue::new("service.name", env!("CARGO_PKG_NAME")),
                        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                        KeyValue::new("service.instance.id", self.instance_id.clone()),
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
}

/// `key=value` pairs separated by commas; pairs without `=` are skipped.
fn parse_header_pairs(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// gRPC endpoints without a scheme default to `https`.
fn with_scheme(endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("https://{}", endpoint.trim_end_matches('/'))
    }
}

fn json_output() -> bool {
    var(ENV_LOG_FORMAT).is_ok_and(|format| format.eq_ignore_ascii_case("json"))
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns an error if the exporter cannot be built or a subscriber is
/// already installed.
pub fn init(verbosity_level: Option<Level>) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity_level.unwrap_or(Level::ERROR).into())
        .from_env_lossy()
        .add_directive("hyper=error".parse()?)
        .add_directive("tokio=error".parse()?)
        .add_directive("sqlx=warn".parse()?)
        .add_directive("opentelemetry_sdk=warn".parse()?);

    let console = if json_output() {
        fmt::layer().json().with_target(false).boxed()
    } else {
        fmt::layer()
            .with_file(false)
            .with_line_number(false)
            .with_target(false)
            .pretty()
            .boxed()
    };

    let otel = match OtlpSettings::from_env() {
        Some(settings) => Some(tracing_opentelemetry::layer().with_tracer(settings.tracer()?)),
        None => None,
    };

    let subscriber = Registry::default().with(console).with(otel).with(filter);
    tracing::subscriber::set_global_default(subscriber)?;

    Ok(())
}

/// Flush and stop the exporter, if one was started.
pub fn shutdown_tracer() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        debug!("shutting down tracer provider");
        if let Err(err) = provider.shutdown() {
            debug!("tracer provider shutdown failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(endpoint: &str, headers: &str) -> OtlpSettings {
        OtlpSettings {
            endpoint: with_scheme(endpoint),
            headers: parse_header_pairs(headers),
            instance_id: "test".to_string(),
        }
    }

    #[test]
    fn header_pairs() {
        assert!(parse_header_pairs("").is_empty());
        assert_eq!(
            parse_header_pairs("a = 1, broken ,b=x=y"),
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "x=y".to_string())
            ]
        );
    }

    #[test]
    fn endpoint_scheme() {
        assert_eq!(with_scheme("http://localhost:4317"), "http://localhost:4317");
        assert_eq!(with_scheme("collector:4317/"), "https://collector:4317");
        assert_eq!(
            settings("collector.example.com:4317", "").tls_domain(),
            Some("collector.example.com")
        );
        assert_eq!(settings("http://localhost:4317", "").tls_domain(), None);
    }

    #[test]
    fn metadata_from_headers() -> Result<()> {
        let metadata = settings(
            "localhost:4317",
            "Authorization=Bearer t,trace-bin=YmluYXJ5IGRhdGE=",
        )
        .metadata()?;
        assert_eq!(metadata.len(), 2);
        assert!(metadata.get("authorization").is_some());

        let invalid = settings("localhost:4317", "trace-bin=not base64!!").metadata();
        assert!(invalid.is_err());
        Ok(())
    }

    #[test]
    fn settings_follow_env() {
        temp_env::with_vars(
            [
                (ENV_ENDPOINT, Some("otel:4317")),
                (ENV_HEADERS, Some("x-team=auth")),
                (ENV_INSTANCE_ID, Some("node-1")),
            ],
            || {
                let settings = OtlpSettings::from_env();
                assert_eq!(
                    settings,
                    Some(OtlpSettings {
                        endpoint: "https://otel:4317".to_string(),
                        headers: vec![("x-team".to_string(), "auth".to_string())],
                        instance_id: "node-1".to_string(),
                    })
                );
            },
        );
        temp_env::with_var_unset(ENV_ENDPOINT, || {
            assert!(OtlpSettings::from_env().is_none());
        });
    }

    #[test]
    fn log_format() {
        temp_env::with_var(ENV_LOG_FORMAT, Some("JSON"), || assert!(json_output()));
        temp_env::with_var_unset(ENV_LOG_FORMAT, || assert!(!json_output()));
    }

    #[test]
    fn shutdown_without_provider() {
        shutdown_tracer();
    }
}
