use opentelemetry::runtime::Tokio;
use opentelemetry::sdk::trace::config;
use opentelemetry::sdk::trace::Sampler;
use opentelemetry::sdk::trace::Tracer;
use opentelemetry::sdk::Resource;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::SlotLogError;

use super::TracerBuilder;

/// Send traces to the opentelemetry collector:
/// https://opentelemetry.io/docs/collector/
///
/// Only supports GRPC protocol, so make sure to enable
/// it on your OTEL configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtlpTracingConfig {
    /// Service name, identifies this process.
    pub service_name: String,
    /// Optional collector's URL, defaults to `grpc:://127.0.0.1:4317`
    #[serde(default)]
    pub url: Option<String>,
    /// Sampling ratio:
    ///   samplig_ratio >= 1 - all traces are sampled
    ///   samplig_ratio <= 0 - most traces are not sampled
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl OtlpTracingConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            url: None,
            sampling_ratio: default_sampling_ratio(),
        }
    }
}

impl TracerBuilder for OtlpTracingConfig {
    fn build(&self) -> Result<Tracer, SlotLogError> {
        // Instantiate the builder
        let mut exporter = opentelemetry_otlp::new_exporter().tonic();

        // Change the url if required
        if let Some(endpoint) = self.url.as_ref() {
            exporter = exporter.with_endpoint(endpoint);
        }

        // Create the tracer
        opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(
                config()
                    .with_sampler(Sampler::TraceIdRatioBased(self.sampling_ratio))
                    .with_resource(Resource::new(vec![KeyValue::new(
                        "service.name",
                        self.service_name.clone(),
                    )])),
            )
            .install_batch(Tokio)
            .map_err(|err| SlotLogError::Config(format!("error installing tracer: {err}")))
    }
}

#[test]
fn config_defaults() {
    let found: OtlpTracingConfig = serde_json::from_str(r#"{"service_name": "slots"}"#).unwrap();
    assert_eq!(found, OtlpTracingConfig::new("slots"));
}
