//! Internal code for tracing/logging.
//!
//! This module is used to configure both tracing and logging.
//! Logging to stdout is always enabled, at least at the "ERROR" level.
//! Tracing can be configured by the user, by default it is disabled.
//!
//! Each tracing backend has to implement the `TracerBuilder` trait,
//! which builds the [`Tracer`] the OpenTelemetry layer exports to.
use opentelemetry::sdk::trace::Tracer;
use tokio::runtime::EnterGuard;
use tracing::{level_filters::LevelFilter, Subscriber};
use tracing_subscriber::{filter::Targets, layer::SubscriberExt, EnvFilter, Layer, Registry};

use crate::errors::SlotLogError;

pub(crate) mod otlp_tracing;

pub use otlp_tracing::OtlpTracingConfig;

/// Env var which, when set, replaces the log level with an
/// [`EnvFilter`] directive like `ledgerlog=debug`.
pub const LOG_ENV_VAR: &str = "LEDGERLOG_LOG";

/// Trait that all the tracing config should implement.
/// This function should just return the proper `Tracer` for the backend.
trait TracerBuilder {
    fn build(&self) -> Result<Tracer, SlotLogError>;
}

/// Utility class used to handle tracing.
///
/// It keeps a tokio runtime that is alive as long as the struct itself,
/// which the batch span exporter runs on.
pub struct LedgerlogTracer {
    rt: tokio::runtime::Runtime,
}

fn get_log_level(level: Option<&str>) -> Result<LevelFilter, SlotLogError> {
    if let Some(level) = level {
        match level.to_lowercase().as_str() {
            "trace" => Ok(LevelFilter::TRACE),
            "debug" => Ok(LevelFilter::DEBUG),
            "info" => Ok(LevelFilter::INFO),
            "warn" => Ok(LevelFilter::WARN),
            "error" => Ok(LevelFilter::ERROR),
            level => Err(SlotLogError::Config(format!("Wrong log level: {level}"))),
        }
    } else {
        Ok(LevelFilter::ERROR)
    }
}

impl LedgerlogTracer {
    pub fn new() -> Result<Self, SlotLogError> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|err| SlotLogError::Config(format!("unable to start tracing runtime: {err}")))?;
        Ok(Self { rt })
    }

    /// Call this with an optional [`OtlpTracingConfig`] to configure
    /// tracing. Returns a guard that you have to keep in scope for the
    /// whole execution of the code you want to trace.
    pub fn setup(
        &self,
        conf: Option<OtlpTracingConfig>,
        log_level: Option<&str>,
    ) -> Result<EnterGuard<'_>, SlotLogError> {
        let guard = self.rt.enter();

        let log_level = get_log_level(log_level)?;

        // Prepare the log layer
        let logs = tracing_subscriber::fmt::Layer::default()
            .compact()
            // Show source file
            .with_file(true)
            // Display source code line numbers
            .with_line_number(true)
            // Display the thread ID an event was recorded on
            .with_thread_ids(true);
        let logs = match std::env::var(LOG_ENV_VAR) {
            Ok(directives) => logs.with_filter(EnvFilter::new(directives)).boxed(),
            Err(_) => logs
                .with_filter(Targets::new().with_target("ledgerlog", log_level))
                .boxed(),
        };

        // If the conf was not none, setup the global subscriber with both log and
        // telemetry layer, otherwise just setup logging.
        if let Some(conf) = conf {
            // The batch exporter spawns onto the runtime entered above.
            let tracer = conf.build()?;
            let telemetry = tracing_opentelemetry::layer()
                .with_tracer(tracer)
                // Send all traces from ledgerlog
                .with_filter(Targets::new().with_target("ledgerlog", LevelFilter::TRACE));
            set_global_subscriber(Registry::default().with(logs).with(telemetry));
        } else {
            set_global_subscriber(Registry::default().with(logs));
        };
        Ok(guard)
    }
}

// Utility function used to try to set a global default subscriber,
// logging the error without panicking if it was already set
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    // This can fail if tracing was already initialized, which happens
    // when more than one log backend is set up in the same process.
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}

#[test]
fn log_level_parsing() {
    assert_eq!(get_log_level(None).unwrap(), LevelFilter::ERROR);
    assert_eq!(get_log_level(Some("DEBUG")).unwrap(), LevelFilter::DEBUG);
    assert!(get_log_level(Some("loud")).is_err());
}
