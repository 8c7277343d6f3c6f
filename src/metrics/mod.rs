use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
    sdk::metrics::{Aggregation, Instrument, MeterProvider, Stream},
};
use prometheus::default_registry;

use crate::errors::SlotLogError;

/// Initialize the global registry for Prometheus metrics,
/// and create a global MeterProvider.
///
/// Instruments created before this is called record into a no-op
/// provider.
pub fn initialize_metrics() -> Result<(), SlotLogError> {
    // Initialize the global default registry for prometheus metrics
    // as internally it's a lazy static.
    let registry = default_registry();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .with_namespace("ledgerlog")
        .build()
        .map_err(|err| SlotLogError::Config(err.to_string()))?;

    // Create a global MeterProvider
    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_view(
            opentelemetry_sdk::metrics::new_view(
                Instrument::new().name("*duration*"), // Must match histogram name
                Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
                    boundaries: vec![
                        0.0, 0.0005, 0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0,
                        2.5, 5.0, 7.5, 10.0,
                    ],
                    record_min_max: true,
                }),
            )
            .map_err(|err| SlotLogError::Config(err.to_string()))?,
        )
        .build();
    global::set_meter_provider(provider);
    Ok(())
}

/// Instruments shared by every slot of a log backend. Label each
/// measurement with [`crate::recovery::model::SlotKey`]'s labels.
pub(crate) struct LogMetrics {
    pub(crate) appends: Counter<u64>,
    pub(crate) append_errors: Counter<u64>,
    pub(crate) playback_entries: Counter<u64>,
    pub(crate) playback_duplicates: Counter<u64>,
    pub(crate) compactions: Counter<u64>,
    pub(crate) publish_wait_duration: Histogram<f64>,
    pub(crate) playback_duration: Histogram<f64>,
}

impl LogMetrics {
    pub(crate) fn new() -> Self {
        let meter = global::meter("ledgerlog");
        Self {
            appends: meter
                .u64_counter("ledger_appends_total")
                .with_description("number of entries durably appended")
                .init(),
            append_errors: meter
                .u64_counter("ledger_append_errors_total")
                .with_description("number of appends the ledger store failed")
                .init(),
            playback_entries: meter
                .u64_counter("playback_entries_total")
                .with_description("number of entries read during playback")
                .init(),
            playback_duplicates: meter
                .u64_counter("playback_duplicates_total")
                .with_description("number of entries skipped as duplicates during playback")
                .init(),
            compactions: meter
                .u64_counter("compactions_total")
                .with_description("number of compaction swaps by `outcome`")
                .init(),
            publish_wait_duration: meter
                .f64_histogram("publish_wait_duration_seconds")
                .with_description("time waiting for a ledger id to be published in seconds")
                .init(),
            playback_duration: meter
                .f64_histogram("playback_duration_seconds")
                .with_description("`playback_log_entries` duration in seconds")
                .init(),
        }
    }
}
