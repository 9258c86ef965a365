//! Storage-tier telemetry instruments and recording helpers.

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

struct StoreInstruments {
    lookups: Counter<u64>,
    backfills: Counter<u64>,
    evictions: Counter<u64>,
    fetch_duration_seconds: Histogram<f64>,
}

fn instruments() -> &'static StoreInstruments {
    static INSTRUMENTS: OnceLock<StoreInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("patternserve.store");
        StoreInstruments {
            lookups: meter
                .u64_counter("patternserve.store.lookups")
                .with_description("Artifact lookups by kind, serving tier and outcome")
                .init(),
            backfills: meter
                .u64_counter("patternserve.store.backfills")
                .with_description("Disk backfills after a cloud hit by outcome")
                .init(),
            evictions: meter
                .u64_counter("patternserve.store.memory.evictions")
                .with_description("Memory tier evictions by artifact kind")
                .init(),
            fetch_duration_seconds: meter
                .f64_histogram("patternserve.store.fetch.duration")
                .with_description("Time to read and decode an artifact from a persistent tier")
                .with_unit("s")
                .init(),
        }
    })
}

pub fn record_lookup(kind: &'static str, tier: &'static str, outcome: &'static str) {
    instruments().lookups.add(
        1,
        &[
            KeyValue::new("kind", kind),
            KeyValue::new("tier", tier),
            KeyValue::new("outcome", outcome),
        ],
    );
}

pub fn record_backfill(kind: &'static str, outcome: &'static str) {
    instruments().backfills.add(
        1,
        &[KeyValue::new("kind", kind), KeyValue::new("outcome", outcome)],
    );
}

pub fn record_eviction(kind: &'static str) {
    instruments()
        .evictions
        .add(1, &[KeyValue::new("kind", kind)]);
}

pub fn record_fetch(kind: &'static str, tier: &'static str, duration_seconds: f64) {
    instruments().fetch_duration_seconds.record(
        duration_seconds,
        &[KeyValue::new("kind", kind), KeyValue::new("tier", tier)],
    );
}
