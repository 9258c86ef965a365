use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

struct ClientInstruments {
    peer_calls: Counter<u64>,
    peer_call_duration_seconds: Histogram<f64>,
    fanout_duration_seconds: Histogram<f64>,
}

fn instruments() -> &'static ClientInstruments {
    static INSTRUMENTS: OnceLock<ClientInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("patternserve.client");
        ClientInstruments {
            peer_calls: meter
                .u64_counter("patternserve.client.peer.calls")
                .with_description("Per-peer fan-out calls by method and outcome")
                .init(),
            peer_call_duration_seconds: meter
                .f64_histogram("patternserve.client.peer.duration")
                .with_description("Per-peer call latency")
                .with_unit("s")
                .init(),
            fanout_duration_seconds: meter
                .f64_histogram("patternserve.client.fanout.duration")
                .with_description("Latency of a whole broadcast, slowest peer included")
                .with_unit("s")
                .init(),
        }
    })
}

pub(super) fn record_peer_call(method: &'static str, outcome: &'static str, secs: f64) {
    let attrs = [
        KeyValue::new("rpc.method", method),
        KeyValue::new("outcome", outcome),
    ];
    let instruments = instruments();
    instruments.peer_calls.add(1, &attrs);
    instruments.peer_call_duration_seconds.record(secs, &attrs);
}

pub(super) fn record_fanout(method: &'static str, peers: usize, secs: f64) {
    instruments().fanout_duration_seconds.record(
        secs,
        &[
            KeyValue::new("rpc.method", method),
            KeyValue::new("peers", peers as i64),
        ],
    );
}
