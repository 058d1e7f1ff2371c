//! OpenTelemetry instruments for the metadata client.

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

struct MetaInstruments {
    snapshot_fetches: Counter<u64>,
    snapshot_fetch_duration_seconds: Histogram<f64>,
    snapshot_installs: Counter<u64>,
    snapshot_stale: Counter<u64>,
    command_submissions: Counter<u64>,
    command_failures: Counter<u64>,
}

fn instruments() -> &'static MetaInstruments {
    static INSTRUMENTS: OnceLock<MetaInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("metasync.meta");
        MetaInstruments {
            snapshot_fetches: meter
                .u64_counter("metasync.meta.snapshot.fetch.count")
                .with_description("Snapshot fetch attempts by outcome")
                .init(),
            snapshot_fetch_duration_seconds: meter
                .f64_histogram("metasync.meta.snapshot.fetch.duration")
                .with_description("Snapshot fetch duration including long-poll wait")
                .with_unit("s")
                .init(),
            snapshot_installs: meter
                .u64_counter("metasync.meta.snapshot.install.count")
                .with_description("Snapshots installed into the local cache")
                .init(),
            snapshot_stale: meter
                .u64_counter("metasync.meta.snapshot.stale.count")
                .with_description("Fetched snapshots discarded because their index did not advance")
                .init(),
            command_submissions: meter
                .u64_counter("metasync.meta.command.submit.count")
                .with_description("Command submissions by command kind")
                .init(),
            command_failures: meter
                .u64_counter("metasync.meta.command.submit.errors")
                .with_description("Command submissions that failed on every server")
                .init(),
        }
    })
}

pub(crate) fn record_fetch(server: &str, ok: bool, duration_seconds: f64) {
    let attrs = [
        KeyValue::new("server.address", server.to_string()),
        KeyValue::new("outcome", if ok { "success" } else { "error" }),
    ];
    let instruments = instruments();
    instruments.snapshot_fetches.add(1, &attrs);
    instruments
        .snapshot_fetch_duration_seconds
        .record(duration_seconds, &attrs);
}

pub(crate) fn record_install(installed: bool) {
    let instruments = instruments();
    if installed {
        instruments.snapshot_installs.add(1, &[]);
    } else {
        instruments.snapshot_stale.add(1, &[]);
    }
}

pub(crate) fn record_submit(kind: &'static str, ok: bool) {
    let attrs = [KeyValue::new("command", kind)];
    let instruments = instruments();
    instruments.command_submissions.add(1, &attrs);
    if !ok {
        instruments.command_failures.add(1, &attrs);
    }
}
