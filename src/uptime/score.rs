use crate::telemetry::NodeSample;
use chrono::{DateTime, Utc};

/// Uptime percentage in `[0, 100]` for a snapshot, given the runtime the
/// engine accumulated and the highest network height seen before
/// `window_end`.
///
/// The score is the smaller of how far the node kept up with the chain and
/// how much of the window it was running. Nodes that never reported a start
/// time are scored on sync progress alone.
pub fn uptime_score(
    sample: &NodeSample,
    runtime_seconds: u64,
    network_height: u64,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> f32 {
    let sync = sync_ratio(sample.synced_units(), network_height);
    let Some(start_time) = sample.known_start_time() else {
        return as_percent(sync);
    };

    let effective_start = start_time.min(window_start);
    let time = time_ratio(runtime_seconds, effective_start, window_end);
    if sync < time {
        as_percent(sync)
    } else {
        as_percent(time)
    }
}

fn sync_ratio(synced_units: u64, network_height: u64) -> f64 {
    if network_height == 0 {
        return 0.0;
    }
    synced_units as f64 / network_height as f64
}

/// Both ends are truncated to whole seconds, like the runtime itself.
fn time_ratio(runtime_seconds: u64, start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let span = end.timestamp() - start.timestamp();
    if span <= 0 {
        return 0.0;
    }
    runtime_seconds as f64 / span as f64
}

fn as_percent(ratio: f64) -> f32 {
    (ratio * 100.0).clamp(0.0, 100.0) as f32
}
