// ABOUTME: Metrics recording helpers for the coordination core.
// ABOUTME: Thin wrappers over the metrics crate so call sites stay one-liners.

/// Record an admitted run.
pub fn record_run_started() {
    metrics::counter!("turngate_runs_started_total").increment(1);
}

/// Record a run reaching a terminal status.
pub fn record_run_finished(status: &str) {
    metrics::counter!("turngate_runs_finished_total", "status" => status.to_string()).increment(1);
}

/// Record a send rejected before admission (policy deny, queue full, validation).
pub fn record_send_rejected(reason: &'static str) {
    metrics::counter!("turngate_sends_rejected_total", "reason" => reason).increment(1);
}

/// Record one event published on the bus.
pub fn record_event_published() {
    metrics::counter!("turngate_events_published_total").increment(1);
}

/// Record one frame delivered to a connection.
pub fn record_frame_delivered(kind: &'static str) {
    metrics::counter!("turngate_frames_delivered_total", "kind" => kind).increment(1);
}

/// Record turn wall-clock duration in seconds.
pub fn record_turn_duration(seconds: f64) {
    metrics::histogram!("turngate_turn_duration_seconds").record(seconds);
}
