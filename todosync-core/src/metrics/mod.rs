//! Metrics for the sync engine
//!
//! Recorded through the `metrics` facade; the host application installs
//! whichever recorder/exporter it wants.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Instant;

pub const MESSAGES_SENT: &str = "sync.messages.sent";
pub const MESSAGES_RECEIVED: &str = "sync.messages.received";
pub const MESSAGES_DROPPED: &str = "sync.messages.dropped";
pub const UPDATES_BUFFERED: &str = "sync.updates.buffered";
pub const UPDATES_APPLIED: &str = "sync.updates.applied";
pub const UPDATES_REBUFFERED: &str = "sync.updates.rebuffered";
pub const UPDATES_EXPIRED: &str = "sync.updates.expired";
pub const LOCAL_CHANGE_DURATION: &str = "sync.local_change.duration_ms";
pub const REMOTE_CHANGE_DURATION: &str = "sync.remote_change.duration_ms";

/// Initialize metrics with descriptions
pub fn init_metrics() {
    describe_counter!(MESSAGES_SENT, "Envelopes handed to the transport");
    describe_counter!(MESSAGES_RECEIVED, "Envelopes delivered by the transport");
    describe_counter!(MESSAGES_DROPPED, "Inbound messages rejected or discarded");
    describe_counter!(UPDATES_BUFFERED, "Updates pushed to a pending buffer");
    describe_counter!(UPDATES_APPLIED, "Buffered updates replayed into a document");
    describe_counter!(UPDATES_REBUFFERED, "Buffered updates put back for a later drain");
    describe_counter!(UPDATES_EXPIRED, "Buffered updates discarded after waiting too long");
    describe_histogram!(LOCAL_CHANGE_DURATION, "Local edit duration in milliseconds");
    describe_histogram!(REMOTE_CHANGE_DURATION, "Remote merge/apply duration in milliseconds");
}

/// Record a counter metric
pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

/// Timer for measuring operation duration
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self { name, start: Instant::now() }
    }

    /// Stop the timer and record the elapsed milliseconds
    pub fn stop(self) {
        let elapsed = self.start.elapsed();
        histogram!(self.name).record(elapsed.as_secs_f64() * 1000.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        init_metrics();
        record_counter(MESSAGES_SENT, 1);
        Timer::new(LOCAL_CHANGE_DURATION).stop();
    }
}
