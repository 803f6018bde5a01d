//! Analytics sink for payment lifecycle events.

use serde_json::Value;
use tracing::info;

/// Collaborator interface: named events with a property map.
pub trait AnalyticsSink: Send + Sync {
    fn log(&self, event: &str, properties: Value);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl AnalyticsSink for NoopSink {
    fn log(&self, _event: &str, _properties: Value) {}
}

/// Emits analytics events onto the structured log stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl AnalyticsSink for LogSink {
    fn log(&self, event: &str, properties: Value) {
        info!(target: "nwcd::analytics", event, %properties, "analytics event");
    }
}
