//! Metric names and registration.

/// Events received from the message bus.
pub const METRIC_EVENTS_RECEIVED: &str = "distro_events_received_total";
/// Payloads successfully handed to an export destination.
pub const METRIC_EVENTS_SENT: &str = "distro_events_sent_total";
/// Payloads an export destination failed to accept.
pub const METRIC_SEND_FAILURES: &str = "distro_send_failures_total";
/// Messages dropped because a registration's data queue was full.
pub const METRIC_EVENTS_DROPPED: &str = "distro_events_dropped_total";
/// The number of live registration actors.
pub const METRIC_REGISTRATIONS_ACTIVE: &str = "distro_registrations_active";

/// Register all metrics of this service with the installed recorder.
pub fn register_metrics() {
    metrics::register_counter!(METRIC_EVENTS_RECEIVED, metrics::Unit::Count, "messages received from the message bus");
    metrics::register_counter!(METRIC_EVENTS_SENT, metrics::Unit::Count, "payloads delivered to export destinations");
    metrics::register_counter!(METRIC_SEND_FAILURES, metrics::Unit::Count, "payloads which export destinations failed to accept");
    metrics::register_counter!(METRIC_EVENTS_DROPPED, metrics::Unit::Count, "messages dropped due to full registration queues");
    metrics::register_gauge!(METRIC_REGISTRATIONS_ACTIVE, metrics::Unit::Count, "number of live registration actors");
}
