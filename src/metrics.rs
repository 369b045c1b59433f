use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use std::sync::LazyLock;

pub static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::default);

/// Protocol counters. The registry is kept alive so an exporter can be
/// attached by the embedding application.
#[derive(Debug, Clone)]
pub struct Metrics {
    _registry: Registry,

    /// Outbound requests, labelled by how they resolved.
    pub message_requests_outgoing: IntCounterVec,
    /// Inbound requests handled.
    pub message_requests_incoming: IntCounter,
    /// Messages that did not match any awaited request.
    pub unsolicited_messages: IntCounter,
    /// Local record updates driven by the address vote majority.
    pub enr_auto_update: IntCounter,
}

impl Metrics {
    pub fn record_request_sent(&self) {
        self.message_requests_outgoing
            .with_label_values(&["sent"])
            .inc();
    }

    pub fn record_request_resolved(&self, response: &str) {
        self.message_requests_outgoing
            .with_label_values(&[response])
            .inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        let registry = Registry::new();

        let message_requests_outgoing = IntCounterVec::new(
            Opts::new(
                "discovery_message_requests_outgoing",
                "Number of outgoing discovery requests, by response state",
            ),
            &["response"],
        )
        .expect("Failed to create message_requests_outgoing counter");

        let message_requests_incoming = IntCounter::new(
            "discovery_message_requests_incoming",
            "Number of incoming discovery requests handled",
        )
        .expect("Failed to create message_requests_incoming counter");

        let unsolicited_messages = IntCounter::new(
            "discovery_unsolicited_messages",
            "Number of messages dropped because no matching request was in flight",
        )
        .expect("Failed to create unsolicited_messages counter");

        let enr_auto_update = IntCounter::new(
            "discovery_enr_auto_update",
            "Number of local record updates driven by the external address vote",
        )
        .expect("Failed to create enr_auto_update counter");

        registry
            .register(Box::new(message_requests_outgoing.clone()))
            .expect("Failed to register message_requests_outgoing counter");
        registry
            .register(Box::new(message_requests_incoming.clone()))
            .expect("Failed to register message_requests_incoming counter");
        registry
            .register(Box::new(unsolicited_messages.clone()))
            .expect("Failed to register unsolicited_messages counter");
        registry
            .register(Box::new(enr_auto_update.clone()))
            .expect("Failed to register enr_auto_update counter");

        Metrics {
            _registry: registry,
            message_requests_outgoing,
            message_requests_incoming,
            unsolicited_messages,
            enr_auto_update,
        }
    }
}
