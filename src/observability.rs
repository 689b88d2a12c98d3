//! Tracing event names and field formatting helpers.
//!
//! Library code emits events/spans and does not initialize a global
//! subscriber; binaries and tests own one-time `tracing_subscriber` setup.

pub(crate) mod events {
    pub const POOL_CONNECTION_OPENED: &str = "pool_connection_opened";
    pub const POOL_CONNECTION_REUSED: &str = "pool_connection_reused";
    pub const POOL_CONNECTION_RELEASED: &str = "pool_connection_released";
    pub const POOL_OPEN_CANCELED: &str = "pool_open_canceled";

    pub const LISTENER_STARTED: &str = "listener_started";
    pub const LISTENER_STOPPED: &str = "listener_stopped";
    pub const LISTENER_UNHANDLED_LABEL: &str = "listener_unhandled_label";
    pub const LISTENER_VALIDATION_REJECTED: &str = "listener_validation_rejected";
    pub const LISTENER_CONSUMER_FAILED: &str = "listener_consumer_failed";
    pub const LISTENER_ACK_FAILED: &str = "listener_ack_failed";

    pub const RECEIVER_LISTENER_BUILT: &str = "receiver_listener_built";
    pub const RECEIVER_LISTENER_DEDUPED: &str = "receiver_listener_deduped";
    pub const RECEIVER_REENLISTED: &str = "receiver_reenlisted";
    pub const RECEIVER_STOP_FAILURE: &str = "receiver_stop_failure";

    pub const ENDPOINT_MATERIALIZED: &str = "endpoint_materialized";

    pub const BUS_STARTED: &str = "bus_started";
    pub const BUS_STOPPED: &str = "bus_stopped";
}

pub(crate) mod fields {
    /// Formats a listener identity as `url -> queue`.
    pub fn format_listener_key(broker_url: &str, queue: &str) -> String {
        format!("{broker_url} -> {queue}")
    }
}
