//! Broker-facing interfaces consumed by the core.
//!
//! The wire-level protocol implementation lives behind these traits. The core
//! only assumes an AMQP-class contract: connections keyed by URL, channels
//! with prefetch control, queue subscriptions delivering tagged messages, and
//! explicit ack/nack.

use crate::errors::TransportError;
use crate::label::MessageLabel;
use crate::message::Delivery;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Broker-side flow control for one consuming channel.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Qos {
    /// Maximum unacknowledged messages in flight.
    pub prefetch_count: u16,
    /// Maximum unacknowledged payload bytes in flight, `0` for unlimited.
    pub prefetch_size: u32,
}

/// The concrete subscription produced by binding a queue for an endpoint.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubscriptionEndpoint {
    /// Address of the queue the listener consumes from.
    pub queue: String,
}

/// Topology and limit options handed to the transport when binding a subscription.
///
/// Declaration of exchanges, queues, and dead-letter wiring happens behind the
/// [`ChannelHandle::bind_subscription`] seam; these options parameterize it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubscriptionOptions {
    /// Labels routed into the subscription queue.
    pub labels: Vec<MessageLabel>,
    /// Maximum number of messages the queue may hold.
    pub queue_limit: Option<u32>,
    /// Maximum number of payload bytes the queue may hold.
    pub queue_max_length_bytes: Option<u64>,
    /// Time-to-live applied to the endpoint fault queue.
    pub fault_queue_ttl: Option<Duration>,
    /// Length limit applied to the endpoint fault queue.
    pub fault_queue_limit: Option<u32>,
}

/// One consuming channel on a broker connection.
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    /// Applies prefetch flow control to the channel.
    async fn apply_qos(&self, qos: Qos) -> Result<(), TransportError>;

    /// Declares the subscription topology for `endpoint_name` and returns the
    /// queue the listener should consume from.
    async fn bind_subscription(
        &self,
        endpoint_name: &str,
        options: &SubscriptionOptions,
    ) -> Result<SubscriptionEndpoint, TransportError>;

    /// Starts consuming from `queue`. The stream ends when consumption is
    /// canceled or when the channel dies.
    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, TransportError>;

    /// Acknowledges one delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    /// Negatively acknowledges one delivery, optionally requeueing it.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    /// Cancels the active consumer; ends the delivery stream.
    async fn cancel_consume(&self) -> Result<(), TransportError>;
}

/// One open connection against a broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Stable identity of this connection.
    fn id(&self) -> Uuid;

    /// URL the connection was opened against.
    fn url(&self) -> &str;

    /// Token canceled when the connection is being torn down.
    fn cancellation(&self) -> CancellationToken;

    /// Opens a consuming channel.
    async fn open_channel(&self) -> Result<Arc<dyn ChannelHandle>, TransportError>;

    /// Closes the connection.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Opens broker connections for the pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Opens a connection against `url`.
    async fn open(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, TransportError>;
}
