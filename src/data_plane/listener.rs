//! Consuming listener for one `(broker URL, queue)` pair.

use crate::data_plane::connection_pool::Connection;
use crate::errors::BusError;
use crate::label::MessageLabel;
use crate::message::Delivery;
use crate::observability::{events, fields};
use crate::routing::consumer::{FailedDeliveryStrategy, MessageConsumer, PayloadValidator};
use crate::runtime::dispatch::DispatchPool;
use crate::transport::{ChannelHandle, Qos, SubscriptionEndpoint};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const COMPONENT: &str = "listener";
const STOP_DRAIN_DEADLINE: Duration = Duration::from_secs(10);

/// Why a listener stopped consuming.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StopReason {
    /// Stop was requested.
    Regular,
    /// The delivery stream died without a stop request.
    Unexpected,
}

/// Stop notification delivered to the owning receiver.
#[derive(Clone, Debug)]
pub struct StoppedEvent {
    /// Broker URL of the stopped listener.
    pub broker_url: String,
    /// Queue address of the stopped listener.
    pub queue: String,
    /// Why it stopped.
    pub reason: StopReason,
}

/// Listener lifecycle states.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ListenerState {
    Created,
    Running,
    Stopping,
    Stopped,
}

/// Dispatch and flow-control policy for one listener.
#[derive(Clone, Debug)]
pub struct ListenerOptions {
    /// Endpoint the listener serves.
    pub endpoint_name: String,
    /// Labels the subscription is declared for.
    pub accepted_labels: Vec<MessageLabel>,
    /// Whether consumers must explicitly accept deliveries.
    pub requires_accept: bool,
    /// Worker count for message dispatch.
    pub parallelism_level: u32,
    /// Policy for rejected messages.
    pub failed_delivery: FailedDeliveryStrategy,
    /// Broker-side flow control.
    pub qos: Qos,
    /// Headers stripped before dispatch.
    pub excluded_headers: BTreeSet<String>,
}

/// The option subset two co-located listeners must agree on.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CompatibilityKey {
    /// Whether consumers must explicitly accept deliveries.
    pub requires_accept: bool,
    /// Worker count for message dispatch.
    pub parallelism_level: u32,
    /// Policy for rejected messages.
    pub failed_delivery: FailedDeliveryStrategy,
    /// Broker-side flow control.
    pub qos: Qos,
}

impl ListenerOptions {
    /// The compatibility-relevant subset of these options.
    pub fn compatibility_key(&self) -> CompatibilityKey {
        CompatibilityKey {
            requires_accept: self.requires_accept,
            parallelism_level: self.parallelism_level,
            failed_delivery: self.failed_delivery,
            qos: self.qos,
        }
    }
}

#[derive(Clone)]
struct ConsumerEntry {
    consumer: Arc<dyn MessageConsumer>,
    validator: Option<Arc<dyn PayloadValidator>>,
}

/// The consuming half of a connection against one queue.
///
/// Owns a channel and a consumer registry keyed by label; deliveries are
/// dispatched on a bounded pool of short-lived per-message tasks.
pub struct Listener {
    weak: Weak<Listener>,
    broker_url: String,
    endpoint: SubscriptionEndpoint,
    options: ListenerOptions,
    connection: Connection,
    channel: Arc<dyn ChannelHandle>,
    consumers: Mutex<HashMap<MessageLabel, ConsumerEntry>>,
    state: Mutex<ListenerState>,
    stopped_tx: mpsc::UnboundedSender<StoppedEvent>,
    cancellation: CancellationToken,
    abort: CancellationToken,
    dispatch: DispatchPool,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Listener {
    /// Builds a listener over an already-bound subscription.
    pub(crate) fn new(
        broker_url: impl Into<String>,
        endpoint: SubscriptionEndpoint,
        options: ListenerOptions,
        connection: Connection,
        channel: Arc<dyn ChannelHandle>,
        stopped_tx: mpsc::UnboundedSender<StoppedEvent>,
    ) -> Arc<Self> {
        let cancellation = connection.cancellation().child_token();
        let dispatch = DispatchPool::new(options.parallelism_level);
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            broker_url: broker_url.into(),
            endpoint,
            options,
            connection,
            channel,
            consumers: Mutex::new(HashMap::new()),
            state: Mutex::new(ListenerState::Created),
            stopped_tx,
            cancellation,
            abort: CancellationToken::new(),
            dispatch,
            pump: Mutex::new(None),
        })
    }

    /// Broker URL this listener consumes from.
    pub fn broker_url(&self) -> &str {
        &self.broker_url
    }

    /// Queue address this listener consumes from.
    pub fn queue(&self) -> &str {
        &self.endpoint.queue
    }

    /// Dispatch and flow-control policy.
    pub fn options(&self) -> &ListenerOptions {
        &self.options
    }

    /// The compatibility-relevant subset of the listener's options.
    pub fn compatibility_key(&self) -> CompatibilityKey {
        self.options.compatibility_key()
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Registers the consumer (and optional validator) for `label`.
    pub async fn register_consumer(
        &self,
        label: MessageLabel,
        consumer: Arc<dyn MessageConsumer>,
        validator: Option<Arc<dyn PayloadValidator>>,
    ) {
        self.consumers
            .lock()
            .await
            .insert(label, ConsumerEntry { consumer, validator });
    }

    /// Whether the listener serves `label`.
    pub async fn supports(&self, label: &MessageLabel) -> bool {
        if self.options.accepted_labels.contains(label) {
            return true;
        }
        self.consumers.lock().await.contains_key(label)
    }

    /// Starts the consuming loop. Idempotent while running; a stopped
    /// listener cannot be restarted.
    pub async fn start_consuming(&self) -> Result<(), BusError> {
        {
            let mut state = self.state.lock().await;
            match *state {
                ListenerState::Created => *state = ListenerState::Running,
                ListenerState::Running => return Ok(()),
                ListenerState::Stopping | ListenerState::Stopped => {
                    return Err(BusError::configuration(format!(
                        "listener {} is stopped and cannot be restarted",
                        fields::format_listener_key(&self.broker_url, &self.endpoint.queue)
                    )))
                }
            }
        }

        let deliveries = self.channel.consume(&self.endpoint.queue).await?;
        info!(
            event = events::LISTENER_STARTED,
            component = COMPONENT,
            listener = %fields::format_listener_key(&self.broker_url, &self.endpoint.queue),
            parallelism = self.options.parallelism_level,
            "listener consuming"
        );

        let Some(listener) = self.weak.upgrade() else {
            return Ok(());
        };
        let pump = tokio::spawn(Self::consume_loop(listener, deliveries));
        *self.pump.lock().await = Some(pump);
        Ok(())
    }

    async fn consume_loop(listener: Arc<Self>, mut deliveries: mpsc::Receiver<Delivery>) {
        let reason = loop {
            tokio::select! {
                _ = listener.cancellation.cancelled() => break StopReason::Regular,
                next = deliveries.recv() => match next {
                    Some(delivery) => {
                        let worker = Arc::clone(&listener);
                        listener
                            .dispatch
                            .dispatch(async move { worker.handle_delivery(delivery).await })
                            .await;
                    }
                    None => {
                        let stopping =
                            *listener.state.lock().await == ListenerState::Stopping;
                        break if stopping {
                            StopReason::Regular
                        } else {
                            StopReason::Unexpected
                        };
                    }
                }
            }
        };
        listener.finish(reason).await;
    }

    async fn finish(&self, reason: StopReason) {
        {
            let mut state = self.state.lock().await;
            if *state == ListenerState::Stopped {
                return;
            }
            *state = ListenerState::Stopped;
        }
        info!(
            event = events::LISTENER_STOPPED,
            component = COMPONENT,
            listener = %fields::format_listener_key(&self.broker_url, &self.endpoint.queue),
            reason = ?reason,
            "listener stopped"
        );
        let _ = self.stopped_tx.send(StoppedEvent {
            broker_url: self.broker_url.clone(),
            queue: self.endpoint.queue.clone(),
            reason,
        });
    }

    async fn handle_delivery(self: Arc<Self>, mut delivery: Delivery) {
        if !self.options.excluded_headers.is_empty() {
            delivery
                .headers
                .retain(|name, _| !self.options.excluded_headers.contains(name));
        }

        let tag = delivery.tag;
        let entry = self.consumers.lock().await.get(&delivery.label).cloned();
        let Some(entry) = entry else {
            warn!(
                event = events::LISTENER_UNHANDLED_LABEL,
                component = COMPONENT,
                listener = %fields::format_listener_key(&self.broker_url, &self.endpoint.queue),
                label = %delivery.label,
                "no consumer registered for label"
            );
            // dead-letter under explicit-accept, requeue otherwise
            self.safe_nack(tag, !self.options.requires_accept).await;
            return;
        };

        if let Some(validator) = &entry.validator {
            if let Err(err) = validator.validate(&delivery) {
                warn!(
                    event = events::LISTENER_VALIDATION_REJECTED,
                    component = COMPONENT,
                    label = %delivery.label,
                    err = %err,
                    "validator rejected delivery"
                );
                self.apply_failed_delivery(tag).await;
                return;
            }
        }

        tokio::select! {
            _ = self.abort.cancelled() => {
                self.safe_nack(tag, true).await;
            }
            outcome = entry.consumer.consume(delivery) => match outcome {
                Ok(()) => {
                    if self.options.requires_accept {
                        self.safe_ack(tag).await;
                    }
                }
                Err(err) => {
                    warn!(
                        event = events::LISTENER_CONSUMER_FAILED,
                        component = COMPONENT,
                        err = %err,
                        "consumer callback failed"
                    );
                    self.apply_failed_delivery(tag).await;
                }
            }
        }
    }

    async fn apply_failed_delivery(&self, tag: u64) {
        match self.options.failed_delivery {
            FailedDeliveryStrategy::Requeue => self.safe_nack(tag, true).await,
            FailedDeliveryStrategy::DeadLetter => self.safe_nack(tag, false).await,
            FailedDeliveryStrategy::Drop => self.safe_ack(tag).await,
        }
    }

    async fn safe_ack(&self, tag: u64) {
        if let Err(err) = self.channel.ack(tag).await {
            warn!(
                event = events::LISTENER_ACK_FAILED,
                component = COMPONENT,
                tag,
                err = %err,
                "ack failed"
            );
        }
    }

    async fn safe_nack(&self, tag: u64, requeue: bool) {
        if let Err(err) = self.channel.nack(tag, requeue).await {
            warn!(
                event = events::LISTENER_ACK_FAILED,
                component = COMPONENT,
                tag,
                requeue,
                err = %err,
                "nack failed"
            );
        }
    }

    /// Requests a stop and drains in-flight dispatches up to a deadline.
    pub async fn stop_consuming(&self) -> Result<(), BusError> {
        {
            let mut state = self.state.lock().await;
            match *state {
                ListenerState::Running => *state = ListenerState::Stopping,
                ListenerState::Created => {
                    *state = ListenerState::Stopped;
                    return Ok(());
                }
                ListenerState::Stopping | ListenerState::Stopped => return Ok(()),
            }
        }

        self.cancellation.cancel();
        let cancel_result = self.channel.cancel_consume().await;

        if !self.dispatch.drain(STOP_DRAIN_DEADLINE).await {
            warn!(
                component = COMPONENT,
                listener = %fields::format_listener_key(&self.broker_url, &self.endpoint.queue),
                "stop deadline elapsed with dispatches in flight"
            );
        }

        if let Some(pump) = self.pump.lock().await.take() {
            let _ = pump.await;
        }

        cancel_result.map_err(BusError::from)
    }

    /// Forces the listener into `Stopped`; in-flight messages are
    /// nack-requeued.
    pub async fn dispose(&self) {
        {
            let mut state = self.state.lock().await;
            if *state == ListenerState::Running || *state == ListenerState::Created {
                *state = ListenerState::Stopping;
            }
        }
        self.cancellation.cancel();
        self.abort.cancel();
        if let Err(err) = self.channel.cancel_consume().await {
            debug!(
                component = COMPONENT,
                err = %err,
                "cancel_consume during dispose failed"
            );
        }
        if let Some(pump) = self.pump.lock().await.take() {
            let _ = pump.await;
        }
        let mut state = self.state.lock().await;
        *state = ListenerState::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::{Listener, ListenerOptions, StopReason, StoppedEvent};
    use crate::data_plane::connection_pool::Connection;
    use crate::errors::{TransportError, ValidationError};
    use crate::label::MessageLabel;
    use crate::message::{Delivery, Headers, Payload};
    use crate::routing::consumer::{
        ConsumerError, FailedDeliveryStrategy, MessageConsumer, PayloadValidator,
    };
    use crate::transport::{
        BrokerConnection, ChannelHandle, Qos, SubscriptionEndpoint, SubscriptionOptions,
    };
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    #[derive(Clone, Debug, Eq, PartialEq)]
    enum AckRecord {
        Ack(u64),
        Nack(u64, bool),
    }

    struct RecordingChannel {
        deliveries: StdMutex<Option<mpsc::Receiver<Delivery>>>,
        acks: Arc<StdMutex<Vec<AckRecord>>>,
    }

    #[async_trait]
    impl ChannelHandle for RecordingChannel {
        async fn apply_qos(&self, _qos: Qos) -> Result<(), TransportError> {
            Ok(())
        }

        async fn bind_subscription(
            &self,
            endpoint_name: &str,
            _options: &SubscriptionOptions,
        ) -> Result<SubscriptionEndpoint, TransportError> {
            Ok(SubscriptionEndpoint {
                queue: format!("{endpoint_name}.incoming"),
            })
        }

        async fn consume(&self, _queue: &str) -> Result<mpsc::Receiver<Delivery>, TransportError> {
            self.deliveries
                .lock()
                .expect("lock deliveries")
                .take()
                .ok_or_else(|| TransportError::ChannelClosed("consume called twice".to_string()))
        }

        async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
            self.acks
                .lock()
                .expect("lock acks")
                .push(AckRecord::Ack(delivery_tag));
            Ok(())
        }

        async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
            self.acks
                .lock()
                .expect("lock acks")
                .push(AckRecord::Nack(delivery_tag, requeue));
            Ok(())
        }

        async fn cancel_consume(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    struct NoopConnection {
        id: Uuid,
        cancellation: CancellationToken,
    }

    #[async_trait]
    impl BrokerConnection for NoopConnection {
        fn id(&self) -> Uuid {
            self.id
        }

        fn url(&self) -> &str {
            "amqp://h1"
        }

        fn cancellation(&self) -> CancellationToken {
            self.cancellation.clone()
        }

        async fn open_channel(&self) -> Result<Arc<dyn ChannelHandle>, TransportError> {
            Err(TransportError::ChannelClosed(
                "not used in listener tests".to_string(),
            ))
        }

        async fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    struct RecordingConsumer {
        seen: Arc<StdMutex<Vec<Delivery>>>,
    }

    #[async_trait]
    impl MessageConsumer for RecordingConsumer {
        async fn consume(&self, delivery: Delivery) -> Result<(), ConsumerError> {
            self.seen.lock().expect("lock seen").push(delivery);
            Ok(())
        }
    }

    struct FailingConsumer;

    #[async_trait]
    impl MessageConsumer for FailingConsumer {
        async fn consume(&self, _delivery: Delivery) -> Result<(), ConsumerError> {
            Err(ConsumerError::new("boom"))
        }
    }

    struct RejectingValidator;

    impl PayloadValidator for RejectingValidator {
        fn validate(&self, _delivery: &Delivery) -> Result<(), ValidationError> {
            Err(ValidationError::new("bad payload"))
        }
    }

    fn options(requires_accept: bool, failed_delivery: FailedDeliveryStrategy) -> ListenerOptions {
        ListenerOptions {
            endpoint_name: "orders".to_string(),
            accepted_labels: vec![MessageLabel::new("order.created")],
            requires_accept,
            parallelism_level: 1,
            failed_delivery,
            qos: Qos::default(),
            excluded_headers: BTreeSet::new(),
        }
    }

    struct Harness {
        listener: Arc<Listener>,
        deliveries: mpsc::Sender<Delivery>,
        acks: Arc<StdMutex<Vec<AckRecord>>>,
        stopped: mpsc::UnboundedReceiver<StoppedEvent>,
    }

    fn harness(options: ListenerOptions) -> Harness {
        let (delivery_tx, delivery_rx) = mpsc::channel(8);
        let acks = Arc::new(StdMutex::new(Vec::new()));
        let channel = Arc::new(RecordingChannel {
            deliveries: StdMutex::new(Some(delivery_rx)),
            acks: acks.clone(),
        });
        let connection = Connection::new(
            Arc::new(NoopConnection {
                id: Uuid::new_v4(),
                cancellation: CancellationToken::new(),
            }),
            false,
        );
        let (stopped_tx, stopped_rx) = mpsc::unbounded_channel();
        let listener = Listener::new(
            "amqp://h1",
            SubscriptionEndpoint {
                queue: "orders.incoming".to_string(),
            },
            options,
            connection,
            channel,
            stopped_tx,
        );
        Harness {
            listener,
            deliveries: delivery_tx,
            acks,
            stopped: stopped_rx,
        }
    }

    fn delivery(label: &str, tag: u64) -> Delivery {
        Delivery {
            label: MessageLabel::new(label),
            headers: Headers::new(),
            payload: Payload::Untyped(serde_json::Map::new()),
            tag,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn dispatches_to_registered_consumer_and_acks_under_explicit_accept() {
        let mut fixture = harness(options(true, FailedDeliveryStrategy::Requeue));
        let seen = Arc::new(StdMutex::new(Vec::new()));
        fixture
            .listener
            .register_consumer(
                MessageLabel::new("order.created"),
                Arc::new(RecordingConsumer { seen: seen.clone() }),
                None,
            )
            .await;

        fixture.listener.start_consuming().await.unwrap();
        fixture
            .deliveries
            .send(delivery("order.created", 7))
            .await
            .unwrap();
        settle().await;

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(*fixture.acks.lock().unwrap(), vec![AckRecord::Ack(7)]);

        fixture.listener.stop_consuming().await.unwrap();
        let event = fixture.stopped.recv().await.unwrap();
        assert_eq!(event.reason, StopReason::Regular);
    }

    #[tokio::test]
    async fn unhandled_label_is_dead_lettered_under_explicit_accept() {
        let fixture = harness(options(true, FailedDeliveryStrategy::Requeue));
        fixture.listener.start_consuming().await.unwrap();

        fixture
            .deliveries
            .send(delivery("order.unknown", 3))
            .await
            .unwrap();
        settle().await;

        assert_eq!(
            *fixture.acks.lock().unwrap(),
            vec![AckRecord::Nack(3, false)]
        );
    }

    #[tokio::test]
    async fn unhandled_label_is_requeued_without_explicit_accept() {
        let fixture = harness(options(false, FailedDeliveryStrategy::Requeue));
        fixture.listener.start_consuming().await.unwrap();

        fixture
            .deliveries
            .send(delivery("order.unknown", 4))
            .await
            .unwrap();
        settle().await;

        assert_eq!(*fixture.acks.lock().unwrap(), vec![AckRecord::Nack(4, true)]);
    }

    #[tokio::test]
    async fn validator_rejection_applies_the_failed_delivery_strategy() {
        let fixture = harness(options(true, FailedDeliveryStrategy::DeadLetter));
        fixture
            .listener
            .register_consumer(
                MessageLabel::new("order.created"),
                Arc::new(FailingConsumer),
                Some(Arc::new(RejectingValidator)),
            )
            .await;
        fixture.listener.start_consuming().await.unwrap();

        fixture
            .deliveries
            .send(delivery("order.created", 5))
            .await
            .unwrap();
        settle().await;

        assert_eq!(
            *fixture.acks.lock().unwrap(),
            vec![AckRecord::Nack(5, false)]
        );
    }

    #[tokio::test]
    async fn consumer_failure_with_drop_strategy_acks_the_message() {
        let fixture = harness(options(true, FailedDeliveryStrategy::Drop));
        fixture
            .listener
            .register_consumer(
                MessageLabel::new("order.created"),
                Arc::new(FailingConsumer),
                None,
            )
            .await;
        fixture.listener.start_consuming().await.unwrap();

        fixture
            .deliveries
            .send(delivery("order.created", 6))
            .await
            .unwrap();
        settle().await;

        assert_eq!(*fixture.acks.lock().unwrap(), vec![AckRecord::Ack(6)]);
    }

    #[tokio::test]
    async fn excluded_headers_are_stripped_before_dispatch() {
        let mut listener_options = options(false, FailedDeliveryStrategy::Requeue);
        listener_options.excluded_headers =
            BTreeSet::from(["x-internal".to_string()]);
        let fixture = harness(listener_options);

        let seen = Arc::new(StdMutex::new(Vec::new()));
        fixture
            .listener
            .register_consumer(
                MessageLabel::new("order.created"),
                Arc::new(RecordingConsumer { seen: seen.clone() }),
                None,
            )
            .await;
        fixture.listener.start_consuming().await.unwrap();

        let mut tagged = delivery("order.created", 9);
        tagged
            .headers
            .insert("x-internal".to_string(), serde_json::Value::Bool(true));
        tagged
            .headers
            .insert("x-tenant".to_string(), serde_json::Value::String("a".into()));
        fixture.deliveries.send(tagged).await.unwrap();
        settle().await;

        let seen = seen.lock().unwrap();
        assert!(!seen[0].headers.contains_key("x-internal"));
        assert!(seen[0].headers.contains_key("x-tenant"));
    }

    #[tokio::test]
    async fn dying_delivery_stream_emits_an_unexpected_stop() {
        let mut fixture = harness(options(false, FailedDeliveryStrategy::Requeue));
        fixture.listener.start_consuming().await.unwrap();

        drop(fixture.deliveries);
        let event = fixture.stopped.recv().await.unwrap();
        assert_eq!(event.reason, StopReason::Unexpected);
        assert_eq!(event.broker_url, "amqp://h1");
        assert_eq!(event.queue, "orders.incoming");
    }

    #[tokio::test]
    async fn supports_covers_accepted_labels_and_registrations() {
        let fixture = harness(options(false, FailedDeliveryStrategy::Requeue));
        assert!(fixture
            .listener
            .supports(&MessageLabel::new("order.created"))
            .await);
        assert!(!fixture
            .listener
            .supports(&MessageLabel::new("order.other"))
            .await);

        fixture
            .listener
            .register_consumer(
                MessageLabel::new("order.other"),
                Arc::new(FailingConsumer),
                None,
            )
            .await;
        assert!(fixture
            .listener
            .supports(&MessageLabel::new("order.other"))
            .await);
    }

    #[tokio::test]
    async fn stopped_listener_cannot_be_restarted() {
        let fixture = harness(options(false, FailedDeliveryStrategy::Requeue));
        fixture.listener.start_consuming().await.unwrap();
        fixture.listener.stop_consuming().await.unwrap();

        assert!(fixture.listener.start_consuming().await.is_err());
    }
}
