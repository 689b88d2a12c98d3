//! Per-subscription aggregate of listeners.
//!
//! A receiver builds one listener per broker URL of its connection string,
//! deduplicates listeners sharing a `(URL, queue)`, enforces option
//! compatibility between co-located listeners, and re-enlists listeners that
//! stop unexpectedly.

use crate::data_plane::connection_pool::ConnectionPool;
use crate::data_plane::listener::{
    Listener, ListenerOptions, StopReason, StoppedEvent,
};
use crate::errors::BusError;
use crate::label::MessageLabel;
use crate::observability::{events, fields};
use crate::routing::consumer::{FailedDeliveryStrategy, MessageConsumer, PayloadValidator};
use crate::transport::{Qos, SubscriptionOptions};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const COMPONENT: &str = "receiver";

/// Effective configuration of one subscription.
#[derive(Clone, Debug)]
pub struct ReceiverOptions {
    /// Endpoint the subscription belongs to.
    pub endpoint_name: String,
    /// Label the subscription was configured for.
    pub label: MessageLabel,
    /// Effective comma-separated broker URLs.
    pub connection_string: String,
    /// Whether listeners share pooled connections.
    pub reuse_connection: bool,
    /// Effective broker-side flow control.
    pub qos: Qos,
    /// Effective dispatch worker count.
    pub parallelism_level: u32,
    /// Whether consumers must explicitly accept deliveries.
    pub requires_accept: bool,
    /// Policy for rejected messages.
    pub failed_delivery: FailedDeliveryStrategy,
    /// Headers stripped before dispatch.
    pub excluded_headers: BTreeSet<String>,
    /// Topology options handed to the transport.
    pub subscription: SubscriptionOptions,
}

impl ReceiverOptions {
    /// Broker URLs of the connection string, in declaration order.
    pub fn broker_urls(&self) -> impl Iterator<Item = &str> {
        self.connection_string
            .split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    fn listener_options(&self) -> ListenerOptions {
        ListenerOptions {
            endpoint_name: self.endpoint_name.clone(),
            accepted_labels: self.subscription.labels.clone(),
            requires_accept: self.requires_accept,
            parallelism_level: self.parallelism_level,
            failed_delivery: self.failed_delivery,
            qos: self.qos,
            excluded_headers: self.excluded_headers.clone(),
        }
    }
}

/// One subscription as assembled by the configurator: effective options, the
/// bound validator, and the consumers materialized from declared lifestyles.
pub struct ReceiverConfiguration {
    /// Effective subscription options.
    pub options: ReceiverOptions,
    /// Validator bound to the subscription.
    pub validator: Option<Arc<dyn PayloadValidator>>,
    /// Consumers registered when the receiver is created.
    pub consumers: Vec<(MessageLabel, Arc<dyn MessageConsumer>)>,
}

/// Hook invoked for every listener a receiver is about to register.
///
/// The bus uses it to enforce compatibility across receivers sharing a
/// `(URL, queue)`.
pub type ListenerRegistrationHook =
    Arc<dyn Fn(&Listener) -> Result<(), BusError> + Send + Sync>;

#[derive(Default)]
struct Lifecycle {
    built: bool,
    started: bool,
}

/// The per-subscription aggregate of listeners and consumer registrations.
pub struct Receiver {
    weak: Weak<Receiver>,
    options: ReceiverOptions,
    validator: Option<Arc<dyn PayloadValidator>>,
    pool: Arc<ConnectionPool>,
    registration_hook: Option<ListenerRegistrationHook>,
    cancellation: CancellationToken,
    listeners: Mutex<Vec<Arc<Listener>>>,
    lifecycle: Mutex<Lifecycle>,
    started_flag: AtomicBool,
    registrations: Mutex<Vec<(MessageLabel, Arc<dyn MessageConsumer>)>>,
    stopped_tx: mpsc::UnboundedSender<StoppedEvent>,
    stopped_rx: Mutex<Option<mpsc::UnboundedReceiver<StoppedEvent>>>,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Receiver {
    /// Builds a receiver over the pool, optionally pre-seeded with consumer
    /// registrations the configurator materialized.
    pub fn new(
        options: ReceiverOptions,
        validator: Option<Arc<dyn PayloadValidator>>,
        initial_consumers: Vec<(MessageLabel, Arc<dyn MessageConsumer>)>,
        pool: Arc<ConnectionPool>,
        registration_hook: Option<ListenerRegistrationHook>,
        cancellation: CancellationToken,
    ) -> Arc<Self> {
        let (stopped_tx, stopped_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            options,
            validator,
            pool,
            registration_hook,
            cancellation,
            listeners: Mutex::new(Vec::new()),
            lifecycle: Mutex::new(Lifecycle::default()),
            started_flag: AtomicBool::new(false),
            registrations: Mutex::new(initial_consumers),
            stopped_tx,
            stopped_rx: Mutex::new(Some(stopped_rx)),
            pump: Mutex::new(None),
        })
    }

    /// Effective configuration of the subscription.
    pub fn options(&self) -> &ReceiverOptions {
        &self.options
    }

    /// Label the subscription was configured for.
    pub fn configuration_label(&self) -> &MessageLabel {
        &self.options.label
    }

    /// Whether the receiver has been started and not yet stopped.
    pub fn is_started(&self) -> bool {
        self.started_flag.load(Ordering::SeqCst)
    }

    /// Whether the receiver serves `label`. Builds listeners lazily.
    pub async fn can_receive(&self, label: &MessageLabel) -> Result<bool, BusError> {
        {
            let mut lifecycle = self.lifecycle.lock().await;
            self.build_listeners_locked(&mut lifecycle).await?;
        }
        for listener in self.listeners.lock().await.iter() {
            if listener.supports(label).await {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// First listener matching `predicate`, in registration order.
    pub async fn get_listener(
        &self,
        predicate: impl Fn(&Listener) -> bool,
    ) -> Option<Arc<Listener>> {
        self.listeners
            .lock()
            .await
            .iter()
            .find(|listener| predicate(listener))
            .cloned()
    }

    /// Checks `candidate` against this receiver's listeners sharing its
    /// `(URL, queue)`.
    pub async fn check_if_compatible(&self, candidate: &Listener) -> Result<(), BusError> {
        for listener in self.listeners.lock().await.iter() {
            if listener.broker_url() == candidate.broker_url()
                && listener.queue() == candidate.queue()
                && listener.compatibility_key() != candidate.compatibility_key()
            {
                return Err(BusError::configuration(format!(
                    "subscriptions on {} disagree on accept/parallelism/failed-delivery/QoS options",
                    fields::format_listener_key(candidate.broker_url(), candidate.queue())
                )));
            }
        }
        Ok(())
    }

    /// Registers a consumer for `label` on every current listener, with the
    /// receiver's configured validator. The registration is re-applied after
    /// re-enlistment.
    pub async fn register_consumer(
        &self,
        label: MessageLabel,
        consumer: Arc<dyn MessageConsumer>,
    ) {
        self.registrations
            .lock()
            .await
            .push((label.clone(), consumer.clone()));
        for listener in self.listeners.lock().await.iter() {
            listener
                .register_consumer(label.clone(), consumer.clone(), self.validator.clone())
                .await;
        }
    }

    /// Builds listeners if needed and starts them. Idempotent.
    pub async fn start(&self) -> Result<(), BusError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.started {
            return Ok(());
        }
        self.build_listeners_locked(&mut lifecycle).await?;

        let listeners: Vec<_> = self.listeners.lock().await.iter().cloned().collect();
        for listener in listeners {
            listener.start_consuming().await?;
        }
        lifecycle.started = true;
        self.started_flag.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stops and disposes every listener. Best-effort: failures are logged
    /// and the listener set is always emptied. Idempotent.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let drained: Vec<_> = self.listeners.lock().await.drain(..).collect();
        for listener in drained {
            if let Err(err) = listener.stop_consuming().await {
                warn!(
                    event = events::RECEIVER_STOP_FAILURE,
                    component = COMPONENT,
                    listener = %fields::format_listener_key(listener.broker_url(), listener.queue()),
                    err = %err,
                    "stopping listener failed; continuing"
                );
            }
            listener.dispose().await;
            self.pool.release(listener.connection().clone()).await;
        }
        lifecycle.built = false;
        lifecycle.started = false;
        self.started_flag.store(false, Ordering::SeqCst);
    }

    fn ensure_pump(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let Some(stopped_rx) = self.stopped_rx.lock().await.take() else {
                return;
            };
            let fut: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
                Box::pin(Self::reenlistment_loop(self.weak.clone(), stopped_rx));
            let pump = tokio::spawn(fut);
            *self.pump.lock().await = Some(pump);
        })
    }

    async fn build_listeners_locked(&self, lifecycle: &mut Lifecycle) -> Result<(), BusError> {
        if lifecycle.built {
            return Ok(());
        }
        self.ensure_pump().await;

        for url in self.options.broker_urls() {
            let connection = self
                .pool
                .get(url, self.options.reuse_connection, &self.cancellation)
                .await?;
            let channel = connection.open_channel().await?;
            channel.apply_qos(self.options.qos).await?;
            let endpoint = channel
                .bind_subscription(&self.options.endpoint_name, &self.options.subscription)
                .await?;

            let colocated = self
                .get_listener(|listener| {
                    listener.broker_url() == url && listener.queue() == endpoint.queue
                })
                .await;
            if let Some(existing) = colocated {
                let candidate = self.options.listener_options();
                if existing.compatibility_key() != candidate.compatibility_key() {
                    self.pool.release(connection).await;
                    return Err(BusError::configuration(format!(
                        "subscriptions on {} disagree on accept/parallelism/failed-delivery/QoS options",
                        fields::format_listener_key(url, &endpoint.queue)
                    )));
                }
                debug!(
                    event = events::RECEIVER_LISTENER_DEDUPED,
                    component = COMPONENT,
                    listener = %fields::format_listener_key(url, &endpoint.queue),
                    "discarding tentative listener for an already-covered queue"
                );
                self.pool.release(connection).await;
                continue;
            }

            let listener = Listener::new(
                url,
                endpoint,
                self.options.listener_options(),
                connection,
                channel,
                self.stopped_tx.clone(),
            );

            if let Some(hook) = &self.registration_hook {
                if let Err(err) = hook(&listener) {
                    self.pool.release(listener.connection().clone()).await;
                    return Err(err);
                }
            }

            let registrations: Vec<_> = self
                .registrations
                .lock()
                .await
                .iter()
                .cloned()
                .collect();
            for (label, consumer) in registrations {
                listener
                    .register_consumer(label, consumer, self.validator.clone())
                    .await;
            }

            debug!(
                event = events::RECEIVER_LISTENER_BUILT,
                component = COMPONENT,
                listener = %fields::format_listener_key(listener.broker_url(), listener.queue()),
                "listener registered"
            );
            self.listeners.lock().await.push(listener);
        }

        lifecycle.built = true;
        Ok(())
    }

    async fn reenlistment_loop(
        receiver: Weak<Receiver>,
        mut stopped_rx: mpsc::UnboundedReceiver<StoppedEvent>,
    ) {
        while let Some(event) = stopped_rx.recv().await {
            let Some(receiver) = receiver.upgrade() else {
                break;
            };
            match event.reason {
                StopReason::Regular => debug!(
                    component = COMPONENT,
                    listener = %fields::format_listener_key(&event.broker_url, &event.queue),
                    "listener stopped regularly"
                ),
                StopReason::Unexpected => {
                    let fut: std::pin::Pin<
                        Box<dyn std::future::Future<Output = Result<(), BusError>> + Send + '_>,
                    > = Box::pin(receiver.reenlist(&event));
                    if let Err(err) = fut.await {
                        warn!(
                            component = COMPONENT,
                            listener = %fields::format_listener_key(&event.broker_url, &event.queue),
                            err = %err,
                            "re-enlistment failed"
                        );
                    }
                }
            }
        }
    }

    async fn reenlist(&self, event: &StoppedEvent) -> Result<(), BusError> {
        let mut lifecycle = self.lifecycle.lock().await;

        let offender = {
            let mut listeners = self.listeners.lock().await;
            let drained: Vec<_> = listeners.drain(..).collect();
            let mut offender = None;
            for listener in drained {
                let matches = listener.broker_url() == event.broker_url
                    && listener.queue() == event.queue;
                if matches && offender.is_none() {
                    offender = Some(listener);
                } else {
                    listeners.push(listener);
                }
            }
            offender
        };

        if let Some(offender) = offender {
            offender.dispose().await;
            self.pool.release(offender.connection().clone()).await;
        }

        warn!(
            event = events::RECEIVER_REENLISTED,
            component = COMPONENT,
            listener = %fields::format_listener_key(&event.broker_url, &event.queue),
            "listener stopped unexpectedly; rebuilding"
        );

        lifecycle.built = false;
        if lifecycle.started {
            self.build_listeners_locked(&mut lifecycle).await?;
            let listeners: Vec<_> = self.listeners.lock().await.iter().cloned().collect();
            for listener in listeners {
                listener.start_consuming().await?;
            }
        }
        Ok(())
    }
}
