/********************************************************************************
 * Copyright (c) 2024 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

//! # conveyor-bus
//!
//! `conveyor-bus` is the core of a client-side message bus over an AMQP-class
//! broker. Applications declare named *endpoints* — outgoing routes and
//! incoming subscriptions under interned labels — and the bus materializes
//! them into receivers and listeners multiplexed over a pool of broker
//! connections.
//!
//! The wire protocol stays behind the [`transport`] trait seam; this crate
//! owns configuration materialization, listener coordination, and the
//! connection pool.
//!
//! ## Quick start
//!
//! ```
//! use std::sync::Arc;
//! use conveyor_bus::{
//!     BusBuilder, BusConfigurator, ComponentRegistry, EndpointsSection, MessageLabel,
//!     SchemaCatalog,
//! };
//!
//! # use async_trait::async_trait;
//! # use conveyor_bus::transport::{
//! #     BrokerConnection, ChannelHandle, ConnectionFactory, Qos, SubscriptionEndpoint,
//! #     SubscriptionOptions,
//! # };
//! # use conveyor_bus::{ConsumerError, Delivery, MessageConsumer, TransportError};
//! # use tokio_util::sync::CancellationToken;
//! #
//! # #[derive(Default)]
//! # struct MockChannel {
//! #     held_senders: std::sync::Mutex<Vec<tokio::sync::mpsc::Sender<Delivery>>>,
//! # }
//! #
//! # #[async_trait]
//! # impl ChannelHandle for MockChannel {
//! #     async fn apply_qos(&self, _qos: Qos) -> Result<(), TransportError> {
//! #         Ok(())
//! #     }
//! #     async fn bind_subscription(
//! #         &self,
//! #         endpoint_name: &str,
//! #         _options: &SubscriptionOptions,
//! #     ) -> Result<SubscriptionEndpoint, TransportError> {
//! #         Ok(SubscriptionEndpoint { queue: format!("{endpoint_name}.incoming") })
//! #     }
//! #     async fn consume(
//! #         &self,
//! #         _queue: &str,
//! #     ) -> Result<tokio::sync::mpsc::Receiver<Delivery>, TransportError> {
//! #         let (tx, rx) = tokio::sync::mpsc::channel(8);
//! #         self.held_senders.lock().unwrap().push(tx);
//! #         Ok(rx)
//! #     }
//! #     async fn ack(&self, _delivery_tag: u64) -> Result<(), TransportError> {
//! #         Ok(())
//! #     }
//! #     async fn nack(&self, _delivery_tag: u64, _requeue: bool) -> Result<(), TransportError> {
//! #         Ok(())
//! #     }
//! #     async fn cancel_consume(&self) -> Result<(), TransportError> {
//! #         Ok(())
//! #     }
//! # }
//! #
//! # struct MockConnection {
//! #     id: uuid::Uuid,
//! #     url: String,
//! #     cancellation: CancellationToken,
//! # }
//! #
//! # #[async_trait]
//! # impl BrokerConnection for MockConnection {
//! #     fn id(&self) -> uuid::Uuid {
//! #         self.id
//! #     }
//! #     fn url(&self) -> &str {
//! #         &self.url
//! #     }
//! #     fn cancellation(&self) -> CancellationToken {
//! #         self.cancellation.clone()
//! #     }
//! #     async fn open_channel(&self) -> Result<Arc<dyn ChannelHandle>, TransportError> {
//! #         Ok(Arc::new(MockChannel::default()))
//! #     }
//! #     async fn close(&self) -> Result<(), TransportError> {
//! #         Ok(())
//! #     }
//! # }
//! #
//! # struct MockFactory;
//! #
//! # #[async_trait]
//! # impl ConnectionFactory for MockFactory {
//! #     async fn open(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, TransportError> {
//! #         Ok(Arc::new(MockConnection {
//! #             id: uuid::Uuid::new_v4(),
//! #             url: url.to_string(),
//! #             cancellation: CancellationToken::new(),
//! #         }))
//! #     }
//! # }
//! #
//! # struct OrderConsumer;
//! #
//! # #[async_trait]
//! # impl MessageConsumer for OrderConsumer {
//! #     async fn consume(&self, _delivery: Delivery) -> Result<(), ConsumerError> {
//! #         Ok(())
//! #     }
//! # }
//! #
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let section: EndpointsSection = serde_json::from_value(serde_json::json!({
//!     "endpoints": [{
//!         "name": "orders",
//!         "connectionString": "amqp://broker-1",
//!         "incoming": [
//!             { "key": "created", "label": "order.created", "react": "on-order-created" }
//!         ]
//!     }]
//! }))
//! .unwrap();
//!
//! let mut registry = ComponentRegistry::new();
//! registry.register_consumer(
//!     "on-order-created",
//!     None,
//!     Arc::new(|| Arc::new(OrderConsumer) as Arc<dyn MessageConsumer>),
//! );
//! let schemas = SchemaCatalog::new();
//!
//! let mut builder = BusBuilder::new("orders");
//! BusConfigurator::new(&section, &registry, &schemas)
//!     .configure_endpoint("orders", &mut builder)
//!     .unwrap();
//!
//! let bus = builder.build(Arc::new(MockFactory));
//! bus.start().await.unwrap();
//! assert!(bus.can_receive(&MessageLabel::new("order.created")).await.unwrap());
//! bus.stop().await;
//! # });
//! ```
//!
//! ## Internal architecture map
//!
//! - API facade: outward [`Bus`] surface and declarative-tree lookups
//! - Control plane: registry, option tree, builder, and configurator
//! - Data plane: connection pool, listeners, and receivers
//! - Routing: consumer/validator seams, lifestyles, route table, dynamic
//!   outgoing resolution
//! - Runtime: bounded dispatch of per-message worker tasks
//!
//! ## Observability model
//!
//! The crate uses `tracing` for logs/events. Library code emits events/spans
//! and does not unconditionally initialize a global subscriber. Binaries and
//! tests are responsible for one-time `tracing_subscriber` initialization at
//! process boundaries.

mod errors;
pub use errors::{BusError, ResolutionError, TransportError, ValidationError};

mod expires;
pub use expires::{Expires, ExpiresParseError};

mod label;
pub use label::MessageLabel;

mod message;
pub use message::{Delivery, Headers, Payload, SchemaCatalog, SchemaId};

pub mod transport;
pub use transport::{Qos, SubscriptionEndpoint, SubscriptionOptions};

#[doc(hidden)]
pub mod observability;

mod control_plane;
pub use control_plane::builder::{BusBuilder, EndpointDefaults, DYNAMIC_ROUTE_KEY};
pub use control_plane::configurator::{
    BusConfigurator, DEFAULT_PARALLELISM_LEVEL, DEFAULT_PREFETCH_COUNT, DEFAULT_PREFETCH_SIZE,
};
pub use control_plane::options::{
    CallbackEndpointDeclaration, DynamicDeclaration, EndpointDeclaration, EndpointsSection,
    IncomingDeclaration, Lifestyle, OutgoingDeclaration, QosDeclaration, ValidatorDeclaration,
};
pub use control_plane::registry::{
    BusEvent, CapabilityTag, Component, ComponentRegistry, ConnectionStringProvider,
    LifecycleHandler, ProducerSelectorBuilder,
};

mod data_plane;
pub use data_plane::connection_pool::{Connection, ConnectionPool};
pub use data_plane::listener::{
    CompatibilityKey, Listener, ListenerOptions, StopReason, StoppedEvent,
};
pub use data_plane::receiver::{
    ListenerRegistrationHook, Receiver, ReceiverConfiguration, ReceiverOptions,
};

mod routing;
pub use routing::consumer::{
    ConsumerError, ConsumerFactory, DelegatedConsumer, FailedDeliveryStrategy, LazyConsumer,
    MessageConsumer, PayloadValidator, ValidatorGroup,
};
pub use routing::dynamic::{DynamicRouteResolver, RouteResolver, RouteTarget};
pub use routing::route_table::{RequestConfig, ResolvedRoute, RouteTable, SenderRoute};

mod runtime;

pub mod api;
pub use api::bus::Bus;
