//! Imperative bus builder the configurator writes into.

use crate::api::bus::Bus;
use crate::control_plane::registry::{LifecycleHandler, ProducerSelectorBuilder};
use crate::data_plane::connection_pool::ConnectionPool;
use crate::data_plane::listener::{CompatibilityKey, Listener};
use crate::data_plane::receiver::{ListenerRegistrationHook, Receiver, ReceiverConfiguration};
use crate::errors::BusError;
use crate::label::MessageLabel;
use crate::message::SchemaId;
use crate::observability::fields;
use crate::routing::consumer::{FailedDeliveryStrategy, PayloadValidator};
use crate::routing::dynamic::{DynamicRouteResolver, RouteResolver};
use crate::routing::route_table::{RouteTable, SenderRoute};
use crate::transport::ConnectionFactory;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Route key the catch-all dynamic route is registered under.
pub const DYNAMIC_ROUTE_KEY: &str = "dynamic";

/// Endpoint-level defaults the configurator records before adding routes.
#[derive(Clone, Debug, Default)]
pub struct EndpointDefaults {
    /// Default dispatch worker count.
    pub parallelism_level: Option<u32>,
    /// Default prefetch message count.
    pub prefetch_count: Option<u16>,
    /// Default prefetch byte size.
    pub prefetch_size: Option<u32>,
    /// Fault queue message time-to-live.
    pub fault_queue_ttl: Option<Duration>,
    /// Fault queue length limit.
    pub fault_queue_limit: Option<u32>,
    /// Default subscription queue message limit.
    pub queue_limit: Option<u32>,
    /// Default subscription queue byte limit.
    pub queue_max_length_bytes: Option<u64>,
}

/// Mutable endpoint configuration assembled by the configurator and turned
/// into a running [`Bus`].
pub struct BusBuilder {
    endpoint_name: String,
    connection_string: String,
    reuse_connection: bool,
    excluded_headers: BTreeSet<String>,
    lifecycle_handler: Option<Arc<dyn LifecycleHandler>>,
    failed_delivery: FailedDeliveryStrategy,
    defaults: EndpointDefaults,
    validators: Vec<Arc<dyn PayloadValidator>>,
    producer_selector: Option<Arc<dyn ProducerSelectorBuilder>>,
    receivers: Vec<ReceiverConfiguration>,
    routes: Vec<SenderRoute>,
}

impl BusBuilder {
    /// An empty builder for the named endpoint.
    pub fn new(endpoint_name: impl Into<String>) -> Self {
        Self {
            endpoint_name: endpoint_name.into(),
            connection_string: String::new(),
            reuse_connection: false,
            excluded_headers: BTreeSet::new(),
            lifecycle_handler: None,
            failed_delivery: FailedDeliveryStrategy::default(),
            defaults: EndpointDefaults::default(),
            validators: Vec::new(),
            producer_selector: None,
            receivers: Vec::new(),
            routes: Vec::new(),
        }
    }

    /// Renames the endpoint.
    pub fn set_endpoint_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.endpoint_name = name.into();
        self
    }

    /// Endpoint name the builder targets.
    pub fn endpoint_name(&self) -> &str {
        &self.endpoint_name
    }

    /// Sets the endpoint-level connection string.
    pub fn set_connection_string(&mut self, connection_string: impl Into<String>) -> &mut Self {
        self.connection_string = connection_string.into();
        self
    }

    /// Endpoint-level connection string.
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Sets the endpoint-level connection reuse default.
    pub fn set_reuse_connection(&mut self, reuse: bool) -> &mut Self {
        self.reuse_connection = reuse;
        self
    }

    /// Endpoint-level connection reuse default.
    pub fn reuse_connection(&self) -> bool {
        self.reuse_connection
    }

    /// Headers stripped from deliveries on every subscription.
    pub fn exclude_headers(&mut self, headers: BTreeSet<String>) -> &mut Self {
        self.excluded_headers = headers;
        self
    }

    /// Sets the endpoint lifecycle handler.
    pub fn set_lifecycle_handler(&mut self, handler: Arc<dyn LifecycleHandler>) -> &mut Self {
        self.lifecycle_handler = Some(handler);
        self
    }

    /// Sets the policy applied to rejected messages on every subscription.
    pub fn set_failed_delivery_strategy(&mut self, strategy: FailedDeliveryStrategy) -> &mut Self {
        self.failed_delivery = strategy;
        self
    }

    /// Policy applied to rejected messages.
    pub fn failed_delivery_strategy(&self) -> FailedDeliveryStrategy {
        self.failed_delivery
    }

    /// Records endpoint-level defaults routes fall back to.
    pub fn set_defaults(&mut self, defaults: EndpointDefaults) -> &mut Self {
        self.defaults = defaults;
        self
    }

    /// Endpoint-level defaults.
    pub fn defaults(&self) -> &EndpointDefaults {
        &self.defaults
    }

    /// Registers an endpoint-level validator.
    pub fn register_validator(&mut self, validator: Arc<dyn PayloadValidator>) -> &mut Self {
        self.validators.push(validator);
        self
    }

    /// Finds a registered validator for `schema`: first an exact schema
    /// match, then a schema-agnostic one.
    pub fn find_validator(&self, schema: Option<&SchemaId>) -> Option<Arc<dyn PayloadValidator>> {
        self.validators
            .iter()
            .find(|validator| validator.schema().as_ref() == schema && schema.is_some())
            .or_else(|| {
                self.validators
                    .iter()
                    .find(|validator| validator.schema().is_none())
            })
            .cloned()
    }

    /// Installs the builder used to derive the dynamic route resolver.
    pub fn set_producer_selector_builder(
        &mut self,
        selector: Arc<dyn ProducerSelectorBuilder>,
    ) -> &mut Self {
        self.producer_selector = Some(selector);
        self
    }

    /// Registers the catch-all outgoing route resolved at publish time.
    pub fn enable_dynamic_outgoing(&mut self) -> &mut Self {
        let labels: Vec<MessageLabel> = self.routes.iter().map(|route| route.label.clone()).collect();
        let resolver: Arc<dyn RouteResolver> = match &self.producer_selector {
            Some(selector) => selector.build(&labels),
            None => Arc::new(DynamicRouteResolver),
        };
        self.routes.push(SenderRoute {
            key: DYNAMIC_ROUTE_KEY.to_string(),
            label: MessageLabel::any(),
            confirm: false,
            persist: false,
            ttl: None,
            callback_default: false,
            timeout: None,
            connection_string: self.connection_string.clone(),
            reuse_connection: self.reuse_connection,
            resolver: Some(resolver),
        });
        self
    }

    /// Adds a fully computed outgoing route.
    pub fn add_route(&mut self, route: SenderRoute) -> &mut Self {
        self.routes.push(route);
        self
    }

    /// Configured outgoing routes.
    pub fn routes(&self) -> &[SenderRoute] {
        &self.routes
    }

    /// Adds a subscription; endpoint-level name, excluded headers, fault
    /// queue options, and failed-delivery policy are folded in here.
    pub fn add_receiver(&mut self, mut configuration: ReceiverConfiguration) -> &mut Self {
        configuration.options.endpoint_name = self.endpoint_name.clone();
        configuration.options.excluded_headers = self.excluded_headers.clone();
        configuration.options.failed_delivery = self.failed_delivery;
        configuration.options.subscription.fault_queue_ttl = self.defaults.fault_queue_ttl;
        configuration.options.subscription.fault_queue_limit = self.defaults.fault_queue_limit;
        self.receivers.push(configuration);
        self
    }

    /// Configured subscriptions.
    pub fn receivers(&self) -> &[ReceiverConfiguration] {
        &self.receivers
    }

    /// Turns the configuration into a bus over `factory`.
    pub fn build(self, factory: Arc<dyn ConnectionFactory>) -> Bus {
        let pool = Arc::new(ConnectionPool::new(factory));
        let cancellation = CancellationToken::new();

        let listener_index: Arc<StdMutex<HashMap<(String, String), CompatibilityKey>>> =
            Arc::new(StdMutex::new(HashMap::new()));
        let hook: ListenerRegistrationHook = {
            let listener_index = listener_index.clone();
            Arc::new(move |listener: &Listener| {
                let key = (
                    listener.broker_url().to_string(),
                    listener.queue().to_string(),
                );
                let fingerprint = listener.compatibility_key();
                let mut index = listener_index
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                match index.get(&key) {
                    Some(existing) if *existing != fingerprint => {
                        Err(BusError::configuration(format!(
                            "subscriptions on {} disagree on accept/parallelism/failed-delivery/QoS options",
                            fields::format_listener_key(&key.0, &key.1)
                        )))
                    }
                    _ => {
                        index.insert(key, fingerprint);
                        Ok(())
                    }
                }
            })
        };

        let receivers: Vec<Arc<Receiver>> = self
            .receivers
            .into_iter()
            .map(|configuration| {
                Receiver::new(
                    configuration.options,
                    configuration.validator,
                    configuration.consumers,
                    pool.clone(),
                    Some(hook.clone()),
                    cancellation.child_token(),
                )
            })
            .collect();

        Bus::new(
            self.endpoint_name,
            receivers,
            RouteTable::new(self.routes),
            pool,
            self.lifecycle_handler,
            cancellation,
            listener_index,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{BusBuilder, EndpointDefaults, DYNAMIC_ROUTE_KEY};
    use crate::data_plane::receiver::{ReceiverConfiguration, ReceiverOptions};
    use crate::errors::ValidationError;
    use crate::label::MessageLabel;
    use crate::message::{Delivery, SchemaId};
    use crate::routing::consumer::{FailedDeliveryStrategy, PayloadValidator};
    use crate::transport::{Qos, SubscriptionOptions};
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::Duration;

    struct SchemaBoundValidator {
        schema: SchemaId,
    }

    impl PayloadValidator for SchemaBoundValidator {
        fn schema(&self) -> Option<SchemaId> {
            Some(self.schema.clone())
        }

        fn validate(&self, _delivery: &Delivery) -> Result<(), ValidationError> {
            Ok(())
        }
    }

    struct AnyValidator;

    impl PayloadValidator for AnyValidator {
        fn validate(&self, _delivery: &Delivery) -> Result<(), ValidationError> {
            Ok(())
        }
    }

    fn receiver_configuration(label: &str) -> ReceiverConfiguration {
        ReceiverConfiguration {
            options: ReceiverOptions {
                endpoint_name: String::new(),
                label: MessageLabel::new(label),
                connection_string: "amqp://h1".to_string(),
                reuse_connection: false,
                qos: Qos::default(),
                parallelism_level: 1,
                requires_accept: false,
                failed_delivery: FailedDeliveryStrategy::Requeue,
                excluded_headers: BTreeSet::new(),
                subscription: SubscriptionOptions::default(),
            },
            validator: None,
            consumers: Vec::new(),
        }
    }

    #[test]
    fn add_receiver_folds_in_endpoint_level_options() {
        let mut builder = BusBuilder::new("orders");
        builder
            .exclude_headers(BTreeSet::from(["x-internal".to_string()]))
            .set_failed_delivery_strategy(FailedDeliveryStrategy::DeadLetter)
            .set_defaults(EndpointDefaults {
                fault_queue_ttl: Some(Duration::from_secs(600)),
                fault_queue_limit: Some(1000),
                ..EndpointDefaults::default()
            });
        builder.add_receiver(receiver_configuration("order.created"));

        let configured = &builder.receivers()[0].options;
        assert_eq!(configured.endpoint_name, "orders");
        assert!(configured.excluded_headers.contains("x-internal"));
        assert_eq!(configured.failed_delivery, FailedDeliveryStrategy::DeadLetter);
        assert_eq!(
            configured.subscription.fault_queue_ttl,
            Some(Duration::from_secs(600))
        );
        assert_eq!(configured.subscription.fault_queue_limit, Some(1000));
    }

    #[test]
    fn dynamic_outgoing_registers_a_catch_all_route() {
        let mut builder = BusBuilder::new("orders");
        builder.set_connection_string("amqp://h1");
        builder.enable_dynamic_outgoing();

        let route = &builder.routes()[0];
        assert_eq!(route.key, DYNAMIC_ROUTE_KEY);
        assert!(route.label.is_any());
        assert!(route.resolver.is_some());
        assert_eq!(route.connection_string, "amqp://h1");
    }

    #[test]
    fn find_validator_prefers_schema_match_over_schema_agnostic() {
        let schema = SchemaId::new("billing.OrderCreated");
        let mut builder = BusBuilder::new("orders");
        builder.register_validator(Arc::new(AnyValidator));
        builder.register_validator(Arc::new(SchemaBoundValidator {
            schema: schema.clone(),
        }));

        let found = builder.find_validator(Some(&schema)).unwrap();
        assert_eq!(found.schema(), Some(schema.clone()));

        let fallback = builder.find_validator(Some(&SchemaId::new("other"))).unwrap();
        assert!(fallback.schema().is_none());

        let untyped = builder.find_validator(None).unwrap();
        assert!(untyped.schema().is_none());
    }

    #[test]
    fn find_validator_returns_none_when_nothing_matches() {
        let builder = BusBuilder::new("orders");
        assert!(builder.find_validator(None).is_none());
    }
}
