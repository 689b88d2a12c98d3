//! Capability-indexed component registry for late-bound endpoint collaborators.

use crate::errors::ResolutionError;
use crate::label::MessageLabel;
use crate::message::SchemaId;
use crate::routing::consumer::{ConsumerFactory, PayloadValidator, ValidatorGroup};
use crate::routing::dynamic::RouteResolver;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Lifecycle notification delivered to endpoint lifecycle handlers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BusEvent {
    /// Name of the endpoint the bus serves.
    pub endpoint: String,
}

/// Reacts to bus lifecycle transitions for one endpoint.
#[async_trait]
pub trait LifecycleHandler: Send + Sync {
    /// Called after the bus has started all receivers.
    async fn on_started(&self, event: &BusEvent);

    /// Called before the bus stops its receivers.
    async fn on_stopping(&self, event: &BusEvent);
}

/// Supplies a per-label broker connection string at materialization time.
pub trait ConnectionStringProvider: Send + Sync {
    /// Connection string for `label`, or `None` to fall through to the
    /// route-level and endpoint-level strings.
    fn connection_string_for(&self, label: &MessageLabel) -> Option<String>;
}

/// Builds the publish-time route resolver for a dynamic outgoing endpoint.
pub trait ProducerSelectorBuilder: Send + Sync {
    /// Builds the resolver over the endpoint's declared outgoing labels.
    fn build(&self, labels: &[MessageLabel]) -> Arc<dyn RouteResolver>;
}

/// Semantic discriminator for a registry lookup.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum CapabilityTag {
    /// A consumer factory for the given payload schema (`None` = untyped).
    Consumer(Option<SchemaId>),
    /// A single payload validator.
    Validator,
    /// A named validator group.
    ValidatorGroup,
    /// An endpoint lifecycle handler.
    LifecycleHandler,
    /// A per-label connection string provider.
    ConnectionStringProvider,
    /// A producer selector builder for dynamic routing.
    ProducerSelectorBuilder,
}

impl fmt::Display for CapabilityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityTag::Consumer(Some(schema)) => write!(f, "consumer of `{schema}`"),
            CapabilityTag::Consumer(None) => write!(f, "consumer of untyped payloads"),
            CapabilityTag::Validator => write!(f, "validator"),
            CapabilityTag::ValidatorGroup => write!(f, "validator group"),
            CapabilityTag::LifecycleHandler => write!(f, "lifecycle handler"),
            CapabilityTag::ConnectionStringProvider => write!(f, "connection string provider"),
            CapabilityTag::ProducerSelectorBuilder => write!(f, "producer selector builder"),
        }
    }
}

/// One registered component instance or factory.
#[derive(Clone)]
pub enum Component {
    // Debug is implemented manually below, since several variants hold
    // trait objects that don't implement Debug.
    /// A consumer factory for one payload schema.
    Consumer {
        /// Payload schema the consumer accepts (`None` = untyped).
        schema: Option<SchemaId>,
        /// Factory producing consumer instances.
        factory: ConsumerFactory,
    },
    /// A single payload validator.
    Validator(Arc<dyn PayloadValidator>),
    /// A validator group.
    ValidatorGroup(Arc<ValidatorGroup>),
    /// An endpoint lifecycle handler.
    LifecycleHandler(Arc<dyn LifecycleHandler>),
    /// A per-label connection string provider.
    ConnectionStringProvider(Arc<dyn ConnectionStringProvider>),
    /// A producer selector builder.
    ProducerSelectorBuilder(Arc<dyn ProducerSelectorBuilder>),
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Component::Consumer { schema, .. } => {
                f.debug_struct("Consumer").field("schema", schema).finish()
            }
            Component::Validator(_) => f.write_str("Validator(..)"),
            Component::ValidatorGroup(_) => f.write_str("ValidatorGroup(..)"),
            Component::LifecycleHandler(_) => f.write_str("LifecycleHandler(..)"),
            Component::ConnectionStringProvider(_) => {
                f.write_str("ConnectionStringProvider(..)")
            }
            Component::ProducerSelectorBuilder(_) => f.write_str("ProducerSelectorBuilder(..)"),
        }
    }
}

impl Component {
    fn provides(&self, requested: &CapabilityTag) -> bool {
        match (self, requested) {
            (Component::Consumer { schema, .. }, CapabilityTag::Consumer(requested_schema)) => {
                schema == requested_schema
            }
            (Component::Validator(_), CapabilityTag::Validator) => true,
            (Component::ValidatorGroup(_), CapabilityTag::ValidatorGroup) => true,
            (Component::LifecycleHandler(_), CapabilityTag::LifecycleHandler) => true,
            (Component::ConnectionStringProvider(_), CapabilityTag::ConnectionStringProvider) => {
                true
            }
            (Component::ProducerSelectorBuilder(_), CapabilityTag::ProducerSelectorBuilder) => true,
            _ => false,
        }
    }
}

/// Name-keyed registry the configurator resolves endpoint collaborators from.
///
/// A name may carry several components with distinct capabilities; resolution
/// honors the requested capability.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    components: HashMap<String, Vec<Component>>,
}

impl ComponentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a component under `name`.
    pub fn register(&mut self, name: impl Into<String>, component: Component) {
        self.components.entry(name.into()).or_default().push(component);
    }

    /// Registers a consumer factory for `schema` under `name`.
    pub fn register_consumer(
        &mut self,
        name: impl Into<String>,
        schema: Option<SchemaId>,
        factory: ConsumerFactory,
    ) {
        self.register(name, Component::Consumer { schema, factory });
    }

    /// Registers a validator under `name`.
    pub fn register_validator(
        &mut self,
        name: impl Into<String>,
        validator: Arc<dyn PayloadValidator>,
    ) {
        self.register(name, Component::Validator(validator));
    }

    /// Registers a validator group under `name`.
    pub fn register_validator_group(&mut self, name: impl Into<String>, group: ValidatorGroup) {
        self.register(name, Component::ValidatorGroup(Arc::new(group)));
    }

    /// Registers a lifecycle handler under `name`.
    pub fn register_lifecycle_handler(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn LifecycleHandler>,
    ) {
        self.register(name, Component::LifecycleHandler(handler));
    }

    /// Registers a connection string provider under `name`.
    pub fn register_connection_string_provider(
        &mut self,
        name: impl Into<String>,
        provider: Arc<dyn ConnectionStringProvider>,
    ) {
        self.register(name, Component::ConnectionStringProvider(provider));
    }

    /// Registers a producer selector builder under `name`.
    pub fn register_producer_selector_builder(
        &mut self,
        name: impl Into<String>,
        builder: Arc<dyn ProducerSelectorBuilder>,
    ) {
        self.register(name, Component::ProducerSelectorBuilder(builder));
    }

    /// Resolves the component registered under `name` for `capability`.
    pub fn resolve(
        &self,
        name: &str,
        capability: &CapabilityTag,
    ) -> Result<Component, ResolutionError> {
        let registered = self
            .components
            .get(name)
            .ok_or_else(|| ResolutionError::UnknownName {
                name: name.to_string(),
            })?;

        registered
            .iter()
            .find(|component| component.provides(capability))
            .cloned()
            .ok_or_else(|| ResolutionError::CapabilityMismatch {
                name: name.to_string(),
                requested: capability.to_string(),
            })
    }
}
