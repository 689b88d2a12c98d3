//! Endpoint materializer: walks the declarative tree and writes an
//! imperative configuration into a [`BusBuilder`].

use crate::control_plane::builder::{BusBuilder, EndpointDefaults};
use crate::control_plane::options::{
    EndpointDeclaration, EndpointsSection, IncomingDeclaration, Lifestyle,
};
use crate::control_plane::registry::{
    CapabilityTag, Component, ComponentRegistry, ConnectionStringProvider,
};
use crate::data_plane::receiver::{ReceiverConfiguration, ReceiverOptions};
use crate::errors::BusError;
use crate::label::MessageLabel;
use crate::message::{SchemaCatalog, SchemaId};
use crate::observability::events;
use crate::routing::consumer::{
    DelegatedConsumer, LazyConsumer, MessageConsumer, PayloadValidator,
};
use crate::routing::route_table::SenderRoute;
use crate::transport::{Qos, SubscriptionOptions};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const COMPONENT: &str = "configurator";

/// Fallback prefetch count when neither route nor endpoint declare one.
pub const DEFAULT_PREFETCH_COUNT: u16 = 50;
/// Fallback prefetch size when neither route nor endpoint declare one.
pub const DEFAULT_PREFETCH_SIZE: u32 = 0;
/// Fallback dispatch worker count.
pub const DEFAULT_PARALLELISM_LEVEL: u32 = 1;

fn pinpoint(context: impl fmt::Display, err: impl fmt::Display) -> BusError {
    BusError::configuration(format!("{context}: {err}"))
}

fn effective_connection_string(
    provider: Option<&dyn ConnectionStringProvider>,
    label: &MessageLabel,
    route_override: Option<&String>,
    endpoint_connection_string: &str,
) -> String {
    provider
        .and_then(|provider| provider.connection_string_for(label))
        .or_else(|| route_override.cloned())
        .unwrap_or_else(|| endpoint_connection_string.to_string())
}

/// Materializes declared endpoints against a component registry and a schema
/// catalog. Owns nothing at runtime: it writes into builders and exits.
pub struct BusConfigurator<'a> {
    section: &'a EndpointsSection,
    registry: &'a ComponentRegistry,
    schemas: &'a SchemaCatalog,
}

impl<'a> BusConfigurator<'a> {
    /// Builds a configurator over its inputs.
    pub fn new(
        section: &'a EndpointsSection,
        registry: &'a ComponentRegistry,
        schemas: &'a SchemaCatalog,
    ) -> Self {
        Self {
            section,
            registry,
            schemas,
        }
    }

    /// Materializes the endpoint named `endpoint_name` into `builder`.
    pub fn configure_endpoint(
        &self,
        endpoint_name: &str,
        builder: &mut BusBuilder,
    ) -> Result<(), BusError> {
        let endpoint = self.section.endpoint(endpoint_name).ok_or_else(|| {
            BusError::configuration(format!("endpoint `{endpoint_name}` is not declared"))
        })?;

        self.apply_endpoint_options(endpoint, builder)?;
        let provider = self.resolve_connection_string_provider(endpoint)?;

        if endpoint.dynamic.map(|dynamic| dynamic.outgoing).unwrap_or(false) {
            builder.enable_dynamic_outgoing();
        }

        self.register_validators(endpoint, builder)?;
        self.add_outgoing_routes(endpoint, provider.as_deref(), builder);
        for route in &endpoint.incoming {
            self.add_incoming_route(endpoint, route, provider.as_deref(), builder)?;
        }

        info!(
            event = events::ENDPOINT_MATERIALIZED,
            component = COMPONENT,
            endpoint = %endpoint.name,
            outgoing = endpoint.outgoing.len(),
            incoming = endpoint.incoming.len(),
            "endpoint configuration materialized"
        );
        Ok(())
    }

    fn apply_endpoint_options(
        &self,
        endpoint: &EndpointDeclaration,
        builder: &mut BusBuilder,
    ) -> Result<(), BusError> {
        builder.set_endpoint_name(&endpoint.name);
        builder.set_connection_string(&endpoint.connection_string);
        builder.exclude_headers(endpoint.excluded_headers.clone());
        if let Some(reuse) = endpoint.reuse_connection {
            builder.set_reuse_connection(reuse);
        }

        if let Some(handler_name) = &endpoint.lifecycle_handler {
            let component = self
                .registry
                .resolve(handler_name, &CapabilityTag::LifecycleHandler)
                .map_err(|err| pinpoint(format_args!("endpoint `{}`", endpoint.name), err))?;
            if let Component::LifecycleHandler(handler) = component {
                builder.set_lifecycle_handler(handler);
            }
        }

        builder.set_defaults(EndpointDefaults {
            parallelism_level: endpoint.parallelism_level,
            prefetch_count: endpoint.qos.and_then(|qos| qos.prefetch_count),
            prefetch_size: endpoint.qos.and_then(|qos| qos.prefetch_size),
            fault_queue_ttl: endpoint.fault_queue_ttl.map(Duration::from_secs),
            fault_queue_limit: endpoint.fault_queue_limit,
            queue_limit: endpoint.queue_limit,
            queue_max_length_bytes: endpoint.queue_max_length_bytes,
        });
        Ok(())
    }

    fn resolve_connection_string_provider(
        &self,
        endpoint: &EndpointDeclaration,
    ) -> Result<Option<Arc<dyn ConnectionStringProvider>>, BusError> {
        let Some(provider_name) = &endpoint.connection_string_provider else {
            return Ok(None);
        };
        let component = self
            .registry
            .resolve(provider_name, &CapabilityTag::ConnectionStringProvider)
            .map_err(|err| pinpoint(format_args!("endpoint `{}`", endpoint.name), err))?;
        match component {
            Component::ConnectionStringProvider(provider) => Ok(Some(provider)),
            _ => Ok(None),
        }
    }

    fn register_validators(
        &self,
        endpoint: &EndpointDeclaration,
        builder: &mut BusBuilder,
    ) -> Result<(), BusError> {
        for declaration in &endpoint.validators {
            let capability = if declaration.is_group {
                CapabilityTag::ValidatorGroup
            } else {
                CapabilityTag::Validator
            };
            let component = self
                .registry
                .resolve(&declaration.name, &capability)
                .map_err(|err| {
                    pinpoint(
                        format_args!(
                            "endpoint `{}`, validator `{}`",
                            endpoint.name, declaration.name
                        ),
                        err,
                    )
                })?;
            match component {
                Component::Validator(validator) => {
                    builder.register_validator(validator);
                }
                Component::ValidatorGroup(group) => {
                    builder.register_validator(group);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn add_outgoing_routes(
        &self,
        endpoint: &EndpointDeclaration,
        provider: Option<&dyn ConnectionStringProvider>,
        builder: &mut BusBuilder,
    ) {
        for route in &endpoint.outgoing {
            let label = MessageLabel::new(&route.label);
            let connection_string = effective_connection_string(
                provider,
                &label,
                route.connection_string.as_ref(),
                &endpoint.connection_string,
            );
            builder.add_route(SenderRoute {
                key: route.key.clone(),
                label,
                confirm: route.confirm,
                persist: route.persist,
                ttl: route.ttl.map(Duration::from_secs),
                callback_default: route
                    .callback_endpoint
                    .map(|callback| callback.default)
                    .unwrap_or(false),
                timeout: route.timeout.map(Duration::from_secs),
                connection_string,
                reuse_connection: route
                    .reuse_connection
                    .or(endpoint.reuse_connection)
                    .unwrap_or(builder.reuse_connection()),
                resolver: None,
            });
        }
    }

    fn add_incoming_route(
        &self,
        endpoint: &EndpointDeclaration,
        route: &IncomingDeclaration,
        provider: Option<&dyn ConnectionStringProvider>,
        builder: &mut BusBuilder,
    ) -> Result<(), BusError> {
        let context = format!("endpoint `{}`, incoming `{}`", endpoint.name, route.key);
        let label = MessageLabel::new(&route.label);

        let qos = Qos {
            prefetch_count: route
                .qos
                .and_then(|qos| qos.prefetch_count)
                .or(endpoint.qos.and_then(|qos| qos.prefetch_count))
                .unwrap_or(DEFAULT_PREFETCH_COUNT),
            prefetch_size: route
                .qos
                .and_then(|qos| qos.prefetch_size)
                .or(endpoint.qos.and_then(|qos| qos.prefetch_size))
                .unwrap_or(DEFAULT_PREFETCH_SIZE),
        };
        let parallelism_level = route
            .parallelism_level
            .or(endpoint.parallelism_level)
            .unwrap_or(DEFAULT_PARALLELISM_LEVEL);
        let connection_string = effective_connection_string(
            provider,
            &label,
            route.connection_string.as_ref(),
            &endpoint.connection_string,
        );
        let reuse_connection = route
            .reuse_connection
            .or(endpoint.reuse_connection)
            .unwrap_or(builder.reuse_connection());

        let schema = match &route.r#type {
            Some(declared) => Some(
                self.schemas
                    .resolve(declared)
                    .map_err(|err| pinpoint(&context, err))?,
            ),
            None => None,
        };

        let consumer = self.materialize_consumer(route, schema.clone(), &context)?;
        let validator = self.bind_validator(route, schema.as_ref(), builder, &context)?;

        builder.add_receiver(ReceiverConfiguration {
            options: ReceiverOptions {
                endpoint_name: endpoint.name.clone(),
                label: label.clone(),
                connection_string,
                reuse_connection,
                qos,
                parallelism_level,
                requires_accept: route.requires_accept,
                failed_delivery: builder.failed_delivery_strategy(),
                excluded_headers: BTreeSet::new(),
                subscription: SubscriptionOptions {
                    labels: vec![label.clone()],
                    queue_limit: route.queue_limit.or(endpoint.queue_limit),
                    queue_max_length_bytes: route
                        .queue_max_length_bytes
                        .or(endpoint.queue_max_length_bytes),
                    fault_queue_ttl: None,
                    fault_queue_limit: None,
                },
            },
            validator,
            consumers: vec![(label, consumer)],
        });
        Ok(())
    }

    fn materialize_consumer(
        &self,
        route: &IncomingDeclaration,
        schema: Option<SchemaId>,
        context: &str,
    ) -> Result<Arc<dyn MessageConsumer>, BusError> {
        let component = self
            .registry
            .resolve(&route.react, &CapabilityTag::Consumer(schema))
            .map_err(|err| pinpoint(context, err))?;
        let Component::Consumer { factory, .. } = component else {
            return Err(pinpoint(context, "registry returned a non-consumer component"));
        };

        Ok(match route.lifestyle {
            Lifestyle::Normal => factory(),
            Lifestyle::Lazy => Arc::new(LazyConsumer::new(factory)),
            Lifestyle::Delegated => Arc::new(DelegatedConsumer::new(factory)),
        })
    }

    fn bind_validator(
        &self,
        route: &IncomingDeclaration,
        schema: Option<&SchemaId>,
        builder: &BusBuilder,
        context: &str,
    ) -> Result<Option<Arc<dyn PayloadValidator>>, BusError> {
        let Some(validator_name) = &route.validate else {
            return Ok(builder.find_validator(schema));
        };

        let component = self
            .registry
            .resolve(validator_name, &CapabilityTag::Validator)
            .map_err(|err| pinpoint(context, err))?;
        let Component::Validator(validator) = component else {
            return Err(pinpoint(context, "registry returned a non-validator component"));
        };

        if let (Some(validator_schema), Some(route_schema)) = (validator.schema(), schema) {
            if &validator_schema != route_schema {
                return Err(pinpoint(
                    context,
                    format_args!(
                        "validator `{validator_name}` validates `{validator_schema}` but the route payload is `{route_schema}`"
                    ),
                ));
            }
        }
        Ok(Some(validator))
    }
}
