//! Declarative endpoint option tree.
//!
//! The tree arrives already deserialized from whatever configuration source
//! the host application uses; field names are wire-compatible with the
//! original schema.

use serde::Deserialize;
use std::collections::BTreeSet;

/// Root section enumerating the declared endpoints.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointsSection {
    /// Declared endpoints, keyed by unique name.
    #[serde(default)]
    pub endpoints: Vec<EndpointDeclaration>,
}

impl EndpointsSection {
    /// Finds the declaration for `name`.
    pub fn endpoint(&self, name: &str) -> Option<&EndpointDeclaration> {
        self.endpoints.iter().find(|endpoint| endpoint.name == name)
    }
}

/// One declared endpoint: routes, connection string, and policies.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointDeclaration {
    /// Unique endpoint id within the configuration.
    pub name: String,
    /// Comma-separated broker URLs.
    pub connection_string: String,
    /// Headers stripped from deliveries before dispatch.
    #[serde(default)]
    pub excluded_headers: BTreeSet<String>,
    /// Tri-state connection reuse; absent inherits the builder default.
    #[serde(default)]
    pub reuse_connection: Option<bool>,
    /// Lifecycle handler name, resolved via the component registry.
    #[serde(default)]
    pub lifecycle_handler: Option<String>,
    /// Default dispatch worker count for incoming routes.
    #[serde(default)]
    pub parallelism_level: Option<u32>,
    /// Fault queue message time-to-live, in seconds.
    #[serde(default)]
    pub fault_queue_ttl: Option<u64>,
    /// Fault queue length limit.
    #[serde(default)]
    pub fault_queue_limit: Option<u32>,
    /// Default subscription queue message limit.
    #[serde(default)]
    pub queue_limit: Option<u32>,
    /// Default subscription queue byte limit.
    #[serde(default)]
    pub queue_max_length_bytes: Option<u64>,
    /// Dynamic routing switches.
    #[serde(default)]
    pub dynamic: Option<DynamicDeclaration>,
    /// Endpoint-level QoS defaults.
    #[serde(default)]
    pub qos: Option<QosDeclaration>,
    /// Validators registered for the endpoint.
    #[serde(default)]
    pub validators: Vec<ValidatorDeclaration>,
    /// Outgoing routes.
    #[serde(default)]
    pub outgoing: Vec<OutgoingDeclaration>,
    /// Incoming routes.
    #[serde(default)]
    pub incoming: Vec<IncomingDeclaration>,
    /// Per-label connection string provider name.
    #[serde(default)]
    pub connection_string_provider: Option<String>,
}

/// Dynamic routing switches for an endpoint.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicDeclaration {
    /// Enables the catch-all outgoing route.
    #[serde(default)]
    pub outgoing: bool,
}

/// Declared QoS values; absent fields fall through the precedence chain.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QosDeclaration {
    /// Prefetch message count.
    #[serde(default)]
    pub prefetch_count: Option<u16>,
    /// Prefetch byte size.
    #[serde(default)]
    pub prefetch_size: Option<u32>,
}

/// Reference to a validator or validator group in the registry.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorDeclaration {
    /// Registry name of the validator.
    pub name: String,
    /// Whether the name designates a validator group.
    #[serde(default)]
    pub is_group: bool,
}

/// Declared default-callback marker for an outgoing route.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackEndpointDeclaration {
    /// Whether the endpoint's default callback endpoint answers this route.
    #[serde(default)]
    pub default: bool,
}

/// One declared outgoing route.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingDeclaration {
    /// Route key, unique within the endpoint.
    pub key: String,
    /// Label the route publishes under.
    pub label: String,
    /// Whether publishes wait for broker confirmation.
    #[serde(default)]
    pub confirm: bool,
    /// Whether messages are published persistently.
    #[serde(default)]
    pub persist: bool,
    /// Per-message time-to-live, in seconds.
    #[serde(default)]
    pub ttl: Option<u64>,
    /// Callback endpoint options.
    #[serde(default)]
    pub callback_endpoint: Option<CallbackEndpointDeclaration>,
    /// Request timeout, in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Route-level connection string override.
    #[serde(default)]
    pub connection_string: Option<String>,
    /// Route-level connection reuse override.
    #[serde(default)]
    pub reuse_connection: Option<bool>,
}

/// Instantiation policy for a declared consumer.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
pub enum Lifestyle {
    /// Factory invoked once at registration.
    #[default]
    Normal,
    /// Factory invoked on the first message; the instance is memoized.
    Lazy,
    /// Factory invoked once per message.
    Delegated,
}

/// One declared incoming route.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingDeclaration {
    /// Route key, unique within the endpoint.
    pub key: String,
    /// Label the subscription consumes.
    pub label: String,
    /// Consumer factory name, resolved via the component registry.
    pub react: String,
    /// Validator name bound to the route.
    #[serde(default)]
    pub validate: Option<String>,
    /// Declared payload type name; absent means untyped-dynamic.
    #[serde(default)]
    pub r#type: Option<String>,
    /// Consumer instantiation policy.
    #[serde(default)]
    pub lifestyle: Lifestyle,
    /// Route-level QoS overrides.
    #[serde(default)]
    pub qos: Option<QosDeclaration>,
    /// Route-level dispatch worker count.
    #[serde(default)]
    pub parallelism_level: Option<u32>,
    /// Route-level queue message limit.
    #[serde(default)]
    pub queue_limit: Option<u32>,
    /// Route-level queue byte limit.
    #[serde(default)]
    pub queue_max_length_bytes: Option<u64>,
    /// Whether the consumer must explicitly accept deliveries.
    #[serde(default)]
    pub requires_accept: bool,
    /// Route-level connection string override.
    #[serde(default)]
    pub connection_string: Option<String>,
    /// Route-level connection reuse override.
    #[serde(default)]
    pub reuse_connection: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::{EndpointsSection, Lifestyle};
    use serde_json::json;

    #[test]
    fn deserializes_a_full_endpoint_declaration() {
        let section: EndpointsSection = serde_json::from_value(json!({
            "endpoints": [{
                "name": "orders",
                "connectionString": "amqp://h1,amqp://h2",
                "excludedHeaders": ["x-internal"],
                "reuseConnection": true,
                "lifecycleHandler": "orders-lifecycle",
                "parallelismLevel": 4,
                "faultQueueTtl": 600,
                "faultQueueLimit": 1000,
                "queueLimit": 5000,
                "queueMaxLengthBytes": 1048576,
                "dynamic": { "outgoing": true },
                "qos": { "prefetchCount": 8, "prefetchSize": 0 },
                "validators": [{ "name": "audit", "isGroup": true }],
                "connectionStringProvider": "per-tenant",
                "outgoing": [{
                    "key": "created",
                    "label": "order.created",
                    "confirm": true,
                    "persist": true,
                    "ttl": 300,
                    "callbackEndpoint": { "default": true },
                    "timeout": 30
                }],
                "incoming": [{
                    "key": "paid",
                    "label": "order.paid",
                    "react": "on-order-paid",
                    "validate": "order-validator",
                    "type": "billing.OrderPaid",
                    "lifestyle": "Lazy",
                    "qos": { "prefetchCount": 1 },
                    "requiresAccept": true
                }]
            }]
        }))
        .unwrap();

        let endpoint = section.endpoint("orders").unwrap();
        assert_eq!(endpoint.connection_string, "amqp://h1,amqp://h2");
        assert_eq!(endpoint.reuse_connection, Some(true));
        assert!(endpoint.dynamic.map(|dynamic| dynamic.outgoing).unwrap_or(false));
        assert_eq!(endpoint.qos.unwrap().prefetch_count, Some(8));
        assert!(endpoint.validators[0].is_group);

        let outgoing = &endpoint.outgoing[0];
        assert!(outgoing.confirm);
        assert!(outgoing.callback_endpoint.unwrap().default);

        let incoming = &endpoint.incoming[0];
        assert_eq!(incoming.lifestyle, Lifestyle::Lazy);
        assert_eq!(incoming.qos.unwrap().prefetch_count, Some(1));
        assert_eq!(incoming.qos.unwrap().prefetch_size, None);
        assert!(incoming.requires_accept);
    }

    #[test]
    fn minimal_incoming_route_defaults_are_permissive() {
        let section: EndpointsSection = serde_json::from_value(json!({
            "endpoints": [{
                "name": "minimal",
                "connectionString": "amqp://h1",
                "incoming": [{ "key": "k", "label": "L", "react": "C" }]
            }]
        }))
        .unwrap();

        let incoming = &section.endpoint("minimal").unwrap().incoming[0];
        assert_eq!(incoming.lifestyle, Lifestyle::Normal);
        assert!(incoming.r#type.is_none());
        assert!(!incoming.requires_accept);
        assert!(incoming.qos.is_none());
    }

    #[test]
    fn missing_endpoint_lookup_returns_none() {
        let section = EndpointsSection::default();
        assert!(section.endpoint("nope").is_none());
    }
}
