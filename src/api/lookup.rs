//! Configuration lookups over the declarative endpoint tree.

use crate::control_plane::options::{EndpointDeclaration, EndpointsSection};
use crate::errors::BusError;
use crate::label::MessageLabel;
use crate::routing::route_table::RequestConfig;
use std::time::Duration;

fn not_found(endpoint: &str, key: &str) -> BusError {
    BusError::NotFound {
        endpoint: endpoint.to_string(),
        key: key.to_string(),
    }
}

/// Label of the route registered under `key` on `endpoint_name`.
///
/// Outgoing routes are searched first, then incoming routes.
pub fn get_event(
    section: &EndpointsSection,
    endpoint_name: &str,
    key: &str,
) -> Result<MessageLabel, BusError> {
    let endpoint = section
        .endpoint(endpoint_name)
        .ok_or_else(|| not_found(endpoint_name, key))?;

    endpoint
        .outgoing
        .iter()
        .find(|route| route.key == key)
        .map(|route| MessageLabel::new(&route.label))
        .or_else(|| {
            endpoint
                .incoming
                .iter()
                .find(|route| route.key == key)
                .map(|route| MessageLabel::new(&route.label))
        })
        .ok_or_else(|| not_found(endpoint_name, key))
}

/// Request options of the outgoing route registered under `key`.
///
/// Only outgoing routes are searched.
pub fn get_request_config(
    section: &EndpointsSection,
    endpoint_name: &str,
    key: &str,
) -> Result<RequestConfig, BusError> {
    let endpoint = section
        .endpoint(endpoint_name)
        .ok_or_else(|| not_found(endpoint_name, key))?;

    endpoint
        .outgoing
        .iter()
        .find(|route| route.key == key)
        .map(|route| RequestConfig {
            timeout: route.timeout.map(Duration::from_secs),
            persist: route.persist,
            ttl: route.ttl.map(Duration::from_secs),
        })
        .ok_or_else(|| not_found(endpoint_name, key))
}

/// All declared endpoints, in declaration order.
pub fn endpoints(section: &EndpointsSection) -> impl Iterator<Item = &EndpointDeclaration> {
    section.endpoints.iter()
}
