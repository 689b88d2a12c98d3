//! Outgoing route set and publish-side lookups.

use crate::label::MessageLabel;
use crate::routing::dynamic::{RouteResolver, RouteTarget};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// One configured outgoing route.
#[derive(Clone)]
pub struct SenderRoute {
    /// Route key within its endpoint declaration.
    pub key: String,
    /// Label messages on this route are published under.
    pub label: MessageLabel,
    /// Whether publishes wait for broker confirmation.
    pub confirm: bool,
    /// Whether messages are published persistently.
    pub persist: bool,
    /// Per-message time-to-live.
    pub ttl: Option<Duration>,
    /// Whether the endpoint's default callback endpoint answers requests on
    /// this route.
    pub callback_default: bool,
    /// Request timeout for request/reply use of the route.
    pub timeout: Option<Duration>,
    /// Effective broker connection string for this route.
    pub connection_string: String,
    /// Whether the route shares a pooled connection.
    pub reuse_connection: bool,
    /// Publish-time resolver; present on catch-all routes.
    pub resolver: Option<Arc<dyn RouteResolver>>,
}

impl fmt::Debug for SenderRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenderRoute")
            .field("key", &self.key)
            .field("label", &self.label)
            .field("confirm", &self.confirm)
            .field("persist", &self.persist)
            .field("connection_string", &self.connection_string)
            .field("dynamic", &self.resolver.is_some())
            .finish()
    }
}

/// Delivery options a request/reply caller needs for one route.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RequestConfig {
    /// Request timeout.
    pub timeout: Option<Duration>,
    /// Whether the request is published persistently.
    pub persist: bool,
    /// Per-message time-to-live.
    pub ttl: Option<Duration>,
}

/// A route pick for one concrete label.
#[derive(Clone, Debug)]
pub struct ResolvedRoute {
    /// The configured route that matched.
    pub route: SenderRoute,
    /// Destination; resolved at publish time for catch-all routes.
    pub target: RouteTarget,
}

/// The outgoing half of a materialized endpoint.
#[derive(Clone, Debug, Default)]
pub struct RouteTable {
    routes: Vec<SenderRoute>,
}

impl RouteTable {
    /// Builds a table over the configured routes.
    pub fn new(routes: Vec<SenderRoute>) -> Self {
        Self { routes }
    }

    /// All configured routes, in declaration order.
    pub fn routes(&self) -> &[SenderRoute] {
        &self.routes
    }

    /// Finds the route for `label`.
    ///
    /// An exact label match wins; otherwise a catch-all route resolves the
    /// destination from the label at lookup time.
    pub fn find(&self, label: &MessageLabel) -> Option<ResolvedRoute> {
        if let Some(route) = self.routes.iter().find(|route| &route.label == label) {
            return Some(ResolvedRoute {
                route: route.clone(),
                target: RouteTarget {
                    exchange: route.label.as_str().to_string(),
                },
            });
        }

        self.routes
            .iter()
            .filter(|route| route.label.is_any())
            .find_map(|route| {
                let resolver = route.resolver.as_ref()?;
                let target = resolver.resolve(label)?;
                Some(ResolvedRoute {
                    route: route.clone(),
                    target,
                })
            })
    }

    /// Request options for the route registered under `key`.
    pub fn request_config(&self, key: &str) -> Option<RequestConfig> {
        self.routes
            .iter()
            .find(|route| route.key == key)
            .map(|route| RequestConfig {
                timeout: route.timeout,
                persist: route.persist,
                ttl: route.ttl,
            })
    }
}
