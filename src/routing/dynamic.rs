//! Publish-time route resolution for dynamic outgoing endpoints.

use crate::label::MessageLabel;
use tracing::debug;

const COMPONENT: &str = "dynamic_routing";

/// Destination resolved for one outgoing message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RouteTarget {
    /// Exchange the message should be published to.
    pub exchange: String,
}

/// Resolves a destination from the label of the message being published.
///
/// Registered against the catch-all route of a dynamic outgoing endpoint; the
/// concrete label is only known at publish time.
pub trait RouteResolver: Send + Sync {
    /// Picks the destination for `label`, or `None` when the label cannot be
    /// routed.
    fn resolve(&self, label: &MessageLabel) -> Option<RouteTarget>;
}

/// Default resolver: the label text names the destination exchange.
#[derive(Clone, Copy, Debug, Default)]
pub struct DynamicRouteResolver;

impl RouteResolver for DynamicRouteResolver {
    fn resolve(&self, label: &MessageLabel) -> Option<RouteTarget> {
        if label.is_any() {
            return None;
        }
        debug!(
            component = COMPONENT,
            label = %label,
            "resolved dynamic route from message label"
        );
        Some(RouteTarget {
            exchange: label.as_str().to_string(),
        })
    }
}
