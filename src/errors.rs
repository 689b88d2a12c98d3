//! Error taxonomy shared across the configuration, connection, and delivery paths.

use thiserror::Error;

/// Failure to satisfy a `(name, capability)` lookup against the component registry.
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// No component has been registered under the requested name.
    #[error("no component registered under name `{name}`")]
    UnknownName {
        /// The requested registration name.
        name: String,
    },
    /// A component exists under the name but does not provide the requested capability.
    #[error("component `{name}` does not provide capability `{requested}`")]
    CapabilityMismatch {
        /// The requested registration name.
        name: String,
        /// Display form of the requested capability tag.
        requested: String,
    },
}

/// Broker-side transport failures surfaced through the consumed interfaces.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The broker endpoint could not be reached while opening a connection.
    #[error("broker at `{url}` is unreachable: {reason}")]
    BrokerUnreachable {
        /// The broker URL the open was attempted against.
        url: String,
        /// Transport-supplied failure detail.
        reason: String,
    },
    /// A channel closed outside of a requested stop.
    #[error("channel closed unexpectedly: {0}")]
    ChannelClosed(String),
}

/// A validator rejected a message before it reached its consumer.
#[derive(Debug, Error)]
#[error("message rejected by validator: {reason}")]
pub struct ValidationError {
    /// Validator-supplied rejection detail.
    pub reason: String,
}

impl ValidationError {
    /// Builds a rejection with the given detail.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Umbrella error for bus configuration and runtime operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// The declarative tree or the assembled configuration is invalid.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Component resolution against the registry failed.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    /// A transport operation failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A validator rejected a message.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The operation observed a cancellation before completing.
    #[error("operation canceled")]
    Canceled,
    /// A configuration lookup missed.
    #[error("no entry named `{key}` under endpoint `{endpoint}`")]
    NotFound {
        /// The endpoint searched.
        endpoint: String,
        /// The route key looked up.
        key: String,
    },
}

impl BusError {
    /// Builds a [`BusError::Configuration`] from any displayable detail.
    pub fn configuration(detail: impl Into<String>) -> Self {
        BusError::Configuration(detail.into())
    }
}

#[cfg(test)]
mod tests {
    use super::{BusError, ResolutionError, TransportError};

    #[test]
    fn resolution_error_renders_name_and_capability() {
        let err = ResolutionError::CapabilityMismatch {
            name: "audit".to_string(),
            requested: "validator".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "component `audit` does not provide capability `validator`"
        );
    }

    #[test]
    fn transport_errors_convert_into_bus_errors() {
        let err: BusError = TransportError::BrokerUnreachable {
            url: "amqp://h1".to_string(),
            reason: "connection refused".to_string(),
        }
        .into();
        assert!(matches!(err, BusError::Transport(_)));
    }

    #[test]
    fn not_found_names_endpoint_and_key() {
        let err = BusError::NotFound {
            endpoint: "orders".to_string(),
            key: "missing".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "no entry named `missing` under endpoint `orders`"
        );
    }
}
