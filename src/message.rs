//! Payload model for delivered messages.
//!
//! Payloads are a tagged variant: either bytes carrying a known schema, or an
//! untyped key/value record for consumers declared without a payload type.

use crate::errors::BusError;
use crate::label::MessageLabel;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Interned identifier of a payload schema, usually a fully qualified type name.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct SchemaId(Arc<str>);

impl SchemaId {
    /// Builds a schema id from its fully qualified name.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// The fully qualified name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The trailing segment of the qualified name.
    pub fn simple_name(&self) -> &str {
        match self.0.rsplit(['.', ':']).next() {
            Some(segment) if !segment.is_empty() => segment,
            _ => &self.0,
        }
    }
}

impl fmt::Display for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Headers attached to a delivered message.
pub type Headers = BTreeMap<String, serde_json::Value>;

/// Message payload as seen by consumers.
#[derive(Clone, Debug)]
pub enum Payload {
    /// Encoded payload with a known schema.
    Typed {
        /// Schema the bytes decode under.
        schema: SchemaId,
        /// Raw encoded payload.
        bytes: Vec<u8>,
    },
    /// Dynamic key/value record for untyped subscriptions.
    Untyped(serde_json::Map<String, serde_json::Value>),
}

impl Payload {
    /// Schema of a typed payload, `None` for untyped records.
    pub fn schema(&self) -> Option<&SchemaId> {
        match self {
            Payload::Typed { schema, .. } => Some(schema),
            Payload::Untyped(_) => None,
        }
    }
}

/// One message handed from the broker to a listener.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// Label the message was published under.
    pub label: MessageLabel,
    /// Broker headers, after endpoint-level exclusions are applied.
    pub headers: Headers,
    /// Decoded payload.
    pub payload: Payload,
    /// Broker delivery tag used for ack/nack.
    pub tag: u64,
}

/// Catalog of payload schemas known to the application.
///
/// Declared payload type names resolve against the catalog first as a fully
/// qualified identifier, then as a unique simple-name match.
#[derive(Clone, Debug, Default)]
pub struct SchemaCatalog {
    entries: BTreeSet<SchemaId>,
}

impl SchemaCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a catalog from fully qualified names.
    pub fn with(names: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        let mut catalog = Self::new();
        for name in names {
            catalog.register(name);
        }
        catalog
    }

    /// Adds a schema by fully qualified name.
    pub fn register(&mut self, name: impl AsRef<str>) -> SchemaId {
        let id = SchemaId::new(name);
        self.entries.insert(id.clone());
        id
    }

    /// Resolves a declared type name to a schema id.
    pub fn resolve(&self, declared: &str) -> Result<SchemaId, BusError> {
        if let Some(exact) = self.entries.get(&SchemaId::new(declared)) {
            return Ok(exact.clone());
        }

        let mut candidates = self
            .entries
            .iter()
            .filter(|entry| entry.simple_name() == declared);

        match (candidates.next(), candidates.next()) {
            (Some(only), None) => Ok(only.clone()),
            (Some(first), Some(second)) => Err(BusError::configuration(format!(
                "payload type `{declared}` is ambiguous between `{first}` and `{second}`"
            ))),
            (None, _) => Err(BusError::configuration(format!(
                "payload type `{declared}` is not a known schema"
            ))),
        }
    }
}
