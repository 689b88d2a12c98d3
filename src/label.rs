//! Interned message-label model shared by routes, listeners, and consumers.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

/// Text of the distinguished catch-all label.
const ANY_TOKEN: &str = "*";

static INTERNED_LABELS: OnceLock<Mutex<HashSet<Arc<str>>>> = OnceLock::new();

fn intern(name: &str) -> Arc<str> {
    let mut pool = INTERNED_LABELS
        .get_or_init(|| Mutex::new(HashSet::new()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if let Some(existing) = pool.get(name) {
        return existing.clone();
    }
    let entry: Arc<str> = Arc::from(name);
    pool.insert(entry.clone());
    entry
}

/// Opaque, interned tag naming a message kind.
///
/// Labels compare by text. The distinguished [`MessageLabel::any`] value
/// matches every label and is used by dynamic outgoing routing.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct MessageLabel(Arc<str>);

impl MessageLabel {
    /// Interns `name` and returns the label for it.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(intern(name.as_ref()))
    }

    /// Returns the catch-all label that matches any message kind.
    pub fn any() -> Self {
        Self(intern(ANY_TOKEN))
    }

    /// Whether this is the catch-all label.
    pub fn is_any(&self) -> bool {
        &*self.0 == ANY_TOKEN
    }

    /// The label text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageLabel {
    fn from(name: &str) -> Self {
        MessageLabel::new(name)
    }
}

impl From<String> for MessageLabel {
    fn from(name: String) -> Self {
        MessageLabel::new(name)
    }
}
