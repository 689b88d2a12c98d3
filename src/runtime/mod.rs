//! Runtime integration layer.
//!
//! Isolates the dispatch-concurrency mechanics so async/tasking behavior
//! stays localized and predictable for the rest of the crate.

pub(crate) mod dispatch;
