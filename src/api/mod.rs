//! API facade layer.
//!
//! Keeps outward usage bus-centric while delegating internals to
//! domain-focused modules: the running [`Bus`](crate::Bus) on one side,
//! configuration lookups over the declarative tree on the other.
//!
//! ```ignore
//! use conveyor_bus::{api, EndpointsSection};
//!
//! // Lookups operate on the declarative tree, not on a running bus.
//! # let section = EndpointsSection::default();
//! let label = api::get_event(&section, "orders", "created")?;
//! # Ok::<(), conveyor_bus::BusError>(())
//! ```

pub mod bus;
pub mod lookup;

pub use lookup::{endpoints, get_event, get_request_config};
