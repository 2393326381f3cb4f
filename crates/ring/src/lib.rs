//! Placement topology for the catalogue coordinator.
//!
//! [`HashRing`] is an immutable ketama-style ring; [`NodeRegistry`] owns the
//! set of known nodes and publishes `(nodes, ring)` snapshots atomically.

pub mod registry;
pub mod ring;

pub use registry::{HealthChange, Node, NodeRegistry, RegistrySnapshot};
pub use ring::{HashRing, RingEntry, DEFAULT_VIRTUAL_NODES};
