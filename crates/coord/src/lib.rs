//! Distribution-and-failover engine for catalogue offerings.
//!
//! Offerings are placed on `replicas` nodes chosen by the consistent hash
//! ring, pushed with bounded retries through a worker pool, and re-placed
//! when the health monitor reports a node down. Queries fan out to every
//! healthy node and the answers are merged.

pub mod chaos;
pub mod coordinator;
pub mod distribution;
pub mod failover;
pub mod federation;
pub mod feed;
pub mod health;
pub mod node_client;
pub mod offering;
pub mod pool;
pub mod retry;
pub mod store;

pub use coordinator::Coordinator;
pub use distribution::{DistributionEngine, DistributionError, DistributionReport};
pub use failover::{FailoverCoordinator, FailoverReport};
pub use federation::{FederatedResult, FederationError, QueryFederator};
pub use health::{HealthEvent, HealthMonitor};
pub use node_client::{NodeClient, NodeError};
pub use offering::{Offering, ReplicaAssignment};
pub use store::{StateStore, StoreError};
