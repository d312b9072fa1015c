//! Custom Resource Definitions for Kuryr
//!
//! The derived resources used as reconciliation ledgers: one
//! KuryrNetworkPolicy per NetworkPolicy and one KuryrLoadBalancer per
//! Service. KuryrNetwork is read to find a namespace's Neutron network.

mod kuryr_load_balancer;
mod kuryr_network;
mod kuryr_network_policy;
pub mod types;


pub use kuryr_load_balancer::*;
pub use kuryr_network::{KuryrNetwork, KuryrNetworkSpec, KuryrNetworkStatus};
pub use kuryr_network_policy::*;
pub use types::*;
