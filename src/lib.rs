//! Kuryr-Kubernetes controller
//!
//! Reconciles Kubernetes NetworkPolicies into Neutron security groups and
//! Services into Octavia load balancers, keeping the cloud-side state of
//! each object in a custom resource.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod openstack;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
