//! Health and metrics endpoints
//!
//! Probes and Prometheus scraping only; the controller has no other HTTP
//! surface.

mod handlers;
mod server;

pub use handlers::HealthState;
pub use server::run_server;
