//! HTTP surface of the settlement engine.
//!
//! Game start, fulfillment callback, custodial treasury operations,
//! per-category statistics and Prometheus metrics.

pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;

pub use server::ApiServer;
