//! HTTP API: job submission and inspection, task delivery endpoint, ops routes.

pub mod app;
pub mod middleware;
