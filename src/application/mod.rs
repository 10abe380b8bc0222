//! Application layer: batch orchestration, route handlers and the worker.

pub mod error;
pub mod orchestrator;
pub mod render;
pub mod routes;
pub mod worker;
