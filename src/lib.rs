//! Static route prerendering.
//!
//! A batch of routes is rendered in two stages. The orchestrator asks a
//! [`RouteHandler`](application::routes::RouteHandler) for each route's
//! payload and relays it, chunk by chunk, to an isolated worker. The worker
//! accumulates the chunks, decodes the complete payload and renders it to
//! HTML, then reports one terminal outcome per route.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;

pub use prerender_protocol as protocol;
