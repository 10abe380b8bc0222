//! Route vocabulary and the mapping from routes to output files.

mod output;

pub use output::{html_output_path, payload_output_path};
pub use prerender_protocol::{Route, RouteError};
