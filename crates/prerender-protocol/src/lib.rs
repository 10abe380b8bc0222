//! Wire vocabulary shared by the prerender host and its render worker.
//!
//! The host streams each route's payload to the worker as ordered `CHUNK`
//! messages followed by `END`; the worker answers with exactly one `SUCCESS`
//! or `ERROR` per route. Messages travel as one JSON object per line.

mod codec;
mod message;
mod route;

pub use codec::{
    DEFAULT_MAX_FRAME_BYTES, FrameReader, FrameWriter, ProtocolError, decode_line, encode_line,
};
pub use message::{
    Destination, FailureKind, FailureReport, HostMessage, OutputDescriptor, RouteMeta,
    WorkerMessage,
};
pub use route::{Route, RouteError};
