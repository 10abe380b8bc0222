//! Route handlers: the first stage that turns a route into a payload stream.

mod directory;

use std::{fmt, io, path::PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use thiserror::Error;

use crate::domain::Route;

pub use directory::PayloadDirectory;

pub type PayloadStream = BoxStream<'static, Result<Bytes, HandlerError>>;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("no payload for `{route}` at `{}`", path.display())]
    NotFound { route: Route, path: PathBuf },
    #[error("failed to read `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{message}")]
    Failed { message: String },
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// What a handler produced for one route.
pub enum HandlerResult {
    /// The route's payload as an ordered chunk stream.
    Payload(PayloadStream),
    Failed(HandlerError),
    /// The route is intentionally not rendered.
    Skip { reason: String },
}

impl HandlerResult {
    pub fn from_chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Bytes>,
        I::IntoIter: Send + 'static,
    {
        HandlerResult::Payload(futures::stream::iter(chunks.into_iter().map(Ok)).boxed())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        HandlerResult::Failed(HandlerError::failed(message))
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        HandlerResult::Skip {
            reason: reason.into(),
        }
    }
}

impl fmt::Debug for HandlerResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerResult::Payload(_) => f.write_str("Payload(..)"),
            HandlerResult::Failed(error) => f.debug_tuple("Failed").field(error).finish(),
            HandlerResult::Skip { reason } => {
                f.debug_struct("Skip").field("reason", reason).finish()
            }
        }
    }
}

/// Produces the first-stage payload for a route. Invoked at most once per
/// route per batch.
#[async_trait]
pub trait RouteHandler: Send + Sync {
    async fn handle(&self, route: &Route) -> HandlerResult;
}
