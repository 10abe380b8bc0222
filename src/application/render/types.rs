use std::{collections::BTreeMap, io, path::PathBuf};

use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::{
    domain::Route,
    protocol::{FailureKind, FailureReport, RouteMeta},
};

/// Per-route context threaded explicitly through decode and render calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderContext {
    pub route: Route,
    /// Public URL prefix the site is served under; always ends in `/`.
    pub base_path: String,
    pub module_root: Option<PathBuf>,
}

impl RenderContext {
    pub fn new(route: Route, meta: &RouteMeta) -> Self {
        Self {
            route,
            base_path: normalize_base_path(&meta.base_path),
            module_root: meta.module_root.clone(),
        }
    }

    /// Prefix a root-relative URL with the base path. Other URLs are returned unchanged.
    pub fn resolve_url(&self, url: &str) -> String {
        if self.base_path == "/" || !url.starts_with('/') || url.starts_with("//") {
            return url.to_string();
        }
        format!("{}{}", self.base_path, &url[1..])
    }
}

fn normalize_base_path(base_path: &str) -> String {
    let trimmed = base_path.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}/")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    Text(String),
    /// Boolean attribute; present without a value.
    Flag,
}

/// Logical content reconstructed from a route's payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element {
        tag: String,
        attrs: BTreeMap<String, AttrValue>,
        children: Vec<Node>,
    },
    Text(String),
    /// Pre-rendered markup inserted without escaping.
    Raw(String),
    Fragment(Vec<Node>),
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentTree {
    pub root: Node,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload is empty")]
    Empty,
    #[error("payload is not valid UTF-8")]
    Utf8,
    #[error("row {line}: {message}")]
    MalformedRow { line: usize, message: String },
    #[error("root row `0` is missing")]
    MissingRoot,
    #[error("reference to unknown row `{0}`")]
    UnresolvedReference(String),
    #[error("reference cycle through row `{0}`")]
    Cycle(String),
    #[error("invalid content: {0}")]
    InvalidContent(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("invalid element name `{tag}`")]
    InvalidTag { tag: String },
    #[error("render failed: {message}")]
    Failed { message: String },
}

impl RenderError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("failed to prepare `{path}`: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write `{path}`: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Any failure on the worker side of a route, mapped onto the wire report.
#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Write(#[from] WriteError),
}

impl FinalizeError {
    pub fn report(&self) -> FailureReport {
        let kind = match self {
            FinalizeError::Decode(_) => FailureKind::Decode,
            FinalizeError::Render(_) => FailureKind::Render,
            FinalizeError::Write(_) => FailureKind::Write,
        };
        FailureReport::new(kind, self.to_string())
    }
}

/// Events produced by a second-stage render.
///
/// The end of the stream is the all-ready checkpoint: every byte has been
/// produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderEvent {
    /// The document shell has been produced; the remaining bytes are content.
    ShellReady,
    Data(Bytes),
}

pub type RenderStream = BoxStream<'static, Result<RenderEvent, RenderError>>;

/// Reconstructs a content tree from a route's complete, ordered chunk list.
pub trait PayloadDecoder: Send + Sync {
    fn decode(&self, chunks: &[Bytes], context: &RenderContext)
    -> Result<ContentTree, DecodeError>;
}

/// Converts a decoded tree into a byte stream.
pub trait Renderer: Send + Sync {
    fn render(&self, tree: ContentTree, context: &RenderContext)
    -> Result<RenderStream, RenderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(base_path: &str) -> RenderContext {
        RenderContext::new(
            Route::root(),
            &RouteMeta::inline().with_base_path(base_path),
        )
    }

    #[test]
    fn base_path_is_normalised() {
        assert_eq!(context("").base_path, "/");
        assert_eq!(context("docs").base_path, "/docs/");
        assert_eq!(context("/docs/").base_path, "/docs/");
    }

    #[test]
    fn only_root_relative_urls_are_prefixed() {
        let ctx = context("/docs/");
        assert_eq!(ctx.resolve_url("/guide"), "/docs/guide");
        assert_eq!(ctx.resolve_url("//cdn.example.com/a.js"), "//cdn.example.com/a.js");
        assert_eq!(ctx.resolve_url("https://example.com/"), "https://example.com/");
        assert_eq!(ctx.resolve_url("guide"), "guide");
        assert_eq!(context("/").resolve_url("/guide"), "/guide");
    }
}
