use std::{fmt, path::PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::route::Route;

/// Where the worker should put a route's finished output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Destination {
    /// Write to this file, creating parent directories as needed.
    File { path: PathBuf },
    /// Collect in memory and return the content in the `SUCCESS` message.
    Inline,
}

/// Routing metadata carried by every `CHUNK`. The worker captures it when it
/// first sees a route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteMeta {
    pub destination: Destination,
    #[serde(default = "default_base_path")]
    pub base_path: String,
    #[serde(default)]
    pub module_root: Option<PathBuf>,
}

fn default_base_path() -> String {
    "/".to_string()
}

impl RouteMeta {
    pub fn inline() -> Self {
        Self {
            destination: Destination::Inline,
            base_path: default_base_path(),
            module_root: None,
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            destination: Destination::File { path: path.into() },
            base_path: default_base_path(),
            module_root: None,
        }
    }

    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }

    pub fn with_module_root(mut self, module_root: Option<PathBuf>) -> Self {
        self.module_root = module_root;
        self
    }
}

/// Messages sent from the orchestrator to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostMessage {
    /// One order-significant fragment of a route's payload.
    Chunk {
        id: Route,
        #[serde(with = "chunk_bytes")]
        chunk: Bytes,
        meta: RouteMeta,
    },
    /// No further chunks follow for `id`.
    End { id: Route },
    /// The payload for `id` failed upstream; discard it without rendering.
    Abort { id: Route },
    /// Stop accepting work. A graceful shutdown lets in-flight renders finish.
    Shutdown {
        #[serde(default)]
        graceful: bool,
    },
    #[serde(other)]
    Unknown,
}

impl HostMessage {
    pub fn route(&self) -> Option<&Route> {
        match self {
            HostMessage::Chunk { id, .. } | HostMessage::End { id } | HostMessage::Abort { id } => {
                Some(id)
            }
            HostMessage::Shutdown { .. } | HostMessage::Unknown => None,
        }
    }
}

/// Messages sent from the worker back to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// Handshake: the worker is accepting messages.
    Ready,
    /// Diagnostic checkpoint: the document shell for `id` has been produced.
    ShellReady { id: Route },
    /// Terminal success for `id`.
    Success { id: Route, output: OutputDescriptor },
    /// Terminal failure for `id`, or a batch-wide failure when `id` is absent.
    Error {
        #[serde(default)]
        id: Option<Route>,
        error: FailureReport,
    },
    #[serde(other)]
    Unknown,
}

/// Description of finished output for one route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputDescriptor {
    File { path: PathBuf, bytes: u64 },
    Inline { html: String },
}

impl OutputDescriptor {
    pub fn len(&self) -> u64 {
        match self {
            OutputDescriptor::File { bytes, .. } => *bytes,
            OutputDescriptor::Inline { html } => html.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Startup,
    Handler,
    Decode,
    Render,
    Write,
    Protocol,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Startup => "startup",
            FailureKind::Handler => "handler",
            FailureKind::Decode => "decode",
            FailureKind::Render => "render",
            FailureKind::Write => "write",
            FailureKind::Protocol => "protocol",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable error description carried by `ERROR` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureReport {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

mod chunk_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(chunk: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(chunk))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
