use std::{
    ffi::OsStr,
    io,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
};
use tracing::debug;

use crate::{
    domain::Route,
    protocol::{HostMessage, RouteMeta},
};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("worker stopped accepting messages")]
    WorkerGone,
    #[error("failed to write payload copy `{}`: {source}", path.display())]
    LocalCopy {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Verbatim payload copy. Bytes land in a sibling `.partial` file that only
/// replaces the destination once the stream is complete, so a destination
/// that is also the payload source is never truncated while it is read.
struct LocalCopy {
    path: PathBuf,
    partial: PathBuf,
    writer: BufWriter<File>,
}

impl LocalCopy {
    async fn open(path: PathBuf) -> Result<Self, RelayError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| RelayError::LocalCopy {
                    path: path.clone(),
                    source,
                })?;
        }
        let partial = partial_path(&path);
        let file = File::create(&partial)
            .await
            .map_err(|source| RelayError::LocalCopy {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            partial,
            writer: BufWriter::new(file),
        })
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), RelayError> {
        self.writer
            .write_all(chunk)
            .await
            .map_err(|source| RelayError::LocalCopy {
                path: self.path.clone(),
                source,
            })
    }

    /// Move the finished copy onto its destination. The partial file is
    /// removed on failure.
    async fn persist(mut self) -> Result<(), RelayError> {
        let persisted = match self.writer.flush().await {
            Ok(()) => {
                drop(self.writer);
                fs::rename(&self.partial, &self.path).await
            }
            Err(error) => {
                drop(self.writer);
                Err(error)
            }
        };
        match persisted {
            Ok(()) => Ok(()),
            Err(source) => {
                remove_partial(&self.partial).await;
                Err(RelayError::LocalCopy {
                    path: self.path,
                    source,
                })
            }
        }
    }

    async fn discard(self) {
        drop(self.writer);
        remove_partial(&self.partial).await;
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

async fn remove_partial(partial: &Path) {
    if let Err(error) = fs::remove_file(partial).await {
        debug!(
            target = "prerender::orchestrator::relay",
            path = %partial.display(),
            error = %error,
            "Failed to remove partial payload copy"
        );
    }
}

/// Forwards one route's payload stream to the worker as CHUNK messages,
/// optionally keeping a verbatim copy on disk.
pub struct PayloadRelay {
    route: Route,
    meta: RouteMeta,
    sender: mpsc::Sender<HostMessage>,
    local: Option<LocalCopy>,
    chunks: usize,
    bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub chunks: usize,
    pub bytes: u64,
}

impl PayloadRelay {
    pub async fn open(
        route: Route,
        meta: RouteMeta,
        sender: mpsc::Sender<HostMessage>,
        local_copy: Option<PathBuf>,
    ) -> Result<Self, RelayError> {
        let local = match local_copy {
            Some(path) => Some(LocalCopy::open(path).await?),
            None => None,
        };
        Ok(Self {
            route,
            meta,
            sender,
            local,
            chunks: 0,
            bytes: 0,
        })
    }

    pub async fn forward(&mut self, chunk: Bytes) -> Result<(), RelayError> {
        if let Some(local) = &mut self.local {
            local.write(&chunk).await?;
        }
        self.chunks += 1;
        self.bytes += chunk.len() as u64;
        self.send_chunk(chunk).await
    }

    /// Close the route's stream. A route that produced no chunks still sends
    /// one empty CHUNK so the worker has state to finalize.
    ///
    /// The local copy is persisted before END goes out; if that fails the
    /// worker is told to ABORT instead.
    pub async fn finish(mut self) -> Result<RelayStats, RelayError> {
        if let Some(local) = self.local.take()
            && let Err(error) = local.persist().await
        {
            self.abort().await;
            return Err(error);
        }
        if self.chunks == 0 {
            self.send_chunk(Bytes::new()).await?;
        }
        self.send(HostMessage::End {
            id: self.route.clone(),
        })
        .await?;
        Ok(RelayStats {
            chunks: self.chunks,
            bytes: self.bytes,
        })
    }

    /// Tell the worker to drop what it accumulated and discard the local copy.
    pub async fn abort(mut self) {
        if self.chunks > 0 {
            let _ = self
                .send(HostMessage::Abort {
                    id: self.route.clone(),
                })
                .await;
        }
        if let Some(local) = self.local.take() {
            local.discard().await;
        }
    }

    async fn send_chunk(&self, chunk: Bytes) -> Result<(), RelayError> {
        self.send(HostMessage::Chunk {
            id: self.route.clone(),
            chunk,
            meta: self.meta.clone(),
        })
        .await
    }

    async fn send(&self, message: HostMessage) -> Result<(), RelayError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| RelayError::WorkerGone)
    }
}
