use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use tokio::{
    fs::{self, File},
    io::{AsyncWriteExt, BufWriter},
};
use tracing::warn;

use crate::{
    application::render::WriteError,
    protocol::{Destination, OutputDescriptor},
};

/// Receives a route's rendered bytes as they are produced.
#[derive(Debug)]
pub enum OutputSink {
    File {
        path: PathBuf,
        writer: BufWriter<File>,
        written: u64,
    },
    Inline {
        buffer: BytesMut,
    },
}

impl OutputSink {
    pub async fn open(destination: &Destination) -> Result<Self, WriteError> {
        match destination {
            Destination::Inline => Ok(OutputSink::Inline {
                buffer: BytesMut::new(),
            }),
            Destination::File { path } => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)
                        .await
                        .map_err(|source| WriteError::Open {
                            path: parent.to_path_buf(),
                            source,
                        })?;
                }
                let file = File::create(path)
                    .await
                    .map_err(|source| WriteError::Open {
                        path: path.clone(),
                        source,
                    })?;
                Ok(OutputSink::File {
                    path: path.clone(),
                    writer: BufWriter::new(file),
                    written: 0,
                })
            }
        }
    }

    pub async fn write(&mut self, data: &Bytes) -> Result<(), WriteError> {
        match self {
            OutputSink::Inline { buffer } => {
                buffer.extend_from_slice(data);
                Ok(())
            }
            OutputSink::File {
                path,
                writer,
                written,
            } => {
                writer
                    .write_all(data)
                    .await
                    .map_err(|source| WriteError::Write {
                        path: path.clone(),
                        source,
                    })?;
                *written += data.len() as u64;
                Ok(())
            }
        }
    }

    /// Flush and describe the finished output.
    pub async fn finish(self) -> Result<OutputDescriptor, WriteError> {
        match self {
            OutputSink::Inline { buffer } => Ok(OutputDescriptor::Inline {
                html: String::from_utf8_lossy(&buffer).into_owned(),
            }),
            OutputSink::File {
                path,
                mut writer,
                written,
            } => {
                let flushed = async {
                    writer.flush().await?;
                    writer.get_mut().sync_all().await
                }
                .await;
                if let Err(source) = flushed {
                    remove_partial(&path).await;
                    return Err(WriteError::Write { path, source });
                }
                Ok(OutputDescriptor::File {
                    path,
                    bytes: written,
                })
            }
        }
    }

    /// Drop the output. A partially written file is removed.
    pub async fn discard(self) {
        if let OutputSink::File { path, writer, .. } = self {
            drop(writer);
            remove_partial(&path).await;
        }
    }
}

async fn remove_partial(path: &Path) {
    if let Err(error) = fs::remove_file(path).await
        && error.kind() != std::io::ErrorKind::NotFound
    {
        warn!(
            target = "prerender::worker::sink",
            path = %path.display(),
            error = %error,
            "Failed to remove partial output"
        );
    }
}
