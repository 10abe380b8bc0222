//! Newline-delimited JSON framing over any async byte stream.

use std::io;

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("transport failed: {0}")]
    Io(#[from] io::Error),
    #[error("malformed frame `{frame}`: {source}")]
    Malformed {
        frame: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("frame of {len} bytes exceeds the {limit} byte limit")]
    Oversized { len: usize, limit: usize },
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
}

impl ProtocolError {
    /// Transport failures end the conversation; a single malformed frame does not.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::Io(_) | ProtocolError::Encode(_))
    }
}

const FRAME_PREVIEW_CHARS: usize = 120;

/// Largest frame a [`FrameReader`] buffers by default. Comfortably above the
/// base64 encoding of the largest chunk the host sends.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Decode one frame. The frame text is truncated in the error to keep logs readable.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, ProtocolError> {
    decode_frame(line.as_bytes())
}

/// Encode one frame, including the trailing newline.
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut line = serde_json::to_vec(message).map_err(ProtocolError::Encode)?;
    line.push(b'\n');
    Ok(line)
}

fn decode_frame<T: DeserializeOwned>(frame: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(frame).map_err(|source| ProtocolError::Malformed {
        frame: String::from_utf8_lossy(frame)
            .chars()
            .take(FRAME_PREVIEW_CHARS)
            .collect(),
        source,
    })
}

pub struct FrameReader<R> {
    reader: BufReader<R>,
    frame: Vec<u8>,
    max_frame_bytes: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            frame: Vec::new(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn with_max_frame_bytes(mut self, limit: usize) -> Self {
        self.max_frame_bytes = limit;
        self
    }

    /// Read the next message. `Ok(None)` means the peer closed the stream.
    /// Blank lines are skipped. A frame over the size limit is discarded up
    /// to its newline and reported without ending the stream.
    pub async fn read_message<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtocolError> {
        loop {
            let Some(len) = self.next_frame().await? else {
                return Ok(None);
            };
            if len > self.max_frame_bytes {
                return Err(ProtocolError::Oversized {
                    len,
                    limit: self.max_frame_bytes,
                });
            }
            let frame = self.frame.trim_ascii();
            if frame.is_empty() {
                continue;
            }
            return decode_frame(frame).map(Some);
        }
    }

    /// Consume one newline-terminated frame and return its full length.
    /// Only the first `max_frame_bytes` are kept in `self.frame`.
    async fn next_frame(&mut self) -> Result<Option<usize>, ProtocolError> {
        self.frame.clear();
        let mut len = 0;
        let mut consumed_any = false;
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(consumed_any.then_some(len));
            }
            let (content, used, terminated) = match available.iter().position(|b| *b == b'\n') {
                Some(newline) => (&available[..newline], newline + 1, true),
                None => (available, available.len(), false),
            };
            if len + content.len() <= self.max_frame_bytes {
                self.frame.extend_from_slice(content);
            }
            len += content.len();
            consumed_any = true;
            self.reader.consume(used);
            if terminated {
                return Ok(Some(len));
            }
        }
    }
}

pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_message<T: Serialize>(&mut self, message: &T) -> Result<(), ProtocolError> {
        let line = encode_line(message)?;
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::{HostMessage, Route, RouteMeta, WorkerMessage};

    #[tokio::test]
    async fn frames_survive_a_pipe_in_order() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        let route = Route::parse("/big").unwrap();
        let sent = vec![
            HostMessage::Chunk {
                id: route.clone(),
                chunk: Bytes::from_static(b"first"),
                meta: RouteMeta::inline(),
            },
            HostMessage::Chunk {
                id: route.clone(),
                chunk: Bytes::from_static(b"second"),
                meta: RouteMeta::inline(),
            },
            HostMessage::End { id: route },
        ];

        let expected = sent.clone();
        let writer_task = tokio::spawn(async move {
            for message in &sent {
                writer.write_message(message).await.unwrap();
            }
            writer.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        while let Some(message) = reader.read_message::<HostMessage>().await.unwrap() {
            received.push(message);
        }
        writer_task.await.unwrap();

        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn malformed_frame_is_not_fatal() {
        let input: &[u8] = b"not json\n\n{\"type\":\"READY\"}\n";
        let mut reader = FrameReader::new(input);

        let err = reader.read_message::<WorkerMessage>().await.unwrap_err();
        assert!(!err.is_fatal());
        assert!(matches!(err, ProtocolError::Malformed { .. }));

        let next = reader.read_message::<WorkerMessage>().await.unwrap();
        assert_eq!(next, Some(WorkerMessage::Ready));
        assert!(reader.read_message::<WorkerMessage>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_skipped_without_ending_the_stream() {
        let mut input = vec![b'x'; 4096];
        input.extend_from_slice(b"\n{\"type\":\"READY\"}\r\n{\"type\":\"READY\"}");
        let mut reader = FrameReader::new(input.as_slice()).with_max_frame_bytes(32);

        let err = reader.read_message::<WorkerMessage>().await.unwrap_err();
        assert!(!err.is_fatal());
        assert!(matches!(
            err,
            ProtocolError::Oversized {
                len: 4096,
                limit: 32
            }
        ));

        let next = reader.read_message::<WorkerMessage>().await.unwrap();
        assert_eq!(next, Some(WorkerMessage::Ready));
        let last = reader.read_message::<WorkerMessage>().await.unwrap();
        assert_eq!(last, Some(WorkerMessage::Ready));
        assert!(reader.read_message::<WorkerMessage>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_utf8_is_a_malformed_frame() {
        let input: &[u8] = b"\xff\xfe\n{\"type\":\"READY\"}\n";
        let mut reader = FrameReader::new(input);

        let err = reader.read_message::<WorkerMessage>().await.unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
        let next = reader.read_message::<WorkerMessage>().await.unwrap();
        assert_eq!(next, Some(WorkerMessage::Ready));
    }
}
