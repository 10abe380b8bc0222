//! Child-process transport for workers: stdio framed as JSON lines.

use std::{ffi::OsString, io, path::PathBuf, process::Stdio, time::Duration};

use async_stream::stream;
use futures::{Stream, StreamExt, pin_mut};
use serde::{Serialize, de::DeserializeOwned};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    process::{Child, Command},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::protocol::{FrameReader, FrameWriter, HostMessage, WorkerMessage};

/// Decode frames from `reader` until end of stream or a transport failure.
/// Malformed frames are logged and skipped.
pub fn read_frames<R, T>(reader: R, peer: &'static str) -> impl Stream<Item = T> + Send
where
    R: AsyncRead + Unpin + Send + 'static,
    T: DeserializeOwned + Send + 'static,
{
    stream! {
        let mut frames = FrameReader::new(reader);
        loop {
            match frames.read_message::<T>().await {
                Ok(Some(message)) => yield message,
                Ok(None) => break,
                Err(error) if error.is_fatal() => {
                    warn!(target = "prerender::infra::process", peer, error = %error, "Frame transport failed");
                    break;
                }
                Err(error) => {
                    metrics::counter!("prerender_protocol_errors_total").increment(1);
                    warn!(target = "prerender::infra::process", peer, error = %error, "Skipping malformed frame");
                }
            }
        }
    }
}

/// Encode every message from `messages` onto `writer`, then close it.
pub async fn write_frames<W, T, S>(writer: W, messages: S, peer: &'static str)
where
    W: AsyncWrite + Unpin,
    T: Serialize,
    S: Stream<Item = T>,
{
    pin_mut!(messages);
    let mut frames = FrameWriter::new(writer);
    while let Some(message) = messages.next().await {
        if let Err(error) = frames.write_message(&message).await {
            warn!(target = "prerender::infra::process", peer, error = %error, "Failed to write frame");
            return;
        }
    }
    if let Err(error) = frames.shutdown().await {
        debug!(target = "prerender::infra::process", peer, error = %error, "Failed to close frame writer");
    }
}

pub fn bounded_messages<T: Send + 'static>(
    mut receiver: mpsc::Receiver<T>,
) -> impl Stream<Item = T> + Send {
    stream! {
        while let Some(message) = receiver.recv().await {
            yield message;
        }
    }
}

pub fn unbounded_messages<T: Send + 'static>(
    mut receiver: mpsc::UnboundedReceiver<T>,
) -> impl Stream<Item = T> + Send {
    stream! {
        while let Some(message) = receiver.recv().await {
            yield message;
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChildCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub envs: Vec<(String, String)>,
}

/// A spawned worker process and the tasks pumping its stdio.
#[derive(Debug)]
pub struct ChildWorker {
    child: Child,
    pumps: Vec<JoinHandle<()>>,
}

/// Channels connecting the host to a spawned child.
pub struct ChildChannels {
    pub outbound: mpsc::Sender<HostMessage>,
    pub inbound: mpsc::UnboundedReceiver<WorkerMessage>,
}

pub fn spawn_child(
    command: &ChildCommand,
    message_budget: usize,
) -> io::Result<(ChildWorker, ChildChannels)> {
    let mut child = Command::new(&command.program)
        .args(&command.args)
        .envs(command.envs.iter().map(|(key, value)| (key.as_str(), value.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| io::Error::other("worker stdin was not captured"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("worker stdout was not captured"))?;

    let (outbound, outbound_rx) = mpsc::channel::<HostMessage>(message_budget.max(1));
    let (inbound_tx, inbound) = mpsc::unbounded_channel::<WorkerMessage>();

    let writer = tokio::spawn(write_frames(
        stdin,
        bounded_messages(outbound_rx),
        "worker",
    ));
    let reader = tokio::spawn(async move {
        let frames = read_frames::<_, WorkerMessage>(stdout, "worker");
        pin_mut!(frames);
        while let Some(message) = frames.next().await {
            if inbound_tx.send(message).is_err() {
                break;
            }
        }
    });

    debug!(
        target = "prerender::infra::process",
        program = %command.program.display(),
        pid = child.id(),
        "Worker process spawned"
    );

    Ok((
        ChildWorker {
            child,
            pumps: vec![writer, reader],
        },
        ChildChannels { outbound, inbound },
    ))
}

impl ChildWorker {
    /// Wait up to `grace` for the process to exit on its own.
    pub async fn wait_for_exit(&mut self, grace: Duration) -> bool {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(target = "prerender::infra::process", %status, "Worker process exited");
                true
            }
            Ok(Err(error)) => {
                warn!(target = "prerender::infra::process", error = %error, "Failed to wait for worker process");
                false
            }
            Err(_) => false,
        }
    }

    pub async fn kill(&mut self) {
        if let Err(error) = self.child.kill().await {
            debug!(target = "prerender::infra::process", error = %error, "Worker process kill failed");
        }
        self.abort_pumps();
    }

    /// Signal the process without waiting; used from `Drop`.
    pub fn start_kill(&mut self) {
        let _ = self.child.start_kill();
        self.abort_pumps();
    }

    fn abort_pumps(&self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;
    use crate::protocol::{FailureKind, FailureReport};

    #[tokio::test]
    async fn frames_written_are_read_back_skipping_garbage() {
        let (client, server) = tokio::io::duplex(256);
        let sent = vec![
            WorkerMessage::Ready,
            WorkerMessage::Error {
                id: None,
                error: FailureReport::new(FailureKind::Startup, "missing module"),
            },
        ];

        write_frames(client, stream::iter(sent.clone()), "test").await;
        let received: Vec<WorkerMessage> = read_frames(server, "test").collect().await;
        assert_eq!(received, sent);

        let input: &'static [u8] = b"{\"type\":\"READY\"}\nnot-json\n{\"type\":\"READY\"}\n";
        let received: Vec<WorkerMessage> = read_frames(input, "test").collect().await;
        assert_eq!(received, vec![WorkerMessage::Ready, WorkerMessage::Ready]);
    }
}
