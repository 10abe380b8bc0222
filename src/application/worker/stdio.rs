use tokio::sync::mpsc;
use tracing::info;

use super::{
    WorkerError,
    engine::{EngineExit, ReconstitutionEngine, WorkerFactory},
    env::WorkerEnv,
    lifecycle::startup_failure,
};
use crate::{
    infra::process::{read_frames, unbounded_messages, write_frames},
    protocol::{HostMessage, WorkerMessage},
};

/// Serve the worker side of the protocol on this process's stdin and stdout.
///
/// Returns once the host closes stdin or sends SHUTDOWN. Stdout carries only
/// protocol frames.
pub async fn serve_stdio(factory: &dyn WorkerFactory, env: WorkerEnv) -> Result<EngineExit, WorkerError> {
    let (outbox, outbox_rx) = mpsc::unbounded_channel::<WorkerMessage>();
    let writer = tokio::spawn(write_frames(
        tokio::io::stdout(),
        unbounded_messages(outbox_rx),
        "host",
    ));

    let collaborators = match factory.collaborators(&env) {
        Ok(collaborators) => collaborators,
        Err(message) => {
            let _ = outbox.send(startup_failure(message.clone()));
            drop(outbox);
            let _ = writer.await;
            return Err(WorkerError::Startup(message));
        }
    };

    let (inbox_tx, inbox) = mpsc::channel::<HostMessage>(env.message_budget.get());
    let reader = tokio::spawn(async move {
        use futures::StreamExt;

        let frames = read_frames::<_, HostMessage>(tokio::io::stdin(), "host");
        futures::pin_mut!(frames);
        while let Some(message) = frames.next().await {
            if inbox_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    info!(
        target = "prerender::worker",
        condition = %env.condition,
        mode = %env.mode,
        "Worker serving on stdio"
    );

    let exit = ReconstitutionEngine::new(collaborators, outbox)
        .run(inbox, std::future::pending::<()>())
        .await;

    reader.abort();
    let _ = writer.await;
    info!(target = "prerender::worker", ?exit, "Worker finished");
    Ok(exit)
}
