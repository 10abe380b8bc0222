use std::{
    ffi::OsString,
    fmt, io,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{
    engine::{ReconstitutionEngine, WorkerFactory},
    env::WorkerEnv,
};
use crate::{
    infra::process::{ChildCommand, ChildWorker, spawn_child},
    protocol::{FailureKind, FailureReport, HostMessage, WorkerMessage},
};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
pub const WORKER_SUBCOMMAND: &str = "worker";

const THREAD_EXIT_WAIT: Duration = Duration::from_secs(1);

/// What the worker executes.
#[derive(Clone)]
pub enum WorkerEntry {
    /// A separate process speaking the protocol over stdio.
    Process { program: PathBuf, args: Vec<OsString> },
    /// A dedicated thread with its own runtime, reachable only through channels.
    InProcess(Arc<dyn WorkerFactory>),
}

impl fmt::Debug for WorkerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerEntry::Process { program, args } => f
                .debug_struct("Process")
                .field("program", program)
                .field("args", args)
                .finish(),
            WorkerEntry::InProcess(_) => f.write_str("InProcess"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub entry: WorkerEntry,
    pub env: WorkerEnv,
    pub handshake_timeout: Duration,
    pub shutdown_grace: Duration,
    /// Additional variables for process workers, applied after the worker environment.
    pub extra_env: Vec<(String, String)>,
}

impl WorkerSpec {
    pub fn process(program: impl Into<PathBuf>, args: Vec<OsString>, env: WorkerEnv) -> Self {
        Self::with_entry(
            WorkerEntry::Process {
                program: program.into(),
                args,
            },
            env,
        )
    }

    /// The running binary re-invoked with the hidden worker subcommand.
    pub fn current_exe(env: WorkerEnv) -> io::Result<Self> {
        let program = std::env::current_exe()?;
        Ok(Self::process(
            program,
            vec![OsString::from(WORKER_SUBCOMMAND)],
            env,
        ))
    }

    pub fn in_process(factory: Arc<dyn WorkerFactory>, env: WorkerEnv) -> Self {
        Self::with_entry(WorkerEntry::InProcess(factory), env)
    }

    fn with_entry(entry: WorkerEntry, env: WorkerEnv) -> Self {
        Self {
            entry,
            env,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            extra_env: Vec::new(),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to start worker `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("worker failed during startup: {message}")]
    Crashed { message: String },
    #[error("worker exited before it was ready")]
    ExitedBeforeReady,
    #[error("worker did not become ready within {timeout:?}")]
    HandshakeTimeout { timeout: Duration },
}

/// How a call to [`WorkerHandle::terminate`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The worker drained and exited within the grace period.
    Graceful,
    /// The worker had to be killed.
    Forced,
    /// An earlier call already terminated the worker.
    AlreadyTerminated,
}

struct ThreadWorker {
    kill: Option<oneshot::Sender<()>>,
    exited: oneshot::Receiver<()>,
}

impl ThreadWorker {
    async fn wait_for_exit(&mut self, grace: Duration) -> bool {
        tokio::time::timeout(grace, &mut self.exited).await.is_ok()
    }

    fn signal_kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

enum WorkerContext {
    Process(ChildWorker),
    Thread(ThreadWorker),
}

impl WorkerContext {
    async fn wait_for_exit(&mut self, grace: Duration) -> bool {
        match self {
            WorkerContext::Process(child) => child.wait_for_exit(grace).await,
            WorkerContext::Thread(thread) => thread.wait_for_exit(grace).await,
        }
    }

    async fn kill(&mut self) {
        match self {
            WorkerContext::Process(child) => child.kill().await,
            WorkerContext::Thread(thread) => {
                thread.signal_kill();
                if !thread.wait_for_exit(THREAD_EXIT_WAIT).await {
                    warn!(
                        target = "prerender::worker::lifecycle",
                        "Worker thread still busy after kill; detaching"
                    );
                }
            }
        }
    }

    fn kill_now(&mut self) {
        match self {
            WorkerContext::Process(child) => child.start_kill(),
            WorkerContext::Thread(thread) => thread.signal_kill(),
        }
    }
}

/// Exclusive reference to one running worker.
pub struct WorkerHandle {
    outbound: mpsc::Sender<HostMessage>,
    inbound: mpsc::UnboundedReceiver<WorkerMessage>,
    context: WorkerContext,
    ready: bool,
    terminated: bool,
    shutdown_grace: Duration,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("ready", &self.ready)
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    /// A sender for host messages. Capacity is the worker's message budget.
    pub fn sender(&self) -> mpsc::Sender<HostMessage> {
        self.outbound.clone()
    }

    /// Next message from the worker; `None` once the worker is gone.
    pub async fn next_message(&mut self) -> Option<WorkerMessage> {
        self.inbound.recv().await
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Ask the worker to drain, then kill it if it outlives the grace period.
    /// Later calls do nothing.
    pub async fn terminate(&mut self) -> Termination {
        if self.terminated {
            return Termination::AlreadyTerminated;
        }
        self.terminated = true;

        let grace = self.shutdown_grace;
        let requested = tokio::time::timeout(
            grace,
            self.outbound.send(HostMessage::Shutdown { graceful: true }),
        )
        .await
        .is_ok_and(|sent| sent.is_ok());

        if requested && self.context.wait_for_exit(grace).await {
            debug!(target = "prerender::worker::lifecycle", "Worker exited after shutdown");
            return Termination::Graceful;
        }

        warn!(
            target = "prerender::worker::lifecycle",
            grace_ms = grace.as_millis() as u64,
            "Worker did not exit within grace period; killing"
        );
        self.context.kill().await;
        Termination::Forced
    }

    /// Kill the worker immediately, abandoning in-flight renders.
    pub async fn force_terminate(&mut self) -> Termination {
        if self.terminated {
            return Termination::AlreadyTerminated;
        }
        self.terminated = true;
        self.context.kill().await;
        Termination::Forced
    }

    async fn await_ready(&mut self) -> Result<(), StartupError> {
        loop {
            match self.inbound.recv().await {
                Some(WorkerMessage::Ready) => return Ok(()),
                Some(WorkerMessage::Error { id: None, error }) => {
                    return Err(StartupError::Crashed {
                        message: error.to_string(),
                    });
                }
                Some(other) => {
                    debug!(
                        target = "prerender::worker::lifecycle",
                        message = ?other,
                        "Ignoring message received before ready"
                    );
                }
                None => return Err(StartupError::ExitedBeforeReady),
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if !self.terminated {
            warn!(
                target = "prerender::worker::lifecycle",
                "Worker handle dropped without terminate; killing worker"
            );
            self.context.kill_now();
        }
    }
}

/// Start a worker and wait for its READY handshake.
pub async fn create_worker(spec: WorkerSpec) -> Result<WorkerHandle, StartupError> {
    metrics::counter!("prerender_worker_starts_total").increment(1);

    let mut handle = match &spec.entry {
        WorkerEntry::Process { program, args } => {
            let mut envs: Vec<(String, String)> = spec
                .env
                .to_env_vars()
                .into_iter()
                .map(|(key, value)| (key.to_string(), value))
                .collect();
            envs.extend(spec.extra_env.iter().cloned());

            let command = ChildCommand {
                program: program.clone(),
                args: args.clone(),
                envs,
            };
            let (child, channels) = spawn_child(&command, spec.env.message_budget.get())
                .map_err(|source| StartupError::Spawn {
                    program: program.display().to_string(),
                    source,
                })?;
            WorkerHandle {
                outbound: channels.outbound,
                inbound: channels.inbound,
                context: WorkerContext::Process(child),
                ready: false,
                terminated: false,
                shutdown_grace: spec.shutdown_grace,
            }
        }
        WorkerEntry::InProcess(factory) => {
            spawn_thread(Arc::clone(factory), spec.env.clone(), spec.shutdown_grace)?
        }
    };

    match tokio::time::timeout(spec.handshake_timeout, handle.await_ready()).await {
        Ok(Ok(())) => {
            handle.ready = true;
            info!(
                target = "prerender::worker::lifecycle",
                entry = ?spec.entry,
                condition = %spec.env.condition,
                mode = %spec.env.mode,
                "Worker ready"
            );
            Ok(handle)
        }
        Ok(Err(error)) => {
            handle.force_terminate().await;
            Err(error)
        }
        Err(_) => {
            handle.force_terminate().await;
            Err(StartupError::HandshakeTimeout {
                timeout: spec.handshake_timeout,
            })
        }
    }
}

fn spawn_thread(
    factory: Arc<dyn WorkerFactory>,
    env: WorkerEnv,
    shutdown_grace: Duration,
) -> Result<WorkerHandle, StartupError> {
    let (outbound, inbox) = mpsc::channel::<HostMessage>(env.message_budget.get());
    let (outbox, inbound) = mpsc::unbounded_channel::<WorkerMessage>();
    let (kill_tx, kill_rx) = oneshot::channel::<()>();
    let (exit_tx, exit_rx) = oneshot::channel::<()>();

    std::thread::Builder::new()
        .name("prerender-worker".to_string())
        .spawn(move || {
            run_thread_worker(factory.as_ref(), &env, inbox, outbox, kill_rx);
            let _ = exit_tx.send(());
        })
        .map_err(|source| StartupError::Spawn {
            program: "prerender-worker thread".to_string(),
            source,
        })?;

    Ok(WorkerHandle {
        outbound,
        inbound,
        context: WorkerContext::Thread(ThreadWorker {
            kill: Some(kill_tx),
            exited: exit_rx,
        }),
        ready: false,
        terminated: false,
        shutdown_grace,
    })
}

fn run_thread_worker(
    factory: &dyn WorkerFactory,
    env: &WorkerEnv,
    inbox: mpsc::Receiver<HostMessage>,
    outbox: mpsc::UnboundedSender<WorkerMessage>,
    kill: oneshot::Receiver<()>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            let _ = outbox.send(startup_failure(format!("failed to build worker runtime: {error}")));
            return;
        }
    };

    let collaborators = match factory.collaborators(env) {
        Ok(collaborators) => collaborators,
        Err(message) => {
            let _ = outbox.send(startup_failure(message));
            return;
        }
    };

    let exit = runtime.block_on(ReconstitutionEngine::new(collaborators, outbox).run(
        inbox,
        async move {
            let _ = kill.await;
        },
    ));
    debug!(target = "prerender::worker::lifecycle", ?exit, "Worker thread finished");
}

pub(crate) fn startup_failure(message: impl Into<String>) -> WorkerMessage {
    WorkerMessage::Error {
        id: None,
        error: FailureReport::new(FailureKind::Startup, message),
    }
}
