//! Worker-side reconstitution of chunked payloads.
//!
//! The engine owns a [`RenderStateStore`] and is the only code that mutates
//! it. Messages are handled one at a time in arrival order; finalization of a
//! route (decode, render, write) runs as a task so a slow route does not hold
//! up chunk intake for its siblings.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Instant,
};

use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use tokio::{sync::mpsc, task::JoinSet};
use tracing::{debug, info, warn};

use super::{env::WorkerEnv, sink::OutputSink};
use crate::{
    application::render::{
        FinalizeError, HtmlRenderer, PayloadDecoder, RenderContext, RenderEvent, Renderer,
        RowPayloadDecoder,
    },
    domain::Route,
    protocol::{FailureKind, FailureReport, HostMessage, OutputDescriptor, RouteMeta, WorkerMessage},
};

/// The decode and render capabilities a worker finalizes routes with.
#[derive(Clone)]
pub struct Collaborators {
    pub decoder: Arc<dyn PayloadDecoder>,
    pub renderer: Arc<dyn Renderer>,
}

impl Collaborators {
    pub fn new(
        decoder: impl PayloadDecoder + 'static,
        renderer: impl Renderer + 'static,
    ) -> Self {
        Self {
            decoder: Arc::new(decoder),
            renderer: Arc::new(renderer),
        }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Builds a worker's collaborators inside its own execution context.
///
/// An error is reported to the host as a batch-wide startup failure.
pub trait WorkerFactory: Send + Sync {
    fn collaborators(&self, env: &WorkerEnv) -> Result<Collaborators, String>;
}

/// Row payload decoding followed by HTML rendering.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardWorkerFactory;

impl WorkerFactory for StandardWorkerFactory {
    fn collaborators(&self, env: &WorkerEnv) -> Result<Collaborators, String> {
        if let Some(root) = &env.module_root
            && !root.is_dir()
        {
            return Err(format!(
                "module root `{}` is not a directory",
                root.display()
            ));
        }
        Ok(Collaborators::new(RowPayloadDecoder, HtmlRenderer::new()))
    }
}

#[derive(Debug)]
struct RenderState {
    meta: RouteMeta,
    chunks: Vec<Bytes>,
    rendered: bool,
    started: Instant,
}

/// Per-worker tracking of every route seen during this worker's lifetime.
#[derive(Debug, Default)]
pub struct RenderStateStore {
    states: HashMap<Route, RenderState>,
    settled: HashSet<Route>,
}

impl RenderStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes with a live state, accumulating or rendering.
    pub fn active(&self) -> usize {
        self.states.len()
    }

    pub fn is_settled(&self, route: &Route) -> bool {
        self.settled.contains(route)
    }

    fn settle(&mut self, route: &Route) -> Option<RenderState> {
        self.settled.insert(route.clone());
        self.states.remove(route)
    }
}

type RenderOutcome = (Route, Instant, Result<OutputDescriptor, FailureReport>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineExit {
    /// Inbox closed or a graceful shutdown was requested; in-flight renders finished.
    Drained,
    /// A forced shutdown was requested; in-flight renders were abandoned.
    Stopped,
    /// The kill signal fired.
    Killed,
}

enum Control {
    Continue,
    Drain,
    Stop,
}

pub struct ReconstitutionEngine {
    collaborators: Collaborators,
    outbox: mpsc::UnboundedSender<WorkerMessage>,
    store: RenderStateStore,
    renders: JoinSet<RenderOutcome>,
}

impl ReconstitutionEngine {
    pub fn new(collaborators: Collaborators, outbox: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        Self {
            collaborators,
            outbox,
            store: RenderStateStore::new(),
            renders: JoinSet::new(),
        }
    }

    /// Announce readiness, then process messages until the inbox closes, a
    /// shutdown arrives, or `kill` resolves.
    pub async fn run<K>(mut self, mut inbox: mpsc::Receiver<HostMessage>, kill: K) -> EngineExit
    where
        K: Future<Output = ()>,
    {
        tokio::pin!(kill);
        self.emit(WorkerMessage::Ready);

        let control = loop {
            tokio::select! {
                biased;
                () = &mut kill => {
                    self.renders.abort_all();
                    return EngineExit::Killed;
                }
                Some(joined) = self.renders.join_next(), if !self.renders.is_empty() => {
                    self.complete(joined);
                }
                message = inbox.recv() => match message {
                    Some(message) => match self.handle(message) {
                        Control::Continue => {}
                        other => break other,
                    },
                    None => break Control::Drain,
                },
            }
        };

        if let Control::Stop = control {
            self.renders.abort_all();
            return EngineExit::Stopped;
        }

        loop {
            tokio::select! {
                biased;
                () = &mut kill => {
                    self.renders.abort_all();
                    return EngineExit::Killed;
                }
                joined = self.renders.join_next() => match joined {
                    Some(joined) => self.complete(joined),
                    None => break,
                },
            }
        }

        let abandoned = self.store.active();
        if abandoned > 0 {
            warn!(
                target = "prerender::worker::engine",
                routes = abandoned,
                "Worker drained with routes still accumulating"
            );
        }
        EngineExit::Drained
    }

    fn handle(&mut self, message: HostMessage) -> Control {
        match message {
            HostMessage::Chunk { id, chunk, meta } => self.on_chunk(id, chunk, meta),
            HostMessage::End { id } => self.on_end(id),
            HostMessage::Abort { id } => self.on_abort(id),
            HostMessage::Shutdown { graceful } => {
                debug!(
                    target = "prerender::worker::engine",
                    graceful,
                    in_flight = self.renders.len(),
                    "Shutdown requested"
                );
                return if graceful { Control::Drain } else { Control::Stop };
            }
            HostMessage::Unknown => {
                metrics::counter!("prerender_protocol_errors_total").increment(1);
                warn!(
                    target = "prerender::worker::engine",
                    "Ignoring message with unknown type"
                );
            }
        }
        Control::Continue
    }

    fn on_chunk(&mut self, id: Route, chunk: Bytes, meta: RouteMeta) {
        if self.store.is_settled(&id) {
            debug!(target = "prerender::worker::engine", route = %id, "Chunk for settled route ignored");
            return;
        }
        let state = self.store.states.entry(id).or_insert_with(|| RenderState {
            meta,
            chunks: Vec::new(),
            rendered: false,
            started: Instant::now(),
        });
        if state.rendered {
            return;
        }
        state.chunks.push(chunk);
    }

    fn on_end(&mut self, id: Route) {
        let Some(state) = self.store.states.get_mut(&id) else {
            debug!(target = "prerender::worker::engine", route = %id, "End for unknown or settled route ignored");
            return;
        };
        if state.rendered {
            debug!(target = "prerender::worker::engine", route = %id, "Duplicate end ignored");
            return;
        }
        state.rendered = true;

        let chunks = std::mem::take(&mut state.chunks);
        let meta = state.meta.clone();
        let started = state.started;
        let collaborators = self.collaborators.clone();
        let outbox = self.outbox.clone();

        self.renders.spawn(async move {
            let result = AssertUnwindSafe(finalize(&id, chunks, &meta, &collaborators, &outbox))
                .catch_unwind()
                .await;
            let result = match result {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(error)) => Err(error.report()),
                Err(_) => Err(FailureReport::new(FailureKind::Render, "render panicked")),
            };
            (id, started, result)
        });
    }

    fn on_abort(&mut self, id: Route) {
        match self.store.states.get(&id) {
            Some(state) if !state.rendered => {
                self.store.settle(&id);
                debug!(target = "prerender::worker::engine", route = %id, "Route aborted by host");
            }
            _ => {
                debug!(target = "prerender::worker::engine", route = %id, "Abort ignored");
            }
        }
    }

    fn complete(&mut self, joined: Result<RenderOutcome, tokio::task::JoinError>) {
        let (id, started, result) = match joined {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(target = "prerender::worker::engine", error = %error, "Render task did not complete");
                return;
            }
        };
        self.store.settle(&id);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(output) => {
                info!(
                    target = "prerender::worker::engine",
                    route = %id,
                    bytes = output.len(),
                    elapsed_ms,
                    "Route rendered"
                );
                self.emit(WorkerMessage::Success { id, output });
            }
            Err(error) => {
                warn!(
                    target = "prerender::worker::engine",
                    route = %id,
                    kind = %error.kind,
                    error = %error.message,
                    elapsed_ms,
                    "Route failed"
                );
                self.emit(WorkerMessage::Error {
                    id: Some(id),
                    error,
                });
            }
        }
    }

    fn emit(&self, message: WorkerMessage) {
        if self.outbox.send(message).is_err() {
            debug!(target = "prerender::worker::engine", "Host side closed; message dropped");
        }
    }
}

async fn finalize(
    route: &Route,
    chunks: Vec<Bytes>,
    meta: &RouteMeta,
    collaborators: &Collaborators,
    outbox: &mpsc::UnboundedSender<WorkerMessage>,
) -> Result<OutputDescriptor, FinalizeError> {
    let context = RenderContext::new(route.clone(), meta);
    let tree = collaborators.decoder.decode(&chunks, &context)?;
    drop(chunks);

    let mut events = collaborators.renderer.render(tree, &context)?;
    let mut sink = OutputSink::open(&meta.destination).await?;

    while let Some(event) = events.next().await {
        let step = match event {
            Ok(RenderEvent::ShellReady) => {
                let _ = outbox.send(WorkerMessage::ShellReady { id: route.clone() });
                Ok(())
            }
            Ok(RenderEvent::Data(data)) => sink.write(&data).await.map_err(FinalizeError::from),
            Err(error) => Err(FinalizeError::from(error)),
        };
        if let Err(error) = step {
            drop(events);
            sink.discard().await;
            return Err(error);
        }
    }

    Ok(sink.finish().await?)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::stream;
    use tokio::sync::oneshot;

    use super::*;
    use crate::application::render::{ContentTree, DecodeError, Node, RenderError, RenderStream};

    struct ConcatDecoder;

    impl PayloadDecoder for ConcatDecoder {
        fn decode(&self, chunks: &[Bytes], _: &RenderContext) -> Result<ContentTree, DecodeError> {
            let text: String = chunks
                .iter()
                .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
                .collect();
            if text == "malformed" {
                return Err(DecodeError::InvalidContent(text));
            }
            Ok(ContentTree {
                root: Node::Text(text),
            })
        }
    }

    struct TextRenderer;

    impl Renderer for TextRenderer {
        fn render(&self, tree: ContentTree, _: &RenderContext) -> Result<RenderStream, RenderError> {
            let Node::Text(text) = tree.root else {
                return Err(RenderError::failed("expected text"));
            };
            if text == "explode" {
                return Err(RenderError::failed("boom"));
            }
            let events = vec![
                Ok(RenderEvent::ShellReady),
                Ok(RenderEvent::Data(Bytes::from(text))),
            ];
            Ok(stream::iter(events).boxed())
        }
    }

    struct Harness {
        inbox: mpsc::Sender<HostMessage>,
        outbox: mpsc::UnboundedReceiver<WorkerMessage>,
        kill: Option<oneshot::Sender<()>>,
        engine: tokio::task::JoinHandle<EngineExit>,
    }

    fn start() -> Harness {
        let (inbox_tx, inbox_rx) = mpsc::channel(16);
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let engine = ReconstitutionEngine::new(
            Collaborators::new(ConcatDecoder, TextRenderer),
            outbox_tx,
        );
        let engine = tokio::spawn(engine.run(inbox_rx, async move {
            let _ = kill_rx.await;
        }));
        Harness {
            inbox: inbox_tx,
            outbox: outbox_rx,
            kill: Some(kill_tx),
            engine,
        }
    }

    fn route(path: &str) -> Route {
        Route::parse(path).unwrap()
    }

    fn chunk(path: &str, data: &'static str) -> HostMessage {
        HostMessage::Chunk {
            id: route(path),
            chunk: Bytes::from_static(data.as_bytes()),
            meta: RouteMeta::inline(),
        }
    }

    fn end(path: &str) -> HostMessage {
        HostMessage::End { id: route(path) }
    }

    /// Collect messages until the engine exits; shell-ready checkpoints are dropped.
    async fn finish(mut harness: Harness) -> (Vec<WorkerMessage>, EngineExit) {
        drop(harness.inbox);
        let exit = harness.engine.await.unwrap();
        let mut messages = Vec::new();
        while let Ok(message) = harness.outbox.try_recv() {
            if !matches!(message, WorkerMessage::ShellReady { .. }) {
                messages.push(message);
            }
        }
        (messages, exit)
    }

    fn inline(html: &str) -> OutputDescriptor {
        OutputDescriptor::Inline {
            html: html.to_string(),
        }
    }

    #[tokio::test]
    async fn chunks_are_rendered_in_send_order() {
        let harness = start();
        for message in [chunk("/big", "a"), chunk("/big", "b"), chunk("/big", "c"), end("/big")] {
            harness.inbox.send(message).await.unwrap();
        }

        let (messages, exit) = finish(harness).await;
        assert_eq!(exit, EngineExit::Drained);
        assert_eq!(
            messages,
            vec![
                WorkerMessage::Ready,
                WorkerMessage::Success {
                    id: route("/big"),
                    output: inline("abc"),
                },
            ]
        );
    }

    #[tokio::test]
    async fn duplicate_end_and_late_chunks_are_ignored() {
        let harness = start();
        harness.inbox.send(chunk("/", "home")).await.unwrap();
        harness.inbox.send(end("/")).await.unwrap();
        harness.inbox.send(end("/")).await.unwrap();
        harness.inbox.send(chunk("/", "again")).await.unwrap();
        harness.inbox.send(end("/")).await.unwrap();

        let (messages, _) = finish(harness).await;
        assert_eq!(
            messages,
            vec![
                WorkerMessage::Ready,
                WorkerMessage::Success {
                    id: route("/"),
                    output: inline("home"),
                },
            ]
        );
    }

    #[tokio::test]
    async fn failures_are_keyed_by_route_and_isolated() {
        let harness = start();
        for message in [
            chunk("/bad", "explode"),
            chunk("/broken", "malformed"),
            chunk("/good", "fine"),
            end("/bad"),
            end("/broken"),
            end("/good"),
        ] {
            harness.inbox.send(message).await.unwrap();
        }

        let (messages, _) = finish(harness).await;
        let mut failures = HashMap::new();
        let mut successes = Vec::new();
        for message in messages {
            match message {
                WorkerMessage::Error { id: Some(id), error } => {
                    failures.insert(id, error.kind);
                }
                WorkerMessage::Success { id, .. } => successes.push(id),
                _ => {}
            }
        }

        assert_eq!(failures[&route("/bad")], FailureKind::Render);
        assert_eq!(failures[&route("/broken")], FailureKind::Decode);
        assert_eq!(successes, vec![route("/good")]);
    }

    #[tokio::test]
    async fn end_without_chunks_and_aborted_routes_produce_nothing() {
        let harness = start();
        harness.inbox.send(end("/ghost")).await.unwrap();
        harness.inbox.send(chunk("/dropped", "partial")).await.unwrap();
        harness
            .inbox
            .send(HostMessage::Abort { id: route("/dropped") })
            .await
            .unwrap();
        harness.inbox.send(end("/dropped")).await.unwrap();
        harness.inbox.send(HostMessage::Unknown).await.unwrap();

        let (messages, _) = finish(harness).await;
        assert_eq!(messages, vec![WorkerMessage::Ready]);
    }

    #[tokio::test]
    async fn forced_shutdown_stops_without_draining() {
        let harness = start();
        harness
            .inbox
            .send(HostMessage::Shutdown { graceful: false })
            .await
            .unwrap();

        let (messages, exit) = finish(harness).await;
        assert_eq!(exit, EngineExit::Stopped);
        assert_eq!(messages, vec![WorkerMessage::Ready]);
    }

    #[tokio::test]
    async fn kill_signal_ends_the_engine() {
        let mut harness = start();
        harness.inbox.send(chunk("/", "pending")).await.unwrap();
        if let Some(kill) = harness.kill.take() {
            kill.send(()).unwrap();
        }

        let exit = tokio::time::timeout(Duration::from_secs(5), &mut harness.engine)
            .await
            .expect("engine stops")
            .unwrap();
        assert_eq!(exit, EngineExit::Killed);
    }

    #[test]
    fn standard_factory_rejects_missing_module_root() {
        let env = WorkerEnv::default().with_module_root(Some("/definitely/not/here".into()));
        assert!(StandardWorkerFactory.collaborators(&env).is_err());
        assert!(StandardWorkerFactory.collaborators(&WorkerEnv::default()).is_ok());
    }
}
