use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use prerender::{
    application::{
        orchestrator::{BatchOptions, RouteFailure, run_batch},
        render::{
            ContentTree, DecodeError, Node, PayloadDecoder, RenderContext, RenderError,
            RenderEvent, RenderStream, Renderer,
        },
        routes::{HandlerError, HandlerResult, PayloadDirectory, RouteHandler},
        worker::{
            Collaborators, StandardWorkerFactory, Termination, WorkerEnv, WorkerFactory,
            WorkerSpec,
        },
    },
    domain::Route,
    protocol::{FailureKind, OutputDescriptor},
};

struct ConcatDecoder;

impl PayloadDecoder for ConcatDecoder {
    fn decode(
        &self,
        chunks: &[Bytes],
        _context: &RenderContext,
    ) -> Result<ContentTree, DecodeError> {
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        let text = String::from_utf8(joined).map_err(|_| DecodeError::Utf8)?;
        Ok(ContentTree {
            root: Node::Text(text),
        })
    }
}

/// Echoes the decoded text; fails for any route under `/bad`.
struct EchoRenderer;

impl Renderer for EchoRenderer {
    fn render(
        &self,
        tree: ContentTree,
        context: &RenderContext,
    ) -> Result<RenderStream, RenderError> {
        if context.route.as_str().starts_with("/bad") {
            return Err(RenderError::failed("boom"));
        }
        let Node::Text(text) = tree.root else {
            return Err(RenderError::failed("unexpected tree"));
        };
        let events = vec![
            Ok(RenderEvent::ShellReady),
            Ok(RenderEvent::Data(Bytes::from(text))),
        ];
        Ok(futures::stream::iter(events).boxed())
    }
}

struct EchoFactory;

impl WorkerFactory for EchoFactory {
    fn collaborators(&self, _env: &WorkerEnv) -> Result<Collaborators, String> {
        Ok(Collaborators::new(ConcatDecoder, EchoRenderer))
    }
}

/// Remembers every route the worker decoded, in order.
#[derive(Clone, Default)]
struct DecodeLog(Arc<Mutex<Vec<Route>>>);

impl DecodeLog {
    fn routes(&self) -> Vec<Route> {
        self.0.lock().unwrap().clone()
    }
}

struct RecordingDecoder(DecodeLog);

impl PayloadDecoder for RecordingDecoder {
    fn decode(
        &self,
        chunks: &[Bytes],
        context: &RenderContext,
    ) -> Result<ContentTree, DecodeError> {
        self.0.0.lock().unwrap().push(context.route.clone());
        ConcatDecoder.decode(chunks, context)
    }
}

struct RecordingFactory(DecodeLog);

impl WorkerFactory for RecordingFactory {
    fn collaborators(&self, _env: &WorkerEnv) -> Result<Collaborators, String> {
        Ok(Collaborators::new(RecordingDecoder(self.0.clone()), EchoRenderer))
    }
}

#[derive(Default)]
struct MemoryHandler {
    payloads: HashMap<Route, Vec<&'static str>>,
}

impl MemoryHandler {
    fn with(mut self, route: &str, chunks: &[&'static str]) -> Self {
        self.payloads.insert(route_of(route), chunks.to_vec());
        self
    }
}

#[async_trait]
impl RouteHandler for MemoryHandler {
    async fn handle(&self, route: &Route) -> HandlerResult {
        match self.payloads.get(route) {
            Some(chunks) => {
                HandlerResult::from_chunks(chunks.clone().into_iter().map(Bytes::from))
            }
            None => HandlerResult::failed(format!("no payload for {route}")),
        }
    }
}

fn route_of(raw: &str) -> Route {
    Route::parse(raw).expect("valid route")
}

fn routes(raw: &[&str]) -> Vec<Route> {
    raw.iter().map(|r| route_of(r)).collect()
}

fn echo_worker() -> WorkerSpec {
    WorkerSpec::in_process(Arc::new(EchoFactory), WorkerEnv::default())
        .with_handshake_timeout(Duration::from_secs(5))
}

fn recording_worker() -> (WorkerSpec, DecodeLog) {
    let log = DecodeLog::default();
    let factory = Arc::new(RecordingFactory(log.clone()));
    let spec = WorkerSpec::in_process(factory, WorkerEnv::default())
        .with_handshake_timeout(Duration::from_secs(5));
    (spec, log)
}

fn inline_html(outcome: &OutputDescriptor) -> &str {
    match outcome {
        OutputDescriptor::Inline { html } => html,
        other => panic!("expected inline output, got {other:?}"),
    }
}

#[tokio::test]
async fn single_chunk_routes_complete() {
    let handler = MemoryHandler::default()
        .with("/", &["home"])
        .with("/about", &["about us"]);

    let outcome = run_batch(
        echo_worker(),
        routes(&["/", "/about"]),
        &handler,
        &BatchOptions::default(),
    )
    .await
    .expect("worker starts");

    assert!(outcome.failed.is_empty(), "{:?}", outcome.failed);
    assert_eq!(outcome.completed.len(), 2);
    assert_eq!(inline_html(&outcome.completed[&route_of("/")]), "home");
    assert_eq!(inline_html(&outcome.completed[&route_of("/about")]), "about us");
    assert_eq!(outcome.termination, Termination::Graceful);
}

#[tokio::test]
async fn handler_failure_only_fails_its_route() {
    let handler = MemoryHandler::default().with("/", &["home"]);
    let (spec, decoded) = recording_worker();

    let outcome = run_batch(
        spec,
        routes(&["/", "/missing"]),
        &handler,
        &BatchOptions::default(),
    )
    .await
    .expect("worker starts");

    assert_eq!(outcome.completed.len(), 1);
    let failure = &outcome.failed[&route_of("/missing")];
    assert!(matches!(failure, RouteFailure::Handler(_)));
    assert_eq!(failure.kind(), FailureKind::Handler);
    assert_eq!(decoded.routes(), vec![route_of("/")]);
}

/// Streams one good chunk for `/flaky`, then fails; serves `/steady` whole.
struct FlakyHandler;

#[async_trait]
impl RouteHandler for FlakyHandler {
    async fn handle(&self, route: &Route) -> HandlerResult {
        match route.as_str() {
            "/flaky" => HandlerResult::Payload(
                futures::stream::iter(vec![
                    Ok(Bytes::from_static(b"half a ")),
                    Err(HandlerError::failed("disk gone")),
                ])
                .boxed(),
            ),
            _ => HandlerResult::from_chunks([Bytes::from_static(b"steady")]),
        }
    }
}

#[tokio::test]
async fn payload_stream_error_aborts_only_its_route() {
    let (spec, decoded) = recording_worker();

    let outcome = run_batch(
        spec,
        routes(&["/flaky", "/steady"]),
        &FlakyHandler,
        &BatchOptions::default(),
    )
    .await
    .expect("worker starts");

    match &outcome.failed[&route_of("/flaky")] {
        RouteFailure::Payload(error) => assert!(error.to_string().contains("disk gone")),
        other => panic!("unexpected failure: {other:?}"),
    }
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(inline_html(&outcome.completed[&route_of("/steady")]), "steady");
    assert_eq!(decoded.routes(), vec![route_of("/steady")]);
    assert_eq!(outcome.termination, Termination::Graceful);
}

#[tokio::test]
async fn multi_chunk_payloads_are_rendered_in_order() {
    let handler = MemoryHandler::default().with("/big", &["one ", "two ", "three"]);

    let outcome = run_batch(
        echo_worker(),
        routes(&["/big"]),
        &handler,
        &BatchOptions::default(),
    )
    .await
    .expect("worker starts");

    assert_eq!(
        inline_html(&outcome.completed[&route_of("/big")]),
        "one two three"
    );
}

#[tokio::test]
async fn render_failure_is_isolated_to_its_route() {
    let handler = MemoryHandler::default()
        .with("/bad", &["x"])
        .with("/good", &["fine"])
        .with("/also-good", &["also fine"]);

    let outcome = run_batch(
        echo_worker(),
        routes(&["/bad", "/good", "/also-good"]),
        &handler,
        &BatchOptions::default(),
    )
    .await
    .expect("worker starts");

    assert_eq!(outcome.completed.len(), 2);
    match &outcome.failed[&route_of("/bad")] {
        RouteFailure::Worker(report) => {
            assert_eq!(report.kind, FailureKind::Render);
            assert!(report.message.contains("boom"));
        }
        other => panic!("unexpected failure: {other:?}"),
    }
    assert!(!outcome.is_total_failure());
}

#[tokio::test]
async fn duplicate_routes_render_once() {
    let handler = MemoryHandler::default().with("/about", &["about"]);

    let outcome = run_batch(
        echo_worker(),
        routes(&["/about", "/about/", "/about"]),
        &handler,
        &BatchOptions::default(),
    )
    .await
    .expect("worker starts");

    assert_eq!(outcome.completed.len(), 1);
    assert!(outcome.failed.is_empty());
}

#[tokio::test]
async fn empty_payloads_still_reach_the_worker() {
    let handler = MemoryHandler::default().with("/empty", &[]);

    let outcome = run_batch(
        echo_worker(),
        routes(&["/empty"]),
        &handler,
        &BatchOptions::default(),
    )
    .await
    .expect("worker starts");

    assert_eq!(inline_html(&outcome.completed[&route_of("/empty")]), "");
}

#[tokio::test]
async fn concurrency_cap_still_settles_every_route() {
    let mut handler = MemoryHandler::default();
    let raw: Vec<String> = (0..12).map(|i| format!("/page-{i}")).collect();
    for path in &raw {
        handler = handler.with(path, &["a", "b"]);
    }
    let options = BatchOptions {
        max_concurrency: NonZeroUsize::new(2),
        ..BatchOptions::default()
    };

    let outcome = run_batch(
        echo_worker(),
        raw.iter().map(|path| route_of(path)).collect(),
        &handler,
        &options,
    )
    .await
    .expect("worker starts");

    assert_eq!(outcome.completed.len(), 12);
    assert!(
        outcome
            .completed
            .values()
            .all(|output| inline_html(output) == "ab")
    );
}

#[tokio::test]
async fn standard_worker_writes_documents_to_disk() {
    let out = tempfile::tempdir().expect("tempdir");
    let handler = MemoryHandler::default()
        .with("/", &["0:[\"$\",\"h1\",null,{\"children\":\"Hi\"}]\n"])
        .with(
            "/docs/guide",
            &["0:[\"$\",\"a\",null,{\"href\":\"/x\",", "\"children\":\"$L1\"}]\n1:\"go\"\n"],
        );
    let options = BatchOptions {
        out_dir: Some(out.path().to_path_buf()),
        base_path: "/site/".to_string(),
        write_payload: true,
        ..BatchOptions::default()
    };
    let spec = WorkerSpec::in_process(Arc::new(StandardWorkerFactory), WorkerEnv::default());

    let outcome = run_batch(spec, routes(&["/", "/docs/guide"]), &handler, &options)
        .await
        .expect("worker starts");

    assert!(outcome.failed.is_empty(), "{:?}", outcome.failed);
    let index = std::fs::read_to_string(out.path().join("index.html")).expect("index.html");
    assert_eq!(index, "<!DOCTYPE html><h1>Hi</h1>");
    let guide =
        std::fs::read_to_string(out.path().join("docs/guide/index.html")).expect("guide html");
    assert_eq!(guide, "<!DOCTYPE html><a href=\"/site/x\">go</a>");
    assert!(out.path().join("docs/guide/index.rsc").is_file());

    match &outcome.completed[&route_of("/")] {
        OutputDescriptor::File { path, bytes } => {
            assert_eq!(path, &out.path().join("index.html"));
            assert_eq!(*bytes, index.len() as u64);
        }
        other => panic!("expected file output, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_payload_fails_with_decode_kind() {
    let handler = MemoryHandler::default()
        .with("/", &["not a row payload"])
        .with("/ok", &["0:\"fine\"\n"]);
    let spec = WorkerSpec::in_process(Arc::new(StandardWorkerFactory), WorkerEnv::default());

    let outcome = run_batch(spec, routes(&["/", "/ok"]), &handler, &BatchOptions::default())
        .await
        .expect("worker starts");

    assert_eq!(outcome.failed[&route_of("/")].kind(), FailureKind::Decode);
    assert_eq!(
        inline_html(&outcome.completed[&route_of("/ok")]),
        "<!DOCTYPE html>fine"
    );
}

#[tokio::test]
async fn payload_copy_can_share_the_payload_directory() {
    let site = tempfile::tempdir().expect("tempdir");
    let source = site.path().join("about/index.rsc");
    std::fs::create_dir_all(source.parent().unwrap()).unwrap();
    std::fs::write(&source, "0:\"About\"\n").unwrap();

    let handler = PayloadDirectory::new(site.path(), NonZeroUsize::new(4).unwrap());
    let options = BatchOptions {
        out_dir: Some(site.path().to_path_buf()),
        write_payload: true,
        ..BatchOptions::default()
    };
    let spec = WorkerSpec::in_process(Arc::new(StandardWorkerFactory), WorkerEnv::default());

    let outcome = run_batch(spec, routes(&["/about"]), &handler, &options)
        .await
        .expect("worker starts");

    assert!(outcome.failed.is_empty(), "{:?}", outcome.failed);
    assert_eq!(std::fs::read_to_string(&source).unwrap(), "0:\"About\"\n");
    assert_eq!(
        std::fs::read_to_string(site.path().join("about/index.html")).unwrap(),
        "<!DOCTYPE html>About"
    );
    assert!(!site.path().join("about/index.rsc.partial").exists());
}
