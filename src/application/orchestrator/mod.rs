//! Main-side batch driver.
//!
//! Every route runs as its own future: handler, relay, then the wait for the
//! worker's terminal message. A single dispatcher reads the worker's replies
//! and resolves the per-route completion slots. The batch settles when every
//! route future has settled, and the worker is terminated on every path out.

mod job;
mod mailbox;
mod outcome;
mod relay;

use std::{
    collections::HashSet,
    num::NonZeroUsize,
    path::PathBuf,
    time::Instant,
};

use futures::{StreamExt, stream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    application::{
        routes::{HandlerResult, RouteHandler},
        worker::{StartupError, Termination, WorkerHandle, WorkerSpec, create_worker},
    },
    domain::{Route, html_output_path, payload_output_path},
    protocol::{HostMessage, OutputDescriptor, RouteMeta, WorkerMessage},
};

pub use job::{JobStatus, RenderJob};
pub use mailbox::{Completion, CompletionMailbox, MailboxError};
pub use outcome::{BatchOutcome, BatchSummary, RouteFailure};
pub use relay::{PayloadRelay, RelayError, RelayStats};

/// Where and how a batch's routes are rendered.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Output root. `None` returns every page inline.
    pub out_dir: Option<PathBuf>,
    pub base_path: String,
    pub module_root: Option<PathBuf>,
    /// Upper bound on routes in flight at once. `None` is unbounded.
    pub max_concurrency: Option<NonZeroUsize>,
    /// Keep a verbatim copy of each payload next to its HTML.
    pub write_payload: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            out_dir: None,
            base_path: "/".to_string(),
            module_root: None,
            max_concurrency: None,
            write_payload: false,
        }
    }
}

impl BatchOptions {
    fn meta_for(&self, route: &Route) -> RouteMeta {
        let meta = match &self.out_dir {
            Some(out_dir) => RouteMeta::file(html_output_path(out_dir, route)),
            None => RouteMeta::inline(),
        };
        meta.with_base_path(self.base_path.clone())
            .with_module_root(self.module_root.clone())
    }

    fn payload_copy_for(&self, route: &Route) -> Option<PathBuf> {
        match &self.out_dir {
            Some(out_dir) if self.write_payload => Some(payload_output_path(out_dir, route)),
            _ => None,
        }
    }
}

enum RouteResult {
    Completed(OutputDescriptor),
    Failed(RouteFailure),
    Skipped(String),
}

/// Start a worker from `spec` and render `routes` with it.
pub async fn run_batch(
    spec: WorkerSpec,
    routes: Vec<Route>,
    handler: &dyn RouteHandler,
    options: &BatchOptions,
) -> Result<BatchOutcome, StartupError> {
    let worker = create_worker(spec).await?;
    Ok(render_batch(routes, handler, worker, options).await)
}

/// Render every route through `worker`, then terminate it.
pub async fn render_batch(
    routes: Vec<Route>,
    handler: &dyn RouteHandler,
    mut worker: WorkerHandle,
    options: &BatchOptions,
) -> BatchOutcome {
    let batch_id = Uuid::new_v4();
    let started = Instant::now();
    let routes = dedupe(routes);
    let total = routes.len();
    info!(
        target = "prerender::orchestrator",
        batch_id = %batch_id,
        routes = total,
        out_dir = ?options.out_dir,
        "Starting render batch"
    );

    let mailbox = CompletionMailbox::new();
    let sender = worker.sender();
    let limit = options
        .max_concurrency
        .map_or(total.max(1), NonZeroUsize::get);

    let mut fatal_termination = None;
    let results: Vec<(Route, RouteResult)> = {
        let jobs = stream::iter(routes)
            .map(|route| run_route(route, handler, &sender, &mailbox, options))
            .buffer_unordered(limit)
            .collect::<Vec<_>>();
        let dispatcher = dispatch(&mut worker, &mailbox);
        tokio::pin!(jobs, dispatcher);

        let mut dispatching = true;
        loop {
            tokio::select! {
                results = &mut jobs => break results,
                killed = &mut dispatcher, if dispatching => {
                    dispatching = false;
                    fatal_termination = killed;
                }
            }
        }
    };
    drop(sender);

    let mut outcome = BatchOutcome::new(batch_id);
    for (route, result) in results {
        match result {
            RouteResult::Completed(output) => {
                metrics::counter!("prerender_routes_completed_total").increment(1);
                outcome.completed.insert(route, output);
            }
            RouteResult::Failed(failure) => {
                metrics::counter!("prerender_routes_failed_total").increment(1);
                warn!(
                    target = "prerender::orchestrator",
                    batch_id = %batch_id,
                    route = %route,
                    kind = %failure.kind(),
                    error = %failure,
                    "Route failed"
                );
                outcome.failed.insert(route, failure);
            }
            RouteResult::Skipped(reason) => {
                metrics::counter!("prerender_routes_skipped_total").increment(1);
                debug!(
                    target = "prerender::orchestrator",
                    batch_id = %batch_id,
                    route = %route,
                    reason = %reason,
                    "Route skipped"
                );
                outcome.skipped.insert(route, reason);
            }
        }
    }

    outcome.termination = match fatal_termination {
        Some(termination) => termination,
        None => worker.terminate().await,
    };

    info!(
        target = "prerender::orchestrator",
        batch_id = %batch_id,
        completed = outcome.completed.len(),
        failed = outcome.failed.len(),
        skipped = outcome.skipped.len(),
        termination = ?outcome.termination,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Render batch settled"
    );
    outcome
}

fn dedupe(routes: Vec<Route>) -> Vec<Route> {
    let mut seen = HashSet::new();
    routes
        .into_iter()
        .filter(|route| {
            let fresh = seen.insert(route.clone());
            if !fresh {
                warn!(target = "prerender::orchestrator", route = %route, "Dropping duplicate route");
            }
            fresh
        })
        .collect()
}

async fn run_route(
    route: Route,
    handler: &dyn RouteHandler,
    sender: &mpsc::Sender<HostMessage>,
    mailbox: &CompletionMailbox,
    options: &BatchOptions,
) -> (Route, RouteResult) {
    let mut job = RenderJob::new(route);
    let result = drive(&mut job, handler, sender, mailbox, options).await;
    match &result {
        RouteResult::Completed(_) => {
            job.complete();
            metrics::histogram!("prerender_route_render_ms")
                .record(job.elapsed().as_secs_f64() * 1000.0);
        }
        RouteResult::Failed(_) => job.fail(),
        RouteResult::Skipped(_) => {}
    }
    (job.route().clone(), result)
}

async fn drive(
    job: &mut RenderJob,
    handler: &dyn RouteHandler,
    sender: &mpsc::Sender<HostMessage>,
    mailbox: &CompletionMailbox,
    options: &BatchOptions,
) -> RouteResult {
    let route = job.route().clone();
    let mut payload = match handler.handle(&route).await {
        HandlerResult::Payload(payload) => payload,
        HandlerResult::Failed(error) => return RouteResult::Failed(RouteFailure::Handler(error)),
        HandlerResult::Skip { reason } => return RouteResult::Skipped(reason),
    };

    if let Some(reason) = mailbox.closed_reason() {
        return RouteResult::Failed(reason.clone().into());
    }
    let completion = mailbox.register(route.clone());
    job.start_streaming();

    let relay = PayloadRelay::open(
        route.clone(),
        options.meta_for(&route),
        sender.clone(),
        options.payload_copy_for(&route),
    )
    .await;
    let mut relay = match relay {
        Ok(relay) => relay,
        Err(error) => {
            mailbox.forget(&route);
            return RouteResult::Failed(RouteFailure::Relay(error));
        }
    };

    while let Some(item) = payload.next().await {
        let failure = match item {
            Ok(chunk) => match relay.forward(chunk).await {
                Ok(()) => continue,
                Err(error) => relay_failure(mailbox, error),
            },
            Err(error) => RouteFailure::Payload(error),
        };
        mailbox.forget(&route);
        relay.abort().await;
        return RouteResult::Failed(failure);
    }
    drop(payload);

    match relay.finish().await {
        Ok(stats) => debug!(
            target = "prerender::orchestrator",
            route = %route,
            chunks = stats.chunks,
            bytes = stats.bytes,
            "Payload relayed"
        ),
        Err(error) => {
            mailbox.forget(&route);
            return RouteResult::Failed(relay_failure(mailbox, error));
        }
    }

    match completion.await {
        Ok(Completion::Succeeded(output)) => RouteResult::Completed(output),
        Ok(Completion::Failed(report)) => RouteResult::Failed(RouteFailure::Worker(report)),
        Ok(Completion::Cancelled(reason)) => RouteResult::Failed(reason.into()),
        Err(_) => RouteResult::Failed(RouteFailure::WorkerExited),
    }
}

/// A relay that lost the worker reports why the worker went away, when known.
fn relay_failure(mailbox: &CompletionMailbox, error: RelayError) -> RouteFailure {
    match (&error, mailbox.closed_reason()) {
        (RelayError::WorkerGone, Some(reason)) => reason.clone().into(),
        _ => RouteFailure::Relay(error),
    }
}

/// Route worker replies to their completion slots until the worker goes away
/// or reports a batch-wide failure.
///
/// A batch-wide failure kills the worker on the spot: relays blocked on a full
/// outbound channel then fail instead of waiting on a worker that stopped
/// reading. Returns how the worker was stopped in that case.
async fn dispatch(
    worker: &mut WorkerHandle,
    mailbox: &CompletionMailbox,
) -> Option<Termination> {
    while let Some(message) = worker.next_message().await {
        match message {
            WorkerMessage::Success { id, output } => {
                deliver(mailbox, &id, Completion::Succeeded(output));
            }
            WorkerMessage::Error {
                id: Some(id),
                error,
            } => {
                deliver(mailbox, &id, Completion::Failed(error));
            }
            WorkerMessage::Error { id: None, error } => {
                error!(
                    target = "prerender::orchestrator",
                    kind = %error.kind,
                    error = %error.message,
                    "Worker reported a fatal error"
                );
                mailbox.close(MailboxError::WorkerFatal(error));
                return Some(worker.force_terminate().await);
            }
            WorkerMessage::ShellReady { id } => {
                debug!(target = "prerender::orchestrator", route = %id, "Shell ready");
            }
            WorkerMessage::Ready => {
                debug!(target = "prerender::orchestrator", "Ignoring repeated ready");
            }
            WorkerMessage::Unknown => {
                metrics::counter!("prerender_protocol_errors_total").increment(1);
                warn!(
                    target = "prerender::orchestrator",
                    "Ignoring worker message with unknown type"
                );
            }
        }
    }

    if mailbox.pending() > 0 {
        warn!(
            target = "prerender::orchestrator",
            pending = mailbox.pending(),
            "Worker exited with routes in flight"
        );
    }
    mailbox.close(MailboxError::WorkerExited);
    None
}

fn deliver(mailbox: &CompletionMailbox, route: &Route, completion: Completion) {
    if let Err(error) = mailbox.deliver(route, completion) {
        metrics::counter!("prerender_protocol_errors_total").increment(1);
        warn!(
            target = "prerender::orchestrator",
            route = %route,
            error = %error,
            "Ignoring worker message for a route not awaiting completion"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_are_dropped_in_order() {
        let routes = ["/", "/about", "/", "/about/"]
            .into_iter()
            .map(|raw| Route::parse(raw).unwrap())
            .collect();

        let deduped: Vec<String> = dedupe(routes).iter().map(ToString::to_string).collect();
        assert_eq!(deduped, vec!["/", "/about"]);
    }

    #[test]
    fn options_map_routes_to_destinations() {
        let options = BatchOptions {
            out_dir: Some(PathBuf::from("dist")),
            base_path: "/docs/".to_string(),
            write_payload: true,
            ..BatchOptions::default()
        };
        let route = Route::parse("/guide").unwrap();

        let meta = options.meta_for(&route);
        assert_eq!(meta, RouteMeta::file("dist/guide/index.html").with_base_path("/docs/"));
        assert_eq!(
            options.payload_copy_for(&route),
            Some(PathBuf::from("dist/guide/index.rsc"))
        );

        let inline = BatchOptions::default();
        assert_eq!(inline.meta_for(&route), RouteMeta::inline());
        assert_eq!(inline.payload_copy_for(&route), None);
    }
}
