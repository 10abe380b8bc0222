use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use super::{mailbox::MailboxError, relay::RelayError};
use crate::{
    application::{routes::HandlerError, worker::Termination},
    domain::Route,
    protocol::{FailureKind, FailureReport, OutputDescriptor},
};

/// Why a route did not complete.
#[derive(Debug, Error)]
pub enum RouteFailure {
    #[error("handler failed: {0}")]
    Handler(#[source] HandlerError),
    #[error("payload stream failed: {0}")]
    Payload(#[source] HandlerError),
    #[error("{0}")]
    Worker(FailureReport),
    #[error("worker exited before the route completed")]
    WorkerExited,
    #[error("worker reported a fatal error: {0}")]
    WorkerFatal(FailureReport),
    #[error("relay failed: {0}")]
    Relay(#[source] RelayError),
}

impl RouteFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            RouteFailure::Handler(_) | RouteFailure::Payload(_) => FailureKind::Handler,
            RouteFailure::Worker(report) => report.kind,
            RouteFailure::WorkerExited | RouteFailure::Relay(_) => FailureKind::Protocol,
            RouteFailure::WorkerFatal(report) => report.kind,
        }
    }
}

impl From<MailboxError> for RouteFailure {
    fn from(error: MailboxError) -> Self {
        match error {
            MailboxError::WorkerFatal(report) => RouteFailure::WorkerFatal(report),
            MailboxError::WorkerExited | MailboxError::ChannelClosed | MailboxError::UnknownRoute => {
                RouteFailure::WorkerExited
            }
        }
    }
}

/// Settled result of one batch. Every attempted route is in exactly one of
/// `completed`, `failed`, or `skipped`.
#[derive(Debug)]
pub struct BatchOutcome {
    pub batch_id: Uuid,
    pub completed: BTreeMap<Route, OutputDescriptor>,
    pub failed: BTreeMap<Route, RouteFailure>,
    pub skipped: BTreeMap<Route, String>,
    /// How the batch's worker was shut down.
    pub termination: Termination,
}

impl BatchOutcome {
    pub(crate) fn new(batch_id: Uuid) -> Self {
        Self {
            batch_id,
            completed: BTreeMap::new(),
            failed: BTreeMap::new(),
            skipped: BTreeMap::new(),
            termination: Termination::AlreadyTerminated,
        }
    }

    /// Nothing completed although at least one route was attempted.
    pub fn is_total_failure(&self) -> bool {
        self.completed.is_empty() && !self.failed.is_empty()
    }

    pub fn summary(&self) -> BatchSummary<'_> {
        BatchSummary {
            batch_id: self.batch_id,
            completed: &self.completed,
            failed: self
                .failed
                .iter()
                .map(|(route, failure)| {
                    (
                        route,
                        FailureReport::new(failure.kind(), failure.to_string()),
                    )
                })
                .collect(),
            skipped: &self.skipped,
        }
    }
}

/// Serializable view of a [`BatchOutcome`].
#[derive(Debug, Serialize)]
pub struct BatchSummary<'a> {
    pub batch_id: Uuid,
    pub completed: &'a BTreeMap<Route, OutputDescriptor>,
    pub failed: BTreeMap<&'a Route, FailureReport>,
    pub skipped: &'a BTreeMap<Route, String>,
}
