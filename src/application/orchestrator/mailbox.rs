use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::{
    domain::Route,
    protocol::{FailureReport, OutputDescriptor},
};

/// Per-route completion slots for one batch.
///
/// A route registers before its first chunk is relayed; the dispatcher
/// delivers the worker's terminal message to the matching slot. Closing the
/// mailbox cancels every pending slot and every later registration.
#[derive(Default, Clone)]
pub struct CompletionMailbox {
    inner: Arc<DashMap<Route, oneshot::Sender<Completion>>>,
    closed: Arc<OnceLock<MailboxError>>,
}

impl CompletionMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route and obtain the receiver for its terminal outcome.
    pub fn register(&self, route: Route) -> oneshot::Receiver<Completion> {
        let (tx, rx) = oneshot::channel();
        if let Some(reason) = self.closed.get() {
            let _ = tx.send(Completion::Cancelled(reason.clone()));
            return rx;
        }
        self.inner.insert(route.clone(), tx);
        if let Some(reason) = self.closed.get() {
            self.cancel(&route, reason.clone());
        }
        rx
    }

    /// Deliver a terminal outcome to a registered route.
    pub fn deliver(&self, route: &Route, completion: Completion) -> Result<(), MailboxError> {
        match self.inner.remove(route) {
            Some((_route, sender)) => sender
                .send(completion)
                .map_err(|_| MailboxError::ChannelClosed),
            None => Err(MailboxError::UnknownRoute),
        }
    }

    /// Cancel a pending receiver with a specific reason.
    pub fn cancel(&self, route: &Route, reason: MailboxError) {
        if let Some((_route, sender)) = self.inner.remove(route) {
            let _ = sender.send(Completion::Cancelled(reason));
        }
    }

    /// Drop a registration whose route will not reach the worker.
    pub fn forget(&self, route: &Route) {
        self.inner.remove(route);
    }

    /// Cancel everything pending and refuse later registrations. Only the
    /// first reason is kept.
    pub fn close(&self, reason: MailboxError) {
        let _ = self.closed.set(reason);
        let Some(reason) = self.closed.get() else {
            return;
        };
        let pending: Vec<Route> = self.inner.iter().map(|entry| entry.key().clone()).collect();
        for route in pending {
            self.cancel(&route, reason.clone());
        }
    }

    pub fn closed_reason(&self) -> Option<&MailboxError> {
        self.closed.get()
    }

    pub fn pending(&self) -> usize {
        self.inner.len()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MailboxError {
    #[error("completion channel already closed")]
    ChannelClosed,
    #[error("no route awaiting completion")]
    UnknownRoute,
    #[error("worker exited before the route completed")]
    WorkerExited,
    #[error("worker reported a fatal error: {0}")]
    WorkerFatal(FailureReport),
}

/// Terminal outcome of a route as seen by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Succeeded(OutputDescriptor),
    Failed(FailureReport),
    Cancelled(MailboxError),
}
