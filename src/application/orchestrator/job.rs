use std::time::{Duration, Instant};

use crate::domain::Route;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Streaming,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Orchestrator-side record of one route's progress through the batch.
#[derive(Debug)]
pub struct RenderJob {
    route: Route,
    status: JobStatus,
    started: Instant,
}

impl RenderJob {
    pub fn new(route: Route) -> Self {
        Self {
            route,
            status: JobStatus::Pending,
            started: Instant::now(),
        }
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn start_streaming(&mut self) {
        self.transition(JobStatus::Streaming);
    }

    pub fn complete(&mut self) {
        self.transition(JobStatus::Completed);
    }

    pub fn fail(&mut self) {
        self.transition(JobStatus::Failed);
    }

    /// Terminal states are final; later transitions are ignored.
    fn transition(&mut self, next: JobStatus) {
        if self.status.is_terminal() {
            return;
        }
        debug_assert!(
            !(next == JobStatus::Streaming && self.status != JobStatus::Pending),
            "only pending jobs start streaming"
        );
        self.status = next;
    }
}
