//! Injected workflow telemetry hooks
//!
//! Composers report their progress to a [`WorkflowObserver`] handed to them
//! through their config instead of reaching for process-wide singletons.
//! [`NoopObserver`] is the default.

use std::sync::Arc;

use tracing::{debug, info};

use crate::agent::AgentKind;

/// How a run or step finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Ran to the end of its stream
    Completed,
    /// A stop condition fired
    Stopped,
    /// Produced an error
    Failed,
    /// Context was cancelled or the consumer went away
    Cancelled,
}

/// Progress hooks for composers. Every method defaults to a no-op.
pub trait WorkflowObserver: Send + Sync {
    fn on_run_start(&self, _composer: &str, _kind: AgentKind) {}

    fn on_step_start(&self, _composer: &str, _branch: &str) {}

    fn on_step_end(&self, _composer: &str, _branch: &str, _events: usize, _outcome: StepOutcome) {}

    fn on_run_end(&self, _composer: &str, _kind: AgentKind, _outcome: StepOutcome) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl WorkflowObserver for NoopObserver {}

/// Observer that forwards hooks to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl WorkflowObserver for TracingObserver {
    fn on_run_start(&self, composer: &str, kind: AgentKind) {
        info!(composer, kind = ?kind, "Workflow started");
    }

    fn on_step_start(&self, composer: &str, branch: &str) {
        debug!(composer, branch, "Step started");
    }

    fn on_step_end(&self, composer: &str, branch: &str, events: usize, outcome: StepOutcome) {
        debug!(composer, branch, events, outcome = ?outcome, "Step finished");
    }

    fn on_run_end(&self, composer: &str, kind: AgentKind, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Failed => info!(composer, kind = ?kind, "Workflow failed"),
            _ => info!(composer, kind = ?kind, outcome = ?outcome, "Workflow finished"),
        }
    }
}

pub(crate) fn noop() -> Arc<dyn WorkflowObserver> {
    Arc::new(NoopObserver)
}

/// Reports `on_run_end` when dropped. Unfinished runs report `Cancelled`.
pub(crate) struct RunScope {
    observer: Arc<dyn WorkflowObserver>,
    composer: String,
    kind: AgentKind,
    outcome: StepOutcome,
}

impl RunScope {
    pub(crate) fn start(observer: Arc<dyn WorkflowObserver>, composer: &str, kind: AgentKind) -> Self {
        observer.on_run_start(composer, kind);
        Self {
            observer,
            composer: composer.to_string(),
            kind,
            outcome: StepOutcome::Cancelled,
        }
    }

    pub(crate) fn finish(&mut self, outcome: StepOutcome) {
        self.outcome = outcome;
    }
}

impl Drop for RunScope {
    fn drop(&mut self) {
        self.observer.on_run_end(&self.composer, self.kind, self.outcome);
    }
}

/// Reports `on_step_end` with the number of forwarded events when dropped
pub(crate) struct StepScope {
    observer: Arc<dyn WorkflowObserver>,
    composer: String,
    branch: String,
    events: usize,
    outcome: StepOutcome,
}

impl StepScope {
    pub(crate) fn start(observer: Arc<dyn WorkflowObserver>, composer: &str, branch: &str) -> Self {
        observer.on_step_start(composer, branch);
        Self {
            observer,
            composer: composer.to_string(),
            branch: branch.to_string(),
            events: 0,
            outcome: StepOutcome::Cancelled,
        }
    }

    pub(crate) fn record_event(&mut self) {
        self.events += 1;
    }

    pub(crate) fn finish(&mut self, outcome: StepOutcome) {
        self.outcome = outcome;
    }
}

impl Drop for StepScope {
    fn drop(&mut self) {
        self.observer
            .on_step_end(&self.composer, &self.branch, self.events, self.outcome);
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use parking_lot::Mutex;

    use super::*;

    /// Records every hook as a short line, for assertions
    #[derive(Default)]
    pub struct RecordingObserver {
        pub lines: Mutex<Vec<String>>,
    }

    impl RecordingObserver {
        pub fn lines(&self) -> Vec<String> {
            self.lines.lock().clone()
        }
    }

    impl WorkflowObserver for RecordingObserver {
        fn on_run_start(&self, composer: &str, kind: AgentKind) {
            self.lines.lock().push(format!("run_start {composer} {kind:?}"));
        }

        fn on_step_start(&self, _composer: &str, branch: &str) {
            self.lines.lock().push(format!("step_start {branch}"));
        }

        fn on_step_end(&self, _composer: &str, branch: &str, events: usize, outcome: StepOutcome) {
            self.lines
                .lock()
                .push(format!("step_end {branch} {events} {outcome:?}"));
        }

        fn on_run_end(&self, composer: &str, _kind: AgentKind, outcome: StepOutcome) {
            self.lines.lock().push(format!("run_end {composer} {outcome:?}"));
        }
    }
}
