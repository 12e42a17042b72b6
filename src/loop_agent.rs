//! Loop composer - repeat sub-agents until a stop condition or a cap

use std::sync::Arc;

use async_stream::stream;
use futures::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::agent::{nest_branch, Agent, AgentHandle, AgentKind, EventStream, InvocationContext};
use crate::error::{ConclaveError, Result};
use crate::event::Event;
use crate::observer::{self, RunScope, StepOutcome, StepScope, WorkflowObserver};

/// Predicate evaluated on every forwarded event; `true` ends the loop
pub type StopCondition = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Stop when a sub-agent escalates
pub fn escalate_stop() -> StopCondition {
    Arc::new(|event: &Event| event.actions.escalate)
}

/// Lifecycle of the most recent loop execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    #[default]
    Idle,
    /// Iteration number, starting at 1
    RunningIteration(u64),
    /// Stop condition fired, the context was cancelled or the consumer left
    Stopped,
    /// Reached `max_iterations`
    Exhausted,
    /// A sub-agent failed
    Failed,
}

impl LoopState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::RunningIteration(_))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Exhausted | Self::Failed)
    }
}

/// Configuration for a [`LoopAgent`]
#[derive(Clone)]
pub struct LoopConfig {
    pub name: String,
    /// Run in order on every iteration
    pub sub_agents: Vec<AgentHandle>,
    /// Iteration cap; 0 means unbounded and then requires a stop condition
    pub max_iterations: u32,
    /// Defaults to stopping on escalation
    pub stop_condition: Option<StopCondition>,
    pub observer: Arc<dyn WorkflowObserver>,
}

impl LoopConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sub_agents: Vec::new(),
            max_iterations: 0,
            stop_condition: None,
            observer: observer::noop(),
        }
    }

    pub fn with_agent(mut self, agent: AgentHandle) -> Self {
        self.sub_agents.push(agent);
        self
    }

    pub fn with_agents(mut self, agents: impl IntoIterator<Item = AgentHandle>) -> Self {
        self.sub_agents.extend(agents);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_stop_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.stop_condition = Some(Arc::new(condition));
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn WorkflowObserver>) -> Self {
        self.observer = observer;
        self
    }
}

/// Repeats its sub-agents, in order, until the stop condition fires or the
/// iteration cap is reached, whichever comes first.
pub struct LoopAgent {
    name: String,
    sub_agents: Vec<AgentHandle>,
    max_iterations: u32,
    stop_condition: StopCondition,
    observer: Arc<dyn WorkflowObserver>,
    state: Arc<RwLock<LoopState>>,
}

impl LoopAgent {
    pub fn new(config: LoopConfig) -> Result<Self> {
        if config.name.is_empty() {
            return Err(ConclaveError::ConfigError("loop agent needs a name".into()));
        }
        if config.sub_agents.is_empty() {
            return Err(ConclaveError::ConfigError(format!(
                "loop agent '{}' needs at least one sub-agent",
                config.name
            )));
        }
        if config.max_iterations == 0 && config.stop_condition.is_none() {
            return Err(ConclaveError::ConfigError(format!(
                "loop agent '{}' needs max_iterations or a stop condition",
                config.name
            )));
        }

        Ok(Self {
            name: config.name,
            sub_agents: config.sub_agents,
            max_iterations: config.max_iterations,
            stop_condition: config.stop_condition.unwrap_or_else(escalate_stop),
            observer: config.observer,
            state: Arc::new(RwLock::new(LoopState::Idle)),
        })
    }

    pub fn handle(self) -> AgentHandle {
        Arc::new(self)
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// State of the most recent execution.
    ///
    /// Every `execute` on this agent writes the same slot, so the value only
    /// describes a run when runs do not overlap.
    pub fn state(&self) -> LoopState {
        *self.state.read()
    }
}

fn set_state(state: &RwLock<LoopState>, next: LoopState) {
    *state.write() = next;
}

/// Marks an interrupted run as stopped
struct StateGuard(Arc<RwLock<LoopState>>);

impl Drop for StateGuard {
    fn drop(&mut self) {
        let mut state = self.0.write();
        if state.is_running() {
            *state = LoopState::Stopped;
        }
    }
}

fn tag(mut event: Event, composer: &str, sub_name: &str, iteration: u64, index: usize) -> Event {
    let prefix = format!("{composer}.{sub_name}.iter{iteration}");
    event.branch = nest_branch(&prefix, sub_name, &event.branch);
    event.metadata.insert("loop_iteration".into(), json!(iteration));
    event.metadata.insert("loop_agent".into(), json!(composer));
    event.metadata.insert("sub_agent_index".into(), json!(index));
    event
}

impl Agent for LoopAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Loop
    }

    fn sub_agents(&self) -> Vec<AgentHandle> {
        self.sub_agents.clone()
    }

    fn execute(&self, ctx: InvocationContext, message: String) -> EventStream {
        let name = self.name.clone();
        let agents = self.sub_agents.clone();
        let max_iterations = self.max_iterations;
        let should_stop = self.stop_condition.clone();
        let observer = self.observer.clone();
        let state = self.state.clone();

        Box::pin(stream! {
            let mut run = RunScope::start(observer.clone(), &name, AgentKind::Loop);
            set_state(&state, LoopState::Idle);
            let _interrupted = StateGuard(state.clone());
            let mut iteration: u64 = 0;

            loop {
                if max_iterations > 0 && iteration >= u64::from(max_iterations) {
                    info!(composer = %name, iterations = iteration, "Loop exhausted");
                    set_state(&state, LoopState::Exhausted);
                    run.finish(StepOutcome::Completed);
                    return;
                }

                iteration += 1;
                set_state(&state, LoopState::RunningIteration(iteration));
                debug!(composer = %name, iteration, "Starting iteration");

                for (index, agent) in agents.iter().enumerate() {
                    if let Err(err) = ctx.check() {
                        debug!(composer = %name, iteration, "Loop cancelled");
                        set_state(&state, LoopState::Stopped);
                        yield Err(err);
                        return;
                    }

                    let sub_name = agent.name().to_string();
                    let branch = format!("{name}.{sub_name}.iter{iteration}");
                    let mut step = StepScope::start(observer.clone(), &name, &branch);
                    let mut events = agent.execute(ctx.clone(), message.clone());

                    loop {
                        let next = match ctx.guard(events.next()).await {
                            Ok(next) => next,
                            Err(err) => {
                                debug!(composer = %name, iteration, "Loop cancelled");
                                set_state(&state, LoopState::Stopped);
                                yield Err(err);
                                return;
                            }
                        };

                        match next {
                            None => break,
                            Some(Ok(None)) => {
                                yield Ok(None);
                            }
                            Some(Ok(Some(event))) => {
                                step.record_event();
                                let event = tag(event, &name, &sub_name, iteration, index);
                                let stop = should_stop(&event);
                                if stop {
                                    info!(composer = %name, iteration, agent = %sub_name, "Stop condition met");
                                    set_state(&state, LoopState::Stopped);
                                    step.finish(StepOutcome::Stopped);
                                    run.finish(StepOutcome::Stopped);
                                }
                                yield Ok(Some(event));
                                if stop {
                                    return;
                                }
                            }
                            Some(Err(err)) => {
                                if err.is_cancellation() {
                                    set_state(&state, LoopState::Stopped);
                                } else {
                                    warn!(composer = %name, iteration, agent = %sub_name, error = %err, "Sub-agent failed");
                                    set_state(&state, LoopState::Failed);
                                    step.finish(StepOutcome::Failed);
                                    run.finish(StepOutcome::Failed);
                                }
                                yield Err(err);
                                return;
                            }
                        }
                    }

                    step.finish(StepOutcome::Completed);
                }
            }
        })
    }
}
