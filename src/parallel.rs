//! Parallel composer - fan sub-agents out, merge their events

use std::collections::HashSet;
use std::sync::Arc;

use async_stream::stream;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, warn};

use crate::agent::{nest_branch, Agent, AgentHandle, AgentKind, EventStream, InvocationContext};
use crate::channel::{ChannelBuilder, EventItem, EventSender};
use crate::error::{ConclaveError, Result};
use crate::event::Event;
use crate::observer::{self, RunScope, StepOutcome, StepScope, WorkflowObserver};

/// Configuration for a [`ParallelAgent`]
#[derive(Clone)]
pub struct ParallelConfig {
    pub name: String,
    pub sub_agents: Vec<AgentHandle>,
    /// Upper bound on sub-agents running at once; 0 means unlimited
    pub max_concurrent: usize,
    /// Merge buffer capacity; `None` reserves 10 slots per sub-agent
    pub buffer_size: Option<usize>,
    pub observer: Arc<dyn WorkflowObserver>,
}

impl ParallelConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sub_agents: Vec::new(),
            max_concurrent: 0,
            buffer_size: None,
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

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn WorkflowObserver>) -> Self {
        self.observer = observer;
        self
    }
}

/// Runs every sub-agent concurrently and merges their events.
///
/// Order is kept within a branch only. The first sub-agent error is the last
/// item of the merged stream and cancels the remaining branches. Dropping the
/// merged stream aborts every branch task.
pub struct ParallelAgent {
    name: String,
    sub_agents: Vec<AgentHandle>,
    max_concurrent: usize,
    buffer_size: usize,
    observer: Arc<dyn WorkflowObserver>,
}

impl ParallelAgent {
    pub fn new(config: ParallelConfig) -> Result<Self> {
        if config.name.is_empty() {
            return Err(ConclaveError::ConfigError("parallel agent needs a name".into()));
        }
        if config.sub_agents.is_empty() {
            return Err(ConclaveError::ConfigError(format!(
                "parallel agent '{}' needs at least one sub-agent",
                config.name
            )));
        }

        let mut seen = HashSet::new();
        for agent in &config.sub_agents {
            if !seen.insert(agent.name()) {
                return Err(ConclaveError::ConfigError(format!(
                    "parallel agent '{}' has duplicate sub-agent '{}'",
                    config.name,
                    agent.name()
                )));
            }
        }

        let buffer_size = match config.buffer_size {
            Some(0) => {
                return Err(ConclaveError::ConfigError(format!(
                    "parallel agent '{}' needs a positive buffer size",
                    config.name
                )))
            }
            Some(size) => size,
            None => config
                .sub_agents
                .len()
                .saturating_mul(crate::channel::DEFAULT_BUFFER_PER_PRODUCER),
        };

        Ok(Self {
            name: config.name,
            sub_agents: config.sub_agents,
            max_concurrent: config.max_concurrent,
            buffer_size,
            observer: config.observer,
        })
    }

    pub fn handle(self) -> AgentHandle {
        Arc::new(self)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

fn tag(mut event: Event, composer: &str, sub_name: &str, index: usize) -> Event {
    let prefix = format!("{composer}.{sub_name}");
    event.branch = nest_branch(&prefix, sub_name, &event.branch);
    event.metadata.insert("parallel_index".into(), json!(index));
    event.metadata.insert("parallel_agent".into(), json!(composer));
    event
}

/// Whichever of the merge channel and the branch tasks is ready first
enum Merged {
    Item(Option<EventItem>),
    Joined(std::result::Result<(), JoinError>),
}

/// One branch: wait for a slot, run the sub-agent, push tagged items.
///
/// Stops quietly once the group is cancelled; only genuine sub-agent errors
/// are delivered.
#[allow(clippy::too_many_arguments)]
async fn run_branch(
    agent: AgentHandle,
    index: usize,
    composer: String,
    ctx: InvocationContext,
    message: String,
    tx: EventSender,
    limiter: Option<Arc<Semaphore>>,
    observer: Arc<dyn WorkflowObserver>,
) {
    let _permit = match limiter {
        Some(limiter) => match ctx.guard(limiter.acquire_owned()).await {
            Ok(Ok(permit)) => Some(permit),
            _ => return,
        },
        None => None,
    };

    let sub_name = agent.name().to_string();
    let branch = format!("{composer}.{sub_name}");
    let mut step = StepScope::start(observer, &composer, &branch);
    let mut events = agent.execute(ctx.clone(), message);

    loop {
        let item = match ctx.guard(events.next()).await {
            Ok(Some(item)) => item,
            Ok(None) => break,
            Err(_) => {
                debug!(composer = %composer, agent = %sub_name, "Branch cancelled");
                return;
            }
        };

        let failed = item.is_err();
        let item = item.map(|event| event.map(|e| tag(e, &composer, &sub_name, index)));
        if matches!(item, Ok(Some(_))) {
            step.record_event();
        }
        if tx.send(item, &ctx).await.is_err() {
            return;
        }
        if failed {
            step.finish(StepOutcome::Failed);
            return;
        }
    }

    step.finish(StepOutcome::Completed);
}

impl Agent for ParallelAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Parallel
    }

    fn sub_agents(&self) -> Vec<AgentHandle> {
        self.sub_agents.clone()
    }

    fn execute(&self, ctx: InvocationContext, message: String) -> EventStream {
        let name = self.name.clone();
        let agents = self.sub_agents.clone();
        let max_concurrent = self.max_concurrent;
        let buffer_size = self.buffer_size;
        let observer = self.observer.clone();

        Box::pin(stream! {
            let mut run = RunScope::start(observer.clone(), &name, AgentKind::Parallel);
            if let Err(err) = ctx.check() {
                yield Err(err);
                return;
            }

            let group = ctx.child();
            let _cancel_on_drop = group.cancellation_token().clone().drop_guard();
            let (tx, mut rx) = ChannelBuilder::new().buffer_size(buffer_size).build();
            let limiter = (max_concurrent > 0).then(|| Arc::new(Semaphore::new(max_concurrent)));

            debug!(composer = %name, branches = agents.len(), max_concurrent, buffer_size, "Starting parallel branches");

            let mut tasks = JoinSet::new();
            for (index, agent) in agents.iter().enumerate() {
                tasks.spawn(run_branch(
                    agent.clone(),
                    index,
                    name.clone(),
                    group.clone(),
                    message.clone(),
                    tx.clone(),
                    limiter.clone(),
                    observer.clone(),
                ));
            }
            drop(tx);

            loop {
                let next = ctx
                    .guard(async {
                        tokio::select! {
                            item = rx.recv() => Merged::Item(item),
                            Some(joined) = tasks.join_next(), if !tasks.is_empty() => Merged::Joined(joined),
                        }
                    })
                    .await;

                let item = match next {
                    Ok(Merged::Item(item)) => item,
                    Ok(Merged::Joined(Err(err))) if err.is_panic() => {
                        group.cancel();
                        warn!(composer = %name, "Branch task panicked, cancelling siblings");
                        run.finish(StepOutcome::Failed);
                        yield Err(ConclaveError::TaskError(err.to_string()));
                        return;
                    }
                    Ok(Merged::Joined(_)) => continue,
                    Err(err) => {
                        debug!(composer = %name, "Parallel run cancelled");
                        yield Err(err);
                        return;
                    }
                };

                match item {
                    None => break,
                    Some(Ok(event)) => {
                        yield Ok(event);
                    }
                    Some(Err(err)) => {
                        group.cancel();
                        if !err.is_cancellation() {
                            warn!(composer = %name, error = %err, "Branch failed, cancelling siblings");
                            run.finish(StepOutcome::Failed);
                        }
                        yield Err(err);
                        return;
                    }
                }
            }

            while let Some(joined) = tasks.join_next().await {
                if let Err(err) = joined {
                    if err.is_panic() {
                        warn!(composer = %name, "Branch task panicked");
                        run.finish(StepOutcome::Failed);
                        yield Err(ConclaveError::TaskError(err.to_string()));
                        return;
                    }
                }
            }

            run.finish(StepOutcome::Completed);
        })
    }
}
