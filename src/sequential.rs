//! Sequential composer - run sub-agents one after another

use std::sync::Arc;

use async_stream::stream;
use futures::StreamExt;
use serde_json::json;
use tracing::{debug, warn};

use crate::agent::{nest_branch, Agent, AgentHandle, AgentKind, EventStream, InvocationContext};
use crate::error::{ConclaveError, Result};
use crate::event::Event;
use crate::observer::{self, RunScope, StepOutcome, StepScope, WorkflowObserver};

/// Configuration for a [`SequentialAgent`]
#[derive(Clone)]
pub struct SequentialConfig {
    /// Composer name, first segment of every forwarded branch
    pub name: String,
    /// Sub-agents in execution order
    pub sub_agents: Vec<AgentHandle>,
    pub observer: Arc<dyn WorkflowObserver>,
}

impl SequentialConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sub_agents: Vec::new(),
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

    pub fn with_observer(mut self, observer: Arc<dyn WorkflowObserver>) -> Self {
        self.observer = observer;
        self
    }
}

/// Runs every sub-agent to completion, in order, exactly once.
///
/// The first error ends the stream and later sub-agents never start.
pub struct SequentialAgent {
    name: String,
    sub_agents: Vec<AgentHandle>,
    observer: Arc<dyn WorkflowObserver>,
}

impl SequentialAgent {
    pub fn new(config: SequentialConfig) -> Result<Self> {
        if config.name.is_empty() {
            return Err(ConclaveError::ConfigError("sequential agent needs a name".into()));
        }
        if config.sub_agents.is_empty() {
            return Err(ConclaveError::ConfigError(format!(
                "sequential agent '{}' needs at least one sub-agent",
                config.name
            )));
        }
        Ok(Self {
            name: config.name,
            sub_agents: config.sub_agents,
            observer: config.observer,
        })
    }

    pub fn handle(self) -> AgentHandle {
        Arc::new(self)
    }
}

fn tag(mut event: Event, composer: &str, sub_name: &str, step: usize, total: usize) -> Event {
    let prefix = format!("{composer}.{sub_name}");
    event.branch = nest_branch(&prefix, sub_name, &event.branch);
    event.metadata.insert("sequential_step".into(), json!(step));
    event.metadata.insert("total_steps".into(), json!(total));
    event.metadata.insert("sequential_agent".into(), json!(composer));
    event
}

impl Agent for SequentialAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Sequential
    }

    fn sub_agents(&self) -> Vec<AgentHandle> {
        self.sub_agents.clone()
    }

    fn execute(&self, ctx: InvocationContext, message: String) -> EventStream {
        let name = self.name.clone();
        let agents = self.sub_agents.clone();
        let observer = self.observer.clone();

        Box::pin(stream! {
            let total = agents.len();
            let mut run = RunScope::start(observer.clone(), &name, AgentKind::Sequential);

            for (index, agent) in agents.iter().enumerate() {
                if let Err(err) = ctx.check() {
                    debug!(composer = %name, step = index + 1, "Sequential run cancelled");
                    yield Err(err);
                    return;
                }

                let sub_name = agent.name().to_string();
                let branch = format!("{name}.{sub_name}");
                debug!(composer = %name, agent = %sub_name, step = index + 1, total, "Starting step");

                let mut step = StepScope::start(observer.clone(), &name, &branch);
                let mut events = agent.execute(ctx.clone(), message.clone());

                loop {
                    let next = match ctx.guard(events.next()).await {
                        Ok(next) => next,
                        Err(err) => {
                            debug!(composer = %name, agent = %sub_name, "Sequential run cancelled");
                            yield Err(err);
                            return;
                        }
                    };

                    match next {
                        None => break,
                        Some(Ok(Some(event))) => {
                            step.record_event();
                            yield Ok(Some(tag(event, &name, &sub_name, index + 1, total)));
                        }
                        Some(Ok(None)) => {
                            yield Ok(None);
                        }
                        Some(Err(err)) => {
                            if err.is_cancellation() {
                                debug!(composer = %name, agent = %sub_name, "Sub-agent cancelled");
                            } else {
                                warn!(composer = %name, agent = %sub_name, error = %err, "Sub-agent failed");
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

            run.finish(StepOutcome::Completed);
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::observer::recording::RecordingObserver;
    use crate::testing::{collect, ScriptedAgent};

    fn pipeline(agents: Vec<AgentHandle>) -> SequentialAgent {
        SequentialAgent::new(SequentialConfig::new("Pipeline").with_agents(agents)).unwrap()
    }

    #[tokio::test]
    async fn test_events_follow_sub_agent_order() {
        let seq = pipeline(vec![
            ScriptedAgent::new("Collect").say("a1").say("a2").handle(),
            ScriptedAgent::new("Analyze").say("b1").handle(),
            ScriptedAgent::new("Report").say("c1").handle(),
        ]);

        let out = collect(seq.execute(InvocationContext::new(), "go".into())).await;
        assert!(out.error.is_none());
        assert_eq!(out.texts(), vec!["a1", "a2", "b1", "c1"]);
        assert_eq!(
            out.branches(),
            vec!["Pipeline.Collect", "Pipeline.Collect", "Pipeline.Analyze", "Pipeline.Report"]
        );

        let steps: Vec<_> = out.events.iter().map(|e| e.metadata_u64("sequential_step").unwrap()).collect();
        assert_eq!(steps, vec![1, 1, 2, 3]);
        assert!(out.events.iter().all(|e| e.metadata_u64("total_steps") == Some(3)));
        assert!(out.events.iter().all(|e| e.metadata_str("sequential_agent") == Some("Pipeline")));
    }

    #[tokio::test]
    async fn test_first_error_stops_pipeline() {
        let first = ScriptedAgent::new("Collect").say("partial").fail("disk full");
        let second = ScriptedAgent::new("Analyze").say("never");
        let second_probe = second.probe();

        let seq = pipeline(vec![first.handle(), second.handle()]);
        let out = collect(seq.execute(InvocationContext::new(), "go".into())).await;

        assert_eq!(out.texts(), vec!["partial"]);
        assert!(matches!(out.error, Some(ConclaveError::Agent { ref agent, .. }) if agent == "Collect"));
        assert_eq!(out.after_error, 0);
        assert_eq!(second_probe.runs(), 0);
    }

    #[tokio::test]
    async fn test_consumer_drop_stops_remaining_steps() {
        let first_agent = ScriptedAgent::new("Collect").say("a1").say("a2");
        let first_probe = first_agent.probe();
        let second = ScriptedAgent::new("Analyze").say("b1");
        let second_probe = second.probe();
        let seq = pipeline(vec![first_agent.handle(), second.handle()]);

        let mut stream = seq.execute(InvocationContext::new(), "go".into());
        let first = stream.next().await.unwrap().unwrap().unwrap();
        assert_eq!(first.content.content, "a1");
        drop(stream);

        assert_eq!(first_probe.emitted(), 1);
        assert_eq!(first_probe.live(), 0);
        assert_eq!(second_probe.runs(), 0);
    }

    #[tokio::test]
    async fn test_nil_events_are_forwarded() {
        let seq = pipeline(vec![ScriptedAgent::new("Collect").nil().say("a1").nil().handle()]);
        let out = collect(seq.execute(InvocationContext::new(), "go".into())).await;

        assert_eq!(out.nils, 2);
        assert_eq!(out.texts(), vec!["a1"]);
    }

    #[tokio::test]
    async fn test_escalate_does_not_stop_sequential() {
        let seq = pipeline(vec![
            ScriptedAgent::new("Collect").escalate("done").handle(),
            ScriptedAgent::new("Analyze").say("b1").handle(),
        ]);
        let out = collect(seq.execute(InvocationContext::new(), "go".into())).await;
        assert_eq!(out.texts(), vec!["done", "b1"]);
    }

    #[test]
    fn test_config_validation() {
        let empty = SequentialAgent::new(SequentialConfig::new("Pipeline"));
        assert!(matches!(empty, Err(ConclaveError::ConfigError(_))));

        let unnamed = SequentialAgent::new(
            SequentialConfig::new("").with_agent(ScriptedAgent::new("A").handle()),
        );
        assert!(matches!(unnamed, Err(ConclaveError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_cancelled_context_runs_nothing() {
        let agent = ScriptedAgent::new("Collect").say("a1");
        let probe = agent.probe();
        let seq = pipeline(vec![agent.handle()]);

        let ctx = InvocationContext::new();
        ctx.cancel();
        let out = collect(seq.execute(ctx, "go".into())).await;

        assert!(out.events.is_empty());
        assert!(matches!(out.error, Some(ConclaveError::Cancelled)));
        assert_eq!(probe.runs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_interrupts_running_step() {
        let slow = ScriptedAgent::new("Collect").say("a1").sleep_ms(10_000).say("late");
        let next = ScriptedAgent::new("Analyze").say("b1");
        let next_probe = next.probe();
        let seq = pipeline(vec![slow.handle(), next.handle()]);

        let ctx = InvocationContext::new().with_timeout(Duration::from_millis(50));
        let out = collect(seq.execute(ctx, "go".into())).await;

        assert_eq!(out.texts(), vec!["a1"]);
        assert!(matches!(out.error, Some(ConclaveError::DeadlineExceeded)));
        assert_eq!(out.after_error, 0);
        assert_eq!(next_probe.runs(), 0);
    }

    #[tokio::test]
    async fn test_nested_composer_keeps_inner_path() {
        let inner = SequentialAgent::new(
            SequentialConfig::new("Inner").with_agent(ScriptedAgent::new("Writer").say("w").handle()),
        )
        .unwrap()
        .handle();
        let outer = pipeline(vec![inner]);

        let out = collect(outer.execute(InvocationContext::new(), "go".into())).await;
        assert_eq!(out.branches(), vec!["Pipeline.Inner.Writer"]);
    }

    #[tokio::test]
    async fn test_observer_sees_each_step() {
        let recorder = Arc::new(RecordingObserver::default());
        let seq = SequentialAgent::new(
            SequentialConfig::new("Pipeline")
                .with_agent(ScriptedAgent::new("A").say("a").handle())
                .with_agent(ScriptedAgent::new("B").say("b1").say("b2").handle())
                .with_observer(recorder.clone()),
        )
        .unwrap();

        collect(seq.execute(InvocationContext::new(), "go".into())).await;
        assert_eq!(
            recorder.lines(),
            vec![
                "run_start Pipeline Sequential",
                "step_start Pipeline.A",
                "step_end Pipeline.A 1 Completed",
                "step_start Pipeline.B",
                "step_end Pipeline.B 2 Completed",
                "run_end Pipeline Completed",
            ]
        );
    }

    #[test]
    fn test_exposes_sub_agents() {
        let seq = pipeline(vec![
            ScriptedAgent::new("A").handle(),
            ScriptedAgent::new("B").handle(),
        ]);
        assert_eq!(seq.kind(), AgentKind::Sequential);
        let names: Vec<_> = seq.sub_agents().iter().map(|a| a.name().to_string()).collect();
        assert_eq!(names, vec!["A", "B"]);
    }
}
