//! Scripted agents for exercising composers

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::StreamExt;
use serde_json::Value;

use crate::agent::{Agent, AgentHandle, EventStream, InvocationContext};
use crate::error::ConclaveError;
use crate::event::{Event, Message};

#[derive(Clone)]
pub enum Step {
    Say(String),
    Escalate(String),
    State(String, Value),
    Nil,
    Fail(String),
    Sleep(Duration),
    /// Never finishes and ignores cancellation
    Hang,
    Panic(String),
}

/// Counters shared between a scripted agent and the test
#[derive(Clone, Default)]
pub struct Probe {
    runs: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    emitted: Arc<AtomicUsize>,
}

impl Probe {
    /// Executions that started producing
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Executions whose stream is still alive
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously live executions
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn emitted(&self) -> usize {
        self.emitted.load(Ordering::SeqCst)
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(probe: &Probe) -> Self {
        let now = probe.live.fetch_add(1, Ordering::SeqCst) + 1;
        probe.peak.fetch_max(now, Ordering::SeqCst);
        Self(probe.live.clone())
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ScriptedAgent {
    name: String,
    steps: Vec<Step>,
    probe: Probe,
}

impl ScriptedAgent {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            steps: Vec::new(),
            probe: Probe::default(),
        }
    }

    pub fn say(mut self, text: &str) -> Self {
        self.steps.push(Step::Say(text.to_string()));
        self
    }

    pub fn escalate(mut self, text: &str) -> Self {
        self.steps.push(Step::Escalate(text.to_string()));
        self
    }

    pub fn state(mut self, key: &str, value: Value) -> Self {
        self.steps.push(Step::State(key.to_string(), value));
        self
    }

    pub fn nil(mut self) -> Self {
        self.steps.push(Step::Nil);
        self
    }

    pub fn fail(mut self, message: &str) -> Self {
        self.steps.push(Step::Fail(message.to_string()));
        self
    }

    pub fn sleep_ms(mut self, ms: u64) -> Self {
        self.steps.push(Step::Sleep(Duration::from_millis(ms)));
        self
    }

    pub fn hang(mut self) -> Self {
        self.steps.push(Step::Hang);
        self
    }

    pub fn panic(mut self, message: &str) -> Self {
        self.steps.push(Step::Panic(message.to_string()));
        self
    }

    /// Share counters with other agents
    pub fn with_probe(mut self, probe: Probe) -> Self {
        self.probe = probe;
        self
    }

    pub fn probe(&self) -> Probe {
        self.probe.clone()
    }

    pub fn handle(self) -> AgentHandle {
        Arc::new(self)
    }
}

impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, ctx: InvocationContext, message: String) -> EventStream {
        let name = self.name.clone();
        let steps = self.steps.clone();
        let probe = self.probe.clone();

        Box::pin(stream! {
            probe.runs.fetch_add(1, Ordering::SeqCst);
            let _live = LiveGuard::new(&probe);

            for step in steps {
                let base = Event::new(ctx.invocation_id().clone())
                    .with_author(name.as_str())
                    .with_agent_id(name.as_str());
                match step {
                    Step::Say(text) => {
                        probe.emitted.fetch_add(1, Ordering::SeqCst);
                        yield Ok(Some(base.with_content(Message::assistant(text))));
                    }
                    Step::Escalate(text) => {
                        probe.emitted.fetch_add(1, Ordering::SeqCst);
                        yield Ok(Some(base.with_content(Message::assistant(text)).escalate()));
                    }
                    Step::State(key, value) => {
                        probe.emitted.fetch_add(1, Ordering::SeqCst);
                        yield Ok(Some(base.with_content(Message::assistant(message.clone())).with_state(key, value)));
                    }
                    Step::Nil => {
                        yield Ok(None);
                    }
                    Step::Fail(reason) => {
                        yield Err(ConclaveError::agent(name.as_str(), reason));
                        return;
                    }
                    Step::Sleep(duration) => {
                        if let Err(err) = ctx.guard(tokio::time::sleep(duration)).await {
                            yield Err(err);
                            return;
                        }
                    }
                    Step::Hang => std::future::pending::<()>().await,
                    Step::Panic(message) => panic!("{message}"),
                }
            }
        })
    }
}

/// Everything a stream produced, split by kind
#[derive(Default)]
pub struct Collected {
    pub events: Vec<Event>,
    pub nils: usize,
    pub error: Option<ConclaveError>,
    /// Items seen after the first error; must stay zero
    pub after_error: usize,
}

impl Collected {
    pub fn texts(&self) -> Vec<String> {
        self.events.iter().map(|e| e.content.content.clone()).collect()
    }

    pub fn branches(&self) -> Vec<String> {
        self.events.iter().map(|e| e.branch.clone()).collect()
    }
}

pub async fn collect(mut stream: EventStream) -> Collected {
    let mut out = Collected::default();
    while let Some(item) = stream.next().await {
        if out.error.is_some() {
            out.after_error += 1;
            continue;
        }
        match item {
            Ok(Some(event)) => out.events.push(event),
            Ok(None) => out.nils += 1,
            Err(err) => out.error = Some(err),
        }
    }
    out
}

/// Poll until the probe reports no live executions or the grace period ends
pub async fn wait_until_idle(probes: &[Probe], grace: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        if probes.iter().all(|p| p.live() == 0) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
