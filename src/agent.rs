//! Agent contract - the unit every workflow composes

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{ConclaveError, Result};
use crate::event::Event;
use crate::ids::InvocationId;

/// Lazy sequence of events produced by [`Agent::execute`].
///
/// `Ok(None)` carries no observable output and is forwarded untouched. An
/// `Err` is always the last item of the branch that produced it. Dropping
/// the stream stops the producer.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Option<Event>>> + Send>>;

/// Shared handle to any agent, leaf or composer
pub type AgentHandle = Arc<dyn Agent>;

/// What kind of node an agent is in a composed tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    #[default]
    Leaf,
    Sequential,
    Parallel,
    Loop,
}

/// A named unit that turns a message into a stream of events
pub trait Agent: Send + Sync {
    /// Stable name, used for branch tagging
    fn name(&self) -> &str;

    /// Start executing. Nothing runs until the returned stream is polled.
    fn execute(&self, ctx: InvocationContext, message: String) -> EventStream;

    fn kind(&self) -> AgentKind {
        AgentKind::Leaf
    }

    /// Direct children, for composers
    fn sub_agents(&self) -> Vec<AgentHandle> {
        Vec::new()
    }
}

/// Cancellation and deadline carrier handed to every [`Agent::execute`]
#[derive(Debug, Clone)]
pub struct InvocationContext {
    invocation_id: InvocationId,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl InvocationContext {
    pub fn new() -> Self {
        Self {
            invocation_id: InvocationId::new(),
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_invocation_id(mut self, invocation_id: InvocationId) -> Self {
        self.invocation_id = invocation_id;
        self
    }

    /// Drive cancellation from an externally owned token
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Keeps the earlier of the current and the new deadline
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        self
    }

    /// Context whose cancellation follows this one but can also be cancelled
    /// on its own
    pub fn child(&self) -> Self {
        Self {
            invocation_id: self.invocation_id.clone(),
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn invocation_id(&self) -> &InvocationId {
        &self.invocation_id
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline_passed()
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// `Ok` while the context is live, otherwise the matching error
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(ConclaveError::Cancelled)
        } else if self.deadline_passed() {
            Err(ConclaveError::DeadlineExceeded)
        } else {
            Ok(())
        }
    }

    /// Resolves once the token is cancelled or the deadline passes
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }

    /// Run `fut` unless the context ends first.
    ///
    /// Cancellation wins ties, so no new work is observed after a cancel.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output> {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(self.check().err().unwrap_or(ConclaveError::Cancelled)),
            out = fut => Ok(out),
        }
    }
}

impl Default for InvocationContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Branch path for an event forwarded by a composer.
///
/// `prefix` is the composer's segment for this sub-agent (`Pipeline.Analyzer`
/// or `Refine.Critic.iter2`). When the sub-agent is itself a composer its
/// events already carry `<sub>.<rest>`; `rest` is kept so nesting reads
/// `Pipeline.Collect.SourceA`.
pub(crate) fn nest_branch(prefix: &str, sub_name: &str, existing: &str) -> String {
    match existing.strip_prefix(sub_name) {
        Some(rest) if rest.starts_with('.') => format!("{prefix}{rest}"),
        _ => prefix.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nest_branch_leaf() {
        assert_eq!(nest_branch("Pipeline.Analyzer", "Analyzer", ""), "Pipeline.Analyzer");
        assert_eq!(nest_branch("Pipeline.Analyzer", "Analyzer", "root"), "Pipeline.Analyzer");
    }

    #[test]
    fn test_nest_branch_keeps_inner_path() {
        assert_eq!(
            nest_branch("Pipeline.Collect", "Collect", "Collect.SourceA"),
            "Pipeline.Collect.SourceA"
        );
        assert_eq!(
            nest_branch("Refine.Inner.iter2", "Inner", "Inner.Writer.iter1"),
            "Refine.Inner.iter2.Writer.iter1"
        );
    }

    #[test]
    fn test_nest_branch_ignores_name_prefix_collisions() {
        assert_eq!(nest_branch("P.Col", "Col", "Collect.A"), "P.Col");
    }

    #[test]
    fn test_context_check() {
        let ctx = InvocationContext::new();
        assert!(ctx.check().is_ok());
        ctx.cancel();
        assert!(matches!(ctx.check(), Err(ConclaveError::Cancelled)));
    }

    #[test]
    fn test_child_follows_parent() {
        let parent = InvocationContext::new();
        let child = parent.child();
        assert_eq!(child.invocation_id(), parent.invocation_id());

        child.cancel();
        assert!(!parent.is_cancelled());

        let other = parent.child();
        parent.cancel();
        assert!(other.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires() {
        let ctx = InvocationContext::new().with_timeout(Duration::from_millis(50));
        assert!(ctx.check().is_ok());

        let out = ctx.guard(tokio::time::sleep(Duration::from_secs(10))).await;
        assert!(matches!(out, Err(ConclaveError::DeadlineExceeded)));
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_guard_passes_through() {
        let ctx = InvocationContext::new();
        let out = ctx.guard(async { 7 }).await;
        assert_eq!(tokio_test::assert_ok!(out), 7);
    }

    #[test]
    fn test_earlier_deadline_wins() {
        let now = Instant::now();
        let ctx = InvocationContext::new()
            .with_deadline(now + Duration::from_secs(1))
            .with_deadline(now + Duration::from_secs(5));
        assert_eq!(ctx.deadline(), Some(now + Duration::from_secs(1)));
    }
}
