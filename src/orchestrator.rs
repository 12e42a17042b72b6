//! Orchestrator - runs a root agent against a session

use std::sync::Arc;

use async_stream::stream;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::agent::{AgentHandle, EventStream, InvocationContext};
use crate::error::Result;
use crate::event::{Event, Message};
use crate::hierarchy::WorkflowHierarchy;
use crate::ids::SessionId;
use crate::session::{CreateSessionRequest, Session, SessionService};

/// Author recorded on the event carrying the caller's message
pub const USER_AUTHOR: &str = "user";

/// Binds a root agent to a session service.
///
/// Every event the root agent produces is appended to the session before
/// the caller sees it, so the session log and state always cover at least
/// what was delivered.
pub struct Orchestrator {
    root: AgentHandle,
    sessions: Arc<dyn SessionService>,
}

impl Orchestrator {
    pub fn new(root: AgentHandle, sessions: Arc<dyn SessionService>) -> Self {
        Self { root, sessions }
    }

    pub fn root(&self) -> &AgentHandle {
        &self.root
    }

    pub fn sessions(&self) -> &Arc<dyn SessionService> {
        &self.sessions
    }

    /// Static shape of the root agent's tree
    pub fn hierarchy(&self) -> WorkflowHierarchy {
        WorkflowHierarchy::from_agent(self.root.as_ref())
    }

    /// Create a session owned by the root agent
    pub async fn start_session(&self, app_name: &str, user_id: &str) -> Result<Session> {
        self.sessions
            .create(CreateSessionRequest::new(app_name, user_id).with_agent_id(self.root.name()))
            .await
    }

    /// Run the root agent on `message` within `session_id`.
    ///
    /// The message is recorded as a user event first. Nil items and errors
    /// from the agent are forwarded untouched; a failed append ends the
    /// stream with that error.
    pub fn run(&self, ctx: InvocationContext, session_id: SessionId, message: impl Into<String>) -> EventStream {
        let root = self.root.clone();
        let sessions = self.sessions.clone();
        let message = message.into();

        Box::pin(stream! {
            let root_name = root.name().to_string();
            info!(
                session_id = %session_id,
                invocation_id = %ctx.invocation_id(),
                agent = %root_name,
                "Starting run"
            );

            let checked = match ctx.guard(sessions.get(&session_id)).await {
                Ok(found) => found.map(|_| ()),
                Err(err) => Err(err),
            };
            if let Err(err) = checked {
                yield Err(err);
                return;
            }

            let user_event = Event::new(ctx.invocation_id().clone())
                .with_author(USER_AUTHOR)
                .with_content(Message::user(message.clone()));
            if let Err(err) = sessions.append_event(&session_id, user_event).await {
                yield Err(err);
                return;
            }

            let mut events = root.execute(ctx.clone(), message);
            let mut delivered = 0usize;

            loop {
                let next = match ctx.guard(events.next()).await {
                    Ok(next) => next,
                    Err(err) => {
                        debug!(session_id = %session_id, delivered, "Run cancelled");
                        yield Err(err);
                        return;
                    }
                };

                match next {
                    None => break,
                    Some(Ok(Some(mut event))) => {
                        if event.invocation_id.is_empty() {
                            event.invocation_id = ctx.invocation_id().clone();
                        }
                        if event.agent_id.is_empty() {
                            event.agent_id = root_name.clone();
                        }
                        if let Err(err) = sessions.append_event(&session_id, event.clone()).await {
                            warn!(session_id = %session_id, event_id = %event.id, error = %err, "Failed to record event");
                            yield Err(err);
                            return;
                        }
                        delivered += 1;
                        yield Ok(Some(event));
                    }
                    Some(Ok(None)) => {
                        yield Ok(None);
                    }
                    Some(Err(err)) => {
                        if err.is_cancellation() {
                            debug!(session_id = %session_id, delivered, "Run cancelled");
                        } else {
                            warn!(session_id = %session_id, error = %err, "Run failed");
                        }
                        yield Err(err);
                        return;
                    }
                }
            }

            info!(session_id = %session_id, delivered, "Run finished");
        })
    }
}
