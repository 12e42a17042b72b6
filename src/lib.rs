//! # Conclave
//!
//! Workflow composition for agents - run them in order, side by side, or
//! round and round until they agree.
//!
//! An [`Agent`] turns a message into a lazy stream of [`Event`]s. Composers
//! are agents too, so trees nest freely and every event arrives tagged with
//! the branch path that produced it.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!                 │         ORCHESTRATOR         │
//!                 │  root agent + SessionService │
//!                 └──────────────┬───────────────┘
//!                                │ append, then forward
//!                                ▼
//!                 ┌──────────────────────────────┐
//!                 │   Sequential  "Pipeline"     │
//!                 └──┬───────────┬────────────┬──┘
//!                    ▼           ▼            ▼
//!            ┌────────────┐ ┌────────────┐ ┌────────┐
//!            │  Parallel  │ │    Loop    │ │ Report │
//!            │ "Collect"  │ │  "Refine"  │ └────────┘
//!            └──┬──────┬──┘ └──┬──────┬──┘
//!               ▼      ▼       ▼      ▼
//!            SourceA SourceB Writer Critic
//! ```
//!
//! Events from `Critic` on the second pass surface as
//! `Pipeline.Refine.Critic.iter2`.
//!
//! ## Key Concepts
//!
//! - **Agent**: anything with a name and an `execute` that yields events
//! - **Composer**: an agent built from sub-agents (sequential, parallel, loop)
//! - **Invocation context**: cancellation token and deadline shared by a run
//! - **Session**: scoped state plus the ordered event log of a conversation

pub mod agent;
pub mod channel;
pub mod error;
pub mod event;
pub mod hierarchy;
pub mod ids;
pub mod loop_agent;
pub mod observer;
pub mod orchestrator;
pub mod parallel;
pub mod sequential;
pub mod session;
pub mod state;
pub mod store;

#[cfg(test)]
mod testing;

pub use agent::{Agent, AgentHandle, AgentKind, EventStream, InvocationContext};
pub use channel::{ChannelBuilder, ChannelError, EventReceiver, EventSender};
pub use error::{ConclaveError, Result};
pub use event::{Event, EventActions, Message, Role, ToolCall};
pub use hierarchy::{AgentTree, WorkflowHierarchy};
pub use ids::{EventId, InvocationId, SessionId};
pub use loop_agent::{LoopAgent, LoopConfig, LoopState, StopCondition};
pub use observer::{NoopObserver, StepOutcome, TracingObserver, WorkflowObserver};
pub use orchestrator::Orchestrator;
pub use parallel::{ParallelAgent, ParallelConfig};
pub use sequential::{SequentialAgent, SequentialConfig};
pub use session::{ArtifactVersion, CreateSessionRequest, EventFilter, ListOptions, Session, SessionService};
pub use state::{Scope, ScopedKey, ScopedState};
pub use store::InMemorySessionService;
