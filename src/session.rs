//! Session model and the session service contract

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::event::Event;
use crate::ids::{EventId, InvocationId, SessionId};
use crate::state::{Scope, ScopedState};

/// A conversation aggregate: identity, scoped state and the event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session ID
    pub id: SessionId,
    /// Owning application
    pub app_name: String,
    /// Owning user
    pub user_id: String,
    /// Root agent this session was created for
    #[serde(default)]
    pub agent_id: String,
    /// Scoped key-value state
    #[serde(default)]
    pub state: ScopedState,
    /// Events in append order
    #[serde(default)]
    pub events: Vec<Event>,
    /// Artifact versions in the order they were recorded
    #[serde(default)]
    pub artifacts: Vec<ArtifactVersion>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
}

impl Session {
    /// Fresh session with empty state and log
    pub fn new(request: CreateSessionRequest) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            app_name: request.app_name,
            user_id: request.user_id,
            agent_id: request.agent_id,
            state: ScopedState::new(),
            events: Vec::new(),
            artifacts: Vec::new(),
            metadata: request.metadata,
            created_at: now,
            last_update_time: now,
        }
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn last_event(&self) -> Option<&Event> {
        self.events.last()
    }

    pub fn contains_event(&self, id: &EventId) -> bool {
        self.events.iter().any(|e| &e.id == id)
    }

    /// Latest recorded version of an artifact
    pub fn artifact_version(&self, name: &str) -> Option<i64> {
        self.artifacts
            .iter()
            .rev()
            .find(|a| a.name == name)
            .map(|a| a.version)
    }
}

/// One artifact version, recorded when an event carrying it is appended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactVersion {
    pub name: String,
    pub version: i64,
    /// Event whose `artifact_delta` introduced this version
    pub event_id: EventId,
    pub recorded_at: DateTime<Utc>,
}

/// Parameters for [`SessionService::create`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub app_name: String,
    pub user_id: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl CreateSessionRequest {
    pub fn new(app_name: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Pagination and app filter for [`SessionService::list`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListOptions {
    #[serde(default)]
    pub app_name: Option<String>,
    /// 0 means no limit
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

impl ListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn app(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = Some(app_name.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// Event query for [`SessionService::get_events`].
///
/// Every set field must match; time bounds are inclusive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default)]
    pub author: Option<String>,
    /// Exact branch path
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub invocation_id: Option<InvocationId>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// 0 means no limit
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn invocation(mut self, invocation_id: InvocationId) -> Self {
        self.invocation_id = Some(invocation_id);
        self
    }

    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self
    }

    pub fn since(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }

    pub fn until(mut self, end: DateTime<Utc>) -> Self {
        self.end_time = Some(end);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if self.author.as_deref().is_some_and(|a| a != event.author) {
            return false;
        }
        if self.branch.as_deref().is_some_and(|b| b != event.branch) {
            return false;
        }
        if self.agent_id.as_deref().is_some_and(|a| a != event.agent_id) {
            return false;
        }
        if self.invocation_id.as_ref().is_some_and(|i| i != &event.invocation_id) {
            return false;
        }
        if self.start_time.is_some_and(|start| event.timestamp < start) {
            return false;
        }
        if self.end_time.is_some_and(|end| event.timestamp > end) {
            return false;
        }
        true
    }
}

/// Apply offset/limit to an already filtered sequence
pub(crate) fn paginate<T>(items: impl Iterator<Item = T>, offset: usize, limit: usize) -> Vec<T> {
    let items = items.skip(offset);
    if limit == 0 {
        items.collect()
    } else {
        items.take(limit).collect()
    }
}

/// Storage contract for sessions.
///
/// Implementations must make `append_event` indivisible per session: the
/// event, its state delta, its artifact versions and the new
/// `last_update_time` become visible together or not at all.
#[async_trait]
pub trait SessionService: Send + Sync {
    async fn create(&self, request: CreateSessionRequest) -> Result<Session>;

    /// Snapshot of a session
    async fn get(&self, session_id: &SessionId) -> Result<Session>;

    /// Merge `metadata` into the session's metadata
    async fn update(&self, session_id: &SessionId, metadata: HashMap<String, Value>) -> Result<()>;

    async fn delete(&self, session_id: &SessionId) -> Result<()>;

    /// Sessions owned by `user_id`, oldest first
    async fn list(&self, user_id: &str, options: &ListOptions) -> Result<Vec<Session>>;

    async fn append_event(&self, session_id: &SessionId, event: Event) -> Result<()>;

    async fn get_events(&self, session_id: &SessionId, filter: &EventFilter) -> Result<Vec<Event>>;

    /// State keyed by `<scope>:<name>`, optionally restricted to one scope
    async fn get_state(&self, session_id: &SessionId, scope: Option<Scope>) -> Result<HashMap<String, Value>>;

    /// Apply a state delta without recording an event
    async fn update_state(&self, session_id: &SessionId, delta: HashMap<String, Value>) -> Result<()>;

    /// Artifact versions, optionally for one artifact name
    async fn get_artifacts(&self, session_id: &SessionId, name: Option<&str>) -> Result<Vec<ArtifactVersion>>;
}
