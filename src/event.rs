//! Events: one recorded step of interaction

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{EventId, InvocationId};

/// Chat role of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Assistant,
    System,
    Tool,
}

/// A tool invocation requested by the assistant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Chat-style message carried by an event
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            ..Default::default()
        }
    }

    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }
}

/// Side effects attached to an event.
///
/// Deltas are applied by the session store in the same critical section that
/// appends the event.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventActions {
    /// Scoped key -> new value
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub state_delta: HashMap<String, Value>,
    /// Artifact name -> new version
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub artifact_delta: HashMap<String, i64>,
    #[serde(default)]
    pub skip_summarization: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_to_agent: Option<String>,
    /// Ask the enclosing loop to stop
    #[serde(default)]
    pub escalate: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom_actions: HashMap<String, Value>,
}

impl EventActions {
    pub fn has_deltas(&self) -> bool {
        !self.state_delta.is_empty() || !self.artifact_delta.is_empty()
    }
}

/// One step of interaction within a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub invocation_id: InvocationId,
    #[serde(default)]
    pub agent_id: String,
    /// Dot-delimited provenance path, e.g. `Pipeline.Analyzer.iter2`
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub content: Message,
    #[serde(default)]
    pub actions: EventActions,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub long_running_tool_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl Event {
    pub fn new(invocation_id: InvocationId) -> Self {
        Self {
            id: EventId::new(),
            timestamp: Utc::now(),
            invocation_id,
            agent_id: String::new(),
            branch: String::new(),
            author: String::new(),
            content: Message::default(),
            actions: EventActions::default(),
            long_running_tool_ids: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    pub fn with_content(mut self, content: Message) -> Self {
        self.content = content;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_state(mut self, key: impl Into<String>, value: Value) -> Self {
        self.actions.state_delta.insert(key.into(), value);
        self
    }

    pub fn with_artifact(mut self, name: impl Into<String>, version: i64) -> Self {
        self.actions.artifact_delta.insert(name.into(), version);
        self
    }

    pub fn with_long_running_tool(mut self, tool_call_id: impl Into<String>) -> Self {
        self.long_running_tool_ids.push(tool_call_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Mark the event as an escalation, the default loop stop signal
    pub fn escalate(mut self) -> Self {
        self.actions.escalate = true;
        self
    }

    /// Whether this event ends the author's turn.
    ///
    /// An assistant message that still carries tool calls never does.
    pub fn is_final_response(&self) -> bool {
        if self.actions.skip_summarization || !self.long_running_tool_ids.is_empty() {
            return true;
        }
        !(self.content.role == Role::Assistant && !self.content.tool_calls.is_empty())
    }

    pub fn metadata_u64(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(Value::as_u64)
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}
