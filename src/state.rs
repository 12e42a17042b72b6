//! Scope-partitioned session state
//!
//! Every key lives in exactly one [`Scope`]. The scope is read from the token
//! before the first `:`; keys without a recognized token land in
//! [`Scope::Session`]. The canonical form of a key is `<scope>:<name>`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConclaveError, Result};

/// State partition a key belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Shared by every user and session of an application
    App,
    /// Shared by every session of one user
    User,
    /// Owned by a single session
    Session,
    /// Call-scoped scratch data; never purged by the core
    Temp,
}

impl Scope {
    pub const ALL: [Scope; 4] = [Scope::App, Scope::User, Scope::Session, Scope::Temp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::App => "app",
            Scope::User => "user",
            Scope::Session => "session",
            Scope::Temp => "temp",
        }
    }

    /// Key prefix including the separator, e.g. `"app:"`
    pub fn prefix(&self) -> &'static str {
        match self {
            Scope::App => "app:",
            Scope::User => "user:",
            Scope::Session => "session:",
            Scope::Temp => "temp:",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "app" => Some(Scope::App),
            "user" => Some(Scope::User),
            "session" => Some(Scope::Session),
            "temp" => Some(Scope::Temp),
            _ => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = ConclaveError;

    fn from_str(s: &str) -> Result<Self> {
        Scope::from_token(s).ok_or_else(|| ConclaveError::InvalidStateKey(s.to_string()))
    }
}

/// A key split into its scope and name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopedKey {
    pub scope: Scope,
    pub name: String,
}

impl ScopedKey {
    pub fn new(scope: Scope, name: impl Into<String>) -> Self {
        Self {
            scope,
            name: name.into(),
        }
    }

    /// Split `raw` on its first `:`.
    ///
    /// Unrecognized tokens are part of the name: `"foo:bar"` is the session
    /// key `foo:bar`.
    pub fn parse(raw: &str) -> Self {
        if let Some((token, rest)) = raw.split_once(':') {
            if let Some(scope) = Scope::from_token(token) {
                return Self::new(scope, rest);
            }
        }
        Self::new(Scope::Session, raw)
    }

    /// Like [`ScopedKey::parse`], rejecting keys with an empty name
    pub fn parse_strict(raw: &str) -> Result<Self> {
        let key = Self::parse(raw);
        if key.name.is_empty() {
            return Err(ConclaveError::InvalidStateKey(raw.to_string()));
        }
        Ok(key)
    }

    /// Canonical `<scope>:<name>` form
    pub fn qualified(&self) -> String {
        format!("{}{}", self.scope.prefix(), self.name)
    }
}

impl fmt::Display for ScopedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.scope.prefix(), self.name)
    }
}

/// Scoped key-value store owned by a session.
///
/// Serializes as a flat JSON object keyed by canonical key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopedState {
    entries: BTreeMap<String, Value>,
}

impl ScopedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(&ScopedKey::parse(key).qualified())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Upsert a value, last write wins
    pub fn set(&mut self, key: &str, value: Value) -> Result<()> {
        let key = ScopedKey::parse_strict(key)?;
        self.entries.insert(key.qualified(), value);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(&ScopedKey::parse(key).qualified())
    }

    /// Check every key of a delta without applying anything
    pub fn validate_delta(delta: &HashMap<String, Value>) -> Result<()> {
        for key in delta.keys() {
            ScopedKey::parse_strict(key)?;
        }
        Ok(())
    }

    /// Apply a whole delta or nothing
    pub fn apply_delta(&mut self, delta: &HashMap<String, Value>) -> Result<()> {
        Self::validate_delta(delta)?;
        for (key, value) in delta {
            self.entries
                .insert(ScopedKey::parse(key).qualified(), value.clone());
        }
        Ok(())
    }

    /// Entries of one scope, keyed canonically
    pub fn scope(&self, scope: Scope) -> HashMap<String, Value> {
        self.entries
            .range(scope.prefix().to_string()..)
            .take_while(|(k, _)| k.starts_with(scope.prefix()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Every entry, keyed canonically
    pub fn to_map(&self) -> HashMap<String, Value> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Entries in canonical key order
    pub fn iter(&self) -> impl Iterator<Item = (ScopedKey, &Value)> {
        self.entries.iter().map(|(k, v)| (ScopedKey::parse(k), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
