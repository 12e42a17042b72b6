//! In-memory session service

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::error::{ConclaveError, Result};
use crate::event::Event;
use crate::ids::{EventId, SessionId};
use crate::session::{
    paginate, ArtifactVersion, CreateSessionRequest, EventFilter, ListOptions, Session, SessionService,
};
use crate::state::{Scope, ScopedState};

/// A stored session plus the index used to reject replayed events
struct SessionRecord {
    session: Session,
    event_ids: HashSet<EventId>,
}

/// Shared, individually locked session record
#[derive(Clone)]
struct SessionHandle {
    inner: Arc<RwLock<SessionRecord>>,
}

impl SessionHandle {
    fn new(session: Session) -> Self {
        Self {
            inner: Arc::new(RwLock::new(SessionRecord {
                session,
                event_ids: HashSet::new(),
            })),
        }
    }
}

impl std::ops::Deref for SessionHandle {
    type Target = RwLock<SessionRecord>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// Concurrency-safe [`SessionService`] kept entirely in process memory.
///
/// The session index has its own lock; each session has a writer lock that
/// covers its event log, state and artifacts. The two are never held at
/// the same time.
#[derive(Default)]
pub struct InMemorySessionService {
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
}

impl InMemorySessionService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    fn handle(&self, session_id: &SessionId) -> Result<SessionHandle> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| ConclaveError::SessionNotFound(session_id.clone()))
    }
}

#[async_trait]
impl SessionService for InMemorySessionService {
    #[instrument(skip_all, fields(app = %request.app_name, user = %request.user_id))]
    async fn create(&self, request: CreateSessionRequest) -> Result<Session> {
        let session = Session::new(request);
        let id = session.id.clone();

        self.sessions
            .write()
            .insert(id.clone(), SessionHandle::new(session.clone()));

        info!(session_id = %id, "Created session");
        Ok(session)
    }

    async fn get(&self, session_id: &SessionId) -> Result<Session> {
        let handle = self.handle(session_id)?;
        let record = handle.read();
        Ok(record.session.clone())
    }

    #[instrument(skip_all, fields(session_id = %session_id))]
    async fn update(&self, session_id: &SessionId, metadata: HashMap<String, Value>) -> Result<()> {
        let handle = self.handle(session_id)?;
        let mut record = handle.write();
        record.session.metadata.extend(metadata);
        record.session.last_update_time = Utc::now();

        debug!("Updated session metadata");
        Ok(())
    }

    #[instrument(skip_all, fields(session_id = %session_id))]
    async fn delete(&self, session_id: &SessionId) -> Result<()> {
        match self.sessions.write().remove(session_id) {
            Some(_) => {
                info!("Deleted session");
                Ok(())
            }
            None => Err(ConclaveError::SessionNotFound(session_id.clone())),
        }
    }

    async fn list(&self, user_id: &str, options: &ListOptions) -> Result<Vec<Session>> {
        let handles: Vec<SessionHandle> = self.sessions.read().values().cloned().collect();

        let mut sessions: Vec<Session> = handles
            .iter()
            .filter_map(|handle| {
                let record = handle.read();
                let session = &record.session;
                let owned = session.user_id == user_id;
                let in_app = options
                    .app_name
                    .as_deref()
                    .map_or(true, |app| app == session.app_name);
                (owned && in_app).then(|| session.clone())
            })
            .collect();

        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(paginate(sessions.into_iter(), options.offset, options.limit))
    }

    #[instrument(skip_all, fields(session_id = %session_id, event_id = %event.id))]
    async fn append_event(&self, session_id: &SessionId, event: Event) -> Result<()> {
        let handle = self.handle(session_id)?;

        if let Err(err) = ScopedState::validate_delta(&event.actions.state_delta) {
            warn!(error = %err, "Rejected event with invalid state delta");
            return Err(err);
        }

        let mut record = handle.write();
        if record.event_ids.contains(&event.id) {
            return Err(ConclaveError::DuplicateEvent(event.id));
        }

        let now = Utc::now();
        let session = &mut record.session;
        session.state.apply_delta(&event.actions.state_delta)?;

        let mut artifacts: Vec<_> = event.actions.artifact_delta.iter().collect();
        artifacts.sort_by(|a, b| a.0.cmp(b.0));
        for (name, version) in artifacts {
            session.artifacts.push(ArtifactVersion {
                name: name.clone(),
                version: *version,
                event_id: event.id.clone(),
                recorded_at: now,
            });
        }

        debug!(
            author = %event.author,
            branch = %event.branch,
            state_keys = event.actions.state_delta.len(),
            "Appended event"
        );

        let id = event.id.clone();
        session.events.push(event);
        session.last_update_time = now;
        record.event_ids.insert(id);
        Ok(())
    }

    async fn get_events(&self, session_id: &SessionId, filter: &EventFilter) -> Result<Vec<Event>> {
        let handle = self.handle(session_id)?;
        let record = handle.read();
        let matching = record
            .session
            .events
            .iter()
            .filter(|e| filter.matches(e))
            .cloned();
        Ok(paginate(matching, filter.offset, filter.limit))
    }

    async fn get_state(&self, session_id: &SessionId, scope: Option<Scope>) -> Result<HashMap<String, Value>> {
        let handle = self.handle(session_id)?;
        let record = handle.read();
        Ok(match scope {
            Some(scope) => record.session.state.scope(scope),
            None => record.session.state.to_map(),
        })
    }

    #[instrument(skip_all, fields(session_id = %session_id, keys = delta.len()))]
    async fn update_state(&self, session_id: &SessionId, delta: HashMap<String, Value>) -> Result<()> {
        let handle = self.handle(session_id)?;
        let mut record = handle.write();
        record.session.state.apply_delta(&delta)?;
        record.session.last_update_time = Utc::now();

        debug!("Updated session state");
        Ok(())
    }

    async fn get_artifacts(&self, session_id: &SessionId, name: Option<&str>) -> Result<Vec<ArtifactVersion>> {
        let handle = self.handle(session_id)?;
        let record = handle.read();
        Ok(record
            .session
            .artifacts
            .iter()
            .filter(|a| name.map_or(true, |n| n == a.name))
            .cloned()
            .collect())
    }
}
