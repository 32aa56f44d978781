//! Chat session management
//!
//! The registry owns every session. Transcripts are append-only; each session
//! has its own lock so sessions never contend with each other. Appends hold the
//! map's read lock for their duration and reclamation takes the write lock, so
//! an idle session can never be reaped in the middle of an append.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use chatgate_core::{BusyPolicy, Error, Message, Result, Role};

/// Snapshot of a session
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Session summary for listings
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub busy: bool,
}

struct Transcript {
    messages: Vec<Message>,
    resolved_calls: HashSet<String>,
    updated_at: DateTime<Utc>,
    last_activity: Instant,
}

impl Transcript {
    fn new() -> Self {
        Self {
            messages: Vec::new(),
            resolved_calls: HashSet::new(),
            updated_at: Utc::now(),
            last_activity: Instant::now(),
        }
    }

    fn push(&mut self, message: Message) -> Result<()> {
        match message.role {
            Role::Tool => {
                let (Some(call), Some(result)) = (&message.tool_call, &message.tool_result) else {
                    return Err(Error::invalid_input(
                        "tool message must carry both the tool call and its result",
                    ));
                };
                if call.id != result.call_id {
                    return Err(Error::invalid_input(format!(
                        "tool result '{}' does not match tool call '{}'",
                        result.call_id, call.id
                    )));
                }
                if self.resolved_calls.contains(&call.id) {
                    return Err(Error::invalid_input(format!(
                        "tool call '{}' already has a result",
                        call.id
                    )));
                }
                self.resolved_calls.insert(call.id.clone());
            }
            Role::User | Role::Assistant => {
                if message.tool_result.is_some() {
                    return Err(Error::invalid_input(format!(
                        "{} message cannot carry a tool result",
                        message.role
                    )));
                }
            }
        }

        self.messages.push(message);
        self.updated_at = Utc::now();
        self.last_activity = Instant::now();
        Ok(())
    }
}

struct SessionEntry {
    id: String,
    created_at: DateTime<Utc>,
    transcript: Mutex<Transcript>,
    round: Arc<Mutex<()>>,
    closed: AtomicBool,
}

impl SessionEntry {
    fn new(id: String) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            transcript: Mutex::new(Transcript::new()),
            round: Arc::new(Mutex::new(())),
            closed: AtomicBool::new(false),
        }
    }

    fn is_busy(&self) -> bool {
        self.round.try_lock().is_err()
    }
}

/// Exclusive right to run one exchange on a session.
///
/// Released on drop.
pub struct RoundGuard {
    session_id: String,
    _permit: OwnedMutexGuard<()>,
}

impl RoundGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl std::fmt::Debug for RoundGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundGuard")
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// Registry owning all live sessions
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<SessionEntry>>>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_max_sessions(1000)
    }

    pub fn with_max_sessions(max_sessions: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_sessions: max_sessions.max(1),
        }
    }

    /// Create a new session with a fresh opaque id.
    ///
    /// At capacity the least recently active idle session is evicted.
    pub async fn create(&self) -> Session {
        let entry = Arc::new(SessionEntry::new(Uuid::new_v4().to_string()));
        let mut sessions = self.sessions.write().await;

        if sessions.len() >= self.max_sessions {
            let oldest = sessions
                .values()
                .filter(|e| !e.is_busy())
                .filter_map(|e| e.transcript.try_lock().ok().map(|t| (e.id.clone(), t.last_activity)))
                .min_by_key(|(_, last_activity)| *last_activity)
                .map(|(id, _)| id);
            match oldest {
                Some(id) => {
                    if let Some(evicted) = sessions.remove(&id) {
                        evicted.closed.store(true, Ordering::SeqCst);
                    }
                    info!("Session capacity reached, evicted {}", id);
                }
                None => warn!(
                    "Session capacity ({}) reached but every session is busy",
                    self.max_sessions
                ),
            }
        }

        let session = Session {
            id: entry.id.clone(),
            messages: Vec::new(),
            created_at: entry.created_at,
            updated_at: entry.created_at,
        };
        sessions.insert(entry.id.clone(), entry);
        debug!("Created session {}", session.id);
        session
    }

    async fn entry(&self, id: &str) -> Result<Arc<SessionEntry>> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::session_not_found(id))
    }

    /// Snapshot of a session
    pub async fn get(&self, id: &str) -> Result<Session> {
        let entry = self.entry(id).await?;
        let transcript = entry.transcript.lock().await;
        Ok(Session {
            id: entry.id.clone(),
            messages: transcript.messages.clone(),
            created_at: entry.created_at,
            updated_at: transcript.updated_at,
        })
    }

    /// Whether a session exists
    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    /// Append a message; atomic and totally ordered per session.
    pub async fn append(&self, id: &str, message: Message) -> Result<()> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(id).ok_or_else(|| Error::session_not_found(id))?;
        let mut transcript = entry.transcript.lock().await;
        transcript.push(message)
    }

    /// Ordered copy of a session's transcript
    pub async fn transcript(&self, id: &str) -> Result<Vec<Message>> {
        let entry = self.entry(id).await?;
        let transcript = entry.transcript.lock().await;
        Ok(transcript.messages.clone())
    }

    /// Remove a session. Later appends fail with `SessionNotFound`.
    pub async fn close(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id);
        match removed {
            Some(entry) => {
                entry.closed.store(true, Ordering::SeqCst);
                debug!("Closed session {}", id);
                true
            }
            None => false,
        }
    }

    /// Acquire the per-session round permit.
    ///
    /// `Queue` waits in arrival order; `Reject` fails with `SessionBusy` when a
    /// round is already in flight.
    pub async fn begin_round(&self, id: &str, policy: BusyPolicy) -> Result<RoundGuard> {
        let entry = self.entry(id).await?;
        let permit = match policy {
            BusyPolicy::Queue => Arc::clone(&entry.round).lock_owned().await,
            BusyPolicy::Reject => Arc::clone(&entry.round)
                .try_lock_owned()
                .map_err(|_| Error::session_busy(id))?,
        };

        // The session may have been closed while we waited
        if entry.closed.load(Ordering::SeqCst) {
            return Err(Error::session_not_found(id));
        }

        Ok(RoundGuard {
            session_id: id.to_string(),
            _permit: permit,
        })
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let entries: Vec<Arc<SessionEntry>> = self.sessions.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(entries.len());
        for entry in entries {
            let transcript = entry.transcript.lock().await;
            infos.push(SessionInfo {
                id: entry.id.clone(),
                message_count: transcript.messages.len(),
                created_at: entry.created_at,
                updated_at: transcript.updated_at,
                busy: entry.is_busy(),
            });
        }
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Remove sessions idle for longer than `idle_timeout`.
    ///
    /// Sessions with a round in flight are never reclaimed.
    pub async fn reap_idle(&self, idle_timeout: Duration) -> Vec<String> {
        let mut sessions = self.sessions.write().await;
        let now = Instant::now();

        let expired: Vec<String> = sessions
            .values()
            .filter(|entry| !entry.is_busy())
            .filter(|entry| match entry.transcript.try_lock() {
                Ok(t) => now.duration_since(t.last_activity) >= idle_timeout,
                Err(_) => false,
            })
            .map(|entry| entry.id.clone())
            .collect();

        for id in &expired {
            if let Some(entry) = sessions.remove(id) {
                entry.closed.store(true, Ordering::SeqCst);
            }
        }

        if !expired.is_empty() {
            info!("Reaped {} idle sessions ({} remain)", expired.len(), sessions.len());
        }
        expired
    }

    /// Periodically reap idle sessions until `shutdown` is cancelled.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        idle_timeout: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Session reaper stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        registry.reap_idle(idle_timeout).await;
                    }
                }
            }
        })
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
