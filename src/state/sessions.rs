use crate::openai::conversation::{Conversation, Message};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const DEFAULT_MAX_SESSIONS: usize = 1024;
const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3600);

struct Session {
    conversation: Conversation,
    last_seen: Instant,
}

/// In-memory chat histories keyed by session id. Lost on restart.
///
/// The store holds at most `max_sessions` entries: sessions unused for longer
/// than the ttl are dropped first, then the least recently seen one. A turn
/// is only recorded once it produced a reply, as a user/model pair.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
    max_history_turns: usize,
    max_sessions: usize,
    session_ttl: Duration,
}

impl SessionStore {
    pub fn new(max_history_turns: usize) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            max_history_turns,
            max_sessions: DEFAULT_MAX_SESSIONS,
            session_ttl: DEFAULT_SESSION_TTL,
        }
    }

    pub fn with_limits(mut self, max_sessions: usize, session_ttl: Duration) -> Self {
        self.max_sessions = max_sessions.max(1);
        self.session_ttl = session_ttl;
        self
    }

    /// Snapshot of the session's history followed by the new user turn.
    /// The stored history is left untouched until [`end_turn`](Self::end_turn).
    pub fn begin_turn(&self, session_id: &str, message: &str) -> Conversation {
        self.begin_turn_at(session_id, message, Instant::now())
    }

    pub fn begin_turn_at(&self, session_id: &str, message: &str, now: Instant) -> Conversation {
        let mut sessions = self.sessions.lock();
        if !sessions.contains_key(session_id) {
            self.make_room(&mut sessions, now);
        }
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session {
                conversation: Conversation::new(),
                last_seen: now,
            });
        session.last_seen = now;

        let mut snapshot = session.conversation.clone();
        snapshot.push(Message::user(message));
        snapshot
    }

    /// Record `message` and its reply, then trim the history. Without a reply
    /// (error, abort or disconnect) nothing is recorded.
    pub fn end_turn(&self, session_id: &str, message: String, reply: Option<String>) {
        let Some(reply) = reply else {
            return;
        };
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(session_id) {
            Some(session) => {
                session.conversation.push(Message::user(message));
                session.conversation.push(Message::model(reply));
                session.conversation.trim_to(self.max_history_turns);
                session.last_seen = Instant::now();
            }
            None => debug!("Session {session_id} evicted before its turn completed"),
        }
    }

    /// Drop sessions not seen for longer than the ttl. Returns how many went.
    pub fn prune_expired_at(&self, now: Instant) -> usize {
        let mut sessions = self.sessions.lock();
        self.prune(&mut sessions, now)
    }

    fn prune(&self, sessions: &mut HashMap<String, Session>, now: Instant) -> usize {
        let before = sessions.len();
        sessions.retain(|_, s| now.saturating_duration_since(s.last_seen) <= self.session_ttl);
        before - sessions.len()
    }

    fn make_room(&self, sessions: &mut HashMap<String, Session>, now: Instant) {
        if sessions.len() < self.max_sessions {
            return;
        }
        let expired = self.prune(sessions, now);
        if expired > 0 {
            debug!("Expired {expired} idle session(s)");
        }
        while sessions.len() >= self.max_sessions {
            let Some(oldest) = sessions
                .iter()
                .min_by_key(|(_, s)| s.last_seen)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            debug!("Evicting least recently used session {oldest}");
            sessions.remove(&oldest);
        }
    }

    pub fn history(&self, session_id: &str) -> Option<Conversation> {
        self.sessions
            .lock()
            .get(session_id)
            .map(|s| s.conversation.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}
