//! In-memory store of per-client conversations.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use ulid::Ulid;

use super::conversation::Conversation;
use super::transcript::Transcript;
use crate::config::ProviderConfig;
use crate::persona::Persona;

/// A conversation shared between requests of the same client.
///
/// The mutex serializes requests so a session has at most one in flight.
pub type SharedConversation = Arc<Mutex<Conversation>>;

/// How new conversations are seeded.
#[derive(Debug, Clone, Default)]
pub struct ConversationTemplate {
    pub persona: Option<Persona>,
    pub memory_limit: Option<usize>,
    pub transcript_dir: Option<PathBuf>,
}

impl ConversationTemplate {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            persona: Some(config.persona.clone()),
            memory_limit: config.memory_limit,
            transcript_dir: config.transcript_dir.clone(),
        }
    }

    /// Build a fresh conversation, seeding the persona with the current local time.
    pub fn build(&self) -> Conversation {
        let mut conversation = match &self.persona {
            Some(persona) => {
                Conversation::with_persona(persona.system_prompt(Local::now().naive_local()))
                    .unwrap_or_default()
                    .with_speaker_names(&persona.username, &persona.assistant_name)
            }
            None => Conversation::new(),
        };

        if let Some(limit) = self.memory_limit {
            conversation = conversation.with_memory_limit(limit);
        }
        if let Some(dir) = &self.transcript_dir {
            conversation = conversation.with_transcript(Transcript::new(dir));
        }
        conversation
    }
}

struct SessionEntry {
    conversation: SharedConversation,
    last_used: Instant,
}

/// Conversations keyed by session id. Sessions never share history.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<DashMap<String, SessionEntry>>,
    template: Arc<ConversationTemplate>,
}

impl SessionStore {
    pub fn new(template: ConversationTemplate) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            template: Arc::new(template),
        }
    }

    /// Look up a session.
    pub fn get(&self, session_id: &str) -> Option<SharedConversation> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.conversation.clone())
    }

    /// Return the session for `session_id`, or create a new one under a fresh id.
    ///
    /// The returned flag is `true` when a session was created.
    pub fn get_or_create(&self, session_id: Option<&str>) -> (String, SharedConversation, bool) {
        if let Some(id) = session_id
            && let Some(mut entry) = self.sessions.get_mut(id)
        {
            entry.last_used = Instant::now();
            return (id.to_string(), entry.conversation.clone(), false);
        }

        let id = format!("sess_{}", Ulid::new());
        let conversation = Arc::new(Mutex::new(self.template.build()));
        self.sessions.insert(
            id.clone(),
            SessionEntry {
                conversation: conversation.clone(),
                last_used: Instant::now(),
            },
        );
        debug!(session_id = %id, sessions = self.sessions.len(), "Created session");

        (id, conversation, true)
    }

    /// Drop sessions not used within `idle` of `now`. Sessions with a request
    /// in flight are kept. Returns how many were dropped.
    pub fn evict_idle(&self, now: Instant, idle: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, entry| {
            now.saturating_duration_since(entry.last_used) < idle
                || entry.conversation.try_lock().is_err()
        });
        let evicted = before.saturating_sub(self.sessions.len());
        if evicted > 0 {
            debug!(evicted, remaining = self.sessions.len(), "Evicted idle sessions");
        }
        evicted
    }

    /// Sweep idle sessions every `every` until the runtime shuts down.
    pub fn spawn_sweeper(&self, every: Duration, idle: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.evict_idle(Instant::now(), idle);
            }
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;
    use crate::persona::Style;

    fn store_with_persona() -> SessionStore {
        SessionStore::new(ConversationTemplate {
            persona: Some(Persona::new("Matilda", "Ada", Style::Balanced)),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn creates_seeded_sessions() {
        let store = store_with_persona();
        let (id, conversation, created) = store.get_or_create(None);

        assert!(created);
        assert!(id.starts_with("sess_"));
        let conversation = conversation.lock().await;
        assert!(conversation.has_persona());
        assert_eq!(conversation.history()[0].role(), Role::System);
        assert!(conversation.history()[0].text().contains("You're speaking with Ada."));
    }

    #[tokio::test]
    async fn returns_existing_session() {
        let store = store_with_persona();
        let (id, first, _) = store.get_or_create(None);
        first.lock().await.append(Role::User, "Hi").unwrap();

        let (same_id, second, created) = store.get_or_create(Some(&id));
        assert!(!created);
        assert_eq!(same_id, id);
        assert_eq!(second.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let store = store_with_persona();
        let (_, a, _) = store.get_or_create(None);
        let (_, b, _) = store.get_or_create(None);

        a.lock().await.append(Role::User, "only in a").unwrap();
        assert_eq!(a.lock().await.len(), 2);
        assert_eq!(b.lock().await.len(), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn unknown_id_gets_a_fresh_session() {
        let store = SessionStore::new(ConversationTemplate::default());
        let (id, _, created) = store.get_or_create(Some("sess_forged"));
        assert!(created);
        assert_ne!(id, "sess_forged");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn evicts_only_idle_sessions() {
        let store = SessionStore::new(ConversationTemplate::default());
        let (first, _, _) = store.get_or_create(None);
        store.get_or_create(None);

        assert_eq!(store.evict_idle(Instant::now(), Duration::from_secs(30)), 0);
        assert_eq!(store.len(), 2);

        let later = Instant::now() + Duration::from_secs(60);
        assert_eq!(store.evict_idle(later, Duration::from_secs(30)), 2);
        assert!(store.get(&first).is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn keeps_sessions_with_a_request_in_flight() {
        let store = SessionStore::new(ConversationTemplate::default());
        let (busy, conversation, _) = store.get_or_create(None);
        let (idle, _, _) = store.get_or_create(None);

        let _guard = conversation.lock().await;
        assert_eq!(store.evict_idle(Instant::now(), Duration::ZERO), 1);
        assert!(store.get(&busy).is_some());
        assert!(store.get(&idle).is_none());
    }

    #[tokio::test]
    async fn sweeper_drops_idle_sessions() {
        let store = SessionStore::new(ConversationTemplate::default());
        for _ in 0..5 {
            store.get_or_create(None);
        }

        let sweeper = store.spawn_sweeper(Duration::from_millis(10), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(200)).await;
        sweeper.abort();

        assert!(store.is_empty());
    }

    #[test]
    fn template_applies_memory_limit() {
        let template = ConversationTemplate {
            memory_limit: Some(1),
            ..Default::default()
        };
        let mut conversation = template.build();
        conversation.append(Role::User, "a").unwrap();
        conversation.append(Role::Assistant, "b").unwrap();
        assert_eq!(conversation.len(), 1);
        assert!(!conversation.memory_summary().is_empty());
    }
}
