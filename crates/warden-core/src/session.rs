//! Per-conversation rolling message history.
//!
//! Sessions are keyed by conversation, created lazily on the first message and
//! seeded from a character template. A per-key turn lock keeps one
//! query/commit pair in flight per conversation while unrelated conversations
//! proceed concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::SessionKey;
use crate::model::types::{ChatMessage, ChatRole};

#[derive(Clone, Debug, Default)]
struct Session {
    messages: Vec<ChatMessage>,
    total_tokens: u64,
}

pub struct SessionStore {
    max_tokens: u64,
    sessions: Mutex<HashMap<SessionKey, Session>>,
    turn_locks: Mutex<HashMap<SessionKey, Arc<Mutex<()>>>>,
}

impl SessionStore {
    pub fn new(max_tokens: u64) -> Self {
        Self {
            max_tokens,
            sessions: Mutex::new(HashMap::new()),
            turn_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Serialize one query/commit pair per conversation. The guard is held by
    /// the caller across the remote call; other conversations are unaffected.
    pub async fn begin_turn(&self, key: &SessionKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.turn_locks.lock().await;
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Append the user turn and return the full context, seeding a new session
    /// with `system_text` when none exists.
    pub async fn query(
        &self,
        key: &SessionKey,
        system_text: &str,
        user_text: &str,
    ) -> Vec<ChatMessage> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.entry(key.clone()).or_default();
        if session.messages.is_empty() {
            session.messages.push(ChatMessage::system(system_text));
        }
        session.messages.push(ChatMessage::user(user_text));
        session.messages.clone()
    }

    /// Record the assistant turn and the reported cumulative token usage.
    /// When usage crosses the budget the oldest exchange is shed so the next
    /// context shrinks.
    pub async fn commit(&self, key: &SessionKey, assistant_text: &str, total_tokens: u64) {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(key) else {
            return;
        };
        session.messages.push(ChatMessage::assistant(assistant_text));
        session.total_tokens = total_tokens;

        if session.total_tokens > self.max_tokens {
            shed_oldest_exchange(&mut session.messages);
        }
    }

    pub async fn clear(&self, key: &SessionKey) {
        self.sessions.lock().await.remove(key);
        let mut locks = self.turn_locks.lock().await;
        // Prune the turn lock unless a turn still holds it.
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }

    pub async fn clear_all(&self) {
        self.sessions.lock().await.clear();
        self.turn_locks
            .lock()
            .await
            .retain(|_, l| Arc::strong_count(l) > 1);
    }

    #[cfg(test)]
    async fn turn_lock_count(&self) -> usize {
        self.turn_locks.lock().await.len()
    }
}

/// Drop the oldest non-system user/assistant exchange, keeping the system
/// turn and at least the latest exchange.
fn shed_oldest_exchange(messages: &mut Vec<ChatMessage>) {
    if messages.len() <= 3 {
        return;
    }
    let Some(idx) = messages.iter().position(|m| m.role != ChatRole::System) else {
        return;
    };
    if messages.len() - 1 <= idx + 2 {
        return;
    }
    messages.remove(idx);
    messages.remove(idx);
}

/// Substitute `{name}`, `{bot_name}` and (when supplied) `{group_name}` in a
/// character template. A placeholder with no supplied value stays literal
/// rather than failing the render.
pub fn render_template(
    template: &str,
    name: &str,
    bot_name: &str,
    group_name: Option<&str>,
) -> String {
    let mut out = template
        .replace("{name}", name)
        .replace("{bot_name}", bot_name);
    if let Some(group) = group_name {
        out = out.replace("{group_name}", group);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> SessionKey {
        SessionKey(s.to_string())
    }

    #[tokio::test]
    async fn query_commit_query_preserves_order() {
        let store = SessionStore::new(10_000);
        let k = key("room-1");

        let first = store.query(&k, "You are a bot.", "hello").await;
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].role, ChatRole::System);

        store.commit(&k, "hi there", 30).await;
        let second = store.query(&k, "ignored for existing session", "how are you").await;
        let contents: Vec<&str> = second.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            contents,
            vec!["You are a bot.", "hello", "hi there", "how are you"]
        );
    }

    #[tokio::test]
    async fn clear_reseeds_on_next_query() {
        let store = SessionStore::new(10_000);
        let k = key("room-2");
        store.query(&k, "seed one", "hello").await;
        store.commit(&k, "reply", 20).await;
        store.clear(&k).await;

        let fresh = store.query(&k, "seed two", "again").await;
        assert_eq!(fresh.len(), 2);
        assert_eq!(fresh[0].content, "seed two");
    }

    #[tokio::test]
    async fn over_budget_commit_sheds_oldest_exchange() {
        let store = SessionStore::new(100);
        let k = key("room-3");
        store.query(&k, "sys", "q1").await;
        store.commit(&k, "a1", 50).await;
        store.query(&k, "sys", "q2").await;
        store.commit(&k, "a2", 150).await;

        let ctx = store.query(&k, "sys", "q3").await;
        let contents: Vec<&str> = ctx.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["sys", "q2", "a2", "q3"]);
    }

    #[tokio::test]
    async fn turn_lock_serializes_one_conversation_only() {
        let store = Arc::new(SessionStore::new(10_000));
        let guard = store.begin_turn(&key("busy")).await;

        // A different conversation is not blocked.
        let other = store.begin_turn(&key("idle")).await;
        drop(other);

        // The same conversation is blocked until the guard drops.
        let store2 = store.clone();
        let contended = tokio::spawn(async move { store2.begin_turn(&key("busy")).await });
        tokio::task::yield_now().await;
        assert!(!contended.is_finished());
        drop(guard);
        contended.await.unwrap();
    }

    #[tokio::test]
    async fn clear_prunes_idle_turn_locks() {
        let store = SessionStore::new(10_000);
        let k = key("room-x");
        drop(store.begin_turn(&k).await);
        store.query(&k, "sys", "hi").await;
        store.clear(&k).await;
        assert_eq!(store.turn_lock_count().await, 0);

        // A lock still held by an in-flight turn survives the clear.
        let busy = key("room-y");
        let guard = store.begin_turn(&busy).await;
        store.clear(&busy).await;
        assert_eq!(store.turn_lock_count().await, 1);
        drop(guard);

        store.begin_turn(&k).await;
        store.clear_all().await;
        assert_eq!(store.turn_lock_count().await, 0);
    }

    #[test]
    fn template_substitutes_supplied_values_only() {
        let direct = render_template("Hi {name}, I am {bot_name} in {group_name}.", "Ann", "Bot", None);
        assert_eq!(direct, "Hi Ann, I am Bot in {group_name}.");

        let group = render_template(
            "Hi {name}, I am {bot_name} in {group_name}.",
            "Ann",
            "Bot",
            Some("Rustaceans"),
        );
        assert_eq!(group, "Hi Ann, I am Bot in Rustaceans.");

        // Unknown placeholders stay literal.
        let odd = render_template("Hello {nickname}", "Ann", "Bot", None);
        assert_eq!(odd, "Hello {nickname}");
    }
}
