//! Inbound-event pipeline: dedup, license gate, context build, completion,
//! reply dispatch.
//!
//! Each event runs on its own task; the only serialization points are the
//! per-conversation turn lock and the ledger's single writer. Every non-dropped
//! event results in exactly one `send`.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::{
    completion::CompletionRunner,
    config::Config,
    dedup::Deduplicator,
    domain::{ConversationKind, InboundEvent, Reply},
    ledger::{Decision, LicenseLedger, RedeemOutcome, WARRANT_CODE_LEN, WARRANT_PREFIX},
    messaging::MessagingPort,
    model::client::ModelClient,
    session::{render_template, SessionStore},
    Result,
};

const MEMORY_CLEARED: &str = "Memory cleared";
const ALL_MEMORY_CLEARED: &str = "All memory cleared";
const CONFIG_RELOADED: &str = "Configuration reloaded";

/// Terminal state of one event's pipeline run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// A reply went out through the transport.
    Dispatched,
    /// Duplicate or stale; nothing sent.
    Dropped,
    /// License gate stopped the event (a fixed notice may have gone out).
    Denied,
    /// Completion failed after retries; the apology reply still went out.
    Errored,
}

pub struct Dispatcher {
    cfg: RwLock<Arc<Config>>,
    dedup: Deduplicator,
    ledger: LicenseLedger,
    sessions: SessionStore,
    runner: CompletionRunner,
    transport: Arc<dyn MessagingPort>,
}

impl Dispatcher {
    pub fn new(
        cfg: Config,
        client: Arc<dyn ModelClient>,
        transport: Arc<dyn MessagingPort>,
    ) -> Result<Self> {
        let ledger = LicenseLedger::open(&cfg)?;
        let dedup = Deduplicator::new(&cfg);
        let sessions = SessionStore::new(cfg.max_session_tokens);
        let runner = CompletionRunner::new(&cfg, client);
        Ok(Self {
            cfg: RwLock::new(Arc::new(cfg)),
            dedup,
            ledger,
            sessions,
            runner,
            transport,
        })
    }

    /// Operator access for seeding warrant codes.
    pub fn ledger(&self) -> &LicenseLedger {
        &self.ledger
    }

    /// Run one inbound event to a terminal state. Only ledger corruption and
    /// transport-send failures bubble up; everything else resolves to a reply.
    pub async fn handle(&self, event: InboundEvent) -> Result<Outcome> {
        if !self.dedup.admit(&event.id, event.created_at).await {
            return Ok(Outcome::Dropped);
        }
        let cfg = self.cfg.read().await.clone();
        let text = event.text.trim().to_string();

        if let Some(outcome) = self.handle_control(&cfg, &event, &text).await? {
            return Ok(outcome);
        }

        if event.kind == ConversationKind::Direct {
            if let Some(outcome) = self.handle_warrant(&cfg, &event, &text).await? {
                return Ok(outcome);
            }
            match self.ledger.check_access(&event.sender).await? {
                Decision::Allowed
                | Decision::GracePeriod { .. }
                | Decision::Unactivated { .. } => {}
                Decision::Expired { notify } => {
                    if notify {
                        self.send(&event, Reply::text(&cfg.arrive_message)).await?;
                    }
                    return Ok(Outcome::Denied);
                }
                Decision::Blocked { notify } => {
                    if notify {
                        self.send(&event, Reply::text(&cfg.warning_message)).await?;
                    }
                    return Ok(Outcome::Denied);
                }
            }
        }

        // Hold the turn lock across the remote call so a second message in
        // the same conversation cannot interleave its history.
        let _turn = self.sessions.begin_turn(&event.session_key).await;

        let system_text = match event.kind {
            ConversationKind::Direct => render_template(
                &cfg.character_desc,
                &event.sender.nickname,
                &cfg.bot_name,
                None,
            ),
            ConversationKind::Group => render_template(
                &cfg.group_character_desc,
                &event.sender.nickname,
                &cfg.bot_name,
                event.conversation_name.as_deref(),
            ),
        };
        let messages = self
            .sessions
            .query(&event.session_key, &system_text, &text)
            .await;

        let reply = self
            .runner
            .complete(&cfg, messages, event.credential.clone())
            .await;
        if reply.result.is_failure() {
            if reply.discard_session {
                self.sessions.clear(&event.session_key).await;
            }
            self.send(&event, Reply::error(reply.result.content)).await?;
            return Ok(Outcome::Errored);
        }

        self.sessions
            .commit(
                &event.session_key,
                &reply.result.content,
                reply.result.total_tokens,
            )
            .await;
        self.send(&event, Reply::text(reply.result.content)).await?;
        Ok(Outcome::Dispatched)
    }

    /// Control commands short-circuit before licensing and never reach the
    /// completion service.
    async fn handle_control(
        &self,
        cfg: &Config,
        event: &InboundEvent,
        text: &str,
    ) -> Result<Option<Outcome>> {
        if cfg.clear_memory_commands.iter().any(|c| c == text) {
            self.sessions.clear(&event.session_key).await;
            self.send(event, Reply::info(MEMORY_CLEARED)).await?;
            return Ok(Some(Outcome::Dispatched));
        }
        if text == cfg.clear_all_command {
            self.sessions.clear_all().await;
            self.send(event, Reply::info(ALL_MEMORY_CLEARED)).await?;
            return Ok(Some(Outcome::Dispatched));
        }
        if text == cfg.reload_command {
            let fresh = Config::load()?;
            *self.cfg.write().await = Arc::new(fresh);
            self.send(event, Reply::info(CONFIG_RELOADED)).await?;
            return Ok(Some(Outcome::Dispatched));
        }
        Ok(None)
    }

    /// Warrant codes are a side-channel detected by shape: the prefix plus a
    /// fixed-length code.
    async fn handle_warrant(
        &self,
        cfg: &Config,
        event: &InboundEvent,
        text: &str,
    ) -> Result<Option<Outcome>> {
        if !text.starts_with(WARRANT_PREFIX) || text.chars().count() != WARRANT_CODE_LEN + 1 {
            return Ok(None);
        }
        let code = &text[WARRANT_PREFIX.len_utf8()..];
        match self.ledger.redeem(code, &event.sender).await? {
            RedeemOutcome::Granted { quota_days } => {
                tracing::info!(quota_days, nickname = %event.sender.nickname, "sender activated");
                self.send(event, Reply::info(&cfg.warrant_success_message))
                    .await?;
                Ok(Some(Outcome::Dispatched))
            }
            outcome => {
                tracing::info!(?outcome, "warrant redemption rejected");
                self.send(event, Reply::error(&cfg.warrant_invalid_message))
                    .await?;
                Ok(Some(Outcome::Denied))
            }
        }
    }

    async fn send(&self, event: &InboundEvent, reply: Reply) -> Result<()> {
        self.transport.send(reply, &event.destination).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::Mutex;

    use super::*;
    use crate::domain::{Destination, EventId, ReplyKind, SenderKey, SessionKey};
    use crate::model::types::{CompletionFailure, CompletionRequest, CompletionResult};

    struct ScriptedClient {
        script: StdMutex<VecDeque<std::result::Result<CompletionResult, CompletionFailure>>>,
        requests: StdMutex<Vec<CompletionRequest>>,
    }

    impl ScriptedClient {
        fn new(
            script: Vec<std::result::Result<CompletionResult, CompletionFailure>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                script: StdMutex::new(script.into()),
                requests: StdMutex::new(Vec::new()),
            })
        }

        fn last_request(&self) -> CompletionRequest {
            self.requests.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedClient {
        async fn complete(
            &self,
            req: CompletionRequest,
        ) -> std::result::Result<CompletionResult, CompletionFailure> {
            self.requests.lock().unwrap().push(req);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected completion attempt")
        }
    }

    struct RecordingTransport {
        sent: Mutex<Vec<(Reply, Destination)>>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        async fn replies(&self) -> Vec<Reply> {
            self.sent.lock().await.iter().map(|(r, _)| r.clone()).collect()
        }
    }

    #[async_trait]
    impl MessagingPort for RecordingTransport {
        async fn send(&self, reply: Reply, destination: &Destination) -> Result<()> {
            self.sent.lock().await.push((reply, destination.clone()));
            Ok(())
        }
    }

    fn tmp_dir(prefix: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        PathBuf::from(format!("/tmp/{prefix}-{}-{ts}", std::process::id()))
    }

    fn ok_result(content: &str) -> std::result::Result<CompletionResult, CompletionFailure> {
        Ok(CompletionResult {
            content: content.to_string(),
            completion_tokens: 9,
            total_tokens: 42,
        })
    }

    fn event(id: &str, text: &str) -> InboundEvent {
        InboundEvent {
            id: EventId(id.to_string()),
            created_at: Utc::now(),
            sender: SenderKey {
                signature: "sig".to_string(),
                nickname: "ann".to_string(),
                province: "Hubei".to_string(),
            },
            kind: ConversationKind::Direct,
            session_key: SessionKey("ann-direct".to_string()),
            conversation_name: None,
            destination: Destination("ann".to_string()),
            text: text.to_string(),
            credential: None,
        }
    }

    fn group_event(id: &str, text: &str) -> InboundEvent {
        let mut ev = event(id, text);
        ev.kind = ConversationKind::Group;
        ev.session_key = SessionKey("rustaceans".to_string());
        ev.conversation_name = Some("Rustaceans".to_string());
        ev
    }

    fn dispatcher(
        client: Arc<ScriptedClient>,
        transport: Arc<RecordingTransport>,
        max_tries: u32,
    ) -> Dispatcher {
        let mut cfg = Config::for_tests(tmp_dir("warden-dispatch"));
        cfg.max_tries = max_tries;
        Dispatcher::new(cfg, client, transport).unwrap()
    }

    const CODE: &str = "AB12CD34EF56GH7";

    #[tokio::test]
    async fn duplicate_event_is_dropped_silently() {
        let client = ScriptedClient::new(vec![ok_result("hello ann")]);
        let transport = RecordingTransport::new();
        let d = dispatcher(client, transport.clone(), 3);

        assert_eq!(d.handle(event("e1", "hi")).await.unwrap(), Outcome::Dispatched);
        assert_eq!(d.handle(event("e1", "hi")).await.unwrap(), Outcome::Dropped);
        assert_eq!(transport.replies().await.len(), 1);
    }

    #[tokio::test]
    async fn trial_sender_is_answered_then_blocked_with_one_warning() {
        let client = ScriptedClient::new(vec![ok_result("welcome")]);
        let transport = RecordingTransport::new();
        let d = dispatcher(client, transport.clone(), 1);

        // First message burns the single trial attempt but still gets a real
        // completion-backed reply.
        assert_eq!(d.handle(event("e1", "hi")).await.unwrap(), Outcome::Dispatched);

        // Past the limit: fixed warning once, then silence. The script holds
        // no further results, so any completion attempt would panic.
        assert_eq!(d.handle(event("e2", "hi again")).await.unwrap(), Outcome::Denied);
        assert_eq!(d.handle(event("e3", "hello?")).await.unwrap(), Outcome::Denied);

        let replies = transport.replies().await;
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].kind, ReplyKind::Text);
        assert_eq!(replies[1].payload, "trial limit reached");
    }

    #[tokio::test]
    async fn warrant_redemption_short_circuits_and_activates() {
        let client = ScriptedClient::new(vec![ok_result("hello licensed ann")]);
        let transport = RecordingTransport::new();
        let d = dispatcher(client, transport.clone(), 1);
        d.ledger().issue(CODE, 5).await.unwrap();

        let redeem = event("e1", &format!("#{CODE}"));
        assert_eq!(d.handle(redeem).await.unwrap(), Outcome::Dispatched);

        // Activation day: allowed straight through to the model.
        assert_eq!(d.handle(event("e2", "hi")).await.unwrap(), Outcome::Dispatched);

        let replies = transport.replies().await;
        assert_eq!(replies[0].kind, ReplyKind::Info);
        assert_eq!(replies[0].payload, "activation successful");
        assert_eq!(replies[1].payload, "hello licensed ann");
    }

    #[tokio::test]
    async fn unknown_warrant_code_is_rejected_with_fixed_message() {
        let client = ScriptedClient::new(vec![]);
        let transport = RecordingTransport::new();
        let d = dispatcher(client, transport.clone(), 3);

        let ev = event("e1", "#ZZ99ZZ99ZZ99ZZ9");
        assert_eq!(d.handle(ev).await.unwrap(), Outcome::Denied);
        let replies = transport.replies().await;
        assert_eq!(replies[0].kind, ReplyKind::Error);
        assert_eq!(replies[0].payload, "invalid warrant code");
    }

    #[tokio::test]
    async fn clear_command_resets_the_session() {
        let client = ScriptedClient::new(vec![ok_result("first"), ok_result("second")]);
        let transport = RecordingTransport::new();
        let d = dispatcher(client.clone(), transport.clone(), 3);

        d.handle(event("e1", "hi")).await.unwrap();
        assert_eq!(client.last_request().messages.len(), 2);

        assert_eq!(d.handle(event("e2", "#clear")).await.unwrap(), Outcome::Dispatched);
        let replies = transport.replies().await;
        assert_eq!(replies[1].kind, ReplyKind::Info);

        // Next turn starts from a freshly seeded session.
        d.handle(event("e3", "hi again")).await.unwrap();
        assert_eq!(client.last_request().messages.len(), 2);
    }

    #[tokio::test]
    async fn remote_failure_sends_apology_and_discards_suspect_session() {
        let client = ScriptedClient::new(vec![
            ok_result("first"),
            Err(CompletionFailure::Other("boom".to_string())),
            ok_result("after reset"),
        ]);
        let transport = RecordingTransport::new();
        let d = dispatcher(client.clone(), transport.clone(), 3);

        d.handle(event("e1", "hi")).await.unwrap();
        assert_eq!(d.handle(event("e2", "next")).await.unwrap(), Outcome::Errored);

        let replies = transport.replies().await;
        assert_eq!(replies[1].kind, ReplyKind::Error);
        assert_eq!(replies[1].payload, "a little tired right now");

        // The suspect session was discarded: the next context is reseeded.
        d.handle(event("e3", "fresh")).await.unwrap();
        assert_eq!(client.last_request().messages.len(), 2);
    }

    #[tokio::test]
    async fn expired_sender_gets_one_arrival_notice_then_silence() {
        let client = ScriptedClient::new(vec![]);
        let transport = RecordingTransport::new();

        // A license activated far in the past, well outside its grace window.
        let dir = tmp_dir("warden-dispatch");
        std::fs::create_dir_all(&dir).unwrap();
        let licenses = serde_json::json!([{
            "sender": {"signature": "sig", "nickname": "ann", "province": "Hubei"},
            "attempts": 0,
            "code": CODE,
            "quota_days": 5,
            "activated_on": "2020-01-01",
            "expiry_notified": false,
            "block_warned": false
        }]);
        std::fs::write(
            dir.join("licenses.json"),
            serde_json::to_vec_pretty(&licenses).unwrap(),
        )
        .unwrap();

        let d = Dispatcher::new(Config::for_tests(dir), client, transport.clone()).unwrap();

        // First message after expiry: one fixed notice, no completion attempt
        // (the script is empty, so reaching the model would panic).
        assert_eq!(d.handle(event("e1", "hi")).await.unwrap(), Outcome::Denied);
        // Further messages are dropped silently.
        assert_eq!(d.handle(event("e2", "still there?")).await.unwrap(), Outcome::Denied);

        let replies = transport.replies().await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].kind, ReplyKind::Text);
        assert_eq!(replies[0].payload, "activation period ended");
    }

    #[tokio::test]
    async fn per_event_credential_reaches_the_model_request() {
        let client = ScriptedClient::new(vec![ok_result("keyed reply")]);
        let transport = RecordingTransport::new();
        let d = dispatcher(client.clone(), transport, 3);

        let mut ev = event("e1", "hi");
        ev.credential = Some("sender-key".to_string());
        assert_eq!(d.handle(ev).await.unwrap(), Outcome::Dispatched);
        assert_eq!(client.last_request().credential.as_deref(), Some("sender-key"));
    }

    #[tokio::test]
    async fn group_events_bypass_the_license_gate() {
        let client = ScriptedClient::new(vec![ok_result("group reply")]);
        let transport = RecordingTransport::new();
        let d = dispatcher(client.clone(), transport.clone(), 1);

        // Block the sender on the direct path first.
        d.handle(event("e1", "#ZZ99ZZ99ZZ99ZZ9")).await.unwrap();
        // (rejected redemption does not consume an attempt)
        assert_eq!(d.handle(group_event("e2", "hello group")).await.unwrap(), Outcome::Dispatched);

        let req = client.last_request();
        assert!(req.messages[0].content.contains("Rustaceans"));
    }
}
