//! Console front-end for the relay.
//!
//! Reads one event per stdin line from a fixed local sender and prints
//! replies. Real chat transports implement the same `MessagingPort` and feed
//! `InboundEvent`s the same way.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use warden_core::{
    config::Config,
    dispatch::Dispatcher,
    domain::{ConversationKind, Destination, EventId, InboundEvent, Reply, SenderKey, SessionKey},
    messaging::MessagingPort,
};
use warden_openai::OpenAiChatClient;

struct ConsoleTransport;

#[async_trait]
impl MessagingPort for ConsoleTransport {
    async fn send(&self, reply: Reply, _destination: &Destination) -> warden_core::Result<()> {
        let line = format!("[{:?}] {}\n", reply.kind, reply.payload);
        let mut out = tokio::io::stdout();
        out.write_all(line.as_bytes())
            .await
            .map_err(|e| warden_core::Error::Send(e.to_string()))?;
        out.flush()
            .await
            .map_err(|e| warden_core::Error::Send(e.to_string()))?;
        Ok(())
    }
}

fn console_event(seq: u64, text: String) -> InboundEvent {
    InboundEvent {
        id: EventId(format!("console-{seq}")),
        created_at: Utc::now(),
        sender: SenderKey {
            signature: "console".to_string(),
            nickname: "operator".to_string(),
            province: "local".to_string(),
        },
        kind: ConversationKind::Direct,
        session_key: SessionKey("console".to_string()),
        conversation_name: None,
        destination: Destination("console".to_string()),
        text,
        credential: None,
    }
}

#[tokio::main]
async fn main() -> Result<(), warden_core::Error> {
    warden_core::logging::init("warden");

    let cfg = Config::load()?;
    let client = Arc::new(OpenAiChatClient::new(cfg.api_base.clone(), cfg.api_key.clone()));
    let dispatcher = Arc::new(Dispatcher::new(cfg, client, Arc::new(ConsoleTransport))?);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut seq = 0u64;
    while let Some(line) = lines.next_line().await? {
        let text = line.trim().to_string();
        if text.is_empty() {
            continue;
        }

        // Operator side-channel: seed a warrant code without a second tool.
        if let Some(rest) = text.strip_prefix("!issue ") {
            let mut parts = rest.split_whitespace();
            match (parts.next(), parts.next().and_then(|d| d.parse().ok())) {
                (Some(code), Some(days)) => {
                    dispatcher.ledger().issue(code, days).await?;
                    println!("[Info] issued warrant {code} ({days} days)");
                }
                _ => println!("[Info] usage: !issue <code> <days>"),
            }
            continue;
        }

        seq += 1;
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.handle(console_event(seq, text)).await {
                tracing::error!(error = %e, "event processing failed");
            }
        });
    }
    Ok(())
}
