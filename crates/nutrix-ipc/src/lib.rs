//! Nutrix IPC - Inter-Process Communication
//!
//! Event bus for adapter-to-core communication

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

static NEXT_TRACE_COUNTER: AtomicU64 = AtomicU64::new(1);

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn generate_trace_id() -> String {
    let ts = now_unix_secs();
    let n = NEXT_TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("trace-{}-{}", ts, n)
}

fn default_schema_version() -> u16 {
    1
}

fn default_trace_id() -> String {
    generate_trace_id()
}

/// Identity of the account that produced an inbound event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatUser {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl ChatUser {
    /// Best human-readable label: first name, then username, then the id.
    pub fn display_name(&self) -> String {
        if let Some(first) = self.first_name.as_deref().filter(|s| !s.is_empty()) {
            return first.to_string();
        }
        if let Some(username) = self.username.as_deref().filter(|s| !s.is_empty()) {
            return username.to_string();
        }
        self.id.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default = "default_schema_version")]
    pub schema_version: u16,
    #[serde(default = "default_trace_id")]
    pub trace_id: String,
    pub id: String,
    pub channel: String,
    pub kind: MessageKind,
    pub chat_id: Option<i64>,
    pub message_id: Option<i64>,
    #[serde(default)]
    pub sender: Option<ChatUser>,
    /// IETF language tag reported by the channel, e.g. "en-US".
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessageKind {
    #[serde(rename = "message")]
    Message { from: String, text: String },

    #[serde(rename = "photo")]
    Photo {
        from: String,
        path: PathBuf,
        caption: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub chat_id: i64,
    pub text: String,
    pub reply_to: Option<i64>,
    /// When set, the adapter sends the file as a photo with `text` as caption.
    pub photo_path: Option<PathBuf>,
    /// Telegram chat action such as "typing"; sent instead of a message.
    pub chat_action: Option<String>,
}

impl Envelope {
    pub fn new(channel: &str, kind: MessageKind) -> Self {
        Self {
            schema_version: default_schema_version(),
            trace_id: generate_trace_id(),
            id: generate_trace_id(),
            channel: channel.to_string(),
            kind,
            chat_id: None,
            message_id: None,
            sender: None,
            language: None,
        }
    }

    pub fn with_chat_id(mut self, chat_id: i64) -> Self {
        self.chat_id = Some(chat_id);
        self
    }

    pub fn with_message_id(mut self, message_id: i64) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn with_sender(mut self, sender: ChatUser) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn with_language(mut self, language: Option<String>) -> Self {
        self.language = language;
        self
    }
}

pub const EVENT_BUS_CAPACITY: usize = 256;
pub const OUTBOUND_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    inbound: broadcast::Sender<Envelope>,
    outbound: broadcast::Sender<OutboundMessage>,
}

impl EventBus {
    pub fn new() -> Self {
        let (inbound_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (outbound_tx, _) = broadcast::channel(OUTBOUND_CAPACITY);

        Self {
            inbound: inbound_tx,
            outbound: outbound_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inbound.subscribe()
    }

    pub fn publish(&self, envelope: Envelope) -> anyhow::Result<()> {
        self.inbound.send(envelope)?;
        Ok(())
    }

    pub fn messenger(&self) -> Messenger {
        Messenger {
            outbound: self.outbound.clone(),
        }
    }

    pub fn outbound_sender(&self) -> broadcast::Sender<OutboundMessage> {
        self.outbound.clone()
    }

    pub fn outbound_subscribe(&self) -> broadcast::Receiver<OutboundMessage> {
        self.outbound.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Outbound publish handle. Delivery problems are logged, never returned:
/// flow logic must not fail because a chat message could not be queued.
#[derive(Clone)]
pub struct Messenger {
    outbound: broadcast::Sender<OutboundMessage>,
}

impl Messenger {
    pub fn send(&self, chat_id: i64, text: impl Into<String>, reply_to: Option<i64>) {
        self.dispatch(OutboundMessage {
            chat_id,
            text: text.into(),
            reply_to,
            photo_path: None,
            chat_action: None,
        });
    }

    pub fn send_photo(&self, chat_id: i64, path: PathBuf, caption: impl Into<String>) {
        self.dispatch(OutboundMessage {
            chat_id,
            text: caption.into(),
            reply_to: None,
            photo_path: Some(path),
            chat_action: None,
        });
    }

    pub fn chat_action(&self, chat_id: i64, action: &str) {
        self.dispatch(OutboundMessage {
            chat_id,
            text: String::new(),
            reply_to: None,
            photo_path: None,
            chat_action: Some(action.to_string()),
        });
    }

    fn dispatch(&self, msg: OutboundMessage) {
        if self.outbound.send(msg).is_err() {
            tracing::warn!("outbound bus has no subscribers, message dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_kind() -> MessageKind {
        MessageKind::Message {
            from: "user".to_string(),
            text: "hello".to_string(),
        }
    }

    #[test]
    fn envelope_has_schema_version() {
        let env = Envelope::new("telegram", text_kind());
        assert_eq!(env.schema_version, 1);
    }

    #[test]
    fn envelope_has_trace_id() {
        let env = Envelope::new("telegram", text_kind());
        assert!(env.trace_id.starts_with("trace-"));
    }

    #[test]
    fn trace_id_different_for_each_envelope() {
        let env1 = Envelope::new("telegram", text_kind());
        let env2 = Envelope::new("telegram", text_kind());
        assert_ne!(env1.trace_id, env2.trace_id);
    }

    #[test]
    fn deserialize_without_sender_fields_gets_defaults() {
        let old_json = r#"{
            "id": "test-id",
            "channel": "telegram",
            "kind": {"type": "message", "from": "user", "text": "hello"},
            "chat_id": 123,
            "message_id": 456
        }"#;
        let env: Envelope = serde_json::from_str(old_json).expect("deserialize");
        assert_eq!(env.schema_version, 1);
        assert!(env.trace_id.starts_with("trace-"));
        assert_eq!(env.id, "test-id");
        assert!(env.sender.is_none());
        assert!(env.language.is_none());
    }

    #[test]
    fn serialize_roundtrip_preserves_sender_and_language() {
        let env = Envelope::new("telegram", text_kind())
            .with_chat_id(123)
            .with_message_id(456)
            .with_sender(ChatUser {
                id: 99,
                username: Some("anna".to_string()),
                first_name: Some("Anna".to_string()),
                last_name: None,
            })
            .with_language(Some("it".to_string()));

        let json = serde_json::to_string(&env).expect("serialize");
        let parsed: Envelope = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(parsed.trace_id, env.trace_id);
        assert_eq!(parsed.chat_id, Some(123));
        assert_eq!(parsed.sender.as_ref().map(|u| u.id), Some(99));
        assert_eq!(parsed.language.as_deref(), Some("it"));
    }

    #[test]
    fn photo_kind_roundtrip_keeps_path() {
        let env = Envelope::new(
            "telegram",
            MessageKind::Photo {
                from: "user".to_string(),
                path: PathBuf::from("/tmp/photo_abc.jpg"),
                caption: Some("lunch".to_string()),
            },
        );
        let json = serde_json::to_string(&env).expect("serialize");
        let parsed: Envelope = serde_json::from_str(&json).expect("deserialize");
        match parsed.kind {
            MessageKind::Photo { path, caption, .. } => {
                assert_eq!(path, PathBuf::from("/tmp/photo_abc.jpg"));
                assert_eq!(caption.as_deref(), Some("lunch"));
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn display_name_prefers_first_name() {
        let user = ChatUser {
            id: 7,
            username: Some("anna_b".to_string()),
            first_name: Some("Anna".to_string()),
            last_name: Some("Bianchi".to_string()),
        };
        assert_eq!(user.display_name(), "Anna");

        let no_first = ChatUser {
            id: 7,
            username: Some("anna_b".to_string()),
            first_name: None,
            last_name: None,
        };
        assert_eq!(no_first.display_name(), "anna_b");

        let bare = ChatUser {
            id: 7,
            username: None,
            first_name: None,
            last_name: None,
        };
        assert_eq!(bare.display_name(), "7");
    }

    #[tokio::test]
    async fn messenger_delivers_to_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.outbound_subscribe();
        let messenger = bus.messenger();

        messenger.send(42, "ciao", Some(7));
        let msg = rx.recv().await.expect("receive");
        assert_eq!(msg.chat_id, 42);
        assert_eq!(msg.text, "ciao");
        assert_eq!(msg.reply_to, Some(7));
        assert!(msg.photo_path.is_none());
    }

    #[test]
    fn messenger_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        let messenger = bus.messenger();
        messenger.send(1, "nobody listening", None);
        messenger.chat_action(1, "typing");
    }
}
