//! Nutrix Telegram Adapter
//!
//! Telegram Bot API long-polling with offset persistence, client recreation,
//! photo download, and message chunking

use anyhow::{anyhow, Result};
use nutrix_config::TelegramConfig;
use nutrix_ipc::{ChatUser, Envelope, EventBus, MessageKind, OutboundMessage};
use reqwest::{Client, ClientBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::broadcast;
use tracing::{info, warn};

const TELEGRAM_MAX_MESSAGE_LEN: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub text: Option<String>,
    pub caption: Option<String>,
    #[serde(default)]
    pub photo: Option<Vec<TelegramPhotoSize>>,
    pub chat: TelegramChat,
    pub from: Option<TelegramUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramPhotoSize {
    pub file_id: String,
    pub width: i64,
    pub height: i64,
    #[serde(default)]
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: Option<bool>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub language_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: T,
}

#[derive(Debug, Deserialize)]
struct GetFileResponse {
    ok: bool,
    result: Option<TelegramFileInfo>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramFileInfo {
    file_path: String,
}

pub struct TelegramAdapter {
    client: Client,
    bot_token: String,
    allowed_chats: Option<HashSet<i64>>,
    api_url: String,
    data_dir: PathBuf,
    temp_dir: PathBuf,
    poll_timeout_secs: u64,
    client_recreate_interval_secs: u64,
    event_bus: Option<EventBus>,
}

impl TelegramAdapter {
    pub fn new(config: &TelegramConfig, data_dir: PathBuf, temp_dir: PathBuf) -> Self {
        let api_url = format!("https://api.telegram.org/bot{}", config.bot_token);
        let allowed_chats = config
            .allowed_chats
            .clone()
            .map(|items| items.into_iter().collect());
        let client = Self::build_client();
        let poll_timeout_secs = config.poll_timeout_secs.unwrap_or(60);
        let client_recreate_interval_secs = config.client_recreate_interval_secs.unwrap_or(60);

        Self {
            client,
            bot_token: config.bot_token.clone(),
            allowed_chats,
            api_url,
            data_dir,
            temp_dir,
            poll_timeout_secs,
            client_recreate_interval_secs,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    fn build_client() -> Client {
        ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(600))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .timeout(Duration::from_secs(180))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client")
    }

    fn offset_path(&self) -> PathBuf {
        let runtime_dir = self.data_dir.join("runtime");
        let _ = std::fs::create_dir_all(&runtime_dir);
        let bot_id = self.bot_token.split(':').next().unwrap_or("default");
        runtime_dir.join(format!("telegram.{}.offset", bot_id))
    }

    fn is_chat_allowed(&self, chat_id: i64) -> bool {
        self.allowed_chats
            .as_ref()
            .is_none_or(|allowed| allowed.contains(&chat_id))
    }

    async fn read_offset(&self) -> Option<i64> {
        let p = self.offset_path();
        match fs::read_to_string(&p).await {
            Ok(content) => content.trim().parse().ok(),
            Err(_) => None,
        }
    }

    async fn write_offset(&self, offset: i64) {
        let p = self.offset_path();
        if let Some(parent) = p.parent() {
            let _ = fs::create_dir_all(parent).await;
        }
        let _ = fs::write(&p, format!("{}\n", offset)).await;
    }

    pub async fn get_updates(
        &self,
        client: &Client,
        offset: Option<i64>,
    ) -> Result<Vec<TelegramUpdate>> {
        let url = format!("{}/getUpdates", self.api_url);

        let mut payload = serde_json::json!({
            "timeout": self.poll_timeout_secs,
            "allowed_updates": ["message"],
        });

        if let Some(offset) = offset {
            payload["offset"] = serde_json::json!(offset);
        }

        let resp = client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram getUpdates request failed: {}", e))?
            .error_for_status()
            .map_err(|e| anyhow!("telegram getUpdates HTTP error: {}", e))?;

        let parsed: ApiResponse<Vec<TelegramUpdate>> = resp
            .json()
            .await
            .map_err(|e| anyhow!("telegram getUpdates decode failed: {}", e))?;

        if !parsed.ok {
            return Err(anyhow!("telegram getUpdates returned ok=false"));
        }

        Ok(parsed.result)
    }

    pub async fn send_message(&self, chat_id: i64, text: &str, reply_to: Option<i64>) -> Result<()> {
        let chunks = self.chunk_message(text);

        for (i, chunk) in chunks.iter().enumerate() {
            let url = format!("{}/sendMessage", self.api_url);

            let mut payload = serde_json::json!({
                "chat_id": chat_id,
                "text": chunk,
                "parse_mode": "Markdown",
            });

            if let Some(reply_to_message_id) = reply_to {
                if i == 0 {
                    payload["reply_to_message_id"] = serde_json::json!(reply_to_message_id);
                }
            }

            self.send_with_markdown_fallback(&url, payload).await?;
        }

        Ok(())
    }

    pub async fn send_photo(&self, chat_id: i64, photo_path: &Path, caption: &str) -> Result<()> {
        let url = format!("{}/sendPhoto", self.api_url);

        let bytes = fs::read(photo_path)
            .await
            .map_err(|e| anyhow!("failed to read photo {}: {}", photo_path.display(), e))?;
        let file_name = photo_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("photo.jpg")
            .to_string();

        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
        let mut form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part("photo", part);
        if !caption.is_empty() {
            form = form.text("caption", caption.to_string());
        }

        let resp = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| anyhow!("telegram sendPhoto request failed: {}", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("telegram sendPhoto HTTP {}: {}", status, body));
        }

        Ok(())
    }

    pub async fn send_chat_action(&self, chat_id: i64, action: &str) -> Result<()> {
        let url = format!("{}/sendChatAction", self.api_url);
        let payload = serde_json::json!({
            "chat_id": chat_id,
            "action": action,
        });
        let _ = self.client.post(&url).json(&payload).send().await;
        Ok(())
    }

    /// Download the file behind `file_id` into the temp directory. Returns
    /// the local path, named `<file_id>.jpg` so repeat downloads overwrite.
    pub async fn download_photo(&self, file_id: &str) -> Result<PathBuf> {
        let get_file_url = format!("{}/getFile", self.api_url);
        let resp = self
            .client
            .post(&get_file_url)
            .json(&serde_json::json!({ "file_id": file_id }))
            .send()
            .await
            .map_err(|e| anyhow!("telegram getFile request failed: {}", e))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow!("telegram getFile HTTP {}", status.as_u16()));
        }

        let parsed: GetFileResponse = serde_json::from_str(&body).map_err(|e| {
            anyhow!(
                "telegram getFile decode failed: {} | body={}",
                e,
                body.chars().take(400).collect::<String>()
            )
        })?;
        if !parsed.ok {
            let description = parsed
                .description
                .unwrap_or_else(|| "unknown getFile error".to_string());
            return Err(anyhow!("telegram getFile returned ok=false: {}", description));
        }
        let file_path = parsed
            .result
            .ok_or_else(|| anyhow!("telegram getFile missing result"))?
            .file_path;

        let download_url = format!(
            "https://api.telegram.org/file/bot{}/{}",
            self.bot_token, file_path
        );
        let download_resp = self
            .client
            .get(&download_url)
            .send()
            .await
            .map_err(|e| anyhow!("telegram file download request failed: {}", e))?;
        if !download_resp.status().is_success() {
            return Err(anyhow!(
                "telegram file download HTTP {}",
                download_resp.status().as_u16()
            ));
        }
        let bytes = download_resp.bytes().await?;

        fs::create_dir_all(&self.temp_dir).await?;
        let target = self.temp_dir.join(format!("{}.jpg", file_id));
        fs::write(&target, &bytes).await?;

        Ok(target)
    }

    async fn send_with_markdown_fallback(
        &self,
        url: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let endpoint = url.rsplit('/').next().unwrap_or("telegram");

        let first_resp = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram {} request failed: {}", endpoint, e))?;

        if first_resp.status().is_success() {
            let parsed: ApiResponse<serde_json::Value> = first_resp
                .json()
                .await
                .map_err(|e| anyhow!("telegram {} decode failed: {}", endpoint, e))?;
            if parsed.ok {
                return Ok(());
            }
            warn!(
                "telegram {} returned ok=false with Markdown payload, retrying without parse_mode",
                endpoint
            );
        } else {
            let status = first_resp.status();
            let body = first_resp.text().await.unwrap_or_default();
            warn!(
                "telegram {} HTTP {} with Markdown payload, retrying without parse_mode: {}",
                endpoint, status, body
            );
        }

        let mut fallback_payload = payload;
        if let Some(obj) = fallback_payload.as_object_mut() {
            obj.remove("parse_mode");
        }

        let fallback_resp = self
            .client
            .post(url)
            .json(&fallback_payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram {} fallback request failed: {}", endpoint, e))?;

        if !fallback_resp.status().is_success() {
            let status = fallback_resp.status();
            let body = fallback_resp.text().await.unwrap_or_default();
            if Self::is_reply_target_missing(&body) {
                let mut no_reply_payload = fallback_payload.clone();
                if Self::remove_reply_to_message_id(&mut no_reply_payload) {
                    warn!(
                        "telegram {} fallback failed due to missing reply target; retrying without reply_to_message_id",
                        endpoint
                    );
                    return self
                        .send_without_reply_target(url, endpoint, no_reply_payload)
                        .await;
                }
            }
            return Err(anyhow!(
                "telegram {} fallback HTTP {}: {}",
                endpoint,
                status,
                body
            ));
        }

        let parsed: ApiResponse<serde_json::Value> = fallback_resp
            .json()
            .await
            .map_err(|e| anyhow!("telegram {} fallback decode failed: {}", endpoint, e))?;
        if !parsed.ok {
            return Err(anyhow!("telegram {} fallback returned ok=false", endpoint));
        }

        Ok(())
    }

    async fn send_without_reply_target(
        &self,
        url: &str,
        endpoint: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let resp = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram {} no-reply retry request failed: {}", endpoint, e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!(
                "telegram {} no-reply retry HTTP {}: {}",
                endpoint,
                status,
                body
            ));
        }

        let parsed: ApiResponse<serde_json::Value> = resp
            .json()
            .await
            .map_err(|e| anyhow!("telegram {} no-reply retry decode failed: {}", endpoint, e))?;
        if !parsed.ok {
            return Err(anyhow!(
                "telegram {} no-reply retry returned ok=false",
                endpoint
            ));
        }

        Ok(())
    }

    fn remove_reply_to_message_id(payload: &mut serde_json::Value) -> bool {
        payload
            .as_object_mut()
            .map(|obj| obj.remove("reply_to_message_id").is_some())
            .unwrap_or(false)
    }

    fn is_reply_target_missing(body: &str) -> bool {
        body.to_ascii_lowercase()
            .contains("message to be replied not found")
    }

    fn chunk_message(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        if chars.len() <= TELEGRAM_MAX_MESSAGE_LEN {
            return vec![text.to_string()];
        }

        let mut chunks = Vec::new();
        let mut start = 0usize;

        while start < chars.len() {
            let mut end = (start + TELEGRAM_MAX_MESSAGE_LEN).min(chars.len());

            if end < chars.len() {
                let mut split = end;
                for i in (start..end).rev() {
                    let c = chars[i];
                    if c == '\n' || c == ' ' || c == '.' || c == '!' || c == '?' {
                        split = i + 1;
                        break;
                    }
                }
                if split > start {
                    end = split;
                }
            }

            chunks.push(chars[start..end].iter().collect::<String>());
            start = end;
        }

        chunks
    }

    pub async fn poll(&self) -> Result<()> {
        let mut offset: Option<i64> = self.read_offset().await;

        info!(offset = ?offset, "Telegram polling started");

        let mut client = self.client.clone();
        let mut client_recreate_at =
            Instant::now() + Duration::from_secs(self.client_recreate_interval_secs);

        if let Err(err) = self.sync_bot_commands(&client).await {
            warn!("Failed to sync Telegram bot commands: {}", err);
        } else {
            info!("Telegram bot commands synced");
        }

        loop {
            if Instant::now() >= client_recreate_at {
                info!("Recreating HTTP client to prevent stale connections");
                client = Self::build_client();
                client_recreate_at =
                    Instant::now() + Duration::from_secs(self.client_recreate_interval_secs);
            }

            let updates = match self.get_updates(&client, offset).await {
                Ok(v) => v,
                Err(err) => {
                    warn!("Telegram polling error: {}", err);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };

            for update in updates {
                offset = Some(update.update_id + 1);
                self.write_offset(update.update_id + 1).await;

                if let Some(message) = &update.message {
                    self.handle_message(message).await;
                }
            }
        }
    }

    async fn sync_bot_commands(&self, client: &Client) -> Result<()> {
        let url = format!("{}/setMyCommands", self.api_url);
        let commands = serde_json::json!([
            { "command": "start", "description": "Start the bot" },
            { "command": "help", "description": "Show help" },
            { "command": "stats", "description": "Show nutrition statistics" },
            { "command": "cancel", "description": "Cancel the current operation" }
        ]);

        let payload = serde_json::json!({ "commands": commands });
        let resp = client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram setMyCommands request failed: {}", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("telegram setMyCommands HTTP {}: {}", status, body));
        }

        let parsed: ApiResponse<serde_json::Value> = resp
            .json()
            .await
            .map_err(|e| anyhow!("telegram setMyCommands decode failed: {}", e))?;

        if !parsed.ok {
            return Err(anyhow!("telegram setMyCommands returned ok=false"));
        }

        Ok(())
    }

    async fn handle_message(&self, message: &TelegramMessage) {
        let chat_id = message.chat.id;
        let message_id = message.message_id;

        if !self.is_chat_allowed(chat_id) {
            info!("Skipping message from unauthorized chat {}", chat_id);
            return;
        }

        let Some(event_bus) = &self.event_bus else {
            info!("No event bus configured, message not forwarded");
            return;
        };

        let sender = message.from.as_ref().map(|u| ChatUser {
            id: u.id,
            username: u.username.clone(),
            first_name: u.first_name.clone(),
            last_name: u.last_name.clone(),
        });
        let language = message.from.as_ref().and_then(|u| u.language_code.clone());
        let from_id = message
            .from
            .as_ref()
            .map(|u| u.id.to_string())
            .unwrap_or_default();

        if let Some(best) = Self::largest_photo(message) {
            let caption = message
                .caption
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(|value| value.to_string());

            // On download failure the envelope still goes out with the
            // intended path; the flow's existence check turns that into a
            // user-visible error instead of silence.
            let path = match self.download_photo(&best.file_id).await {
                Ok(path) => path,
                Err(err) => {
                    warn!("Failed to download Telegram photo: {}", err);
                    self.temp_dir.join(format!("{}.jpg", best.file_id))
                }
            };

            info!("Received photo from {}: {}", from_id, path.display());

            let mut envelope = Envelope::new(
                "telegram",
                MessageKind::Photo {
                    from: from_id,
                    path,
                    caption,
                },
            )
            .with_chat_id(chat_id)
            .with_message_id(message_id)
            .with_language(language);
            if let Some(user) = sender {
                envelope = envelope.with_sender(user);
            }

            if let Err(e) = event_bus.publish(envelope) {
                warn!("Failed to publish photo to event bus: {}", e);
            }
            return;
        }

        if let Some(text) = message.text.clone() {
            info!("Received message from {}: {}", from_id, text);

            let mut envelope = Envelope::new(
                "telegram",
                MessageKind::Message {
                    from: from_id,
                    text,
                },
            )
            .with_chat_id(chat_id)
            .with_message_id(message_id)
            .with_language(language);
            if let Some(user) = sender {
                envelope = envelope.with_sender(user);
            }

            if let Err(e) = event_bus.publish(envelope) {
                warn!("Failed to publish message to event bus: {}", e);
            }
        }
    }

    fn largest_photo(message: &TelegramMessage) -> Option<&TelegramPhotoSize> {
        message
            .photo
            .as_ref()?
            .iter()
            .max_by_key(|item| item.width.saturating_mul(item.height))
    }

    pub async fn run_outbound_handler(&self, mut receiver: broadcast::Receiver<OutboundMessage>) {
        info!("Telegram outbound handler started");

        loop {
            match receiver.recv().await {
                Ok(msg) => {
                    if let Some(action) = &msg.chat_action {
                        if let Err(e) = self.send_chat_action(msg.chat_id, action).await {
                            warn!("Failed to send chat action: {}", e);
                        }
                        continue;
                    }

                    let send_result = if let Some(path) = &msg.photo_path {
                        self.send_photo(msg.chat_id, path, &msg.text).await
                    } else {
                        self.send_message(msg.chat_id, &msg.text, msg.reply_to).await
                    };

                    if let Err(e) = send_result {
                        warn!("Failed to send outbound message: {}", e);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Telegram outbound handler stopped: channel closed");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Telegram outbound handler lagged; skipped {} messages",
                        skipped
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{TelegramAdapter, TelegramChat, TelegramMessage, TelegramPhotoSize};
    use nutrix_config::TelegramConfig;

    fn make_adapter() -> TelegramAdapter {
        let config = TelegramConfig {
            bot_token: "123456:TESTTOKEN".to_string(),
            allowed_chats: None,
            poll_timeout_secs: Some(60),
            client_recreate_interval_secs: Some(60),
        };
        TelegramAdapter::new(&config, std::env::temp_dir(), std::env::temp_dir())
    }

    #[test]
    fn chunk_message_preserves_content_for_unicode_text() {
        let adapter = make_adapter();
        let text = format!("{} {}", "😀".repeat(5000), "fine");
        let chunks = adapter.chunk_message(&text);
        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn chunk_message_respects_telegram_limit_by_characters() {
        let adapter = make_adapter();
        let text = "abc😀".repeat(1500);
        let chunks = adapter.chunk_message(&text);
        assert!(chunks.iter().all(|chunk| chunk.chars().count() <= 4096));
    }

    #[test]
    fn remove_reply_to_message_id_when_present() {
        let mut payload = serde_json::json!({
            "chat_id": 123,
            "text": "hello",
            "reply_to_message_id": 42
        });
        assert!(TelegramAdapter::remove_reply_to_message_id(&mut payload));
        assert!(payload.get("reply_to_message_id").is_none());
    }

    #[test]
    fn detect_missing_reply_target_error() {
        let body = r#"{"ok":false,"error_code":400,"description":"Bad Request: message to be replied not found"}"#;
        assert!(TelegramAdapter::is_reply_target_missing(body));
    }

    #[test]
    fn largest_photo_picks_biggest_size() {
        let message = TelegramMessage {
            message_id: 1,
            text: None,
            caption: None,
            photo: Some(vec![
                TelegramPhotoSize {
                    file_id: "small".to_string(),
                    width: 90,
                    height: 90,
                    file_size: None,
                },
                TelegramPhotoSize {
                    file_id: "big".to_string(),
                    width: 1280,
                    height: 960,
                    file_size: None,
                },
                TelegramPhotoSize {
                    file_id: "medium".to_string(),
                    width: 320,
                    height: 240,
                    file_size: None,
                },
            ]),
            chat: TelegramChat {
                id: 1,
                chat_type: "private".to_string(),
            },
            from: None,
        };

        let best = TelegramAdapter::largest_photo(&message).expect("photo");
        assert_eq!(best.file_id, "big");
    }

    #[test]
    fn chat_filter_defaults_to_open() {
        let adapter = make_adapter();
        assert!(adapter.is_chat_allowed(42));

        let config = TelegramConfig {
            bot_token: "123456:TESTTOKEN".to_string(),
            allowed_chats: Some(vec![1, 2]),
            poll_timeout_secs: None,
            client_recreate_interval_secs: None,
        };
        let gated = TelegramAdapter::new(&config, std::env::temp_dir(), std::env::temp_dir());
        assert!(gated.is_chat_allowed(2));
        assert!(!gated.is_chat_allowed(42));
    }
}
