// src/platforms/telegram.rs - Telegram Bot API adapter with long polling

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::env;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::bot::replies;
use crate::config::TelegramSettings;
use crate::platforms::PlatformConnection;
use crate::types::{ButtonAction, ContentKind, Delivery, InboundEvent, Menu, Payload, UserId};

const MAX_BACKOFF: Duration = Duration::from_secs(60);
const SEND_TIMEOUT: Duration = Duration::from_secs(15);

/// Bot API envelope: `{"ok": true, "result": ...}` or `{"ok": false, "error_code": .., "description": ..}`
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    error_code: Option<u16>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
    callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct Message {
    from: Option<User>,
    chat: Chat,
    text: Option<String>,
    caption: Option<String>,
    sticker: Option<FileRef>,
    #[serde(default)]
    photo: Vec<PhotoSize>,
    voice: Option<FileRef>,
    video: Option<FileRef>,
    animation: Option<FileRef>,
    document: Option<FileRef>,
    audio: Option<FileRef>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: i64,
    #[serde(default)]
    is_bot: bool,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct FileRef {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct PhotoSize {
    file_id: String,
    width: u32,
    height: u32,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    id: String,
    from: User,
    data: Option<String>,
}

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("Telegram rejected the bot token ({0})")]
    Unauthorized(String),

    #[error("Telegram {method} failed with {code}: {description}")]
    Api {
        method: String,
        code: u16,
        description: String,
    },
}

/// Configuration for the Telegram Bot API connection
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub token: String,
    pub api_base: String,
    pub poll_timeout_seconds: u64,
}

impl TelegramConfig {
    /// Token from `TELEGRAM_TOKEN`; `TELEGRAM_API_BASE` overrides the configured endpoint
    pub fn from_env(settings: &TelegramSettings) -> Result<Self> {
        let token = env::var("TELEGRAM_TOKEN").context("TELEGRAM_TOKEN environment variable not set")?;
        let api_base = env::var("TELEGRAM_API_BASE").unwrap_or_else(|_| settings.api_base.clone());

        info!("Loaded Telegram config (api: {})", api_base);
        Ok(Self {
            token,
            api_base: api_base.trim_end_matches('/').to_string(),
            poll_timeout_seconds: settings.poll_timeout_seconds,
        })
    }
}

/// Thin Bot API client shared by the poller and the sender
#[derive(Clone)]
struct TelegramApi {
    config: TelegramConfig,
    http_client: reqwest::Client,
}

impl TelegramApi {
    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.config.api_base, self.config.token, method)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: &Value, limit: Duration) -> Result<T> {
        let response = self
            .http_client
            .post(self.method_url(method))
            .json(body)
            .timeout(limit)
            .send()
            .await
            .with_context(|| format!("Failed to reach Telegram for {}", method))?;

        let status = response.status();
        let envelope: ApiResponse<T> = response
            .json()
            .await
            .with_context(|| format!("Failed to parse Telegram {} response ({})", method, status))?;

        if !envelope.ok {
            let code = envelope.error_code.unwrap_or_else(|| status.as_u16());
            let description = envelope.description.unwrap_or_else(|| "Unknown error".to_string());
            if code == 401 {
                return Err(TelegramError::Unauthorized(description).into());
            }
            return Err(TelegramError::Api {
                method: method.to_string(),
                code,
                description,
            }
            .into());
        }

        envelope
            .result
            .with_context(|| format!("Telegram {} response has no result", method))
    }

    async fn get_updates(&self, offset: i64) -> Result<Vec<Update>> {
        let body = json!({
            "offset": offset,
            "timeout": self.config.poll_timeout_seconds,
            "allowed_updates": ["message", "callback_query"],
        });
        // Leave room for the server-side long poll to finish
        let limit = Duration::from_secs(self.config.poll_timeout_seconds + 10);
        self.call("getUpdates", &body, limit).await
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<()> {
        let _: bool = self
            .call("answerCallbackQuery", &json!({ "callback_query_id": callback_id }), SEND_TIMEOUT)
            .await?;
        Ok(())
    }
}

/// Telegram Bot API connection using long polling
pub struct TelegramConnection {
    api: TelegramApi,
    event_sender: Option<broadcast::Sender<InboundEvent>>,
    is_connected: Arc<RwLock<bool>>,
    poller: Option<JoinHandle<()>>,
}

impl TelegramConnection {
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            api: TelegramApi {
                config,
                http_client: reqwest::Client::new(),
            },
            event_sender: None,
            is_connected: Arc::new(RwLock::new(false)),
            poller: None,
        }
    }

    async fn run_poller(api: TelegramApi, sender: broadcast::Sender<InboundEvent>, is_connected: Arc<RwLock<bool>>) {
        info!("Telegram update poller started");
        let mut offset = 0i64;
        let mut backoff = Duration::from_secs(1);

        loop {
            if !*is_connected.read().await {
                info!("Telegram connection marked as disconnected, stopping poller");
                break;
            }

            match api.get_updates(offset).await {
                Ok(updates) => {
                    backoff = Duration::from_secs(1);
                    if !updates.is_empty() {
                        debug!("Polled {} Telegram updates", updates.len());
                    }

                    for update in updates {
                        offset = offset.max(update.update_id + 1);

                        if let Some(callback) = &update.callback_query {
                            let api = api.clone();
                            let callback_id = callback.id.clone();
                            tokio::spawn(async move {
                                if let Err(e) = api.answer_callback(&callback_id).await {
                                    debug!("Failed to answer callback query: {:#}", e);
                                }
                            });
                        }

                        if let Some(event) = convert_update(update) {
                            if let Err(e) = sender.send(event) {
                                warn!("Failed to broadcast Telegram event: {}", e);
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to poll Telegram updates: {:#}", e);

                    if matches!(e.downcast_ref::<TelegramError>(), Some(TelegramError::Unauthorized(_))) {
                        error!("Telegram authentication failed, marking as disconnected");
                        *is_connected.write().await = false;
                        break;
                    }

                    warn!("Backing off Telegram polling for {:?}", backoff);
                    sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
                }
            }
        }

        warn!("Telegram update poller stopped");
    }
}

/// Map a raw update to an engine event. Group chats, bots and unsupported content yield `None`.
fn convert_update(update: Update) -> Option<InboundEvent> {
    if let Some(callback) = update.callback_query {
        if callback.from.is_bot {
            return None;
        }
        let data = callback.data.unwrap_or_default();
        let Some(action) = ButtonAction::parse(&data) else {
            debug!("Ignoring unknown callback data '{}'", data);
            return None;
        };
        return Some(InboundEvent::Button {
            user: UserId(callback.from.id),
            action,
        });
    }

    let message = update.message?;
    if message.chat.kind != "private" {
        return None;
    }
    let from = message.from.as_ref().filter(|u| !u.is_bot)?;
    let user = UserId(from.id);

    if let Some(text) = &message.text {
        if let Some((name, args)) = parse_command(text) {
            debug!(
                "Command /{} from {} ({})",
                name,
                user,
                from.username.as_deref().unwrap_or("no username")
            );
            return Some(InboundEvent::Command { user, name, args });
        }
    }

    let payload = extract_payload(message)?;
    Some(InboundEvent::Content { user, payload })
}

/// `/find@SomeBot female` -> ("find", ["female"])
fn parse_command(text: &str) -> Option<(String, Vec<String>)> {
    let rest = text.strip_prefix('/')?;
    let mut parts = rest.split_whitespace();
    let head = parts.next()?;
    let name = head.split('@').next().unwrap_or(head).to_lowercase();
    if name.is_empty() {
        return None;
    }
    Some((name, parts.map(str::to_string).collect()))
}

fn extract_payload(message: Message) -> Option<Payload> {
    if let Some(text) = message.text {
        return Some(Payload::text(text));
    }

    let caption = message.caption;
    // Animations also carry a `document` field, so check them first
    let (kind, file_id) = if let Some(file) = message.animation {
        (ContentKind::Animation, file.file_id)
    } else if let Some(file) = message.sticker {
        (ContentKind::Sticker, file.file_id)
    } else if let Some(largest) = message
        .photo
        .into_iter()
        .max_by_key(|p| u64::from(p.width) * u64::from(p.height))
    {
        (ContentKind::Photo, largest.file_id)
    } else if let Some(file) = message.voice {
        (ContentKind::Voice, file.file_id)
    } else if let Some(file) = message.video {
        (ContentKind::Video, file.file_id)
    } else if let Some(file) = message.document {
        (ContentKind::Document, file.file_id)
    } else if let Some(file) = message.audio {
        (ContentKind::Audio, file.file_id)
    } else {
        return None;
    };

    Some(Payload::media(kind, file_id, caption))
}

fn inline_keyboard(menu: Menu) -> Option<Value> {
    let rows = replies::buttons(menu);
    if rows.is_empty() {
        return None;
    }
    let keyboard: Vec<Vec<Value>> = rows
        .into_iter()
        .map(|row| {
            row.into_iter()
                .map(|(label, action)| json!({ "text": label, "callback_data": action.callback_data() }))
                .collect()
        })
        .collect();
    Some(json!({ "inline_keyboard": keyboard }))
}

/// Bot API method and body for one delivery
fn build_request(delivery: &Delivery) -> Result<(&'static str, Value)> {
    match delivery {
        Delivery::Notice { to, notice } => {
            let (text, menu) = replies::render(notice);
            let mut body = json!({ "chat_id": to.0, "text": text });
            if let Some(markup) = inline_keyboard(menu) {
                body["reply_markup"] = markup;
            }
            Ok(("sendMessage", body))
        }
        Delivery::Relay { to, payload } => {
            let (method, field) = match payload.kind {
                ContentKind::Text => {
                    let text = payload.text.as_deref().context("Text relay without text")?;
                    return Ok(("sendMessage", json!({ "chat_id": to.0, "text": text })));
                }
                ContentKind::Sticker => ("sendSticker", "sticker"),
                ContentKind::Photo => ("sendPhoto", "photo"),
                ContentKind::Voice => ("sendVoice", "voice"),
                ContentKind::Video => ("sendVideo", "video"),
                ContentKind::Animation => ("sendAnimation", "animation"),
                ContentKind::Document => ("sendDocument", "document"),
                ContentKind::Audio => ("sendAudio", "audio"),
            };

            let file_id = payload
                .file_id
                .as_deref()
                .with_context(|| format!("{} relay without file id", payload.kind.as_str()))?;

            let mut body = json!({ "chat_id": to.0 });
            body[field] = json!(file_id);
            if payload.kind.supports_caption() {
                if let Some(caption) = &payload.caption {
                    body["caption"] = json!(caption);
                }
            }
            Ok((method, body))
        }
    }
}

#[async_trait]
impl PlatformConnection for TelegramConnection {
    async fn connect(&mut self) -> Result<()> {
        info!("Connecting to Telegram Bot API...");

        let me: Value = self
            .api
            .call("getMe", &json!({}), SEND_TIMEOUT)
            .await
            .context("Failed to connect to Telegram Bot API")?;
        info!(
            "Authenticated as @{}",
            me.get("username").and_then(Value::as_str).unwrap_or("unknown")
        );

        let (tx, _) = broadcast::channel(1000);
        self.event_sender = Some(tx.clone());
        *self.is_connected.write().await = true;

        self.poller = Some(tokio::spawn(Self::run_poller(
            self.api.clone(),
            tx,
            Arc::clone(&self.is_connected),
        )));

        info!("Telegram connection established");
        Ok(())
    }

    async fn deliver(&self, delivery: &Delivery) -> Result<()> {
        let (method, body) = build_request(delivery)?;
        let _: Value = self
            .api
            .call(method, &body, SEND_TIMEOUT)
            .await
            .with_context(|| format!("Failed to deliver to {}", delivery.recipient()))?;
        debug!("{} delivered to {}", method, delivery.recipient());
        Ok(())
    }

    fn platform_name(&self) -> &str {
        "telegram"
    }

    async fn is_connected(&self) -> bool {
        *self.is_connected.read().await
    }

    fn event_receiver(&self) -> Option<broadcast::Receiver<InboundEvent>> {
        self.event_sender.as_ref().map(|sender| sender.subscribe())
    }

    async fn disconnect(&mut self) -> Result<()> {
        *self.is_connected.write().await = false;
        // An in-flight long poll would otherwise hold the task open
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        self.event_sender = None;
        info!("Disconnected from Telegram");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Gender, Notice, Target};

    fn update(value: Value) -> Update {
        serde_json::from_value(value).unwrap()
    }

    fn private_message(extra: Value) -> Value {
        let mut message = json!({
            "message_id": 10,
            "from": { "id": 77, "is_bot": false, "first_name": "A" },
            "chat": { "id": 77, "type": "private" },
            "date": 0,
        });
        if let (Some(target), Some(fields)) = (message.as_object_mut(), extra.as_object()) {
            for (k, v) in fields {
                target.insert(k.clone(), v.clone());
            }
        }
        json!({ "update_id": 1, "message": message })
    }

    #[test]
    fn test_command_parsing() {
        assert_eq!(
            parse_command("/find@AnonBot Female"),
            Some(("find".to_string(), vec!["Female".to_string()]))
        );
        assert_eq!(parse_command("/START"), Some(("start".to_string(), vec![])));
        assert_eq!(parse_command("hello"), None);
        assert_eq!(parse_command("/"), None);

        let event = convert_update(update(private_message(json!({ "text": "/ban 42" })))).unwrap();
        assert_eq!(
            event,
            InboundEvent::Command {
                user: UserId(77),
                name: "ban".to_string(),
                args: vec!["42".to_string()],
            }
        );
    }

    #[test]
    fn test_media_extraction() {
        let photo = private_message(json!({
            "caption": "look",
            "photo": [
                { "file_id": "small", "width": 90, "height": 90 },
                { "file_id": "large", "width": 1280, "height": 960 },
                { "file_id": "medium", "width": 320, "height": 240 },
            ],
        }));
        match convert_update(update(photo)) {
            Some(InboundEvent::Content { user, payload }) => {
                assert_eq!(user, UserId(77));
                assert_eq!(payload, Payload::media(ContentKind::Photo, "large", Some("look".to_string())));
            }
            other => panic!("unexpected event {:?}", other),
        }

        let gif = private_message(json!({
            "animation": { "file_id": "anim" },
            "document": { "file_id": "anim" },
        }));
        match convert_update(update(gif)) {
            Some(InboundEvent::Content { payload, .. }) => assert_eq!(payload.kind, ContentKind::Animation),
            other => panic!("unexpected event {:?}", other),
        }

        // Locations and the like are not relayed
        let location = private_message(json!({ "location": { "latitude": 1.0, "longitude": 2.0 } }));
        assert!(convert_update(update(location)).is_none());
    }

    #[test]
    fn test_group_and_bot_messages_ignored() {
        let mut group = private_message(json!({ "text": "hi" }));
        group["message"]["chat"]["type"] = json!("group");
        assert!(convert_update(update(group)).is_none());

        let mut from_bot = private_message(json!({ "text": "hi" }));
        from_bot["message"]["from"]["is_bot"] = json!(true);
        assert!(convert_update(update(from_bot)).is_none());
    }

    #[test]
    fn test_callback_conversion() {
        let data = ButtonAction::FindPartner(Target::Gender(Gender::Female)).callback_data();
        let raw = json!({
            "update_id": 5,
            "callback_query": {
                "id": "cb1",
                "from": { "id": 9, "is_bot": false, "first_name": "B" },
                "data": data,
            },
        });
        assert_eq!(
            convert_update(update(raw)),
            Some(InboundEvent::Button {
                user: UserId(9),
                action: ButtonAction::FindPartner(Target::Gender(Gender::Female)),
            })
        );

        let junk = json!({
            "update_id": 6,
            "callback_query": { "id": "cb2", "from": { "id": 9 }, "data": "nonsense" },
        });
        assert!(convert_update(update(junk)).is_none());
    }

    #[test]
    fn test_relay_requests() {
        let sticker = Delivery::Relay {
            to: UserId(3),
            payload: Payload::media(ContentKind::Sticker, "stk", Some("dropped".to_string())),
        };
        let (method, body) = build_request(&sticker).unwrap();
        assert_eq!(method, "sendSticker");
        assert_eq!(body, json!({ "chat_id": 3, "sticker": "stk" }));

        let video = Delivery::Relay {
            to: UserId(3),
            payload: Payload::media(ContentKind::Video, "vid", Some("clip".to_string())),
        };
        let (method, body) = build_request(&video).unwrap();
        assert_eq!(method, "sendVideo");
        assert_eq!(body["caption"], json!("clip"));

        let text = Delivery::Relay {
            to: UserId(4),
            payload: Payload::text("hello"),
        };
        assert_eq!(
            build_request(&text).unwrap(),
            ("sendMessage", json!({ "chat_id": 4, "text": "hello" }))
        );
    }

    #[test]
    fn test_notice_request_carries_keyboard() {
        let delivery = Delivery::notice(UserId(8), Notice::MainMenu);
        let (method, body) = build_request(&delivery).unwrap();
        assert_eq!(method, "sendMessage");
        let rows = body["reply_markup"]["inline_keyboard"].as_array().unwrap();
        assert_eq!(rows.len(), replies::buttons(Menu::Main).len());
        assert_eq!(rows[0][0]["callback_data"], json!("find_anyone"));

        let plain = Delivery::notice(UserId(8), Notice::SearchCancelled);
        let (_, body) = build_request(&plain).unwrap();
        let (_, menu) = replies::render(&Notice::SearchCancelled);
        assert_eq!(body.get("reply_markup").is_some(), menu != Menu::None);
    }
}
