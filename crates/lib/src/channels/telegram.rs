//! Telegram Bot API: webhook update payloads, sendMessage, getFile/download, and webhook registration.

use crate::error::ServiceError;
use async_trait::async_trait;
use serde::Deserialize;

use crate::pipeline::{ChatApi, DownloadedFile};

const SERVICE: &str = "telegram";

/// Telegram rejects messages longer than this many UTF-16 code units.
pub const MAX_MESSAGE_CHARS: usize = 4096;

/// Telegram update payload (webhook POST body).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramUpdate {
    #[serde(default)]
    pub update_id: Option<i64>,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub edited_message: Option<TelegramMessage>,
}

impl TelegramUpdate {
    /// The message this update carries: `message`, else `edited_message`.
    pub fn message(&self) -> Option<&TelegramMessage> {
        self.message.as_ref().or(self.edited_message.as_ref())
    }

    pub fn chat_id(&self) -> Option<i64> {
        self.message().and_then(|m| m.chat.as_ref()).map(|c| c.id)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramMessage {
    #[serde(default)]
    pub message_id: Option<i64>,
    #[serde(default)]
    pub chat: Option<TelegramChat>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    /// Sizes of one photo, smallest first.
    #[serde(default)]
    pub photo: Vec<PhotoSize>,
    #[serde(default)]
    pub document: Option<TelegramDocument>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramDocument {
    pub file_id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileInfo {
    #[serde(default)]
    file_path: Option<String>,
}

/// Bot API client bound to one bot token.
#[derive(Clone)]
pub struct TelegramClient {
    api_base: String,
    token: String,
    client: reqwest::Client,
}

impl TelegramClient {
    pub fn new(api_base: &str, token: String) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<Option<T>, ServiceError> {
        let res = self
            .client
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::request(SERVICE, e))?;
        let res = ServiceError::check(SERVICE, res).await?;
        let data: ApiResponse<T> = res
            .json()
            .await
            .map_err(|e| ServiceError::request(SERVICE, e))?;
        if !data.ok {
            return Err(ServiceError::malformed(
                SERVICE,
                format!(
                    "{} returned ok: false ({})",
                    method,
                    data.description.unwrap_or_default()
                ),
            ));
        }
        Ok(data.result)
    }

    /// Send a text message to a chat via sendMessage.
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), ServiceError> {
        let body = serde_json::json!({ "chat_id": chat_id, "text": text });
        self.call::<serde_json::Value>("sendMessage", body).await?;
        Ok(())
    }

    /// Resolve a file id to its download path via getFile.
    pub async fn get_file_path(&self, file_id: &str) -> Result<String, ServiceError> {
        let body = serde_json::json!({ "file_id": file_id });
        let info: Option<FileInfo> = self.call("getFile", body).await?;
        info.and_then(|i| i.file_path)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ServiceError::malformed(SERVICE, "getFile returned no file_path"))
    }

    /// Download file content by the path returned from getFile.
    pub async fn download(&self, file_path: &str) -> Result<Vec<u8>, ServiceError> {
        let url = format!("{}/file/bot{}/{}", self.api_base, self.token, file_path);
        let res = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ServiceError::request(SERVICE, e))?;
        let res = ServiceError::check(SERVICE, res).await?;
        let bytes = res
            .bytes()
            .await
            .map_err(|e| ServiceError::request(SERVICE, e))?;
        Ok(bytes.to_vec())
    }

    /// Set webhook URL (and optional secret). Telegram then POSTs updates to the URL.
    pub async fn set_webhook(&self, url: &str, secret: Option<&str>) -> Result<(), ServiceError> {
        let mut body = serde_json::json!({
            "url": url,
            "allowed_updates": ["message", "edited_message"],
        });
        if let Some(s) = secret {
            body["secret_token"] = serde_json::Value::String(s.to_string());
        }
        self.call::<serde_json::Value>("setWebhook", body).await?;
        Ok(())
    }

    /// Remove the webhook.
    pub async fn delete_webhook(&self) -> Result<(), ServiceError> {
        self.call::<serde_json::Value>("deleteWebhook", serde_json::json!({}))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ChatApi for TelegramClient {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), ServiceError> {
        for chunk in split_message(text, MAX_MESSAGE_CHARS) {
            self.send_message(chat_id, &chunk).await?;
        }
        Ok(())
    }

    async fn fetch_file(&self, file_id: &str) -> Result<DownloadedFile, ServiceError> {
        let path = self.get_file_path(file_id).await?;
        let bytes = self.download(&path).await?;
        Ok(DownloadedFile { path, bytes })
    }
}

fn utf16_len(s: &str) -> usize {
    s.encode_utf16().count()
}

/// Split text into chunks of at most `max` UTF-16 units, preferring line breaks.
pub fn split_message(text: &str, max: usize) -> Vec<String> {
    if utf16_len(text) <= max {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;
    for line in text.split_inclusive('\n') {
        let line_len = utf16_len(line);
        if current_len + line_len > max && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len > max {
            // a single overlong line is cut on char boundaries
            for c in line.chars() {
                let n = c.len_utf16();
                if current_len + n > max && !current.is_empty() {
                    chunks.push(std::mem::take(&mut current));
                    current_len = 0;
                }
                current.push(c);
                current_len += n;
            }
            continue;
        }
        current.push_str(line);
        current_len += line_len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
