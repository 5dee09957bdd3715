//! Google Drive: upload an image and make it publicly readable so Docs can embed it.

use crate::error::ServiceError;
use crate::google::auth::TokenSource;
use serde::Deserialize;
use std::sync::Arc;

const SERVICE: &str = "drive";
pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com";

#[derive(Debug, Clone, Deserialize)]
pub struct DriveFile {
    pub id: String,
}

impl DriveFile {
    /// URL that serves the file content directly (requires public read access).
    pub fn content_url(&self) -> String {
        format!("https://drive.google.com/uc?export=view&id={}", self.id)
    }
}

pub struct DriveClient {
    api_base: String,
    tokens: Arc<dyn TokenSource>,
    client: reqwest::Client,
}

impl DriveClient {
    pub fn new(api_base: &str, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            tokens,
            client: reqwest::Client::new(),
        }
    }

    /// Multipart upload (metadata + content) in one request.
    pub async fn upload(
        &self,
        name: &str,
        mime_type: &str,
        parent: Option<&str>,
        content: &[u8],
    ) -> Result<DriveFile, ServiceError> {
        let token = self.tokens.access_token().await?;
        let url = format!(
            "{}/upload/drive/v3/files?uploadType=multipart&fields=id",
            self.api_base
        );
        let mut metadata = serde_json::json!({ "name": name, "mimeType": mime_type });
        if let Some(p) = parent {
            metadata["parents"] = serde_json::json!([p]);
        }
        let boundary = format!("lessonbot-{}", uuid::Uuid::new_v4().simple());
        let body = multipart_related(&boundary, &metadata, mime_type, content);
        let res = self
            .client
            .post(&url)
            .bearer_auth(token)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .body(body)
            .send()
            .await
            .map_err(|e| ServiceError::request(SERVICE, e))?;
        let res = ServiceError::check(SERVICE, res).await?;
        res.json()
            .await
            .map_err(|e| ServiceError::request(SERVICE, e))
    }

    /// Grant "anyone with the link" read access.
    pub async fn share_publicly(&self, file_id: &str) -> Result<(), ServiceError> {
        let token = self.tokens.access_token().await?;
        let url = format!("{}/drive/v3/files/{}/permissions", self.api_base, file_id);
        let res = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&serde_json::json!({ "role": "reader", "type": "anyone" }))
            .send()
            .await
            .map_err(|e| ServiceError::request(SERVICE, e))?;
        ServiceError::check(SERVICE, res).await?;
        Ok(())
    }
}

/// `multipart/related` body: JSON metadata part followed by the media part.
fn multipart_related(
    boundary: &str,
    metadata: &serde_json::Value,
    mime_type: &str,
    content: &[u8],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(content.len() + 512);
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata.to_string().as_bytes());
    body.extend_from_slice(format!("\r\n--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", mime_type).as_bytes());
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipart_body_layout() {
        let meta = serde_json::json!({ "name": "a.jpg" });
        let body = multipart_related("B", &meta, "image/jpeg", b"\xff\xd8data");
        let expected_head = "--B\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{\"name\":\"a.jpg\"}\r\n--B\r\nContent-Type: image/jpeg\r\n\r\n";
        assert!(body.starts_with(expected_head.as_bytes()));
        assert!(body.ends_with(b"\xff\xd8data\r\n--B--\r\n"));
    }

    #[test]
    fn content_url_uses_file_id() {
        let f = DriveFile {
            id: "abc123".to_string(),
        };
        assert_eq!(
            f.content_url(),
            "https://drive.google.com/uc?export=view&id=abc123"
        );
    }
}
