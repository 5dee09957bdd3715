//! Cloud Vision text detection (`images:annotate`).

use crate::error::ServiceError;
use crate::google::auth::TokenSource;
use crate::pipeline::TextRecognizer;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Deserialize;
use std::sync::Arc;

const SERVICE: &str = "vision";

/// OCR client for Cloud Vision.
pub struct VisionClient {
    api_base: String,
    language_hints: Vec<String>,
    tokens: Arc<dyn TokenSource>,
    client: reqwest::Client,
}

impl VisionClient {
    pub fn new(api_base: &str, language_hints: Vec<String>, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            language_hints,
            tokens,
            client: reqwest::Client::new(),
        }
    }

    /// POST /images:annotate with DOCUMENT_TEXT_DETECTION. Returns the full recognized text,
    /// empty when the image has none.
    pub async fn detect_text(&self, image: &[u8]) -> Result<String, ServiceError> {
        let token = self.tokens.access_token().await?;
        let url = format!("{}/images:annotate", self.api_base);
        let body = annotate_request(&STANDARD.encode(image), &self.language_hints);
        let res = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::request(SERVICE, e))?;
        let res = ServiceError::check(SERVICE, res).await?;
        let data: AnnotateResponse = res
            .json()
            .await
            .map_err(|e| ServiceError::request(SERVICE, e))?;
        extract_text(data)
    }
}

#[async_trait]
impl TextRecognizer for VisionClient {
    async fn recognize(&self, image: &[u8]) -> Result<String, ServiceError> {
        self.detect_text(image).await
    }
}

fn annotate_request(image_b64: &str, language_hints: &[String]) -> serde_json::Value {
    let mut request = serde_json::json!({
        "image": { "content": image_b64 },
        "features": [{ "type": "DOCUMENT_TEXT_DETECTION" }],
    });
    if !language_hints.is_empty() {
        request["imageContext"] = serde_json::json!({ "languageHints": language_hints });
    }
    serde_json::json!({ "requests": [request] })
}

#[derive(Debug, Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageResponse {
    #[serde(default)]
    full_text_annotation: Option<FullTextAnnotation>,
    #[serde(default)]
    text_annotations: Vec<EntityAnnotation>,
    #[serde(default)]
    error: Option<Status>,
}

#[derive(Debug, Deserialize)]
struct FullTextAnnotation {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct EntityAnnotation {
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct Status {
    #[serde(default)]
    code: Option<i32>,
    #[serde(default)]
    message: String,
}

/// Full-text annotation if present, else the first (whole-image) text annotation.
fn extract_text(data: AnnotateResponse) -> Result<String, ServiceError> {
    let Some(first) = data.responses.into_iter().next() else {
        return Err(ServiceError::malformed(SERVICE, "no responses in annotate result"));
    };
    if let Some(status) = first.error {
        return Err(ServiceError::Api {
            service: SERVICE,
            status: status.code.and_then(|c| u16::try_from(c).ok()).unwrap_or(0),
            body: status.message,
        });
    }
    if let Some(full) = first.full_text_annotation {
        return Ok(full.text);
    }
    Ok(first
        .text_annotations
        .into_iter()
        .next()
        .map(|a| a.description)
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> AnnotateResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn request_includes_language_hints_only_when_set() {
        let body = annotate_request("AAAA", &[]);
        assert!(body["requests"][0].get("imageContext").is_none());
        assert_eq!(body["requests"][0]["image"]["content"], "AAAA");
        assert_eq!(
            body["requests"][0]["features"][0]["type"],
            "DOCUMENT_TEXT_DETECTION"
        );

        let body = annotate_request("AAAA", &["ru".to_string()]);
        assert_eq!(body["requests"][0]["imageContext"]["languageHints"][0], "ru");
    }

    #[test]
    fn prefers_full_text_annotation() {
        let data = parse(
            r#"{"responses": [{
                "fullTextAnnotation": {"text": "Line one\nLine two"},
                "textAnnotations": [{"description": "other"}]
            }]}"#,
        );
        assert_eq!(extract_text(data).unwrap(), "Line one\nLine two");
    }

    #[test]
    fn falls_back_to_text_annotations() {
        let data = parse(r#"{"responses": [{"textAnnotations": [{"description": "word"}]}]}"#);
        assert_eq!(extract_text(data).unwrap(), "word");
    }

    #[test]
    fn empty_response_means_no_text() {
        let data = parse(r#"{"responses": [{}]}"#);
        assert_eq!(extract_text(data).unwrap(), "");
    }

    #[test]
    fn per_image_error_is_an_api_error() {
        let data = parse(r#"{"responses": [{"error": {"code": 3, "message": "Bad image data."}}]}"#);
        let err = extract_text(data).unwrap_err();
        assert_eq!(err.kind_name(), "ApiError");
        assert!(err.to_string().contains("Bad image data."));
    }
}
