//! Gemini API client (generateContent) used to summarize recognized lesson text.
//! The request carries the OCR text and the original image so the model can fix recognition errors.

use crate::error::ServiceError;
use crate::pipeline::Summarizer;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Deserialize;
use serde_json::{json, Value};

const SERVICE: &str = "gemini";

/// Fixed instruction sent with every summarization request.
pub const SUMMARY_PROMPT: &str = "You are given a photo of lesson notes and the text recognized from it by OCR. \
The OCR text may contain recognition mistakes; use the image to correct them. \
Write a structured summary of the lesson in the same language as the notes:\n\
1. Topic: one line.\n\
2. Key points: a short bulleted list.\n\
3. Terms and definitions, if any.\n\
4. Homework or tasks, if mentioned.\n\
Use plain text without Markdown formatting. Do not invent content that is not in the notes.";

/// Client for the Gemini generateContent endpoint.
#[derive(Clone)]
pub struct GeminiClient {
    api_base: String,
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(api_base: &str, model: &str, api_key: String) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            model: model.trim().to_string(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        let model_path = if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    /// POST {model}:generateContent with the prompt, OCR text and inline image.
    pub async fn generate(
        &self,
        ocr_text: &str,
        image: &[u8],
        mime_type: &str,
    ) -> Result<String, ServiceError> {
        let body = summarize_request(SUMMARY_PROMPT, ocr_text, &STANDARD.encode(image), mime_type);
        let res = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::request(SERVICE, e))?;
        let res = ServiceError::check(SERVICE, res).await?;
        let data: GenerateResponse = res
            .json()
            .await
            .map_err(|e| ServiceError::request(SERVICE, e))?;
        extract_summary(data)
    }
}

#[async_trait]
impl Summarizer for GeminiClient {
    async fn summarize(
        &self,
        text: &str,
        image: &[u8],
        mime_type: &str,
    ) -> Result<String, ServiceError> {
        self.generate(text, image, mime_type).await
    }
}

fn summarize_request(prompt: &str, ocr_text: &str, image_b64: &str, mime_type: &str) -> Value {
    json!({
        "contents": [{
            "role": "user",
            "parts": [
                { "text": prompt },
                { "text": format!("OCR text:\n{}", ocr_text) },
                { "inlineData": { "mimeType": mime_type, "data": image_b64 } }
            ]
        }]
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

/// Concatenated text parts of the first candidate. A blocked prompt or empty answer is an error.
fn extract_summary(data: GenerateResponse) -> Result<String, ServiceError> {
    if let Some(reason) = data.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(ServiceError::malformed(
            SERVICE,
            format!("prompt blocked: {}", reason),
        ));
    }
    let Some(candidate) = data.candidates.into_iter().next() else {
        return Err(ServiceError::malformed(SERVICE, "no candidates"));
    };
    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    let text = text.trim();
    if text.is_empty() {
        return Err(ServiceError::malformed(
            SERVICE,
            format!(
                "empty summary (finish reason: {})",
                candidate.finish_reason.as_deref().unwrap_or("unknown")
            ),
        ));
    }
    Ok(text.to_string())
}
