//! Google Docs: read the document outline and append a lesson section with one batchUpdate.
//!
//! Indices are UTF-16 code units, as the Docs API counts them. New content is inserted just
//! before the body's final newline, so each insert advances a cursor by the inserted length.

use crate::error::ServiceError;
use crate::google::auth::TokenSource;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

const SERVICE: &str = "docs";
pub const DEFAULT_API_BASE: &str = "https://docs.googleapis.com";
const OUTLINE_FIELDS: &str = "body.content(endIndex,paragraph.elements.textRun.content)";
/// Width of the embedded image, in points.
const IMAGE_WIDTH_PT: f64 = 400.0;

#[derive(Debug, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub body: Body,
}

#[derive(Debug, Default, Deserialize)]
pub struct Body {
    #[serde(default)]
    pub content: Vec<StructuralElement>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuralElement {
    #[serde(default)]
    pub end_index: Option<u32>,
    #[serde(default)]
    pub paragraph: Option<Paragraph>,
}

#[derive(Debug, Deserialize)]
pub struct Paragraph {
    #[serde(default)]
    pub elements: Vec<ParagraphElement>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParagraphElement {
    #[serde(default)]
    pub text_run: Option<TextRun>,
}

#[derive(Debug, Deserialize)]
pub struct TextRun {
    #[serde(default)]
    pub content: String,
}

impl Document {
    /// Index one past the last character of the body (the body's final newline ends at it).
    pub fn end_index(&self) -> u32 {
        self.body
            .content
            .iter()
            .filter_map(|e| e.end_index)
            .max()
            .unwrap_or(1)
    }

    /// Plain text of each paragraph, trailing newline removed.
    pub fn paragraphs(&self) -> impl Iterator<Item = String> + '_ {
        self.body.content.iter().filter_map(|e| {
            e.paragraph.as_ref().map(|p| {
                p.elements
                    .iter()
                    .filter_map(|el| el.text_run.as_ref())
                    .map(|t| t.content.as_str())
                    .collect::<String>()
                    .trim_end_matches('\n')
                    .to_string()
            })
        })
    }

    pub fn has_paragraph(&self, text: &str) -> bool {
        let wanted = text.trim();
        self.paragraphs().any(|p| p.trim() == wanted)
    }

    /// True when the body holds nothing but the mandatory trailing newline.
    pub fn is_blank(&self) -> bool {
        self.paragraphs().all(|p| p.trim().is_empty())
    }
}

/// Content of one archived lesson.
#[derive(Debug, Clone)]
pub struct LessonSection<'a> {
    /// Day header; inserted (after a page break) only when the document lacks it.
    pub day_header: &'a str,
    pub title: &'a str,
    pub image_uri: &'a str,
    pub summary: &'a str,
}

fn utf16_len(s: &str) -> u32 {
    s.encode_utf16().count() as u32
}

/// Builds batchUpdate requests that insert content at a moving cursor.
struct EditBuilder {
    cursor: u32,
    requests: Vec<Value>,
}

impl EditBuilder {
    fn new(cursor: u32) -> Self {
        Self {
            cursor,
            requests: Vec::new(),
        }
    }

    fn page_break(&mut self) {
        self.requests.push(json!({
            "insertPageBreak": { "location": { "index": self.cursor } }
        }));
        // page break plus the newline Docs adds after it
        self.cursor += 2;
    }

    fn paragraph(&mut self, text: &str, style: &str) {
        let text = format!("{}\n", text.replace('\r', "").trim_end());
        let start = self.cursor;
        let len = utf16_len(&text);
        self.requests.push(json!({
            "insertText": { "location": { "index": start }, "text": text }
        }));
        self.style(start, start + len, style);
        self.cursor += len;
    }

    fn image(&mut self, uri: &str) {
        let start = self.cursor;
        self.requests.push(json!({
            "insertInlineImage": {
                "location": { "index": start },
                "uri": uri,
                "objectSize": { "width": { "magnitude": IMAGE_WIDTH_PT, "unit": "PT" } }
            }
        }));
        self.requests.push(json!({
            "insertText": { "location": { "index": start + 1 }, "text": "\n" }
        }));
        self.style(start, start + 2, "NORMAL_TEXT");
        self.cursor += 2;
    }

    fn style(&mut self, start: u32, end: u32, style: &str) {
        self.requests.push(json!({
            "updateParagraphStyle": {
                "range": { "startIndex": start, "endIndex": end },
                "paragraphStyle": { "namedStyleType": style },
                "fields": "namedStyleType"
            }
        }));
    }
}

/// Requests appending `section` at the end of `doc`. The day header (preceded by a page break
/// unless the document is blank) is added only if no paragraph already matches it.
pub fn append_section_requests(doc: &Document, section: &LessonSection<'_>) -> Vec<Value> {
    let mut b = EditBuilder::new(doc.end_index().saturating_sub(1).max(1));
    if !doc.has_paragraph(section.day_header) {
        if !doc.is_blank() {
            b.page_break();
        }
        b.paragraph(section.day_header, "HEADING_1");
    }
    b.paragraph(section.title, "HEADING_2");
    b.image(section.image_uri);
    b.paragraph(section.summary, "NORMAL_TEXT");
    b.requests
}

pub struct DocsClient {
    api_base: String,
    tokens: Arc<dyn TokenSource>,
    client: reqwest::Client,
}

impl DocsClient {
    pub fn new(api_base: &str, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            tokens,
            client: reqwest::Client::new(),
        }
    }

    /// GET /v1/documents/{id}, limited to what the outline needs.
    pub async fn get(&self, document_id: &str) -> Result<Document, ServiceError> {
        let token = self.tokens.access_token().await?;
        let url = format!("{}/v1/documents/{}", self.api_base, document_id);
        let res = self
            .client
            .get(&url)
            .bearer_auth(token)
            .query(&[("fields", OUTLINE_FIELDS)])
            .send()
            .await
            .map_err(|e| ServiceError::request(SERVICE, e))?;
        let res = ServiceError::check(SERVICE, res).await?;
        res.json()
            .await
            .map_err(|e| ServiceError::request(SERVICE, e))
    }

    /// POST /v1/documents/{id}:batchUpdate. Requests apply atomically.
    pub async fn batch_update(
        &self,
        document_id: &str,
        requests: Vec<Value>,
    ) -> Result<(), ServiceError> {
        let token = self.tokens.access_token().await?;
        let url = format!("{}/v1/documents/{}:batchUpdate", self.api_base, document_id);
        let res = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&json!({ "requests": requests }))
            .send()
            .await
            .map_err(|e| ServiceError::request(SERVICE, e))?;
        ServiceError::check(SERVICE, res).await?;
        Ok(())
    }
}
