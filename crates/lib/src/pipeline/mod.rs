//! Update pipeline: the external services it drives and the handler that drives them.
//!
//! Each collaborator sits behind a trait so the handler can run against fakes in tests.

mod handler;
mod stage;

pub use handler::{
    ArchiveStatus, HandleOutcome, HandlerContext, HandlerSettings, StageTimeouts, ACK_TEXT,
    ARCHIVE_FAILED_TEXT, FAILURE_TEXT, GUIDANCE_TEXT, NO_TEXT_APOLOGY,
};
pub use stage::run_stage;

use crate::error::ServiceError;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::sync::Arc;

/// File fetched from the chat platform.
#[derive(Debug, Clone)]
pub struct DownloadedFile {
    /// Platform-side path the file was served from.
    pub path: String,
    pub bytes: Vec<u8>,
}

/// Chat platform operations used by the pipeline.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Send text to a chat, split as needed to fit the platform's message limit.
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), ServiceError>;
    /// Resolve a file id and download its content.
    async fn fetch_file(&self, file_id: &str) -> Result<DownloadedFile, ServiceError>;
}

/// OCR. Returns an empty string when the image has no text.
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    async fn recognize(&self, image: &[u8]) -> Result<String, ServiceError>;
}

/// Summarization of recognized text, with the source image for context.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        text: &str,
        image: &[u8],
        mime_type: &str,
    ) -> Result<String, ServiceError>;
}

/// What gets archived after a summary is delivered.
#[derive(Debug, Clone)]
pub struct ArchiveEntry<'a> {
    pub image: &'a [u8],
    pub mime_type: &'a str,
    pub file_name: &'a str,
    pub summary: &'a str,
    pub at: DateTime<Local>,
}

#[derive(Debug, Clone)]
pub struct ArchiveReceipt {
    pub drive_file_id: String,
    pub image_uri: String,
    /// True when a new day section (header) was started.
    pub new_day: bool,
}

#[async_trait]
pub trait Archiver: Send + Sync {
    async fn archive(&self, entry: &ArchiveEntry<'_>) -> Result<ArchiveReceipt, ServiceError>;
}

/// The collaborators one handler drives. `archiver` is `None` when archival is disabled.
#[derive(Clone)]
pub struct Services {
    pub chat: Arc<dyn ChatApi>,
    pub ocr: Arc<dyn TextRecognizer>,
    pub summarizer: Arc<dyn Summarizer>,
    pub archiver: Option<Arc<dyn Archiver>>,
}
