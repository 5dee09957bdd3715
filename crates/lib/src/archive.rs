//! Archival of a processed lesson: image to Drive, then a dated section in the shared Doc.

use crate::error::ServiceError;
use crate::google::{append_section_requests, DocsClient, DriveClient, LessonSection};
use crate::pipeline::{ArchiveEntry, ArchiveReceipt, Archiver};
use async_trait::async_trait;
use chrono::{DateTime, Local};

/// Day header text, one per calendar day.
pub fn day_header(at: &DateTime<Local>) -> String {
    at.format("%d.%m.%Y").to_string()
}

/// Title of one lesson within the day.
pub fn lesson_title(at: &DateTime<Local>) -> String {
    format!("Lesson {}", at.format("%H:%M"))
}

/// Archives lessons to one Google Doc, hosting images on Drive.
pub struct GoogleArchiver {
    drive: DriveClient,
    docs: DocsClient,
    document_id: String,
    drive_folder_id: Option<String>,
}

impl GoogleArchiver {
    pub fn new(
        drive: DriveClient,
        docs: DocsClient,
        document_id: String,
        drive_folder_id: Option<String>,
    ) -> Self {
        Self {
            drive,
            docs,
            document_id,
            drive_folder_id,
        }
    }
}

#[async_trait]
impl Archiver for GoogleArchiver {
    async fn archive(&self, entry: &ArchiveEntry<'_>) -> Result<ArchiveReceipt, ServiceError> {
        let file = self
            .drive
            .upload(
                entry.file_name,
                entry.mime_type,
                self.drive_folder_id.as_deref(),
                entry.image,
            )
            .await?;
        self.drive.share_publicly(&file.id).await?;
        let image_uri = file.content_url();

        let doc = self.docs.get(&self.document_id).await?;
        let header = day_header(&entry.at);
        let title = lesson_title(&entry.at);
        let new_day = !doc.has_paragraph(&header);
        let requests = append_section_requests(
            &doc,
            &LessonSection {
                day_header: &header,
                title: &title,
                image_uri: &image_uri,
                summary: entry.summary,
            },
        );
        self.docs.batch_update(&self.document_id, requests).await?;
        log::info!(
            "archive: appended \"{}\" to document {} (new day section: {})",
            title,
            self.document_id,
            new_day
        );
        Ok(ArchiveReceipt {
            drive_file_id: file.id,
            image_uri,
            new_day,
        })
    }
}
