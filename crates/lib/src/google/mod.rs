//! Google APIs: OAuth tokens, Cloud Vision OCR, Drive uploads, and Docs edits.

pub mod auth;
pub mod docs;
pub mod drive;
pub mod vision;

pub use auth::{RefreshTokenSource, ServiceAccountTokenSource, TokenSource, SCOPE_CLOUD_VISION};
pub use docs::{append_section_requests, DocsClient, Document, LessonSection};
pub use drive::{DriveClient, DriveFile};
pub use vision::VisionClient;
