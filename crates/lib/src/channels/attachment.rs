//! Pick the image to process from an inbound message.

use crate::channels::telegram::TelegramMessage;

const PHOTO_MIME: &str = "image/jpeg";

/// Reference to an image attached to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub file_id: String,
    pub mime_type: String,
}

impl ImageRef {
    /// File extension for saving the image locally.
    pub fn extension(&self) -> &str {
        match self.mime_type.as_str() {
            "image/png" => "png",
            "image/webp" => "webp",
            "image/gif" => "gif",
            "image/heic" => "heic",
            "image/bmp" => "bmp",
            "image/tiff" => "tiff",
            _ => "jpg",
        }
    }
}

/// Compressed photo (largest variant, which Telegram lists last) or an image document.
/// `None` when the message carries neither.
pub fn resolve_image(message: &TelegramMessage) -> Option<ImageRef> {
    if let Some(largest) = message.photo.last() {
        return Some(ImageRef {
            file_id: largest.file_id.clone(),
            mime_type: PHOTO_MIME.to_string(),
        });
    }
    let doc = message.document.as_ref()?;
    let mime = doc.mime_type.as_deref()?.trim().to_ascii_lowercase();
    if !mime.starts_with("image/") {
        return None;
    }
    Some(ImageRef {
        file_id: doc.file_id.clone(),
        mime_type: mime,
    })
}
