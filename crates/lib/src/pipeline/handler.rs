//! Handling of one inbound update: gate, resolve the image, run the stages, reply, archive.

use crate::channels::{resolve_image, ImageRef, TelegramMessage, TelegramUpdate};
use crate::config::{self, Config};
use crate::error::{PipelineError, Stage, StageFailure, UserNotice};
use crate::guard::{DedupCache, DedupKey, SingleFlight, DEFAULT_DEDUP_WINDOW};
use crate::pipeline::stage::run_stage;
use crate::pipeline::{ArchiveEntry, DownloadedFile, Services};
use std::path::PathBuf;
use std::time::{Duration, Instant};

pub const GUIDANCE_TEXT: &str =
    "Send me a photo of your lesson notes (as a photo or an image file) and I will summarize it.";
pub const ACK_TEXT: &str = "Got it! Reading the image...";
pub const NO_TEXT_APOLOGY: &str = "Sorry, I couldn't find any text in this image.";
pub const FAILURE_TEXT: &str = "Sorry, something went wrong while processing the image.";
pub const ARCHIVE_FAILED_TEXT: &str = "Summary sent, but saving it to the document failed.";

/// Timeout of each stage.
#[derive(Debug, Clone)]
pub struct StageTimeouts {
    /// Acknowledge, download and reply.
    pub telegram: Duration,
    pub ocr: Duration,
    pub summarize: Duration,
    pub archive: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            telegram: Duration::from_secs(20),
            ocr: Duration::from_secs(30),
            summarize: Duration::from_secs(40),
            archive: Duration::from_secs(40),
        }
    }
}

impl StageTimeouts {
    pub fn for_stage(&self, stage: Stage) -> Duration {
        match stage {
            Stage::Acknowledge | Stage::Download | Stage::Reply => self.telegram,
            Stage::Ocr => self.ocr,
            Stage::Summarize => self.summarize,
            Stage::Archive => self.archive,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub timeouts: StageTimeouts,
    pub dedup_window: Duration,
    /// Put the failure class and message into error replies.
    pub debug_errors: bool,
    pub image_dir: Option<PathBuf>,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            timeouts: StageTimeouts::default(),
            dedup_window: DEFAULT_DEDUP_WINDOW,
            debug_errors: false,
            image_dir: None,
        }
    }
}

impl HandlerSettings {
    pub fn from_config(config: &Config) -> Self {
        let t = &config.timeouts;
        Self {
            timeouts: StageTimeouts {
                telegram: Duration::from_secs(t.telegram_secs),
                ocr: Duration::from_secs(t.ocr_secs),
                summarize: Duration::from_secs(t.summarize_secs),
                archive: Duration::from_secs(t.archive_secs),
            },
            dedup_window: config.dedup.window(),
            debug_errors: config::resolve_debug_errors(config),
            image_dir: config.image_dir.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveStatus {
    Disabled,
    Archived,
    Failed,
}

/// What happened to one update. Every variant is acknowledged to the platform as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Another update holds the processing slot.
    Busy,
    /// No chat to answer to.
    NoChat,
    /// Same update seen within the dedup window.
    Duplicate,
    Notice(UserNotice),
    Failed(Stage),
    Delivered(ArchiveStatus),
}

impl HandleOutcome {
    /// Plain-text body returned to the platform.
    pub fn response_body(&self) -> &'static str {
        match self {
            HandleOutcome::Busy => "BUSY",
            _ => "OK",
        }
    }
}

/// Per-process request-handling context: services plus the dedup and single-flight state.
pub struct HandlerContext {
    services: Services,
    settings: HandlerSettings,
    dedup: DedupCache,
    flight: SingleFlight,
}

impl HandlerContext {
    pub fn new(services: Services, settings: HandlerSettings) -> Self {
        let dedup = DedupCache::new(settings.dedup_window);
        Self {
            services,
            settings,
            dedup,
            flight: SingleFlight::new(),
        }
    }

    pub fn dedup(&self) -> &DedupCache {
        &self.dedup
    }

    pub fn settings(&self) -> &HandlerSettings {
        &self.settings
    }

    pub fn is_busy(&self) -> bool {
        self.flight.is_held()
    }

    /// Handle one update end to end. Never fails; failures are reported to the chat and logged.
    pub async fn handle(&self, update: &TelegramUpdate) -> HandleOutcome {
        let Some(_permit) = self.flight.try_acquire() else {
            log::debug!("update {:?}: busy, rejected", update.update_id);
            return HandleOutcome::Busy;
        };
        let (Some(message), Some(chat_id)) = (update.message(), update.chat_id()) else {
            log::debug!("update {:?}: no chat, ignored", update.update_id);
            return HandleOutcome::NoChat;
        };
        let key = DedupKey {
            update_id: update.update_id,
            chat_id,
            message_id: message.message_id,
        };
        if !self.dedup.check_and_record(key, Instant::now()).await {
            log::debug!("update {:?}: duplicate delivery, skipped", update.update_id);
            return HandleOutcome::Duplicate;
        }

        match self.process(chat_id, message).await {
            Ok(archive) => HandleOutcome::Delivered(archive),
            Err(PipelineError::User(notice)) => {
                let text = match notice {
                    UserNotice::NoImage => GUIDANCE_TEXT,
                    UserNotice::NoText => NO_TEXT_APOLOGY,
                };
                self.notify(chat_id, text).await;
                HandleOutcome::Notice(notice)
            }
            Err(PipelineError::Stage(failure)) => {
                log::error!("chat {}: {} ({:?})", chat_id, failure, failure.kind());
                let reply = self.failure_reply(FAILURE_TEXT, &failure);
                self.notify(chat_id, &reply).await;
                HandleOutcome::Failed(failure.stage())
            }
        }
    }

    async fn process(
        &self,
        chat_id: i64,
        message: &TelegramMessage,
    ) -> Result<ArchiveStatus, PipelineError> {
        let image = resolve_image(message).ok_or(PipelineError::User(UserNotice::NoImage))?;
        log::info!("chat {}: processing image {}", chat_id, image.file_id);
        let chat = &self.services.chat;

        self.stage(Stage::Acknowledge, chat.send_text(chat_id, ACK_TEXT))
            .await?;
        let file = self
            .stage(Stage::Download, chat.fetch_file(&image.file_id))
            .await?;
        log::debug!("chat {}: downloaded {} ({} bytes)", chat_id, file.path, file.bytes.len());
        self.save_image(&image, &file).await;

        let text = self
            .stage(Stage::Ocr, self.services.ocr.recognize(&file.bytes))
            .await?;
        let text = text.trim();
        if text.is_empty() {
            log::info!("chat {}: no text recognized in {}", chat_id, image.file_id);
            return Err(PipelineError::User(UserNotice::NoText));
        }

        let summary = self
            .stage(
                Stage::Summarize,
                self.services
                    .summarizer
                    .summarize(text, &file.bytes, &image.mime_type),
            )
            .await?;
        self.stage(Stage::Reply, chat.send_text(chat_id, &summary))
            .await?;
        log::info!("chat {}: summary delivered ({} chars)", chat_id, summary.chars().count());

        Ok(self.archive(chat_id, &image, &file, &summary).await)
    }

    async fn stage<T>(
        &self,
        stage: Stage,
        fut: impl std::future::Future<Output = Result<T, crate::error::ServiceError>>,
    ) -> Result<T, StageFailure> {
        run_stage(stage, self.settings.timeouts.for_stage(stage), fut).await
    }

    /// Archive after delivery. Failure is reported as its own notice and never undoes the reply.
    async fn archive(
        &self,
        chat_id: i64,
        image: &ImageRef,
        file: &DownloadedFile,
        summary: &str,
    ) -> ArchiveStatus {
        let Some(archiver) = &self.services.archiver else {
            return ArchiveStatus::Disabled;
        };
        let file_name = format!("{}.{}", image.file_id, image.extension());
        let entry = ArchiveEntry {
            image: &file.bytes,
            mime_type: &image.mime_type,
            file_name: &file_name,
            summary,
            at: chrono::Local::now(),
        };
        match self.stage(Stage::Archive, archiver.archive(&entry)).await {
            Ok(receipt) => {
                log::info!(
                    "chat {}: archived as drive file {} ({}){}",
                    chat_id,
                    receipt.drive_file_id,
                    receipt.image_uri,
                    if receipt.new_day { ", new day section" } else { "" }
                );
                ArchiveStatus::Archived
            }
            Err(failure) => {
                log::warn!("chat {}: {} ({:?})", chat_id, failure, failure.kind());
                let reply = self.failure_reply(ARCHIVE_FAILED_TEXT, &failure);
                self.notify(chat_id, &reply).await;
                ArchiveStatus::Failed
            }
        }
    }

    fn failure_reply(&self, text: &str, failure: &StageFailure) -> String {
        if self.settings.debug_errors {
            format!("{}\n{}: {}", text, failure.type_name(), failure)
        } else {
            text.to_string()
        }
    }

    /// Best-effort message to the chat; a failure here is only logged.
    async fn notify(&self, chat_id: i64, text: &str) {
        if let Err(e) = self
            .stage(Stage::Reply, self.services.chat.send_text(chat_id, text))
            .await
        {
            log::warn!("chat {}: could not send reply: {}", chat_id, e);
        }
    }

    async fn save_image(&self, image: &ImageRef, file: &DownloadedFile) {
        let Some(dir) = &self.settings.image_dir else {
            return;
        };
        let path = dir.join(format!("{}.{}", image.file_id, image.extension()));
        let result = async {
            tokio::fs::create_dir_all(dir).await?;
            tokio::fs::write(&path, &file.bytes).await
        }
        .await;
        match result {
            Ok(()) => log::debug!("saved image to {}", path.display()),
            Err(e) => log::warn!("saving image to {}: {}", path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::pipeline::{
        ArchiveReceipt, Archiver, ChatApi, DownloadedFile, Summarizer, TextRecognizer,
    };
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use tokio::sync::Notify;

    /// Ordered log of every external call made through the fakes.
    #[derive(Default, Clone)]
    struct Calls(Arc<Mutex<Vec<String>>>);

    impl Calls {
        fn push(&self, s: impl Into<String>) {
            self.0.lock().unwrap().push(s.into());
        }
        fn all(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct FakeChat {
        calls: Calls,
        fail_fetch: bool,
    }

    #[async_trait]
    impl ChatApi for FakeChat {
        async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), ServiceError> {
            self.calls.push(format!("send {} {}", chat_id, text));
            Ok(())
        }

        async fn fetch_file(&self, file_id: &str) -> Result<DownloadedFile, ServiceError> {
            self.calls.push(format!("fetch {}", file_id));
            if self.fail_fetch {
                return Err(ServiceError::malformed("telegram", "getFile returned no file_path"));
            }
            Ok(DownloadedFile {
                path: format!("photos/{}.jpg", file_id),
                bytes: b"jpeg-bytes".to_vec(),
            })
        }
    }

    struct FakeOcr {
        calls: Calls,
        text: String,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl TextRecognizer for FakeOcr {
        async fn recognize(&self, image: &[u8]) -> Result<String, ServiceError> {
            self.calls.push("ocr");
            assert_eq!(image, b"jpeg-bytes");
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(self.text.clone())
        }
    }

    struct FakeSummarizer {
        calls: Calls,
    }

    #[async_trait]
    impl Summarizer for FakeSummarizer {
        async fn summarize(
            &self,
            text: &str,
            _image: &[u8],
            mime_type: &str,
        ) -> Result<String, ServiceError> {
            self.calls.push(format!("summarize {} {}", mime_type, text));
            Ok(format!("Summary of: {}", text))
        }
    }

    struct FakeArchiver {
        calls: Calls,
        fail: bool,
    }

    #[async_trait]
    impl Archiver for FakeArchiver {
        async fn archive(&self, entry: &ArchiveEntry<'_>) -> Result<ArchiveReceipt, ServiceError> {
            self.calls.push(format!("archive {} {}", entry.file_name, entry.summary));
            if self.fail {
                return Err(ServiceError::Api {
                    service: "docs",
                    status: 500,
                    body: "backend error".to_string(),
                });
            }
            Ok(ArchiveReceipt {
                drive_file_id: "drive-1".to_string(),
                image_uri: "https://drive/1".to_string(),
                new_day: true,
            })
        }
    }

    struct Setup {
        ocr_text: &'static str,
        fail_fetch: bool,
        archiver: Option<bool>,
        gate: Option<Arc<Notify>>,
        settings: HandlerSettings,
    }

    impl Default for Setup {
        fn default() -> Self {
            Self {
                ocr_text: "Photosynthesis converts light",
                fail_fetch: false,
                archiver: Some(false),
                gate: None,
                settings: HandlerSettings::default(),
            }
        }
    }

    impl Setup {
        fn build(self) -> (HandlerContext, Calls) {
            let calls = Calls::default();
            let services = Services {
                chat: Arc::new(FakeChat {
                    calls: calls.clone(),
                    fail_fetch: self.fail_fetch,
                }),
                ocr: Arc::new(FakeOcr {
                    calls: calls.clone(),
                    text: self.ocr_text.to_string(),
                    gate: self.gate,
                }),
                summarizer: Arc::new(FakeSummarizer {
                    calls: calls.clone(),
                }),
                archiver: self.archiver.map(|fail| {
                    Arc::new(FakeArchiver {
                        calls: calls.clone(),
                        fail,
                    }) as Arc<dyn Archiver>
                }),
            };
            (HandlerContext::new(services, self.settings), calls)
        }
    }

    fn update(json: serde_json::Value) -> TelegramUpdate {
        serde_json::from_value(json).unwrap()
    }

    fn photo_update(update_id: i64) -> TelegramUpdate {
        update(serde_json::json!({
            "update_id": update_id,
            "message": {
                "message_id": 11,
                "chat": {"id": 500},
                "photo": [
                    {"file_id": "p-small", "width": 90, "height": 90},
                    {"file_id": "p-medium", "width": 320, "height": 320},
                    {"file_id": "p-large", "width": 1280, "height": 1280}
                ]
            }
        }))
    }

    #[tokio::test]
    async fn full_flow_selects_largest_photo_and_archives() {
        let (ctx, calls) = Setup::default().build();
        let outcome = ctx.handle(&photo_update(1)).await;
        assert_eq!(outcome, HandleOutcome::Delivered(ArchiveStatus::Archived));
        assert_eq!(
            calls.all(),
            vec![
                format!("send 500 {}", ACK_TEXT),
                "fetch p-large".to_string(),
                "ocr".to_string(),
                "summarize image/jpeg Photosynthesis converts light".to_string(),
                "send 500 Summary of: Photosynthesis converts light".to_string(),
                "archive p-large.jpg Summary of: Photosynthesis converts light".to_string(),
            ]
        );
        assert!(!ctx.is_busy());
    }

    #[tokio::test]
    async fn update_without_chat_makes_no_calls() {
        let (ctx, calls) = Setup::default().build();
        let outcome = ctx
            .handle(&update(serde_json::json!({"update_id": 3, "message": {"message_id": 1}})))
            .await;
        assert_eq!(outcome, HandleOutcome::NoChat);
        assert_eq!(outcome.response_body(), "OK");
        let outcome = ctx.handle(&update(serde_json::json!({"update_id": 4}))).await;
        assert_eq!(outcome, HandleOutcome::NoChat);
        assert!(calls.all().is_empty());
        assert!(ctx.dedup().is_empty().await);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_skipped_without_calls() {
        let (ctx, calls) = Setup::default().build();
        assert!(matches!(
            ctx.handle(&photo_update(9)).await,
            HandleOutcome::Delivered(_)
        ));
        let before = calls.all().len();
        let outcome = ctx.handle(&photo_update(9)).await;
        assert_eq!(outcome, HandleOutcome::Duplicate);
        assert_eq!(outcome.response_body(), "OK");
        assert_eq!(calls.all().len(), before);
    }

    #[tokio::test]
    async fn seeded_recent_entry_blocks_and_expired_entry_does_not() {
        let (ctx, calls) = Setup::default().build();
        let key = DedupKey {
            update_id: Some(1),
            chat_id: 500,
            message_id: Some(11),
        };
        ctx.dedup().seed(key, Instant::now()).await;
        assert_eq!(ctx.handle(&photo_update(1)).await, HandleOutcome::Duplicate);
        assert!(calls.all().is_empty());

        let (ctx, calls) = Setup::default().build();
        let Some(old) = Instant::now().checked_sub(Duration::from_secs(121)) else {
            // monotonic clock too close to its origin to backdate an entry
            return;
        };
        ctx.dedup().seed(key, old).await;
        assert!(matches!(
            ctx.handle(&photo_update(1)).await,
            HandleOutcome::Delivered(_)
        ));
        assert!(!calls.all().is_empty());
    }

    #[tokio::test]
    async fn concurrent_update_is_rejected_while_busy() {
        let gate = Arc::new(Notify::new());
        let (ctx, calls) = Setup {
            gate: Some(gate.clone()),
            ..Setup::default()
        }
        .build();
        let ctx = Arc::new(ctx);

        let first = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.handle(&photo_update(1)).await })
        };
        while !calls.all().iter().any(|c| c == "ocr") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(ctx.is_busy());

        let calls_before = calls.all().len();
        let second = ctx.handle(&photo_update(2)).await;
        assert_eq!(second, HandleOutcome::Busy);
        assert_eq!(second.response_body(), "BUSY");
        assert_eq!(calls.all().len(), calls_before);
        // the rejected update was not recorded either
        assert_eq!(ctx.dedup().len().await, 1);

        gate.notify_one();
        let outcome = first.await.unwrap();
        assert!(matches!(outcome, HandleOutcome::Delivered(_)));
        assert!(!ctx.is_busy());
    }

    #[tokio::test]
    async fn guard_released_after_failure() {
        let (ctx, calls) = Setup {
            fail_fetch: true,
            ..Setup::default()
        }
        .build();
        let outcome = ctx.handle(&photo_update(1)).await;
        assert_eq!(outcome, HandleOutcome::Failed(Stage::Download));
        assert!(!ctx.is_busy());
        let all = calls.all();
        assert_eq!(all.last().unwrap(), &format!("send 500 {}", FAILURE_TEXT));
        assert!(!all.iter().any(|c| c == "ocr"));
    }

    #[tokio::test]
    async fn debug_mode_includes_failure_detail() {
        let (ctx, calls) = Setup {
            fail_fetch: true,
            settings: HandlerSettings {
                debug_errors: true,
                ..HandlerSettings::default()
            },
            ..Setup::default()
        }
        .build();
        ctx.handle(&photo_update(1)).await;
        let last = calls.all().last().cloned().unwrap();
        assert!(last.starts_with(&format!("send 500 {}\nMalformedResponse: download failed", FAILURE_TEXT)));
        assert!(last.contains("getFile returned no file_path"));
    }

    #[tokio::test]
    async fn stalled_ocr_times_out_with_timeout_class() {
        let (ctx, calls) = Setup {
            gate: Some(Arc::new(Notify::new())),
            settings: HandlerSettings {
                timeouts: StageTimeouts {
                    ocr: Duration::from_millis(20),
                    ..StageTimeouts::default()
                },
                debug_errors: true,
                ..HandlerSettings::default()
            },
            ..Setup::default()
        }
        .build();
        let outcome = ctx.handle(&photo_update(1)).await;
        assert_eq!(outcome, HandleOutcome::Failed(Stage::Ocr));
        let last = calls.all().last().cloned().unwrap();
        assert!(last.contains("\nTimeout: ocr timed out"), "{}", last);
        assert!(!ctx.is_busy());
    }

    #[tokio::test]
    async fn non_image_document_gets_guidance() {
        let (ctx, calls) = Setup::default().build();
        let outcome = ctx
            .handle(&update(serde_json::json!({
                "update_id": 5,
                "message": {
                    "message_id": 2,
                    "chat": {"id": 77},
                    "document": {"file_id": "doc-1", "mime_type": "application/pdf"}
                }
            })))
            .await;
        assert_eq!(outcome, HandleOutcome::Notice(UserNotice::NoImage));
        assert_eq!(calls.all(), vec![format!("send 77 {}", GUIDANCE_TEXT)]);
    }

    #[tokio::test]
    async fn image_document_is_processed_with_its_mime_type() {
        let (ctx, calls) = Setup {
            archiver: None,
            ..Setup::default()
        }
        .build();
        let outcome = ctx
            .handle(&update(serde_json::json!({
                "update_id": 6,
                "edited_message": {
                    "message_id": 3,
                    "chat": {"id": 78},
                    "document": {"file_id": "doc-2", "mime_type": "image/png"}
                }
            })))
            .await;
        assert_eq!(outcome, HandleOutcome::Delivered(ArchiveStatus::Disabled));
        assert!(calls
            .all()
            .contains(&"summarize image/png Photosynthesis converts light".to_string()));
    }

    #[tokio::test]
    async fn empty_ocr_gets_apology_and_skips_summarization() {
        let (ctx, calls) = Setup {
            ocr_text: "  \n ",
            ..Setup::default()
        }
        .build();
        let outcome = ctx.handle(&photo_update(1)).await;
        assert_eq!(outcome, HandleOutcome::Notice(UserNotice::NoText));
        let all = calls.all();
        assert!(!all.iter().any(|c| c.starts_with("summarize")));
        assert_eq!(all.last().unwrap(), &format!("send 500 {}", NO_TEXT_APOLOGY));
    }

    #[tokio::test]
    async fn archive_failure_follows_delivered_summary() {
        let (ctx, calls) = Setup {
            archiver: Some(true),
            ..Setup::default()
        }
        .build();
        let outcome = ctx.handle(&photo_update(1)).await;
        assert_eq!(outcome, HandleOutcome::Delivered(ArchiveStatus::Failed));
        let all = calls.all();
        let n = all.len();
        assert_eq!(all[n - 3], "send 500 Summary of: Photosynthesis converts light");
        assert!(all[n - 2].starts_with("archive "));
        assert_eq!(all[n - 1], format!("send 500 {}", ARCHIVE_FAILED_TEXT));
        assert!(!ctx.is_busy());
    }

    #[tokio::test]
    async fn downloaded_image_is_saved_when_dir_configured() {
        let dir = std::env::temp_dir().join(format!("lessonbot-images-{}", uuid::Uuid::new_v4()));
        let (ctx, _calls) = Setup {
            settings: HandlerSettings {
                image_dir: Some(dir.clone()),
                ..HandlerSettings::default()
            },
            ..Setup::default()
        }
        .build();
        ctx.handle(&photo_update(1)).await;
        let saved = std::fs::read(dir.join("p-large.jpg")).expect("image saved");
        assert_eq!(saved, b"jpeg-bytes");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn settings_follow_config() {
        let mut config = Config::default();
        config.timeouts.ocr_secs = 5;
        config.dedup.window_secs = 30;
        let s = HandlerSettings::from_config(&config);
        assert_eq!(s.timeouts.for_stage(Stage::Ocr), Duration::from_secs(5));
        assert_eq!(s.timeouts.for_stage(Stage::Reply), Duration::from_secs(20));
        assert_eq!(s.dedup_window, Duration::from_secs(30));
    }
}
