//! Lessonbot core library: the Telegram webhook gateway, the update pipeline
//! (OCR, summarization, archival), and the clients for the services it drives.

pub mod archive;
pub mod channels;
pub mod config;
pub mod error;
pub mod gateway;
pub mod google;
pub mod guard;
pub mod llm;
pub mod pipeline;
