//! Language-model summarization (Gemini).

mod gemini;

pub use gemini::{GeminiClient, SUMMARY_PROMPT};
