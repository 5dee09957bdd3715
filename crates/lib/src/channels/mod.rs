//! Chat platform (Telegram).
//!
//! Webhook update types, the Bot API client, and resolution of the image a message carries.

mod attachment;
mod telegram;

pub use attachment::{resolve_image, ImageRef};
pub use telegram::{
    split_message, PhotoSize, TelegramChat, TelegramClient, TelegramDocument, TelegramMessage,
    TelegramUpdate, MAX_MESSAGE_CHARS,
};
