use std::future::Future;
use teloxide::{
    prelude::*,
    types::{ForceReply, InlineKeyboardMarkup, MessageId, ParseMode, ReplyMarkup},
};

use crate::conversation::Origin;
use crate::error::GatewayError;

/// Исходящее сообщение: HTML-текст и, возможно, клавиатура.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub text: String,
    pub markup: Option<ReplyMarkup>,
}

impl Prompt {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), markup: None }
    }

    /// Клиент сам откроет «ответ» на это сообщение.
    pub fn force_reply(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            markup: Some(ReplyMarkup::ForceReply(ForceReply::new())),
        }
    }

    pub fn buttons(text: impl Into<String>, kb: InlineKeyboardMarkup) -> Self {
        Self { text: text.into(), markup: Some(ReplyMarkup::InlineKeyboard(kb)) }
    }
}

/// То, что мастерам нужно от Telegram.
pub trait Messenger: Send + Sync {
    fn send(
        &self,
        to: &Origin,
        prompt: Prompt,
    ) -> impl Future<Output = Result<MessageId, GatewayError>> + Send;

    fn edit(
        &self,
        to: &Origin,
        id: MessageId,
        text: String,
    ) -> impl Future<Output = Result<MessageId, GatewayError>> + Send;

    fn delete(
        &self,
        to: &Origin,
        id: MessageId,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send;
}

impl Messenger for Bot {
    async fn send(&self, to: &Origin, prompt: Prompt) -> Result<MessageId, GatewayError> {
        let mut req = self.send_message(to.chat, prompt.text).parse_mode(ParseMode::Html);
        if let Some(thread) = to.thread {
            req = req.message_thread_id(thread);
        }
        if let Some(markup) = prompt.markup {
            req = req.reply_markup(markup);
        }
        Ok(req.await?.id)
    }

    async fn edit(&self, to: &Origin, id: MessageId, text: String) -> Result<MessageId, GatewayError> {
        let msg = self
            .edit_message_text(to.chat, id, text)
            .parse_mode(ParseMode::Html)
            .await?;
        Ok(msg.id)
    }

    async fn delete(&self, to: &Origin, id: MessageId) -> Result<(), GatewayError> {
        self.delete_message(to.chat, id).await?;
        Ok(())
    }
}
