use teloxide::{ApiError, RequestError};
use thiserror::Error;

use crate::conversation::WizardKind;

/// Ошибки обращения к Telegram.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("telegram: {0}")]
    Telegram(RequestError),
    /// Сообщение или callback уже недействительны — отвечать некуда.
    #[error("stale message or callback query")]
    Stale,
}

impl From<RequestError> for GatewayError {
    fn from(e: RequestError) -> Self {
        match e {
            RequestError::Api(
                ApiError::MessageToEditNotFound
                | ApiError::MessageToDeleteNotFound
                | ApiError::InvalidQueryId,
            ) => GatewayError::Stale,
            other => GatewayError::Telegram(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("duplicate key {0}")]
    Duplicate(String),
    #[error("could not allocate a short code after {attempts} attempts")]
    CodeSpaceExhausted { attempts: usize },
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("kinopoisk http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("kinopoisk status {0}")]
    Status(reqwest::StatusCode),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConversationError {
    #[error("conversation {0:?} is already open")]
    AlreadyOpen(WizardKind),
    #[error("no open {0:?} conversation")]
    NotFound(WizardKind),
}

#[derive(Debug, Error)]
pub enum BotError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Conversation(#[from] ConversationError),
}

impl From<RequestError> for BotError {
    fn from(e: RequestError) -> Self {
        BotError::Gateway(e.into())
    }
}

impl BotError {
    pub fn is_stale(&self) -> bool {
        matches!(self, BotError::Gateway(GatewayError::Stale))
    }

    /// Текст для пользователя, без технических подробностей.
    pub fn user_message(&self) -> &'static str {
        match self {
            BotError::Catalog(_) => "Кинопоиск сейчас не отвечает, попробуй ещё раз чуть позже.",
            BotError::Storage(StorageError::CodeSpaceExhausted { .. }) => {
                "Не удалось выдать ссылку для подборки, попробуй ещё раз."
            }
            BotError::Conversation(ConversationError::AlreadyOpen(_)) => {
                "Сначала закончи текущий диалог или отправь /cancel."
            }
            _ => "Что-то пошло не так, попробуй ещё раз.",
        }
    }
}
