//! Решает, продолжает ли входящее сообщение чей-то открытый диалог.

use teloxide::types::{CallbackQuery, Message, MessageId, UserId};

use crate::conversation::{Conversation, ConversationStore, Origin, Step, WizardKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyPolicy {
    /// Ввод засчитывается только ответом (reply) на последний вопрос.
    ReplyRequired,
    /// Годится любое следующее сообщение, если шаг его ждёт.
    FreeForm,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Text(String),
    Photo(String),
    Document(String),
    /// callback_data нажатой кнопки
    Choice(String),
    Other,
}

/// Входящее событие, приведённое к одному виду для сообщений и нажатий кнопок.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub subject: UserId,
    pub origin: Origin,
    pub reply_to: Option<MessageId>,
    pub content: Content,
}

impl Inbound {
    pub fn from_message(msg: &Message) -> Option<Self> {
        let subject = msg.from.as_ref()?.id;
        // в теме форума каждое сообщение «отвечает» на её корневое сообщение;
        // в обычной супергруппе thread_id у ответа тоже есть, но это настоящий ответ
        let topic_root = msg.thread_id.filter(|_| msg.is_topic_message);
        let reply_to = msg
            .reply_to_message()
            .map(|r| r.id)
            .filter(|id| topic_root.map_or(true, |t| t.0 != *id));

        let content = if let Some(t) = msg.text() {
            Content::Text(t.to_string())
        } else if let Some(sizes) = msg.photo() {
            match sizes.last() {
                Some(p) => Content::Photo(p.file.id.0.clone()),
                None => Content::Other,
            }
        } else if let Some(doc) = msg.document() {
            Content::Document(doc.file.id.0.clone())
        } else if let Some(c) = msg.caption() {
            Content::Text(c.to_string())
        } else {
            Content::Other
        };

        Some(Self {
            subject,
            origin: Origin { chat: msg.chat.id, thread: msg.thread_id },
            reply_to,
            content,
        })
    }

    /// Сообщение с нажатой кнопкой считается тем, на что «ответили».
    pub fn from_callback(q: &CallbackQuery) -> Option<Self> {
        let host = q.message.as_ref()?;
        let data = q.data.clone()?;
        Some(Self {
            subject: q.from.id,
            origin: Origin {
                chat: host.chat().id,
                thread: host.regular_message().and_then(|m| m.thread_id),
            },
            reply_to: Some(host.id()),
            content: Content::Choice(data),
        })
    }

    pub fn text(&self) -> Option<&str> {
        match &self.content {
            Content::Text(t) => Some(t.trim()),
            _ => None,
        }
    }

    /// Значение кнопки мастера (`wz:<value>`).
    pub fn choice(&self) -> Option<&str> {
        match &self.content {
            Content::Choice(d) => d.strip_prefix("wz:"),
            _ => None,
        }
    }
}

/// Правила в порядке приоритета, первое сработавшее решает.
pub fn matches(
    conv: &Conversation,
    policy: ReplyPolicy,
    accepts: impl Fn(Step) -> bool,
    inbound: &Inbound,
) -> bool {
    if conv.subject != inbound.subject || conv.origin.chat != inbound.origin.chat {
        return false;
    }
    match (inbound.reply_to, policy) {
        (None, ReplyPolicy::ReplyRequired) => false,
        (Some(target), _) => conv.anchor == Some(target),
        (None, ReplyPolicy::FreeForm) => accepts(conv.step),
    }
}

pub async fn correlate(
    store: &ConversationStore,
    kind: WizardKind,
    policy: ReplyPolicy,
    accepts: impl Fn(Step) -> bool,
    inbound: &Inbound,
) -> Option<Conversation> {
    let conv = store.get(kind, inbound.subject).await?;
    matches(&conv, policy, accepts, inbound).then_some(conv)
}
