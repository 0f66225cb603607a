//! Реестр открытых диалогов-мастеров.
//!
//! На каждый вид мастера свой реестр `UserId -> Conversation`. Запись живёт ровно
//! столько, сколько мастер ждёт ввода: удаление записи и есть завершение диалога.

use serde_json::Value;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use teloxide::types::{ChatId, MessageId, ThreadId, UserId};
use tokio::{sync::RwLock, task::JoinHandle};
use tracing::{debug, info};

use crate::error::ConversationError;

pub type Step = u8;
pub type Payload = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WizardKind {
    PlanViewing,
    UploadTicket,
    CheckPayment,
    AddAdmin,
    Unsubscribe,
    AddTagCollection,
    EditSettings,
    ImportCatalog,
    MarkWatched,
    ViewDescription,
}

impl WizardKind {
    pub const ALL: [WizardKind; 10] = [
        WizardKind::PlanViewing,
        WizardKind::UploadTicket,
        WizardKind::CheckPayment,
        WizardKind::AddAdmin,
        WizardKind::Unsubscribe,
        WizardKind::AddTagCollection,
        WizardKind::EditSettings,
        WizardKind::ImportCatalog,
        WizardKind::MarkWatched,
        WizardKind::ViewDescription,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WizardKind::PlanViewing => "plan_viewing",
            WizardKind::UploadTicket => "upload_ticket",
            WizardKind::CheckPayment => "check_payment",
            WizardKind::AddAdmin => "add_admin",
            WizardKind::Unsubscribe => "unsubscribe",
            WizardKind::AddTagCollection => "add_tag_collection",
            WizardKind::EditSettings => "edit_settings",
            WizardKind::ImportCatalog => "import_catalog",
            WizardKind::MarkWatched => "mark_watched",
            WizardKind::ViewDescription => "view_description",
        }
    }
}

/// Где продолжается диалог, независимо от того, откуда его запустили.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    pub chat: ChatId,
    pub thread: Option<ThreadId>,
}

impl Origin {
    pub fn chat(chat: ChatId) -> Self {
        Self { chat, thread: None }
    }
}

#[derive(Debug, Clone)]
pub struct Conversation {
    pub kind: WizardKind,
    pub subject: UserId,
    pub step: Step,
    /// Последний отправленный вопрос; `None` — принимаем любое следующее сообщение.
    pub anchor: Option<MessageId>,
    pub payload: Payload,
    pub origin: Origin,
    pub created_at: Instant,
    pub last_advanced_at: Instant,
}

impl Conversation {
    pub fn str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn u64(&self, key: &str) -> Option<u64> {
        self.payload.get(key).and_then(Value::as_u64)
    }
}

/// Повторный `start` того же вида (или другого — при `Exclusive`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    Replace,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusivity {
    /// Разные мастера у одного пользователя живут независимо.
    PerKind,
    /// Не больше одного открытого мастера на пользователя.
    Exclusive,
}

#[derive(Debug, Clone, Copy)]
pub struct StorePolicy {
    pub on_conflict: ConflictPolicy,
    pub exclusivity: Exclusivity,
    pub idle_timeout: Duration,
}

impl Default for StorePolicy {
    fn default() -> Self {
        Self {
            on_conflict: ConflictPolicy::Replace,
            exclusivity: Exclusivity::Exclusive,
            idle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

type Registry = HashMap<UserId, Conversation>;

#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<RwLock<HashMap<WizardKind, Registry>>>,
    policy: StorePolicy,
}

impl ConversationStore {
    pub fn new(policy: StorePolicy) -> Self {
        Self { inner: Arc::new(RwLock::new(HashMap::new())), policy }
    }

    pub fn policy(&self) -> StorePolicy {
        self.policy
    }

    pub async fn start(
        &self,
        kind: WizardKind,
        subject: UserId,
        origin: Origin,
        step: Step,
        payload: Payload,
        anchor: Option<MessageId>,
    ) -> Result<Conversation, ConversationError> {
        let mut guard = self.inner.write().await;

        let blocking: Vec<WizardKind> = guard
            .iter()
            .filter(|(k, reg)| {
                reg.contains_key(&subject)
                    && (**k == kind || self.policy.exclusivity == Exclusivity::Exclusive)
            })
            .map(|(k, _)| *k)
            .collect();

        if let Some(first) = blocking.first() {
            if self.policy.on_conflict == ConflictPolicy::Reject {
                return Err(ConversationError::AlreadyOpen(*first));
            }
            for k in &blocking {
                if let Some(reg) = guard.get_mut(k) {
                    reg.remove(&subject);
                }
                debug!(subject = subject.0, kind = k.as_str(), "conversation replaced");
            }
        }

        let now = Instant::now();
        let conv = Conversation {
            kind,
            subject,
            step,
            anchor,
            payload,
            origin,
            created_at: now,
            last_advanced_at: now,
        };
        guard.entry(kind).or_default().insert(subject, conv.clone());
        Ok(conv)
    }

    pub async fn get(&self, kind: WizardKind, subject: UserId) -> Option<Conversation> {
        let guard = self.inner.read().await;
        guard.get(&kind).and_then(|reg| reg.get(&subject)).cloned()
    }

    /// Следующий шаг: `patch` дописывается в payload, якорь заменяется.
    pub async fn advance(
        &self,
        kind: WizardKind,
        subject: UserId,
        step: Step,
        patch: Payload,
        anchor: Option<MessageId>,
    ) -> Result<Conversation, ConversationError> {
        let mut guard = self.inner.write().await;
        let conv = guard
            .get_mut(&kind)
            .and_then(|reg| reg.get_mut(&subject))
            .ok_or(ConversationError::NotFound(kind))?;
        conv.payload.extend(patch);
        conv.step = step;
        conv.anchor = anchor;
        conv.last_advanced_at = Instant::now();
        Ok(conv.clone())
    }

    /// Шаг назад: единственный переход, который убирает поля из payload.
    pub async fn rewind(
        &self,
        kind: WizardKind,
        subject: UserId,
        step: Step,
        clear: &[&str],
        anchor: Option<MessageId>,
    ) -> Result<Conversation, ConversationError> {
        let mut guard = self.inner.write().await;
        let conv = guard
            .get_mut(&kind)
            .and_then(|reg| reg.get_mut(&subject))
            .ok_or(ConversationError::NotFound(kind))?;
        for key in clear {
            conv.payload.remove(*key);
        }
        conv.step = step;
        conv.anchor = anchor;
        conv.last_advanced_at = Instant::now();
        Ok(conv.clone())
    }

    /// Идемпотентно: `false`, если закрывать было нечего.
    pub async fn end(&self, kind: WizardKind, subject: UserId) -> bool {
        let mut guard = self.inner.write().await;
        guard
            .get_mut(&kind)
            .map(|reg| reg.remove(&subject).is_some())
            .unwrap_or(false)
    }

    /// Закрыть всё, что открыто у пользователя. Возвращает закрытые диалоги.
    pub async fn end_all(&self, subject: UserId) -> Vec<Conversation> {
        let mut guard = self.inner.write().await;
        guard.values_mut().filter_map(|reg| reg.remove(&subject)).collect()
    }

    /// Удалить диалоги, простаивающие дольше `idle_timeout` на момент `now`.
    pub async fn sweep(&self, now: Instant) -> usize {
        let idle = self.policy.idle_timeout;
        let mut guard = self.inner.write().await;
        let mut removed = 0;
        for reg in guard.values_mut() {
            let before = reg.len();
            reg.retain(|_, c| now.saturating_duration_since(c.last_advanced_at) <= idle);
            removed += before - reg.len();
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.values().map(HashMap::len).sum()
    }
}

/// Фоновый тик, который чистит брошенные диалоги.
pub fn spawn_sweeper(store: ConversationStore, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let removed = store.sweep(Instant::now()).await;
            if removed > 0 {
                let open = store.len().await;
                info!(removed, open, "expired idle conversations");
            }
        }
    })
}

pub fn patch<const N: usize>(pairs: [(&str, Value); N]) -> Payload {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}
