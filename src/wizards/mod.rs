//! Мастера: пошаговые диалоги поверх `ConversationStore`.
//!
//! Каждый модуль описывает один мастер (`open`, `step`, `back`), а здесь живёт общий
//! движок: корреляция входящих, отправка вопросов и перенос нового якоря в запись.

pub mod admin;
pub mod describe;
pub mod import;
pub mod payment;
pub mod plan;
pub mod settings;
pub mod tag;
pub mod ticket;
pub mod unsubscribe;
pub mod watched;

use chrono::NaiveDate;
use serde_json::Value;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, UserId};
use tracing::{debug, error, info, warn};

use crate::app::App;
use crate::conversation::{ConflictPolicy, Conversation, Exclusivity, Origin, Payload, Step, WizardKind};
use crate::correlator::{correlate, Content, Inbound, ReplyPolicy};
use crate::error::{BotError, ConversationError, GatewayError, StorageError};
use crate::gateway::{Messenger, Prompt};
use crate::kinopoisk::Film;
use crate::storage::StoredMovie;

pub const CANCEL: &str = "cancel";
pub const BACK: &str = "back";

/// Первый вопрос мастера или отказ его открывать.
pub enum Opening {
    Prompt { step: Step, payload: Payload, prompt: Prompt },
    Denied(String),
}

/// Результат одного шага.
pub enum Transition {
    Advance { step: Step, patch: Payload, prompt: Prompt },
    /// Ввод не прошёл проверку: тот же шаг, payload не трогаем.
    Retry(Prompt),
    Back { step: Step, clear: &'static [&'static str], prompt: Prompt },
    Done(String),
    /// Права пропали посреди диалога.
    Denied(String),
}

pub fn reply_policy(kind: WizardKind) -> ReplyPolicy {
    match kind {
        WizardKind::PlanViewing => plan::POLICY,
        WizardKind::UploadTicket => ticket::POLICY,
        WizardKind::CheckPayment => payment::POLICY,
        WizardKind::AddAdmin => admin::POLICY,
        WizardKind::Unsubscribe => unsubscribe::POLICY,
        WizardKind::AddTagCollection => tag::POLICY,
        WizardKind::EditSettings => settings::POLICY,
        WizardKind::ImportCatalog => import::POLICY,
        WizardKind::MarkWatched => watched::POLICY,
        WizardKind::ViewDescription => describe::POLICY,
    }
}

pub fn consumes(kind: WizardKind, step: Step) -> bool {
    let steps: &[Step] = match kind {
        WizardKind::PlanViewing => plan::STEPS,
        WizardKind::UploadTicket => ticket::STEPS,
        WizardKind::CheckPayment => payment::STEPS,
        WizardKind::AddAdmin => admin::STEPS,
        WizardKind::Unsubscribe => unsubscribe::STEPS,
        WizardKind::AddTagCollection => tag::STEPS,
        WizardKind::EditSettings => settings::STEPS,
        WizardKind::ImportCatalog => import::STEPS,
        WizardKind::MarkWatched => watched::STEPS,
        WizardKind::ViewDescription => describe::STEPS,
    };
    steps.contains(&step)
}

async fn open(app: &App, kind: WizardKind, subject: UserId, origin: &Origin, arg: &str) -> Result<Opening, BotError> {
    match kind {
        WizardKind::PlanViewing => plan::open(app, arg).await,
        WizardKind::UploadTicket => ticket::open(app, subject, origin).await,
        WizardKind::CheckPayment => Ok(payment::open()),
        WizardKind::AddAdmin => Ok(admin::open(app, subject).await),
        WizardKind::Unsubscribe => Ok(unsubscribe::open(app, subject).await),
        WizardKind::AddTagCollection => Ok(tag::open()),
        WizardKind::EditSettings => Ok(settings::open(app, subject).await),
        WizardKind::ImportCatalog => Ok(import::open()),
        WizardKind::MarkWatched => watched::open(app, arg).await,
        WizardKind::ViewDescription => Ok(describe::open()),
    }
}

async fn step(app: &App, conv: &Conversation, input: &Inbound) -> Result<Transition, BotError> {
    match conv.kind {
        WizardKind::PlanViewing => plan::step(app, conv, input).await,
        WizardKind::UploadTicket => ticket::step(app, conv, input).await,
        WizardKind::CheckPayment => payment::step(app, conv, input).await,
        WizardKind::AddAdmin => admin::step(app, conv, input).await,
        WizardKind::Unsubscribe => unsubscribe::step(app, conv, input).await,
        WizardKind::AddTagCollection => tag::step(app, conv, input).await,
        WizardKind::EditSettings => settings::step(app, conv, input).await,
        WizardKind::ImportCatalog => import::step(app, conv, input).await,
        WizardKind::MarkWatched => watched::step(app, conv, input).await,
        WizardKind::ViewDescription => describe::step(app, conv, input).await,
    }
}

async fn back(app: &App, conv: &Conversation) -> Result<Option<Transition>, BotError> {
    Ok(match conv.kind {
        WizardKind::PlanViewing => plan::back(conv),
        WizardKind::UploadTicket => ticket::back(app, conv).await,
        WizardKind::CheckPayment => payment::back(conv),
        WizardKind::AddAdmin => admin::back(conv),
        WizardKind::AddTagCollection => tag::back(conv),
        WizardKind::EditSettings => settings::back(app, conv).await,
        WizardKind::MarkWatched => watched::back(conv),
        WizardKind::Unsubscribe | WizardKind::ImportCatalog | WizardKind::ViewDescription => None,
    })
}

/* ====== Движок ====== */

/// Общая точка входа для команд и кнопок: кто, где и с каким аргументом.
pub async fn begin<M: Messenger>(
    app: &App,
    bot: &M,
    kind: WizardKind,
    subject: UserId,
    origin: Origin,
    arg: &str,
) -> Result<(), BotError> {
    let store = &app.conversations;
    let policy = store.policy();
    if policy.on_conflict == ConflictPolicy::Reject {
        for other in WizardKind::ALL {
            let relevant = other == kind || policy.exclusivity == Exclusivity::Exclusive;
            if relevant && store.get(other, subject).await.is_some() {
                let busy = BotError::from(ConversationError::AlreadyOpen(other));
                bot.send(&origin, Prompt::text(busy.user_message())).await?;
                return Ok(());
            }
        }
    }

    match open(app, kind, subject, &origin, arg).await? {
        Opening::Denied(text) => {
            debug!(subject = subject.0, kind = kind.as_str(), "wizard denied");
            bot.send(&origin, Prompt::text(text)).await?;
        }
        Opening::Prompt { step, payload, prompt } => {
            let anchor = bot.send(&origin, prompt).await?;
            // пока шёл open, другой запуск мог успеть занять место
            if let Err(e) = store.start(kind, subject, origin, step, payload, Some(anchor)).await {
                warn!(subject = subject.0, kind = kind.as_str(), error = %e, "wizard lost the start race");
                if let Err(del) = bot.delete(&origin, anchor).await {
                    debug!(error = %del, "orphaned prompt not deleted");
                }
                bot.send(&origin, Prompt::text(BotError::from(e).user_message())).await?;
                return Ok(());
            }
            info!(subject = subject.0, kind = kind.as_str(), step, "wizard started");
        }
    }
    Ok(())
}

/// `true`, если событие продолжило чей-то диалог (даже если шаг не удался).
pub async fn route<M: Messenger>(app: &App, bot: &M, inbound: &Inbound) -> bool {
    for kind in WizardKind::ALL {
        let policy = reply_policy(kind);
        let Some(conv) =
            correlate(&app.conversations, kind, policy, |s| consumes(kind, s), inbound).await
        else {
            continue;
        };
        debug!(subject = conv.subject.0, kind = kind.as_str(), step = conv.step, "input correlated");
        if let Err(e) = handle(app, bot, &conv, inbound).await {
            fail(bot, &conv.origin, &e).await;
        }
        return true;
    }
    false
}

async fn handle<M: Messenger>(app: &App, bot: &M, conv: &Conversation, inbound: &Inbound) -> Result<(), BotError> {
    match inbound.choice() {
        Some(CANCEL) => {
            app.conversations.end(conv.kind, conv.subject).await;
            info!(subject = conv.subject.0, kind = conv.kind.as_str(), "wizard cancelled");
            close(bot, conv, inbound, "Отменено.".to_string()).await
        }
        Some(BACK) => match back(app, conv).await? {
            Some(t) => apply(app, bot, conv, inbound, t).await,
            None => Ok(()),
        },
        _ => {
            let t = step(app, conv, inbound).await?;
            apply(app, bot, conv, inbound, t).await
        }
    }
}

async fn apply<M: Messenger>(
    app: &App,
    bot: &M,
    conv: &Conversation,
    inbound: &Inbound,
    t: Transition,
) -> Result<(), BotError> {
    let store = &app.conversations;
    match t {
        Transition::Advance { step, patch, prompt } => {
            let anchor = bot.send(&conv.origin, prompt).await?;
            store.advance(conv.kind, conv.subject, step, patch, Some(anchor)).await?;
            debug!(subject = conv.subject.0, kind = conv.kind.as_str(), step, "wizard advanced");
        }
        Transition::Retry(prompt) => {
            let anchor = bot.send(&conv.origin, prompt).await?;
            store.advance(conv.kind, conv.subject, conv.step, Payload::new(), Some(anchor)).await?;
        }
        Transition::Back { step, clear, prompt } => {
            let anchor = bot.send(&conv.origin, prompt).await?;
            store.rewind(conv.kind, conv.subject, step, clear, Some(anchor)).await?;
        }
        Transition::Done(text) => {
            store.end(conv.kind, conv.subject).await;
            let took = conv.created_at.elapsed().as_secs();
            info!(subject = conv.subject.0, kind = conv.kind.as_str(), took, "wizard finished");
            close(bot, conv, inbound, text).await?;
        }
        Transition::Denied(text) => {
            store.end(conv.kind, conv.subject).await;
            warn!(subject = conv.subject.0, kind = conv.kind.as_str(), "wizard denied mid-flow");
            close(bot, conv, inbound, text).await?;
        }
    }
    Ok(())
}

/// Итог диалога: если нажали кнопку под вопросом, переписываем сам вопрос.
async fn close<M: Messenger>(bot: &M, conv: &Conversation, inbound: &Inbound, text: String) -> Result<(), BotError> {
    let pressed_on_anchor =
        matches!(inbound.content, Content::Choice(_)) && inbound.reply_to.is_some() && inbound.reply_to == conv.anchor;
    if let (true, Some(anchor)) = (pressed_on_anchor, conv.anchor) {
        match bot.edit(&conv.origin, anchor, text.clone()).await {
            Ok(_) => return Ok(()),
            Err(GatewayError::Stale) => return Err(GatewayError::Stale.into()),
            Err(e) => debug!(error = %e, "edit failed, sending instead"),
        }
    }
    bot.send(&conv.origin, Prompt::text(text)).await?;
    Ok(())
}

/// `/cancel`: закрыть всё и обязательно ответить.
pub async fn cancel<M: Messenger>(app: &App, bot: &M, subject: UserId, origin: Origin) -> Result<(), BotError> {
    let closed = app.conversations.end_all(subject).await;
    for conv in &closed {
        info!(subject = subject.0, kind = conv.kind.as_str(), "wizard cancelled");
        if let Some(anchor) = conv.anchor {
            if let Err(e) = bot.delete(&conv.origin, anchor).await {
                debug!(error = %e, "could not delete abandoned prompt");
            }
        }
    }
    let ack = if closed.is_empty() { "Нечего отменять." } else { "Отменено." };
    bot.send(&origin, Prompt::text(ack)).await?;
    Ok(())
}

/// Сбой шлюза: состояние не трогаем, пользователю — общий текст.
pub async fn fail<M: Messenger>(bot: &M, origin: &Origin, e: &BotError) {
    if e.is_stale() {
        debug!("stale interaction, dropping event");
        return;
    }
    error!(error = %e, chat = origin.chat.0, "handler failed");
    if let Err(e) = bot.send(origin, Prompt::text(e.user_message())).await {
        warn!(error = %e, "could not deliver failure notice");
    }
}

/* ====== Общие детали для мастеров ====== */

pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

fn nav_row(with_back: bool) -> Vec<InlineKeyboardButton> {
    let mut row = Vec::new();
    if with_back {
        row.push(InlineKeyboardButton::callback("⬅ Назад", format!("wz:{BACK}")));
    }
    row.push(InlineKeyboardButton::callback("✖ Отмена", format!("wz:{CANCEL}")));
    row
}

pub fn nav(with_back: bool) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![nav_row(with_back)])
}

/// Варианты по одному в строке, внизу навигация.
pub fn choices(options: Vec<(String, String)>, with_back: bool) -> InlineKeyboardMarkup {
    let mut rows: Vec<Vec<InlineKeyboardButton>> = options
        .into_iter()
        .map(|(label, value)| vec![InlineKeyboardButton::callback(label, format!("wz:{value}"))])
        .collect();
    rows.push(nav_row(with_back));
    InlineKeyboardMarkup::new(rows)
}

pub fn with_error(error: &str, prompt: Prompt) -> Prompt {
    Prompt { text: format!("⚠️ {}\n\n{}", error, prompt.text), ..prompt }
}

pub fn film_value(f: &Film) -> Result<Value, BotError> {
    serde_json::to_value(StoredMovie::from(f)).map_err(|e| StorageError::from(e).into())
}

pub fn stored_film(conv: &Conversation) -> Option<StoredMovie> {
    conv.payload.get("film").cloned().and_then(|v| serde_json::from_value(v).ok())
}

/// Ссылка или id из текста → фильм. `Err(текст)` — что сказать пользователю.
pub async fn resolve_film(app: &App, input: &Inbound) -> Result<Result<Film, &'static str>, BotError> {
    let Some(id) = input.text().and_then(crate::kinopoisk::parse_film_ref) else {
        return Ok(Err("Не похоже на ссылку Кинопоиска."));
    };
    Ok(app.catalog.film(id).await?.ok_or("Такого фильма на Кинопоиске нет."))
}


#[cfg(test)]
mod tests {
    use super::testkit::*;
    use super::*;
    use crate::conversation::StorePolicy;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use teloxide::types::MessageId;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LINK: &str = "https://www.kinopoisk.ru/film/301/";

    #[tokio::test]
    async fn plan_home_viewing_follows_the_anchor() {
        let server = MockServer::start().await;
        mock_film(&server, 301, "Матрица").await;
        let (_dir, app) = app(&server).await;
        let bot = FakeMessenger::starting_at(501);

        begin(&app, &bot, WizardKind::PlanViewing, ALICE, here(), "home").await.unwrap();
        let conv = app.conversations.get(WizardKind::PlanViewing, ALICE).await.unwrap();
        assert_eq!(conv.step, plan::step::LINK);
        assert_eq!(conv.anchor, Some(MessageId(501)));

        assert!(route(&app, &bot, &reply(501, LINK)).await);
        let conv = app.conversations.get(WizardKind::PlanViewing, ALICE).await.unwrap();
        assert_eq!(conv.step, plan::step::DATE);
        assert_eq!(conv.anchor, Some(MessageId(502)));
        assert_eq!(stored_film(&conv).unwrap().id, 301);

        // ответ на старый вопрос больше ничего не значит
        assert!(!route(&app, &bot, &reply(501, "31.12.2099")).await);
        assert_eq!(app.conversations.get(WizardKind::PlanViewing, ALICE).await.unwrap().step, plan::step::DATE);

        assert!(route(&app, &bot, &reply(502, "31.12.2099")).await);
        assert!(app.conversations.get(WizardKind::PlanViewing, ALICE).await.is_none());

        let plans = app.storage.upcoming_plans(CHAT.0, today()).await;
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].film.title, "Матрица");

        assert!(!route(&app, &bot, &reply(502, "01.01.2100")).await);
        assert_eq!(app.storage.upcoming_plans(CHAT.0, today()).await.len(), 1);
    }

    #[tokio::test]
    async fn invalid_input_reprompts_without_touching_payload() {
        let server = MockServer::start().await;
        mock_film(&server, 301, "Матрица").await;
        let (_dir, app) = app(&server).await;
        let bot = FakeMessenger::starting_at(501);

        begin(&app, &bot, WizardKind::PlanViewing, ALICE, here(), "home").await.unwrap();
        route(&app, &bot, &reply(501, LINK)).await;
        let before = app.conversations.get(WizardKind::PlanViewing, ALICE).await.unwrap();

        assert!(route(&app, &bot, &reply(502, "завтра")).await);
        let after = app.conversations.get(WizardKind::PlanViewing, ALICE).await.unwrap();
        assert_eq!(after.step, before.step);
        assert_eq!(after.payload, before.payload);
        assert_eq!(after.anchor, Some(MessageId(503)));
        assert!(bot.last_text().starts_with("⚠️"));

        assert!(route(&app, &bot, &reply(503, "01.01.2001")).await, "past dates are rejected too");
        assert_eq!(app.conversations.get(WizardKind::PlanViewing, ALICE).await.unwrap().anchor, Some(MessageId(504)));
        assert!(app.storage.upcoming_plans(CHAT.0, NaiveDate::MIN).await.is_empty());
    }

    #[tokio::test]
    async fn cancel_works_from_any_point() {
        let server = MockServer::start().await;
        mock_film(&server, 301, "Матрица").await;
        let (_dir, app) = app(&server).await;
        let bot = FakeMessenger::starting_at(501);

        // диалога ещё нет
        cancel(&app, &bot, ALICE, here()).await.unwrap();
        assert_eq!(bot.last_text(), "Нечего отменять.");

        // первый шаг
        begin(&app, &bot, WizardKind::PlanViewing, ALICE, here(), "home").await.unwrap();
        let prompt = app.conversations.get(WizardKind::PlanViewing, ALICE).await.unwrap().anchor.unwrap();
        cancel(&app, &bot, ALICE, here()).await.unwrap();
        assert!(app.conversations.get(WizardKind::PlanViewing, ALICE).await.is_none());
        assert_eq!(bot.last_text(), "Отменено.");
        assert_eq!(bot.deleted.lock().unwrap().as_slice(), &[prompt]);

        // последний шаг, кнопкой под вопросом
        begin(&app, &bot, WizardKind::PlanViewing, ALICE, here(), "cinema").await.unwrap();
        let first = app.conversations.get(WizardKind::PlanViewing, ALICE).await.unwrap().anchor.unwrap();
        route(&app, &bot, &reply(first.0, LINK)).await;
        let date_q = app.conversations.get(WizardKind::PlanViewing, ALICE).await.unwrap().anchor.unwrap();
        route(&app, &bot, &reply(date_q.0, "31.12.2099 19:30")).await;
        let last = app.conversations.get(WizardKind::PlanViewing, ALICE).await.unwrap();
        assert_eq!(last.step, plan::step::CINEMA);

        assert!(route(&app, &bot, &press(last.anchor.unwrap().0, CANCEL)).await);
        assert!(app.conversations.get(WizardKind::PlanViewing, ALICE).await.is_none());
        assert_eq!(bot.last_edit().as_deref(), Some("Отменено."));
        assert!(app.storage.upcoming_plans(CHAT.0, NaiveDate::MIN).await.is_empty());
    }

    #[tokio::test]
    async fn gateway_failures_leave_the_step_in_place() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2.2/films/301"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let (_dir, app) = app(&server).await;
        let bot = FakeMessenger::starting_at(501);

        begin(&app, &bot, WizardKind::PlanViewing, ALICE, here(), "home").await.unwrap();

        // каталог упал
        assert!(route(&app, &bot, &reply(501, LINK)).await);
        let conv = app.conversations.get(WizardKind::PlanViewing, ALICE).await.unwrap();
        assert_eq!(conv.step, plan::step::LINK);
        assert_eq!(conv.anchor, Some(MessageId(501)));
        assert!(bot.last_text().contains("Кинопоиск"));

        // Telegram не принял следующий вопрос
        bot.fail_sends.store(true, Ordering::SeqCst);
        route(&app, &bot, &reply(501, "не ссылка")).await;
        let conv = app.conversations.get(WizardKind::PlanViewing, ALICE).await.unwrap();
        assert_eq!(conv.step, plan::step::LINK);
        assert_eq!(conv.anchor, Some(MessageId(501)));
    }

    #[tokio::test]
    async fn back_button_rewinds_and_clears() {
        let server = MockServer::start().await;
        mock_film(&server, 301, "Матрица").await;
        let (_dir, app) = app(&server).await;
        let bot = FakeMessenger::starting_at(501);

        begin(&app, &bot, WizardKind::PlanViewing, ALICE, here(), "home").await.unwrap();
        route(&app, &bot, &reply(501, LINK)).await;
        assert!(route(&app, &bot, &press(502, BACK)).await);

        let conv = app.conversations.get(WizardKind::PlanViewing, ALICE).await.unwrap();
        assert_eq!(conv.step, plan::step::LINK);
        assert_eq!(conv.anchor, Some(MessageId(503)));
        assert!(stored_film(&conv).is_none());
        assert_eq!(conv.str("place"), Some("home"));
    }

    #[tokio::test]
    async fn non_admin_cannot_open_add_admin() {
        let server = MockServer::start().await;
        let (_dir, app) = app(&server).await;
        let bot = FakeMessenger::starting_at(1);

        begin(&app, &bot, WizardKind::AddAdmin, ALICE, here(), "").await.unwrap();
        assert!(app.conversations.get(WizardKind::AddAdmin, ALICE).await.is_none());
        assert!(bot.last_text().contains("администратор"));
    }

    #[tokio::test]
    async fn admin_adds_admin_after_retrying_bad_id() {
        let server = MockServer::start().await;
        let (_dir, app) = app(&server).await;
        app.storage.seed_admins(&[ALICE.0]).await.unwrap();
        let bot = FakeMessenger::starting_at(10);

        begin(&app, &bot, WizardKind::AddAdmin, ALICE, here(), "").await.unwrap();
        route(&app, &bot, &reply(10, "Вася")).await;
        let conv = app.conversations.get(WizardKind::AddAdmin, ALICE).await.unwrap();
        assert_eq!(conv.step, admin::step::USER);

        route(&app, &bot, &reply(11, "777")).await;
        route(&app, &bot, &press(12, "yes")).await;
        assert!(app.storage.is_admin(777).await);
        assert!(app.conversations.get(WizardKind::AddAdmin, ALICE).await.is_none());
        assert!(bot.last_edit().unwrap().contains("777"));
    }

    #[tokio::test]
    async fn enabling_notifications_without_subscription_ends_dialogue() {
        let server = MockServer::start().await;
        let (_dir, app) = app(&server).await;
        let bot = FakeMessenger::starting_at(1);

        begin(&app, &bot, WizardKind::EditSettings, ALICE, here(), "").await.unwrap();
        route(&app, &bot, &press(1, "notifications")).await;
        assert!(route(&app, &bot, &press(2, "on")).await);

        assert!(app.conversations.get(WizardKind::EditSettings, ALICE).await.is_none());
        assert!(!app.storage.settings(ALICE.0).await.notifications);
        assert!(bot.last_edit().unwrap().contains("подписк"));
    }

    #[tokio::test]
    async fn import_takes_plain_messages() {
        let server = MockServer::start().await;
        mock_film(&server, 301, "Матрица").await;
        mock_film(&server, 435, "Зелёная миля").await;
        Mock::given(method("GET"))
            .and(path("/api/v2.2/films/9"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let (_dir, app) = app(&server).await;
        let bot = FakeMessenger::starting_at(1);

        begin(&app, &bot, WizardKind::ImportCatalog, ALICE, here(), "").await.unwrap();
        assert!(route(&app, &bot, &plain(&format!("{LINK}\n435\n9"))).await);

        assert!(app.conversations.get(WizardKind::ImportCatalog, ALICE).await.is_none());
        let list = app.storage.get(CHAT.0).await;
        assert_eq!(list.iter().map(|m| m.id).collect::<Vec<_>>(), vec![301, 435]);
    }

    #[tokio::test]
    async fn reject_policy_keeps_the_open_dialogue() {
        let server = MockServer::start().await;
        let policy = StorePolicy {
            on_conflict: ConflictPolicy::Reject,
            exclusivity: Exclusivity::Exclusive,
            idle_timeout: Duration::from_secs(60),
        };
        let (_dir, app) = app_with(&server, policy).await;
        let bot = FakeMessenger::starting_at(1);

        begin(&app, &bot, WizardKind::AddTagCollection, ALICE, here(), "").await.unwrap();
        begin(&app, &bot, WizardKind::ImportCatalog, ALICE, here(), "").await.unwrap();

        assert!(app.conversations.get(WizardKind::AddTagCollection, ALICE).await.is_some());
        assert!(app.conversations.get(WizardKind::ImportCatalog, ALICE).await.is_none());
        assert!(bot.last_text().contains("/cancel"));
    }

    #[tokio::test]
    async fn rejected_late_start_removes_its_prompt() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2.2/films/301"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "kinopoiskId": 301, "nameRu": "Матрица", "year": 1999 }))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;
        let policy = StorePolicy {
            on_conflict: ConflictPolicy::Reject,
            exclusivity: Exclusivity::Exclusive,
            idle_timeout: Duration::from_secs(60),
        };
        let (_dir, app) = app_with(&server, policy).await;
        let bot = FakeMessenger::starting_at(1);

        let slow = begin(&app, &bot, WizardKind::MarkWatched, ALICE, here(), "301");
        let fast = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            begin(&app, &bot, WizardKind::AddTagCollection, ALICE, here(), "").await
        };
        let (slow, fast) = tokio::join!(slow, fast);
        slow.unwrap();
        fast.unwrap();

        let tag = app.conversations.get(WizardKind::AddTagCollection, ALICE).await.unwrap();
        assert_eq!(tag.anchor, Some(MessageId(1)));
        assert!(app.conversations.get(WizardKind::MarkWatched, ALICE).await.is_none());
        assert_eq!(*bot.deleted.lock().unwrap(), vec![MessageId(2)]);
        assert!(bot.last_text().contains("/cancel"));
    }

    #[tokio::test]
    async fn tag_collection_gets_a_deep_link() {
        let server = MockServer::start().await;
        mock_film(&server, 301, "Матрица").await;
        let (_dir, app) = app(&server).await;
        let bot = FakeMessenger::starting_at(1);

        begin(&app, &bot, WizardKind::AddTagCollection, ALICE, here(), "").await.unwrap();
        route(&app, &bot, &reply(1, "Киберпанк")).await;
        route(&app, &bot, &reply(2, LINK)).await;

        let tags = app.storage.tags_of(ALICE.0).await;
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].movies.len(), 1);
        assert!(bot.last_text().contains(&format!("https://t.me/kino_bot?start=tag_{}", tags[0].code)));
    }

    #[tokio::test]
    async fn watched_film_gets_rated_by_button() {
        let server = MockServer::start().await;
        mock_film(&server, 301, "Матрица").await;
        let (_dir, app) = app(&server).await;
        let bot = FakeMessenger::starting_at(1);

        begin(&app, &bot, WizardKind::MarkWatched, ALICE, here(), "301").await.unwrap();
        let conv = app.conversations.get(WizardKind::MarkWatched, ALICE).await.unwrap();
        assert_eq!(conv.step, watched::step::RATING);

        route(&app, &bot, &press(1, "11")).await;
        assert_eq!(app.conversations.get(WizardKind::MarkWatched, ALICE).await.unwrap().step, watched::step::RATING);

        route(&app, &bot, &press(2, "8")).await;
        let ratings = app.storage.ratings(ALICE.0).await;
        assert_eq!(ratings.len(), 1);
        assert_eq!(ratings[0].score, 8);
    }
}
