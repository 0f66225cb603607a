use serde_json::json;
use teloxide::types::UserId;

use super::{choices, with_error, Opening, Transition};
use crate::app::App;
use crate::conversation::{patch, Conversation, Payload, Step};
use crate::correlator::{Inbound, ReplyPolicy};
use crate::error::BotError;
use crate::gateway::Prompt;
use crate::storage::Settings;

pub const POLICY: ReplyPolicy = ReplyPolicy::ReplyRequired;

pub mod step {
    use crate::conversation::Step;
    pub const FIELD: Step = 1;
    pub const VALUE: Step = 2;
}

pub const STEPS: &[Step] = &[step::FIELD, step::VALUE];

const NOTIFICATIONS: &str = "notifications";
const PUBLIC_RATINGS: &str = "public_ratings";

fn on_off(v: bool) -> &'static str {
    if v { "вкл" } else { "выкл" }
}

fn field_title(field: &str) -> &'static str {
    match field {
        NOTIFICATIONS => "Напоминания о походах",
        _ => "Оценки видны в чате",
    }
}

fn field_prompt(s: &Settings) -> Prompt {
    let options = vec![
        (format!("🔔 {}: {}", field_title(NOTIFICATIONS), on_off(s.notifications)), NOTIFICATIONS.to_string()),
        (format!("⭐ {}: {}", field_title(PUBLIC_RATINGS), on_off(s.public_ratings)), PUBLIC_RATINGS.to_string()),
    ];
    Prompt::buttons("⚙️ Что меняем?", choices(options, false))
}

fn value_prompt(field: &str) -> Prompt {
    let options = vec![("Включить".to_string(), "on".to_string()), ("Выключить".to_string(), "off".to_string())];
    Prompt::buttons(format!("{}:", field_title(field)), choices(options, true))
}

pub async fn open(app: &App, subject: UserId) -> Opening {
    let current = app.storage.settings(subject.0).await;
    Opening::Prompt { step: step::FIELD, payload: Payload::new(), prompt: field_prompt(&current) }
}

pub async fn step(app: &App, conv: &Conversation, input: &Inbound) -> Result<Transition, BotError> {
    match conv.step {
        step::FIELD => match input.choice() {
            Some(f @ (NOTIFICATIONS | PUBLIC_RATINGS)) => Ok(Transition::Advance {
                step: step::VALUE,
                patch: patch([("field", json!(f))]),
                prompt: value_prompt(f),
            }),
            _ => {
                let current = app.storage.settings(conv.subject.0).await;
                Ok(Transition::Retry(with_error("Выбери пункт кнопкой.", field_prompt(&current))))
            }
        },
        step::VALUE => {
            let field = conv.str("field").unwrap_or(PUBLIC_RATINGS);
            let value = match input.choice() {
                Some("on") => true,
                Some("off") => false,
                _ => return Ok(Transition::Retry(value_prompt(field))),
            };
            if field == NOTIFICATIONS && value && app.storage.subscription(conv.subject.0).await.is_none() {
                return Ok(Transition::Denied("Напоминания доступны только по подписке: /pay".into()));
            }
            let saved = app
                .storage
                .update_settings(conv.subject.0, |s| match field {
                    NOTIFICATIONS => s.notifications = value,
                    _ => s.public_ratings = value,
                })
                .await?;
            let now = if field == NOTIFICATIONS { saved.notifications } else { saved.public_ratings };
            Ok(Transition::Done(format!("Готово. {}: {}", field_title(field), on_off(now))))
        }
        _ => Ok(Transition::Retry(value_prompt(PUBLIC_RATINGS))),
    }
}

pub async fn back(app: &App, conv: &Conversation) -> Option<Transition> {
    if conv.step != step::VALUE {
        return None;
    }
    let current = app.storage.settings(conv.subject.0).await;
    Some(Transition::Back { step: step::FIELD, clear: &["field"], prompt: field_prompt(&current) })
}

#[cfg(test)]
mod tests {
    use crate::conversation::WizardKind;
    use crate::wizards::testkit::*;
    use crate::wizards::{begin, route, BACK};
    use wiremock::MockServer;

    #[tokio::test]
    async fn public_ratings_toggle_and_back() {
        let server = MockServer::start().await;
        let (_dir, app) = app(&server).await;
        let bot = FakeMessenger::starting_at(1);

        begin(&app, &bot, WizardKind::EditSettings, ALICE, here(), "").await.unwrap();
        route(&app, &bot, &press(1, "notifications")).await;
        route(&app, &bot, &press(2, BACK)).await;
        let conv = app.conversations.get(WizardKind::EditSettings, ALICE).await.unwrap();
        assert_eq!(conv.step, super::step::FIELD);
        assert!(conv.str("field").is_none());

        route(&app, &bot, &press(3, "public_ratings")).await;
        route(&app, &bot, &press(4, "off")).await;
        assert!(!app.storage.settings(ALICE.0).await.public_ratings);
        assert!(app.conversations.get(WizardKind::EditSettings, ALICE).await.is_none());
    }
}
