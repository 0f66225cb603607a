use teloxide::types::UserId;

use super::{choices, Opening, Transition};
use crate::app::App;
use crate::conversation::{Conversation, Payload, Step};
use crate::correlator::{Inbound, ReplyPolicy};
use crate::error::BotError;
use crate::gateway::Prompt;

pub const POLICY: ReplyPolicy = ReplyPolicy::ReplyRequired;

pub mod step {
    use crate::conversation::Step;
    pub const CONFIRM: Step = 1;
}

pub const STEPS: &[Step] = &[step::CONFIRM];

fn confirm_prompt(tier: &str) -> Prompt {
    let options = vec![("Да, отключить".to_string(), "yes".to_string()), ("Оставить".to_string(), "no".to_string())];
    Prompt::buttons(format!("Отключить подписку «{tier}»?"), choices(options, false))
}

pub async fn open(app: &App, subject: UserId) -> Opening {
    match app.storage.subscription(subject.0).await {
        Some(sub) => Opening::Prompt {
            step: step::CONFIRM,
            payload: Payload::new(),
            prompt: confirm_prompt(sub.tier.title()),
        },
        None => Opening::Denied("У тебя нет активной подписки.".into()),
    }
}

pub async fn step(app: &App, conv: &Conversation, input: &Inbound) -> Result<Transition, BotError> {
    match input.choice() {
        Some("yes") => {
            if app.storage.deactivate_subscription(conv.subject.0).await? {
                tracing::info!(subject = conv.subject.0, "subscription deactivated");
                Ok(Transition::Done("Подписка отключена.".into()))
            } else {
                Ok(Transition::Denied("Подписка уже не активна.".into()))
            }
        }
        Some("no") => Ok(Transition::Done("Подписка остаётся.".into())),
        _ => {
            let tier = app.storage.subscription(conv.subject.0).await.map(|s| s.tier.title()).unwrap_or("?");
            Ok(Transition::Retry(confirm_prompt(tier)))
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::conversation::WizardKind;
    use crate::storage::Tier;
    use crate::wizards::testkit::*;
    use crate::wizards::{begin, route};
    use wiremock::MockServer;

    #[tokio::test]
    async fn confirmed_unsubscribe_deactivates() {
        let server = MockServer::start().await;
        let (_dir, app) = app(&server).await;
        let p = app.storage.record_payment(ALICE.0, Tier::Basic, 199, "r".into()).await.unwrap();
        app.storage.approve_payment(p.id).await.unwrap();
        let bot = FakeMessenger::starting_at(1);

        begin(&app, &bot, WizardKind::Unsubscribe, ALICE, here(), "").await.unwrap();
        assert!(route(&app, &bot, &press(1, "yes")).await);

        assert!(app.storage.subscription(ALICE.0).await.is_none());
        assert_eq!(bot.last_edit().as_deref(), Some("Подписка отключена."));
    }

    #[tokio::test]
    async fn nothing_to_unsubscribe_from() {
        let server = MockServer::start().await;
        let (_dir, app) = app(&server).await;
        let bot = FakeMessenger::starting_at(1);

        begin(&app, &bot, WizardKind::Unsubscribe, ALICE, here(), "").await.unwrap();
        assert!(app.conversations.get(WizardKind::Unsubscribe, ALICE).await.is_none());
        assert!(bot.last_text().contains("нет активной"));
    }
}
