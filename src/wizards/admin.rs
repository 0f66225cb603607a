use serde_json::json;
use teloxide::types::UserId;

use super::{choices, with_error, Opening, Transition};
use crate::app::App;
use crate::conversation::{patch, Conversation, Payload, Step};
use crate::correlator::{Inbound, ReplyPolicy};
use crate::error::BotError;
use crate::gateway::Prompt;

pub const POLICY: ReplyPolicy = ReplyPolicy::ReplyRequired;

pub mod step {
    use crate::conversation::Step;
    pub const USER: Step = 1;
    pub const CONFIRM: Step = 2;
}

pub const STEPS: &[Step] = &[step::USER, step::CONFIRM];

const NOT_ADMIN: &str = "Это может только администратор.";

fn user_prompt() -> Prompt {
    Prompt::force_reply("👤 Пришли числовой id пользователя ответом на это сообщение.")
}

fn confirm_prompt(id: u64) -> Prompt {
    let options = vec![("✅ Да".to_string(), "yes".to_string()), ("Нет".to_string(), "no".to_string())];
    Prompt::buttons(format!("Сделать <code>{id}</code> администратором?"), choices(options, true))
}

pub async fn open(app: &App, subject: UserId) -> Opening {
    if !app.storage.is_admin(subject.0).await {
        return Opening::Denied(NOT_ADMIN.into());
    }
    Opening::Prompt { step: step::USER, payload: Payload::new(), prompt: user_prompt() }
}

pub async fn step(app: &App, conv: &Conversation, input: &Inbound) -> Result<Transition, BotError> {
    match conv.step {
        step::USER => {
            let id = input.text().and_then(|t| t.parse::<u64>().ok()).filter(|id| *id > 0);
            let Some(id) = id else {
                return Ok(Transition::Retry(with_error("Нужен положительный числовой id.", user_prompt())));
            };
            if app.storage.is_admin(id).await {
                return Ok(Transition::Retry(with_error("Он уже администратор.", user_prompt())));
            }
            Ok(Transition::Advance { step: step::CONFIRM, patch: patch([("user", json!(id))]), prompt: confirm_prompt(id) })
        }
        step::CONFIRM => {
            let Some(id) = conv.u64("user") else {
                return Ok(Transition::Denied("Диалог сбился, начни заново: /addadmin".into()));
            };
            match input.choice() {
                Some("yes") => {
                    // права могли отозвать, пока шёл диалог
                    if !app.storage.is_admin(conv.subject.0).await {
                        return Ok(Transition::Denied(NOT_ADMIN.into()));
                    }
                    app.storage.add_admin(id).await?;
                    tracing::info!(by = conv.subject.0, added = id, "admin added");
                    Ok(Transition::Done(format!("✅ <code>{id}</code> теперь администратор.")))
                }
                Some("no") => Ok(Transition::Done("Ок, ничего не меняю.".into())),
                _ => Ok(Transition::Retry(confirm_prompt(id))),
            }
        }
        _ => Ok(Transition::Retry(user_prompt())),
    }
}

pub fn back(conv: &Conversation) -> Option<Transition> {
    (conv.step == step::CONFIRM).then(|| Transition::Back { step: step::USER, clear: &["user"], prompt: user_prompt() })
}
