//! Билет к походу в кино. Только по подписке.

use serde_json::json;
use teloxide::types::UserId;

use super::{choices, nav, today, with_error, Opening, Transition};
use crate::app::App;
use crate::conversation::{patch, Conversation, Origin, Payload, Step};
use crate::correlator::{Content, Inbound, ReplyPolicy};
use crate::error::BotError;
use crate::gateway::Prompt;
use crate::storage::{Place, Plan};
use crate::text::stored_title;

pub const POLICY: ReplyPolicy = ReplyPolicy::ReplyRequired;

pub mod step {
    use crate::conversation::Step;
    pub const PLAN: Step = 1;
    pub const MEDIA: Step = 2;
}

pub const STEPS: &[Step] = &[step::PLAN, step::MEDIA];

async fn cinema_plans(app: &App, subject: UserId, origin: &Origin) -> Vec<Plan> {
    app.storage
        .upcoming_plans(origin.chat.0, today())
        .await
        .into_iter()
        .filter(|p| p.place == Place::Cinema && p.owner == subject.0)
        .collect()
}

fn plans_prompt(plans: &[Plan]) -> Prompt {
    let options = plans
        .iter()
        .map(|p| {
            let when = match p.time {
                Some(t) => format!("{} {}", p.date.format("%d.%m"), t.format("%H:%M")),
                None => p.date.format("%d.%m").to_string(),
            };
            (format!("🎟 {} — {}", stored_title(&p.film), when), p.id.to_string())
        })
        .collect();
    Prompt::buttons("К какому походу в кино билет?", choices(options, false))
}

fn media_prompt() -> Prompt {
    Prompt::buttons("Пришли фото или файл билета ответом на это сообщение.", nav(true))
}

pub async fn open(app: &App, subject: UserId, origin: &Origin) -> Result<Opening, BotError> {
    if app.storage.subscription(subject.0).await.is_none() {
        return Ok(Opening::Denied("Билеты хранятся только с подпиской. Оформить: /pay".into()));
    }
    let plans = cinema_plans(app, subject, origin).await;
    if plans.is_empty() {
        return Ok(Opening::Denied("Нет запланированных походов в кино. Запланируй: /cinema".into()));
    }
    Ok(Opening::Prompt { step: step::PLAN, payload: Payload::new(), prompt: plans_prompt(&plans) })
}

pub async fn step(app: &App, conv: &Conversation, input: &Inbound) -> Result<Transition, BotError> {
    match conv.step {
        step::PLAN => {
            let plans = cinema_plans(app, conv.subject, &conv.origin).await;
            let picked = input
                .choice()
                .and_then(|c| c.parse::<u64>().ok())
                .filter(|id| plans.iter().any(|p| p.id == *id));
            match picked {
                Some(id) => Ok(Transition::Advance {
                    step: step::MEDIA,
                    patch: patch([("plan_id", json!(id))]),
                    prompt: media_prompt(),
                }),
                None if plans.is_empty() => Ok(Transition::Denied("Походов в кино больше нет.".into())),
                None => Ok(Transition::Retry(with_error("Выбери поход кнопкой.", plans_prompt(&plans)))),
            }
        }
        step::MEDIA => {
            let file_id = match &input.content {
                Content::Photo(id) | Content::Document(id) => id.clone(),
                _ => return Ok(Transition::Retry(with_error("Нужна фотография или файл.", media_prompt()))),
            };
            let Some(plan_id) = conv.u64("plan_id") else {
                return Ok(Transition::Denied("Диалог сбился, начни заново: /ticket".into()));
            };
            if app.storage.attach_ticket(plan_id, conv.subject.0, file_id).await? {
                Ok(Transition::Done("🎟 Билет сохранён.".into()))
            } else {
                Ok(Transition::Denied("Этот поход в кино уже удалён.".into()))
            }
        }
        _ => Ok(Transition::Retry(media_prompt())),
    }
}

pub async fn back(app: &App, conv: &Conversation) -> Option<Transition> {
    if conv.step != step::MEDIA {
        return None;
    }
    let plans = cinema_plans(app, conv.subject, &conv.origin).await;
    Some(Transition::Back { step: step::PLAN, clear: &["plan_id"], prompt: plans_prompt(&plans) })
}
