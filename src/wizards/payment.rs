//! Оплата подписки: тариф → сумма → чек. Подтверждает администратор через /approve.

use serde_json::json;

use super::{choices, nav, with_error, Opening, Transition};
use crate::app::App;
use crate::conversation::{patch, Conversation, Payload, Step};
use crate::correlator::{Content, Inbound, ReplyPolicy};
use crate::error::BotError;
use crate::gateway::Prompt;
use crate::storage::Tier;

pub const POLICY: ReplyPolicy = ReplyPolicy::ReplyRequired;

pub mod step {
    use crate::conversation::Step;
    pub const TIER: Step = 1;
    pub const AMOUNT: Step = 2;
    pub const RECEIPT: Step = 3;
}

pub const STEPS: &[Step] = &[step::TIER, step::AMOUNT, step::RECEIPT];

fn tier_prompt() -> Prompt {
    let options = [Tier::Basic, Tier::Premium]
        .into_iter()
        .map(|t| (format!("{} — {} ₽", t.title(), t.price_rub()), tier_key(t).to_string()))
        .collect();
    Prompt::buttons("💳 Какую подписку оформляем?", choices(options, false))
}

fn tier_key(t: Tier) -> &'static str {
    match t {
        Tier::Basic => "basic",
        Tier::Premium => "premium",
    }
}

fn amount_prompt(t: Tier) -> Prompt {
    Prompt::buttons(
        format!("Тариф «{}». Сколько рублей ты перевёл? Ответь числом на это сообщение.", t.title()),
        nav(true),
    )
}

fn receipt_prompt() -> Prompt {
    Prompt::buttons("Пришли фото или файл чека ответом на это сообщение.", nav(true))
}

fn tier_of(conv: &Conversation) -> Option<Tier> {
    conv.str("tier").and_then(Tier::parse)
}

pub fn open() -> Opening {
    Opening::Prompt { step: step::TIER, payload: Payload::new(), prompt: tier_prompt() }
}

pub async fn step(app: &App, conv: &Conversation, input: &Inbound) -> Result<Transition, BotError> {
    match conv.step {
        step::TIER => match input.choice().and_then(Tier::parse) {
            Some(t) => Ok(Transition::Advance {
                step: step::AMOUNT,
                patch: patch([("tier", json!(tier_key(t)))]),
                prompt: amount_prompt(t),
            }),
            None => Ok(Transition::Retry(with_error("Выбери тариф кнопкой.", tier_prompt()))),
        },
        step::AMOUNT => {
            let Some(tier) = tier_of(conv) else {
                return Ok(Transition::Denied("Диалог сбился, начни заново: /pay".into()));
            };
            match parse_amount(input.text().unwrap_or_default(), tier) {
                Ok(amount) => Ok(Transition::Advance {
                    step: step::RECEIPT,
                    patch: patch([("amount", json!(amount))]),
                    prompt: receipt_prompt(),
                }),
                Err(why) => Ok(Transition::Retry(with_error(&why, amount_prompt(tier)))),
            }
        }
        step::RECEIPT => {
            let receipt = match &input.content {
                Content::Photo(id) | Content::Document(id) => id.clone(),
                _ => return Ok(Transition::Retry(with_error("Нужна фотография или файл чека.", receipt_prompt()))),
            };
            let (Some(tier), Some(amount)) = (tier_of(conv), conv.u64("amount")) else {
                return Ok(Transition::Denied("Диалог сбился, начни заново: /pay".into()));
            };
            let amount = u32::try_from(amount).unwrap_or(u32::MAX);
            let payment = app.storage.record_payment(conv.subject.0, tier, amount, receipt).await?;
            tracing::info!(payment = payment.id, payer = conv.subject.0, "payment recorded");
            Ok(Transition::Done(format!(
                "🧾 Заявка №{} принята. Подписка включится, когда администратор проверит чек.",
                payment.id
            )))
        }
        _ => Ok(Transition::Retry(tier_prompt())),
    }
}

pub fn back(conv: &Conversation) -> Option<Transition> {
    match conv.step {
        step::AMOUNT => Some(Transition::Back { step: step::TIER, clear: &["tier"], prompt: tier_prompt() }),
        step::RECEIPT => {
            let tier = tier_of(conv)?;
            Some(Transition::Back { step: step::AMOUNT, clear: &["amount"], prompt: amount_prompt(tier) })
        }
        _ => None,
    }
}

fn parse_amount(s: &str, tier: Tier) -> Result<u32, String> {
    let digits: String = s.trim().trim_end_matches('₽').trim().replace(' ', "");
    let amount: u32 = digits.parse().map_err(|_| "Нужна сумма целым числом.".to_string())?;
    if amount != tier.price_rub() {
        return Err(format!("Тариф «{}» стоит {} ₽.", tier.title(), tier.price_rub()));
    }
    Ok(amount)
}
