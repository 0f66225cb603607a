//! «Посмотрели»: фильм → оценка 1..10. Фильм уходит из списка чата.

use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

use super::{film_value, nav, resolve_film, stored_film, with_error, Opening, Transition, BACK, CANCEL};
use crate::app::App;
use crate::conversation::{patch, Conversation, Step};
use crate::correlator::{Inbound, ReplyPolicy};
use crate::error::BotError;
use crate::gateway::Prompt;
use crate::text::{html_escape, stored_title};

pub const POLICY: ReplyPolicy = ReplyPolicy::FreeForm;

pub mod step {
    use crate::conversation::Step;
    pub const LINK: Step = 1;
    pub const RATING: Step = 2;
}

pub const STEPS: &[Step] = &[step::LINK, step::RATING];

fn link_prompt() -> Prompt {
    Prompt::buttons("👀 Что посмотрели? Пришли ссылку на Кинопоиск.", nav(false))
}

fn rating_prompt(title: &str) -> Prompt {
    let scores = |range: std::ops::RangeInclusive<u8>| {
        range.map(|n| InlineKeyboardButton::callback(n.to_string(), format!("wz:{n}"))).collect::<Vec<_>>()
    };
    let kb = InlineKeyboardMarkup::new(vec![
        scores(1..=5),
        scores(6..=10),
        vec![
            InlineKeyboardButton::callback("⬅ Назад", format!("wz:{BACK}")),
            InlineKeyboardButton::callback("✖ Отмена", format!("wz:{CANCEL}")),
        ],
    ]);
    Prompt::buttons(format!("Оценка для <b>{}</b> от 1 до 10?", html_escape(title)), kb)
}

/// `arg` — id фильма с кнопки под карточкой, иначе пусто.
pub async fn open(app: &App, arg: &str) -> Result<Opening, BotError> {
    let Ok(id) = arg.trim().parse::<u64>() else {
        return Ok(Opening::Prompt { step: step::LINK, payload: Default::default(), prompt: link_prompt() });
    };
    match app.catalog.film(id).await? {
        Some(film) => Ok(Opening::Prompt {
            step: step::RATING,
            payload: patch([("film", film_value(&film)?)]),
            prompt: rating_prompt(&crate::text::one_line_title(&film.title, film.year)),
        }),
        None => Ok(Opening::Denied("Такого фильма на Кинопоиске нет.".into())),
    }
}

pub async fn step(app: &App, conv: &Conversation, input: &Inbound) -> Result<Transition, BotError> {
    match conv.step {
        step::LINK => match resolve_film(app, input).await? {
            Err(why) => Ok(Transition::Retry(with_error(why, link_prompt()))),
            Ok(film) => Ok(Transition::Advance {
                step: step::RATING,
                patch: patch([("film", film_value(&film)?)]),
                prompt: rating_prompt(&crate::text::one_line_title(&film.title, film.year)),
            }),
        },
        step::RATING => {
            let Some(film) = stored_film(conv) else {
                return Ok(Transition::Denied("Диалог сбился, начни заново: /watched".into()));
            };
            let title = stored_title(&film);
            let raw = input.choice().or_else(|| input.text()).unwrap_or_default();
            let Some(score) = parse_score(raw) else {
                return Ok(Transition::Retry(with_error("Оценка — число от 1 до 10.", rating_prompt(&title))));
            };
            app.storage.rate(conv.origin.chat.0, conv.subject.0, film, score).await?;
            Ok(Transition::Done(format!("⭐ {} — {}/10", html_escape(&title), score)))
        }
        _ => Ok(Transition::Retry(link_prompt())),
    }
}

pub fn back(conv: &Conversation) -> Option<Transition> {
    (conv.step == step::RATING).then(|| Transition::Back { step: step::LINK, clear: &["film"], prompt: link_prompt() })
}

fn parse_score(s: &str) -> Option<u8> {
    s.trim().parse::<u8>().ok().filter(|n| (1..=10).contains(n))
}
