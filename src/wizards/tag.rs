//! Подборка фильмов с короткой ссылкой `?start=tag_<code>`.

use serde_json::json;

use super::{nav, with_error, Opening, Transition};
use crate::app::App;
use crate::conversation::{patch, Conversation, Payload, Step};
use crate::correlator::{Inbound, ReplyPolicy};
use crate::deeplink;
use crate::error::BotError;
use crate::gateway::Prompt;
use crate::kinopoisk::parse_film_refs;
use crate::storage::{StoredMovie, LIST_LIMIT};
use crate::text::html_escape;

pub const POLICY: ReplyPolicy = ReplyPolicy::ReplyRequired;

pub mod step {
    use crate::conversation::Step;
    pub const NAME: Step = 1;
    pub const LINKS: Step = 2;
}

pub const STEPS: &[Step] = &[step::NAME, step::LINKS];

const NAME_MAX: usize = 64;

fn name_prompt() -> Prompt {
    Prompt::force_reply("🏷 Как назовём подборку? Ответь на это сообщение.")
}

fn links_prompt(name: &str) -> Prompt {
    Prompt::buttons(
        format!(
            "Подборка «{}». Пришли ответом ссылки на фильмы Кинопоиска, каждую с новой строки (до {LIST_LIMIT}).",
            html_escape(name)
        ),
        nav(true),
    )
}

pub fn open() -> Opening {
    Opening::Prompt { step: step::NAME, payload: Payload::new(), prompt: name_prompt() }
}

pub async fn step(app: &App, conv: &Conversation, input: &Inbound) -> Result<Transition, BotError> {
    match conv.step {
        step::NAME => {
            let name = input.text().unwrap_or_default();
            if name.is_empty() || name.chars().count() > NAME_MAX {
                return Ok(Transition::Retry(with_error("Нужно название до 64 символов.", name_prompt())));
            }
            Ok(Transition::Advance { step: step::LINKS, patch: patch([("name", json!(name))]), prompt: links_prompt(name) })
        }
        step::LINKS => {
            let name = conv.str("name").unwrap_or_default().to_string();
            let ids = parse_film_refs(input.text().unwrap_or_default());
            if ids.is_empty() || ids.len() > LIST_LIMIT {
                return Ok(Transition::Retry(with_error("Нужна хотя бы одна ссылка, но не больше 50.", links_prompt(&name))));
            }
            let mut movies = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(film) = app.catalog.film(id).await? {
                    movies.push(StoredMovie::from(&film));
                }
            }
            if movies.is_empty() {
                return Ok(Transition::Retry(with_error("Ни один фильм не нашёлся на Кинопоиске.", links_prompt(&name))));
            }
            let count = movies.len();
            let tag = deeplink::create_tag(&app.storage, conv.subject.0, name, movies).await?;
            tracing::info!(owner = conv.subject.0, code = %tag.code, count, "tag collection created");
            Ok(Transition::Done(format!(
                "✅ Подборка «{}» ({count} шт.) готова:\n{}",
                html_escape(&tag.name),
                deeplink::link(&app.bot_username, &tag.code)
            )))
        }
        _ => Ok(Transition::Retry(name_prompt())),
    }
}

pub fn back(conv: &Conversation) -> Option<Transition> {
    (conv.step == step::LINKS).then(|| Transition::Back { step: step::NAME, clear: &["name"], prompt: name_prompt() })
}
