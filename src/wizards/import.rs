//! Импорт списка: любое следующее сообщение со ссылками, отвечать на вопрос не нужно.

use super::{nav, Opening, Transition};
use crate::app::App;
use crate::conversation::{Conversation, Payload, Step};
use crate::correlator::{Inbound, ReplyPolicy};
use crate::error::BotError;
use crate::gateway::Prompt;
use crate::kinopoisk::parse_film_refs;
use crate::storage::{StoredMovie, LIST_LIMIT};
use crate::text::with_count;

pub const POLICY: ReplyPolicy = ReplyPolicy::FreeForm;

pub mod step {
    use crate::conversation::Step;
    pub const LIST: Step = 1;
}

pub const STEPS: &[Step] = &[step::LIST];

fn list_prompt() -> Prompt {
    Prompt::buttons(
        "📥 Вставь список: ссылки Кинопоиска или id, через пробел, запятую или с новой строки.",
        nav(false),
    )
}

pub fn open() -> Opening {
    Opening::Prompt { step: step::LIST, payload: Payload::new(), prompt: list_prompt() }
}

pub async fn step(app: &App, conv: &Conversation, input: &Inbound) -> Result<Transition, BotError> {
    let ids = parse_film_refs(input.text().unwrap_or_default());
    if ids.is_empty() {
        return Ok(Transition::Retry(super::with_error("Не нашёл ни одной ссылки.", list_prompt())));
    }
    let total = ids.len();
    let mut found: Vec<StoredMovie> = Vec::new();
    for id in ids.into_iter().take(LIST_LIMIT) {
        match app.catalog.film(id).await? {
            Some(film) => found.push(StoredMovie::from(&film)),
            None => tracing::debug!(id, "import: film not found"),
        }
    }
    let added = app.storage.add_movies(conv.origin.chat.0, found).await?;
    let skipped = total - added;
    Ok(Transition::Done(format!(
        "Импорт готов: добавлено {}, пропущено {}.",
        with_count(added, "фильм", "фильма", "фильмов"),
        skipped
    )))
}
