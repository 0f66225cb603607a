use super::{nav, resolve_film, with_error, Opening, Transition};
use crate::app::App;
use crate::conversation::{Conversation, Payload, Step};
use crate::correlator::{Inbound, ReplyPolicy};
use crate::error::BotError;
use crate::gateway::Prompt;
use crate::text::film_block;

pub const POLICY: ReplyPolicy = ReplyPolicy::FreeForm;

pub mod step {
    use crate::conversation::Step;
    pub const LINK: Step = 1;
}

pub const STEPS: &[Step] = &[step::LINK];

const DESCRIPTION_LIMIT: usize = 2000;

fn link_prompt() -> Prompt {
    Prompt::buttons("📖 Описание какого фильма показать? Пришли ссылку или id.", nav(false))
}

pub fn open() -> Opening {
    Opening::Prompt { step: step::LINK, payload: Payload::new(), prompt: link_prompt() }
}

pub async fn step(app: &App, _conv: &Conversation, input: &Inbound) -> Result<Transition, BotError> {
    match resolve_film(app, input).await? {
        Ok(film) => Ok(Transition::Done(film_block(&film, DESCRIPTION_LIMIT))),
        Err(why) => Ok(Transition::Retry(with_error(why, link_prompt()))),
    }
}
