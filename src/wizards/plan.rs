//! «Запланировать просмотр»: ссылка → дата → (для кино) время и кинотеатр.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::json;

use super::{film_value, nav, resolve_film, stored_film, today, with_error, Opening, Transition};
use crate::app::App;
use crate::conversation::{patch, Conversation, Step};
use crate::correlator::{Inbound, ReplyPolicy};
use crate::error::BotError;
use crate::gateway::Prompt;
use crate::storage::{Place, Plan};
use crate::text::{html_escape, stored_title};

pub const POLICY: ReplyPolicy = ReplyPolicy::ReplyRequired;

pub mod step {
    use crate::conversation::Step;
    pub const LINK: Step = 1;
    pub const DATE: Step = 2;
    pub const CINEMA: Step = 3;
}

pub const STEPS: &[Step] = &[step::LINK, step::DATE, step::CINEMA];

const DATE_FMT: &str = "%d.%m.%Y";
const SESSION_FMT: &str = "%d.%m.%Y %H:%M";

fn place_of(conv: &Conversation) -> Place {
    match conv.str("place") {
        Some("cinema") => Place::Cinema,
        _ => Place::Home,
    }
}

fn link_prompt() -> Prompt {
    Prompt::force_reply("🎬 Что смотрим? Пришли ссылку на фильм с Кинопоиска ответом на это сообщение.")
}

fn date_prompt(place: Place, title: &str) -> Prompt {
    let ask = match place {
        Place::Home => "Когда смотрим дома? Дата в формате ДД.ММ.ГГГГ",
        Place::Cinema => "Когда сеанс? Дата и время в формате ДД.ММ.ГГГГ ЧЧ:ММ",
    };
    Prompt::buttons(format!("<b>{}</b>\n{} (ответом на это сообщение).", html_escape(title), ask), nav(true))
}

fn cinema_prompt() -> Prompt {
    Prompt::buttons("В каком кинотеатре? Ответь названием на это сообщение.", nav(true))
}

/// `arg`: `home|cinema [film_id]`.
pub async fn open(app: &App, arg: &str) -> Result<Opening, BotError> {
    let mut parts = arg.split_whitespace();
    let place = match parts.next() {
        Some("cinema") => "cinema",
        _ => "home",
    };
    let Some(film_id) = parts.next().and_then(|s| s.parse::<u64>().ok()) else {
        return Ok(Opening::Prompt {
            step: step::LINK,
            payload: patch([("place", json!(place))]),
            prompt: link_prompt(),
        });
    };
    let Some(film) = app.catalog.film(film_id).await? else {
        return Ok(Opening::Denied("Такого фильма на Кинопоиске нет.".into()));
    };
    let place_enum = if place == "cinema" { Place::Cinema } else { Place::Home };
    Ok(Opening::Prompt {
        step: step::DATE,
        payload: patch([("place", json!(place)), ("film", film_value(&film)?)]),
        prompt: date_prompt(place_enum, &film.title),
    })
}

pub async fn step(app: &App, conv: &Conversation, input: &Inbound) -> Result<Transition, BotError> {
    let place = place_of(conv);
    match conv.step {
        step::LINK => match resolve_film(app, input).await? {
            Err(why) => Ok(Transition::Retry(with_error(why, link_prompt()))),
            Ok(film) => Ok(Transition::Advance {
                step: step::DATE,
                patch: patch([("film", film_value(&film)?)]),
                prompt: date_prompt(place, &film.title),
            }),
        },
        step::DATE => {
            let title = stored_film(conv).map(|f| f.title).unwrap_or_default();
            let text = input.text().unwrap_or_default();
            match place {
                Place::Home => match parse_date(text, today()) {
                    Err(why) => Ok(Transition::Retry(with_error(why, date_prompt(place, &title)))),
                    Ok(date) => commit(app, conv, date, None, None).await,
                },
                Place::Cinema => match parse_session(text, today()) {
                    Err(why) => Ok(Transition::Retry(with_error(why, date_prompt(place, &title)))),
                    Ok(at) => Ok(Transition::Advance {
                        step: step::CINEMA,
                        patch: patch([
                            ("date", json!(at.date().format("%Y-%m-%d").to_string())),
                            ("time", json!(at.time().format("%H:%M").to_string())),
                        ]),
                        prompt: cinema_prompt(),
                    }),
                },
            }
        }
        step::CINEMA => {
            let name = input.text().unwrap_or_default();
            if name.is_empty() || name.chars().count() > 100 {
                return Ok(Transition::Retry(with_error("Нужно название кинотеатра до 100 символов.", cinema_prompt())));
            }
            let date = conv.str("date").and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());
            let time = conv.str("time").and_then(|t| NaiveTime::parse_from_str(t, "%H:%M").ok());
            match date {
                Some(date) => commit(app, conv, date, time, Some(name.to_string())).await,
                None => Ok(Transition::Denied("Диалог сбился, начни заново: /cinema".into())),
            }
        }
        _ => Ok(Transition::Retry(link_prompt())),
    }
}

async fn commit(
    app: &App,
    conv: &Conversation,
    date: NaiveDate,
    time: Option<NaiveTime>,
    cinema: Option<String>,
) -> Result<Transition, BotError> {
    let Some(film) = stored_film(conv) else {
        return Ok(Transition::Denied("Диалог сбился, начни заново: /plan".into()));
    };
    let plan = app
        .storage
        .add_plan(Plan {
            id: 0,
            chat_id: conv.origin.chat.0,
            owner: conv.subject.0,
            film,
            place: place_of(conv),
            date,
            time,
            cinema,
            ticket_file_id: None,
        })
        .await?;
    Ok(Transition::Done(format!("✅ Запланировано: {}", describe_plan(&plan))))
}

pub fn describe_plan(p: &Plan) -> String {
    let when = match p.time {
        Some(t) => format!("{} {}", p.date.format(DATE_FMT), t.format("%H:%M")),
        None => p.date.format(DATE_FMT).to_string(),
    };
    let place = match (&p.place, &p.cinema) {
        (Place::Cinema, Some(c)) => format!("кинотеатр «{}»", html_escape(c)),
        (Place::Cinema, None) => "в кино".to_string(),
        (Place::Home, _) => "дома".to_string(),
    };
    let ticket = if p.ticket_file_id.is_some() { " 🎟" } else { "" };
    format!("<b>{}</b> — {}, {}{}", html_escape(&stored_title(&p.film)), place, when, ticket)
}

pub fn back(conv: &Conversation) -> Option<Transition> {
    match conv.step {
        step::DATE => Some(Transition::Back { step: step::LINK, clear: &["film"], prompt: link_prompt() }),
        step::CINEMA => {
            let title = stored_film(conv).map(|f| f.title).unwrap_or_default();
            Some(Transition::Back {
                step: step::DATE,
                clear: &["date", "time"],
                prompt: date_prompt(Place::Cinema, &title),
            })
        }
        _ => None,
    }
}

fn parse_date(s: &str, today: NaiveDate) -> Result<NaiveDate, &'static str> {
    let date = NaiveDate::parse_from_str(s.trim(), DATE_FMT).map_err(|_| "Не понял дату, нужно ДД.ММ.ГГГГ.")?;
    if date < today {
        return Err("Эта дата уже прошла.");
    }
    Ok(date)
}

fn parse_session(s: &str, today: NaiveDate) -> Result<NaiveDateTime, &'static str> {
    let at = NaiveDateTime::parse_from_str(s.trim(), SESSION_FMT)
        .map_err(|_| "Не понял, нужно ДД.ММ.ГГГГ ЧЧ:ММ.")?;
    if at.date() < today {
        return Err("Эта дата уже прошла.");
    }
    Ok(at)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn dates_must_be_well_formed_and_not_past() {
        let today = d(2025, 6, 1);
        assert_eq!(parse_date("01.06.2025", today), Ok(d(2025, 6, 1)));
        assert_eq!(parse_date(" 02.06.2025 ", today), Ok(d(2025, 6, 2)));
        assert!(parse_date("31.05.2025", today).is_err());
        assert!(parse_date("2025-06-02", today).is_err());
        assert!(parse_date("31.02.2025", today).is_err());
    }

    #[test]
    fn sessions_need_time() {
        let today = d(2025, 6, 1);
        let at = parse_session("05.06.2025 19:30", today).unwrap();
        assert_eq!(at.time(), NaiveTime::from_hms_opt(19, 30, 0).unwrap());
        assert!(parse_session("05.06.2025", today).is_err());
        assert!(parse_session("05.06.2024 19:30", today).is_err());
    }
}
