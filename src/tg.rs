use crate::app::App;
use crate::conversation::{Origin, WizardKind};
use crate::correlator::Inbound;
use crate::deeplink;
use crate::error::{BotError, GatewayError};
use crate::gateway::{Messenger, Prompt};
use crate::kinopoisk::{film_url, Film};
use crate::storage::{StoredMovie, LIST_LIMIT};
use crate::text::{film_block, html_escape, join_blocks, one_line_title, split_by_chars, stored_title, with_count};
use crate::wizards::{self, plan::describe_plan, today};
use once_cell::sync::Lazy;
use std::{collections::HashMap, sync::Arc};
use teloxide::{
    dispatching::{Dispatcher, UpdateFilterExt},
    prelude::*,
    types::{
        CallbackQuery, ChatId, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, InputMedia,
        InputMediaPhoto, InputPollOption, ParseMode, UserId,
    },
    utils::command::BotCommands,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/* ====== Последний поиск в чате ======
   чтобы по кнопке «➕» не ходить в Кинопоиск второй раз */
static LAST_SEARCH: Lazy<Arc<RwLock<HashMap<ChatId, Vec<Film>>>>> =
    Lazy::new(|| Arc::new(RwLock::new(HashMap::new())));

/* ====== Команды ====== */
#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Команды:")]
enum Command {
    #[command(description = "начать")]
    Start(String),
    #[command(description = "помощь")]
    Help,
    #[command(description = "показать список")]
    List,
    #[command(description = "сбросить список")]
    Reset,
    #[command(description = "составить голосование")]
    Vote,
    #[command(description = "запланировать просмотр дома")]
    Plan,
    #[command(description = "запланировать поход в кино")]
    Cinema,
    #[command(description = "ближайшие просмотры")]
    Plans,
    #[command(description = "прикрепить билет")]
    Ticket,
    #[command(description = "оплатить подписку")]
    Pay,
    #[command(description = "подтвердить платёж (админ)")]
    Approve(String),
    #[command(description = "отключить подписку")]
    Unsubscribe,
    #[command(description = "добавить администратора")]
    AddAdmin,
    #[command(description = "создать подборку")]
    Tag,
    #[command(description = "мои подборки")]
    Tags,
    #[command(description = "настройки")]
    Settings,
    #[command(description = "импортировать список")]
    Import,
    #[command(description = "отметить просмотренное")]
    Watched,
    #[command(description = "мои оценки")]
    Ratings,
    #[command(description = "описание фильма")]
    About,
    #[command(description = "отменить текущий диалог")]
    Cancel,
}

pub async fn run(bot: Bot, app: App) {
    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .branch(dptree::entry().filter_command::<Command>().endpoint({
                    let app = app.clone();
                    move |bot: Bot, msg: Message, cmd: Command| {
                        let app = app.clone();
                        async move { on_command(bot, msg, cmd, &app).await }
                    }
                }))
                .branch({
                    let app = app.clone();
                    dptree::endpoint(move |bot: Bot, msg: Message| {
                        let app = app.clone();
                        async move { on_message(bot, msg, &app).await }
                    })
                }),
        )
        .branch(Update::filter_callback_query().endpoint({
            let app = app.clone();
            move |bot: Bot, q: CallbackQuery| {
                let app = app.clone();
                async move { on_callback(bot, q, &app).await }
            }
        }));

    Dispatcher::builder(bot, handler)
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

fn origin_of(msg: &Message) -> Origin {
    Origin { chat: msg.chat.id, thread: msg.thread_id }
}

/* ====== Команды ====== */

/// Доменные ошибки наружу не отдаём, пользователю уходит общий текст.
async fn on_command(bot: Bot, msg: Message, cmd: Command, app: &App) -> ResponseResult<()> {
    let origin = origin_of(&msg);
    if let Err(e) = command(&bot, &msg, cmd, app, origin).await {
        wizards::fail(&bot, &origin, &e).await;
    }
    Ok(())
}

async fn command(bot: &Bot, msg: &Message, cmd: Command, app: &App, origin: Origin) -> Result<(), BotError> {
    let chat = msg.chat.id;
    let Some(user) = msg.from.as_ref() else { return Ok(()) };
    let subject = user.id;

    let wizard = |kind: WizardKind, arg: &'static str| wizards::begin(app, bot, kind, subject, origin, arg);

    match cmd {
        Command::Start(payload) => match deeplink::parse_start_payload(&payload) {
            Some(code) => send_tag_view(bot, origin, app, code).await?,
            None => {
                bot.send(&origin, Prompt::text("Привет! Пришли название фильма, и я помогу собрать список на вечер.\n/help — все команды")).await?;
            }
        },
        Command::Help => {
            bot.send(&origin, Prompt::text(html_escape(&Command::descriptions().to_string()))).await?;
        }
        Command::List => send_list_view(bot, origin, app).await?,
        Command::Reset => {
            app.storage.remove_chat(chat.0).await?;
            LAST_SEARCH.write().await.remove(&chat);
            bot.send(&origin, Prompt::text("Список очищен.")).await?;
        }
        Command::Vote => run_vote_flow(bot, origin, app).await?,
        Command::Plan => wizard(WizardKind::PlanViewing, "home").await?,
        Command::Cinema => wizard(WizardKind::PlanViewing, "cinema").await?,
        Command::Plans => send_plans(bot, origin, app).await?,
        Command::Ticket => wizard(WizardKind::UploadTicket, "").await?,
        Command::Pay => wizard(WizardKind::CheckPayment, "").await?,
        Command::Approve(arg) => approve(bot, origin, app, subject, &arg).await?,
        Command::Unsubscribe => wizard(WizardKind::Unsubscribe, "").await?,
        Command::AddAdmin => wizard(WizardKind::AddAdmin, "").await?,
        Command::Tag => wizard(WizardKind::AddTagCollection, "").await?,
        Command::Tags => send_own_tags(bot, origin, app, subject).await?,
        Command::Settings => wizard(WizardKind::EditSettings, "").await?,
        Command::Import => wizard(WizardKind::ImportCatalog, "").await?,
        Command::Watched => wizard(WizardKind::MarkWatched, "").await?,
        Command::Ratings => send_ratings(bot, origin, app, subject).await?,
        Command::About => wizard(WizardKind::ViewDescription, "").await?,
        Command::Cancel => wizards::cancel(app, bot, subject, origin).await?,
    }
    Ok(())
}

async fn approve(bot: &Bot, origin: Origin, app: &App, subject: UserId, arg: &str) -> Result<(), BotError> {
    if !app.storage.is_admin(subject.0).await {
        bot.send(&origin, Prompt::text("Это может только администратор.")).await?;
        return Ok(());
    }
    let Ok(id) = arg.trim().parse::<u64>() else {
        bot.send(&origin, Prompt::text("Формат: /approve 12, где 12 — номер заявки")).await?;
        return Ok(());
    };
    let Some(payment) = app.storage.approve_payment(id).await? else {
        bot.send(&origin, Prompt::text("Нет такой ожидающей заявки.")).await?;
        return Ok(());
    };
    info!(payment = payment.id, payer = payment.payer, by = subject.0, "payment approved");
    bot.send(&origin, Prompt::text(format!("Заявка №{} подтверждена.", payment.id))).await?;

    // плательщик мог ни разу не писать боту в личку
    let payer = Origin::chat(ChatId(payment.payer as i64));
    let note = format!("🎉 Подписка «{}» активна. Спасибо!", payment.tier.title());
    if let Err(e) = bot.send(&payer, Prompt::text(note)).await {
        warn!(error = %e, payer = payment.payer, "could not notify payer");
    }
    Ok(())
}

/* ====== Обычные сообщения: сначала диалоги, потом поиск ====== */
async fn on_message(bot: Bot, msg: Message, app: &App) -> ResponseResult<()> {
    if let Some(inbound) = Inbound::from_message(&msg) {
        if wizards::route(app, &bot, &inbound).await {
            return Ok(());
        }
    }
    // в группах свободный текст не трогаем, там люди просто разговаривают
    if !msg.chat.is_private() {
        return Ok(());
    }
    let origin = origin_of(&msg);
    if let Err(e) = on_search_text(&bot, &msg, app).await {
        wizards::fail(&bot, &origin, &e).await;
    }
    Ok(())
}

async fn on_search_text(bot: &Bot, msg: &Message, app: &App) -> Result<(), BotError> {
    let Some(query) = msg.text().or_else(|| msg.caption()) else { return Ok(()) };
    let query = query.trim();
    if query.is_empty() {
        return Ok(());
    }
    let origin = origin_of(msg);

    let results = app.catalog.search(query, 10).await?;
    if results.is_empty() {
        bot.send(&origin, Prompt::text("Ничего не нашёл 😕")).await?;
        return Ok(());
    }
    debug!(query, found = results.len(), "search");
    LAST_SEARCH.write().await.insert(msg.chat.id, results.clone());

    let blocks = results.iter().map(|f| film_block(f, 600)).collect();
    for part in split_by_chars(&join_blocks(blocks, 3500), 4000) {
        bot.send(&origin, Prompt::text(part)).await?;
    }
    bot.send(&origin, Prompt::buttons("Выбери фильм, чтобы добавить в список:", keyboard_add_results(&results)))
        .await?;
    Ok(())
}

/* ====== Callback-кнопки ======
   wz:<value>           — ответ в открытом диалоге
   add:<id>             — добавить найденный фильм в список
   del:<id>             — удалить из списка
   show:<id>            — карточка фильма с постером
   tagadd:<code>        — добавить всю подборку в список
   begin:<kind>:<id>    — открыть мастер сразу с фильмом
*/
async fn on_callback(bot: Bot, q: CallbackQuery, app: &App) -> ResponseResult<()> {
    let Some(data) = q.data.clone() else { return Ok(()) };
    let Some(host) = q.message.as_ref() else { return Ok(()) };
    let origin = Origin {
        chat: host.chat().id,
        thread: host.regular_message().and_then(|m| m.thread_id),
    };

    if data.starts_with("wz:") {
        // сначала гасим «часики», протухший callback дальше не обрабатываем
        match answer_cb(&bot, &q, None).await {
            Err(BotError::Gateway(GatewayError::Stale)) => return Ok(()),
            Err(e) => debug!(error = %e, "answer callback failed"),
            Ok(()) => {}
        }
        if let Some(inbound) = Inbound::from_callback(&q) {
            if !wizards::route(app, &bot, &inbound).await {
                debug!(data = %data, "button of a finished dialogue");
            }
        }
        return Ok(());
    }

    if let Err(e) = callback(&bot, &q, app, origin, &data).await {
        wizards::fail(&bot, &origin, &e).await;
    }
    Ok(())
}

async fn callback(bot: &Bot, q: &CallbackQuery, app: &App, origin: Origin, data: &str) -> Result<(), BotError> {
    let chat = origin.chat;
    let mut parts = data.splitn(2, ':');
    let cmd = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("");

    match cmd {
        "tagadd" => {
            let Some(tag) = app.storage.tag(rest).await else {
                return answer_cb(bot, q, Some("Подборка не найдена")).await;
            };
            let added = app.storage.add_movies(chat.0, tag.movies).await?;
            answer_cb(bot, q, Some(&format!("Добавлено: {}", with_count(added, "фильм", "фильма", "фильмов")))).await?;
            send_list_view(bot, origin, app).await?;
        }
        "begin" => {
            answer_cb(bot, q, None).await?;
            let (kind, arg) = match rest.split_once(':') {
                Some(("plan", id)) => (WizardKind::PlanViewing, format!("home {id}")),
                Some(("cinema", id)) => (WizardKind::PlanViewing, format!("cinema {id}")),
                Some(("watched", id)) => (WizardKind::MarkWatched, id.to_string()),
                _ => return Ok(()),
            };
            wizards::begin(app, bot, kind, q.from.id, origin, &arg).await?;
        }
        "add" | "del" | "show" => {
            let Ok(id) = rest.parse::<u64>() else { return Ok(()) };
            match cmd {
                "add" => add_from_search(bot, q, app, origin, id).await?,
                "del" => {
                    if app.storage.delete_movie(chat.0, id).await? {
                        answer_cb(bot, q, Some("Удалено")).await?;
                        send_list_view(bot, origin, app).await?;
                    } else {
                        answer_cb(bot, q, Some("Не найдено в списке")).await?;
                    }
                }
                _ => {
                    answer_cb(bot, q, None).await?;
                    send_film_card(bot, origin, app, id).await?;
                }
            }
        }
        _ => answer_cb(bot, q, Some("Неизвестная команда")).await?,
    }
    Ok(())
}

async fn add_from_search(bot: &Bot, q: &CallbackQuery, app: &App, origin: Origin, id: u64) -> Result<(), BotError> {
    let chat = origin.chat;
    let cached = {
        let map = LAST_SEARCH.read().await;
        map.get(&chat).and_then(|v| v.iter().find(|f| f.id == id)).cloned()
    };
    let film = match cached {
        Some(f) => Some(f),
        None => app.catalog.film(id).await?,
    };
    let Some(film) = film else {
        return answer_cb(bot, q, Some("Не нашёл такой фильм")).await;
    };
    if app.storage.add_movie(chat.0, StoredMovie::from(&film)).await? {
        answer_cb(bot, q, Some("Добавлено")).await?;
        send_list_view(bot, origin, app).await?;
    } else if app.storage.get(chat.0).await.len() >= LIST_LIMIT {
        answer_cb(bot, q, Some(&format!("В списке уже {LIST_LIMIT} фильмов"))).await?;
    } else {
        answer_cb(bot, q, Some("Уже в списке")).await?;
    }
    Ok(())
}

/* ====== Экраны ====== */

async fn send_list_view(bot: &Bot, origin: Origin, app: &App) -> Result<(), BotError> {
    let list = app.storage.get(origin.chat.0).await;
    if list.is_empty() {
        bot.send(&origin, Prompt::text("Список пуст. Пришли название — добавлю варианты.")).await?;
        return Ok(());
    }
    let lines: Vec<String> = list.iter().map(|m| html_escape(&stored_title(m))).collect();
    let txt = format!("<b>В списке ({}/{LIST_LIMIT}):</b>\n{}", list.len(), lines.join("\n"));
    bot.send(&origin, Prompt::buttons(txt, keyboard_list(&list))).await?;
    Ok(())
}

async fn send_film_card(bot: &Bot, origin: Origin, app: &App, id: u64) -> Result<(), BotError> {
    let Some(film) = app.catalog.film(id).await? else {
        bot.send(&origin, Prompt::text("Не удалось получить данные")).await?;
        return Ok(());
    };
    if let Some(url) = &film.poster_url {
        match fetch_image(url).await {
            Ok(bytes) => {
                let mut req = bot.send_photo(origin.chat, InputFile::memory(bytes).file_name(format!("poster_{}.jpg", film.id)));
                if let Some(thread) = origin.thread {
                    req = req.message_thread_id(thread);
                }
                req.await?;
            }
            Err(e) => debug!(error = %e, url = %url, "poster fetch failed"),
        }
    }
    bot.send(&origin, Prompt::buttons(film_block(&film, 2000), keyboard_film_actions(film.id))).await?;
    Ok(())
}

async fn send_tag_view(bot: &Bot, origin: Origin, app: &App, code: &str) -> Result<(), BotError> {
    let Some(tag) = app.storage.tag(code).await else {
        bot.send(&origin, Prompt::text("Такой подборки нет.")).await?;
        return Ok(());
    };
    let lines: Vec<String> = tag
        .movies
        .iter()
        .map(|m| format!("• <a href=\"{}\">{}</a>", film_url(m.id), html_escape(&stored_title(m))))
        .collect();
    let text = format!("🏷 <b>{}</b>\n{}", html_escape(&tag.name), lines.join("\n"));
    let kb = InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback(
        "➕ Добавить всё в мой список",
        format!("tagadd:{}", tag.code),
    )]]);
    bot.send(&origin, Prompt::buttons(text, kb)).await?;
    Ok(())
}

async fn send_own_tags(bot: &Bot, origin: Origin, app: &App, subject: UserId) -> Result<(), BotError> {
    let tags = app.storage.tags_of(subject.0).await;
    if tags.is_empty() {
        bot.send(&origin, Prompt::text("Подборок пока нет. Создать: /tag")).await?;
        return Ok(());
    }
    let lines: Vec<String> = tags
        .iter()
        .map(|t| {
            format!(
                "• <b>{}</b> ({}) {}",
                html_escape(&t.name),
                with_count(t.movies.len(), "фильм", "фильма", "фильмов"),
                deeplink::link(&app.bot_username, &t.code)
            )
        })
        .collect();
    bot.send(&origin, Prompt::text(lines.join("\n"))).await?;
    Ok(())
}

async fn send_ratings(bot: &Bot, origin: Origin, app: &App, subject: UserId) -> Result<(), BotError> {
    // в группе показываем только тем, кто не скрыл оценки
    if !origin.chat.is_user() && !app.storage.settings(subject.0).await.public_ratings {
        bot.send(&origin, Prompt::text("Оценки скрыты в /settings, посмотреть их можно в личке с ботом.")).await?;
        return Ok(());
    }
    let mut ratings = app.storage.ratings(subject.0).await;
    if ratings.is_empty() {
        bot.send(&origin, Prompt::text("Оценок пока нет. Отметить просмотренное: /watched")).await?;
        return Ok(());
    }
    ratings.sort_by(|a, b| b.score.cmp(&a.score));
    let lines: Vec<String> = ratings
        .iter()
        .map(|r| format!("{:>2}/10  {}", r.score, html_escape(&stored_title(&r.film))))
        .collect();
    bot.send(&origin, Prompt::text(format!("<b>Твои оценки</b>\n{}", lines.join("\n")))).await?;
    Ok(())
}

async fn send_plans(bot: &Bot, origin: Origin, app: &App) -> Result<(), BotError> {
    let plans = app.storage.upcoming_plans(origin.chat.0, today()).await;
    if plans.is_empty() {
        bot.send(&origin, Prompt::text("Ничего не запланировано. /plan или /cinema")).await?;
        return Ok(());
    }
    let lines: Vec<String> = plans.iter().map(|p| format!("• {}", describe_plan(p))).collect();
    bot.send(&origin, Prompt::text(format!("<b>Ближайшие просмотры</b>\n{}", lines.join("\n")))).await?;
    Ok(())
}

async fn run_vote_flow(bot: &Bot, origin: Origin, app: &App) -> Result<(), BotError> {
    let list = app.storage.get(origin.chat.0).await;
    if list.len() < 2 {
        bot.send(&origin, Prompt::text("Нужно минимум 2 фильма в списке. Добавь и повтори /vote.")).await?;
        return Ok(());
    }
    // в опросе Telegram не больше 10 вариантов
    let options: Vec<InputPollOption> = list.iter().take(10).map(|m| InputPollOption::new(stored_title(m))).collect();
    let mut poll = bot
        .send_poll(origin.chat, "Что смотрим?", options)
        .is_anonymous(app.config.poll_anonymous)
        .allows_multiple_answers(app.config.poll_multiple);
    if let Some(thread) = origin.thread {
        poll = poll.message_thread_id(thread);
    }
    poll.await?;

    send_album(bot, origin, &list, Some("<b>Постеры</b>")).await?;

    let mut blocks = Vec::new();
    for sm in list.iter().take(10) {
        if let Some(f) = app.catalog.film(sm.id).await? {
            blocks.push(film_block(&f, 1200));
        }
    }
    let text = join_blocks(blocks, 4000 - 50);
    for part in split_by_chars(&text, 4000) {
        bot.send(&origin, Prompt::text(part)).await?;
    }
    bot.send(&origin, Prompt::text("Данные и изображения: © Кинопоиск")).await?;
    Ok(())
}

/* ====== Кнопки ====== */

fn keyboard_add_results(results: &[Film]) -> InlineKeyboardMarkup {
    let rows = results
        .iter()
        .map(|f| {
            vec![InlineKeyboardButton::callback(
                format!("➕ {}", one_line_title(&f.title, f.year)),
                format!("add:{}", f.id),
            )]
        })
        .collect::<Vec<_>>();
    InlineKeyboardMarkup::new(rows)
}

fn keyboard_list(list: &[StoredMovie]) -> InlineKeyboardMarkup {
    let rows = list
        .iter()
        .map(|m| {
            vec![
                InlineKeyboardButton::callback(format!("🎬 {}", stored_title(m)), format!("show:{}", m.id)),
                InlineKeyboardButton::callback("🗑", format!("del:{}", m.id)),
            ]
        })
        .collect::<Vec<_>>();
    InlineKeyboardMarkup::new(rows)
}

fn keyboard_film_actions(id: u64) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![
            InlineKeyboardButton::callback("📅 Дома", format!("begin:plan:{id}")),
            InlineKeyboardButton::callback("🍿 В кино", format!("begin:cinema:{id}")),
        ],
        vec![InlineKeyboardButton::callback("✅ Посмотрели", format!("begin:watched:{id}"))],
    ])
}

/* ====== Вспомогательные ====== */

async fn answer_cb(bot: &Bot, q: &CallbackQuery, text: Option<&str>) -> Result<(), BotError> {
    let mut req = bot.answer_callback_query(q.id.clone());
    if let Some(t) = text {
        req = req.text(t).show_alert(false);
    }
    req.await?;
    Ok(())
}

/* ====== Загрузка постеров байтами (устойчиво к редиректам/CDN) ====== */
async fn fetch_image(url: &str) -> Result<Vec<u8>, String> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(15))
        .user_agent("Mozilla/5.0 (compatible; tg-bot/1.0)")
        .build()
        .map_err(|e| e.to_string())?;
    let resp = client
        .get(url)
        .header(reqwest::header::ACCEPT, "image/*")
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !resp.status().is_success() {
        return Err(format!("status {}", resp.status()));
    }
    if let Some(ct) = resp.headers().get(reqwest::header::CONTENT_TYPE) {
        let ct = ct.to_str().unwrap_or("");
        if !ct.starts_with("image/") {
            return Err(format!("unexpected content-type: {ct}"));
        }
    }
    let bytes = resp.bytes().await.map_err(|e| e.to_string())?;
    Ok(bytes.to_vec())
}

async fn send_album(bot: &Bot, origin: Origin, movies: &[StoredMovie], caption_html: Option<&str>) -> Result<(), BotError> {
    let mut media: Vec<InputMedia> = Vec::new();
    for (i, m) in movies.iter().take(10).enumerate() {
        let Some(url) = &m.poster_url else { continue };
        let Ok(bytes) = fetch_image(url).await else { continue };
        let mut photo = InputMediaPhoto::new(InputFile::memory(bytes).file_name(format!("poster_{i}.jpg")));
        if media.is_empty() {
            if let Some(c) = caption_html {
                photo.caption = Some(c.to_string());
                photo.show_caption_above_media = true;
                photo.parse_mode = Some(ParseMode::Html);
            }
        }
        media.push(InputMedia::Photo(photo));
    }
    // альбом из одной картинки Telegram не примет
    if media.len() >= 2 {
        let mut req = bot.send_media_group(origin.chat, media);
        if let Some(thread) = origin.thread {
            req = req.message_thread_id(thread);
        }
        req.await?;
    }
    Ok(())
}
