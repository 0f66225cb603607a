mod app;
mod config;
mod conversation;
mod correlator;
mod deeplink;
mod error;
mod gateway;
mod kinopoisk;
mod storage;
mod text;
mod tg;
mod wizards;

use std::sync::Arc;

use anyhow::Context;
use dotenvy::dotenv;
use teloxide::prelude::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::app::App;
use crate::config::Config;
use crate::conversation::{spawn_sweeper, ConversationStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;
    let bot = Bot::from_env();

    let bot_username = match &config.bot_username {
        Some(name) => name.clone(),
        None => bot
            .get_me()
            .await
            .context("getMe failed, set BOT_USERNAME or check TELOXIDE_TOKEN")?
            .user
            .username
            .context("bot account has no username")?,
    };

    let storage = storage::Storage::new(config.store_path.clone()).await?;
    storage.seed_admins(&config.admin_ids).await?;

    let catalog = kinopoisk::KinopoiskClient::new(config.kinopoisk_api_key.clone(), config.kinopoisk_base_url.clone());
    let conversations = ConversationStore::new(config.store_policy());
    spawn_sweeper(conversations.clone(), config.sweep_every);

    info!(bot = %bot_username, store = %config.store_path.display(), "starting");
    let app = App { storage, catalog, conversations, config: Arc::new(config), bot_username };
    tg::run(bot, app).await;
    Ok(())
}
