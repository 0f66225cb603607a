use std::sync::Arc;

use crate::config::Config;
use crate::conversation::ConversationStore;
use crate::kinopoisk::KinopoiskClient;
use crate::storage::Storage;

/// Всё, что нужно обработчикам; дёшево клонируется в каждый эндпоинт.
#[derive(Clone)]
pub struct App {
    pub storage: Storage,
    pub catalog: KinopoiskClient,
    pub conversations: ConversationStore,
    pub config: Arc<Config>,
    pub bot_username: String,
}
