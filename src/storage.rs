use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
};
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::kinopoisk::Film;

pub const LIST_LIMIT: usize = 50;

type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMovie {
    pub id: u64,
    pub title: String,
    pub original_title: Option<String>,
    pub year: Option<i32>,
    pub poster_url: Option<String>,
    // описание не храним: для показа всё равно тянем детали с Кинопоиска
}

impl From<&Film> for StoredMovie {
    fn from(f: &Film) -> Self {
        Self {
            id: f.id,
            title: f.title.clone(),
            original_title: f.original_title.clone(),
            year: f.year,
            poster_url: f.poster_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Place {
    Home,
    Cinema,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: u64,
    pub chat_id: i64,
    pub owner: u64,
    pub film: StoredMovie,
    pub place: Place,
    pub date: NaiveDate,
    pub time: Option<NaiveTime>,
    pub cinema: Option<String>,
    pub ticket_file_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rating {
    pub film: StoredMovie,
    pub score: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub code: String,
    pub owner: u64,
    pub name: String,
    pub movies: Vec<StoredMovie>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Basic,
    Premium,
}

impl Tier {
    pub fn price_rub(self) -> u32 {
        match self {
            Tier::Basic => 199,
            Tier::Premium => 399,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Tier::Basic => "Базовая",
            Tier::Premium => "Премиум",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "basic" => Some(Tier::Basic),
            "premium" => Some(Tier::Premium),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub tier: Tier,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Approved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: u64,
    pub payer: u64,
    pub tier: Tier,
    pub amount_rub: u32,
    pub receipt_file_id: String,
    pub status: PaymentStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub notifications: bool,
    pub public_ratings: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self { notifications: false, public_ratings: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct FileState {
    version: u32,
    // chat_id -> фильмы (лички и группы)
    chats: HashMap<i64, Vec<StoredMovie>>,
    #[serde(default)]
    ratings: HashMap<u64, Vec<Rating>>,
    #[serde(default)]
    plans: Vec<Plan>,
    #[serde(default)]
    next_plan_id: u64,
    #[serde(default)]
    tags: HashMap<String, Tag>,
    #[serde(default)]
    admins: HashSet<u64>,
    #[serde(default)]
    subscriptions: HashMap<u64, Subscription>,
    #[serde(default)]
    payments: Vec<Payment>,
    #[serde(default)]
    next_payment_id: u64,
    #[serde(default)]
    settings: HashMap<u64, Settings>,
}

#[derive(Clone)]
pub struct Storage {
    inner: Arc<RwLock<FileState>>,
    path: PathBuf,
}

impl Storage {
    pub async fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = if fs::try_exists(&path).await.unwrap_or(false) {
            let data = fs::read(&path).await?;
            match serde_json::from_slice::<FileState>(&data) {
                Ok(mut s) => { if s.version < 2 { s.version = 2; } s }
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "state file unreadable, starting empty");
                    FileState { version: 2, ..Default::default() }
                }
            }
        } else {
            FileState { version: 2, ..Default::default() }
        };
        Ok(Self { inner: Arc::new(RwLock::new(state)), path })
    }

    /* ====== Список фильмов чата ====== */

    pub async fn get(&self, chat_id: i64) -> Vec<StoredMovie> {
        let guard = self.inner.read().await;
        guard.chats.get(&chat_id).cloned().unwrap_or_default()
    }

    pub async fn remove_chat(&self, chat_id: i64) -> Result<()> {
        self.commit(|st| Ok(((), st.chats.remove(&chat_id).is_some()))).await
    }

    /// true — добавили, false — уже был или список полон.
    pub async fn add_movie(&self, chat_id: i64, m: StoredMovie) -> Result<bool> {
        self.commit(|st| {
            let entry = st.chats.entry(chat_id).or_default();
            if entry.iter().any(|x| x.id == m.id) || entry.len() >= LIST_LIMIT {
                return Ok((false, false));
            }
            entry.push(m);
            Ok((true, true))
        })
        .await
    }

    /// Сколько фильмов реально добавилось.
    pub async fn add_movies(&self, chat_id: i64, movies: Vec<StoredMovie>) -> Result<usize> {
        self.commit(|st| {
            let entry = st.chats.entry(chat_id).or_default();
            let mut added = 0;
            for m in movies {
                if entry.len() >= LIST_LIMIT { break; }
                if !entry.iter().any(|x| x.id == m.id) {
                    entry.push(m);
                    added += 1;
                }
            }
            Ok((added, added > 0))
        })
        .await
    }

    pub async fn delete_movie(&self, chat_id: i64, movie_id: u64) -> Result<bool> {
        self.commit(|st| {
            let removed = match st.chats.get_mut(&chat_id) {
                Some(list) => {
                    let before = list.len();
                    list.retain(|m| m.id != movie_id);
                    list.len() < before
                }
                None => false,
            };
            Ok((removed, removed))
        })
        .await
    }

    /* ====== Оценки ====== */

    /// Оценка заменяет прежнюю; фильм уходит из списка чата.
    pub async fn rate(&self, chat_id: i64, subject: u64, film: StoredMovie, score: u8) -> Result<()> {
        self.commit(|st| {
            if let Some(list) = st.chats.get_mut(&chat_id) {
                list.retain(|m| m.id != film.id);
            }
            let ratings = st.ratings.entry(subject).or_default();
            ratings.retain(|r| r.film.id != film.id);
            ratings.push(Rating { film, score });
            Ok(((), true))
        })
        .await
    }

    pub async fn ratings(&self, subject: u64) -> Vec<Rating> {
        let guard = self.inner.read().await;
        guard.ratings.get(&subject).cloned().unwrap_or_default()
    }

    /* ====== Планы просмотра ====== */

    /// `plan.id` назначается здесь.
    pub async fn add_plan(&self, mut plan: Plan) -> Result<Plan> {
        self.commit(|st| {
            st.next_plan_id += 1;
            plan.id = st.next_plan_id;
            st.plans.push(plan.clone());
            Ok((plan, true))
        })
        .await
    }

    pub async fn upcoming_plans(&self, chat_id: i64, today: NaiveDate) -> Vec<Plan> {
        let guard = self.inner.read().await;
        let mut plans: Vec<Plan> = guard
            .plans
            .iter()
            .filter(|p| p.chat_id == chat_id && p.date >= today)
            .cloned()
            .collect();
        plans.sort_by_key(|p| (p.date, p.time));
        plans
    }

    pub async fn attach_ticket(&self, plan_id: u64, owner: u64, file_id: String) -> Result<bool> {
        self.commit(|st| {
            let attached = match st.plans.iter_mut().find(|p| p.id == plan_id && p.owner == owner) {
                Some(p) => {
                    p.ticket_file_id = Some(file_id);
                    true
                }
                None => false,
            };
            Ok((attached, attached))
        })
        .await
    }

    /* ====== Подборки ====== */

    pub async fn tag(&self, code: &str) -> Option<Tag> {
        let guard = self.inner.read().await;
        guard.tags.get(code).cloned()
    }

    /// Занятый код — `StorageError::Duplicate`, ничего не меняется.
    pub async fn insert_tag(&self, tag: Tag) -> Result<Tag> {
        self.commit(|st| {
            if st.tags.contains_key(&tag.code) {
                return Err(StorageError::Duplicate(tag.code));
            }
            st.tags.insert(tag.code.clone(), tag.clone());
            Ok((tag, true))
        })
        .await
    }

    pub async fn tags_of(&self, owner: u64) -> Vec<Tag> {
        let guard = self.inner.read().await;
        let mut tags: Vec<Tag> = guard.tags.values().filter(|t| t.owner == owner).cloned().collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        tags
    }

    /* ====== Админы, подписки, платежи ====== */

    pub async fn seed_admins(&self, ids: &[u64]) -> Result<()> {
        self.commit(|st| {
            let before = st.admins.len();
            st.admins.extend(ids.iter().copied());
            Ok(((), st.admins.len() != before))
        })
        .await
    }

    pub async fn is_admin(&self, subject: u64) -> bool {
        self.inner.read().await.admins.contains(&subject)
    }

    pub async fn add_admin(&self, subject: u64) -> Result<bool> {
        self.commit(|st| {
            let added = st.admins.insert(subject);
            Ok((added, added))
        })
        .await
    }

    /// Только действующая подписка.
    pub async fn subscription(&self, subject: u64) -> Option<Subscription> {
        let guard = self.inner.read().await;
        guard.subscriptions.get(&subject).filter(|s| s.active).cloned()
    }

    pub async fn deactivate_subscription(&self, subject: u64) -> Result<bool> {
        self.commit(|st| {
            let changed = match st.subscriptions.get_mut(&subject) {
                Some(s) if s.active => {
                    s.active = false;
                    true
                }
                _ => false,
            };
            Ok((changed, changed))
        })
        .await
    }

    pub async fn record_payment(&self, payer: u64, tier: Tier, amount_rub: u32, receipt_file_id: String) -> Result<Payment> {
        self.commit(|st| {
            st.next_payment_id += 1;
            let p = Payment {
                id: st.next_payment_id,
                payer,
                tier,
                amount_rub,
                receipt_file_id,
                status: PaymentStatus::Pending,
            };
            st.payments.push(p.clone());
            Ok((p, true))
        })
        .await
    }

    /// Подтверждает ожидающий платёж и включает подписку плательщику.
    pub async fn approve_payment(&self, payment_id: u64) -> Result<Option<Payment>> {
        self.commit(|st| {
            let found = st
                .payments
                .iter_mut()
                .find(|p| p.id == payment_id && p.status == PaymentStatus::Pending)
                .map(|p| {
                    p.status = PaymentStatus::Approved;
                    p.clone()
                });
            if let Some(p) = &found {
                st.subscriptions.insert(p.payer, Subscription { tier: p.tier, active: true });
            }
            let changed = found.is_some();
            Ok((found, changed))
        })
        .await
    }

    /* ====== Настройки ====== */

    pub async fn settings(&self, subject: u64) -> Settings {
        let guard = self.inner.read().await;
        guard.settings.get(&subject).cloned().unwrap_or_default()
    }

    pub async fn update_settings(&self, subject: u64, f: impl FnOnce(&mut Settings)) -> Result<Settings> {
        self.commit(|st| {
            let s = st.settings.entry(subject).or_default();
            f(s);
            Ok((s.clone(), true))
        })
        .await
    }

    /// Правка идёт по копии: копия пишется на диск и только потом подменяет состояние.
    /// Write-лок держим до конца записи, поэтому писатель и tmp-файл всегда один.
    /// `f` возвращает результат и флаг «что-то изменилось».
    async fn commit<T>(&self, f: impl FnOnce(&mut FileState) -> Result<(T, bool)>) -> Result<T> {
        let mut guard = self.inner.write().await;
        let mut next = guard.clone();
        let (out, changed) = f(&mut next)?;
        if changed {
            self.write_file(&next).await?;
            *guard = next;
        }
        Ok(out)
    }

    async fn write_file(&self, state: &FileState) -> Result<()> {
        let snapshot = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &snapshot).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn movie(id: u64) -> StoredMovie {
        StoredMovie {
            id,
            title: format!("Фильм {id}"),
            original_title: None,
            year: Some(2000),
            poster_url: None,
        }
    }

    async fn fresh() -> (TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().join("state.json")).await.unwrap();
        (dir, storage)
    }

    fn plan(owner: u64, place: Place, date: &str) -> Plan {
        Plan {
            id: 0,
            chat_id: 10,
            owner,
            film: movie(1),
            place,
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            time: None,
            cinema: None,
            ticket_file_id: None,
        }
    }

    #[tokio::test]
    async fn watchlist_skips_duplicates_and_respects_limit() {
        let (_dir, s) = fresh().await;
        assert!(s.add_movie(1, movie(1)).await.unwrap());
        assert!(!s.add_movie(1, movie(1)).await.unwrap());

        let bulk = (2..=LIST_LIMIT as u64 + 5).map(movie).collect();
        let added = s.add_movies(1, bulk).await.unwrap();
        assert_eq!(added, LIST_LIMIT - 1);
        assert_eq!(s.get(1).await.len(), LIST_LIMIT);
        assert!(s.delete_movie(1, 1).await.unwrap());
        assert!(!s.delete_movie(1, 1).await.unwrap());
    }

    #[tokio::test]
    async fn state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let s = Storage::new(&path).await.unwrap();
            s.add_movie(5, movie(42)).await.unwrap();
            s.add_admin(9).await.unwrap();
        }
        let s = Storage::new(&path).await.unwrap();
        assert_eq!(s.get(5).await, vec![movie(42)]);
        assert!(s.is_admin(9).await);
    }

    #[tokio::test]
    async fn rating_replaces_previous_and_leaves_watchlist() {
        let (_dir, s) = fresh().await;
        s.add_movie(3, movie(7)).await.unwrap();
        s.rate(3, 100, movie(7), 6).await.unwrap();
        s.rate(3, 100, movie(7), 9).await.unwrap();

        let ratings = s.ratings(100).await;
        assert_eq!(ratings.len(), 1);
        assert_eq!(ratings[0].score, 9);
        assert!(s.get(3).await.is_empty());
    }

    #[tokio::test]
    async fn plans_get_ids_and_tickets_attach_to_owner_only() {
        let (_dir, s) = fresh().await;
        let p = s.add_plan(plan(100, Place::Cinema, "2099-01-02")).await.unwrap();
        s.add_plan(plan(100, Place::Home, "2000-01-01")).await.unwrap();
        assert_eq!(p.id, 1);

        let today = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(s.upcoming_plans(10, today).await.len(), 1);

        assert!(!s.attach_ticket(p.id, 200, "f".into()).await.unwrap());
        assert!(s.attach_ticket(p.id, 100, "f".into()).await.unwrap());
        let stored = s.upcoming_plans(10, today).await;
        assert_eq!(stored[0].ticket_file_id.as_deref(), Some("f"));
    }

    #[tokio::test]
    async fn tag_codes_are_unique() {
        let (_dir, s) = fresh().await;
        let tag = Tag { code: "abc".into(), owner: 1, name: "Нуар".into(), movies: vec![movie(1)] };
        s.insert_tag(tag.clone()).await.unwrap();
        assert!(matches!(s.insert_tag(tag).await, Err(StorageError::Duplicate(c)) if c == "abc"));
        assert_eq!(s.tags_of(1).await.len(), 1);
        assert!(s.tag("abc").await.is_some());
    }

    #[tokio::test]
    async fn approving_payment_activates_subscription_once() {
        let (_dir, s) = fresh().await;
        let p = s.record_payment(100, Tier::Premium, 399, "r".into()).await.unwrap();
        assert!(s.subscription(100).await.is_none());

        let approved = s.approve_payment(p.id).await.unwrap().unwrap();
        assert_eq!(approved.status, PaymentStatus::Approved);
        assert_eq!(s.subscription(100).await.unwrap().tier, Tier::Premium);
        assert!(s.approve_payment(p.id).await.unwrap().is_none());

        assert!(s.deactivate_subscription(100).await.unwrap());
        assert!(s.subscription(100).await.is_none());
        assert!(!s.deactivate_subscription(100).await.unwrap());
    }

    #[tokio::test]
    async fn failed_write_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("not_yet");
        let s = Storage::new(nested.join("state.json")).await.unwrap();

        assert!(s.add_plan(plan(100, Place::Home, "2099-01-01")).await.is_err());
        assert!(s.add_plan(plan(100, Place::Home, "2099-01-01")).await.is_err());
        assert!(s.record_payment(100, Tier::Basic, 199, "r".into()).await.is_err());
        assert!(s.add_movie(10, movie(1)).await.is_err());

        let any_day = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap();
        assert!(s.upcoming_plans(10, any_day).await.is_empty());
        assert!(s.get(10).await.is_empty());

        // диск ожил: повтор даёт ровно одну запись и первые номера
        std::fs::create_dir(&nested).unwrap();
        let p = s.add_plan(plan(100, Place::Home, "2099-01-01")).await.unwrap();
        assert_eq!(p.id, 1);
        assert_eq!(s.upcoming_plans(10, any_day).await.len(), 1);
        assert_eq!(s.record_payment(100, Tier::Basic, 199, "r".into()).await.unwrap().id, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_all_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let s = Storage::new(&path).await.unwrap();

        let tasks: Vec<_> = (0..100i64)
            .map(|chat| {
                let s = s.clone();
                tokio::spawn(async move { s.add_movie(chat, movie(chat as u64)).await })
            })
            .collect();
        for t in tasks {
            assert!(t.await.unwrap().unwrap());
        }

        let reloaded = Storage::new(&path).await.unwrap();
        for chat in 0..100i64 {
            assert_eq!(reloaded.get(chat).await.len(), 1, "chat {chat}");
        }
    }
}
