use moka::future::Cache;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use crate::error::CatalogError;

static FILM_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)kinopoisk\.ru/(?:film|series)/(\d+)").expect("valid film link regex")
});

#[derive(Clone)]
pub struct KinopoiskClient {
    api_key: String,
    base_url: String,
    http: Client,
    films: Cache<u64, Film>,
}

impl KinopoiskClient {
    pub fn new(api_key: String, base_url: impl Into<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            films: Cache::builder()
                .max_capacity(2_000)
                .time_to_live(Duration::from_secs(6 * 3600))
                .build(),
        }
    }

    /// Поиск по ключевому слову, максимум `limit` (1..10).
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<Film>, CatalogError> {
        let url = format!(
            "{}/api/v2.1/films/search-by-keyword?keyword={}&page=1",
            self.base_url,
            urlencoding::encode(query)
        );
        let resp = self.http.get(url).header("X-API-KEY", &self.api_key).send().await?;
        // пустой список значит «ничего не нашлось», сбой API так не маскируем
        if !resp.status().is_success() {
            return Err(CatalogError::Status(resp.status()));
        }
        let data: SearchResp = resp.json().await?;
        Ok(data.films.into_iter().take(limit.clamp(1, 10)).map(Film::from).collect())
    }

    /// Детали фильма; `None`, если такого id на Кинопоиске нет.
    pub async fn film(&self, id: u64) -> Result<Option<Film>, CatalogError> {
        if let Some(hit) = self.films.get(&id).await {
            return Ok(Some(hit));
        }
        let url = format!("{}/api/v2.2/films/{}", self.base_url, id);
        let resp = self.http.get(url).header("X-API-KEY", &self.api_key).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => return Ok(None),
            s if !s.is_success() => return Err(CatalogError::Status(s)),
            _ => {}
        }
        let film = Film::from(resp.json::<FilmResp>().await?);
        self.films.insert(id, film.clone()).await;
        Ok(Some(film))
    }
}

/// Ссылка на фильм/сериал Кинопоиска или просто его id.
pub fn parse_film_ref(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(c) = FILM_LINK.captures(s) {
        return c[1].parse().ok();
    }
    if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) {
        return s.parse().ok();
    }
    None
}

/// Все фильмы из вставленного текста, без повторов, в исходном порядке.
pub fn parse_film_refs(text: &str) -> Vec<u64> {
    let mut out: Vec<u64> = Vec::new();
    for token in text.split(|c: char| c.is_whitespace() || c == ',' || c == ';') {
        if let Some(id) = parse_film_ref(token) {
            if !out.contains(&id) {
                out.push(id);
            }
        }
    }
    out
}

pub fn film_url(id: u64) -> String {
    format!("https://www.kinopoisk.ru/film/{id}/")
}

/* ======= DTOs ======= */

#[derive(Debug, Clone, PartialEq)]
pub struct Film {
    pub id: u64,
    pub title: String,
    pub original_title: Option<String>,
    pub year: Option<i32>,
    pub description: Option<String>,
    pub poster_url: Option<String>,
    pub rating: Option<f64>,
    pub serial: bool,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct FilmResp {
    kinopoisk_id: u64,
    name_ru: Option<String>,
    name_original: Option<String>,
    name_en: Option<String>,
    year: Option<i32>,
    description: Option<String>,
    poster_url: Option<String>,
    rating_kinopoisk: Option<f64>,
    serial: Option<bool>,
}

impl From<FilmResp> for Film {
    fn from(r: FilmResp) -> Self {
        let original = r.name_original.or(r.name_en);
        Film {
            id: r.kinopoisk_id,
            title: r
                .name_ru
                .or_else(|| original.clone())
                .unwrap_or_else(|| format!("#{}", r.kinopoisk_id)),
            original_title: original,
            year: r.year,
            description: r.description,
            poster_url: r.poster_url,
            rating: r.rating_kinopoisk,
            serial: r.serial.unwrap_or(false),
        }
    }
}

#[derive(Deserialize, Debug)]
struct SearchResp {
    #[serde(default)]
    films: Vec<SearchFilm>,
}

// в v2.1 год и рейтинг приходят строками, иногда "null"
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SearchFilm {
    film_id: u64,
    name_ru: Option<String>,
    name_en: Option<String>,
    year: Option<String>,
    description: Option<String>,
    rating: Option<String>,
    poster_url: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

impl From<SearchFilm> for Film {
    fn from(r: SearchFilm) -> Self {
        Film {
            id: r.film_id,
            title: r
                .name_ru
                .or_else(|| r.name_en.clone())
                .unwrap_or_else(|| format!("#{}", r.film_id)),
            original_title: r.name_en,
            year: r.year.and_then(|y| y.parse().ok()),
            description: r.description,
            poster_url: r.poster_url,
            rating: r.rating.and_then(|v| v.parse().ok()),
            serial: matches!(r.kind.as_deref(), Some("TV_SERIES" | "MINI_SERIES" | "TV_SHOW")),
        }
    }
}
