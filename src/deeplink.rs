//! Короткие коды подборок и ссылки вида `https://t.me/<bot>?start=tag_<code>`.

use rand::Rng;

use crate::error::StorageError;
use crate::storage::{Storage, StoredMovie, Tag};

pub const CODE_LEN: usize = 8;
pub const MAX_ATTEMPTS: usize = 5;
const PREFIX: &str = "tag_";
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

pub fn generate_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..CODE_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

pub fn is_valid_code(code: &str) -> bool {
    code.len() == CODE_LEN && code.bytes().all(|b| ALPHABET.contains(&b))
}

pub fn link(bot_username: &str, code: &str) -> String {
    format!("https://t.me/{bot_username}?start={PREFIX}{code}")
}

/// Код подборки из параметра `/start`.
pub fn parse_start_payload(payload: &str) -> Option<&str> {
    payload.trim().strip_prefix(PREFIX).filter(|c| is_valid_code(c))
}

/// Сохраняет подборку под случайным свободным кодом.
pub async fn create_tag(storage: &Storage, owner: u64, name: String, movies: Vec<StoredMovie>) -> Result<Tag, StorageError> {
    create_tag_with(storage, owner, name, movies, MAX_ATTEMPTS, || {
        generate_code(&mut rand::thread_rng())
    })
    .await
}

pub async fn create_tag_with(
    storage: &Storage,
    owner: u64,
    name: String,
    movies: Vec<StoredMovie>,
    attempts: usize,
    mut next_code: impl FnMut() -> String + Send,
) -> Result<Tag, StorageError> {
    for attempt in 1..=attempts {
        let tag = Tag { code: next_code(), owner, name: name.clone(), movies: movies.clone() };
        match storage.insert_tag(tag).await {
            Ok(tag) => return Ok(tag),
            Err(StorageError::Duplicate(code)) => {
                tracing::debug!(attempt, code = %code, "short code collision");
            }
            Err(e) => return Err(e),
        }
    }
    Err(StorageError::CodeSpaceExhausted { attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use std::collections::HashSet;

    async fn storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let s = Storage::new(dir.path().join("s.json")).await.unwrap();
        (dir, s)
    }

    #[test]
    fn codes_are_url_safe_and_fixed_length() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..200 {
            let code = generate_code(&mut rng);
            assert!(is_valid_code(&code), "{code}");
        }
    }

    #[test]
    fn start_payload_round_trip() {
        let l = link("kino_bot", "Ab3_-xYz");
        assert_eq!(l, "https://t.me/kino_bot?start=tag_Ab3_-xYz");
        assert_eq!(parse_start_payload("tag_Ab3_-xYz"), Some("Ab3_-xYz"));
        assert_eq!(parse_start_payload("tag_short"), None);
        assert_eq!(parse_start_payload("ref_Ab3_-xYz"), None);
        assert_eq!(parse_start_payload(""), None);
    }

    #[tokio::test]
    async fn many_tags_never_share_a_code() {
        let (_dir, s) = storage().await;
        let mut seen = HashSet::new();
        for i in 0..100 {
            let tag = create_tag(&s, 1, format!("t{i}"), vec![]).await.unwrap();
            assert!(seen.insert(tag.code));
        }
    }

    #[tokio::test]
    async fn collision_is_retried() {
        let (_dir, s) = storage().await;
        create_tag_with(&s, 1, "a".into(), vec![], 1, || "AAAAAAAA".to_string()).await.unwrap();

        let mut codes = vec!["BBBBBBBB", "AAAAAAAA"];
        let tag = create_tag_with(&s, 1, "b".into(), vec![], 3, move || codes.pop().unwrap().to_string())
            .await
            .unwrap();
        assert_eq!(tag.code, "BBBBBBBB");
    }

    #[tokio::test]
    async fn gives_up_after_bounded_attempts() {
        let (_dir, s) = storage().await;
        create_tag_with(&s, 1, "a".into(), vec![], 1, || "AAAAAAAA".to_string()).await.unwrap();

        let mut calls = 0;
        let err = create_tag_with(&s, 1, "b".into(), vec![], MAX_ATTEMPTS, || {
            calls += 1;
            "AAAAAAAA".to_string()
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StorageError::CodeSpaceExhausted { attempts } if attempts == MAX_ATTEMPTS));
        assert_eq!(calls, MAX_ATTEMPTS);
        assert_eq!(s.tags_of(1).await.len(), 1);
    }
}
