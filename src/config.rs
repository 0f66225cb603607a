use std::{path::PathBuf, time::Duration};

use crate::conversation::{ConflictPolicy, Exclusivity, StorePolicy};

const DEFAULT_KINOPOISK_URL: &str = "https://kinopoiskapiunofficial.tech";
const DEFAULT_STORE_PATH: &str = "movie_bot_state.json";

#[derive(Debug, Clone)]
pub struct Config {
    pub kinopoisk_api_key: String,
    pub kinopoisk_base_url: String,
    pub store_path: PathBuf,
    pub bot_username: Option<String>,
    pub admin_ids: Vec<u64>,
    pub conversation_idle: Duration,
    pub sweep_every: Duration,
    pub on_conflict: ConflictPolicy,
    pub exclusivity: Exclusivity,
    pub poll_anonymous: bool,
    pub poll_multiple: bool,
}

/// Все отсутствующие и кривые переменные сразу, чтобы не чинить их по одной.
#[derive(Debug, Default, thiserror::Error)]
#[error("{}", describe(.missing, .invalid))]
pub struct ConfigError {
    pub missing: Vec<String>,
    pub invalid: Vec<(String, String)>,
}

fn describe(missing: &[String], invalid: &[(String, String)]) -> String {
    let mut lines = Vec::new();
    if !missing.is_empty() {
        lines.push(format!("missing environment variables: {}", missing.join(", ")));
    }
    lines.extend(invalid.iter().map(|(name, why)| format!("invalid {name}: {why}")));
    lines.join("\n")
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut err = ConfigError::default();
        let var = |name: &str| get(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let kinopoisk_api_key = var("KINOPOISK_API_KEY").unwrap_or_else(|| {
            err.missing.push("KINOPOISK_API_KEY".into());
            String::new()
        });

        let admin_ids = match var("ADMIN_IDS") {
            None => Vec::new(),
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .filter_map(|s| match s.parse::<u64>() {
                    Ok(id) => Some(id),
                    Err(e) => {
                        err.invalid.push(("ADMIN_IDS".into(), format!("{s}: {e}")));
                        None
                    }
                })
                .collect(),
        };

        let idle_minutes = parse_or(&var, "CONVERSATION_IDLE_MINUTES", 30u64, &mut err);
        let conversation_idle = match idle_minutes.checked_mul(60) {
            Some(secs) => Duration::from_secs(secs),
            None => {
                err.invalid.push(("CONVERSATION_IDLE_MINUTES".into(), format!("{idle_minutes} is too large")));
                Duration::ZERO
            }
        };
        let sweep_secs = parse_or(&var, "SWEEP_INTERVAL_SECS", 60u64, &mut err);
        let exclusive = parse_or(&var, "CONVERSATION_EXCLUSIVE", true, &mut err);
        let poll_anonymous = parse_or(&var, "POLL_ANONYMOUS", false, &mut err);
        let poll_multiple = parse_or(&var, "POLL_MULTIPLE", true, &mut err);

        let on_conflict = match var("CONVERSATION_CONFLICT").as_deref() {
            None | Some("replace") => ConflictPolicy::Replace,
            Some("reject") => ConflictPolicy::Reject,
            Some(other) => {
                err.invalid.push((
                    "CONVERSATION_CONFLICT".into(),
                    format!("expected replace|reject, got {other}"),
                ));
                ConflictPolicy::Replace
            }
        };

        if !err.missing.is_empty() || !err.invalid.is_empty() {
            return Err(err);
        }

        Ok(Self {
            kinopoisk_api_key,
            kinopoisk_base_url: var("KINOPOISK_BASE_URL")
                .unwrap_or_else(|| DEFAULT_KINOPOISK_URL.to_string()),
            store_path: var("STORE_PATH")
                .unwrap_or_else(|| DEFAULT_STORE_PATH.to_string())
                .into(),
            bot_username: var("BOT_USERNAME").map(|u| u.trim_start_matches('@').to_string()),
            admin_ids,
            conversation_idle,
            sweep_every: Duration::from_secs(sweep_secs.max(1)),
            on_conflict,
            exclusivity: if exclusive { Exclusivity::Exclusive } else { Exclusivity::PerKind },
            poll_anonymous,
            poll_multiple,
        })
    }

    pub fn store_policy(&self) -> StorePolicy {
        StorePolicy {
            on_conflict: self.on_conflict,
            exclusivity: self.exclusivity,
            idle_timeout: self.conversation_idle,
        }
    }
}

fn parse_or<T>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
    err: &mut ConfigError,
) -> T
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|e: T::Err| {
            err.invalid.push((name.to_string(), e.to_string()));
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_only_key_is_set() {
        let cfg = Config::from_lookup(lookup(&[("KINOPOISK_API_KEY", "k")])).unwrap();
        assert_eq!(cfg.kinopoisk_base_url, DEFAULT_KINOPOISK_URL);
        assert_eq!(cfg.conversation_idle, Duration::from_secs(30 * 60));
        assert_eq!(cfg.on_conflict, ConflictPolicy::Replace);
        assert_eq!(cfg.exclusivity, Exclusivity::Exclusive);
        assert!(cfg.admin_ids.is_empty());
        assert!(cfg.bot_username.is_none());
    }

    #[test]
    fn parses_overrides() {
        let cfg = Config::from_lookup(lookup(&[
            ("KINOPOISK_API_KEY", "k"),
            ("ADMIN_IDS", "1, 2,3"),
            ("CONVERSATION_IDLE_MINUTES", "5"),
            ("CONVERSATION_CONFLICT", "reject"),
            ("CONVERSATION_EXCLUSIVE", "false"),
            ("BOT_USERNAME", "@kino_bot"),
        ]))
        .unwrap();
        assert_eq!(cfg.admin_ids, vec![1, 2, 3]);
        assert_eq!(cfg.conversation_idle, Duration::from_secs(300));
        assert_eq!(cfg.on_conflict, ConflictPolicy::Reject);
        assert_eq!(cfg.exclusivity, Exclusivity::PerKind);
        assert_eq!(cfg.bot_username.as_deref(), Some("kino_bot"));
    }

    #[test]
    fn reports_every_problem_at_once() {
        let err = Config::from_lookup(lookup(&[
            ("ADMIN_IDS", "1,x"),
            ("CONVERSATION_IDLE_MINUTES", "soon"),
            ("CONVERSATION_CONFLICT", "merge"),
        ]))
        .unwrap_err();
        assert_eq!(err.missing, vec!["KINOPOISK_API_KEY".to_string()]);
        assert_eq!(err.invalid.len(), 3);
    }

    #[test]
    fn huge_idle_timeout_is_reported_instead_of_overflowing() {
        let huge = u64::MAX.to_string();
        let err = Config::from_lookup(lookup(&[
            ("KINOPOISK_API_KEY", "k"),
            ("CONVERSATION_IDLE_MINUTES", huge.as_str()),
        ]))
        .unwrap_err();
        assert!(err.missing.is_empty());
        assert_eq!(err.invalid.len(), 1);
        assert_eq!(err.invalid[0].0, "CONVERSATION_IDLE_MINUTES");
    }

    #[test]
    fn error_lists_missing_and_invalid_lines() {
        let err = Config::from_lookup(lookup(&[("POLL_MULTIPLE", "maybe")])).unwrap_err();
        let text = err.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "missing environment variables: KINOPOISK_API_KEY");
        assert!(lines[1].starts_with("invalid POLL_MULTIPLE: "));

        let boxed: Box<dyn std::error::Error> = Box::new(err);
        assert!(boxed.source().is_none());
    }
}
