use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_DATABASE_URL: &str = "sqlite:gac_consensus.db";
const DEFAULT_INTERVAL_SECONDS: u64 = 60;
const DEFAULT_CONSTITUTIONABLE_THRESHOLD: f64 = 0.66;
const DEFAULT_KMEANS_SEED: u64 = 42;
const DEFAULT_WEBHOOK_MAX_AGE_SECONDS: u64 = 5 * 60;

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub secret: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub interval: Duration,
    pub constitutionable_threshold: f64,
    pub kmeans_seed: u64,
    /// Outgoing notifications; `None` unless both URL and secret are set.
    pub webhook: Option<WebhookConfig>,
    pub webhook_max_age: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECONDS),
            constitutionable_threshold: DEFAULT_CONSTITUTIONABLE_THRESHOLD,
            kmeans_seed: DEFAULT_KMEANS_SEED,
            webhook: None,
            webhook_max_age: Duration::from_secs(DEFAULT_WEBHOOK_MAX_AGE_SECONDS),
        }
    }
}

impl Config {
    /// Reads the process environment. Call `dotenvy::dotenv()` first to pick up `.env`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let database_url = lookup("DATABASE_URL").unwrap_or(defaults.database_url);
        let interval_secs = parse_var(&lookup, "GAC_INTERVAL_SECONDS", DEFAULT_INTERVAL_SECONDS)?;
        if interval_secs == 0 {
            return Err(invalid("GAC_INTERVAL_SECONDS", "0", "must be at least 1"));
        }

        let threshold = parse_var(&lookup, "CONSTITUTIONABLE_THRESHOLD", DEFAULT_CONSTITUTIONABLE_THRESHOLD)?;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(invalid(
                "CONSTITUTIONABLE_THRESHOLD",
                &threshold.to_string(),
                "must be between 0 and 1",
            ));
        }

        let kmeans_seed = parse_var(&lookup, "KMEANS_SEED", DEFAULT_KMEANS_SEED)?;
        let max_age = parse_var(&lookup, "WEBHOOK_MAX_AGE_SECONDS", DEFAULT_WEBHOOK_MAX_AGE_SECONDS)?;

        let webhook = match (lookup("WEBHOOK_URL"), lookup("WEBHOOK_SECRET")) {
            (Some(url), Some(secret)) if !url.is_empty() && !secret.is_empty() => {
                Some(WebhookConfig { url, secret })
            }
            _ => None,
        };

        Ok(Self {
            database_url,
            interval: Duration::from_secs(interval_secs),
            constitutionable_threshold: threshold,
            kmeans_seed,
            webhook,
            webhook_max_age: Duration::from_secs(max_age),
        })
    }
}

fn parse_var<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| invalid(name, &raw, &e.to_string())),
    }
}

fn invalid(name: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.interval, Duration::from_secs(60));
        assert_eq!(config.constitutionable_threshold, 0.66);
        assert_eq!(config.kmeans_seed, 42);
        assert!(config.webhook.is_none());
    }

    #[test]
    fn webhook_needs_url_and_secret() {
        let only_url = Config::from_lookup(lookup_from(&[("WEBHOOK_URL", "https://example.org/hook")])).unwrap();
        assert!(only_url.webhook.is_none());

        let both = Config::from_lookup(lookup_from(&[
            ("WEBHOOK_URL", "https://example.org/hook"),
            ("WEBHOOK_SECRET", "s3cret"),
        ]))
        .unwrap();
        let webhook = both.webhook.unwrap();
        assert_eq!(webhook.url, "https://example.org/hook");
        assert_eq!(webhook.secret, "s3cret");
    }

    #[test]
    fn rejects_bad_numbers() {
        let err = Config::from_lookup(lookup_from(&[("GAC_INTERVAL_SECONDS", "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "GAC_INTERVAL_SECONDS", .. }));

        let err = Config::from_lookup(lookup_from(&[("CONSTITUTIONABLE_THRESHOLD", "1.5")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "CONSTITUTIONABLE_THRESHOLD", .. }));
    }
}
