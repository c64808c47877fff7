//! Service configuration, read from the environment (`.env` is loaded first by `main`).
//!
//! Optional integrations degrade instead of failing boot: without an OpenRouter key
//! the chat answers with a configuration message and extraction is disabled, and
//! without Supabase credentials the service keeps its data in memory.

use anyhow::{Context, Result};
use std::time::Duration;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_PUBLIC_BASE_URL: &str = "http://localhost:3000";
const DEFAULT_OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const DEFAULT_MODEL: &str = "google/gemini-2.5-flash";
const DEFAULT_SUPABASE_SCHEMA: &str = "public";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub public_base_url: String,
    pub llm: Option<LlmSettings>,
    pub store: StoreSettings,
    pub extraction: ExtractionSettings,
    pub session_idle: Duration,
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub api_url: String,
    pub api_key: String,
    pub chat_model: String,
    pub extraction_model: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreSettings {
    Supabase {
        base_url: String,
        service_role_key: String,
        schema: String,
    },
    Memory,
}

/// How much of the conversation the lead extractor looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionSettings {
    /// Trailing turns sent to the extractor.
    pub window: usize,
    /// Below this many turns in the window, extraction is skipped.
    pub min_turns: usize,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            window: 4,
            min_turns: 2,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let llm = get("OPENROUTER_API_KEY").map(|api_key| {
            let chat_model = get("CHAT_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());
            LlmSettings {
                api_url: get("OPENROUTER_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_OPENROUTER_API_URL.to_string()),
                api_key,
                extraction_model: get("EXTRACTION_MODEL").unwrap_or_else(|| chat_model.clone()),
                chat_model,
            }
        });

        let store = match (get("SUPABASE_URL"), get("SUPABASE_SERVICE_ROLE_KEY")) {
            (Some(base_url), Some(service_role_key)) => StoreSettings::Supabase {
                base_url: base_url.trim_end_matches('/').to_string(),
                service_role_key,
                schema: get("SUPABASE_SCHEMA")
                    .unwrap_or_else(|| DEFAULT_SUPABASE_SCHEMA.to_string()),
            },
            _ => StoreSettings::Memory,
        };

        let defaults = ExtractionSettings::default();
        let extraction = ExtractionSettings {
            window: parse_or(&get, "EXTRACTION_WINDOW", defaults.window)?,
            min_turns: parse_or(&get, "EXTRACTION_MIN_TURNS", defaults.min_turns)?,
        };
        if extraction.min_turns == 0 || extraction.min_turns > extraction.window {
            anyhow::bail!(
                "EXTRACTION_MIN_TURNS must be between 1 and EXTRACTION_WINDOW ({})",
                extraction.window
            );
        }

        let idle_secs: u64 = parse_or(&get, "SESSION_IDLE_SECS", 3600)?;
        if idle_secs == 0 {
            anyhow::bail!("SESSION_IDLE_SECS must be greater than zero");
        }
        let session_idle = Duration::from_secs(idle_secs);

        Ok(Self {
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            public_base_url: get("PUBLIC_BASE_URL")
                .unwrap_or_else(|| DEFAULT_PUBLIC_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            llm,
            store,
            extraction,
            session_idle,
        })
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert!(config.llm.is_none());
        assert_eq!(config.store, StoreSettings::Memory);
        assert_eq!(config.extraction, ExtractionSettings { window: 4, min_turns: 2 });
        assert_eq!(config.session_idle, Duration::from_secs(3600));
    }

    #[test]
    fn test_llm_and_supabase_settings() {
        let config = AppConfig::from_lookup(lookup(&[
            ("OPENROUTER_API_KEY", "sk-test"),
            ("CHAT_MODEL", "openai/gpt-4o-mini"),
            ("SUPABASE_URL", "https://x.supabase.co/"),
            ("SUPABASE_SERVICE_ROLE_KEY", "service"),
            ("PUBLIC_BASE_URL", "https://chat.onzy.com/"),
        ]))
        .unwrap();

        let llm = config.llm.unwrap();
        assert_eq!(llm.api_key, "sk-test");
        assert_eq!(llm.chat_model, "openai/gpt-4o-mini");
        assert_eq!(llm.extraction_model, "openai/gpt-4o-mini");
        assert_eq!(
            config.store,
            StoreSettings::Supabase {
                base_url: "https://x.supabase.co".to_string(),
                service_role_key: "service".to_string(),
                schema: "public".to_string(),
            }
        );
        assert_eq!(config.public_base_url, "https://chat.onzy.com");
    }

    #[test]
    fn test_blank_key_disables_llm() {
        let config = AppConfig::from_lookup(lookup(&[("OPENROUTER_API_KEY", "   ")])).unwrap();
        assert!(config.llm.is_none());
    }

    #[test]
    fn test_partial_supabase_falls_back_to_memory() {
        let config = AppConfig::from_lookup(lookup(&[("SUPABASE_URL", "https://x.supabase.co")])).unwrap();
        assert_eq!(config.store, StoreSettings::Memory);
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        assert!(AppConfig::from_lookup(lookup(&[("EXTRACTION_WINDOW", "four")])).is_err());
        assert!(AppConfig::from_lookup(lookup(&[("EXTRACTION_MIN_TURNS", "9")])).is_err());
        assert!(AppConfig::from_lookup(lookup(&[("EXTRACTION_MIN_TURNS", "0")])).is_err());
        assert!(AppConfig::from_lookup(lookup(&[("SESSION_IDLE_SECS", "0")])).is_err());
    }
}
