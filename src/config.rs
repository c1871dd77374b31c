use crate::types::RETRIEVAL_K_RANGE;
use crate::util::{is_http_url, parse_bool_flag};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";
pub const DEFAULT_RELAY_ADDR: &str = "127.0.0.1:3000";
pub const DEFAULT_RELAY_URL: &str = "http://localhost:3000/api/chat";
pub const DEFAULT_RETRIEVAL_K: u8 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub backend_url: String,
    pub relay_addr: String,
    pub relay_url: String,
    pub default_retrieval_k: u8,
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            relay_addr: DEFAULT_RELAY_ADDR.to_string(),
            relay_url: DEFAULT_RELAY_URL.to_string(),
            default_retrieval_k: DEFAULT_RETRIEVAL_K,
            log_json: false,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let defaults = Self::default();
        let backend_url = non_empty_env("TUTOR_BACKEND_URL").unwrap_or(defaults.backend_url);
        let relay_addr = non_empty_env("TUTOR_RELAY_ADDR").unwrap_or(defaults.relay_addr);
        let relay_url = non_empty_env("TUTOR_RELAY_URL").unwrap_or(defaults.relay_url);
        let default_retrieval_k = match non_empty_env("TUTOR_RETRIEVAL_K") {
            Some(raw) => resolve_retrieval_k(&raw)?,
            None => defaults.default_retrieval_k,
        };
        let log_json = non_empty_env("TUTOR_LOG_JSON")
            .and_then(|raw| parse_bool_flag(&raw))
            .unwrap_or(defaults.log_json);

        Ok(Self {
            backend_url,
            relay_addr,
            relay_url,
            default_retrieval_k,
            log_json,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !is_http_url(&self.backend_url) {
            bail!(
                "Invalid TUTOR_BACKEND_URL '{}': expected http:// or https:// URL",
                self.backend_url
            );
        }
        if !is_http_url(&self.relay_url) {
            bail!(
                "Invalid TUTOR_RELAY_URL '{}': expected http:// or https:// URL",
                self.relay_url
            );
        }
        self.bind_addr()?;
        if !RETRIEVAL_K_RANGE.contains(&self.default_retrieval_k) {
            bail!(
                "Invalid default retrieval depth {}: expected {}..={}",
                self.default_retrieval_k,
                RETRIEVAL_K_RANGE.start(),
                RETRIEVAL_K_RANGE.end()
            );
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.relay_addr
            .parse()
            .with_context(|| format!("Invalid TUTOR_RELAY_ADDR '{}'", self.relay_addr))
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn resolve_retrieval_k(raw: &str) -> Result<u8> {
    let value: i64 = raw
        .trim()
        .parse()
        .with_context(|| format!("Invalid TUTOR_RETRIEVAL_K '{raw}': expected an integer"))?;
    let clamped = value.clamp(
        i64::from(*RETRIEVAL_K_RANGE.start()),
        i64::from(*RETRIEVAL_K_RANGE.end()),
    );
    Ok(u8::try_from(clamped)?)
}
