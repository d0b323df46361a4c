use crate::gateway_client::DEFAULT_CAPTURE_PATH;
use crate::trigger::{TriggerSettings, DEFAULT_DELAY, DEFAULT_SCROLL_DEPTH};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub lead_api_base_url: String,
    pub lead_capture_path: String,
    pub request_timeout_secs: u64,
    pub popup_delay_ms: u64,
    pub popup_scroll_depth: f64,
    pub popup_exit_intent: bool,
    pub storage_path: PathBuf,
    pub session_idle_secs: u64,
}

fn parse_bool(name: &str, raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("{} must be true or false", name),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            lead_api_base_url: std::env::var("LEAD_API_BASE_URL")
                .map_err(|_| anyhow::anyhow!("LEAD_API_BASE_URL environment variable required"))
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("LEAD_API_BASE_URL cannot be empty");
                    }
                    if !url.starts_with("http://") && !url.starts_with("https://") {
                        anyhow::bail!("LEAD_API_BASE_URL must start with http:// or https://");
                    }
                    Ok(url)
                })?,
            lead_capture_path: std::env::var("LEAD_CAPTURE_PATH")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CAPTURE_PATH.to_string()),
            request_timeout_secs: std::env::var("LEAD_REQUEST_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("LEAD_REQUEST_TIMEOUT_SECS must be a whole number"))?,
            popup_delay_ms: std::env::var("POPUP_DELAY_MS")
                .unwrap_or_else(|_| DEFAULT_DELAY.as_millis().to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("POPUP_DELAY_MS must be a whole number"))?,
            popup_scroll_depth: std::env::var("POPUP_SCROLL_DEPTH")
                .unwrap_or_else(|_| DEFAULT_SCROLL_DEPTH.to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("POPUP_SCROLL_DEPTH must be a number"))
                .and_then(|depth: f64| {
                    if !(0.0..=100.0).contains(&depth) {
                        anyhow::bail!("POPUP_SCROLL_DEPTH must be between 0 and 100");
                    }
                    Ok(depth)
                })?,
            popup_exit_intent: match std::env::var("POPUP_EXIT_INTENT") {
                Ok(raw) => parse_bool("POPUP_EXIT_INTENT", &raw)?,
                Err(_) => true,
            },
            storage_path: std::env::var("FUNNEL_STORAGE_PATH")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".digisoft/local_storage.json")),
            session_idle_secs: std::env::var("SESSION_IDLE_SECS")
                .unwrap_or_else(|_| "1800".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("SESSION_IDLE_SECS must be a whole number"))?,
        };

        tracing::info!("Configuration loaded successfully");
        tracing::debug!("Lead API: {}{}", config.lead_api_base_url, config.lead_capture_path);
        tracing::debug!("Storage file: {}", config.storage_path.display());

        Ok(config)
    }

    /// Configuration for a given API origin with every other value defaulted.
    pub fn for_base_url(base_url: impl Into<String>) -> Self {
        Self {
            lead_api_base_url: base_url.into(),
            lead_capture_path: DEFAULT_CAPTURE_PATH.to_string(),
            request_timeout_secs: 30,
            popup_delay_ms: DEFAULT_DELAY.as_millis() as u64,
            popup_scroll_depth: DEFAULT_SCROLL_DEPTH,
            popup_exit_intent: true,
            storage_path: PathBuf::from(".digisoft/local_storage.json"),
            session_idle_secs: 1800,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }

    pub fn trigger_settings(&self) -> TriggerSettings {
        TriggerSettings {
            delay: Duration::from_millis(self.popup_delay_ms),
            scroll_depth: self.popup_scroll_depth,
            exit_intent: self.popup_exit_intent,
            ..Default::default()
        }
    }
}
