use std::{collections::HashMap, fs};

use serde::Deserialize;

use crate::presence::DEFAULT_WATCH_INTERVAL;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server_url: String,
    pub presence_interval_secs: u64,
    pub history_page_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5000".into(),
            presence_interval_secs: DEFAULT_WATCH_INTERVAL.as_secs(),
            history_page_size: 100,
        }
    }
}

/// Defaults, then `client.toml`, then environment variables, last one wins.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("client.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            apply_file_overrides(&mut settings, &file_cfg);
        }
    }

    if let Ok(v) = std::env::var("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("APP__PRESENCE_INTERVAL_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.presence_interval_secs = parsed;
        }
    }
    if let Ok(v) = std::env::var("APP__HISTORY_PAGE_SIZE") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.history_page_size = parsed;
        }
    }

    settings.server_url = normalize_server_url(&settings.server_url);
    settings
}

fn apply_file_overrides(settings: &mut Settings, file_cfg: &HashMap<String, String>) {
    if let Some(v) = file_cfg.get("server_url") {
        settings.server_url = v.clone();
    }
    if let Some(v) = file_cfg.get("presence_interval_secs") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.presence_interval_secs = parsed;
        }
    }
    if let Some(v) = file_cfg.get("history_page_size") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.history_page_size = parsed;
        }
    }
}

/// Empty urls fall back to the default; a trailing slash would otherwise
/// produce `//api/...` paths.
pub fn normalize_server_url(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return Settings::default().server_url;
    }
    raw.trim_end_matches('/').to_string()
}
