use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context};
use client_core::{
    ClientConfig, HttpMenuApi, MenuScope, StaticToken, TokenFile, TokenSource, UndoPolicy,
};
use serde::Deserialize;
use shared::domain::{MenuId, RestaurantId};
use url::Url;

const DEFAULT_CONFIG_FILE: &str = "menu_admin.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub api_url: String,
    pub restaurant_id: String,
    pub menu_id: Option<String>,
    pub token: Option<String>,
    pub token_path: Option<PathBuf>,
    pub undo_capacity: usize,
    /// `0` keeps undo entries until they are pushed out by capacity.
    pub undo_ttl_seconds: i64,
    /// `0` leaves the transport default in place.
    pub request_timeout_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8080".into(),
            restaurant_id: String::new(),
            menu_id: None,
            token: None,
            token_path: None,
            undo_capacity: 50,
            undo_ttl_seconds: 30 * 60,
            request_timeout_seconds: 0,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    api_url: Option<String>,
    restaurant_id: Option<String>,
    menu_id: Option<String>,
    token: Option<String>,
    token_path: Option<PathBuf>,
    undo_capacity: Option<usize>,
    undo_ttl_seconds: Option<i64>,
    request_timeout_seconds: Option<u64>,
}

/// Defaults, then the TOML file, then environment variables.
///
/// An explicitly requested config file must exist; the default
/// `menu_admin.toml` is optional.
pub fn load_settings(config_path: Option<&Path>) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    let raw = match config_path {
        Some(path) => Some(
            fs::read_to_string(path)
                .with_context(|| format!("failed to read config file '{}'", path.display()))?,
        ),
        None => fs::read_to_string(DEFAULT_CONFIG_FILE).ok(),
    };
    if let Some(raw) = raw {
        apply_file(&mut settings, &raw)?;
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn apply_file(settings: &mut Settings, raw: &str) -> anyhow::Result<()> {
    let file: FileSettings = toml::from_str(raw).context("invalid config file")?;
    if let Some(v) = file.api_url {
        settings.api_url = v;
    }
    if let Some(v) = file.restaurant_id {
        settings.restaurant_id = v;
    }
    if let Some(v) = file.menu_id {
        settings.menu_id = Some(v);
    }
    if let Some(v) = file.token {
        settings.token = Some(v);
    }
    if let Some(v) = file.token_path {
        settings.token_path = Some(v);
    }
    if let Some(v) = file.undo_capacity {
        settings.undo_capacity = v;
    }
    if let Some(v) = file.undo_ttl_seconds {
        settings.undo_ttl_seconds = v;
    }
    if let Some(v) = file.request_timeout_seconds {
        settings.request_timeout_seconds = v;
    }
    Ok(())
}

fn apply_env(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("MENU_API_URL") {
        settings.api_url = v;
    }
    if let Some(v) = var("APP__API_URL") {
        settings.api_url = v;
    }

    if let Some(v) = var("MENU_RESTAURANT_ID") {
        settings.restaurant_id = v;
    }
    if let Some(v) = var("APP__RESTAURANT_ID") {
        settings.restaurant_id = v;
    }

    if let Some(v) = var("APP__MENU_ID") {
        settings.menu_id = Some(v);
    }

    if let Some(v) = var("MENU_TOKEN") {
        settings.token = Some(v);
    }
    if let Some(v) = var("APP__TOKEN") {
        settings.token = Some(v);
    }
    if let Some(v) = var("APP__TOKEN_PATH") {
        settings.token_path = Some(PathBuf::from(v));
    }

    if let Some(parsed) = var("APP__UNDO_CAPACITY").and_then(|v| v.parse().ok()) {
        settings.undo_capacity = parsed;
    }
    if let Some(parsed) = var("APP__UNDO_TTL_SECONDS").and_then(|v| v.parse().ok()) {
        settings.undo_ttl_seconds = parsed;
    }
    if let Some(parsed) = var("APP__REQUEST_TIMEOUT_SECONDS").and_then(|v| v.parse().ok()) {
        settings.request_timeout_seconds = parsed;
    }
}

impl Settings {
    pub fn validate(&self) -> anyhow::Result<Url> {
        let url = Url::parse(&self.api_url)
            .with_context(|| format!("invalid api url '{}'", self.api_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("api url '{}' must use http or https", self.api_url);
        }
        if self.restaurant_id.trim().is_empty() {
            bail!("no restaurant id configured (MENU_RESTAURANT_ID or --restaurant-id)");
        }
        if self.token.is_none() && self.token_path.is_none() {
            bail!("no bearer token configured (MENU_TOKEN, APP__TOKEN_PATH or --token)");
        }
        if self.undo_capacity == 0 {
            bail!("undo capacity must be at least 1");
        }
        // 0 disables expiry; anything else must fit a chrono duration.
        if self.undo_ttl_seconds != 0 && self.undo_ttl().is_none() {
            bail!(
                "undo ttl of {} seconds is out of range",
                self.undo_ttl_seconds
            );
        }
        Ok(url)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            scope: MenuScope {
                restaurant_id: RestaurantId::from(self.restaurant_id.trim()),
                menu_id: self.menu_id.as_deref().map(MenuId::from),
            },
            undo: UndoPolicy {
                capacity: self.undo_capacity,
                ttl: self.undo_ttl(),
            },
        }
    }

    fn undo_ttl(&self) -> Option<chrono::Duration> {
        if self.undo_ttl_seconds <= 0 {
            return None;
        }
        chrono::Duration::try_seconds(self.undo_ttl_seconds)
    }

    fn token_source(&self) -> Box<dyn TokenSource> {
        // A literal token wins over the token file.
        match (&self.token, &self.token_path) {
            (Some(token), _) => Box::new(StaticToken(token.clone())),
            (None, Some(path)) => Box::new(TokenFile(path.clone())),
            (None, None) => Box::new(StaticToken(String::new())),
        }
    }

    pub fn menu_api(&self) -> anyhow::Result<HttpMenuApi> {
        let url = self.validate()?;
        let timeout = (self.request_timeout_seconds > 0)
            .then(|| Duration::from_secs(self.request_timeout_seconds));
        HttpMenuApi::new(
            url.as_str(),
            RestaurantId::from(self.restaurant_id.trim()),
            self.token_source(),
            timeout,
        )
        .context("failed to build http client")
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
