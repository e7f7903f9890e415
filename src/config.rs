use std::path::PathBuf;

use anyhow::{Context, Result};
use url::Url;

pub const APP_ID: &str = "com.parley.Parley";

/// Title given to freshly created conversations. A conversation still carrying
/// it gets a derived title on the next message.
pub const DEFAULT_TITLE: &str = "New Conversation";

/// Maximum number of characters kept by `derive_title` before the ellipsis.
pub const TITLE_MAX_CHARS: usize = 30;

pub const TITLE_ELLIPSIS: &str = "…";

/// Stored as the assistant turn when the responder answers with nothing.
pub const EMPTY_REPLY_FALLBACK: &str = "I'm sorry, I couldn't process that request.";

/// Stored as the assistant turn when the responder call fails.
pub const RESPONDER_FAILURE_REPLY: &str =
    "I'm sorry, I encountered an error. Please try again later.";

const ENV_RESPONDER_URL: &str = "PARLEY_RESPONDER_URL";
const ENV_DATABASE: &str = "PARLEY_DATABASE";
const ENV_USER_ID: &str = "PARLEY_USER_ID";

const DEFAULT_RESPONDER_URL: &str = "http://127.0.0.1:5678/webhook/parley";
const DEFAULT_USER_ID: &str = "local";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub responder_url: Url,
    pub database_path: PathBuf,
    pub user_id: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw_url = lookup(ENV_RESPONDER_URL).unwrap_or_else(|| DEFAULT_RESPONDER_URL.to_string());
        let responder_url = Url::parse(&raw_url)
            .with_context(|| format!("{} is not a valid URL: {}", ENV_RESPONDER_URL, raw_url))?;
        if !matches!(responder_url.scheme(), "http" | "https") {
            anyhow::bail!(
                "{} must use http or https, got {}",
                ENV_RESPONDER_URL,
                responder_url.scheme()
            );
        }

        let database_path = match lookup(ENV_DATABASE) {
            Some(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => Self::default_database_path(&lookup)?,
        };

        let user_id = lookup(ENV_USER_ID)
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| DEFAULT_USER_ID.to_string());

        Ok(Self {
            responder_url,
            database_path,
            user_id,
        })
    }

    fn default_database_path<F>(lookup: &F) -> Result<PathBuf>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = match lookup("XDG_DATA_HOME") {
            Some(dir) => PathBuf::from(dir),
            None => {
                let home = lookup("HOME").context("Neither XDG_DATA_HOME nor HOME is set")?;
                PathBuf::from(home).join(".local/share")
            }
        };
        Ok(data_dir.join("parley").join("parley.db"))
    }
}
