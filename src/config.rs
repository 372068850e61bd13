use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::util::{env_non_empty, env_parse_clamped, is_local_endpoint_url};

pub const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1/messages";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatMode {
    /// Tools are offered to the model and executed.
    Agent,
    /// Plain chat; no tool catalog is sent.
    Normal,
}

impl ChatMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "agent" | "tools" => Some(Self::Agent),
            "normal" | "chat" => Some(Self::Normal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api_key: Option<String>,
    pub model: String,
    pub api_url: String,
    pub anthropic_version: String,
    pub max_tokens: u32,
    pub data_dir: PathBuf,
    pub working_dir: PathBuf,
    pub chat_mode: ChatMode,
    pub tool_timeout: Duration,
    pub max_tool_rounds: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        let api_url =
            env_non_empty("THREADLOOP_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let local = is_local_endpoint_url(&api_url);

        let chat_mode = match env_non_empty("THREADLOOP_CHAT_MODE") {
            Some(value) => ChatMode::parse(&value)
                .with_context(|| format!("Invalid THREADLOOP_CHAT_MODE '{value}': expected agent or normal"))?,
            None => ChatMode::Agent,
        };

        let data_dir = match env_non_empty("THREADLOOP_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_dir()
                .context("could not determine a data directory; set THREADLOOP_DATA_DIR")?
                .join("threadloop"),
        };

        Ok(Self {
            api_key: env_non_empty("ANTHROPIC_API_KEY"),
            model: env_non_empty("THREADLOOP_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            anthropic_version: env_non_empty("ANTHROPIC_VERSION")
                .unwrap_or_else(|| "2023-06-01".to_string()),
            max_tokens: env_parse_clamped(
                "THREADLOOP_MAX_TOKENS",
                if local { 1024 } else { 4096 },
                128,
                8192,
            ),
            data_dir,
            working_dir: std::env::current_dir()?,
            chat_mode,
            tool_timeout: Duration::from_secs(env_parse_clamped(
                "THREADLOOP_TOOL_TIMEOUT_SECS",
                if local { 60 } else { 30 },
                2,
                300,
            )),
            max_tool_rounds: env_parse_clamped(
                "THREADLOOP_MAX_TOOL_ROUNDS",
                if local { 12 } else { 24 },
                1,
                64,
            ),
            api_url,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            bail!(
                "Invalid THREADLOOP_API_URL '{}': expected http:// or https:// URL",
                self.api_url
            );
        }

        let local_endpoint = self.is_local_endpoint();
        if !local_endpoint && self.api_key.is_none() {
            bail!(
                "ANTHROPIC_API_KEY must be set for non-local endpoints (url: '{}')",
                self.api_url
            );
        }

        if !local_endpoint && self.model.starts_with("local/") {
            bail!("Local models are only allowed for localhost endpoints");
        }

        Ok(())
    }

    pub fn is_local_endpoint(&self) -> bool {
        is_local_endpoint_url(&self.api_url)
    }
}
