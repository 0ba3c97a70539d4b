//! Relay configuration loader.

use relay_assistant::{CliConfig, MAX_PROMPT_CHARS};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DISCORD_MESSAGE_MAX_CHARS: usize = 2_000;
/// Room for `(i/total) ` up to 999 chunks.
const CHUNK_PREFIX_RESERVE_CHARS: usize = 10;
const MAX_CHUNK_LIMIT: usize = DISCORD_MESSAGE_MAX_CHARS - CHUNK_PREFIX_RESERVE_CHARS;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    /// Characters per outbound chunk. Kept under Discord's 2000 so the
    /// `(i/total) ` prefix still fits.
    #[serde(default = "default_chunk_limit")]
    pub chunk_limit: usize,
}

fn default_max_concurrent() -> usize {
    3
}

fn default_cooldown_ms() -> u64 {
    3_000
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

fn default_max_message_chars() -> usize {
    MAX_PROMPT_CHARS
}

fn default_chunk_limit() -> usize {
    1_900
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            cooldown_ms: default_cooldown_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            max_message_chars: default_max_message_chars(),
            chunk_limit: default_chunk_limit(),
        }
    }
}

impl DispatchConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantConfig {
    #[serde(default = "default_cli_program")]
    pub cli_program: String,
    #[serde(default)]
    pub cli_extra_args: Vec<String>,
    #[serde(default = "default_invoke_timeout_ms")]
    pub cli_timeout_ms: u64,
    #[serde(default = "default_invoke_timeout_ms")]
    pub sdk_timeout_ms: u64,
    /// The SDK path is used only when this is set and an API key is present.
    #[serde(default = "default_sdk_enabled")]
    pub sdk_enabled: bool,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

fn default_cli_program() -> String {
    "claude".to_string()
}

fn default_invoke_timeout_ms() -> u64 {
    15_000
}

fn default_sdk_enabled() -> bool {
    true
}

fn default_model() -> String {
    "claude-sonnet-4-5".to_string()
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            cli_program: default_cli_program(),
            cli_extra_args: Vec::new(),
            cli_timeout_ms: default_invoke_timeout_ms(),
            sdk_timeout_ms: default_invoke_timeout_ms(),
            sdk_enabled: default_sdk_enabled(),
            model: default_model(),
            system_prompt: None,
            working_dir: None,
        }
    }
}

impl AssistantConfig {
    pub fn sdk_timeout(&self) -> Duration {
        Duration::from_millis(self.sdk_timeout_ms)
    }

    pub fn cli_config(&self) -> CliConfig {
        CliConfig {
            program: self.cli_program.clone(),
            extra_args: self.cli_extra_args.clone(),
            timeout: Duration::from_millis(self.cli_timeout_ms),
            working_dir: self.working_dir.as_deref().map(expand_home),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    pub anthropic_api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub discord: DiscordConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_require_mention")]
    pub require_mention_in_group_chats: bool,
    /// Empty means every channel the bot can see.
    #[serde(default)]
    pub allowed_channel_ids: Vec<String>,
}

fn default_require_mention() -> bool {
    true
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            require_mention_in_group_chats: default_require_mention(),
            allowed_channel_ids: Vec::new(),
        }
    }
}

impl RelayConfig {
    /// Loads `path`, or the default location when `None`. A missing default
    /// file yields built-in defaults so env-only deployments still start.
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(default_config_path);

        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::parse(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
                tracing::info!(
                    config_path = %path.display(),
                    "no config file found; using defaults and environment"
                );
                Self::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_env_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_empty("DISCORD_BOT_TOKEN").or_else(|| non_empty("DISCORD_TOKEN")) {
            self.channels.discord.bot_token = v;
            self.channels.discord.enabled = true;
        }
        if let Some(v) = non_empty("ANTHROPIC_API_KEY") {
            self.keys.anthropic_api_key = Some(v);
        }
        if let Some(v) = non_empty("CLAUDE_BIN") {
            self.assistant.cli_program = v;
        }
        if let Some(v) = non_empty("RELAY_MAX_CONCURRENT") {
            match v.trim().parse() {
                Ok(n) => self.dispatch.max_concurrent = n,
                Err(e) => tracing::warn!(%e, value = %v, "ignoring invalid RELAY_MAX_CONCURRENT"),
            }
        }
        if let Some(v) = non_empty("RELAY_COOLDOWN_MS") {
            match v.trim().parse() {
                Ok(n) => self.dispatch.cooldown_ms = n,
                Err(e) => tracing::warn!(%e, value = %v, "ignoring invalid RELAY_COOLDOWN_MS"),
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let d = &self.dispatch;
        if d.max_concurrent == 0 {
            return Err(anyhow::anyhow!("dispatch.max_concurrent must be > 0"));
        }
        if d.cooldown_ms == 0 {
            return Err(anyhow::anyhow!("dispatch.cooldown_ms must be > 0"));
        }
        if d.sweep_interval_ms == 0 {
            return Err(anyhow::anyhow!("dispatch.sweep_interval_ms must be > 0"));
        }
        if d.max_message_chars == 0 || d.max_message_chars > MAX_PROMPT_CHARS {
            return Err(anyhow::anyhow!(
                "dispatch.max_message_chars must be between 1 and {MAX_PROMPT_CHARS}"
            ));
        }
        if d.chunk_limit == 0 || d.chunk_limit > MAX_CHUNK_LIMIT {
            return Err(anyhow::anyhow!(
                "dispatch.chunk_limit must be between 1 and {MAX_CHUNK_LIMIT}"
            ));
        }

        let a = &self.assistant;
        if a.cli_program.trim().is_empty() {
            return Err(anyhow::anyhow!("assistant.cli_program is required"));
        }
        if a.cli_timeout_ms == 0 || a.sdk_timeout_ms == 0 {
            return Err(anyhow::anyhow!(
                "assistant.cli_timeout_ms and assistant.sdk_timeout_ms must be > 0"
            ));
        }
        if a.sdk_enabled && a.model.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "assistant.model is required when the sdk path is enabled"
            ));
        }

        let discord = &self.channels.discord;
        if discord.enabled && discord.bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "channels.discord.bot_token is required when discord is enabled"
            ));
        }
        Ok(())
    }

    /// API key for the SDK path, if the path is enabled and a key is set.
    pub fn sdk_api_key(&self) -> Option<&str> {
        if !self.assistant.sdk_enabled {
            return None;
        }
        self.keys
            .anthropic_api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".claude-relay").join("config.toml")
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Path::new(&home).join(rest);
        }
    }
    PathBuf::from(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_file_uses_documented_defaults() {
        let cfg = RelayConfig::parse("").unwrap();
        assert_eq!(cfg.dispatch.max_concurrent, 3);
        assert_eq!(cfg.dispatch.cooldown_ms, 3_000);
        assert_eq!(cfg.dispatch.sweep_interval_ms, 60_000);
        assert_eq!(cfg.dispatch.max_message_chars, 4_000);
        assert_eq!(cfg.assistant.cli_timeout_ms, 15_000);
        assert_eq!(cfg.assistant.sdk_timeout_ms, 15_000);
        assert_eq!(cfg.assistant.cli_program, "claude");
        assert!(cfg.channels.discord.require_mention_in_group_chats);
        cfg.validate().unwrap();
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let cfg = RelayConfig::parse(
            r#"
[dispatch]
max_concurrent = 5

[assistant]
cli_extra_args = ["--model", "sonnet"]
"#,
        )
        .unwrap();
        assert_eq!(cfg.dispatch.max_concurrent, 5);
        assert_eq!(cfg.dispatch.cooldown_ms, 3_000);
        let cli = cfg.assistant.cli_config();
        assert_eq!(cli.extra_args, vec!["--model", "sonnet"]);
        assert_eq!(cli.timeout, Duration::from_millis(15_000));
    }

    #[test]
    fn env_overrides_enable_discord_and_sdk() {
        let mut cfg = RelayConfig::default();
        cfg.apply_env_overrides(env_from(&[
            ("DISCORD_TOKEN", "tok"),
            ("ANTHROPIC_API_KEY", "sk-test"),
            ("CLAUDE_BIN", "/opt/claude"),
            ("RELAY_MAX_CONCURRENT", "7"),
            ("RELAY_COOLDOWN_MS", "not-a-number"),
        ]));
        assert!(cfg.channels.discord.enabled);
        assert_eq!(cfg.channels.discord.bot_token, "tok");
        assert_eq!(cfg.sdk_api_key(), Some("sk-test"));
        assert_eq!(cfg.assistant.cli_program, "/opt/claude");
        assert_eq!(cfg.dispatch.max_concurrent, 7);
        assert_eq!(cfg.dispatch.cooldown_ms, 3_000);
    }

    #[test]
    fn sdk_key_is_ignored_when_sdk_disabled() {
        let mut cfg = RelayConfig::default();
        cfg.keys.anthropic_api_key = Some("sk-test".into());
        cfg.assistant.sdk_enabled = false;
        assert_eq!(cfg.sdk_api_key(), None);
    }

    #[test]
    fn validation_rejects_zero_limits_and_missing_token() {
        let mut cfg = RelayConfig::default();
        cfg.dispatch.max_concurrent = 0;
        assert!(cfg.validate().unwrap_err().to_string().contains("max_concurrent"));

        let mut cfg = RelayConfig::default();
        cfg.dispatch.max_message_chars = 10_000;
        assert!(cfg.validate().is_err());

        let mut cfg = RelayConfig::default();
        cfg.channels.discord.enabled = true;
        assert!(cfg.validate().unwrap_err().to_string().contains("bot_token"));
    }

    #[test]
    fn chunk_limit_leaves_room_for_the_continuation_prefix() {
        let mut cfg = RelayConfig::default();
        cfg.dispatch.chunk_limit = MAX_CHUNK_LIMIT;
        cfg.validate().unwrap();

        cfg.dispatch.chunk_limit = 2_000;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("chunk_limit"), "{err}");

        cfg.dispatch.chunk_limit = 0;
        assert!(cfg.validate().is_err());

        let worst = format!("(999/999) {}", "x".repeat(MAX_CHUNK_LIMIT));
        assert!(worst.chars().count() <= 2_000);
    }

    #[tokio::test]
    async fn explicit_missing_path_is_an_error_but_file_on_disk_loads() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(RelayConfig::load(Some(missing)).await.is_err());

        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[dispatch]\nchunk_limit = 500\n").unwrap();
        let cfg = RelayConfig::load(Some(path)).await.unwrap();
        assert_eq!(cfg.dispatch.chunk_limit, 500);
    }
}
