//! Disclaude configuration loader.
//!
//! Defaults, then an optional TOML file, then environment variables (a `.env`
//! file is loaded into the environment by `main` before this runs).

use crate::error::ConfigError;
use dc_llm::{LlmConfig, Provider};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Discord,
    Feishu,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discord => "discord",
            Self::Feishu => "feishu",
        }
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "discord" => Ok(Self::Discord),
            "feishu" | "lark" => Ok(Self::Feishu),
            other => Err(format!(
                "PLATFORM must be 'discord' or 'feishu', got: {other}"
            )),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Raw selector; validated into [`Platform`].
    pub platform: String,
    pub discord: DiscordConfig,
    pub feishu: FeishuConfig,
    pub model: ModelConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
    pub bot_token: String,
    pub command_prefix: String,
    /// In guild channels, only answer messages that mention the bot.
    pub require_mention: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeishuConfig {
    pub app_id: String,
    pub app_secret: String,
    pub verification_token: Option<String>,
    pub api_base_url: String,
    pub listen_addr: String,
    pub command_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub anthropic_api_key: Option<String>,
    pub claude_model: String,
    pub anthropic_base_url: Option<String>,
    pub glm_api_key: Option<String>,
    pub glm_model: String,
    pub glm_api_base_url: String,
    pub max_tokens: u32,
    /// Unset means completion calls may wait indefinitely.
    pub timeout_secs: Option<u64>,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub workspace: PathBuf,
    pub session_persistence_path: PathBuf,
    /// Prior turns replayed with each prompt.
    pub history_limit: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            platform: Platform::Discord.as_str().to_string(),
            discord: DiscordConfig::default(),
            feishu: FeishuConfig::default(),
            model: ModelConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            command_prefix: "!".to_string(),
            require_mention: true,
        }
    }
}

impl Default for FeishuConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            app_secret: String::new(),
            verification_token: None,
            api_base_url: "https://open.feishu.cn".to_string(),
            listen_addr: "0.0.0.0:8080".to_string(),
            command_prefix: "/".to_string(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            anthropic_api_key: None,
            claude_model: Provider::Anthropic.default_model().to_string(),
            anthropic_base_url: None,
            glm_api_key: None,
            glm_model: Provider::Glm.default_model().to_string(),
            glm_api_base_url: Provider::Glm.default_base_url().to_string(),
            max_tokens: 4096,
            timeout_secs: None,
            system_prompt: None,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("./workspace"),
            session_persistence_path: PathBuf::from("./sessions.json"),
            history_limit: 20,
        }
    }
}

impl RelayConfig {
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(path) => {
                let contents = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| ConfigError::single(format!("read config {}: {e}", path.display())))?;
                toml::from_str::<RelayConfig>(&contents).map_err(|e| {
                    ConfigError::single(format!("parse config {}: {e}", path.display()))
                })?
            }
            None => RelayConfig::default(),
        };

        let mut problems = cfg.apply_env_overrides(|key| std::env::var(key).ok());
        if let Err(e) = cfg.validate() {
            problems.extend(e.problems);
        }
        if !problems.is_empty() {
            return Err(ConfigError { problems });
        }
        Ok(cfg)
    }

    /// Applies environment overrides and returns the values that failed to parse.
    fn apply_env_overrides(&mut self, env: impl Fn(&str) -> Option<String>) -> Vec<String> {
        let mut problems = Vec::new();
        let var = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("PLATFORM") {
            self.platform = v.trim().to_ascii_lowercase();
        }

        if let Some(v) = var("DISCORD_BOT_TOKEN") {
            self.discord.bot_token = v;
        }
        if let Some(v) = var("DISCORD_COMMAND_PREFIX") {
            self.discord.command_prefix = v.trim().to_string();
        }
        if let Some(v) = var("DISCORD_REQUIRE_MENTION") {
            match parse_bool(&v) {
                Some(b) => self.discord.require_mention = b,
                None => problems.push(format!(
                    "DISCORD_REQUIRE_MENTION must be true or false, got: {v}"
                )),
            }
        }

        if let Some(v) = var("FEISHU_APP_ID") {
            self.feishu.app_id = v;
        }
        if let Some(v) = var("FEISHU_APP_SECRET") {
            self.feishu.app_secret = v;
        }
        if let Some(v) = var("FEISHU_VERIFICATION_TOKEN") {
            self.feishu.verification_token = Some(v);
        }
        if let Some(v) = var("FEISHU_API_BASE_URL") {
            self.feishu.api_base_url = v;
        }
        if let Some(v) = var("FEISHU_LISTEN_ADDR") {
            self.feishu.listen_addr = v;
        }
        if let Some(v) = var("FEISHU_COMMAND_PREFIX") {
            self.feishu.command_prefix = v.trim().to_string();
        }

        if let Some(v) = var("ANTHROPIC_API_KEY") {
            self.model.anthropic_api_key = Some(v);
        }
        if let Some(v) = var("CLAUDE_MODEL") {
            self.model.claude_model = v;
        }
        if let Some(v) = var("ANTHROPIC_BASE_URL") {
            self.model.anthropic_base_url = Some(v);
        }
        if let Some(v) = var("GLM_API_KEY") {
            self.model.glm_api_key = Some(v);
        }
        if let Some(v) = var("GLM_MODEL") {
            self.model.glm_model = v;
        }
        if let Some(v) = var("GLM_API_BASE_URL") {
            self.model.glm_api_base_url = v;
        }
        if let Some(v) = var("LLM_MAX_TOKENS") {
            match v.trim().parse::<u32>() {
                Ok(n) => self.model.max_tokens = n,
                Err(_) => problems.push(format!("LLM_MAX_TOKENS must be a positive integer, got: {v}")),
            }
        }
        if let Some(v) = var("LLM_TIMEOUT_SECS") {
            match v.trim().parse::<u64>() {
                Ok(n) => self.model.timeout_secs = Some(n),
                Err(_) => problems.push(format!("LLM_TIMEOUT_SECS must be an integer, got: {v}")),
            }
        }
        if let Some(v) = var("SYSTEM_PROMPT") {
            self.model.system_prompt = Some(v);
        }

        if let Some(v) = var("AGENT_WORKSPACE") {
            self.agent.workspace = PathBuf::from(v);
        }
        if let Some(v) = var("SESSION_PERSISTENCE_PATH") {
            self.agent.session_persistence_path = PathBuf::from(v);
        }
        if let Some(v) = var("HISTORY_LIMIT") {
            match v.trim().parse::<usize>() {
                Ok(n) => self.agent.history_limit = n,
                Err(_) => problems.push(format!("HISTORY_LIMIT must be an integer, got: {v}")),
            }
        }

        problems
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        match self.platform() {
            Ok(Platform::Discord) => {
                if self.discord.bot_token.trim().is_empty() {
                    problems.push("DISCORD_BOT_TOKEN is required when PLATFORM=discord".to_string());
                }
                if self.discord.command_prefix.is_empty() {
                    problems.push("DISCORD_COMMAND_PREFIX must not be empty".to_string());
                }
            }
            Ok(Platform::Feishu) => {
                if self.feishu.app_id.trim().is_empty() {
                    problems.push("FEISHU_APP_ID is required when PLATFORM=feishu".to_string());
                }
                if self.feishu.app_secret.trim().is_empty() {
                    problems.push("FEISHU_APP_SECRET is required when PLATFORM=feishu".to_string());
                }
                if self.feishu.command_prefix.is_empty() {
                    problems.push("FEISHU_COMMAND_PREFIX must not be empty".to_string());
                }
                if let Err(e) = self.feishu_listen_addr() {
                    problems.push(e);
                }
            }
            Err(e) => problems.push(e),
        }

        if non_empty(&self.model.glm_api_key).is_none()
            && non_empty(&self.model.anthropic_api_key).is_none()
        {
            problems.push(
                "At least one API key is required: GLM_API_KEY or ANTHROPIC_API_KEY".to_string(),
            );
        }
        if self.model.max_tokens == 0 {
            problems.push("LLM_MAX_TOKENS must be > 0".to_string());
        }
        if self.agent.session_persistence_path.as_os_str().is_empty() {
            problems.push("SESSION_PERSISTENCE_PATH must not be empty".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { problems })
        }
    }

    pub fn platform(&self) -> Result<Platform, String> {
        self.platform.parse()
    }

    pub fn command_prefix(&self) -> &str {
        match self.platform() {
            Ok(Platform::Feishu) => &self.feishu.command_prefix,
            _ => &self.discord.command_prefix,
        }
    }

    pub fn feishu_listen_addr(&self) -> Result<SocketAddr, String> {
        self.feishu.listen_addr.trim().parse().map_err(|_| {
            format!(
                "FEISHU_LISTEN_ADDR must be a socket address like 0.0.0.0:8080, got: {}",
                self.feishu.listen_addr
            )
        })
    }

    /// GLM wins when its key is present; Anthropic is the fallback.
    pub fn llm_config(&self) -> Result<LlmConfig, ConfigError> {
        let timeout = self.model.timeout_secs.map(Duration::from_secs);
        if let Some(key) = non_empty(&self.model.glm_api_key) {
            let mut cfg = LlmConfig::new(Provider::Glm, key);
            cfg.model = self.model.glm_model.clone();
            cfg.base_url = Some(self.model.glm_api_base_url.clone());
            cfg.max_tokens = self.model.max_tokens;
            cfg.timeout = timeout;
            return Ok(cfg);
        }
        if let Some(key) = non_empty(&self.model.anthropic_api_key) {
            let mut cfg = LlmConfig::new(Provider::Anthropic, key);
            cfg.model = self.model.claude_model.clone();
            cfg.base_url = self.model.anthropic_base_url.clone();
            cfg.max_tokens = self.model.max_tokens;
            cfg.timeout = timeout;
            return Ok(cfg);
        }
        Err(ConfigError::single(
            "No API key configured. Set GLM_API_KEY or ANTHROPIC_API_KEY",
        ))
    }

    pub fn platform_info(&self) -> String {
        let model = self
            .llm_config()
            .map(|cfg| cfg.model)
            .unwrap_or_else(|_| "<unconfigured>".to_string());
        match self.platform() {
            Ok(Platform::Feishu) => format!("Feishu/Lark bot with {model}"),
            _ => format!("Discord bot with {model}"),
        }
    }

    pub fn transcripts_dir(&self) -> PathBuf {
        self.agent.workspace.join("sessions")
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Shows the first and last few characters of a secret.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.trim().chars().collect();
    if chars.is_empty() {
        return "NOT SET".to_string();
    }
    if chars.len() <= 12 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn configured(pairs: &[(&str, &str)]) -> (RelayConfig, Vec<String>) {
        let mut cfg = RelayConfig::default();
        let problems = cfg.apply_env_overrides(env_of(pairs));
        (cfg, problems)
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.platform(), Ok(Platform::Discord));
        assert_eq!(cfg.discord.command_prefix, "!");
        assert_eq!(cfg.feishu.command_prefix, "/");
        assert_eq!(cfg.model.claude_model, "claude-3-5-sonnet-20241022");
        assert_eq!(cfg.model.glm_model, "glm-4.7");
        assert_eq!(
            cfg.model.glm_api_base_url,
            "https://open.bigmodel.cn/api/anthropic"
        );
        assert_eq!(cfg.agent.session_persistence_path, PathBuf::from("./sessions.json"));
        assert_eq!(cfg.transcripts_dir(), PathBuf::from("./workspace/sessions"));
    }

    #[test]
    fn validation_collects_every_problem() {
        let (cfg, problems) = configured(&[]);
        assert!(problems.is_empty());
        let err = cfg.validate().expect_err("missing token and keys");
        assert_eq!(
            err.problems,
            vec![
                "DISCORD_BOT_TOKEN is required when PLATFORM=discord".to_string(),
                "At least one API key is required: GLM_API_KEY or ANTHROPIC_API_KEY".to_string(),
            ]
        );

        let (cfg, _) = configured(&[("PLATFORM", "feishu"), ("ANTHROPIC_API_KEY", "k")]);
        let err = cfg.validate().expect_err("missing feishu credentials");
        assert_eq!(err.problems.len(), 2);
        assert!(err.problems[0].contains("FEISHU_APP_ID"));
        assert!(err.problems[1].contains("FEISHU_APP_SECRET"));
    }

    #[test]
    fn unknown_platform_is_rejected() {
        let (cfg, _) = configured(&[("PLATFORM", "Slack"), ("GLM_API_KEY", "k")]);
        let err = cfg.validate().expect_err("unknown platform");
        assert_eq!(
            err.problems,
            vec!["PLATFORM must be 'discord' or 'feishu', got: slack".to_string()]
        );
    }

    #[test]
    fn glm_is_preferred_over_anthropic() {
        let (cfg, _) = configured(&[
            ("DISCORD_BOT_TOKEN", "t"),
            ("ANTHROPIC_API_KEY", "sk-ant"),
            ("GLM_API_KEY", "glm-key"),
            ("GLM_MODEL", "glm-4.5"),
        ]);
        cfg.validate().expect("valid");
        let llm = cfg.llm_config().expect("llm config");
        assert_eq!(llm.provider, Provider::Glm);
        assert_eq!(llm.api_key, "glm-key");
        assert_eq!(llm.model, "glm-4.5");
        assert_eq!(llm.base_url(), "https://open.bigmodel.cn/api/anthropic");
        assert_eq!(cfg.platform_info(), "Discord bot with glm-4.5");
    }

    #[test]
    fn anthropic_is_used_when_glm_key_is_absent() {
        let (cfg, _) = configured(&[
            ("ANTHROPIC_API_KEY", "sk-ant"),
            ("GLM_API_KEY", "   "),
            ("LLM_TIMEOUT_SECS", "90"),
        ]);
        let llm = cfg.llm_config().expect("llm config");
        assert_eq!(llm.provider, Provider::Anthropic);
        assert_eq!(llm.model, "claude-3-5-sonnet-20241022");
        assert_eq!(llm.base_url(), "https://api.anthropic.com");
        assert_eq!(llm.timeout, Some(Duration::from_secs(90)));
    }

    #[test]
    fn unparsable_numbers_are_reported() {
        let (cfg, problems) = configured(&[
            ("LLM_MAX_TOKENS", "lots"),
            ("HISTORY_LIMIT", "-1"),
            ("DISCORD_REQUIRE_MENTION", "maybe"),
        ]);
        assert_eq!(problems.len(), 3);
        assert_eq!(cfg.model.max_tokens, 4096);
        assert_eq!(cfg.agent.history_limit, 20);
        assert!(cfg.discord.require_mention);
    }

    #[test]
    fn command_prefix_follows_platform() {
        let (cfg, _) = configured(&[("PLATFORM", "feishu"), ("FEISHU_COMMAND_PREFIX", "#")]);
        assert_eq!(cfg.command_prefix(), "#");
        let (cfg, _) = configured(&[("DISCORD_COMMAND_PREFIX", "?")]);
        assert_eq!(cfg.command_prefix(), "?");
    }

    #[test]
    fn toml_file_sections_are_optional() {
        let cfg: RelayConfig = toml::from_str(
            r#"
platform = "feishu"

[feishu]
app_id = "cli_1"
app_secret = "s"

[agent]
history_limit = 4
"#,
        )
        .expect("parses");
        assert_eq!(cfg.platform(), Ok(Platform::Feishu));
        assert_eq!(cfg.feishu.listen_addr, "0.0.0.0:8080");
        assert_eq!(cfg.agent.history_limit, 4);
        assert_eq!(cfg.discord.command_prefix, "!");
    }

    #[test]
    fn secrets_are_masked() {
        assert_eq!(mask_secret(""), "NOT SET");
        assert_eq!(mask_secret("short"), "****");
        assert_eq!(mask_secret("sk-ant-1234567890abcd"), "sk-a...abcd");
    }
}
