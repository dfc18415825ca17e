use crate::config::{Platform, RelayConfig, mask_secret};
use crate::gateway::{Gateway, GatewayExit};
use crate::relay::Relay;
use crate::session::SessionStore;
use crate::transcript::TranscriptBook;
use anyhow::Result;
use dc_channels::{ChannelAdapter, DiscordAdapter, FeishuAdapter, OutboundMessage};
use dc_llm::{ChatMessage, LlmClient};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const INBOUND_QUEUE_CAPACITY: usize = 256;

pub async fn serve(config_path: Option<&Path>) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let platform = cfg.platform().map_err(anyhow::Error::msg)?;
    let llm = LlmClient::new(&cfg.llm_config()?)?;
    tracing::info!(
        platform = platform.as_str(),
        provider = llm.provider().as_str(),
        model = %llm.model(),
        command_prefix = %cfg.command_prefix(),
        history_limit = cfg.agent.history_limit,
        workspace = %cfg.agent.workspace.display(),
        session_file = %cfg.agent.session_persistence_path.display(),
        timeout_secs = ?cfg.model.timeout_secs,
        "relay configuration loaded"
    );

    tokio::fs::create_dir_all(&cfg.agent.workspace)
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "create workspace {}: {e}",
                cfg.agent.workspace.display()
            )
        })?;
    let sessions = Arc::new(SessionStore::open(cfg.agent.session_persistence_path.clone()).await);
    let transcripts = Arc::new(
        TranscriptBook::open(cfg.transcripts_dir())
            .await?
            .with_max_turns(cfg.agent.history_limit.saturating_mul(10)),
    );

    let known_sessions = sessions.len().await;
    tracing::info!(
        sessions = known_sessions,
        transcripts = %transcripts.base_dir().display(),
        "state ready"
    );

    let adapter = build_adapter(&cfg)?;
    let relay = Relay::new(Arc::new(llm), adapter.clone(), sessions, transcripts)
        .with_command_prefix(cfg.command_prefix())
        .with_history_limit(cfg.agent.history_limit)
        .with_system_prompt(cfg.model.system_prompt.clone())
        .with_platform_info(cfg.platform_info());

    let (tx, rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
    adapter.start(tx).await?;
    tracing::info!(platform = adapter.platform(), "disclaude relaying");

    let shutdown = CancellationToken::new();
    let signal_task = tokio::spawn(shutdown_signal(shutdown.clone()));
    let exit = Gateway::new(Arc::new(relay), rx, shutdown).run().await;
    signal_task.abort();
    match exit {
        GatewayExit::Cancelled => {
            tracing::info!("relay shutdown completed");
            Ok(())
        }
        GatewayExit::QueueClosed => Err(anyhow::anyhow!(
            "{} adapter stopped delivering events",
            adapter.platform()
        )),
    }
}

/// Validates configuration and prints a summary with secrets masked.
pub async fn doctor(config_path: Option<&Path>) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let llm = cfg.llm_config()?;

    println!("disclaude doctor: configuration ok");
    println!("  platform: {}", cfg.platform.as_str());
    match cfg.platform() {
        Ok(Platform::Feishu) => {
            println!("  feishu app id: {}", cfg.feishu.app_id);
            println!("  feishu app secret: {}", mask_secret(&cfg.feishu.app_secret));
            println!(
                "  feishu verification token: {}",
                mask_secret(cfg.feishu.verification_token.as_deref().unwrap_or(""))
            );
            println!("  feishu api base url: {}", cfg.feishu.api_base_url);
            println!("  feishu listen addr: {}", cfg.feishu.listen_addr);
        }
        _ => {
            println!("  discord bot token: {}", mask_secret(&cfg.discord.bot_token));
            println!("  discord require mention: {}", cfg.discord.require_mention);
        }
    }
    println!("  command prefix: {}", cfg.command_prefix());
    println!("  provider: {}", llm.provider.as_str());
    println!("  model: {}", llm.model);
    println!("  api key: {}", mask_secret(&llm.api_key));
    println!("  api base url: {}", llm.base_url());
    println!("  max tokens: {}", llm.max_tokens);
    match llm.timeout {
        Some(timeout) => println!("  timeout: {}s", timeout.as_secs()),
        None => println!("  timeout: none"),
    }
    println!("  workspace: {}", cfg.agent.workspace.display());
    println!("  history limit: {}", cfg.agent.history_limit);

    let sessions = SessionStore::new(cfg.agent.session_persistence_path.clone());
    match sessions.load().await {
        Ok(count) => println!(
            "  sessions: {count} in {}",
            cfg.agent.session_persistence_path.display()
        ),
        Err(e) => println!(
            "  sessions: unreadable {} ({e})",
            cfg.agent.session_persistence_path.display()
        ),
    }
    Ok(())
}

/// One completion, printed to stdout. No session is read or written.
pub async fn ask(config_path: Option<&Path>, prompt: &str) -> Result<()> {
    let prompt = prompt.trim();
    if prompt.is_empty() {
        return Err(anyhow::anyhow!("prompt must not be empty"));
    }
    let cfg = RelayConfig::load(config_path).await?;
    let llm = LlmClient::new(&cfg.llm_config()?)?;

    let mut turns = Vec::with_capacity(2);
    if let Some(system_prompt) = cfg.model.system_prompt.as_deref() {
        turns.push(ChatMessage::system(system_prompt));
    }
    turns.push(ChatMessage::user(prompt));
    let response = llm.chat(&turns).await?;
    println!("{}", response.text());
    Ok(())
}

pub async fn send_one_shot(
    config_path: Option<&Path>,
    conversation_id: &str,
    message: &str,
) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let adapter = build_adapter(&cfg)?;
    adapter
        .send(conversation_id, OutboundMessage::text(message))
        .await?;
    tracing::info!(platform = adapter.platform(), %conversation_id, "message sent");
    Ok(())
}

fn build_adapter(cfg: &RelayConfig) -> Result<Arc<dyn ChannelAdapter>> {
    let platform = cfg.platform().map_err(anyhow::Error::msg)?;
    let adapter: Arc<dyn ChannelAdapter> = match platform {
        Platform::Discord => Arc::new(
            DiscordAdapter::new(&cfg.discord.bot_token)?
                .with_require_mention_in_group_chats(cfg.discord.require_mention)
                .with_command_prefix(&cfg.discord.command_prefix),
        ),
        Platform::Feishu => Arc::new(
            FeishuAdapter::new(&cfg.feishu.app_id, &cfg.feishu.app_secret)?
                .with_api_base_url(&cfg.feishu.api_base_url)
                .with_listen_addr(cfg.feishu_listen_addr().map_err(anyhow::Error::msg)?)
                .with_verification_token(cfg.feishu.verification_token.clone()),
        ),
    };
    Ok(adapter)
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; shutting down");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; shutting down");
        }
    }
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discord_config() -> RelayConfig {
        let mut cfg = RelayConfig::default();
        cfg.discord.bot_token = "token".to_string();
        cfg.model.anthropic_api_key = Some("sk-ant".to_string());
        cfg
    }

    #[test]
    fn builds_adapter_for_selected_platform() {
        let adapter = build_adapter(&discord_config()).expect("discord adapter");
        assert_eq!(adapter.platform(), "discord");

        let mut cfg = discord_config();
        cfg.platform = "feishu".to_string();
        cfg.feishu.app_id = "cli_1".to_string();
        cfg.feishu.app_secret = "secret".to_string();
        let adapter = build_adapter(&cfg).expect("feishu adapter");
        assert_eq!(adapter.platform(), "feishu");
    }

    #[test]
    fn bad_listen_addr_fails_adapter_build() {
        let mut cfg = discord_config();
        cfg.platform = "feishu".to_string();
        cfg.feishu.app_id = "cli_1".to_string();
        cfg.feishu.app_secret = "secret".to_string();
        cfg.feishu.listen_addr = "not-an-addr".to_string();
        assert!(build_adapter(&cfg).is_err());
    }
}
