//! Process wiring for the `serve`, `doctor` and `ask` commands.

use crate::admission::ConcurrencyGate;
use crate::config::RelayConfig;
use crate::cooldown::CooldownTracker;
use crate::dispatcher::{DispatchSettings, Dispatcher};
use crate::gateway::GatewayRuntime;
use anyhow::Result;
use relay_assistant::{AssistantInvoker, AssistantSdk, CliInvoker, MessagesApiSdk, sanitize};
use relay_channels::{ChannelAdapter, DiscordAdapter};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    tracing::info!(
        max_concurrent = cfg.dispatch.max_concurrent,
        cooldown_ms = cfg.dispatch.cooldown_ms,
        sweep_interval_ms = cfg.dispatch.sweep_interval_ms,
        max_message_chars = cfg.dispatch.max_message_chars,
        chunk_limit = cfg.dispatch.chunk_limit,
        cli_program = %cfg.assistant.cli_program,
        cli_timeout_ms = cfg.assistant.cli_timeout_ms,
        sdk_timeout_ms = cfg.assistant.sdk_timeout_ms,
        sdk_configured = cfg.sdk_api_key().is_some(),
        discord_enabled = cfg.channels.discord.enabled,
        "starting claude-relay"
    );

    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(1024);
    let mut channels: HashMap<String, Arc<dyn ChannelAdapter>> = HashMap::new();
    if cfg.channels.discord.enabled {
        let discord = &cfg.channels.discord;
        let adapter: Arc<dyn ChannelAdapter> = Arc::new(
            DiscordAdapter::new(&discord.bot_token)?
                .with_require_mention_in_group_chats(discord.require_mention_in_group_chats)
                .with_allowed_channel_ids(discord.allowed_channel_ids.clone()),
        );
        adapter.start(inbound_tx.clone()).await?;
        channels.insert(adapter.channel_id().to_string(), adapter);
    }
    drop(inbound_tx);
    if channels.is_empty() {
        return Err(anyhow::anyhow!(
            "no channels enabled; set channels.discord.enabled or DISCORD_BOT_TOKEN"
        ));
    }

    let cooldowns = CooldownTracker::new(cfg.dispatch.cooldown());
    let dispatcher = Arc::new(Dispatcher::new(
        ConcurrencyGate::new(cfg.dispatch.max_concurrent),
        cooldowns.clone(),
        Arc::new(build_invoker(&cfg)?),
        DispatchSettings {
            max_message_chars: cfg.dispatch.max_message_chars,
            chunk_limit: cfg.dispatch.chunk_limit,
        },
    ));

    let runtime = GatewayRuntime::new(
        dispatcher,
        cooldowns,
        cfg.dispatch.sweep_interval(),
        channels.clone(),
        inbound_rx,
    );
    let shutdown = CancellationToken::new();
    let gateway_handle = runtime.start(shutdown.child_token());
    tracing::info!(
        channel_count = channels.len(),
        channels = ?channels.keys().collect::<Vec<_>>(),
        "gateway started"
    );

    shutdown_signal(shutdown.clone()).await;
    match gateway_handle.await {
        Ok(()) => tracing::info!("gateway shutdown completed"),
        Err(e) => tracing::error!(error = %e, "gateway task join failed during shutdown"),
    }
    Ok(())
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let invoker = build_invoker(&cfg)?;
    tracing::info!(
        discord_enabled = cfg.channels.discord.enabled,
        sdk_available = invoker.sdk_available(),
        model = %cfg.assistant.model,
        "config ok"
    );

    let cli = invoker.cli();
    match cli.probe_version().await {
        Ok(version) => {
            tracing::info!(
                program = %cli.program(),
                timeout_ms = cli.timeout().as_millis() as u64,
                %version,
                "assistant CLI ok"
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!(program = %cli.program(), error = %e, "assistant CLI check failed");
            Err(anyhow::anyhow!("assistant CLI check failed: {e}"))
        }
    }
}

/// Sends one prompt through the same sanitize and invoke path a chat message
/// takes, and prints the reply.
pub async fn ask(config_path: Option<PathBuf>, prompt: &str) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let prompt = sanitize(prompt)?;
    let invoker = build_invoker(&cfg)?;
    let reply = invoker.invoke(&prompt).await?;
    tracing::info!(provenance = reply.provenance.as_str(), "assistant replied");
    println!("[{}] {}", reply.provenance.as_str(), reply.text);
    Ok(())
}

fn build_invoker(cfg: &RelayConfig) -> Result<AssistantInvoker> {
    let sdk: Option<Arc<dyn AssistantSdk>> = match cfg.sdk_api_key() {
        Some(key) => Some(Arc::new(
            MessagesApiSdk::new(key, &cfg.assistant.model)?
                .with_system_prompt(cfg.assistant.system_prompt.clone()),
        )),
        None => {
            tracing::info!("sdk path not configured; every request will use the CLI");
            None
        }
    };
    Ok(AssistantInvoker::new(
        sdk,
        cfg.assistant.sdk_timeout(),
        CliInvoker::new(cfg.assistant.cli_config()),
    ))
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
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
