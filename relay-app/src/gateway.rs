//! Inbound fan-in: every channel adapter feeds a single queue, and each
//! message is dispatched on its own task.

use crate::cooldown::CooldownTracker;
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use anyhow::Result;
use relay_channels::{ChannelAdapter, InboundMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

pub struct GatewayRuntime {
    dispatcher: Arc<Dispatcher>,
    cooldowns: Arc<CooldownTracker>,
    sweep_interval: Duration,
    channels: HashMap<String, Arc<dyn ChannelAdapter>>,
    inbound_rx: mpsc::Receiver<InboundMessage>,
}

impl GatewayRuntime {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        cooldowns: Arc<CooldownTracker>,
        sweep_interval: Duration,
        channels: HashMap<String, Arc<dyn ChannelAdapter>>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
    ) -> Self {
        Self {
            dispatcher,
            cooldowns,
            sweep_interval,
            channels,
            inbound_rx,
        }
    }

    pub fn start(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run(shutdown).await {
                tracing::error!(%e, "gateway loop exited");
            }
        })
    }

    /// Runs until `shutdown` fires or every sender of the inbound queue is
    /// gone, then waits for in-flight dispatches to finish.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let sweeper_stop = shutdown.child_token();
        let sweeper = self
            .cooldowns
            .spawn_sweeper(self.sweep_interval, sweeper_stop.clone());
        let mut tasks: JoinSet<DispatchOutcome> = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(in_flight = tasks.len(), "gateway shutting down");
                    break;
                }
                Some(done) = tasks.join_next(), if !tasks.is_empty() => {
                    log_task_result(done);
                }
                msg = self.inbound_rx.recv() => {
                    let Some(inbound) = msg else {
                        tracing::info!("inbound queue closed");
                        break;
                    };
                    self.spawn_dispatch(&mut tasks, inbound);
                }
            }
        }

        while let Some(done) = tasks.join_next().await {
            log_task_result(done);
        }
        sweeper_stop.cancel();
        if let Err(e) = sweeper.await {
            tracing::warn!(%e, "cooldown sweeper join failed");
        }
        Ok(())
    }

    fn spawn_dispatch(&self, tasks: &mut JoinSet<DispatchOutcome>, inbound: InboundMessage) {
        let Some(channel) = self.channels.get(inbound.channel_id.as_str()).cloned() else {
            tracing::warn!(
                channel_id = %inbound.channel_id,
                "dropping message from unknown channel"
            );
            return;
        };
        let dispatcher = Arc::clone(&self.dispatcher);
        tasks.spawn(async move { dispatcher.handle(channel.as_ref(), &inbound).await });
    }
}

fn log_task_result(done: std::result::Result<DispatchOutcome, JoinError>) {
    match done {
        Ok(outcome) => tracing::debug!(?outcome, "dispatch finished"),
        Err(e) if e.is_panic() => tracing::error!(%e, "dispatch task panicked"),
        Err(e) => tracing::warn!(%e, "dispatch task cancelled"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::ConcurrencyGate;
    use crate::dispatcher::DispatchSettings;
    use crate::test_support::{RecordingChannel, ScriptedSdk, message};
    use relay_assistant::{AssistantInvoker, AssistantSdk, CliConfig, CliInvoker};

    struct Fixture {
        runtime: GatewayRuntime,
        tx: mpsc::Sender<InboundMessage>,
        channel: Arc<RecordingChannel>,
        sdk: Arc<ScriptedSdk>,
    }

    fn fixture() -> Fixture {
        let sdk = Arc::new(ScriptedSdk::new("hello"));
        let invoker = AssistantInvoker::new(
            Some(sdk.clone() as Arc<dyn AssistantSdk>),
            Duration::from_secs(1),
            CliInvoker::new(CliConfig {
                program: "/nonexistent/claude-relay-missing-binary".to_string(),
                ..CliConfig::default()
            }),
        );
        let cooldowns = CooldownTracker::new(Duration::from_secs(3));
        let dispatcher = Arc::new(Dispatcher::new(
            ConcurrencyGate::new(3),
            cooldowns.clone(),
            Arc::new(invoker),
            DispatchSettings {
                max_message_chars: 4_000,
                chunk_limit: 1_900,
            },
        ));
        let channel = Arc::new(RecordingChannel::named("test"));
        let mut channels: HashMap<String, Arc<dyn ChannelAdapter>> = HashMap::new();
        channels.insert("test".to_string(), channel.clone());
        let (tx, rx) = mpsc::channel(16);
        Fixture {
            runtime: GatewayRuntime::new(
                dispatcher,
                cooldowns,
                Duration::from_secs(60),
                channels,
                rx,
            ),
            tx,
            channel,
            sdk,
        }
    }

    #[tokio::test]
    async fn messages_are_dispatched_to_their_channel_until_queue_closes() {
        let f = fixture();
        f.tx.send(message("m1", "alice", "hi")).await.unwrap();
        f.tx.send(message("m2", "bob", "hey")).await.unwrap();
        drop(f.tx);

        f.runtime.run(CancellationToken::new()).await.unwrap();

        let mut contents = f.channel.contents();
        contents.sort();
        assert_eq!(contents, vec!["hello".to_string(), "hello".to_string()]);
        assert_eq!(f.sdk.calls(), 2);
    }

    #[tokio::test]
    async fn unknown_channel_is_dropped() {
        let f = fixture();
        let mut stray = message("m1", "alice", "hi");
        stray.channel_id = "nowhere".into();
        f.tx.send(stray).await.unwrap();
        drop(f.tx);

        f.runtime.run(CancellationToken::new()).await.unwrap();

        assert!(f.channel.sent().is_empty());
        assert_eq!(f.sdk.calls(), 0);
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop_with_senders_still_open() {
        let f = fixture();
        let shutdown = CancellationToken::new();
        let handle = f.runtime.start(shutdown.clone());

        f.tx.send(message("m1", "alice", "hi")).await.unwrap();
        f.channel.sent_notify.notified().await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("gateway stops after shutdown")
            .unwrap();
        assert_eq!(f.channel.contents(), vec!["hello".to_string()]);
    }
}
