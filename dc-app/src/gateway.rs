//! Event loop: every adapter feeds one inbound queue, and each message is
//! handled on its own task.

use async_trait::async_trait;
use dc_channels::{InboundEvent, InboundMessage};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// One method per inbound event kind.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_ready(&self, platform: &str, bot_user_id: Option<&str>) {
        tracing::info!(platform, bot_user_id, "channel ready");
    }

    async fn on_message(&self, message: InboundMessage);
}

/// Why [`Gateway::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayExit {
    Cancelled,
    /// Every adapter dropped its sender; nothing more can arrive.
    QueueClosed,
}

pub struct Gateway {
    handler: Arc<dyn EventHandler>,
    inbound_rx: mpsc::Receiver<InboundEvent>,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(
        handler: Arc<dyn EventHandler>,
        inbound_rx: mpsc::Receiver<InboundEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            handler,
            inbound_rx,
            shutdown,
        }
    }

    /// Runs until cancelled or until every sender is dropped. Cancellation aborts
    /// in-flight message tasks; a closed queue lets them finish.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run(mut self) -> GatewayExit {
        let mut tasks: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    tracing::info!(in_flight = tasks.len(), "shutdown requested; dropping in-flight replies");
                    tasks.abort_all();
                    return GatewayExit::Cancelled;
                }
                event = self.inbound_rx.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    self.dispatch(event, &mut tasks).await;
                }
            }
            while let Some(joined) = tasks.try_join_next() {
                log_join(joined);
            }
        }

        tracing::info!(in_flight = tasks.len(), "inbound queue closed");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    tasks.abort_all();
                    return GatewayExit::Cancelled;
                }
                joined = tasks.join_next() => match joined {
                    Some(joined) => log_join(joined),
                    None => return GatewayExit::QueueClosed,
                },
            }
        }
    }

    async fn dispatch(&self, event: InboundEvent, tasks: &mut JoinSet<()>) {
        match event {
            InboundEvent::Ready {
                platform,
                bot_user_id,
            } => {
                self.handler
                    .on_ready(&platform, bot_user_id.as_deref())
                    .await;
            }
            InboundEvent::Message(message) => {
                let handler = self.handler.clone();
                tasks.spawn(async move {
                    handler.on_message(message).await;
                });
            }
        }
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!(%e, "message task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dc_channels::{ConversationId, MessageId, SenderId};
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        ready: Mutex<Vec<(String, Option<String>)>>,
        messages: Mutex<Vec<String>>,
        hang_on: Option<String>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn on_ready(&self, platform: &str, bot_user_id: Option<&str>) {
            self.ready
                .lock()
                .await
                .push((platform.to_string(), bot_user_id.map(str::to_string)));
        }

        async fn on_message(&self, message: InboundMessage) {
            if self.hang_on.as_deref() == Some(message.content.as_str()) {
                std::future::pending::<()>().await;
            }
            self.messages.lock().await.push(message.content);
        }
    }

    fn message(content: &str) -> InboundEvent {
        InboundEvent::Message(InboundMessage {
            platform: "discord".to_string(),
            message_id: MessageId::new("m1"),
            conversation_id: ConversationId::new("c1"),
            sender_id: SenderId::new("u1"),
            is_bot: false,
            is_group: false,
            content: content.to_string(),
            metadata: serde_json::Value::Null,
            received_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn dispatches_events_until_queue_closes() {
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = mpsc::channel(8);
        let gateway = Gateway::new(recorder.clone(), rx, CancellationToken::new());

        tx.send(InboundEvent::Ready {
            platform: "discord".to_string(),
            bot_user_id: Some("42".to_string()),
        })
        .await
        .expect("send ready");
        tx.send(message("one")).await.expect("send");
        tx.send(message("two")).await.expect("send");
        drop(tx);

        let exit = tokio::time::timeout(Duration::from_secs(5), gateway.run())
            .await
            .expect("gateway finishes once the queue closes");
        assert_eq!(exit, GatewayExit::QueueClosed);

        assert_eq!(
            recorder.ready.lock().await.as_slice(),
            &[("discord".to_string(), Some("42".to_string()))]
        );
        let mut seen = recorder.messages.lock().await.clone();
        seen.sort();
        assert_eq!(seen, vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn cancellation_stops_loop_with_tasks_in_flight() {
        let recorder = Arc::new(Recorder {
            hang_on: Some("stuck".to_string()),
            ..Recorder::default()
        });
        let (tx, rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Gateway::new(recorder.clone(), rx, shutdown.clone()).run());

        tx.send(message("stuck")).await.expect("send");
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        let exit = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("gateway stops after cancel")
            .expect("gateway task");
        assert_eq!(exit, GatewayExit::Cancelled);
        assert!(recorder.messages.lock().await.is_empty());
    }
}
