use crate::OutboundMessage;
use anyhow::{Context, Result};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;

/// Serializes state and content changes into messages for the transport.
///
/// The session calls this at every externally-visible step; how the messages
/// actually reach the client (WebSocket frames, stdout lines, a test vector)
/// is entirely the implementor's business.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> Result<()>;
}

/// A notifier that forwards messages over an in-process channel, used by the
/// service's writer task and by tests that assert on emitted messages.
pub struct ChannelNotifier {
    tx: mpsc::Sender<OutboundMessage>,
}

impl ChannelNotifier {
    pub fn new(tx: mpsc::Sender<OutboundMessage>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn send(&self, message: OutboundMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .context("Outbound channel closed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forwards_messages_in_order() {
        let (tx, mut rx) = mpsc::channel(4);
        let notifier = ChannelNotifier::new(tx);

        notifier
            .send(OutboundMessage::Interrupted)
            .await
            .unwrap();
        notifier
            .send(OutboundMessage::Response {
                text: "hi".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(OutboundMessage::Interrupted));
        assert_eq!(
            rx.recv().await,
            Some(OutboundMessage::Response {
                text: "hi".to_string()
            })
        );
    }

    #[tokio::test]
    async fn closed_channel_is_an_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let notifier = ChannelNotifier::new(tx);
        assert!(notifier.send(OutboundMessage::Interrupted).await.is_err());
    }
}
