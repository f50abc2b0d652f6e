use crate::error::ConnectError;
use crate::types::{ChannelResult, WindowId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

const BUS_CAPACITY: usize = 64;

/// A message posted by some window, tagged with the identity of its sender.
#[derive(Debug, Clone)]
pub struct WindowMessage {
    pub source: WindowId,
    pub data: Value,
}

/// Payloads the callback page may post back to its opener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CallbackMessage {
    #[serde(rename = "oauth-success")]
    Success {
        provider: String,
        #[serde(default)]
        email: Option<String>,
    },
    #[serde(rename = "oauth-error")]
    Error {
        provider: String,
        #[serde(default)]
        error: Option<String>,
    },
}

impl CallbackMessage {
    /// Validates an untrusted payload. Anything that is not one of the two
    /// known shapes yields `None`.
    pub fn parse(data: &Value) -> Option<Self> {
        Self::deserialize(data).ok()
    }

    pub fn provider(&self) -> &str {
        match self {
            CallbackMessage::Success { provider, .. } | CallbackMessage::Error { provider, .. } => {
                provider
            }
        }
    }
}

/// Page-level message channel shared by every window the host opens.
#[derive(Debug, Clone)]
pub struct MessageBus {
    tx: broadcast::Sender<WindowMessage>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Delivers `data` as sent by `source`. Returns how many listeners saw it.
    pub fn post(&self, source: WindowId, data: Value) -> usize {
        self.tx.send(WindowMessage { source, data }).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WindowMessage> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

pub struct MessageListener {
    rx: Option<broadcast::Receiver<WindowMessage>>,
    window: WindowId,
    provider: String,
}

impl MessageListener {
    pub fn new(
        rx: broadcast::Receiver<WindowMessage>,
        window: WindowId,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            rx: Some(rx),
            window,
            provider: provider.into(),
        }
    }

    /// Waits for the first recognized message from the launched window.
    ///
    /// Cancel-safe. Never completes once unsubscribed or once the bus is gone.
    pub async fn next(&mut self) -> ChannelResult {
        loop {
            let Some(rx) = self.rx.as_mut() else {
                return std::future::pending().await;
            };
            match rx.recv().await {
                Ok(message) => {
                    if let Some(result) = self.accept(&message) {
                        return result;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Message listener lagged behind");
                }
                Err(RecvError::Closed) => {
                    debug!("Message bus closed");
                    self.rx = None;
                }
            }
        }
    }

    fn accept(&self, message: &WindowMessage) -> Option<ChannelResult> {
        if message.source != self.window {
            debug!(
                source = %message.source,
                expected = %self.window,
                "Ignoring message from another window"
            );
            return None;
        }
        let Some(parsed) = CallbackMessage::parse(&message.data) else {
            debug!("Ignoring unrecognized message payload");
            return None;
        };
        if parsed.provider() != self.provider {
            debug!(provider = parsed.provider(), "Ignoring message for another provider");
            return None;
        }
        Some(match parsed {
            CallbackMessage::Success { email, .. } => ChannelResult::Success { email },
            CallbackMessage::Error { error, .. } => {
                ChannelResult::Failure(ConnectError::ProviderReported(error))
            }
        })
    }

    /// Drops the subscription. Safe to call any number of times.
    pub fn unsubscribe(&mut self) {
        if self.rx.take().is_some() {
            debug!(window = %self.window, "Message listener unsubscribed");
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.rx.is_some()
    }
}
