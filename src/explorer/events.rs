//! Change notifications and user-facing notices from the explorer.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

/// Broadcast channel capacity for explorer events
const CHANNEL_CAPACITY: usize = 64;

/// A short message meant for the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "level", content = "message", rename_all = "lowercase")]
pub enum Notice {
    Info(String),
    Error(String),
}

impl Notice {
    pub fn message(&self) -> &str {
        match self {
            Self::Info(msg) | Self::Error(msg) => msg,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExplorerEvent {
    /// The tree should be re-rendered. `None` means every connection.
    TreeChanged { connection: Option<String> },
    Notice(Notice),
}

/// Fan-out of [`ExplorerEvent`]s to any number of subscribers
#[derive(Debug, Clone)]
pub struct ExplorerEvents {
    sender: broadcast::Sender<ExplorerEvent>,
}

impl ExplorerEvents {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn emit(&self, event: ExplorerEvent) {
        if self.sender.receiver_count() > 0 {
            debug!(?event, "Broadcasting explorer event");
            let _ = self.sender.send(event);
        }
    }

    pub fn tree_changed(&self, connection: Option<&str>) {
        self.emit(ExplorerEvent::TreeChanged {
            connection: connection.map(str::to_string),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{message}");
        self.emit(ExplorerEvent::Notice(Notice::Info(message)));
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{message}");
        self.emit(ExplorerEvent::Notice(Notice::Error(message)));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExplorerEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ExplorerEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything already queued on a receiver, without waiting
pub fn drain(receiver: &mut broadcast::Receiver<ExplorerEvent>) -> Vec<ExplorerEvent> {
    let mut events = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                debug!(skipped, "Explorer event subscriber lagged");
            }
            Err(_) => break,
        }
    }
    events
}
