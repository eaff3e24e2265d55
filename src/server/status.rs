//! Server status and the channel broadcasting its transitions.
//!
//! The channel holds the current value (so late subscribers can query it) and
//! delivers every subsequent transition in call order. Closing the channel
//! drops the sender: existing subscribers see the stream end and no further
//! transitions are accepted.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::debug;

/// Broadcast channel capacity for status transitions
const CHANNEL_CAPACITY: usize = 64;

/// Lifecycle status of the ephemeral server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ServerStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct ChannelState {
    current: ServerStatus,
    sender: Option<broadcast::Sender<ServerStatus>>,
}

pub struct StatusChannel {
    state: Mutex<ChannelState>,
}

impl StatusChannel {
    pub fn new(initial: ServerStatus) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(ChannelState {
                current: initial,
                sender: Some(sender),
            }),
        }
    }

    pub fn current(&self) -> ServerStatus {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current
    }

    /// Record a transition and deliver it to every subscriber.
    ///
    /// Returns false once the channel is closed; the value is then ignored.
    pub fn publish(&self, status: ServerStatus) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = &state.sender else {
            debug!(%status, "Status channel closed, dropping transition");
            return false;
        };
        // No subscribers is fine: the current value is still updated
        let _ = sender.send(status);
        state.current = status;
        debug!(%status, "Server status changed");
        true
    }

    /// Subscribe to transitions, together with the value current at subscription time.
    ///
    /// The receiver of a closed channel yields `RecvError::Closed` immediately.
    pub fn subscribe(&self) -> StatusSubscription {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let receiver = match &state.sender {
            Some(sender) => sender.subscribe(),
            None => {
                let (sender, receiver) = broadcast::channel(1);
                drop(sender);
                receiver
            }
        };
        StatusSubscription {
            current: state.current,
            receiver,
        }
    }

    /// Close the channel and detach all subscribers
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.sender = None;
    }

    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sender
            .is_none()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sender
            .as_ref()
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

impl Default for StatusChannel {
    fn default() -> Self {
        Self::new(ServerStatus::Stopped)
    }
}

pub struct StatusSubscription {
    /// Status at the time of subscribing
    pub current: ServerStatus,
    pub receiver: broadcast::Receiver<ServerStatus>,
}

impl StatusSubscription {
    /// Drain every transition already delivered, without waiting
    pub fn drain(&mut self) -> Vec<ServerStatus> {
        let mut seen = Vec::new();
        while let Ok(status) = self.receiver.try_recv() {
            seen.push(status);
        }
        seen
    }
}
