use std::fmt;

use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 16;

/// Authentication state changes observed by navigation and UI layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    Login,
    Logout,
    /// The session could not be refreshed and credentials were cleared.
    TokenExpired,
}

impl AuthEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthEvent::Login => "login",
            AuthEvent::Logout => "logout",
            AuthEvent::TokenExpired => "tokenExpired",
        }
    }
}

impl fmt::Display for AuthEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publish/subscribe channel for [`AuthEvent`]s.
///
/// Created once by the application root and handed to every client that needs it.
/// Cloning shares the underlying channel.
#[derive(Debug, Clone)]
pub struct AuthEventBus {
    sender: broadcast::Sender<AuthEvent>,
}

impl AuthEventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Register a new observer. Only events published after this call are delivered.
    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.sender.subscribe()
    }

    /// Deliver `event` to all current observers; returns how many received it.
    pub fn publish(&self, event: AuthEvent) -> usize {
        let delivered = self.sender.send(event).unwrap_or(0);
        tracing::debug!(event = %event, delivered, "auth event published");
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for AuthEventBus {
    fn default() -> Self {
        Self::new()
    }
}
