//! Cross-tab synchronizer.
//!
//! A mutation publishes a payload-free "data changed" signal tagged with the
//! origin that caused it. Subscribers drop their cached view and re-read the
//! store; they never merge anything from the signal. A subscriber never sees
//! its own signals.

use std::fmt;

use tokio::sync::broadcast;
use ulid::Ulid;

const DEFAULT_CAPACITY: usize = 64;

/// Identity of one client process (a tab, a CLI invocation, the daemon).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OriginId(String);

impl OriginId {
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for OriginId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for OriginId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSignal {
    pub origin: OriginId,
}

#[derive(Debug, Clone)]
pub struct SyncHub {
    sender: broadcast::Sender<SyncSignal>,
}

impl Default for SyncHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl SyncHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns how many subscribers were reached. Zero subscribers is fine.
    pub fn publish(&self, origin: &OriginId) -> usize {
        self.sender
            .send(SyncSignal {
                origin: origin.clone(),
            })
            .unwrap_or(0)
    }

    pub fn subscribe(&self, origin: OriginId) -> SyncSubscription {
        SyncSubscription {
            origin,
            receiver: self.sender.subscribe(),
        }
    }

    pub fn notifier(&self, origin: OriginId) -> SyncNotifier {
        SyncNotifier {
            hub: self.clone(),
            origin,
        }
    }
}

/// Publishing half handed to the engine.
#[derive(Debug, Clone)]
pub struct SyncNotifier {
    hub: SyncHub,
    origin: OriginId,
}

impl SyncNotifier {
    pub fn origin(&self) -> &OriginId {
        &self.origin
    }

    pub fn with_origin(&self, origin: OriginId) -> Self {
        Self {
            hub: self.hub.clone(),
            origin,
        }
    }

    pub fn notify(&self) {
        let reached = self.hub.publish(&self.origin);
        tracing::debug!(origin = %self.origin, reached, "Sync signal published");
    }
}

pub struct SyncSubscription {
    origin: OriginId,
    receiver: broadcast::Receiver<SyncSignal>,
}

impl SyncSubscription {
    pub fn origin(&self) -> &OriginId {
        &self.origin
    }

    /// Waits for the next foreign change. Returns `None` once the hub is gone.
    /// A lagged receiver reports a single refresh; the skipped signals carried
    /// nothing beyond "reload".
    pub async fn recv(&mut self) -> Option<SyncSignal> {
        loop {
            match self.receiver.recv().await {
                Ok(signal) if signal.origin == self.origin => continue,
                Ok(signal) => return Some(signal),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Sync subscriber lagged; refreshing once");
                    return Some(SyncSignal {
                        origin: OriginId::from("lagged"),
                    });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
