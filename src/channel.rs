use async_trait::async_trait;
use tokio::sync::watch;

use crate::{error::Result, events::CanonicalUpdate};

/// Delivers canonical updates to every current listener.
///
/// Delivering the same update twice must be harmless.
#[async_trait]
pub trait OutboundChannel: Send + Sync {
    async fn publish(&self, update: CanonicalUpdate) -> Result<()>;
}

/// Outbound channel backed by a watch: listeners only ever need the latest snapshot.
pub struct WatchChannel {
    evt_send: watch::Sender<CanonicalUpdate>,
}

impl Default for WatchChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchChannel {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(CanonicalUpdate::disconnect(0));
        Self { evt_send: sender }
    }

    pub fn latest(&self) -> CanonicalUpdate {
        self.evt_send.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CanonicalUpdate> {
        self.evt_send.subscribe()
    }
}

#[async_trait]
impl OutboundChannel for WatchChannel {
    async fn publish(&self, update: CanonicalUpdate) -> Result<()> {
        self.evt_send.send_replace(update);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_the_latest_update() {
        let channel = WatchChannel::new();
        let mut sub = channel.subscribe();
        assert!(channel.latest().is_disconnect());

        channel.publish(CanonicalUpdate::new("A", 10, true)).await.unwrap();
        sub.changed().await.unwrap();
        assert_eq!(*sub.borrow_and_update(), CanonicalUpdate::new("A", 10, true));
    }
}
