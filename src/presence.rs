use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use tracing::debug;

/// Read side of the listener count.
pub trait PresenceSource: Send + Sync {
    fn listener_count(&self) -> usize;
}

/// Counts connected listeners. Each connection holds a [`ListenerGuard`].
#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    count: Arc<AtomicUsize>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self) -> ListenerGuard {
        let now = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(listeners = now, "listener joined");
        ListenerGuard {
            count: self.count.clone(),
        }
    }
}

impl PresenceSource for PresenceTracker {
    fn listener_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct ListenerGuard {
    count: Arc<AtomicUsize>,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        let before = self.count.fetch_sub(1, Ordering::SeqCst);
        debug!(listeners = before.saturating_sub(1), "listener left");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_track_connected_listeners() {
        let tracker = PresenceTracker::new();
        assert_eq!(tracker.listener_count(), 0);

        let a = tracker.join();
        let b = tracker.clone().join();
        assert_eq!(tracker.listener_count(), 2);

        drop(a);
        assert_eq!(tracker.listener_count(), 1);
        drop(b);
        assert_eq!(tracker.listener_count(), 0);
    }
}
