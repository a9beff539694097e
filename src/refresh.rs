use std::{sync::Arc, time::Duration};

use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{
    credentials::{CredentialStore, RefreshVerdict},
    error::{Result, SyncError},
};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshSignal {
    Renewed,
    Reauthenticate(SyncError),
}

/// Periodic credential renewal, independent of playback.
///
/// The timer task is aborted by [`RefreshScheduler::cancel`] or on drop.
pub struct RefreshScheduler {
    ticker: Option<JoinHandle<()>>,
}

impl RefreshScheduler {
    pub fn spawn(
        period: Duration,
        store: Arc<dyn CredentialStore>,
        signals: mpsc::UnboundedSender<RefreshSignal>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;

                let signal = match refresh_once(store.as_ref()).await {
                    Ok(()) => {
                        store.report_refresh_success();
                        RefreshSignal::Renewed
                    }
                    Err(err) => match store.report_refresh_failure(&err) {
                        RefreshVerdict::Continue => continue,
                        RefreshVerdict::Reauthenticate => RefreshSignal::Reauthenticate(err),
                    },
                };

                if signals.send(signal).is_err() {
                    debug!("refresh listener went away, stopping timer");
                    break;
                }
            }
        });

        Self {
            ticker: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.ticker.as_ref().map_or(false, |h| !h.is_finished())
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.ticker.take() {
            handle.abort();
        }
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn refresh_once(store: &dyn CredentialStore) -> Result<()> {
    let token = store
        .refresh_token()
        .ok_or_else(|| SyncError::Refresh("no refresh token available".into()))?;
    match store.refresh(&token).await {
        Ok(renewed) => {
            store.store_token(renewed);
            debug!("credentials renewed");
            Ok(())
        }
        Err(err) => {
            warn!("credential refresh attempt failed: {}", err);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentialStore;
    use async_trait::async_trait;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    };

    struct FlakyStore {
        calls: AtomicU32,
        fail: bool,
        reauth_after: u32,
        failures: AtomicU32,
        stored: Mutex<Vec<String>>,
    }

    impl FlakyStore {
        fn new(fail: bool, reauth_after: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail,
                reauth_after,
                failures: AtomicU32::new(0),
                stored: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CredentialStore for FlakyStore {
        fn refresh_token(&self) -> Option<String> {
            Some("token".into())
        }

        async fn refresh(&self, token: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(SyncError::Refresh("denied".into()))
            } else {
                Ok(format!("{}+{}", token, self.calls.load(Ordering::SeqCst)))
            }
        }

        fn store_token(&self, token: String) {
            self.stored.lock().unwrap().push(token);
        }

        fn report_refresh_failure(&self, _error: &SyncError) -> RefreshVerdict {
            let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
            if failures >= self.reauth_after {
                RefreshVerdict::Reauthenticate
            } else {
                RefreshVerdict::Continue
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn renews_once_per_period() {
        let store = FlakyStore::new(false, 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _scheduler = RefreshScheduler::spawn(Duration::from_secs(60), store.clone(), tx);

        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);

        assert_eq!(rx.recv().await, Some(RefreshSignal::Renewed));
        assert_eq!(rx.recv().await, Some(RefreshSignal::Renewed));
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
        assert_eq!(*store.stored.lock().unwrap(), vec!["token+1", "token+2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn renewed_token_replaces_the_old_one() {
        let store = Arc::new(MemoryCredentialStore::new(Some("t0".into()), 3));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _scheduler = RefreshScheduler::spawn(Duration::from_secs(60), store.clone(), tx);

        assert_eq!(rx.recv().await, Some(RefreshSignal::Renewed));
        let first = store.refresh_token().unwrap();
        assert_ne!(first, "t0");

        // the next cycle must present the rotated token, not the spent one
        assert_eq!(rx.recv().await, Some(RefreshSignal::Renewed));
        let second = store.refresh_token().unwrap();
        assert_ne!(second, first);
        assert_eq!(store.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn single_failures_are_not_fatal() {
        let store = FlakyStore::new(true, 3);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _scheduler = RefreshScheduler::spawn(Duration::from_secs(10), store.clone(), tx);

        let signal = rx.recv().await;
        assert_eq!(signal, Some(RefreshSignal::Reauthenticate(SyncError::Refresh("denied".into()))));
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert!(store.stored.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_the_timer() {
        let store = FlakyStore::new(false, 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = RefreshScheduler::spawn(Duration::from_secs(10), store.clone(), tx);
        assert!(scheduler.is_running());

        scheduler.cancel();
        assert!(!scheduler.is_running());
        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
        assert_eq!(rx.recv().await, None);
    }
}
