use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{Result, SyncError};

/// What the credential owner wants done after a failed renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshVerdict {
    Continue,
    Reauthenticate,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    fn refresh_token(&self) -> Option<String>;

    /// Exchange `token` for a renewed one.
    async fn refresh(&self, token: &str) -> Result<String>;

    /// Persist the token returned by a successful [`CredentialStore::refresh`].
    fn store_token(&self, token: String);

    /// Called for every failed cycle, including a missing token.
    fn report_refresh_failure(&self, error: &SyncError) -> RefreshVerdict;

    fn report_refresh_success(&self) {}
}

/// Keeps the token in memory and asks for re-authentication after
/// `max_failures` consecutive failed renewals.
pub struct MemoryCredentialStore {
    inner: Mutex<StoreState>,
    max_failures: u32,
}

struct StoreState {
    token: Option<String>,
    consecutive_failures: u32,
}

impl MemoryCredentialStore {
    pub fn new(token: Option<String>, max_failures: u32) -> Self {
        Self {
            inner: Mutex::new(StoreState {
                token,
                consecutive_failures: 0,
            }),
            max_failures: max_failures.max(1),
        }
    }

    pub fn set_token(&self, token: Option<String>) {
        let mut state = self.lock();
        state.token = token;
        state.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        // a poisoned lock still holds a usable token
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    fn refresh_token(&self) -> Option<String> {
        self.lock().token.clone()
    }

    async fn refresh(&self, token: &str) -> Result<String> {
        let state = self.lock();
        match state.token.as_deref() {
            Some(current) if current == token => Ok(uuid::Uuid::new_v4().to_string()),
            Some(_) => Err(SyncError::Refresh("token was replaced during renewal".into())),
            None => Err(SyncError::Refresh("token was revoked".into())),
        }
    }

    fn store_token(&self, token: String) {
        self.lock().token = Some(token);
    }

    fn report_refresh_failure(&self, error: &SyncError) -> RefreshVerdict {
        let mut state = self.lock();
        state.consecutive_failures += 1;
        warn!(
            failures = state.consecutive_failures,
            max = self.max_failures,
            "credential refresh failed: {}",
            error
        );
        if state.consecutive_failures >= self.max_failures {
            RefreshVerdict::Reauthenticate
        } else {
            RefreshVerdict::Continue
        }
    }

    fn report_refresh_success(&self) {
        let mut state = self.lock();
        if state.consecutive_failures > 0 {
            info!("credential refresh recovered");
        }
        state.consecutive_failures = 0;
    }
}
