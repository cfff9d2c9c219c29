//! Cooperative cancellation shared by every step of one upload call.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// The cancellation view one call observes: the client-wide abort token that
/// was current when the call started, plus the caller's own token if any.
#[derive(Clone, Debug, Default)]
pub struct CancelSignal {
    global: CancellationToken,
    local: Option<CancellationToken>,
}

impl CancelSignal {
    pub fn new(global: CancellationToken, local: Option<CancellationToken>) -> Self {
        Self { global, local }
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.global.is_cancelled() || self.local.as_ref().is_some_and(|t| t.is_cancelled())
    }

    /// Resolves once either token is cancelled.
    pub async fn cancelled(&self) {
        match &self.local {
            Some(local) => {
                tokio::select! {
                    _ = self.global.cancelled() => {}
                    _ = local.cancelled() => {}
                }
            }
            None => self.global.cancelled().await,
        }
    }

    pub(crate) fn check(&self) -> crate::Result<()> {
        if self.is_cancelled() {
            Err(crate::UploadError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Client-wide abort surface. `abort` cancels the current token and installs
/// a fresh one, so calls started afterwards are unaffected.
#[derive(Clone, Debug, Default)]
pub struct AbortHandle {
    current: Arc<Mutex<CancellationToken>>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// The token new calls should capture.
    pub fn token(&self) -> CancellationToken {
        match self.current.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Cancels every call that captured the current token.
    pub fn abort(&self) {
        let previous = match self.current.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        previous.cancel();
    }

    pub(crate) fn signal(&self, local: Option<CancellationToken>) -> CancelSignal {
        CancelSignal::new(self.token(), local)
    }
}
