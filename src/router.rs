use core::fmt;
use core::future::Future;
use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::provider::{BusinessError, ProviderError};

/// Router configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Time limit of a single attempt against one provider, in milliseconds.
    pub attempt_timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 30_000,
        }
    }
}

impl RouterConfig {
    /// Attempt timeout as a [`Duration`].
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

/// Runs operations against redundant providers, moving on to the next one when a provider
/// fails.
///
/// The index of the provider to try first is kept across calls: a provider that answered
/// stays current, one that failed is skipped by every later call until the others fail too.
/// Attempts are sequential and a single call makes at most one attempt per provider.
pub struct MultiProviderRouter<P: ?Sized> {
    providers: Vec<Arc<P>>,
    current: AtomicUsize,
    config: RouterConfig,
}

impl<P: ?Sized> fmt::Debug for MultiProviderRouter<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiProviderRouter")
            .field("providers", &self.providers.len())
            .field("current", &self.current_index())
            .field("config", &self.config)
            .finish()
    }
}

impl<P: ?Sized> MultiProviderRouter<P> {
    /// New router starting at the first provider.
    pub fn new(providers: Vec<Arc<P>>, config: RouterConfig) -> Result<Self, RouterError> {
        if providers.is_empty() {
            return Err(RouterError::NoProviders);
        }
        Ok(Self {
            providers,
            current: AtomicUsize::new(0),
            config,
        })
    }

    /// Index of the provider the next call tries first.
    pub fn current_index(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    /// Number of providers.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Always false, a router has at least one provider.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Configuration.
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Run `op` against the current provider, failing over on provider-level errors.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, RouterError>
    where
        F: Fn(Arc<P>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        self.execute_cancellable(&CancellationToken::new(), op)
            .await
    }

    /// Like [`execute`](Self::execute), giving up with [`RouterError::Cancelled`] as soon as
    /// `cancel` fires. A cancelled attempt does not count as a provider failure.
    pub async fn execute_cancellable<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, RouterError>
    where
        F: Fn(Arc<P>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let count = self.providers.len();
        let timeout = self.config.attempt_timeout();
        let start = self.current_index();
        let mut last = ProviderError::Timeout;

        for attempt in 0..count {
            let index = (start + attempt) % count;
            let provider = Arc::clone(&self.providers[index]);
            log::debug!("attempt {}/{count} on provider {index}", attempt + 1);

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RouterError::Cancelled),
                res = tokio::time::timeout(timeout, op(provider)) => {
                    res.unwrap_or(Err(ProviderError::Timeout))
                }
            };

            let e = match result {
                Ok(value) => return Ok(value),
                Err(ProviderError::Business(e)) => return Err(RouterError::Business(e)),
                Err(e) => e,
            };
            log::warn!("provider {index} failed: {e}");
            if count > 1 {
                // leave the shared index alone if a concurrent call moved it
                let _ = self.current.compare_exchange(
                    index,
                    (index + 1) % count,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
            last = e;
        }

        Err(RouterError::Exhausted {
            attempts: count,
            last,
        })
    }
}

/// Router error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
    /// Constructed without providers.
    #[error("no providers configured")]
    NoProviders,
    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,
    /// A provider answered with a business error.
    #[error(transparent)]
    Business(BusinessError),
    /// Every provider failed.
    #[error("unable to reach the network, please try again later")]
    Exhausted {
        /// attempts made
        attempts: usize,
        /// error of the last attempt
        last: ProviderError,
    },
}

impl RouterError {
    /// The provider error behind [`RouterError::Exhausted`].
    pub fn last_provider_error(&self) -> Option<&ProviderError> {
        match self {
            RouterError::Exhausted { last, .. } => Some(last),
            _ => None,
        }
    }
}
