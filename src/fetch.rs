use crate::error::AppError;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_PACING_EVERY: usize = 10;
pub const DEFAULT_PACING_DELAY: Duration = Duration::from_millis(200);

enum Outcome<K, T> {
    Done(K, T),
    Failed(AppError),
    Skipped,
}

/// Fans a batch of keys out to one task each and joins them all.
#[derive(Debug, Clone, Copy)]
pub struct WindowFetcher {
    pacing_every: usize,
    pacing_delay: Duration,
}

impl Default for WindowFetcher {
    fn default() -> Self {
        Self::new(DEFAULT_PACING_EVERY, DEFAULT_PACING_DELAY)
    }
}

impl WindowFetcher {
    pub fn new(pacing_every: usize, pacing_delay: Duration) -> Self {
        Self {
            pacing_every,
            pacing_delay,
        }
    }

    /// Fetches every distinct key and returns the results in key order.
    ///
    /// The first failure cancels the batch and is returned as is; results
    /// of tasks still in flight are discarded. A batch cancelled by the
    /// caller returns [`AppError::Cancelled`] when any key was skipped.
    pub async fn fetch_all<K, T, F, Fut>(
        &self,
        keys: impl IntoIterator<Item = K>,
        cancel: &CancellationToken,
        fetch: F,
    ) -> Result<Vec<(K, T)>, AppError>
    where
        K: Ord + Clone + Display + Send + 'static,
        T: Send + 'static,
        F: Fn(K) -> Fut,
        Fut: Future<Output = Result<T, AppError>> + Send + 'static,
    {
        let keys: BTreeSet<K> = keys.into_iter().collect();
        let total = keys.len();
        let batch = cancel.child_token();
        let mut tasks = JoinSet::new();

        for (launched, key) in keys.into_iter().enumerate() {
            if launched > 0 && self.pacing_every > 0 && launched % self.pacing_every == 0 {
                tokio::time::sleep(self.pacing_delay).await;
            }
            let token = batch.clone();
            let work = fetch(key.clone());
            tasks.spawn(async move {
                if token.is_cancelled() {
                    return Outcome::Skipped;
                }
                match work.await {
                    Ok(value) => Outcome::Done(key, value),
                    Err(err) => {
                        token.cancel();
                        Outcome::Failed(err)
                    }
                }
            });
        }

        let mut results = BTreeMap::new();
        let mut first_error = None;
        let mut skipped = 0usize;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.unwrap_or_else(|err| {
                batch.cancel();
                Outcome::Failed(err.into())
            });
            match outcome {
                Outcome::Done(key, value) => {
                    debug!(%key, "fetched");
                    results.insert(key, value);
                }
                Outcome::Failed(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Outcome::Skipped => skipped += 1,
            }
        }

        if let Some(err) = first_error {
            warn!(
                total,
                completed = results.len(),
                skipped,
                error = %err,
                "fetch batch failed"
            );
            return Err(err);
        }
        if skipped > 0 {
            warn!(total, skipped, "fetch batch cancelled by caller");
            return Err(AppError::Cancelled);
        }
        info!(total, "fetch batch complete");
        Ok(results.into_iter().collect())
    }
}
