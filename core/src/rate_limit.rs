use anyhow::{anyhow, Result};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time;

/// A token bucket implemented with a [`Semaphore`].
///
/// Tokens are permits on the semaphore. A background task tops the bucket up
/// every `interval` and exits once the bucket itself has been dropped, so a
/// short-lived session does not leave a refill task behind.
#[derive(Debug)]
pub struct TokenBucket {
    semaphore: Arc<Semaphore>,
    capacity: u32,
}

impl TokenBucket {
    /// Create a new [`TokenBucket`]. Must be called inside a Tokio runtime.
    ///
    /// `capacity` is the maximum burst size. `tokens_per_interval` are added
    /// every `interval` until the bucket reaches full capacity.
    pub fn new(capacity: u32, tokens_per_interval: u32, interval: Duration) -> Self {
        let semaphore = Arc::new(Semaphore::new(capacity as usize));
        let weak: Weak<Semaphore> = Arc::downgrade(&semaphore);
        let cap = capacity as usize;
        let add = tokens_per_interval as usize;
        if add > 0 {
            tokio::spawn(async move {
                let mut ticker = time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(sem) = weak.upgrade() else {
                        break;
                    };
                    let available = sem.available_permits();
                    if available < cap {
                        sem.add_permits((cap - available).min(add));
                    }
                }
            });
        }
        Self {
            semaphore,
            capacity,
        }
    }

    /// Acquire `tokens` from the bucket, waiting if necessary. Requests larger
    /// than the capacity are clamped so they cannot wait forever.
    pub async fn acquire(&self, tokens: u32) -> Result<()> {
        let tokens = tokens.min(self.capacity);
        self.semaphore
            .acquire_many(tokens)
            .await
            .map_err(|_| anyhow!("token bucket closed"))?
            .forget();
        Ok(())
    }

    /// Return the current number of available tokens.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
