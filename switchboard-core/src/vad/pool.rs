//! Fixed-size pool of endpointer instances.
//!
//! Silero keeps recurrent hidden state inside the model, so an instance
//! must never serve two calls at once. Each session acquires an exclusive
//! `Endpointer` for the duration of its call; the guard resets and returns
//! it on drop, which also covers task cancellation.
//!
//! The pool mutex is only touched at acquire/release boundaries. Per-chunk
//! inference runs on the session's exclusively held instance with no
//! locking at all.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use super::Endpointer;

/// Pool of interchangeable endpointer instances.
pub struct VadPool {
    models: Arc<Mutex<Vec<Endpointer>>>,
    permits: Arc<Semaphore>,
    size: usize,
}

impl VadPool {
    pub fn new(models: Vec<Endpointer>) -> Self {
        let size = models.len();
        Self {
            models: Arc::new(Mutex::new(models)),
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Build a pool of `size` instances from a factory.
    pub fn with_factory(size: usize, factory: impl Fn() -> Endpointer) -> Self {
        Self::new((0..size.max(1)).map(|_| factory()).collect())
    }

    /// Borrow an instance, waiting if every one is in use.
    pub async fn acquire(&self) -> PooledVad {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .expect("pool semaphore is never closed");
        let endpointer = self
            .models
            .lock()
            .pop()
            .expect("permit held, pool cannot be empty");
        debug!(available = self.available(), "VAD model acquired");
        PooledVad {
            endpointer: Some(endpointer),
            models: Arc::clone(&self.models),
            _permit: permit,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Instances currently available without waiting.
    pub fn available(&self) -> usize {
        self.models.lock().len()
    }
}

/// Exclusive loan of one endpointer; returned (reset) to the pool on drop.
pub struct PooledVad {
    endpointer: Option<Endpointer>,
    models: Arc<Mutex<Vec<Endpointer>>>,
    _permit: OwnedSemaphorePermit,
}

impl std::ops::Deref for PooledVad {
    type Target = Endpointer;

    fn deref(&self) -> &Endpointer {
        self.endpointer.as_ref().expect("endpointer present until drop")
    }
}

impl std::ops::DerefMut for PooledVad {
    fn deref_mut(&mut self) -> &mut Endpointer {
        self.endpointer.as_mut().expect("endpointer present until drop")
    }
}

impl Drop for PooledVad {
    fn drop(&mut self) {
        if let Some(mut endpointer) = self.endpointer.take() {
            endpointer.reset();
            self.models.lock().push(endpointer);
        }
        // The permit drops after the push, so a waiter always finds an
        // instance in the vector.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VadConfig;
    use crate::vad::EnergyVad;
    use std::time::Duration;

    fn pool(size: usize) -> VadPool {
        VadPool::with_factory(size, || {
            Endpointer::new(Box::new(EnergyVad::new()), VadConfig::default())
        })
    }

    #[tokio::test]
    async fn acquire_and_drop_returns_instance() {
        let pool = pool(2);
        assert_eq!(pool.available(), 2);
        {
            let _a = pool.acquire().await;
            let _b = pool.acquire().await;
            assert_eq!(pool.available(), 0);
        }
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn acquire_blocks_until_release() {
        let pool = Arc::new(pool(1));
        let first = pool.acquire().await;

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let _second = pool.acquire().await;
            })
        };

        // The waiter cannot finish while the first loan is live.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should complete after release")
            .expect("waiter task");
    }

    #[tokio::test]
    async fn dropped_mid_use_instance_comes_back_reset() {
        let pool = pool(1);
        {
            let mut loan = pool.acquire().await;
            let mut state = crate::vad::VadSessionState::default();
            loan.process_chunk(&vec![0.4f32; 640], 16_000, &mut state, None);
        }
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn sessions_get_distinct_instances() {
        let pool = pool(3);
        let a = pool.acquire().await;
        let b = pool.acquire().await;
        let c = pool.acquire().await;
        // All three instances are out at once; exclusivity is structural.
        assert_eq!(pool.available(), 0);
        drop((a, b, c));
        assert_eq!(pool.available(), 3);
    }
}
