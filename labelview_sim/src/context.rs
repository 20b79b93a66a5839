//! Simulation context implementing LabelViewContext for deterministic testing.

use async_trait::async_trait;
use labelview_env::LabelViewContext;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::trace;

/// Simulation context backed by a virtual clock.
///
/// - The clock only moves when the scenario advances it (or a task sleeps)
/// - Every random stream is derived from the master seed
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Current virtual time (nanoseconds since simulation start)
    virtual_time_ns: Arc<Mutex<u64>>,
}

impl SimContext {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            virtual_time_ns: Arc::new(Mutex::new(0)),
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn advance_time(&self, duration: Duration) {
        let mut time = self.virtual_time_ns.lock().unwrap_or_else(PoisonError::into_inner);
        *time += duration.as_nanos() as u64;
    }

    pub fn time_ns(&self) -> u64 {
        *self.virtual_time_ns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Independent RNG stream `stream` of this seed.
    pub fn rng(&self, stream: u64) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.seed.wrapping_mul(0x517cc1b727220a95) ^ stream)
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            virtual_time_ns: Arc::clone(&self.virtual_time_ns),
        }
    }
}

#[async_trait]
impl LabelViewContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    async fn sleep(&self, duration: Duration) {
        // Sleeping advances virtual time
        self.advance_time(duration);
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        trace!(task = name, "spawn");
        tokio::spawn(future);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_sim_context_time() {
        let ctx = SimContext::new(42);
        assert_eq!(ctx.now(), Duration::ZERO);

        ctx.advance_time(Duration::from_secs(1));
        ctx.advance_time(Duration::from_millis(500));
        assert_eq!(ctx.now(), Duration::from_millis(1500));
    }

    #[test]
    fn test_clone_shares_time() {
        let ctx1 = SimContext::new(42);
        let ctx2 = ctx1.clone();
        ctx1.advance_time(Duration::from_secs(5));
        assert_eq!(ctx1.now(), ctx2.now());
    }

    #[test]
    fn test_rng_streams_are_deterministic() {
        let a = SimContext::new(7);
        let b = SimContext::new(7);
        assert_eq!(a.rng(1).gen::<u64>(), b.rng(1).gen::<u64>());
        assert_ne!(a.rng(1).gen::<u64>(), a.rng(2).gen::<u64>());
    }

    #[tokio::test]
    async fn test_sleep_advances_clock() {
        let ctx = SimContext::new(1);
        ctx.sleep(Duration::from_millis(250)).await;
        assert_eq!(ctx.now(), Duration::from_millis(250));
    }
}
