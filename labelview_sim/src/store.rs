//! In-memory solution store with fault injection.

use async_trait::async_trait;
use labelview_env::{EnvError, SolutionStore, StreamKind};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Write/read counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub loads: u64,
    pub writes: u64,
    pub failed_writes: u64,
}

#[derive(Default)]
struct Faults {
    /// Fail this many upcoming writes
    fail_next: u32,

    /// Probability that a write fails, drawn from `rng`
    failure_rate: f64,

    rng: Option<ChaCha8Rng>,

    /// Scheduler yields before a write lands
    latency_yields: u32,
}

/// Simulated storage backend.
///
/// Writes can be delayed by a number of scheduler yields (so saves overlap
/// with later edits) and can fail deterministically or at a seeded rate.
#[derive(Default)]
pub struct SimStore {
    data: Mutex<HashMap<(StreamKind, String), Vec<u8>>>,
    stats: Mutex<StoreStats>,
    faults: Mutex<Faults>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` writes.
    pub fn fail_next(&self, n: u32) {
        lock(&self.faults).fail_next = n;
    }

    /// Fail writes with probability `rate`, drawing from `rng`.
    pub fn set_failure_rate(&self, rate: f64, rng: ChaCha8Rng) {
        let mut faults = lock(&self.faults);
        faults.failure_rate = rate.clamp(0.0, 1.0);
        faults.rng = Some(rng);
    }

    pub fn set_latency_yields(&self, yields: u32) {
        lock(&self.faults).latency_yields = yields;
    }

    /// Stop injecting faults.
    pub fn heal(&self) {
        let mut faults = lock(&self.faults);
        faults.fail_next = 0;
        faults.failure_rate = 0.0;
    }

    pub fn stats(&self) -> StoreStats {
        *lock(&self.stats)
    }

    pub fn get(&self, stream: StreamKind, folder: &str) -> Option<Vec<u8>> {
        lock(&self.data).get(&(stream, folder.to_string())).cloned()
    }

    /// Place bytes directly, bypassing faults and counters.
    pub fn put(&self, stream: StreamKind, folder: &str, bytes: Vec<u8>) {
        lock(&self.data).insert((stream, folder.to_string()), bytes);
    }

    fn should_fail(&self) -> bool {
        let mut faults = lock(&self.faults);
        if faults.fail_next > 0 {
            faults.fail_next -= 1;
            return true;
        }
        let rate = faults.failure_rate;
        match faults.rng.as_mut() {
            Some(rng) if rate > 0.0 => rng.gen_bool(rate),
            _ => false,
        }
    }
}

#[async_trait]
impl SolutionStore for SimStore {
    async fn load(&self, stream: StreamKind, folder: &str) -> Result<Option<Vec<u8>>, EnvError> {
        lock(&self.stats).loads += 1;
        Ok(self.get(stream, folder))
    }

    async fn save(&self, stream: StreamKind, folder: &str, bytes: Vec<u8>) -> Result<(), EnvError> {
        let yields = lock(&self.faults).latency_yields;
        for _ in 0..yields {
            tokio::task::yield_now().await;
        }

        if self.should_fail() {
            lock(&self.stats).failed_writes += 1;
            debug!(%stream, folder, "injected write failure");
            return Err(EnvError::storage(format!("injected failure writing {} of {}", stream, folder)));
        }

        lock(&self.stats).writes += 1;
        self.put(stream, folder, bytes);
        Ok(())
    }

    async fn folders(&self) -> Result<Vec<String>, EnvError> {
        let folders: BTreeSet<String> = lock(&self.data).keys().map(|(_, f)| f.clone()).collect();
        Ok(folders.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[tokio::test]
    async fn test_round_trip_and_counters() {
        let store = SimStore::new();
        assert_eq!(store.load(StreamKind::Objects, "a").await.unwrap(), None);

        store.save(StreamKind::Objects, "a", vec![1, 2]).await.unwrap();
        store.save(StreamKind::Labels, "b", vec![3]).await.unwrap();
        assert_eq!(store.load(StreamKind::Objects, "a").await.unwrap(), Some(vec![1, 2]));
        assert_eq!(store.folders().await.unwrap(), vec!["a".to_string(), "b".to_string()]);

        let stats = store.stats();
        assert_eq!(stats.writes, 2);
        assert_eq!(stats.loads, 2);
    }

    #[tokio::test]
    async fn test_fail_next() {
        let store = SimStore::new();
        store.fail_next(2);
        assert!(store.save(StreamKind::Labels, "a", vec![1]).await.is_err());
        assert!(store.save(StreamKind::Labels, "a", vec![1]).await.is_err());
        assert!(store.save(StreamKind::Labels, "a", vec![1]).await.is_ok());
        assert_eq!(store.stats().failed_writes, 2);
    }

    #[tokio::test]
    async fn test_failure_rate_is_seeded() {
        async fn pattern(seed: u64) -> Vec<bool> {
            let store = SimStore::new();
            store.set_failure_rate(0.5, ChaCha8Rng::seed_from_u64(seed));
            let mut out = Vec::new();
            for _ in 0..32 {
                out.push(store.save(StreamKind::Objects, "a", vec![0]).await.is_ok());
            }
            out
        }
        let a = pattern(9).await;
        assert_eq!(a, pattern(9).await);
        assert!(a.iter().any(|ok| *ok) && a.iter().any(|ok| !*ok));
    }
}
