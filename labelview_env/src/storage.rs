//! Solution storage abstraction.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::StreamKind;

/// Persistent storage for the two solution streams of a scene folder.
///
/// # Implementations
///
/// - **Production**: `FsStore` - one file per (folder, stream) under a root directory
/// - **Simulation**: `SimStore` - in-memory map with latency and failure injection
///
/// # Atomicity
///
/// `save` must fully replace the previous content of the stream. A concurrent
/// `load` observes either the old bytes or the new bytes, never a mix.
#[async_trait]
pub trait SolutionStore: Send + Sync + 'static {
    /// Loads the persisted bytes of a stream.
    ///
    /// # Returns
    /// * `Ok(Some(bytes))` - the stream has been saved before
    /// * `Ok(None)` - nothing persisted yet ("no solution yet")
    /// * `Err(EnvError)` - the backend failed
    async fn load(&self, stream: StreamKind, folder: &str) -> Result<Option<Vec<u8>>, EnvError>;

    /// Replaces the persisted bytes of a stream.
    async fn save(&self, stream: StreamKind, folder: &str, bytes: Vec<u8>) -> Result<(), EnvError>;

    /// Lists the scene folders known to the store.
    async fn folders(&self) -> Result<Vec<String>, EnvError>;
}
