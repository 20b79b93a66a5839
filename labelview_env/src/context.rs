//! Core environment context trait for LabelView sessions.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// The central interface for environment interaction.
///
/// Abstracts the clock and task spawning so the autosave machinery can run
/// under tokio in production and under a virtual clock in simulation.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`
/// - **Simulation**: `SimContext` (in `labelview_sim`) - manually advanced clock
#[async_trait]
pub trait LabelViewContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Debounce deadlines are expressed against this clock.
    fn now(&self) -> Duration;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances the virtual clock
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;
}
