//! LabelView Deterministic Simulation Harness
//!
//! Drives real [`labelview_core::SceneSession`]s through scripted annotation
//! work against synthetic scenes whose ground truth is known.
//!
//! # Sources of non-determinism
//!
//! - **Time**: [`SimContext`] holds a virtual clock that only moves when a
//!   scenario steps it, so autosave debounce windows are exact
//! - **Storage**: [`SimStore`] keeps solutions in memory and injects latency
//!   (scheduler yields) and failures drawn from a seeded RNG
//! - **Randomness**: scenes and edit scripts derive from one 64-bit seed
//!
//! # Usage
//!
//! ```ignore
//! use labelview_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::AutosaveStorm);
//! assert!(result.passed);
//! ```

mod context;
mod runner;
mod store;
pub mod scenarios;
pub mod synth;

pub use context::SimContext;
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use store::{SimStore, StoreStats};
pub use synth::{SceneSynth, SynthConfig, SynthScene, TruthObject};
