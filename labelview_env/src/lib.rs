//! LabelView Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" seam that lets the LabelView
//! annotation engine run against **Production** (tokio + filesystem) and
//! **Simulation** (virtual clock + in-memory store) environments.
//!
//! # Core Concept
//!
//! The geometry engine itself is synchronous. Everything that touches the
//! outside world goes through two traits:
//! - Time (`now()`, `sleep()`) and task spawning via [`LabelViewContext`]
//! - Solution persistence (`load()`, `save()`) via [`SolutionStore`]
//!
//! # Example
//!
//! ```ignore
//! use labelview_env::{FsStore, SolutionStore, StreamKind, TokioContext};
//!
//! async fn persist<S: SolutionStore>(store: &S, folder: &str, bytes: Vec<u8>) {
//!     if let Err(e) = store.save(StreamKind::Labels, folder, bytes).await {
//!         eprintln!("save failed: {}", e);
//!     }
//! }
//! ```

mod context;
mod storage;
mod types;
mod error;
mod tokio_impl;

pub use context::LabelViewContext;
pub use storage::SolutionStore;
pub use types::{SaveEnvelope, SessionId, StreamKind};
pub use error::EnvError;
pub use tokio_impl::{FsStore, TokioContext};
