//! Remote-control shim for the patch installer
//!
//! Verification and repair often run in a separate elevated process from the
//! frontend driving them. This crate defines the [`PatchEngine`] trait
//! mirroring the installer API and two implementations:
//!
//! - [`LocalPatchEngine`] — calls straight into the installer, in process
//! - [`RemotePatchEngine`] — speaks a framed wire protocol to a
//!   [`WorkerSession`], either in a spawned `zipatch-worker` child process
//!   over stdio or on an in-process pipe
//!
//! Long calls are cancellable through caller-chosen token ids, and progress
//! arrives as out-of-band pushes with a monotonic sequence so stale frames
//! are discarded.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use zipatch_rpc::{PatchEngine, RemotePatchEngine};
//!
//! # async fn example() -> zipatch_rpc::Result<()> {
//! let engine = RemotePatchEngine::spawn_worker(Path::new("zipatch-worker"))?;
//! engine.construct(Path::new("game.patch.index")).await?;
//! engine.set_targets_read_only(Path::new("/opt/game")).await?;
//! engine.verify_files(1, false, 8).await?;
//! engine.dispose().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod engine;
mod error;
mod local;
pub mod protocol;
mod remote;
mod worker;

pub use engine::{PatchEngine, ProgressEvent, ProgressHandler};
pub use error::{Error, Result};
pub use local::LocalPatchEngine;
pub use remote::RemotePatchEngine;
pub use worker::WorkerSession;
