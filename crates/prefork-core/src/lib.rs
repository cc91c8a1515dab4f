//! # prefork-core
//!
//! Supervision engine for multi-worker process trees: a long-lived
//! parent keeps N forked workers alive, detects liveness through
//! per-worker heartbeat pipes, and walks unresponsive workers through a
//! staged, backoff-scheduled kill protocol.
//!
//! ## Features
//!
//! - **Monitors**: per-worker health records with a one-way kill state
//!   machine (graceful signal → immediate signal → SIGKILL)
//! - **Process management**: fork-based spawning with a private
//!   heartbeat pipe per worker, multiplexed by one poll-driven tick loop
//! - **Worker pools**: slot-indexed keepalive with staggered, jittered
//!   restarts, live scale up/down, stop/restart/reload fan-out
//! - **Heartbeats**: automatic in-child emitter with a configurable
//!   write-failure policy
//!
//! ## Example
//!
//! ```rust,no_run
//! use prefork_core::config::SupervisorConfig;
//! use prefork_core::controller::MultiWorkerController;
//! use prefork_core::manager::ProcessManager;
//!
//! let config = SupervisorConfig {
//!     workers: 4,
//!     ..Default::default()
//! };
//! let manager = ProcessManager::new(config.clone()).unwrap();
//! let controller = MultiWorkerController::new(&config).unwrap();
//!
//! controller.run(|_worker_id| {
//!     manager.spawn(move |_target| {
//!         // worker body; heartbeats are emitted automatically
//!         loop {
//!             std::thread::sleep(std::time::Duration::from_secs(1));
//!         }
//!     })
//! });
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod controller;
pub mod heartbeat;
pub mod manager;
pub mod monitor;
pub mod signal;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{CloexecMode, SupervisorConfig};
    pub use crate::controller::MultiWorkerController;
    pub use crate::heartbeat::{HeartbeatPolicy, WorkerTarget};
    pub use crate::manager::ProcessManager;
    pub use crate::monitor::{Monitor, Reaped, WorkerExit};
}

/// Re-export commonly used types at the crate root.
pub use config::SupervisorConfig;
pub use controller::MultiWorkerController;
pub use heartbeat::{HeartbeatPolicy, WorkerTarget};
pub use manager::ProcessManager;
pub use monitor::{Monitor, WorkerExit};
