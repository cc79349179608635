//! Fleet process manager library.
//!
//! One process manager (PM) runs per machine. It spawns game-server worker
//! processes on request, watches their heartbeats, and reports the
//! machine's aggregate capacity to the fleet manager.
//!
//! ## Modules
//!
//! - `manager`: process registry and capacity state machine
//! - `launcher`: worker spawning (real subprocesses, or a mock for tests)
//! - `heartbeat`: periodic and out-of-band capacity reports to the fleet manager
//! - `liveness`: sweep that kills workers whose heartbeats went stale
//! - `api`: HTTP surface used by the fleet manager and by workers

pub mod api;
pub mod client;
pub mod config;
pub mod heartbeat;
pub mod launcher;
pub mod liveness;
pub mod manager;

pub use launcher::{CommandLauncher, Launcher, MockLauncher};
pub use manager::{ManagerSettings, ProcessManager};
