//! # fleet-protocol
//!
//! JSON bodies exchanged between the fleet manager (FM), the per-machine
//! process managers (PM), and the worker processes a PM supervises.
//!
//! Field names and enum variants are camelCase on the wire. Policy
//! rejections (`AlreadyFull`, `NotEmpty`, ...) are ordinary 200 bodies;
//! only missing resources and malformed requests use [`problem::ApiError`].

mod capacity;
pub mod fleet;
pub mod problem;
pub mod process;

pub use capacity::{CapacityState, LifecycleState, MachineState};
