//! Fleet manager library.
//!
//! The fleet manager is the single authority over the machine fleet. It
//! places processes on machines with spare capacity, provisions machines
//! when none are available, and retires machines once they report empty
//! or stop heartbeating.

pub mod api;
pub mod client;
pub mod config;
pub mod fleet;
pub mod provider;
pub mod registry;
pub mod state;
pub mod sweep;

pub use client::{HttpMachineApi, MachineApi};
pub use fleet::{Allocation, AllocationError, Fleet, FleetSettings, HeartbeatOutcome};
pub use provider::{CloudProvider, LocalProcessProvider, MockProvider};
pub use state::AppState;
