//! # fleet-id
//!
//! Identifier types shared by the process manager and the fleet manager.
//!
//! Every id renders as `{prefix}_{ulid}`:
//! - `vm_01HV4Z2WQXKJNM8GPQY6VBKC3D` for a provisioned machine
//! - `proc_01HV4Z3MXNKPQR9HSTZ7WCLD4E` for a worker process on a machine
//!
//! The ULID half makes ids sort by creation time, which the fleet manager
//! relies on to pick the oldest available machine first.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
