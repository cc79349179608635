//! Typed ID definitions.

use crate::define_id;

define_id!(MachineId, "vm");
define_id!(ProcessId, "proc");
