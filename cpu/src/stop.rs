//! Stop conditions the host must handle.
//!
//! Faults are part of the simulated machine and never surface as Rust
//! errors; they are routed through the event unit and serviced by the
//! fault cycle.  The conditions here are different: they cannot occur
//! on the real hardware and indicate either a simulator defect or a
//! machine image that has wandered into uninitialised memory.  They
//! propagate out of the cycle engine as ordinary errors.

use std::error;
use std::fmt::{self, Display, Formatter};

use crate::memory::MemoryOpFailure;

#[derive(Debug, Clone)]
pub enum SimStop {
    /// The engine fetched an all-zero instruction pair: the machine
    /// is executing cleared memory.
    MemClear { addr: u32 },
    /// A fault was raised while the trouble-fault handler itself was
    /// running; the real hardware has no third nesting level, so this
    /// is a simulation defect or a hopelessly wedged machine image.
    Bug(String),
    /// A memory access escaped the appending unit's bounds checks.
    Memory(MemoryOpFailure),
}

impl Display for SimStop {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            SimStop::MemClear { addr } => {
                write!(f, "executing cleared memory at {addr:>08o}")
            }
            SimStop::Bug(msg) => write!(f, "simulation bug: {msg}"),
            SimStop::Memory(failure) => write!(f, "{failure}"),
        }
    }
}

impl error::Error for SimStop {}

impl From<MemoryOpFailure> for SimStop {
    fn from(failure: MemoryOpFailure) -> SimStop {
        SimStop::Memory(failure)
    }
}
