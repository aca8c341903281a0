//! Simulator core for a 36-bit segmented, paged, ring-protected
//! processor: the control unit cycle engine, the appending unit with
//! its associative translation caches, the fault/interrupt event
//! model and the register file.
//!
//! The arithmetic and EIS operator units, the I/O multiplexer and the
//! host command interface are external collaborators: the crate
//! exposes the memory primitives, `set_interrupt`, the
//! [`OperandExecutor`] seam and a read-only snapshot for them.
#![crate_name = "cpu"]

mod append;
mod assoc;
mod context;
mod control;
mod events;
mod executor;
mod memory;
mod registers;
mod stop;
mod types;

pub use append::{bar_relocate, AppendError, AppendUnit, SegAccess};
pub use assoc::{Ptw, PtwAm, Sdw, SdwAm};
pub use context::{CpuContext, CpuSnapshot, SwitchSettings};
pub use control::ControlUnitData;
pub use events::{
    AccessDenied, AcvCause, EventUnit, FaultCode, FaultDetail, PendingFault,
};
pub use executor::{ExecError, NullExecutor, Operand, OperandExecutor};
pub use memory::{MemoryConfiguration, MemoryOpFailure, MemoryUnit};
pub use registers::{
    BaseAddressRegister, DescriptorBase, IndicatorRegister, ModeRegister, PointerRegister,
    ProcedurePointer, RegisterFile, TemporaryPointer,
};
pub use stop::SimStop;
pub use types::{
    AccessKind, CycleState, MAX_MEMORY_WORDS, NUM_ASSOC_SLOTS, NUM_FAULT_CODES,
    NUM_INDEX_REGS, NUM_INTERRUPT_LINES, NUM_POINTER_REGS, PAGE_WORDS,
};
