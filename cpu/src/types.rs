//! Common types and sizing constants for the simulated processor.

use serde::Serialize;

/// Number of slots in each associative memory (SDWAM and PTWAM).
pub const NUM_ASSOC_SLOTS: usize = 16;

/// Number of architectural fault codes.
pub const NUM_FAULT_CODES: usize = 32;

/// Number of interrupt cells.
pub const NUM_INTERRUPT_LINES: usize = 32;

/// Number of combined pointer/address registers.
pub const NUM_POINTER_REGS: usize = 8;

/// Number of index registers.
pub const NUM_INDEX_REGS: usize = 8;

/// Words per page.  The hardware stores page addresses mod 64 and
/// keys the page associative memory on the 12 high bits of the 18-bit
/// computed address, which is only self-consistent with 64-word
/// pages.
pub const PAGE_WORDS: u32 = 64;

/// Largest configurable main memory, in words.
pub const MAX_MEMORY_WORDS: u32 = 1 << 24;

/// The control unit's major state.  Exactly one is active at a time
/// and it decides which translation and protection rules apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CycleState {
    /// Read and decode the next instruction (the initial state).
    Fetch,
    /// Prepare operand addresses and execute.
    Exec,
    /// A fault is being taken; vector through the fault table.
    Fault,
    /// Executing a fault handler's vector pair.
    FaultExec,
    /// The current instruction is being discarded with no partial
    /// effects.
    Abort,
    /// An interrupt is being taken; vector through the cell table.
    Interrupt,
    /// Delay until interrupt set; no fetch/execute work happens.
    Dis,
}

/// The kind of access being made through the appending unit; decides
/// which permission bit and ring bracket apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}
