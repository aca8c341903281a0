//! The seam between the cycle engine and the external operator units.
//!
//! The engine decodes the instruction and prepares its operand; the
//! arithmetic and EIS operator implementations live outside this
//! crate, behind [`OperandExecutor`].  Executors do not raise faults
//! directly: they report an [`ExecError`] and the engine maps it onto
//! the corresponding fault code.

use base::prelude::*;

use crate::events::FaultCode;
use crate::registers::RegisterFile;

/// The operand the engine resolved for an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// A `du`/`dl` literal.
    Immediate(u64),
    /// A memory operand: its absolute address and the word fetched
    /// from it.
    Memory { abs: u32, word: u64 },
}

/// Errors an operator unit may report; each maps to one fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    Overflow,
    DivideCheck,
    IllegalProcedure,
}

impl ExecError {
    pub fn fault_code(self) -> FaultCode {
        match self {
            ExecError::Overflow => FaultCode::Overflow,
            ExecError::DivideCheck => FaultCode::DivideCheck,
            ExecError::IllegalProcedure => FaultCode::IllegalProcedure,
        }
    }
}

pub trait OperandExecutor {
    /// Execute one decoded instruction whose operand the engine has
    /// already resolved.  The register file is the executor's to
    /// mutate.  Returning `Ok(Some(word))` asks the engine to store
    /// `word` back to the operand's absolute address; the engine
    /// performs the write and keeps its held instruction words
    /// coherent.
    fn execute(
        &mut self,
        instruction: &Instruction,
        operand: Operand,
        regs: &mut RegisterFile,
    ) -> Result<Option<u64>, ExecError>;
}

/// An executor that treats every defined opcode as a no-op.  Used by
/// the command-line driver and by engine tests, which exercise the
/// cycle machinery rather than the operator units.
#[derive(Debug, Default)]
pub struct NullExecutor;

impl OperandExecutor for NullExecutor {
    fn execute(
        &mut self,
        _instruction: &Instruction,
        _operand: Operand,
        _regs: &mut RegisterFile,
    ) -> Result<Option<u64>, ExecError> {
        Ok(None)
    }
}
