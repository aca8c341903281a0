//! The `base` crate defines the machine-word and instruction-word
//! representations which are useful in both a simulator and other
//! associated tools.  The idea is that if you want to write a
//! disassembler or an assembler, it would depend on the base crate
//! but would not need to depend on the simulator library itself.

pub mod instruction;
pub mod prelude;
pub mod word;
