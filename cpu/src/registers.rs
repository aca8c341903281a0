//! The architectural register file.
//!
//! Registers are carried as plain structs of already-decoded fields;
//! the raw bit-packed layouts appear only at the explicit pack/unpack
//! boundaries (control-unit save/restore, descriptor cache fills).
//! The layouts follow the processor manual's bit numbering, most
//! significant bit first.

use serde::Serialize;

use base::prelude::*;

use crate::types::{NUM_INDEX_REGS, NUM_POINTER_REGS};

/// The indicator register, decoded.  Packed into bits 18..33 of a
/// word for the control-unit save area.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndicatorRegister {
    pub zero: bool,
    pub neg: bool,
    pub carry: bool,
    pub overflow: bool,
    pub exp_overflow: bool,
    pub exp_underflow: bool,
    pub overflow_mask: bool,
    pub tally_runout: bool,
    pub parity_error: bool,
    pub parity_mask: bool,
    /// Clear means BAR (base address register) mode is in force.
    pub not_bar_mode: bool,
    pub truncation: bool,
    pub mid_instruction_interrupt_fault: bool,
    pub abs_mode: bool,
    pub hex_mode: bool,
}

impl IndicatorRegister {
    /// Pack into bits 18..33 of a 36-bit word.
    pub fn save(&self) -> u64 {
        let flags = [
            self.zero,
            self.neg,
            self.carry,
            self.overflow,
            self.exp_overflow,
            self.exp_underflow,
            self.overflow_mask,
            self.tally_runout,
            self.parity_error,
            self.parity_mask,
            self.not_bar_mode,
            self.truncation,
            self.mid_instruction_interrupt_fault,
            self.abs_mode,
            self.hex_mode,
        ];
        let mut word = 0;
        for (i, flag) in flags.iter().enumerate() {
            word = with_bit36(word, 18 + i as u32, *flag);
        }
        word
    }

    /// Unpack from bits 18..33 of a 36-bit word.
    pub fn load(word: u64) -> IndicatorRegister {
        IndicatorRegister {
            zero: bit36(word, 18),
            neg: bit36(word, 19),
            carry: bit36(word, 20),
            overflow: bit36(word, 21),
            exp_overflow: bit36(word, 22),
            exp_underflow: bit36(word, 23),
            overflow_mask: bit36(word, 24),
            tally_runout: bit36(word, 25),
            parity_error: bit36(word, 26),
            parity_mask: bit36(word, 27),
            not_bar_mode: bit36(word, 28),
            truncation: bit36(word, 29),
            mid_instruction_interrupt_fault: bit36(word, 30),
            abs_mode: bit36(word, 31),
            hex_mode: bit36(word, 32),
        }
    }
}

/// The procedure pointer register: where execution currently is.
/// Mutated only by the cycle engine, on transfers and on normal
/// instruction advance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcedurePointer {
    /// Procedure ring number (3 bits).
    pub prr: u8,
    /// Procedure segment number (15 bits).
    pub psr: u16,
    /// Privilege bit.
    pub p: bool,
    /// Instruction counter (18 bits).
    pub ic: u32,
}

/// The temporary pointer register: scratch state rebuilt at the
/// start of every address-preparation step.  Never persists across
/// instructions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TemporaryPointer {
    /// Temporary ring number (3 bits).
    pub trr: u8,
    /// Temporary segment number (15 bits).
    pub tsr: u16,
    /// Bit offset within the word (6 bits).
    pub tbr: u8,
    /// Computed address (18 bits).
    pub ca: u32,
    /// Set when the operand is a literal (`du`/`dl` modification);
    /// `value` then holds the operand and `ca` is not an address.
    pub is_value: bool,
    pub value: u64,
}

/// One of the eight combined pointer/address registers.  The same
/// hardware slot serves as a procedure-relative pointer (word, ring,
/// segment) and as a character/bit-addressed operand pointer; we keep
/// the decoded union of both roles, with the character/bit view
/// derived from `bitno`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PointerRegister {
    /// Word offset (18 bits).
    pub wordno: u32,
    /// Segment number (15 bits).
    pub snr: u16,
    /// Ring number (3 bits).
    pub rnr: u8,
    /// Bit offset within the word (0..35).
    pub bitno: u8,
}

impl PointerRegister {
    /// The 9-bit-character view of the bit offset.
    pub fn charno(&self) -> u8 {
        self.bitno / 9
    }
}

/// The base address register, used when neither absolute nor
/// appending mode is in force.  Both fields are in 512-word blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BaseAddressRegister {
    pub base: u16,
    pub bound: u16,
}

/// The mode register, loaded by the privileged `lcpr` instruction.
/// The associative-memory enables feed the appending unit's caches;
/// the processor-cache and history enables are held for
/// save/restore fidelity only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModeRegister {
    pub cache_on: bool,
    pub sdwam_on: bool,
    pub ptwam_on: bool,
    pub hist_on: bool,
}

impl Default for ModeRegister {
    fn default() -> ModeRegister {
        ModeRegister {
            cache_on: true,
            sdwam_on: true,
            ptwam_on: true,
            hist_on: false,
        }
    }
}

impl ModeRegister {
    /// Pack into bits 18..22 of a 36-bit word.
    pub fn save(&self) -> u64 {
        let mut word = 0;
        word = with_bit36(word, 18, self.cache_on);
        word = with_bit36(word, 19, self.sdwam_on);
        word = with_bit36(word, 20, self.ptwam_on);
        word = with_bit36(word, 21, self.hist_on);
        word
    }

    /// Unpack from bits 18..22 of a 36-bit word.
    pub fn load(word: u64) -> ModeRegister {
        ModeRegister {
            cache_on: bit36(word, 18),
            sdwam_on: bit36(word, 19),
            ptwam_on: bit36(word, 20),
            hist_on: bit36(word, 21),
        }
    }
}

/// Descriptor segment base register: the root of address translation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DescriptorBase {
    /// Absolute address of the descriptor segment (or of its page
    /// table when paged); 24 bits.
    pub addr: u32,
    /// Bound of the descriptor segment in 16-word units (14 bits).
    pub bound: u16,
    /// Set when the descriptor segment itself is unpaged.
    pub unpaged: bool,
    /// Stack base (12 bits); held for save/restore only.
    pub stack: u16,
}

impl DescriptorBase {
    /// Pack into the even/odd pair layout used by the load/store
    /// descriptor base instructions.
    pub fn save(&self) -> (u64, u64) {
        let even = u64::from(self.addr & 0xff_ffff) << 12;
        let mut odd = u64::from(self.bound & 0x3fff) << (36 - 1 - 14);
        if self.unpaged {
            odd = with_bit36(odd, 15, true);
        }
        odd |= u64::from(self.stack & 0xfff);
        (even, odd)
    }

    pub fn load(even: u64, odd: u64) -> DescriptorBase {
        DescriptorBase {
            addr: field36(even, 0, 24) as u32,
            bound: field36(odd, 1, 14) as u16,
            unpaged: bit36(odd, 15),
            stack: field36(odd, 24, 12) as u16,
        }
    }
}

/// The full register file of one processor.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegisterFile {
    /// Accumulator (36 bits).
    pub a: u64,
    /// Quotient (36 bits).
    pub q: u64,
    /// Exponent (8 bits).
    pub e: u8,
    /// Index registers (18 bits each).
    pub x: [u32; NUM_INDEX_REGS],
    pub ir: IndicatorRegister,
    pub bar: BaseAddressRegister,
    /// Timer register (27 bits, decrements toward the timer-runout
    /// fault).
    pub timer: u32,
    /// Ring alarm register (3 bits).
    pub ralr: u8,
    pub pr: [PointerRegister; NUM_POINTER_REGS],
    pub ppr: ProcedurePointer,
    pub tpr: TemporaryPointer,
    pub dsbr: DescriptorBase,
    pub mode: ModeRegister,
    /// Fault register: sticky cause bits latched when certain faults
    /// are generated, read by diagnostic software.
    pub fault_reg: u64,
}

impl RegisterFile {
    /// The value a tag's register designator contributes to address
    /// computation (18 bits).
    pub fn tag_register_value(&self, td: Td) -> u32 {
        match td {
            Td::None => 0,
            Td::Au => upper_half(self.a) as u32,
            Td::Qu => upper_half(self.q) as u32,
            Td::Al => lower_half(self.a) as u32,
            Td::Ql => lower_half(self.q) as u32,
            Td::Ic => self.ppr.ic,
            Td::X(n) => self.x[usize::from(n)],
            // du/dl contribute a literal operand, not an address;
            // callers handle them before asking for a register value.
            Td::Du | Td::Dl => 0,
        }
    }

    /// Whether the processor is currently privileged: either running
    /// in absolute mode or executing a privileged-bit procedure
    /// segment.
    pub fn is_privileged(&self) -> bool {
        self.ir.abs_mode || self.ppr.p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indicator_round_trip() {
        let ir = IndicatorRegister {
            zero: true,
            tally_runout: true,
            not_bar_mode: true,
            abs_mode: true,
            ..IndicatorRegister::default()
        };
        assert_eq!(IndicatorRegister::load(ir.save()), ir);
        // zero is bit 18 of the save word.
        assert!(bit36(ir.save(), 18));
    }

    #[test]
    fn test_mode_register_round_trip() {
        let mr = ModeRegister {
            cache_on: true,
            sdwam_on: false,
            ptwam_on: true,
            hist_on: true,
        };
        assert_eq!(ModeRegister::load(mr.save()), mr);
        // The SDWAM enable is bit 19.
        assert!(!bit36(mr.save(), 19));
    }

    #[test]
    fn test_dsbr_round_trip() {
        let dsbr = DescriptorBase {
            addr: 0o1234560,
            bound: 0o37,
            unpaged: true,
            stack: 0o17,
        };
        let (even, odd) = dsbr.save();
        assert_eq!(DescriptorBase::load(even, odd), dsbr);
    }

    #[test]
    fn test_tag_register_values() {
        let mut regs = RegisterFile::default();
        regs.a = join_halves(0o1234, 0o5670);
        regs.x[3] = 0o777;
        regs.ppr.ic = 0o100;
        assert_eq!(regs.tag_register_value(Td::Au), 0o1234);
        assert_eq!(regs.tag_register_value(Td::Al), 0o5670);
        assert_eq!(regs.tag_register_value(Td::X(3)), 0o777);
        assert_eq!(regs.tag_register_value(Td::Ic), 0o100);
        assert_eq!(regs.tag_register_value(Td::None), 0);
    }
}
