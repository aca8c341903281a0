//! Binary and structured representations of instruction words.
//!
//! An instruction word occupies 36 bits.  Numbering bits 0..35 from
//! the most significant end (as the processor manuals do), the word
//! looks like this:
//!
//! |Address|Opcode |Inhibit|Modifier|
//! |-------|-------|-------|--------|
//! |18 bits|10 bits| 1 bit | 7 bits |
//! |(0-17) |(18-27)| (28)  |(29-35) |
//!
//! The 10-bit opcode field is a 9-bit opcode plus an extension bit in
//! bit 27; the extended half of the opcode space holds, among other
//! things, the multi-word EIS instructions.  The meaning of the 7-bit
//! modifier field depends on the opcode: for ordinary instructions it
//! is a pointer-register bit plus a 6-bit address-modification tag,
//! while for multi-word EIS instructions it is the MF1 field (three
//! flags and a 4-bit register designator).  Whether an opcode is a
//! multi-word EIS instruction is a pure function of the opcode, so the
//! split is fixed at decode time.
//!
//! Decoding is total: any 36-bit value decodes to an `Instruction`,
//! and `encode` is its exact inverse.  A word whose opcode is not in
//! the defined set still decodes; it is the control unit's job to
//! raise the illegal-procedure fault when such an instruction reaches
//! execution.

use std::fmt::{self, Display, Formatter};

use serde::Serialize;

#[cfg(test)]
use test_strategy::proptest;

use crate::word::{field36, mask_bits, MASK36};

/// Number of words in a machine which uses every address bit: the
/// address field of an instruction is 18 bits.
pub const ADDRESS_BITS: u32 = 18;

/// The tag value marking the even word of an ITS indirect pair.
pub const ITS_TAG: u8 = 0o43;

/// The tag value marking the even word of an ITP indirect pair.
pub const ITP_TAG: u8 = 0o41;

/// The MF field of a multi-word EIS instruction (7 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MfFields {
    /// Operand descriptor address is via an address register.
    pub ar: bool,
    /// Operand length is in a register rather than the descriptor.
    pub rl: bool,
    /// Operand descriptor is an indirect word.
    pub id: bool,
    /// Register designator for address modification (4 bits).
    pub reg: u8,
}

impl MfFields {
    fn decode(bits: u64) -> MfFields {
        MfFields {
            ar: bits & 0o100 != 0,
            rl: bits & 0o040 != 0,
            id: bits & 0o020 != 0,
            reg: (bits & 0o017) as u8,
        }
    }

    fn encode(&self) -> u64 {
        let mut bits = u64::from(self.reg & 0o17);
        if self.ar {
            bits |= 0o100;
        }
        if self.rl {
            bits |= 0o040;
        }
        if self.id {
            bits |= 0o020;
        }
        bits
    }
}

/// The mode-dependent 7-bit modifier field of an instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Mods {
    /// Ordinary instructions: a pointer-register bit (when set, the
    /// high three bits of the address field select a pointer
    /// register) and a 6-bit address modification tag.
    Single { pr: bool, tag: u8 },
    /// Multi-word EIS instructions: the MF1 field.
    Eis(MfFields),
}

/// A decoded instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Instruction {
    /// 18-bit address field; an offset, or a pointer-register /
    /// offset pair when the pr bit is set.
    pub addr: u32,
    /// Raw 10-bit opcode field (9-bit opcode plus extension bit).
    pub opcode: u16,
    /// Interrupt-inhibit bit.
    pub inhibit: bool,
    /// Modifier field, shaped by the opcode.
    pub mods: Mods,
}

impl Instruction {
    /// Decode a 36-bit word.  Never fails; undefined opcodes are
    /// detected later via [`Instruction::is_defined`].
    pub fn decode(word: u64) -> Instruction {
        let word = word & MASK36;
        let opcode = field36(word, 18, 10) as u16;
        let modbits = field36(word, 29, 7);
        let mods = if is_eis_multiword(opcode) {
            Mods::Eis(MfFields::decode(modbits))
        } else {
            Mods::Single {
                pr: modbits & 0o100 != 0,
                tag: (modbits & 0o77) as u8,
            }
        };
        Instruction {
            addr: field36(word, 0, 18) as u32,
            opcode,
            inhibit: field36(word, 28, 1) != 0,
            mods,
        }
    }

    /// Encode back to a 36-bit word; exact inverse of
    /// [`Instruction::decode`].
    pub fn encode(&self) -> u64 {
        let modbits = match self.mods {
            Mods::Single { pr, tag } => {
                let mut bits = u64::from(tag & 0o77);
                if pr {
                    bits |= 0o100;
                }
                bits
            }
            Mods::Eis(mf) => mf.encode(),
        };
        (u64::from(self.addr) & mask_bits(18)) << 18
            | (u64::from(self.opcode) & mask_bits(10)) << 8
            | u64::from(self.inhibit) << 7
            | modbits
    }

    /// The 9-bit opcode without the extension bit.
    pub fn opcode_main(&self) -> u16 {
        self.opcode >> 1
    }

    /// The opcode extension bit (bit 27).
    pub fn opcode_extended(&self) -> bool {
        self.opcode & 1 != 0
    }

    /// Whether the opcode is in the defined set.  Undefined opcodes
    /// raise the illegal-procedure fault at execution time.
    pub fn is_defined(&self) -> bool {
        mnemonic(self.opcode).is_some()
    }

    /// Whether this is a multi-word EIS instruction.  Fixed at decode
    /// time; a pure function of the opcode.
    pub fn is_eis_multiword(&self) -> bool {
        is_eis_multiword(self.opcode)
    }

    /// Whether the opcode may only be executed in privileged mode.
    pub fn is_privileged(&self) -> bool {
        is_privileged(self.opcode)
    }

    /// The address-modification tag of an ordinary instruction, zero
    /// for EIS multi-word instructions (their descriptors carry their
    /// own modification).
    pub fn tag(&self) -> u8 {
        match self.mods {
            Mods::Single { tag, .. } => tag,
            Mods::Eis(_) => 0,
        }
    }

    /// Returns an unspecified instruction with an undefined opcode.
    pub fn invalid() -> Instruction {
        Instruction::decode(0)
    }
}

impl Display for Instruction {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match mnemonic(self.opcode) {
            Some(name) => write!(f, "{} {:>06o}", name, self.addr)?,
            None => write!(f, "<op {:>04o}> {:>06o}", self.opcode, self.addr)?,
        }
        match self.mods {
            Mods::Single { pr, tag } => {
                if pr {
                    write!(f, ",pr")?;
                }
                if tag != 0 {
                    write!(f, ",{:>02o}", tag)?;
                }
                Ok(())
            }
            Mods::Eis(mf) => write!(
                f,
                " (mf ar={} rl={} id={} reg={:o})",
                mf.ar, mf.rl, mf.id, mf.reg
            ),
        }
    }
}

/// Opcodes the control unit itself must recognise; everything else is
/// dispatched to the external operator units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Mme,
    Mme2,
    Mme3,
    Mme4,
    Drl,
    Nop,
    Rpt,
    Rpd,
    Ldbr,
    Ldt,
    Lcpr,
    Rtcd,
    Rcu,
    Dis,
    Tra,
    Xec,
    Xed,
    Scu,
}

impl Opcode {
    /// Recognise a control-unit opcode from the raw 10-bit field.
    pub fn from_raw(raw: u16) -> Option<Opcode> {
        use Opcode::*;
        match (raw >> 1, raw & 1) {
            (0o001, 0) => Some(Mme),
            (0o004, 0) => Some(Mme2),
            (0o005, 0) => Some(Mme3),
            (0o007, 0) => Some(Mme4),
            (0o002, 0) => Some(Drl),
            (0o011, 0) => Some(Nop),
            (0o520, 0) => Some(Rpt),
            (0o560, 0) => Some(Rpd),
            (0o232, 0) => Some(Ldbr),
            (0o637, 0) => Some(Ldt),
            (0o674, 0) => Some(Lcpr),
            (0o610, 0) => Some(Rtcd),
            (0o613, 0) => Some(Rcu),
            (0o616, 0) => Some(Dis),
            (0o710, 0) => Some(Tra),
            (0o716, 0) => Some(Xec),
            (0o717, 0) => Some(Xed),
            (0o657, 0) => Some(Scu),
            _ => None,
        }
    }
}

const LDXN: [&str; 8] = ["ldx0", "ldx1", "ldx2", "ldx3", "ldx4", "ldx5", "ldx6", "ldx7"];
const STXN: [&str; 8] = ["stx0", "stx1", "stx2", "stx3", "stx4", "stx5", "stx6", "stx7"];
const ADXN: [&str; 8] = ["adx0", "adx1", "adx2", "adx3", "adx4", "adx5", "adx6", "adx7"];
const CMPXN: [&str; 8] = [
    "cmpx0", "cmpx1", "cmpx2", "cmpx3", "cmpx4", "cmpx5", "cmpx6", "cmpx7",
];
const EAXN: [&str; 8] = ["eax0", "eax1", "eax2", "eax3", "eax4", "eax5", "eax6", "eax7"];
const TSXN: [&str; 8] = ["tsx0", "tsx1", "tsx2", "tsx3", "tsx4", "tsx5", "tsx6", "tsx7"];
const SXLN: [&str; 8] = ["sxl0", "sxl1", "sxl2", "sxl3", "sxl4", "sxl5", "sxl6", "sxl7"];
const LXLN: [&str; 8] = ["lxl0", "lxl1", "lxl2", "lxl3", "lxl4", "lxl5", "lxl6", "lxl7"];

/// Mnemonic for a raw 10-bit opcode field, or `None` if the opcode is
/// undefined.  The table covers the instructions the target operating
/// system actually issues; it is the single source of truth for
/// [`Instruction::is_defined`].
pub fn mnemonic(raw: u16) -> Option<&'static str> {
    let main = (raw >> 1) as usize;
    let extended = raw & 1 != 0;
    if extended {
        return eis_mnemonic(main as u16);
    }
    let xidx = main & 7;
    match main as u16 {
        0o001 => Some("mme"),
        0o002 => Some("drl"),
        0o004 => Some("mme2"),
        0o005 => Some("mme3"),
        0o007 => Some("mme4"),
        0o011 => Some("nop"),
        0o012 => Some("puls1"),
        0o013 => Some("puls2"),
        0o015 => Some("cioc"),
        0o033 => Some("adl"),
        0o054 => Some("aos"),
        0o055 => Some("asa"),
        0o056 => Some("asq"),
        0o057 => Some("sscr"),
        0o060..=0o067 => Some(ADXN[xidx]),
        0o075 => Some("ada"),
        0o076 => Some("adq"),
        0o077 => Some("adaq"),
        0o100..=0o107 => Some(CMPXN[xidx]),
        0o111 => Some("cwl"),
        0o115 => Some("cmpa"),
        0o116 => Some("cmpq"),
        0o117 => Some("cmpaq"),
        0o135 => Some("ssa"),
        0o136 => Some("ssq"),
        0o155 => Some("sba"),
        0o156 => Some("sbq"),
        0o157 => Some("sbaq"),
        0o220..=0o227 => Some(LDXN[xidx]),
        0o230 => Some("lbar"),
        0o231 => Some("rsw"),
        0o232 => Some("ldbr"),
        0o233 => Some("rmcm"),
        0o234 => Some("szn"),
        0o235 => Some("lda"),
        0o236 => Some("ldq"),
        0o237 => Some("ldaq"),
        0o275 => Some("ora"),
        0o276 => Some("orq"),
        0o277 => Some("oraq"),
        0o315 => Some("cana"),
        0o316 => Some("canq"),
        0o317 => Some("canaq"),
        0o335 => Some("lca"),
        0o336 => Some("lcq"),
        0o337 => Some("lcaq"),
        0o375 => Some("ana"),
        0o376 => Some("anq"),
        0o377 => Some("anaq"),
        0o401 => Some("mpy"),
        0o403 => Some("cmg"),
        0o413 => Some("rscr"),
        0o440..=0o447 => Some(SXLN[xidx]),
        0o450 => Some("stz"),
        0o451 => Some("smic"),
        0o454 => Some("stt"),
        0o471 => Some("neg"),
        0o472 => Some("negl"),
        0o506 => Some("div"),
        0o507 => Some("dvf"),
        0o520 => Some("rpt"),
        0o550 => Some("sbar"),
        0o551 => Some("stba"),
        0o552 => Some("stbq"),
        0o553 => Some("smcm"),
        0o554 => Some("stc1"),
        0o560 => Some("rpd"),
        0o600 => Some("tze"),
        0o601 => Some("tnz"),
        0o602 => Some("tnc"),
        0o603 => Some("trc"),
        0o604 => Some("tmi"),
        0o605 => Some("tpl"),
        0o610 => Some("rtcd"),
        0o613 => Some("rcu"),
        0o614 => Some("teo"),
        0o615 => Some("teu"),
        0o616 => Some("dis"),
        0o617 => Some("tov"),
        0o620..=0o627 => Some(EAXN[xidx]),
        0o630 => Some("ret"),
        0o633 => Some("rccl"),
        0o634 => Some("ldi"),
        0o635 => Some("eaa"),
        0o636 => Some("eaq"),
        0o637 => Some("ldt"),
        0o655 => Some("era"),
        0o656 => Some("erq"),
        0o657 => Some("scu"),
        0o674 => Some("lcpr"),
        0o700..=0o707 => Some(TSXN[xidx]),
        0o710 => Some("tra"),
        0o713 => Some("call6"),
        0o715 => Some("tss"),
        0o716 => Some("xec"),
        0o717 => Some("xed"),
        0o720..=0o727 => Some(LXLN[xidx]),
        0o735 => Some("als"),
        0o736 => Some("qls"),
        0o737 => Some("lls"),
        0o740..=0o747 => Some(STXN[xidx]),
        0o750 => Some("stc2"),
        0o754 => Some("sdbr"),
        0o755 => Some("sta"),
        0o756 => Some("stq"),
        0o757 => Some("staq"),
        _ => None,
    }
}

fn eis_mnemonic(main: u16) -> Option<&'static str> {
    match main {
        0o020 => Some("mve"),
        0o024 => Some("mvne"),
        0o060 => Some("csl"),
        0o061 => Some("csr"),
        0o064 => Some("sztl"),
        0o065 => Some("sztr"),
        0o066 => Some("cmpb"),
        0o100 => Some("mlr"),
        0o101 => Some("mrl"),
        0o106 => Some("cmpc"),
        0o120 => Some("scd"),
        0o121 => Some("scdr"),
        0o124 => Some("scm"),
        0o125 => Some("scmr"),
        0o160 => Some("mvt"),
        0o164 => Some("tct"),
        0o165 => Some("tctr"),
        0o202 => Some("ad2d"),
        0o203 => Some("sb2d"),
        0o206 => Some("mp2d"),
        0o207 => Some("dv2d"),
        0o222 => Some("ad3d"),
        0o223 => Some("sb3d"),
        0o226 => Some("mp3d"),
        0o227 => Some("dv3d"),
        0o300 => Some("mvn"),
        0o301 => Some("btd"),
        0o303 => Some("cmpn"),
        0o305 => Some("dtb"),
        _ => None,
    }
}

/// True when the raw opcode field names a multi-word EIS instruction.
/// All of the extended-bit opcodes in our defined set are multi-word.
pub fn is_eis_multiword(raw: u16) -> bool {
    raw & 1 != 0 && eis_mnemonic(raw >> 1).is_some()
}

/// True when the opcode may only execute in privileged mode.
pub fn is_privileged(raw: u16) -> bool {
    if raw & 1 != 0 {
        return false;
    }
    matches!(
        raw >> 1,
        0o015   // cioc
        | 0o057 // sscr
        | 0o232 // ldbr
        | 0o233 // rmcm
        | 0o413 // rscr
        | 0o451 // smic
        | 0o553 // smcm
        | 0o616 // dis
        | 0o637 // ldt
        | 0o674 // lcpr
    )
}

/// The 2-bit modifier-type portion of an address modification tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tm {
    /// Register modification.
    R,
    /// Register then indirect.
    Ri,
    /// Indirect then tally.
    It,
    /// Indirect then register.
    Ir,
}

/// The 4-bit register-designator portion of an address modification
/// tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Td {
    None,
    Au,
    Qu,
    Du,
    Ic,
    Al,
    Ql,
    Dl,
    X(u8),
}

/// A decoded 6-bit address modification tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagModifier {
    pub tm: Tm,
    pub td: Td,
}

impl TagModifier {
    pub fn decode(tag: u8) -> TagModifier {
        let tm = match (tag >> 4) & 3 {
            0 => Tm::R,
            1 => Tm::Ri,
            2 => Tm::It,
            _ => Tm::Ir,
        };
        let td = match tag & 0o17 {
            0 => Td::None,
            1 => Td::Au,
            2 => Td::Qu,
            3 => Td::Du,
            4 => Td::Ic,
            5 => Td::Al,
            6 => Td::Ql,
            7 => Td::Dl,
            n => Td::X(n - 8),
        };
        TagModifier { tm, td }
    }
}

/// The two roles an ITS/ITP indirect pair can resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndirectPair {
    /// ITS: a full (segment, ring, offset, bit) pointer.
    Its {
        segno: u16,
        rnr: u8,
        wordno: u32,
        bitno: u8,
        tag: u8,
    },
    /// ITP: pointer register number plus offset.
    Itp { prnum: u8, wordno: u32, bitno: u8, tag: u8 },
}

/// Recognise an ITS or ITP pair from two consecutive words, if the
/// even word carries the distinguishing tag value.
pub fn decode_indirect_pair(even: u64, odd: u64) -> Option<IndirectPair> {
    let tag_field = field36(even, 30, 6) as u8;
    match tag_field {
        ITS_TAG => Some(IndirectPair::Its {
            segno: field36(even, 3, 15) as u16,
            rnr: field36(even, 18, 3) as u8,
            wordno: field36(odd, 0, 18) as u32,
            bitno: field36(odd, 21, 6) as u8,
            tag: field36(odd, 30, 6) as u8,
        }),
        ITP_TAG => Some(IndirectPair::Itp {
            prnum: field36(even, 0, 3) as u8,
            wordno: field36(odd, 0, 18) as u32,
            bitno: field36(odd, 21, 6) as u8,
            tag: field36(odd, 30, 6) as u8,
        }),
        _ => None,
    }
}

#[cfg(test)]
#[proptest]
fn decode_encode_round_trip(#[strategy(0u64..(1u64 << 36))] word: u64) {
    let inst = Instruction::decode(word);
    assert_eq!(inst.encode(), word, "decode/encode failed for {word:>012o}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_tra() {
        // tra 0100 -- opcode 0o710, no extension.
        let word: u64 = (0o100 << 18) | (0o710 << 9) | 0;
        let inst = Instruction::decode(word);
        assert_eq!(inst.addr, 0o100);
        assert_eq!(inst.opcode_main(), 0o710);
        assert!(!inst.opcode_extended());
        assert!(!inst.inhibit);
        assert_eq!(Opcode::from_raw(inst.opcode), Some(Opcode::Tra));
        assert_eq!(inst.mods, Mods::Single { pr: false, tag: 0 });
        assert!(inst.is_defined());
        assert!(!inst.is_eis_multiword());
    }

    #[test]
    fn test_decode_inhibit_bit() {
        let word: u64 = (0o710 << 9) | (1 << 7);
        assert!(Instruction::decode(word).inhibit);
    }

    #[test]
    fn test_eis_mods_shape_follows_opcode() {
        // mlr is opcode 0o100 with the extension bit set; its modifier
        // field must decode as an MF, not as a pr/tag pair.
        let raw_opcode: u64 = (0o100 << 1) | 1;
        let word: u64 = (raw_opcode << 8) | 0o123;
        let inst = Instruction::decode(word);
        assert!(inst.is_eis_multiword());
        match inst.mods {
            Mods::Eis(mf) => {
                assert!(mf.ar);
                assert!(!mf.rl);
                assert!(mf.id);
                assert_eq!(mf.reg, 3);
            }
            Mods::Single { .. } => panic!("EIS opcode decoded a single tag"),
        }
        assert_eq!(inst.encode(), word);
    }

    #[test]
    fn test_undefined_opcode_still_decodes() {
        let word: u64 = 0o000_000_000_000;
        let inst = Instruction::decode(word);
        assert!(!inst.is_defined());
        assert_eq!(inst.encode(), word);
    }

    #[test]
    fn test_privileged_set() {
        let ldt = Instruction::decode((0o637 << 9) as u64);
        assert!(ldt.is_privileged());
        let lda = Instruction::decode((0o235 << 9) as u64);
        assert!(!lda.is_privileged());
    }

    #[test]
    fn test_tag_modifier_decode() {
        // Tag 0o20 is IT with td 0; tag 0o12 is R with X2.
        assert_eq!(
            TagModifier::decode(0o20),
            TagModifier { tm: Tm::It, td: Td::None }
        );
        assert_eq!(
            TagModifier::decode(0o12),
            TagModifier { tm: Tm::R, td: Td::X(2) }
        );
        assert_eq!(
            TagModifier::decode(0o03),
            TagModifier { tm: Tm::R, td: Td::Du }
        );
    }

    #[test]
    fn test_its_pair() {
        let even = (0o0123_u64) << 18 | u64::from(ITS_TAG);
        // segno occupies bits 3..17 of the even word.
        let even = crate::word::set_field36(even, 3, 15, 0o377);
        let even = crate::word::set_field36(even, 18, 3, 5);
        let odd = (0o4567_u64) << 18;
        match decode_indirect_pair(even, odd) {
            Some(IndirectPair::Its {
                segno,
                rnr,
                wordno,
                ..
            }) => {
                assert_eq!(segno, 0o377);
                assert_eq!(rnr, 5);
                assert_eq!(wordno, 0o4567);
            }
            other => panic!("expected ITS pair, got {other:?}"),
        }
    }
}
