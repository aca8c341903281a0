//! The prelude exports the structs which are useful in representing
//! the machine's words and instructions.  Providing this prelude is
//! the main purpose of the base crate.
pub use super::instruction::{
    decode_indirect_pair, is_eis_multiword, is_privileged, mnemonic, IndirectPair, Instruction,
    MfFields, Mods, Opcode, TagModifier, Td, Tm, ITP_TAG, ITS_TAG,
};
pub use super::word::{
    bit36, field36, join_halves, lower_half, mask_bits, set_field36, upper_half, with_bit36,
    MASK15, MASK18, MASK36,
};
