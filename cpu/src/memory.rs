//! Main memory: a flat array of 36-bit words.
//!
//! Every cell is carried in the low 36 bits of a `u64`.  Addresses
//! arriving here are absolute; for segmented accesses the appending
//! unit has already bounds-checked the segment, so an out-of-range
//! absolute address is a host anomaly rather than a machine fault.
//!
//! Instruction fetch and several control operations work on aligned
//! even/odd pairs; the pair operations here implement the hardware's
//! alignment rule (the low address bit is ignored).

use std::error;
use std::fmt::{self, Display, Formatter};

use tracing::{event, Level};

use base::prelude::*;

use crate::types::MAX_MEMORY_WORDS;

/// Host-chosen memory configuration, fixed at construction.
#[derive(Debug, Clone, Copy)]
pub struct MemoryConfiguration {
    /// Number of words of main memory, at most [`MAX_MEMORY_WORDS`].
    pub size_words: u32,
}

impl Default for MemoryConfiguration {
    fn default() -> MemoryConfiguration {
        MemoryConfiguration {
            size_words: 1 << 18,
        }
    }
}

#[derive(Debug, Clone)]
pub enum MemoryOpFailure {
    /// The address is beyond the configured memory size.
    NotMapped(u32),
}

impl Display for MemoryOpFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            MemoryOpFailure::NotMapped(addr) => {
                write!(f, "address {addr:>08o} is not mapped to configured memory")
            }
        }
    }
}

impl error::Error for MemoryOpFailure {}

#[derive(Debug)]
pub struct MemoryUnit {
    words: Vec<u64>,
}

impl MemoryUnit {
    pub fn new(config: &MemoryConfiguration) -> MemoryUnit {
        let size = config.size_words.min(MAX_MEMORY_WORDS);
        MemoryUnit {
            words: vec![0; size as usize],
        }
    }

    pub fn size_words(&self) -> u32 {
        self.words.len() as u32
    }

    pub fn fetch_word(&self, addr: u32) -> Result<u64, MemoryOpFailure> {
        match self.words.get(addr as usize) {
            Some(w) => Ok(*w),
            None => {
                event!(Level::WARN, "fetch from unmapped address {:>08o}", addr);
                Err(MemoryOpFailure::NotMapped(addr))
            }
        }
    }

    pub fn store_word(&mut self, addr: u32, value: u64) -> Result<(), MemoryOpFailure> {
        match self.words.get_mut(addr as usize) {
            Some(w) => {
                *w = value & MASK36;
                Ok(())
            }
            None => {
                event!(Level::WARN, "store to unmapped address {:>08o}", addr);
                Err(MemoryOpFailure::NotMapped(addr))
            }
        }
    }

    /// Fetch the aligned even/odd pair containing `addr`; the low
    /// address bit is ignored, as on the hardware.
    pub fn fetch_pair(&self, addr: u32) -> Result<(u64, u64), MemoryOpFailure> {
        let even = addr & !1;
        Ok((self.fetch_word(even)?, self.fetch_word(even | 1)?))
    }

    /// Store an aligned even/odd pair; the low address bit is ignored.
    pub fn store_pair(&mut self, addr: u32, even: u64, odd: u64) -> Result<(), MemoryOpFailure> {
        let base = addr & !1;
        self.store_word(base, even)?;
        self.store_word(base | 1, odd)
    }

    /// Store an 8-word block (the control-unit save area) starting at
    /// the aligned pair address.
    pub fn store_block8(&mut self, addr: u32, words: &[u64; 8]) -> Result<(), MemoryOpFailure> {
        let base = addr & !1;
        for (i, w) in words.iter().enumerate() {
            self.store_word(base + i as u32, *w)?;
        }
        Ok(())
    }

    /// Fetch an 8-word block starting at the aligned pair address.
    pub fn fetch_block8(&self, addr: u32) -> Result<[u64; 8], MemoryOpFailure> {
        let base = addr & !1;
        let mut words = [0u64; 8];
        for (i, w) in words.iter_mut().enumerate() {
            *w = self.fetch_word(base + i as u32)?;
        }
        Ok(words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_memory() -> MemoryUnit {
        MemoryUnit::new(&MemoryConfiguration { size_words: 0o100 })
    }

    #[test]
    fn test_store_fetch_masks_to_36_bits() {
        let mut mem = small_memory();
        mem.store_word(3, u64::MAX).expect("store should succeed");
        assert_eq!(mem.fetch_word(3).expect("fetch should succeed"), MASK36);
    }

    #[test]
    fn test_out_of_range_is_failure() {
        let mem = small_memory();
        assert!(mem.fetch_word(0o100).is_err());
    }

    #[test]
    fn test_pair_alignment_ignores_low_bit() {
        let mut mem = small_memory();
        mem.store_pair(0o11, 1, 2).expect("store should succeed");
        let (even, odd) = mem.fetch_pair(0o10).expect("fetch should succeed");
        assert_eq!((even, odd), (1, 2));
        let (even, odd) = mem.fetch_pair(0o11).expect("fetch should succeed");
        assert_eq!((even, odd), (1, 2));
    }
}
