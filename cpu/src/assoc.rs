//! The associative memories: small content-addressable caches of
//! segment descriptor words and page table words.
//!
//! Each memory has sixteen slots.  A slot pairs a decoded descriptor
//! with its association key, a validity flag and a 4-bit usage
//! counter.  The usage counters implement the hardware's relative
//! aging policy: a hit saturates the hit slot's counter upward and
//! decrements every other valid slot toward zero, and a fill takes a
//! free slot if one exists and otherwise evicts the slot with the
//! lowest counter (first found on ties), installing at counter zero.
//!
//! The caches are pure accelerators.  Disabling them forces the
//! appending unit to walk the in-memory tables on every reference and
//! must produce identical translations; the tests in append.rs check
//! that equivalence.

use serde::Serialize;

use base::prelude::*;

use crate::types::NUM_ASSOC_SLOTS;

const USAGE_MAX: u8 = 15;

/// A decoded segment descriptor word (an even/odd pair in the
/// descriptor segment).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Sdw {
    /// Absolute address of the segment (unpaged) or of its page table
    /// (paged); 24 bits.
    pub addr: u32,
    /// Ring brackets.
    pub r1: u8,
    pub r2: u8,
    pub r3: u8,
    /// Present flag; when clear, any reference raises the directed
    /// fault selected by `fault_code`.
    pub present: bool,
    /// Directed fault code (0..3) used when `present` is clear.
    pub fault_code: u8,
    /// Segment bound in 16-word units (14 bits).
    pub bound: u16,
    pub read: bool,
    pub execute: bool,
    pub write: bool,
    pub privileged: bool,
    pub unpaged: bool,
    /// Gate control: when clear, inward calls must enter below the
    /// call limiter.
    pub gate_ok: bool,
    /// Cache control bit, held for fidelity of save/restore.
    pub cache: bool,
    /// Call limiter (14 bits): bound on gate entry offsets.
    pub call_limit: u16,
}

impl Sdw {
    pub fn decode(even: u64, odd: u64) -> Sdw {
        Sdw {
            addr: field36(even, 0, 24) as u32,
            r1: field36(even, 24, 3) as u8,
            r2: field36(even, 27, 3) as u8,
            r3: field36(even, 30, 3) as u8,
            present: bit36(even, 33),
            fault_code: field36(even, 34, 2) as u8,
            bound: field36(odd, 1, 14) as u16,
            read: bit36(odd, 15),
            execute: bit36(odd, 16),
            write: bit36(odd, 17),
            privileged: bit36(odd, 18),
            unpaged: bit36(odd, 19),
            gate_ok: bit36(odd, 20),
            cache: bit36(odd, 21),
            call_limit: field36(odd, 22, 14) as u16,
        }
    }

    pub fn encode(&self) -> (u64, u64) {
        let mut even = 0;
        even = set_field36(even, 0, 24, u64::from(self.addr));
        even = set_field36(even, 24, 3, u64::from(self.r1));
        even = set_field36(even, 27, 3, u64::from(self.r2));
        even = set_field36(even, 30, 3, u64::from(self.r3));
        even = with_bit36(even, 33, self.present);
        even = set_field36(even, 34, 2, u64::from(self.fault_code));
        let mut odd = 0;
        odd = set_field36(odd, 1, 14, u64::from(self.bound));
        odd = with_bit36(odd, 15, self.read);
        odd = with_bit36(odd, 16, self.execute);
        odd = with_bit36(odd, 17, self.write);
        odd = with_bit36(odd, 18, self.privileged);
        odd = with_bit36(odd, 19, self.unpaged);
        odd = with_bit36(odd, 20, self.gate_ok);
        odd = with_bit36(odd, 21, self.cache);
        odd = set_field36(odd, 22, 14, u64::from(self.call_limit));
        (even, odd)
    }
}

/// A decoded page table word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Ptw {
    /// Page address in 64-word blocks (18 bits).
    pub addr: u32,
    pub used: bool,
    pub modified: bool,
    pub present: bool,
    pub fault_code: u8,
}

impl Ptw {
    pub fn decode(word: u64) -> Ptw {
        Ptw {
            addr: field36(word, 0, 18) as u32,
            used: bit36(word, 26),
            modified: bit36(word, 29),
            present: bit36(word, 33),
            fault_code: field36(word, 34, 2) as u8,
        }
    }

    pub fn encode(&self) -> u64 {
        let mut word = 0;
        word = set_field36(word, 0, 18, u64::from(self.addr));
        word = with_bit36(word, 26, self.used);
        word = with_bit36(word, 29, self.modified);
        word = with_bit36(word, 33, self.present);
        word = set_field36(word, 34, 2, u64::from(self.fault_code));
        word
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
struct SdwSlot {
    sdw: Sdw,
    segno: u16,
    full: bool,
    usage: u8,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
struct PtwSlot {
    ptw: Ptw,
    segno: u16,
    pageno: u16,
    full: bool,
    usage: u8,
}

/// Relative aging shared by both caches: saturate the hit slot,
/// decrement every other valid slot toward zero.
fn age_after_hit(usages: &mut [(bool, &mut u8)], hit: usize) {
    for (i, (full, usage)) in usages.iter_mut().enumerate() {
        if i == hit {
            **usage = (**usage).saturating_add(1).min(USAGE_MAX);
        } else if *full {
            **usage = (**usage).saturating_sub(1);
        }
    }
}

/// Victim selection shared by both caches: a free slot if any,
/// otherwise the lowest usage counter, first found on ties.
fn pick_victim(slots: &[(bool, u8)]) -> usize {
    if let Some(i) = slots.iter().position(|(full, _)| !full) {
        return i;
    }
    let mut victim = 0;
    for (i, (_, usage)) in slots.iter().enumerate() {
        if *usage < slots[victim].1 {
            victim = i;
        }
    }
    victim
}

/// The segment descriptor associative memory.
#[derive(Debug, Clone, Serialize)]
pub struct SdwAm {
    slots: [SdwSlot; NUM_ASSOC_SLOTS],
    pub enabled: bool,
}

impl Default for SdwAm {
    fn default() -> SdwAm {
        SdwAm {
            slots: [SdwSlot::default(); NUM_ASSOC_SLOTS],
            enabled: true,
        }
    }
}

impl SdwAm {
    pub fn lookup(&mut self, segno: u16) -> Option<Sdw> {
        if !self.enabled {
            return None;
        }
        let hit = self
            .slots
            .iter()
            .position(|s| s.full && s.segno == segno)?;
        let sdw = self.slots[hit].sdw;
        let mut usages: Vec<(bool, &mut u8)> = self
            .slots
            .iter_mut()
            .map(|s| (s.full, &mut s.usage))
            .collect();
        age_after_hit(&mut usages, hit);
        Some(sdw)
    }

    pub fn fill(&mut self, segno: u16, sdw: Sdw) {
        if !self.enabled {
            return;
        }
        let victim = pick_victim(
            &self
                .slots
                .iter()
                .map(|s| (s.full, s.usage))
                .collect::<Vec<_>>(),
        );
        self.slots[victim] = SdwSlot {
            sdw,
            segno,
            full: true,
            usage: 0,
        };
    }

    /// Invalidate every slot (descriptor base reload).
    pub fn clear(&mut self) {
        self.slots = [SdwSlot::default(); NUM_ASSOC_SLOTS];
    }

    #[cfg(test)]
    fn occupant(&self, slot: usize) -> Option<u16> {
        self.slots[slot].full.then_some(self.slots[slot].segno)
    }
}

/// The page table associative memory, keyed on (segment number, high
/// page-number bits of the computed address).
#[derive(Debug, Clone, Serialize)]
pub struct PtwAm {
    slots: [PtwSlot; NUM_ASSOC_SLOTS],
    pub enabled: bool,
}

impl Default for PtwAm {
    fn default() -> PtwAm {
        PtwAm {
            slots: [PtwSlot::default(); NUM_ASSOC_SLOTS],
            enabled: true,
        }
    }
}

impl PtwAm {
    pub fn lookup(&mut self, segno: u16, pageno: u16) -> Option<Ptw> {
        if !self.enabled {
            return None;
        }
        let hit = self
            .slots
            .iter()
            .position(|s| s.full && s.segno == segno && s.pageno == pageno)?;
        let ptw = self.slots[hit].ptw;
        let mut usages: Vec<(bool, &mut u8)> = self
            .slots
            .iter_mut()
            .map(|s| (s.full, &mut s.usage))
            .collect();
        age_after_hit(&mut usages, hit);
        Some(ptw)
    }

    pub fn fill(&mut self, segno: u16, pageno: u16, ptw: Ptw) {
        if !self.enabled {
            return;
        }
        let victim = pick_victim(
            &self
                .slots
                .iter()
                .map(|s| (s.full, s.usage))
                .collect::<Vec<_>>(),
        );
        self.slots[victim] = PtwSlot {
            ptw,
            segno,
            pageno,
            full: true,
            usage: 0,
        };
    }

    /// Update the cached copy of a page's used/modified bits so the
    /// cache never serves a stale descriptor after write-back.
    pub fn update(&mut self, segno: u16, pageno: u16, ptw: Ptw) {
        if let Some(slot) = self
            .slots
            .iter_mut()
            .find(|s| s.full && s.segno == segno && s.pageno == pageno)
        {
            slot.ptw = ptw;
        }
    }

    pub fn clear(&mut self) {
        self.slots = [PtwSlot::default(); NUM_ASSOC_SLOTS];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sdw_for(addr: u32) -> Sdw {
        Sdw {
            addr,
            present: true,
            bound: 1,
            read: true,
            unpaged: true,
            ..Sdw::default()
        }
    }

    #[test]
    fn test_sdw_codec_round_trip() {
        let sdw = Sdw {
            addr: 0o7654321,
            r1: 2,
            r2: 4,
            r3: 6,
            present: true,
            fault_code: 1,
            bound: 0o1777,
            read: true,
            execute: true,
            write: false,
            privileged: false,
            unpaged: true,
            gate_ok: false,
            cache: true,
            call_limit: 0o12,
        };
        let (even, odd) = sdw.encode();
        assert_eq!(Sdw::decode(even, odd), sdw);
    }

    #[test]
    fn test_ptw_codec_round_trip() {
        let ptw = Ptw {
            addr: 0o123456,
            used: true,
            modified: true,
            present: true,
            fault_code: 0,
        };
        assert_eq!(Ptw::decode(ptw.encode()), ptw);
    }

    #[test]
    fn test_fill_prefers_free_slot_and_installs_cold() {
        let mut am = SdwAm::default();
        am.fill(7, sdw_for(0o100));
        assert_eq!(am.occupant(0), Some(7));
        assert_eq!(am.slots[0].usage, 0);
        am.fill(8, sdw_for(0o200));
        assert_eq!(am.occupant(1), Some(8));
    }

    #[test]
    fn test_seventeenth_fill_evicts_lowest_counter() {
        let mut am = SdwAm::default();
        for seg in 0..16u16 {
            am.fill(seg, sdw_for(u32::from(seg)));
        }
        // Heat up every slot except slot 5 once; slot 5 stays at 0
        // and is the unique minimum.
        for seg in 0..16u16 {
            if seg != 5 {
                am.lookup(seg);
            }
        }
        am.fill(99, sdw_for(0o777));
        assert_eq!(am.occupant(5), Some(99));
    }

    #[test]
    fn test_tie_broken_by_first_slot() {
        let mut am = SdwAm::default();
        for seg in 0..16u16 {
            am.fill(seg, sdw_for(u32::from(seg)));
        }
        // All counters are 0; the first slot loses.
        am.fill(50, sdw_for(0o500));
        assert_eq!(am.occupant(0), Some(50));
    }

    #[test]
    fn test_hot_entry_survives_pressure() {
        let mut am = SdwAm::default();
        for seg in 0..16u16 {
            am.fill(seg, sdw_for(u32::from(seg)));
        }
        // Keep segment 3 hot, then fill through the whole cache; the
        // hot entry must never be the victim.
        for round in 0..15u16 {
            am.lookup(3).expect("hot entry went missing");
            am.fill(100 + round, sdw_for(0o1000 + u32::from(round)));
        }
        assert!(am.lookup(3).is_some());
    }

    #[test]
    fn test_relative_aging_decrements_others_on_hit() {
        let mut am = SdwAm::default();
        am.fill(1, sdw_for(1));
        am.fill(2, sdw_for(2));
        am.lookup(1);
        am.lookup(1);
        // Segment 2 aged twice (floor 0), segment 1 climbed to 2.
        assert_eq!(am.slots[0].usage, 2);
        assert_eq!(am.slots[1].usage, 0);
        am.lookup(2);
        assert_eq!(am.slots[0].usage, 1);
        assert_eq!(am.slots[1].usage, 1);
    }

    #[test]
    fn test_disabled_cache_never_hits() {
        let mut am = SdwAm::default();
        am.fill(1, sdw_for(1));
        am.enabled = false;
        assert!(am.lookup(1).is_none());
    }

    #[test]
    fn test_ptw_key_includes_page_number() {
        let mut am = PtwAm::default();
        let ptw = Ptw {
            addr: 0o100,
            present: true,
            ..Ptw::default()
        };
        am.fill(1, 2, ptw);
        assert!(am.lookup(1, 2).is_some());
        assert!(am.lookup(1, 3).is_none());
        assert!(am.lookup(2, 2).is_none());
    }
}
