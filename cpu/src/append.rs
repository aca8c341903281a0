//! The appending unit: translation of (ring, segment, offset)
//! addresses into absolute memory addresses.
//!
//! Translation walks the descriptor segment named by the DSBR to find
//! the segment's SDW, checks bound, presence, ring brackets and
//! permission bits, and then either adds the offset to the segment
//! base (unpaged) or walks the segment's page table (paged).  The two
//! associative memories front the walks; their content never changes
//! a translation result, only whether main memory is consulted.
//!
//! Failures are returned as values.  A machine fault unwinds the
//! current instruction through the abort cycle; no partial
//! translation ever escapes to the caller.

use std::error;
use std::fmt::{self, Display, Formatter};

use tracing::{event, Level};

use crate::assoc::{Ptw, PtwAm, Sdw, SdwAm};
use crate::events::{AccessDenied, AcvCause, FaultCode, FaultDetail};
use crate::memory::{MemoryOpFailure, MemoryUnit};
use crate::registers::{BaseAddressRegister, DescriptorBase};
use crate::types::{AccessKind, PAGE_WORDS};

/// Key used for the descriptor segment's own pages in the PTWAM;
/// outside the 15-bit range of real segment numbers.
const DSEG_KEY: u16 = 0x7fff + 1;

/// A translation failure: either a machine fault to be registered
/// with the event unit, or a host anomaly.
#[derive(Debug, Clone)]
pub enum AppendError {
    Fault(FaultCode, FaultDetail),
    Mem(MemoryOpFailure),
}

impl Display for AppendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            AppendError::Fault(code, detail) => {
                write!(f, "translation raised {code}: {detail:?}")
            }
            AppendError::Mem(failure) => write!(f, "{failure}"),
        }
    }
}

impl error::Error for AppendError {}

impl From<MemoryOpFailure> for AppendError {
    fn from(failure: MemoryOpFailure) -> AppendError {
        AppendError::Mem(failure)
    }
}

fn acv(cause: AcvCause) -> AppendError {
    AppendError::Fault(FaultCode::AccessViolation, FaultDetail::Acv(cause))
}

fn directed(fc: u8) -> AppendError {
    AppendError::Fault(FaultCode::directed(fc), FaultDetail::Directed(fc))
}

/// One translation request.
#[derive(Debug, Clone, Copy)]
pub struct SegAccess {
    /// Ring the access is made from.
    pub ring: u8,
    /// Target segment number (15 bits).
    pub segno: u16,
    /// Word offset within the segment (18 bits).
    pub offset: u32,
    pub kind: AccessKind,
}

#[derive(Debug, Default)]
pub struct AppendUnit {
    pub sdwam: SdwAm,
    pub ptwam: PtwAm,
}

impl AppendUnit {
    /// Invalidate both associative memories (descriptor base reload,
    /// cache-clear instructions).
    pub fn clear_caches(&mut self) {
        self.sdwam.clear();
        self.ptwam.clear();
    }

    /// Translate a segmented access to an absolute address, or fail.
    ///
    /// `bypass_protection` skips the ring/permission checks (but not
    /// bound or presence); the cycle engine sets it while servicing
    /// faults and interrupts, where the hardware's append cycles run
    /// unchecked.
    pub fn resolve(
        &mut self,
        mem: &mut MemoryUnit,
        dsbr: &DescriptorBase,
        ralr: u8,
        access: SegAccess,
        bypass_protection: bool,
    ) -> Result<u32, AppendError> {
        let sdw = self.fetch_sdw(mem, dsbr, access.segno)?;

        // Bound is in 16-word units.
        if (access.offset >> 4) > u32::from(sdw.bound) {
            return Err(acv(AcvCause::OutOfSegmentBounds));
        }

        if !bypass_protection {
            check_protection(&sdw, access, ralr)?;
        }

        let abs = if sdw.unpaged {
            sdw.addr + access.offset
        } else {
            let pageno = (access.offset / PAGE_WORDS) as u16;
            let ptw = self.fetch_ptw(mem, sdw.addr, access.segno, pageno)?;
            let ptw = self.mark_ptw(mem, sdw.addr, access.segno, pageno, ptw, access.kind)?;
            (ptw.addr << 6) | (access.offset % PAGE_WORDS)
        };
        event!(
            Level::TRACE,
            "appended {:>06o}|{:>06o} -> {:>08o}",
            access.segno,
            access.offset,
            abs
        );
        Ok(abs)
    }

    /// Locate and decode the SDW for a segment, consulting the SDWAM
    /// first.  Absent segments raise their stored directed fault and
    /// are never installed in the cache.
    fn fetch_sdw(
        &mut self,
        mem: &mut MemoryUnit,
        dsbr: &DescriptorBase,
        segno: u16,
    ) -> Result<Sdw, AppendError> {
        if let Some(sdw) = self.sdwam.lookup(segno) {
            return Ok(sdw);
        }
        let off = 2 * u32::from(segno);
        // The descriptor segment's own bound, also in 16-word units.
        if off >= 16 * (u32::from(dsbr.bound) + 1) {
            return Err(acv(AcvCause::OutOfSegmentBounds));
        }
        let sdw_addr = if dsbr.unpaged {
            dsbr.addr + off
        } else {
            let dseg_page = (off / PAGE_WORDS) as u16;
            let ptw = self.fetch_ptw(mem, dsbr.addr, DSEG_KEY, dseg_page)?;
            // The descriptor segment's own pages age like any others.
            let ptw = self.mark_ptw(mem, dsbr.addr, DSEG_KEY, dseg_page, ptw, AccessKind::Read)?;
            (ptw.addr << 6) | (off % PAGE_WORDS)
        };
        let (even, odd) = mem.fetch_pair(sdw_addr)?;
        let sdw = Sdw::decode(even, odd);
        if !sdw.present {
            return Err(directed(sdw.fault_code));
        }
        event!(Level::DEBUG, "SDWAM fill for segment {:>05o}", segno);
        self.sdwam.fill(segno, sdw);
        Ok(sdw)
    }

    /// Locate and decode one PTW from the page table at `table_addr`,
    /// consulting the PTWAM first.  Absent pages raise their stored
    /// directed fault and are never installed.
    fn fetch_ptw(
        &mut self,
        mem: &mut MemoryUnit,
        table_addr: u32,
        key: u16,
        pageno: u16,
    ) -> Result<Ptw, AppendError> {
        if let Some(ptw) = self.ptwam.lookup(key, pageno) {
            return Ok(ptw);
        }
        let word = mem.fetch_word(table_addr + u32::from(pageno))?;
        let ptw = Ptw::decode(word);
        if !ptw.present {
            return Err(directed(ptw.fault_code));
        }
        event!(
            Level::DEBUG,
            "PTWAM fill for segment {:>05o} page {:>04o}",
            key,
            pageno
        );
        self.ptwam.fill(key, pageno, ptw);
        Ok(ptw)
    }

    /// Set the used bit (and the modified bit, for writes) of a PTW,
    /// writing the change back to the in-memory page table and the
    /// cache so neither goes stale.
    fn mark_ptw(
        &mut self,
        mem: &mut MemoryUnit,
        table_addr: u32,
        key: u16,
        pageno: u16,
        mut ptw: Ptw,
        kind: AccessKind,
    ) -> Result<Ptw, AppendError> {
        let wants_modified = matches!(kind, AccessKind::Write);
        if ptw.used && (ptw.modified || !wants_modified) {
            return Ok(ptw);
        }
        ptw.used = true;
        if wants_modified {
            ptw.modified = true;
        }
        mem.store_word(table_addr + u32::from(pageno), ptw.encode())?;
        self.ptwam.update(key, pageno, ptw);
        Ok(ptw)
    }
}

/// Ring bracket and permission checks.  Write is limited to the
/// write bracket [0, r1], execute to [r1, r2] with the call bracket
/// (r2, r3] reachable only through a gate, and read extends through
/// the whole bracket [0, r3].
fn check_protection(sdw: &Sdw, access: SegAccess, ralr: u8) -> Result<(), AppendError> {
    match access.kind {
        AccessKind::Read => {
            if access.ring > sdw.r3 {
                return Err(acv(AcvCause::Ring));
            }
            if !sdw.read {
                return Err(acv(AcvCause::Permission(AccessDenied::Read)));
            }
        }
        AccessKind::Write => {
            if access.ring > sdw.r1 {
                return Err(acv(AcvCause::Ring));
            }
            if !sdw.write {
                return Err(acv(AcvCause::Permission(AccessDenied::Write)));
            }
        }
        AccessKind::Execute => {
            if !sdw.execute {
                return Err(acv(AcvCause::Permission(AccessDenied::Execute)));
            }
            if access.ring < sdw.r1 || access.ring > sdw.r3 {
                return Err(acv(AcvCause::Ring));
            }
            if access.ring > sdw.r2 {
                // Call bracket: entry only through a gate, below the
                // call limiter unless the gate bit waives it.
                if !sdw.gate_ok && access.offset >= u32::from(sdw.call_limit) {
                    return Err(acv(AcvCause::Gate));
                }
            }
            if ralr != 0 && access.ring >= ralr {
                return Err(acv(AcvCause::RingAlarm));
            }
        }
    }
    Ok(())
}

/// Base-register relocation, used when neither absolute nor appending
/// mode is in force.  Base and bound are in 512-word blocks; an
/// address beyond the bound raises the store fault, as on the
/// hardware.
pub fn bar_relocate(bar: &BaseAddressRegister, addr: u32) -> Result<u32, AppendError> {
    if (addr >> 9) >= u32::from(bar.bound) {
        return Err(AppendError::Fault(FaultCode::Store, FaultDetail::None));
    }
    Ok((u32::from(bar.base) << 9) + addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConfiguration;

    const DSEG_BASE: u32 = 0o1000;
    const SEG_BASE: u32 = 0o4000;
    const PAGE_TABLE: u32 = 0o6000;

    fn machine() -> (MemoryUnit, DescriptorBase, AppendUnit) {
        let mem = MemoryUnit::new(&MemoryConfiguration { size_words: 0o40000 });
        let dsbr = DescriptorBase {
            addr: DSEG_BASE,
            bound: 0o77,
            unpaged: true,
            stack: 0,
        };
        (mem, dsbr, AppendUnit::default())
    }

    fn install_sdw(mem: &mut MemoryUnit, segno: u16, sdw: Sdw) {
        let (even, odd) = sdw.encode();
        mem.store_pair(DSEG_BASE + 2 * u32::from(segno), even, odd)
            .expect("descriptor store should succeed");
    }

    fn plain_sdw() -> Sdw {
        Sdw {
            addr: SEG_BASE,
            r1: 0,
            r2: 7,
            r3: 7,
            present: true,
            bound: 0o77,
            read: true,
            execute: true,
            write: true,
            unpaged: true,
            ..Sdw::default()
        }
    }

    fn read_access(segno: u16, offset: u32, ring: u8) -> SegAccess {
        SegAccess {
            ring,
            segno,
            offset,
            kind: AccessKind::Read,
        }
    }

    #[test]
    fn test_unpaged_translation() {
        let (mut mem, dsbr, mut apu) = machine();
        install_sdw(&mut mem, 3, plain_sdw());
        let abs = apu
            .resolve(&mut mem, &dsbr, 0, read_access(3, 0o123, 0), false)
            .expect("translation should succeed");
        assert_eq!(abs, SEG_BASE + 0o123);
    }

    #[test]
    fn test_paged_translation_and_used_modified_bits() {
        let (mut mem, dsbr, mut apu) = machine();
        let sdw = Sdw {
            addr: PAGE_TABLE,
            unpaged: false,
            ..plain_sdw()
        };
        install_sdw(&mut mem, 4, sdw);
        // Page 2 of the segment lives at absolute 0o20000.
        let ptw = Ptw {
            addr: 0o20000 >> 6,
            present: true,
            ..Ptw::default()
        };
        mem.store_word(PAGE_TABLE + 2, ptw.encode())
            .expect("page table store should succeed");

        let offset = 2 * PAGE_WORDS + 0o15;
        let abs = apu
            .resolve(&mut mem, &dsbr, 0, read_access(4, offset, 0), false)
            .expect("translation should succeed");
        assert_eq!(abs, 0o20000 + 0o15);
        let after_read = Ptw::decode(mem.fetch_word(PAGE_TABLE + 2).unwrap());
        assert!(after_read.used);
        assert!(!after_read.modified);

        let write = SegAccess {
            kind: AccessKind::Write,
            ..read_access(4, offset, 0)
        };
        apu.resolve(&mut mem, &dsbr, 0, write, false)
            .expect("write translation should succeed");
        let after_write = Ptw::decode(mem.fetch_word(PAGE_TABLE + 2).unwrap());
        assert!(after_write.modified);
    }

    #[test]
    fn test_paged_descriptor_segment_sets_used_bit() {
        let (mut mem, _, mut apu) = machine();
        // The descriptor segment itself is paged: its page table at
        // 0o500 maps dseg page 0 to absolute 0o1000.
        let dsbr = DescriptorBase {
            addr: 0o500,
            bound: 0o77,
            unpaged: false,
            stack: 0,
        };
        let dseg_ptw = Ptw {
            addr: DSEG_BASE >> 6,
            present: true,
            ..Ptw::default()
        };
        mem.store_word(0o500, dseg_ptw.encode())
            .expect("page table store should succeed");
        install_sdw(&mut mem, 3, plain_sdw());

        apu.resolve(&mut mem, &dsbr, 0, read_access(3, 0o123, 0), false)
            .expect("translation should succeed");
        let after = Ptw::decode(mem.fetch_word(0o500).unwrap());
        assert!(after.used);
    }

    #[test]
    fn test_bound_violation() {
        let (mut mem, dsbr, mut apu) = machine();
        install_sdw(&mut mem, 3, Sdw { bound: 1, ..plain_sdw() });
        // Bound 1 allows offsets 0..0o37.
        assert!(apu
            .resolve(&mut mem, &dsbr, 0, read_access(3, 0o37, 0), false)
            .is_ok());
        match apu.resolve(&mut mem, &dsbr, 0, read_access(3, 0o40, 0), false) {
            Err(AppendError::Fault(FaultCode::AccessViolation, FaultDetail::Acv(cause))) => {
                assert_eq!(cause, AcvCause::OutOfSegmentBounds);
            }
            other => panic!("expected bound violation, got {other:?}"),
        }
    }

    #[test]
    fn test_absent_segment_raises_stored_directed_fault() {
        let (mut mem, dsbr, mut apu) = machine();
        install_sdw(
            &mut mem,
            5,
            Sdw {
                present: false,
                fault_code: 2,
                ..plain_sdw()
            },
        );
        match apu.resolve(&mut mem, &dsbr, 0, read_access(5, 0, 0), false) {
            Err(AppendError::Fault(FaultCode::Directed2, FaultDetail::Directed(2))) => {}
            other => panic!("expected directed fault 2, got {other:?}"),
        }
        // The absent descriptor must not have been cached.
        assert!(apu.sdwam.lookup(5).is_none());
    }

    #[test]
    fn test_ring_brackets_2_4_6() {
        let (mut mem, dsbr, mut apu) = machine();
        install_sdw(
            &mut mem,
            6,
            Sdw {
                r1: 2,
                r2: 4,
                r3: 6,
                write: false,
                ..plain_sdw()
            },
        );
        // Read from ring 5 is inside the bracket and the read bit is
        // set, so it is permitted.
        assert!(apu
            .resolve(&mut mem, &dsbr, 0, read_access(6, 0, 5), false)
            .is_ok());
        // Ring 7 is outside all brackets: rejected citing the ring.
        match apu.resolve(&mut mem, &dsbr, 0, read_access(6, 0, 7), false) {
            Err(AppendError::Fault(_, FaultDetail::Acv(AcvCause::Ring))) => {}
            other => panic!("expected ring violation, got {other:?}"),
        }
        // Write bracket tops out at r1.
        let write = SegAccess {
            kind: AccessKind::Write,
            ..read_access(6, 0, 3)
        };
        match apu.resolve(&mut mem, &dsbr, 0, write, false) {
            Err(AppendError::Fault(_, FaultDetail::Acv(AcvCause::Ring))) => {}
            other => panic!("expected ring violation on write, got {other:?}"),
        }
    }

    #[test]
    fn test_permission_bits() {
        let (mut mem, dsbr, mut apu) = machine();
        install_sdw(&mut mem, 7, Sdw { read: false, ..plain_sdw() });
        match apu.resolve(&mut mem, &dsbr, 0, read_access(7, 0, 0), false) {
            Err(AppendError::Fault(_, FaultDetail::Acv(AcvCause::Permission(AccessDenied::Read)))) => {
            }
            other => panic!("expected permission violation, got {other:?}"),
        }
        // Protection bypass (fault-cycle appends) still translates.
        assert!(apu
            .resolve(&mut mem, &dsbr, 0, read_access(7, 0, 0), true)
            .is_ok());
    }

    #[test]
    fn test_gate_call_limiter() {
        let (mut mem, dsbr, mut apu) = machine();
        install_sdw(
            &mut mem,
            8,
            Sdw {
                r1: 0,
                r2: 2,
                r3: 5,
                gate_ok: false,
                call_limit: 0o10,
                ..plain_sdw()
            },
        );
        let call = |offset, ring| SegAccess {
            ring,
            segno: 8,
            offset,
            kind: AccessKind::Execute,
        };
        // Ring 4 is in the call bracket: entry below the limiter only.
        assert!(apu.resolve(&mut mem, &dsbr, 0, call(0o7, 4), false).is_ok());
        match apu.resolve(&mut mem, &dsbr, 0, call(0o10, 4), false) {
            Err(AppendError::Fault(_, FaultDetail::Acv(AcvCause::Gate))) => {}
            other => panic!("expected gate violation, got {other:?}"),
        }
        // Ring 2 is in the execute bracket proper: no gate check.
        assert!(apu.resolve(&mut mem, &dsbr, 0, call(0o100, 2), false).is_ok());
    }

    #[test]
    fn test_cache_transparency() {
        let (mut mem, dsbr, mut cached) = machine();
        let mut uncached = AppendUnit::default();
        uncached.sdwam.enabled = false;
        uncached.ptwam.enabled = false;

        install_sdw(&mut mem, 1, plain_sdw());
        install_sdw(
            &mut mem,
            2,
            Sdw {
                addr: PAGE_TABLE,
                unpaged: false,
                ..plain_sdw()
            },
        );
        let ptw = Ptw {
            addr: 0o30000 >> 6,
            present: true,
            ..Ptw::default()
        };
        mem.store_word(PAGE_TABLE, ptw.encode())
            .expect("page table store should succeed");
        install_sdw(&mut mem, 3, Sdw { present: false, fault_code: 1, ..plain_sdw() });

        let requests = [
            read_access(1, 0o10, 0),
            read_access(2, 0o21, 0),
            read_access(1, 0o10, 0),
            read_access(3, 0, 0),
            read_access(2, 0o22, 0),
            read_access(1, 0o1000, 0), // out of bounds
        ];
        for req in requests {
            let with_cache = cached.resolve(&mut mem, &dsbr, 0, req, false);
            let without = uncached.resolve(&mut mem, &dsbr, 0, req, false);
            match (with_cache, without) {
                (Ok(a), Ok(b)) => assert_eq!(a, b, "diverged on {req:?}"),
                (Err(AppendError::Fault(ca, _)), Err(AppendError::Fault(cb, _))) => {
                    assert_eq!(ca, cb, "fault diverged on {req:?}");
                }
                (a, b) => panic!("cache changed outcome on {req:?}: {a:?} vs {b:?}"),
            }
        }
    }

    #[test]
    fn test_bar_relocation() {
        let bar = BaseAddressRegister { base: 2, bound: 1 };
        assert_eq!(bar_relocate(&bar, 0o100).expect("in bounds"), 0o2100);
        match bar_relocate(&bar, 0o1000) {
            Err(AppendError::Fault(FaultCode::Store, _)) => {}
            other => panic!("expected store fault, got {other:?}"),
        }
    }
}
