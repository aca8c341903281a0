//! Pending faults and interrupts, with the hardware's priority
//! arbitration.
//!
//! The 32 fault codes fall into seven priority groups.  Groups 1..6
//! each hold at most one pending fault; registering a second fault in
//! the same group overwrites the first.  Group 7 is a bitmask and its
//! causes coexist until individually cleared.  Interrupts are 32
//! sticky lines set by the external I/O subsystem.  Any pending fault
//! is serviced before any interrupt; the lowest-numbered group wins
//! among faults, and within group 7 the lowest fault code wins.
//!
//! A cached lowest-pending-group number and an aggregate flag keep
//! the per-cycle "anything pending?" question off the O(32) scan.

use std::fmt::{self, Display, Formatter};

use serde::Serialize;
use tracing::{event, Level};

use crate::types::{NUM_FAULT_CODES, NUM_INTERRUPT_LINES};

/// The architectural fault codes.  Discriminants are the hardware
/// fault numbers; a fault vectors through the pair at
/// `(fault_base << 5) + 2 * code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum FaultCode {
    Shutdown = 0,
    Store = 1,
    Mme = 2,
    FaultTag1 = 3,
    TimerRunout = 4,
    Command = 5,
    Derail = 6,
    Lockup = 7,
    Connect = 8,
    Parity = 9,
    IllegalProcedure = 10,
    OpNotComplete = 11,
    Startup = 12,
    Overflow = 13,
    DivideCheck = 14,
    Execute = 15,
    Directed0 = 16,
    Directed1 = 17,
    Directed2 = 18,
    Directed3 = 19,
    AccessViolation = 20,
    Mme2 = 21,
    Mme3 = 22,
    Mme4 = 23,
    FaultTag2 = 24,
    FaultTag3 = 25,
    Unassigned26 = 26,
    Unassigned27 = 27,
    Unassigned28 = 28,
    Unassigned29 = 29,
    Unassigned30 = 30,
    Trouble = 31,
}

impl FaultCode {
    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn from_number(n: u8) -> Option<FaultCode> {
        use FaultCode::*;
        const ALL: [FaultCode; NUM_FAULT_CODES] = [
            Shutdown,
            Store,
            Mme,
            FaultTag1,
            TimerRunout,
            Command,
            Derail,
            Lockup,
            Connect,
            Parity,
            IllegalProcedure,
            OpNotComplete,
            Startup,
            Overflow,
            DivideCheck,
            Execute,
            Directed0,
            Directed1,
            Directed2,
            Directed3,
            AccessViolation,
            Mme2,
            Mme3,
            Mme4,
            FaultTag2,
            FaultTag3,
            Unassigned26,
            Unassigned27,
            Unassigned28,
            Unassigned29,
            Unassigned30,
            Trouble,
        ];
        ALL.get(usize::from(n)).copied()
    }

    /// Priority group of the fault, 1 (serviced first) through 7;
    /// zero marks unassigned codes.
    pub fn group(self) -> u8 {
        FAULT_GROUP[usize::from(self.number())]
    }

    /// The directed fault selected by a descriptor's stored 2-bit
    /// fault code.
    pub fn directed(fc: u8) -> FaultCode {
        match fc & 3 {
            0 => FaultCode::Directed0,
            1 => FaultCode::Directed1,
            2 => FaultCode::Directed2,
            _ => FaultCode::Directed3,
        }
    }
}

impl Display for FaultCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{self:?} (fault {})", self.number())
    }
}

/// Priority group per fault number.
const FAULT_GROUP: [u8; NUM_FAULT_CODES] = [
    7, 4, 5, 5, 7, 4, 5, 4, // shutdown..lockup
    7, 4, 5, 2, 1, 3, 3, 1, // connect..execute
    6, 6, 6, 6, 6, 5, 5, 5, // directed 0..3, acv, mme2..4
    5, 5, 0, 0, 0, 0, 0, 2, // tag2, tag3, unassigned, trouble
];

const NUM_GROUPS: usize = 7;

/// Why an access-violation fault was raised; latched into the fault
/// register for diagnostic software.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AcvCause {
    OutOfSegmentBounds,
    Ring,
    Permission(AccessDenied),
    Gate,
    RingAlarm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AccessDenied {
    Read,
    Write,
    Execute,
}

/// Extra information carried with a pending fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FaultDetail {
    None,
    Acv(AcvCause),
    /// The 2-bit descriptor fault code behind a directed fault.
    Directed(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PendingFault {
    pub code: FaultCode,
    pub detail: FaultDetail,
}

/// The fault/interrupt arbitration unit.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventUnit {
    /// One pending fault per group 1..6 (index 0 is group 1).
    group_pending: [Option<PendingFault>; 6],
    /// Group 7 cause bitmask, indexed by fault number.
    group7: u32,
    /// Sticky interrupt lines.
    interrupts: u32,
    /// Lowest group with a pending fault, 0 when none.
    low_group: u8,
    /// True when any fault or interrupt is pending.
    any: bool,
}

impl EventUnit {
    /// Register a fault.  Within groups 1..6 only the latest fault of
    /// the group survives.
    pub fn raise_fault(&mut self, code: FaultCode, detail: FaultDetail) {
        let group = code.group();
        event!(Level::DEBUG, "fault {} raised (group {})", code, group);
        match group {
            0 => {
                // Unassigned codes have no group; treat as trouble so
                // the condition is never silently lost.
                self.group_pending[1] = Some(PendingFault {
                    code: FaultCode::Trouble,
                    detail: FaultDetail::None,
                });
            }
            7 => {
                self.group7 |= 1 << code.number();
            }
            g => {
                self.group_pending[usize::from(g) - 1] = Some(PendingFault { code, detail });
            }
        }
        self.recompute();
    }

    /// Register an interrupt line (called by the external I/O
    /// subsystem).
    pub fn set_interrupt(&mut self, line: u8) {
        debug_assert!(usize::from(line) < NUM_INTERRUPT_LINES);
        event!(Level::DEBUG, "interrupt line {} raised", line);
        self.interrupts |= 1 << (line & 0x1f);
        self.recompute();
    }

    /// True when any fault or interrupt is pending.
    pub fn any_pending(&self) -> bool {
        self.any
    }

    /// True when any fault is pending.
    pub fn fault_pending(&self) -> bool {
        self.low_group != 0
    }

    pub fn interrupt_pending(&self) -> bool {
        self.interrupts != 0
    }

    /// The highest-priority pending fault, without consuming it.
    pub fn peek_fault(&self) -> Option<PendingFault> {
        match self.low_group {
            0 => None,
            7 => {
                let n = self.group7.trailing_zeros() as u8;
                let code = FaultCode::from_number(n)?;
                Some(PendingFault {
                    code,
                    detail: FaultDetail::None,
                })
            }
            g => self.group_pending[usize::from(g) - 1],
        }
    }

    /// Consume the highest-priority pending fault.
    pub fn take_fault(&mut self) -> Option<PendingFault> {
        let pending = self.peek_fault()?;
        match pending.code.group() {
            7 => self.group7 &= !(1 << pending.code.number()),
            g => self.group_pending[usize::from(g) - 1] = None,
        }
        self.recompute();
        Some(pending)
    }

    /// Consume the lowest-numbered pending interrupt line.  Callers
    /// must have serviced all faults first.
    pub fn take_interrupt(&mut self) -> Option<u8> {
        if self.interrupts == 0 {
            return None;
        }
        let line = self.interrupts.trailing_zeros() as u8;
        self.interrupts &= !(1 << line);
        self.recompute();
        Some(line)
    }

    /// Host introspection: clear one pending interrupt line without
    /// servicing it.
    pub fn clear_interrupt(&mut self, line: u8) {
        self.interrupts &= !(1 << (line & 0x1f));
        self.recompute();
    }

    /// Host introspection: discard all pending faults.
    pub fn clear_faults(&mut self) {
        self.group_pending = [None; 6];
        self.group7 = 0;
        self.recompute();
    }

    fn recompute(&mut self) {
        self.low_group = 0;
        for g in 0..NUM_GROUPS - 1 {
            if self.group_pending[g].is_some() {
                self.low_group = g as u8 + 1;
                break;
            }
        }
        if self.low_group == 0 && self.group7 != 0 {
            self.low_group = 7;
        }
        self.any = self.low_group != 0 || self.interrupts != 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_table_spot_checks() {
        assert_eq!(FaultCode::Startup.group(), 1);
        assert_eq!(FaultCode::Execute.group(), 1);
        assert_eq!(FaultCode::Trouble.group(), 2);
        assert_eq!(FaultCode::Overflow.group(), 3);
        assert_eq!(FaultCode::Lockup.group(), 4);
        assert_eq!(FaultCode::IllegalProcedure.group(), 5);
        assert_eq!(FaultCode::AccessViolation.group(), 6);
        assert_eq!(FaultCode::TimerRunout.group(), 7);
        assert_eq!(FaultCode::Connect.group(), 7);
    }

    #[test]
    fn test_same_group_overwrites() {
        let mut events = EventUnit::default();
        events.raise_fault(FaultCode::Mme, FaultDetail::None);
        events.raise_fault(FaultCode::IllegalProcedure, FaultDetail::None);
        // Both are group 5; only the second survives.
        let pending = events.take_fault().expect("a fault should be pending");
        assert_eq!(pending.code, FaultCode::IllegalProcedure);
        assert!(events.take_fault().is_none());
    }

    #[test]
    fn test_group7_causes_coexist() {
        let mut events = EventUnit::default();
        events.raise_fault(FaultCode::TimerRunout, FaultDetail::None);
        events.raise_fault(FaultCode::Connect, FaultDetail::None);
        let first = events.take_fault().expect("first group-7 cause");
        let second = events.take_fault().expect("second group-7 cause");
        // Lowest code first: shutdown(0) < timer(4) < connect(8).
        assert_eq!(first.code, FaultCode::TimerRunout);
        assert_eq!(second.code, FaultCode::Connect);
        assert!(events.take_fault().is_none());
    }

    #[test]
    fn test_lower_group_wins() {
        let mut events = EventUnit::default();
        events.raise_fault(FaultCode::TimerRunout, FaultDetail::None); // group 7
        events.raise_fault(FaultCode::Overflow, FaultDetail::None); // group 3
        events.raise_fault(FaultCode::Startup, FaultDetail::None); // group 1
        assert_eq!(
            events.take_fault().map(|p| p.code),
            Some(FaultCode::Startup)
        );
        assert_eq!(
            events.take_fault().map(|p| p.code),
            Some(FaultCode::Overflow)
        );
        assert_eq!(
            events.take_fault().map(|p| p.code),
            Some(FaultCode::TimerRunout)
        );
    }

    #[test]
    fn test_faults_beat_interrupts() {
        let mut events = EventUnit::default();
        events.set_interrupt(0);
        events.raise_fault(FaultCode::Overflow, FaultDetail::None);
        assert!(events.fault_pending());
        assert!(events.peek_fault().is_some());
        // The engine only asks for an interrupt once no fault is
        // pending; after the fault is taken the interrupt remains.
        events.take_fault();
        assert!(!events.fault_pending());
        assert_eq!(events.take_interrupt(), Some(0));
    }

    #[test]
    fn test_interrupt_lines_are_sticky_and_independent() {
        let mut events = EventUnit::default();
        events.set_interrupt(5);
        events.set_interrupt(3);
        events.set_interrupt(5);
        assert_eq!(events.take_interrupt(), Some(3));
        assert_eq!(events.take_interrupt(), Some(5));
        assert_eq!(events.take_interrupt(), None);
        assert!(!events.any_pending());
    }
}
