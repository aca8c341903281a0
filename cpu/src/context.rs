//! One processor's complete state, owned by the host driver.
//!
//! Everything the cycle engine mutates lives here: the register file,
//! the appending unit with its caches, the event unit and the
//! control-unit scratch data.  Main memory is deliberately not owned
//! by the context; the host passes it into each call, which keeps a
//! future multi-processor configuration from sharing anything through
//! this struct by accident.

use serde::Serialize;

use crate::append::AppendUnit;
use crate::assoc::{PtwAm, SdwAm};
use crate::control::ControlUnitData;
use crate::events::{EventUnit, FaultCode, FaultDetail};
use crate::registers::RegisterFile;
use crate::types::CycleState;

/// Maintenance-panel switch settings, fixed by the host at
/// construction.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SwitchSettings {
    /// Fault base switches; faults vector through the pair at
    /// `(fault_base << 5) + 2 * code`.
    pub fault_base: u32,
    /// This processor's number, stored into the control-unit save
    /// area.
    pub cpu_num: u8,
}

impl Default for SwitchSettings {
    fn default() -> SwitchSettings {
        SwitchSettings {
            fault_base: 2,
            cpu_num: 0,
        }
    }
}

/// The complete state of one simulated processor.
#[derive(Debug, Default)]
pub struct CpuContext {
    pub regs: RegisterFile,
    pub append: AppendUnit,
    pub events: EventUnit,
    pub cu: ControlUnitData,
    pub cycle: CycleState,
    pub switches: SwitchSettings,
    /// Set while a fault handler's vector pair is being executed;
    /// a fault raised now collapses to the trouble fault.
    pub(crate) in_fault: bool,
    /// Set while the trouble handler itself runs; a fault raised now
    /// is a simulation stop.
    pub(crate) in_trouble: bool,
}

impl Default for CycleState {
    fn default() -> CycleState {
        CycleState::Fetch
    }
}

impl CpuContext {
    pub fn new(switches: SwitchSettings) -> CpuContext {
        CpuContext {
            switches,
            ..CpuContext::default()
        }
    }

    /// Count down the timer register by `units`; underflow raises the
    /// timer-runout fault.  The host calls this from its driver loop;
    /// the engine itself never advances time.
    pub fn tick_timer(&mut self, units: u32) {
        let (next, underflowed) = self.regs.timer.overflowing_sub(units);
        self.regs.timer = next & ((1 << 27) - 1);
        if underflowed || next >> 27 != 0 {
            self.events
                .raise_fault(FaultCode::TimerRunout, FaultDetail::None);
        }
    }

    /// Read-only snapshot of the registers, caches and control-unit
    /// data, for external logging and history tooling.
    pub fn snapshot(&self) -> CpuSnapshot {
        CpuSnapshot {
            regs: self.regs.clone(),
            cycle: self.cycle,
            cu: self.cu.clone(),
            sdwam: self.append.sdwam.clone(),
            ptwam: self.append.ptwam.clone(),
            events: self.events.clone(),
        }
    }
}

/// Serializable point-in-time copy of a processor's state.
#[derive(Debug, Clone, Serialize)]
pub struct CpuSnapshot {
    pub regs: RegisterFile,
    pub cycle: CycleState,
    pub cu: ControlUnitData,
    pub sdwam: SdwAm,
    pub ptwam: PtwAm,
    pub events: EventUnit,
}
