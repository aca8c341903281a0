//! The control unit cycle engine.
//!
//! The engine is a state machine over the cycle states in types.rs.
//! Each call to [`CpuContext::step`] performs one cycle: a fetch
//! (including the pending-event check), one instruction execution, or
//! one stage of fault/interrupt service.  The host drives the loop
//! and owns main memory; the arithmetic and EIS operator units sit
//! behind the [`OperandExecutor`] seam.
//!
//! Instructions are fetched as aligned even/odd pairs.  The odd word
//! is held in the control-unit data so that executing the odd half of
//! a pair costs no memory access; a store into the held word's
//! location invalidates it and forces a refetch.
//!
//! Faults vector through the pair at `(fault_base << 5) + 2 * code`
//! and interrupts through the pair at `2 * line`, each executed as an
//! execute-double pair in absolute mode with protection checks
//! bypassed.  A fault raised during such a pair collapses to the
//! trouble fault; a fault raised during the trouble pair itself stops
//! the simulation.

use serde::Serialize;
use tracing::{event, span, Level};

use base::prelude::*;

use crate::append::{bar_relocate, AppendError, SegAccess};
use crate::context::CpuContext;
use crate::events::{FaultCode, FaultDetail};
use crate::executor::{Operand, OperandExecutor};
use crate::memory::MemoryUnit;
use crate::registers::{DescriptorBase, ModeRegister};
use crate::stop::SimStop;
use crate::types::{AccessKind, CycleState};

const M18: u32 = 0o777777;
const M27: u32 = (1 << 27) - 1;

/// Indirection chains longer than this raise the lockup fault.
const MAX_INDIRECTIONS: u32 = 64;

/// `xec`/`xed` chains longer than this raise the lockup fault; an
/// `xec` whose target is itself would otherwise never leave the
/// execution loop.
const MAX_EXECUTE_CHAIN: u32 = 64;

/// The architecturally visible control-unit scratch state, saved and
/// restored bit-for-bit by the `scu`/`rcu` instructions.
#[derive(Debug, Clone, Serialize)]
pub struct ControlUnitData {
    /// The working instruction register.
    pub instr: Instruction,
    /// Raw word the working instruction was decoded from.
    pub instr_word: u64,
    /// Held odd word of the current instruction pair.
    pub irodd: u64,
    /// Set when a store has hit the held odd word's location.
    pub irodd_invalid: bool,
    /// IC base (even) of the cached pair, when valid.
    pair_for_ic: Option<u32>,
    /// Absolute base of the cached pair, for store invalidation.
    pair_abs: Option<u32>,
    /// Repeat-instruction state.
    pub rpt: bool,
    pub rpd: bool,
    pub repeat_first: bool,
    /// Address increment applied on each repetition (the repeat
    /// instruction's tag field).
    pub delta: u8,
    repeat_ca: [u32; 2],
    rpd_phase: usize,
    rpd_saved: [Instruction; 2],
    /// Execute-double state: even/odd halves still pending.
    pub xde: bool,
    pub xdo: bool,
    /// Tag held across an interrupted indirection chain.
    pub ct_hold: u8,
    /// The last prepared address came through a pointer register or
    /// ITS/ITP pair, which forces appending-mode translation.
    via_pointer: bool,
    /// Inhibit bit of the last executed instruction; suppresses
    /// interrupt sampling before the next one.
    inhibit_next: bool,
    /// Vector address latched between the fault/interrupt take cycle
    /// and the pair-execution cycle.
    vector_addr: u32,
    /// The pair being executed in FaultExec came from an interrupt
    /// cell rather than the fault table.
    vector_is_interrupt: bool,
}

impl Default for ControlUnitData {
    fn default() -> ControlUnitData {
        ControlUnitData {
            instr: Instruction::invalid(),
            instr_word: 0,
            irodd: 0,
            irodd_invalid: false,
            pair_for_ic: None,
            pair_abs: None,
            rpt: false,
            rpd: false,
            repeat_first: false,
            delta: 0,
            repeat_ca: [0; 2],
            rpd_phase: 0,
            rpd_saved: [Instruction::invalid(); 2],
            xde: false,
            xdo: false,
            ct_hold: 0,
            via_pointer: false,
            inhibit_next: false,
            vector_addr: 0,
            vector_is_interrupt: false,
        }
    }
}

/// What one instruction execution asks the engine to do next.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    /// Advance the instruction counter and fetch.
    Continue,
    /// The instruction counter was set explicitly; fetch from there.
    Transfer,
    /// Execute the (replaced) working instruction again without a
    /// fetch (`xec`/`xed`).
    Again,
    /// Re-enter EXEC for a repeat iteration without a fetch.
    Repeat,
    /// Enter the DIS pseudo-cycle.
    Dis,
    /// A fault was registered; abort the instruction.
    Fault,
}

/// Result of address preparation.
enum Prepped {
    /// A `du`/`dl` literal.
    Immediate(u64),
    /// An 18-bit computed address, translatable via the current mode.
    Addr(u32),
}

impl CpuContext {
    /// Run one cycle.  Returns normally even when no progress is
    /// possible (DIS with nothing pending); host anomalies surface as
    /// [`SimStop`].
    pub fn step(
        &mut self,
        mem: &mut MemoryUnit,
        exec: &mut dyn OperandExecutor,
    ) -> Result<(), SimStop> {
        let span = span!(Level::TRACE, "cycle", state = ?self.cycle, ic = self.regs.ppr.ic);
        let _enter = span.enter();
        match self.cycle {
            CycleState::Fetch => self.fetch_cycle(mem),
            CycleState::Exec => self.exec_cycle(mem, exec),
            CycleState::Abort => {
                // Discard the in-flight instruction with no partial
                // effects; the registered fault is picked up next.
                self.cu.rpt = false;
                self.cu.rpd = false;
                self.cu.repeat_first = false;
                self.cu.xde = false;
                self.cu.xdo = false;
                self.cu.pair_for_ic = None;
                self.cycle = CycleState::Fetch;
                Ok(())
            }
            CycleState::Fault => self.fault_cycle(),
            CycleState::Interrupt => self.interrupt_cycle(),
            CycleState::FaultExec => self.vector_pair_cycle(mem, exec),
            CycleState::Dis => {
                if self.events.fault_pending() {
                    self.cycle = CycleState::Fault;
                } else if self.events.interrupt_pending() {
                    self.cycle = CycleState::Interrupt;
                }
                Ok(())
            }
        }
    }

    /// Convenience driver: run cycles until a stop, a cycle budget,
    /// or a quiescent DIS with nothing pending.
    pub fn run(
        &mut self,
        mem: &mut MemoryUnit,
        exec: &mut dyn OperandExecutor,
        max_cycles: u64,
    ) -> Result<u64, SimStop> {
        for n in 0..max_cycles {
            if self.cycle == CycleState::Dis && !self.events.any_pending() {
                return Ok(n);
            }
            self.step(mem, exec)?;
        }
        Ok(max_cycles)
    }

    fn fetch_cycle(&mut self, mem: &mut MemoryUnit) -> Result<(), SimStop> {
        if self.events.fault_pending() {
            self.cycle = CycleState::Fault;
            return Ok(());
        }
        if self.events.interrupt_pending() && !self.cu.inhibit_next {
            self.cycle = CycleState::Interrupt;
            return Ok(());
        }
        let ic = self.regs.ppr.ic & M18;
        let base = ic & !1;
        let word = if ic & 1 == 1 && self.cu.pair_for_ic == Some(base) && !self.cu.irodd_invalid {
            self.cu.irodd
        } else {
            match self.fetch_pair_at(mem, base) {
                Ok((even, odd)) => {
                    if even == 0 && odd == 0 {
                        return Err(SimStop::MemClear { addr: base });
                    }
                    if ic & 1 == 0 {
                        even
                    } else {
                        odd
                    }
                }
                Err(AppendError::Fault(code, detail)) => {
                    self.events.raise_fault(code, detail);
                    self.cycle = CycleState::Fault;
                    return Ok(());
                }
                Err(AppendError::Mem(failure)) => return Err(SimStop::Memory(failure)),
            }
        };
        self.cu.instr_word = word;
        self.cu.instr = Instruction::decode(word);
        event!(Level::TRACE, "fetched {} at {:>06o}", self.cu.instr, ic);
        self.cycle = CycleState::Exec;
        Ok(())
    }

    /// Fetch an aligned instruction pair through the current
    /// addressing mode and remember it in the control-unit data.
    fn fetch_pair_at(&mut self, mem: &mut MemoryUnit, base: u32) -> Result<(u64, u64), AppendError> {
        self.regs.tpr.trr = self.regs.ppr.prr;
        self.regs.tpr.tsr = self.regs.ppr.psr;
        let abs = self.translate(mem, base, AccessKind::Execute, false, false)?;
        let (even, odd) = mem.fetch_pair(abs)?;
        self.cu.pair_for_ic = Some(base);
        self.cu.pair_abs = Some(abs & !1);
        self.cu.irodd = odd;
        self.cu.irodd_invalid = false;
        Ok((even, odd))
    }

    fn exec_cycle(
        &mut self,
        mem: &mut MemoryUnit,
        exec: &mut dyn OperandExecutor,
    ) -> Result<(), SimStop> {
        if (self.cu.rpt || self.cu.rpd) && !self.cu.repeat_first {
            // Repeats checkpoint between iterations.  A pending event
            // ends the sequence; the indicator records that the
            // instruction was cut short.
            if self.events.fault_pending() {
                self.regs.ir.mid_instruction_interrupt_fault = true;
                self.cu.rpt = false;
                self.cu.rpd = false;
                self.cycle = CycleState::Fault;
                return Ok(());
            }
            if self.events.interrupt_pending() && !self.cu.inhibit_next {
                self.regs.ir.mid_instruction_interrupt_fault = true;
                self.cu.rpt = false;
                self.cu.rpd = false;
                self.cycle = CycleState::Interrupt;
                return Ok(());
            }
        }
        let inhibit = self.cu.instr.inhibit;
        let flow = self.run_to_completion(mem, exec, false)?;
        self.cu.inhibit_next = inhibit;
        match flow {
            Flow::Continue => {
                self.regs.ppr.ic = (self.regs.ppr.ic + 1) & M18;
                self.cycle = CycleState::Fetch;
            }
            Flow::Transfer => {
                self.cu.pair_for_ic = None;
                self.cu.rpt = false;
                self.cu.rpd = false;
                self.cycle = CycleState::Fetch;
            }
            Flow::Again | Flow::Repeat => {
                self.cycle = CycleState::Exec;
            }
            Flow::Dis => {
                self.regs.ppr.ic = (self.regs.ppr.ic + 1) & M18;
                self.cycle = CycleState::Dis;
                event!(Level::DEBUG, "entering DIS at {:>06o}", self.regs.ppr.ic);
            }
            Flow::Fault => {
                self.cycle = CycleState::Abort;
            }
        }
        Ok(())
    }

    fn fault_cycle(&mut self) -> Result<(), SimStop> {
        let pending = match self.events.take_fault() {
            Some(p) => p,
            None => {
                return Err(SimStop::Bug(
                    "fault cycle entered with no pending fault".to_string(),
                ))
            }
        };
        event!(Level::DEBUG, "taking fault {}", pending.code);
        if pending.code == FaultCode::Trouble {
            if self.in_trouble {
                return Err(SimStop::Bug(
                    "fault raised inside the trouble-fault handler".to_string(),
                ));
            }
            self.in_trouble = true;
        }
        self.in_fault = true;
        self.regs.fault_reg |= 1 << pending.code.number();
        self.cu.vector_addr =
            (self.switches.fault_base << 5) + 2 * u32::from(pending.code.number());
        self.cu.vector_is_interrupt = false;
        self.cycle = CycleState::FaultExec;
        Ok(())
    }

    fn interrupt_cycle(&mut self) -> Result<(), SimStop> {
        match self.events.take_interrupt() {
            Some(line) => {
                event!(Level::DEBUG, "taking interrupt line {}", line);
                self.in_fault = true;
                self.cu.vector_addr = 2 * u32::from(line);
                self.cu.vector_is_interrupt = true;
                self.cycle = CycleState::FaultExec;
            }
            None => {
                // The line was cleared between sampling and service.
                self.cycle = CycleState::Fetch;
            }
        }
        Ok(())
    }

    /// Execute a fault or interrupt vector pair: both words, absolute
    /// addressing, protection checks bypassed.  A transfer out of the
    /// pair ends the service; a fault during it collapses to the
    /// trouble fault.
    fn vector_pair_cycle(
        &mut self,
        mem: &mut MemoryUnit,
        exec: &mut dyn OperandExecutor,
    ) -> Result<(), SimStop> {
        let vector = self.cu.vector_addr;
        let (even, odd) = mem.fetch_pair(vector)?;
        if even == 0 && odd == 0 {
            return Err(SimStop::MemClear { addr: vector });
        }
        for word in [even, odd] {
            self.cu.instr_word = word;
            self.cu.instr = Instruction::decode(word);
            // Repeats make no sense inside a vector pair; drop them
            // rather than loop forever.
            self.cu.rpt = false;
            self.cu.rpd = false;
            match self.run_to_completion(mem, exec, true)? {
                Flow::Transfer => {
                    self.leave_vector_pair();
                    return Ok(());
                }
                Flow::Fault => {
                    if self.in_trouble {
                        return Err(SimStop::Bug(
                            "fault raised inside the trouble-fault handler".to_string(),
                        ));
                    }
                    // Collapse the nested fault into trouble.
                    self.events.take_fault();
                    self.events
                        .raise_fault(FaultCode::Trouble, FaultDetail::None);
                    self.cycle = CycleState::Fault;
                    return Ok(());
                }
                Flow::Dis => {
                    self.leave_vector_pair();
                    self.cycle = CycleState::Dis;
                    return Ok(());
                }
                Flow::Continue | Flow::Again | Flow::Repeat => {}
            }
        }
        // Neither word transferred: resume where we left off.
        self.leave_vector_pair();
        Ok(())
    }

    fn leave_vector_pair(&mut self) {
        self.in_fault = false;
        self.in_trouble = false;
        self.cu.vector_is_interrupt = false;
        self.cu.pair_for_ic = None;
        self.cycle = CycleState::Fetch;
    }

    /// Execute the working instruction through any `xec`/`xed`
    /// chaining, so the caller only sees terminal flows.
    fn run_to_completion(
        &mut self,
        mem: &mut MemoryUnit,
        exec: &mut dyn OperandExecutor,
        bypass: bool,
    ) -> Result<Flow, SimStop> {
        let mut chained = 0;
        loop {
            match self.exec_current(mem, exec, bypass)? {
                Flow::Again => {
                    chained += 1;
                    if chained > MAX_EXECUTE_CHAIN {
                        self.cu.xde = false;
                        self.cu.xdo = false;
                        return self.raise(FaultCode::Lockup, FaultDetail::None);
                    }
                }
                Flow::Continue if self.cu.xde && self.cu.xdo => {
                    // Even half of an execute-double is done; run the
                    // odd half without a fetch.
                    self.cu.xde = false;
                    self.cu.instr_word = self.cu.irodd;
                    self.cu.instr = Instruction::decode(self.cu.irodd);
                }
                Flow::Continue if self.cu.xdo => {
                    self.cu.xdo = false;
                    return Ok(Flow::Continue);
                }
                flow => {
                    if matches!(flow, Flow::Transfer | Flow::Fault) {
                        self.cu.xde = false;
                        self.cu.xdo = false;
                    }
                    return Ok(flow);
                }
            }
        }
    }

    /// Execute the working instruction.  `bypass` is set while a
    /// vector pair runs.
    fn exec_current(
        &mut self,
        mem: &mut MemoryUnit,
        exec: &mut dyn OperandExecutor,
        bypass: bool,
    ) -> Result<Flow, SimStop> {
        let instr = self.cu.instr;
        if !instr.is_defined() {
            event!(Level::DEBUG, "undefined opcode {:>04o}", instr.opcode);
            return self.raise(FaultCode::IllegalProcedure, FaultDetail::None);
        }
        if instr.is_privileged() && !self.regs.is_privileged() && !bypass {
            event!(Level::DEBUG, "privileged opcode in unprivileged ring");
            return self.raise(FaultCode::IllegalProcedure, FaultDetail::None);
        }
        match Opcode::from_raw(instr.opcode) {
            Some(op) => self.exec_control_op(mem, op, bypass),
            None => self.exec_operand_op(mem, exec, bypass),
        }
    }

    fn exec_control_op(
        &mut self,
        mem: &mut MemoryUnit,
        op: Opcode,
        bypass: bool,
    ) -> Result<Flow, SimStop> {
        let instr = self.cu.instr;
        match op {
            Opcode::Nop => Ok(Flow::Continue),
            Opcode::Mme => self.raise(FaultCode::Mme, FaultDetail::None),
            Opcode::Mme2 => self.raise(FaultCode::Mme2, FaultDetail::None),
            Opcode::Mme3 => self.raise(FaultCode::Mme3, FaultDetail::None),
            Opcode::Mme4 => self.raise(FaultCode::Mme4, FaultDetail::None),
            Opcode::Drl => self.raise(FaultCode::Derail, FaultDetail::None),
            Opcode::Dis => Ok(Flow::Dis),
            Opcode::Tra => {
                let ca = match self.prep_operand(mem, bypass) {
                    Ok(Prepped::Addr(ca)) => ca,
                    Ok(Prepped::Immediate(_)) => {
                        return self.raise(FaultCode::IllegalProcedure, FaultDetail::None)
                    }
                    Err(e) => return self.fault_from(e),
                };
                self.regs.ppr.ic = ca & M18;
                if !self.regs.ir.abs_mode {
                    self.regs.ppr.psr = self.regs.tpr.tsr;
                    self.regs.ppr.prr = self.regs.tpr.trr;
                }
                Ok(Flow::Transfer)
            }
            Opcode::Rtcd => {
                let (even, odd) = match self.fetch_operand_pair(mem, bypass) {
                    Ok(pair) => pair,
                    Err(e) => return self.fault_from(e),
                };
                // A return can move outward but never inward.
                self.regs.ppr.prr = (field36(even, 0, 3) as u8).max(self.regs.ppr.prr);
                self.regs.ppr.psr = field36(even, 3, 15) as u16;
                self.regs.ppr.p = bit36(even, 18);
                self.regs.ppr.ic = field36(odd, 0, 18) as u32;
                Ok(Flow::Transfer)
            }
            Opcode::Xec => {
                let word = match self.fetch_operand_word(mem, bypass) {
                    Ok(w) => w,
                    Err(e) => return self.fault_from(e),
                };
                self.cu.instr_word = word;
                self.cu.instr = Instruction::decode(word);
                Ok(Flow::Again)
            }
            Opcode::Xed => {
                let (even, odd) = match self.fetch_operand_pair(mem, bypass) {
                    Ok(pair) => pair,
                    Err(e) => return self.fault_from(e),
                };
                self.cu.instr_word = even;
                self.cu.instr = Instruction::decode(even);
                self.cu.irodd = odd;
                // The held instruction-pair word was just replaced.
                self.cu.pair_for_ic = None;
                self.cu.xde = true;
                self.cu.xdo = true;
                Ok(Flow::Again)
            }
            Opcode::Scu => {
                let abs = match self.resolve_operand_addr(mem, AccessKind::Write, bypass) {
                    Ok(abs) => abs,
                    Err(e) => return self.fault_from(e),
                };
                let words = self.save_control_unit();
                mem.store_block8(abs, &words)?;
                for i in 0..8 {
                    self.note_store((abs & !1) + i);
                }
                Ok(Flow::Continue)
            }
            Opcode::Rcu => {
                let abs = match self.resolve_operand_addr(mem, AccessKind::Read, bypass) {
                    Ok(abs) => abs,
                    Err(e) => return self.fault_from(e),
                };
                let words = mem.fetch_block8(abs)?;
                self.restore_control_unit(&words);
                Ok(Flow::Transfer)
            }
            Opcode::Ldt => {
                let word = match self.fetch_operand_word(mem, bypass) {
                    Ok(w) => w,
                    Err(e) => return self.fault_from(e),
                };
                self.regs.timer = (field36(word, 0, 27) as u32) & M27;
                Ok(Flow::Continue)
            }
            Opcode::Lcpr => {
                let word = match self.fetch_operand_word(mem, bypass) {
                    Ok(w) => w,
                    Err(e) => return self.fault_from(e),
                };
                self.regs.mode = ModeRegister::load(word);
                self.append.sdwam.enabled = self.regs.mode.sdwam_on;
                self.append.ptwam.enabled = self.regs.mode.ptwam_on;
                event!(Level::INFO, "mode register loaded: {:?}", self.regs.mode);
                Ok(Flow::Continue)
            }
            Opcode::Ldbr => {
                let (even, odd) = match self.fetch_operand_pair(mem, bypass) {
                    Ok(pair) => pair,
                    Err(e) => return self.fault_from(e),
                };
                self.regs.dsbr = DescriptorBase::load(even, odd);
                self.append.clear_caches();
                event!(Level::INFO, "descriptor base loaded: {:?}", self.regs.dsbr);
                Ok(Flow::Continue)
            }
            Opcode::Rpt => {
                self.cu.rpt = true;
                self.cu.repeat_first = true;
                self.cu.delta = instr.tag();
                self.regs.x[0] = instr.addr & M18;
                Ok(Flow::Continue)
            }
            Opcode::Rpd => {
                self.cu.rpd = true;
                self.cu.repeat_first = true;
                self.cu.rpd_phase = 0;
                self.cu.delta = instr.tag();
                self.regs.x[0] = instr.addr & M18;
                Ok(Flow::Continue)
            }
        }
    }

    /// Dispatch an ordinary instruction to the operator units, with
    /// repeat handling.
    fn exec_operand_op(
        &mut self,
        mem: &mut MemoryUnit,
        exec: &mut dyn OperandExecutor,
        bypass: bool,
    ) -> Result<Flow, SimStop> {
        let instr = self.cu.instr;
        let repeating = self.cu.rpt || self.cu.rpd;
        let phase = if self.cu.rpd { self.cu.rpd_phase } else { 0 };

        let operand = if repeating && !self.cu.repeat_first {
            // Later iterations step the held address by delta.
            let ca = (self.cu.repeat_ca[phase] + u32::from(self.cu.delta)) & M18;
            self.cu.repeat_ca[phase] = ca;
            match self.operand_at(mem, ca, instr, bypass) {
                Ok(op) => op,
                Err(e) => return self.fault_from(e),
            }
        } else {
            match self.prep_operand(mem, bypass) {
                Ok(Prepped::Immediate(value)) => Operand::Immediate(value),
                Ok(Prepped::Addr(ca)) => {
                    if repeating {
                        self.cu.repeat_ca[phase] = ca;
                        if self.cu.rpd {
                            self.cu.rpd_saved[phase] = instr;
                        }
                    }
                    match self.operand_at(mem, ca, instr, bypass) {
                        Ok(op) => op,
                        Err(e) => return self.fault_from(e),
                    }
                }
                Err(e) => return self.fault_from(e),
            }
        };

        match exec.execute(&instr, operand, &mut self.regs) {
            Ok(Some(word)) => {
                // A store-back: the address was already resolved with
                // write access, so the modified bit is in place.
                if let Operand::Memory { abs, .. } = operand {
                    mem.store_word(abs, word)?;
                    self.note_store(abs);
                }
            }
            Ok(None) => {}
            Err(e) => return self.raise(e.fault_code(), FaultDetail::None),
        }

        if repeating {
            return Ok(self.advance_repeat());
        }
        Ok(Flow::Continue)
    }

    /// Translate a prepared 18-bit address and fetch the operand word
    /// with the access kind the opcode calls for.
    fn operand_at(
        &mut self,
        mem: &mut MemoryUnit,
        ca: u32,
        instr: Instruction,
        bypass: bool,
    ) -> Result<Operand, AppendError> {
        let kind = if is_store_class(instr.opcode) {
            AccessKind::Write
        } else {
            AccessKind::Read
        };
        let force = self.used_pointer_form();
        let abs = self.translate(mem, ca, kind, bypass, force)?;
        let word = mem.fetch_word(abs)?;
        Ok(Operand::Memory { abs, word })
    }

    /// Step the repeat state after one iteration; returns the flow
    /// for the engine.
    fn advance_repeat(&mut self) -> Flow {
        if self.cu.rpd && self.cu.rpd_phase == 0 {
            // First half of the repeated pair; run the second half
            // next.  On the first pass it still has to be fetched.
            self.cu.rpd_phase = 1;
            if self.cu.repeat_first {
                return Flow::Continue;
            }
            self.cu.instr = self.cu.rpd_saved[1];
            return Flow::Repeat;
        }
        self.cu.repeat_first = false;
        // Tally lives in the high 8 bits of X0.
        let tally = (self.regs.x[0] >> 10) & 0xff;
        let tally = tally.wrapping_sub(1) & 0xff;
        self.regs.x[0] = (self.regs.x[0] & !(0xff << 10)) | (tally << 10);
        if tally == 0 {
            self.regs.ir.tally_runout = true;
            self.cu.rpt = false;
            self.cu.rpd = false;
            event!(Level::TRACE, "repeat tally runout");
            return Flow::Continue;
        }
        if self.cu.rpd {
            self.cu.rpd_phase = 0;
            self.cu.instr = self.cu.rpd_saved[0];
        }
        Flow::Repeat
    }

    /// Address preparation: apply the tag's register modification and
    /// follow indirection, rebuilding the TPR from the PPR first.
    /// `du`/`dl` short-circuit to a literal operand.
    fn prep_operand(&mut self, mem: &mut MemoryUnit, bypass: bool) -> Result<Prepped, AppendError> {
        let instr = self.cu.instr;
        self.regs.tpr.trr = self.regs.ppr.prr;
        self.regs.tpr.tsr = self.regs.ppr.psr;
        self.regs.tpr.tbr = 0;
        self.regs.tpr.is_value = false;

        let mut addr = instr.addr & M18;
        let mut tag = instr.tag();
        let mut via_pointer = false;

        if let Mods::Single { pr: true, .. } = instr.mods {
            // The high three address bits select a pointer register;
            // the low fifteen are an offset from it.
            let n = (addr >> 15) as usize & 7;
            let pr = self.regs.pr[n];
            addr = (pr.wordno + (addr & 0o77777)) & M18;
            self.regs.tpr.tsr = pr.snr;
            self.regs.tpr.trr = pr.rnr.max(self.regs.ppr.prr);
            self.regs.tpr.tbr = pr.bitno;
            via_pointer = true;
        }

        let mut indirections = 0;
        loop {
            let t = TagModifier::decode(tag);
            match t.tm {
                Tm::R => match t.td {
                    Td::Du => {
                        self.regs.tpr.is_value = true;
                        self.regs.tpr.value = u64::from(addr) << 18;
                        return Ok(Prepped::Immediate(self.regs.tpr.value));
                    }
                    Td::Dl => {
                        self.regs.tpr.is_value = true;
                        self.regs.tpr.value = u64::from(addr);
                        return Ok(Prepped::Immediate(self.regs.tpr.value));
                    }
                    td => {
                        let ca = (addr + self.regs.tag_register_value(td)) & M18;
                        self.regs.tpr.ca = ca;
                        self.cu.via_pointer = via_pointer;
                        return Ok(Prepped::Addr(ca));
                    }
                },
                Tm::Ri => {
                    if matches!(t.td, Td::Du | Td::Dl) {
                        return Err(AppendError::Fault(
                            FaultCode::IllegalProcedure,
                            FaultDetail::None,
                        ));
                    }
                    indirections += 1;
                    if indirections > MAX_INDIRECTIONS {
                        return Err(AppendError::Fault(FaultCode::Lockup, FaultDetail::None));
                    }
                    let ca = (addr + self.regs.tag_register_value(t.td)) & M18;
                    self.regs.tpr.ca = ca;
                    let force = via_pointer;
                    let abs = self.translate(mem, ca, AccessKind::Read, bypass, force)?;
                    let word = mem.fetch_word(abs)?;
                    let word_tag = field36(word, 30, 6) as u8;
                    if word_tag == ITS_TAG || word_tag == ITP_TAG {
                        let (even, odd) = mem.fetch_pair(abs)?;
                        match decode_indirect_pair(even, odd) {
                            Some(IndirectPair::Its {
                                segno,
                                rnr,
                                wordno,
                                bitno,
                                tag: next_tag,
                            }) => {
                                self.regs.tpr.tsr = segno;
                                self.regs.tpr.trr = rnr.max(self.regs.tpr.trr);
                                self.regs.tpr.tbr = bitno;
                                addr = wordno & M18;
                                tag = next_tag;
                                via_pointer = true;
                            }
                            Some(IndirectPair::Itp {
                                prnum,
                                wordno,
                                bitno,
                                tag: next_tag,
                            }) => {
                                let pr = self.regs.pr[usize::from(prnum & 7)];
                                self.regs.tpr.tsr = pr.snr;
                                self.regs.tpr.trr = pr.rnr.max(self.regs.tpr.trr);
                                self.regs.tpr.tbr = bitno;
                                addr = (pr.wordno + wordno) & M18;
                                tag = next_tag;
                                via_pointer = true;
                            }
                            None => {
                                // Tag said pair but the even word
                                // disagreed; treat as ordinary
                                // indirection.
                                addr = upper_half(word) as u32;
                                tag = (word & 0o77) as u8;
                            }
                        }
                    } else {
                        addr = upper_half(word) as u32;
                        tag = (word & 0o77) as u8;
                    }
                    self.cu.ct_hold = tag;
                }
                Tm::It => {
                    // Only the plain-indirect variant of IT is in the
                    // supported set; the tally variants belong to the
                    // I/O-heavy software this core does not run.
                    if tag & 0o17 == 0o14 {
                        indirections += 1;
                        if indirections > MAX_INDIRECTIONS {
                            return Err(AppendError::Fault(FaultCode::Lockup, FaultDetail::None));
                        }
                        let ca = addr & M18;
                        let abs = self.translate(mem, ca, AccessKind::Read, bypass, via_pointer)?;
                        let word = mem.fetch_word(abs)?;
                        addr = upper_half(word) as u32;
                        tag = 0;
                    } else {
                        return Err(AppendError::Fault(
                            FaultCode::IllegalProcedure,
                            FaultDetail::None,
                        ));
                    }
                }
                Tm::Ir => {
                    return Err(AppendError::Fault(
                        FaultCode::IllegalProcedure,
                        FaultDetail::None,
                    ));
                }
            }
        }
    }

    /// Whether the last prepared address went through a pointer
    /// register or ITS/ITP pair, forcing appending-mode translation
    /// even in absolute mode.
    fn used_pointer_form(&self) -> bool {
        self.cu.via_pointer
    }

    fn resolve_operand_addr(
        &mut self,
        mem: &mut MemoryUnit,
        kind: AccessKind,
        bypass: bool,
    ) -> Result<u32, AppendError> {
        match self.prep_operand(mem, bypass)? {
            Prepped::Addr(ca) => {
                let force = self.used_pointer_form();
                self.translate(mem, ca, kind, bypass, force)
            }
            Prepped::Immediate(_) => Err(AppendError::Fault(
                FaultCode::IllegalProcedure,
                FaultDetail::None,
            )),
        }
    }

    fn fetch_operand_word(
        &mut self,
        mem: &mut MemoryUnit,
        bypass: bool,
    ) -> Result<u64, AppendError> {
        let abs = self.resolve_operand_addr(mem, AccessKind::Read, bypass)?;
        Ok(mem.fetch_word(abs)?)
    }

    fn fetch_operand_pair(
        &mut self,
        mem: &mut MemoryUnit,
        bypass: bool,
    ) -> Result<(u64, u64), AppendError> {
        let abs = self.resolve_operand_addr(mem, AccessKind::Read, bypass)?;
        Ok(mem.fetch_pair(abs)?)
    }

    /// Translate an 18-bit computed address through the current
    /// addressing mode.  `force_append` is set when a pointer
    /// register or ITS/ITP pair supplied a segment, which appends
    /// even in absolute mode.
    fn translate(
        &mut self,
        mem: &mut MemoryUnit,
        ca: u32,
        kind: AccessKind,
        bypass: bool,
        force_append: bool,
    ) -> Result<u32, AppendError> {
        if self.regs.ir.abs_mode && !force_append {
            return Ok(ca & M18);
        }
        if !self.regs.ir.abs_mode && !self.regs.ir.not_bar_mode && !force_append {
            return bar_relocate(&self.regs.bar, ca & M18);
        }
        let access = SegAccess {
            ring: self.regs.tpr.trr,
            segno: self.regs.tpr.tsr,
            offset: ca & M18,
            kind,
        };
        self.append
            .resolve(mem, &self.regs.dsbr, self.regs.ralr, access, bypass)
    }

    /// Register a fault and report it to the cycle loop.
    fn raise(&mut self, code: FaultCode, detail: FaultDetail) -> Result<Flow, SimStop> {
        self.events.raise_fault(code, detail);
        Ok(Flow::Fault)
    }

    fn fault_from(&mut self, e: AppendError) -> Result<Flow, SimStop> {
        match e {
            AppendError::Fault(code, detail) => self.raise(code, detail),
            AppendError::Mem(failure) => Err(SimStop::Memory(failure)),
        }
    }

    /// Note a store to an absolute address so the held odd word is
    /// refetched if it was overwritten.
    pub fn note_store(&mut self, abs: u32) {
        if let Some(base) = self.cu.pair_abs {
            if abs == base | 1 {
                self.cu.irodd_invalid = true;
            }
        }
    }

    /// Pack the control-unit data into the 8-word save-area layout.
    ///
    /// | word | contents |
    /// |------|----------|
    /// | 0 | PPR: ring 0-2, segment 3-17, privilege 18 |
    /// | 1 | fault register |
    /// | 2 | TPR: ring 0-2, segment 3-17; CPU number 33-35 |
    /// | 3 | TPR bit offset 30-35 |
    /// | 4 | IC 0-17, indicators 18-32 |
    /// | 5 | CA 0-17, repeat/execute flags 18-25, held tag 30-35 |
    /// | 6 | working instruction word |
    /// | 7 | held odd instruction word |
    pub fn save_control_unit(&self) -> [u64; 8] {
        let mut w0 = 0;
        w0 = set_field36(w0, 0, 3, u64::from(self.regs.ppr.prr));
        w0 = set_field36(w0, 3, 15, u64::from(self.regs.ppr.psr));
        w0 = with_bit36(w0, 18, self.regs.ppr.p);
        let w1 = self.regs.fault_reg & MASK36;
        let mut w2 = 0;
        w2 = set_field36(w2, 0, 3, u64::from(self.regs.tpr.trr));
        w2 = set_field36(w2, 3, 15, u64::from(self.regs.tpr.tsr));
        w2 = set_field36(w2, 33, 3, u64::from(self.switches.cpu_num));
        let w3 = set_field36(0, 30, 6, u64::from(self.regs.tpr.tbr));
        let w4 = set_field36(self.regs.ir.save(), 0, 18, u64::from(self.regs.ppr.ic));
        let mut w5 = set_field36(0, 0, 18, u64::from(self.regs.tpr.ca));
        w5 = with_bit36(w5, 18, self.cu.repeat_first);
        w5 = with_bit36(w5, 19, self.cu.rpt);
        w5 = with_bit36(w5, 20, self.cu.rpd);
        w5 = with_bit36(w5, 24, self.cu.xde);
        w5 = with_bit36(w5, 25, self.cu.xdo);
        w5 = set_field36(w5, 30, 6, u64::from(self.cu.ct_hold));
        let w6 = self.cu.instr.encode();
        let w7 = self.cu.irodd;
        [w0, w1, w2, w3, w4, w5, w6, w7]
    }

    /// The inverse of [`CpuContext::save_control_unit`].
    pub fn restore_control_unit(&mut self, words: &[u64; 8]) {
        self.regs.ppr.prr = field36(words[0], 0, 3) as u8;
        self.regs.ppr.psr = field36(words[0], 3, 15) as u16;
        self.regs.ppr.p = bit36(words[0], 18);
        self.regs.fault_reg = words[1] & MASK36;
        self.regs.tpr.trr = field36(words[2], 0, 3) as u8;
        self.regs.tpr.tsr = field36(words[2], 3, 15) as u16;
        self.regs.tpr.tbr = field36(words[3], 30, 6) as u8;
        self.regs.ppr.ic = field36(words[4], 0, 18) as u32;
        self.regs.ir = crate::registers::IndicatorRegister::load(words[4]);
        self.regs.tpr.ca = field36(words[5], 0, 18) as u32;
        self.cu.repeat_first = bit36(words[5], 18);
        self.cu.rpt = bit36(words[5], 19);
        self.cu.rpd = bit36(words[5], 20);
        self.cu.xde = bit36(words[5], 24);
        self.cu.xdo = bit36(words[5], 25);
        self.cu.ct_hold = field36(words[5], 30, 6) as u8;
        self.cu.instr_word = words[6] & MASK36;
        self.cu.instr = Instruction::decode(words[6]);
        self.cu.irodd = words[7] & MASK36;
        self.cu.pair_for_ic = None;
        self.cu.pair_abs = None;
        self.cu.irodd_invalid = false;
    }
}

/// Opcodes whose operand reference is a store; decides which
/// permission bit the appending unit checks.
fn is_store_class(raw: u16) -> bool {
    if raw & 1 != 0 {
        return false;
    }
    matches!(
        raw >> 1,
        0o054 // aos
        | 0o055 | 0o056 // asa asq
        | 0o135 | 0o136 // ssa ssq
        | 0o440..=0o447 // sxl
        | 0o450 // stz
        | 0o454 // stt
        | 0o550 // sbar
        | 0o551 | 0o552 // stba stbq
        | 0o554 // stc1
        | 0o740..=0o747 // stx
        | 0o750 // stc2
        | 0o754 // sdbr
        | 0o755 | 0o756 | 0o757 // sta stq staq
    )
}
