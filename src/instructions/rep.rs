use crate::cpu::{Cpu, ECX};
use crate::error::Result;
use crate::flags::Size;
use crate::segment::SegReg;

use super::string::StringOp;
use super::Width;

/// Polarity of an F2/F3 prefix. Only CMPS and SCAS look at it; the other
/// string operations repeat on the count alone under either prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepKind {
    /// F3: REP / REPE, repeat while ZF = 1
    Repe,
    /// F2: REPNE, repeat while ZF = 0
    Repne,
}

impl RepKind {
    fn continues(self, zf: bool) -> bool {
        match self {
            RepKind::Repe => zf,
            RepKind::Repne => !zf,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepState {
    /// Decoded, count not yet examined.
    Entered,
    Iterating,
    /// Count ran out or the zero-flag condition ended the loop.
    Exhausted,
    /// Left at an iteration boundary for an interrupt; re-executes from the
    /// prefix once the handler returns.
    Interrupted,
    /// An element access faulted. Completed iterations stay committed.
    Faulted,
}

/// A REP-prefixed string instruction in flight. Survives across calls to
/// `step()` when the cycle budget runs out before the count does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepLoop {
    pub op: StringOp,
    pub size: Size,
    pub a32: bool,
    /// Source segment, override applied.
    pub seg: SegReg,
    pub kind: RepKind,
    /// First byte of the instruction, prefixes included.
    pub start_eip: u32,
    /// Byte after the instruction.
    pub next_eip: u32,
    pub state: RepState,
    pub iterations: u64,
}

impl Cpu {
    fn rep_count(&self, a32: bool) -> u32 {
        if a32 { self.regs[ECX] } else { self.regs[ECX] & 0xFFFF }
    }

    fn set_rep_count(&mut self, a32: bool, count: u32) {
        if a32 {
            self.regs[ECX] = count;
        } else {
            self.set_reg16(ECX, count as u16);
        }
    }

    /// Cycles one pass may spend before yielding to the scheduler.
    fn rep_budget(&self) -> i32 {
        self.config.rep_batch()
    }

    /// Runs (or resumes) a REP loop until the count or the zero-flag
    /// condition ends it, the cycle budget is spent, or an element faults.
    ///
    /// An unfinished loop rewinds EIP to the prefix and parks itself in
    /// `self.rep`, so an interrupt taken before the next step returns to the
    /// same instruction. Under the trap flag exactly one element runs.
    pub fn run_rep(&mut self, mut rep: RepLoop) -> Result<()> {
        self.a32 = rep.a32;
        self.rep = None;
        let is486 = self.model.is_486_class();

        if rep.state == RepState::Entered && self.rep_count(rep.a32) == 0 {
            rep.state = RepState::Exhausted;
            self.eip = rep.next_eip;
            self.clock(1);
            return Ok(());
        }

        let cycles_end = if self.trap { self.cycles + 1 } else { self.cycles - self.rep_budget() };
        // CMPS and port strings take one element per dispatch
        let single_pass = matches!(rep.op, StringOp::Cmps | StringOp::Ins | StringOp::Outs);
        rep.state = RepState::Iterating;

        loop {
            let count = self.rep_count(rep.a32);
            if count == 0 {
                rep.state = RepState::Exhausted;
                break;
            }
            if let Err(fault) = self.string_element(rep.op, rep.size, rep.seg) {
                rep.state = RepState::Faulted;
                log::trace!("[REP] {} faulted after {} iterations", rep.op.name(), rep.iterations);
                return Err(fault);
            }
            self.set_rep_count(rep.a32, count - 1);
            self.clock(rep.op.iteration_cost(is486));
            rep.iterations += 1;
            if rep.op.is_conditional() && !rep.kind.continues(self.zf()) {
                rep.state = RepState::Exhausted;
                break;
            }
            if single_pass || self.cycles < cycles_end {
                break;
            }
        }

        if rep.state == RepState::Iterating && self.rep_count(rep.a32) != 0 {
            self.eip = rep.start_eip;
            self.rep = Some(rep);
        } else {
            rep.state = RepState::Exhausted;
            self.eip = rep.next_eip;
        }
        Ok(())
    }
}

/// F2/F3 A4-A7, AA-AF, 6C-6F: the repeating form of a string instruction.
pub fn rep_string<W: Width, const OP: u8>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let rep = RepLoop {
        op: StringOp::from_code(OP),
        size: W::SIZE,
        a32: cpu.a32,
        seg: cpu.data_seg(),
        kind: cpu.rep_prefix.unwrap_or(RepKind::Repe),
        start_eip: cpu.oldpc,
        next_eip: cpu.eip,
        state: RepState::Entered,
        iterations: 0,
    };
    cpu.run_rep(rep)
}

#[cfg(test)]
mod tests {
    use crate::config::{CpuConfig, CpuModel};
    use crate::cpu::{Cpu, EAX, ECX, EDI, ESI};
    use crate::config::ExecMode;
    use crate::instructions::string::{CMPS, MOVS, SCAS, STOS};
    use crate::instructions::Byte;

    use super::*;

    fn cpu(model: CpuModel) -> Cpu {
        let mut cpu = Cpu::new(CpuConfig::new(model));
        cpu.load_cs_real(0);
        // F3 xx sits at 0x100
        cpu.oldpc = 0x100;
        cpu.eip = 0x102;
        cpu.cycles = 10_000;
        cpu
    }

    #[test]
    fn zero_count_is_a_one_cycle_no_op() {
        // F3 AA: REP STOSB with CX = 0
        let mut cpu = cpu(CpuModel::I486Dx);
        cpu.regs[EDI] = 0x1000;
        rep_string::<Byte, STOS>(&mut cpu, 0).unwrap();
        assert_eq!(cpu.cycles, 10_000 - 1);
        assert_eq!(cpu.regs[EDI], 0x1000);
        assert_eq!(cpu.eip, 0x102);
        assert!(cpu.rep.is_none());
    }

    #[test]
    fn budget_exhaustion_rewinds_to_the_prefix() {
        // F3 A4: REP MOVSB, 300 bytes at 3 cycles each overruns a 100 cycle batch
        let mut cpu = cpu(CpuModel::I486Dx);
        for i in 0..300 {
            cpu.bus.write_8(0x2000 + i, i as u8);
        }
        cpu.regs[ESI] = 0x2000;
        cpu.regs[EDI] = 0x4000;
        cpu.regs[ECX] = 300;
        rep_string::<Byte, MOVS>(&mut cpu, 0).unwrap();
        assert_eq!(cpu.eip, 0x100);
        let parked = cpu.rep.expect("loop parked");
        assert_eq!(parked.state, RepState::Iterating);
        assert!(cpu.regs[ECX] > 0 && cpu.regs[ECX] < 300);

        while let Some(rep) = cpu.rep.take() {
            cpu.run_rep(rep).unwrap();
        }
        assert_eq!(cpu.regs[ECX], 0);
        assert_eq!(cpu.eip, 0x102);
        assert_eq!(cpu.regs[EDI], 0x4000 + 300);
        for i in 0..300 {
            assert_eq!(cpu.bus.read_8(0x4000 + i), i as u8);
        }
    }

    #[test]
    fn scas_batch_follows_the_exec_mode() {
        // F2 AE: REPNE SCASB over 1000 bytes that never match AL
        for (mode, batch) in [(ExecMode::Interpreter, 100), (ExecMode::Recompiler, 1000)] {
            let mut cpu = cpu(CpuModel::I486Dx);
            cpu.config.exec_mode = mode;
            assert_eq!(cpu.config.rep_batch(), batch);
            cpu.regs[EAX] = 0xFF;
            cpu.regs[EDI] = 0x1000;
            cpu.regs[ECX] = 1000;
            cpu.rep_prefix = Some(RepKind::Repne);
            rep_string::<Byte, SCAS>(&mut cpu, 0).unwrap();

            let spent = 10_000 - cpu.cycles;
            let element = StringOp::Scas.iteration_cost(true);
            assert!(spent >= batch && spent <= batch + element, "{mode:?}: spent {spent}");
            let parked = cpu.rep.expect("loop parked");
            assert_eq!(parked.iterations, (1000 - cpu.regs[ECX]) as u64);
            assert_eq!(cpu.eip, 0x100);
        }
    }

    #[test]
    fn trap_flag_forces_single_iteration() {
        // F3 AA: REP STOSB under single-step
        let mut cpu = cpu(CpuModel::Pentium);
        cpu.trap = true;
        cpu.regs[ECX] = 4;
        cpu.regs[EDI] = 0x1000;
        rep_string::<Byte, STOS>(&mut cpu, 0).unwrap();
        assert_eq!(cpu.regs[ECX], 3);
        assert_eq!(cpu.regs[EDI], 0x1001);
        assert_eq!(cpu.eip, 0x100);
    }

    #[test]
    fn repne_cmpsb_stops_on_match() {
        // F2 A6: REPNE CMPSB
        let mut cpu = cpu(CpuModel::I486Dx);
        cpu.bus.load(0x2000, b"abcX");
        cpu.bus.load(0x3000, b"wxyX");
        cpu.regs[ESI] = 0x2000;
        cpu.regs[EDI] = 0x3000;
        cpu.regs[ECX] = 10;
        cpu.rep_prefix = Some(RepKind::Repne);
        rep_string::<Byte, CMPS>(&mut cpu, 0).unwrap();
        while let Some(rep) = cpu.rep.take() {
            cpu.run_rep(rep).unwrap();
        }
        assert!(cpu.zf());
        assert_eq!(cpu.regs[ECX], 6);
        assert_eq!(cpu.regs[ESI], 0x2004);
        assert_eq!(cpu.regs[EAX], 0);
    }
}
