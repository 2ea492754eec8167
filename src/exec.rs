use iced_x86::{Decoder, DecoderOptions, Formatter, NasmFormatter};

use crate::cpu::{Cpu, CpuState};
use crate::error::Fault;
use crate::flags::CpuFlags;
use crate::interrupt::Source;
use crate::instructions::rep::RepState;
use crate::segment::SegReg;

/// DR6.BS: the #DB was raised by single-stepping.
const DR6_BS: u32 = 1 << 14;
const NMI_VECTOR: u8 = 2;

/// What one call to [`Cpu::step`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// An instruction (or one batch of a REP loop) completed. Software
    /// interrupts count as retired once their handler is entered.
    Retired,
    /// The instruction raised an exception and its handler was entered.
    Faulted(Fault),
    /// An external interrupt or NMI was taken at the boundary.
    Interrupted(u8),
    Halted,
    Shutdown,
}

impl Cpu {
    /// Executes one instruction boundary: services a pending interrupt, or
    /// runs the next instruction and delivers whatever it raised.
    pub fn step(&mut self) -> StepOutcome {
        if self.state == CpuState::Shutdown {
            return StepOutcome::Shutdown;
        }

        self.oldpc = self.eip;
        // MOV SS, POP SS and STI hold interrupts off for one instruction
        let inhibited = std::mem::take(&mut self.inhibit_irq);
        if !inhibited {
            if let Some(outcome) = self.service_interrupts() {
                return outcome;
            }
        }
        if self.state == CpuState::Halted {
            self.clock(self.cycles.max(1));
            return StepOutcome::Halted;
        }

        self.trap = self.flags.contains(CpuFlags::TF);
        self.op32 = self.use32();
        self.a32 = self.op32;
        self.seg_override = None;
        self.rep_prefix = None;
        self.cpl_override = false;
        if log::log_enabled!(log::Level::Trace) {
            self.trace_instruction();
        }

        let start = self.cycles;
        let result = match self.rep.take() {
            Some(rep) => {
                self.rep_prefix = Some(rep.kind);
                self.run_rep(rep)
            }
            None => self.dispatch_next(),
        };
        let outcome = match result {
            Ok(()) => {
                self.ins_count += 1;
                if self.trap {
                    self.dr[6] |= DR6_BS;
                    self.deliver_fault(Fault::Debug)
                } else if self.state == CpuState::Halted {
                    StepOutcome::Halted
                } else {
                    StepOutcome::Retired
                }
            }
            Err(fault) => self.handle_fault(fault),
        };
        self.msr.tsc = self.msr.tsc.wrapping_add(start.saturating_sub(self.cycles).max(0) as u64);
        outcome
    }

    /// Runs instructions until `cycles` are spent, the core halts with
    /// nothing to wake it, or it shuts down.
    pub fn run(&mut self, cycles: i32) {
        self.cycles += cycles;
        while self.cycles > 0 {
            match self.step() {
                StepOutcome::Shutdown => break,
                StepOutcome::Halted if !self.interrupt_pending() => {
                    self.cycles = self.cycles.min(0);
                    break;
                }
                _ => {}
            }
        }
    }

    fn service_interrupts(&mut self) -> Option<StepOutcome> {
        let vector = if self.nmi_pending {
            self.nmi_pending = false;
            NMI_VECTOR
        } else if self.flags.contains(CpuFlags::IF) {
            self.pending_irq.take()?
        } else {
            return None;
        };
        if let Some(rep) = self.rep.as_mut() {
            rep.state = RepState::Interrupted;
            log::trace!("[REP] {} interrupted after {} iterations", rep.op.name(), rep.iterations);
        }
        self.state = CpuState::Running;
        match self.deliver_interrupt(vector, Source::External, None) {
            Ok(()) => Some(StepOutcome::Interrupted(vector)),
            Err(fault) => Some(self.escalate(Fault::Interrupt(vector), fault)),
        }
    }

    /// Unwinds a faulting instruction and enters the exception handler.
    /// Faults restart the instruction; traps resume after it.
    fn handle_fault(&mut self, fault: Fault) -> StepOutcome {
        if !fault.is_trap() {
            self.eip = self.oldpc;
        }
        self.rep = None;
        if fault == Fault::InvalidOpcode {
            log::warn!(
                "[CPU] illegal opcode at {:04X}:{:08X}: {}",
                self.seg(SegReg::Cs).selector,
                self.oldpc,
                self.disassemble(self.oldpc)
            );
        }
        self.deliver_fault(fault)
    }

    fn deliver_fault(&mut self, fault: Fault) -> StepOutcome {
        if let Fault::PageFault { addr, .. } = fault {
            self.cr2 = addr;
        }
        let source = if fault.is_software() { Source::Software } else { Source::Exception };
        self.in_delivery = Some(fault);
        let delivered = self.deliver_interrupt(fault.vector(), source, fault.error_code());
        self.in_delivery = None;
        match delivered {
            Ok(()) if fault.is_software() => StepOutcome::Retired,
            Ok(()) => StepOutcome::Faulted(fault),
            Err(second) => self.escalate(fault, second),
        }
    }

    /// A second fault raised while entering the handler for `first`.
    fn escalate(&mut self, first: Fault, second: Fault) -> StepOutcome {
        if first == Fault::DoubleFault {
            log::error!(
                "[CPU] triple fault at {:04X}:{:08X} ({second})",
                self.seg(SegReg::Cs).selector,
                self.oldpc
            );
            self.state = CpuState::Shutdown;
            self.rep = None;
            return StepOutcome::Shutdown;
        }
        log::debug!("[CPU] {second} while delivering {first}");
        let next = if first.escalates_with(&second) { Fault::DoubleFault } else { second };
        self.deliver_fault(next)
    }

    /// NASM rendering of the instruction at CS:`eip`, read without faulting.
    pub fn disassemble(&self, eip: u32) -> String {
        let cs = self.seg(SegReg::Cs);
        let mut bytes = [0u8; 15];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let linear = cs.base.wrapping_add(eip.wrapping_add(i as u32));
            *byte = self.probe(linear).map_or(0, |phys| self.bus.read_8(phys as usize));
        }
        let bitness = if self.use32() { 32 } else { 16 };
        let mut decoder = Decoder::with_ip(bitness, &bytes, eip as u64, DecoderOptions::NONE);
        let instr = decoder.decode();
        let len = instr.len().min(bytes.len());
        let hex: String = bytes[..len].iter().map(|b| format!("{b:02X}")).collect();
        let mut text = String::new();
        NasmFormatter::new().format(&instr, &mut text);
        format!("{hex:<16} {text}")
    }

    fn trace_instruction(&self) {
        log::trace!(
            "{:04X}:{:08X}  {}  EAX={:08X} ECX={:08X} EDX={:08X} EBX={:08X} ESP={:08X}",
            self.seg(SegReg::Cs).selector,
            self.eip,
            self.disassemble(self.eip),
            self.regs[crate::cpu::EAX],
            self.regs[crate::cpu::ECX],
            self.regs[crate::cpu::EDX],
            self.regs[crate::cpu::EBX],
            self.regs[crate::cpu::ESP],
        );
    }
}
