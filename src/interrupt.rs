use crate::cpu::{Cpu, ESP};
use crate::error::{Fault, Result};
use crate::flags::{CpuFlags, Size};
use crate::segment::{
    Descriptor, SegReg, SegmentCache, SYS_INT_GATE286, SYS_INT_GATE386, SYS_TASK_GATE, SYS_TRAP_GATE286,
    SYS_TRAP_GATE386,
};
use crate::task::TaskSwitch;

/// Where an interrupt came from. Decides the gate DPL check and the EXT
/// bit of error codes raised while delivering it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// INT n, INT3, INTO
    Software,
    Exception,
    /// INTR or NMI pin
    External,
}

impl Cpu {
    /// Transfers control to the handler for `vector`, pushing `error_code`
    /// in protected mode. On failure nothing beyond the fault is committed.
    pub fn deliver_interrupt(&mut self, vector: u8, source: Source, error_code: Option<u16>) -> Result<()> {
        self.rep = None;
        self.state = crate::cpu::CpuState::Running;
        if self.protected_mode() {
            self.pmode_interrupt(vector, source, error_code)
        } else {
            self.real_mode_interrupt(vector)
        }
    }

    fn real_mode_interrupt(&mut self, vector: u8) -> Result<()> {
        let entry = vector as u32 * 4;
        if entry + 3 > self.idt.limit as u32 {
            return Err(Fault::GeneralProtection(0));
        }
        let offset = self.read_sys_16(self.idt.base.wrapping_add(entry))?;
        let selector = self.read_sys_16(self.idt.base.wrapping_add(entry + 2))?;
        let flags = self.get_cpu_flags().bits();
        let snapshot = self.stack_snapshot();
        let return_cs = self.seg(SegReg::Cs).selector as u32;
        let return_ip = self.eip;
        let pushed = (|| -> Result<()> {
            self.push(Size::Word, flags)?;
            self.push(Size::Word, return_cs)?;
            self.push(Size::Word, return_ip)
        })();
        if let Err(fault) = pushed {
            self.restore_stack(snapshot);
            return Err(fault);
        }
        self.set_cpu_flag(CpuFlags::IF, false);
        self.set_cpu_flag(CpuFlags::TF, false);
        self.set_cpu_flag(CpuFlags::AC, false);
        self.load_cs_real(selector);
        self.eip = offset as u32;
        self.clock(self.timings.int_rm);
        Ok(())
    }

    fn pmode_interrupt(&mut self, vector: u8, source: Source, error_code: Option<u16>) -> Result<()> {
        let ext = (source == Source::External) as u16;
        let idt_err = (vector as u16) * 8 + 2 + ext;
        let entry = vector as u32 * 8;
        if entry + 7 > self.idt.limit as u32 {
            return Err(Fault::GeneralProtection(idt_err));
        }
        let gate = Descriptor(self.read_sys_64(self.idt.base.wrapping_add(entry))?);
        let kind = gate.system_type();
        let valid = matches!(
            kind,
            SYS_TASK_GATE | SYS_INT_GATE286 | SYS_TRAP_GATE286 | SYS_INT_GATE386 | SYS_TRAP_GATE386
        );
        if gate.is_segment() || !valid {
            return Err(Fault::GeneralProtection(idt_err));
        }
        if source == Source::Software && gate.dpl() < self.cpl() {
            return Err(Fault::GeneralProtection(vector as u16 * 8 + 2));
        }
        if !gate.present() {
            return Err(Fault::SegmentNotPresent(idt_err));
        }
        if kind == SYS_TASK_GATE {
            return self.task_switch(gate.gate_selector(), TaskSwitch::Interrupt, error_code);
        }

        let selector = gate.gate_selector();
        if selector & !3 == 0 {
            return Err(Fault::GeneralProtection(ext));
        }
        let (code, addr) = self.read_descriptor(selector, Fault::GeneralProtection)?;
        if !code.is_code() || code.dpl() > self.cpl() {
            return Err(Fault::GeneralProtection((selector & 0xFFFC) + ext));
        }
        if !code.present() {
            return Err(Fault::SegmentNotPresent((selector & 0xFFFC) + ext));
        }
        let gate32 = gate.is_32bit_system();
        let size = if gate32 { Size::Dword } else { Size::Word };
        let offset = if gate32 { gate.gate_offset() } else { gate.gate_offset() & 0xFFFF };

        let flags = self.get_cpu_flags();
        let return_cs = self.seg(SegReg::Cs).selector as u32;
        let return_eip = self.eip;
        let snapshot = self.stack_snapshot();
        let cpl = self.cpl();
        let v86 = self.v86_mode();
        let inner = v86 || (!code.is_conforming() && code.dpl() < cpl);
        if v86 && code.dpl() != 0 {
            return Err(Fault::GeneralProtection(selector & 0xFFFC));
        }
        let new_cpl = if inner { code.dpl() } else { cpl };

        if inner {
            let (new_ss, new_esp) = self.tss_stack(new_cpl)?;
            let ss_desc = self
                .fetch_stack_descriptor(new_ss, new_cpl, Fault::InvalidTss)
                .map_err(|fault| match fault {
                    Fault::InvalidTss(code) => Fault::InvalidTss(code + ext),
                    other => other,
                })?;
            let data_segs = [SegReg::Gs, SegReg::Fs, SegReg::Ds, SegReg::Es].map(|s| self.seg(s).selector as u32);
            self.switch_stack(new_ss, &ss_desc, new_esp);
            let pushed = (|| -> Result<()> {
                if v86 {
                    for selector in data_segs {
                        self.push(size, selector)?;
                    }
                }
                self.push(size, snapshot.ss.selector as u32)?;
                self.push(size, snapshot.esp)?;
                self.push(size, flags.bits())?;
                self.push(size, return_cs)?;
                self.push(size, return_eip)?;
                if let Some(code) = error_code {
                    self.push(size, code as u32)?;
                }
                Ok(())
            })();
            if let Err(fault) = pushed {
                self.restore_stack(snapshot);
                return Err(fault);
            }
            if v86 {
                for seg in [SegReg::Es, SegReg::Ds, SegReg::Fs, SegReg::Gs] {
                    *self.seg_mut(seg) = SegmentCache::null(0);
                }
            }
        } else {
            let pushed = (|| -> Result<()> {
                self.push(size, flags.bits())?;
                self.push(size, return_cs)?;
                self.push(size, return_eip)?;
                if let Some(code) = error_code {
                    self.push(size, code as u32)?;
                }
                Ok(())
            })();
            if let Err(fault) = pushed {
                self.restore_stack(snapshot);
                return Err(fault);
            }
        }

        self.mark_accessed(addr, &code)?;
        let mut new_flags = flags - (CpuFlags::TF | CpuFlags::NT | CpuFlags::VM | CpuFlags::RF);
        if matches!(kind, SYS_INT_GATE286 | SYS_INT_GATE386) {
            new_flags.remove(CpuFlags::IF);
        }
        self.set_cpu_flags(new_flags);
        self.commit_cs(selector, &code, new_cpl);
        self.eip = offset;
        if v86 {
            log::debug!("[INT] vector {vector:02X} leaves V86 mode");
        }
        let t = self.timings;
        self.clock(if v86 {
            t.int_v86
        } else if inner {
            t.int_pm_outer
        } else {
            t.int_pm
        });
        Ok(())
    }

    // ====================================================================
    // IRET
    // ====================================================================

    pub fn interrupt_return(&mut self, op32: bool) -> Result<()> {
        let size = if op32 { Size::Dword } else { Size::Word };
        let bytes = size.bytes();

        if !self.protected_mode() {
            let eip = self.peek_stack(size, 0)?;
            let cs = self.peek_stack(size, bytes)? as u16;
            let flags = self.peek_stack(size, 2 * bytes)?;
            self.adjust_sp(3 * bytes);
            self.load_cs_real(cs);
            self.eip = if op32 { eip } else { eip & 0xFFFF };
            self.load_flags(flags, size);
            self.clock(self.timings.iret_rm);
            return Ok(());
        }

        if self.v86_mode() {
            if self.iopl() != 3 {
                return Err(Fault::GeneralProtection(0));
            }
            let eip = self.peek_stack(size, 0)?;
            let cs = self.peek_stack(size, bytes)? as u16;
            let flags = self.peek_stack(size, 2 * bytes)?;
            self.adjust_sp(3 * bytes);
            self.load_cs_real(cs);
            self.eip = eip & 0xFFFF;
            self.load_flags(flags, size);
            self.clock(self.timings.iret_v86);
            return Ok(());
        }

        if self.get_cpu_flag(CpuFlags::NT) {
            let back_link = self.read_sys_16(self.tr.base)?;
            return self.task_switch(back_link, TaskSwitch::Iret, None);
        }

        let eip = self.peek_stack(size, 0)?;
        let selector = self.peek_stack(size, bytes)? as u16;
        let flags = self.peek_stack(size, 2 * bytes)?;

        if op32 && flags & CpuFlags::VM.bits() != 0 && self.cpl() == 0 {
            return self.return_to_v86(eip, selector, flags);
        }

        let cpl = self.cpl();
        let rpl = (selector & 3) as u8;
        if selector & !3 == 0 {
            return Err(Fault::GeneralProtection(0));
        }
        if rpl < cpl {
            return Err(Fault::GeneralProtection(selector & 0xFFFC));
        }
        let (desc, addr) = self.read_descriptor(selector, Fault::GeneralProtection)?;
        self.check_return_descriptor(selector, &desc)?;
        let eip = if op32 { eip } else { eip & 0xFFFF };
        let cache = SegmentCache::from_descriptor(selector, &desc, self.model.is_386_class());
        if !cache.contains(eip, 1) {
            return Err(Fault::GeneralProtection(0));
        }

        if rpl == cpl {
            self.mark_accessed(addr, &desc)?;
            self.adjust_sp(3 * bytes);
            self.load_flags(flags, size);
            self.commit_cs(selector, &desc, cpl);
            self.eip = eip;
            self.clock(self.timings.iret_pm);
            return Ok(());
        }

        let new_esp = self.peek_stack(size, 3 * bytes)?;
        let new_ss = self.peek_stack(size, 4 * bytes)? as u16;
        let ss_desc = self.fetch_stack_descriptor(new_ss, rpl, Fault::GeneralProtection)?;
        self.mark_accessed(addr, &desc)?;
        // Flags are filtered with the privilege of the interrupted handler
        self.load_flags(flags, size);
        self.commit_cs(selector, &desc, rpl);
        self.switch_stack(new_ss, &ss_desc, new_esp);
        self.eip = eip;
        self.invalidate_inaccessible_segs();
        self.clock(self.timings.iret_pm_outer);
        Ok(())
    }

    fn return_to_v86(&mut self, eip: u32, cs: u16, flags: u32) -> Result<()> {
        let mut frame = [0u32; 6];
        for (i, slot) in frame.iter_mut().enumerate() {
            *slot = self.peek_stack(Size::Dword, 12 + i as u32 * 4)?;
        }
        let [esp, ss, es, ds, fs, gs] = frame;
        self.set_cpu_flags(CpuFlags::from_bits_truncate(flags) | CpuFlags::VM);
        for (seg, selector) in [
            (SegReg::Cs, cs),
            (SegReg::Ss, ss as u16),
            (SegReg::Es, es as u16),
            (SegReg::Ds, ds as u16),
            (SegReg::Fs, fs as u16),
            (SegReg::Gs, gs as u16),
        ] {
            *self.seg_mut(seg) = SegmentCache::v86(selector);
        }
        self.update_status();
        self.regs[ESP] = esp;
        self.eip = eip & 0xFFFF;
        log::debug!("[INT] IRET enters V86 mode at {cs:04X}:{:04X}", self.eip);
        self.clock(self.timings.iret_v86);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{CpuConfig, CpuModel};
    use crate::cpu::{Cpu, CR0_PE, ESP};
    use crate::error::Fault;
    use crate::flags::CpuFlags;
    use crate::segment::{Descriptor, SegReg};

    use super::Source;

    #[test]
    fn real_mode_vector_pushes_flags_cs_ip() {
        let mut cpu = Cpu::new(CpuConfig::new(CpuModel::I386Dx));
        cpu.load_cs_real(0x1000);
        cpu.eip = 0x0123;
        cpu.regs[ESP] = 0x400;
        cpu.set_cpu_flag(CpuFlags::IF, true);
        cpu.bus.write_16(0x21 * 4, 0x5678);
        cpu.bus.write_16(0x21 * 4 + 2, 0x2000);
        cpu.deliver_interrupt(0x21, Source::Software, None).unwrap();
        assert_eq!(cpu.seg(SegReg::Cs).selector, 0x2000);
        assert_eq!(cpu.eip, 0x5678);
        assert_eq!(cpu.regs[ESP], 0x3FA);
        assert_eq!(cpu.bus.read_16(0x3FA), 0x0123);
        assert_eq!(cpu.bus.read_16(0x3FC), 0x1000);
        assert!(!cpu.get_cpu_flag(CpuFlags::IF));

        cpu.interrupt_return(false).unwrap();
        assert_eq!(cpu.eip, 0x0123);
        assert_eq!(cpu.seg(SegReg::Cs).selector, 0x1000);
        assert!(cpu.get_cpu_flag(CpuFlags::IF));
    }

    #[test]
    fn software_int_through_privileged_gate_faults() {
        let mut cpu = Cpu::new(CpuConfig::new(CpuModel::I486Dx));
        cpu.bus.write_64(0x1008, 0x00CF_9A00_0000_FFFF);
        cpu.bus.write_64(0x1018, 0x00CF_FA00_0000_FFFF);
        cpu.gdt.base = 0x1000;
        cpu.gdt.limit = 0x1F;
        // DPL 0 interrupt gate for vector 0x80
        cpu.bus.write_64(0x2000 + 0x80 * 8, 0x0000_8E00_0008_0000);
        cpu.idt.base = 0x2000;
        cpu.idt.limit = 0x7FF;
        cpu.cr0 |= CR0_PE;
        cpu.commit_cs(0x1B, &Descriptor(0x00CF_FA00_0000_FFFF), 3);
        assert_eq!(
            cpu.deliver_interrupt(0x80, Source::Software, None),
            Err(Fault::GeneralProtection(0x80 * 8 + 2))
        );
    }
}
