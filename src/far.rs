use crate::cpu::{Cpu, ESP};
use crate::error::{Fault, Result};
use crate::flags::Size;
use crate::segment::{
    Descriptor, SegReg, SegmentCache, SYS_CALL_GATE286, SYS_CALL_GATE386, SYS_TASK_GATE, SYS_TSS286_AVAIL,
    SYS_TSS386_AVAIL,
};
use crate::task::TaskSwitch;

/// Stack state captured before a transfer that may fault halfway through
/// its pushes.
#[derive(Clone, Copy)]
pub(crate) struct StackSnapshot {
    pub(crate) ss: SegmentCache,
    pub(crate) esp: u32,
}

impl Cpu {
    pub(crate) fn stack_snapshot(&self) -> StackSnapshot {
        StackSnapshot {
            ss: *self.seg(SegReg::Ss),
            esp: self.regs[ESP],
        }
    }

    pub(crate) fn restore_stack(&mut self, snapshot: StackSnapshot) {
        *self.seg_mut(SegReg::Ss) = snapshot.ss;
        self.regs[ESP] = snapshot.esp;
        self.update_status();
    }

    /// Inner-ring SS:ESP for privilege level `dpl`, read from the current TSS.
    pub(crate) fn tss_stack(&mut self, dpl: u8) -> Result<(u16, u32)> {
        let tss32 = self.tr.access & 0x08 != 0;
        let (esp_at, ss_at, width) = if tss32 {
            (4 + dpl as u32 * 8, 8 + dpl as u32 * 8, 4)
        } else {
            (2 + dpl as u32 * 4, 4 + dpl as u32 * 4, 2)
        };
        if ss_at + 1 > self.tr.limit {
            return Err(Fault::InvalidTss(self.tr.selector & 0xFFFC));
        }
        let esp = if width == 4 {
            self.read_sys_32(self.tr.base.wrapping_add(esp_at))?
        } else {
            self.read_sys_16(self.tr.base.wrapping_add(esp_at))? as u32
        };
        let ss = self.read_sys_16(self.tr.base.wrapping_add(ss_at))?;
        Ok((ss, esp))
    }

    /// Installs a validated stack segment and pointer.
    pub(crate) fn switch_stack(&mut self, ss: u16, desc: &Descriptor, esp: u32) {
        self.commit_ss(ss, desc);
        if self.stack32() {
            self.regs[ESP] = esp;
        } else {
            self.set_reg16(ESP, esp as u16);
        }
    }

    fn check_code_limit(&self, desc: &Descriptor, offset: u32) -> Result<()> {
        let cache = SegmentCache::from_descriptor(0, desc, self.model.is_386_class());
        if !cache.contains(offset, 1) {
            return Err(Fault::GeneralProtection(0));
        }
        Ok(())
    }

    /// Reads the code segment a gate points at and checks it can be entered
    /// at or below the current privilege level.
    fn gate_target(&mut self, gate: &Descriptor) -> Result<(u16, Descriptor, u32)> {
        let selector = gate.gate_selector();
        if selector & !3 == 0 {
            return Err(Fault::GeneralProtection(0));
        }
        let (desc, addr) = self.read_descriptor(selector, Fault::GeneralProtection)?;
        if !desc.is_code() || desc.dpl() > self.cpl() {
            return Err(Fault::GeneralProtection(selector & 0xFFFC));
        }
        if !desc.present() {
            return Err(Fault::SegmentNotPresent(selector & 0xFFFC));
        }
        self.mark_accessed(addr, &desc)?;
        Ok((selector, desc, gate.gate_offset()))
    }

    fn check_gate_access(&self, selector: u16, gate: &Descriptor) -> Result<()> {
        let rpl = (selector & 3) as u8;
        if gate.dpl() < self.cpl() || gate.dpl() < rpl {
            return Err(Fault::GeneralProtection(selector & 0xFFFC));
        }
        if !gate.present() {
            return Err(Fault::SegmentNotPresent(selector & 0xFFFC));
        }
        Ok(())
    }

    // ====================================================================
    // JMP far
    // ====================================================================

    pub fn far_jump(&mut self, selector: u16, offset: u32, op32: bool) -> Result<()> {
        let offset = if op32 { offset } else { offset & 0xFFFF };
        if !self.pmode_not_v86() {
            self.load_cs_real(selector);
            self.eip = offset;
            self.clock(self.timings.jmp_rm);
            return Ok(());
        }
        if selector & !3 == 0 {
            return Err(Fault::GeneralProtection(0));
        }
        let (desc, addr) = self.read_descriptor(selector, Fault::GeneralProtection)?;
        if desc.is_segment() {
            self.check_code_descriptor(selector, &desc)?;
            self.check_code_limit(&desc, offset)?;
            self.mark_accessed(addr, &desc)?;
            let cpl = self.cpl();
            self.commit_cs(selector, &desc, cpl);
            self.eip = offset;
            self.clock(self.timings.jmp_pm);
            return Ok(());
        }
        match desc.system_type() {
            SYS_CALL_GATE286 | SYS_CALL_GATE386 => {
                self.check_gate_access(selector, &desc)?;
                let (target, code, offset) = self.gate_target(&desc)?;
                // JMP never changes privilege
                if !code.is_conforming() && code.dpl() != self.cpl() {
                    return Err(Fault::GeneralProtection(target & 0xFFFC));
                }
                let offset = if desc.is_32bit_system() { offset } else { offset & 0xFFFF };
                self.check_code_limit(&code, offset)?;
                let cpl = self.cpl();
                self.commit_cs(target, &code, cpl);
                self.eip = offset;
                self.clock(self.timings.jmp_pm_gate);
                Ok(())
            }
            SYS_TASK_GATE => {
                self.check_gate_access(selector, &desc)?;
                self.task_switch(desc.gate_selector(), TaskSwitch::Jump, None)
            }
            SYS_TSS286_AVAIL | SYS_TSS386_AVAIL => {
                self.check_gate_access(selector, &desc)?;
                self.task_switch(selector, TaskSwitch::Jump, None)
            }
            _ => Err(Fault::GeneralProtection(selector & 0xFFFC)),
        }
    }

    // ====================================================================
    // CALL far
    // ====================================================================

    pub fn far_call(&mut self, selector: u16, offset: u32, op32: bool) -> Result<()> {
        let size = if op32 { Size::Dword } else { Size::Word };
        let offset = if op32 { offset } else { offset & 0xFFFF };
        let snapshot = self.stack_snapshot();
        let return_cs = self.seg(SegReg::Cs).selector as u32;
        let return_eip = self.eip;

        if !self.pmode_not_v86() {
            let pushed = self.push(size, return_cs).and_then(|_| self.push(size, return_eip));
            if let Err(fault) = pushed {
                self.restore_stack(snapshot);
                return Err(fault);
            }
            self.load_cs_real(selector);
            self.eip = offset;
            self.clock(self.timings.call_rm);
            return Ok(());
        }

        if selector & !3 == 0 {
            return Err(Fault::GeneralProtection(0));
        }
        let (desc, addr) = self.read_descriptor(selector, Fault::GeneralProtection)?;
        if desc.is_segment() {
            self.check_code_descriptor(selector, &desc)?;
            self.check_code_limit(&desc, offset)?;
            let pushed = self.push(size, return_cs).and_then(|_| self.push(size, return_eip));
            if let Err(fault) = pushed {
                self.restore_stack(snapshot);
                return Err(fault);
            }
            self.mark_accessed(addr, &desc)?;
            let cpl = self.cpl();
            self.commit_cs(selector, &desc, cpl);
            self.eip = offset;
            self.clock(self.timings.call_pm);
            return Ok(());
        }

        match desc.system_type() {
            SYS_CALL_GATE286 | SYS_CALL_GATE386 => self.call_gate(selector, &desc),
            SYS_TASK_GATE => {
                self.check_gate_access(selector, &desc)?;
                self.task_switch(desc.gate_selector(), TaskSwitch::Call, None)
            }
            SYS_TSS286_AVAIL | SYS_TSS386_AVAIL => {
                self.check_gate_access(selector, &desc)?;
                self.task_switch(selector, TaskSwitch::Call, None)
            }
            _ => Err(Fault::GeneralProtection(selector & 0xFFFC)),
        }
    }

    fn call_gate(&mut self, selector: u16, gate: &Descriptor) -> Result<()> {
        self.check_gate_access(selector, gate)?;
        let (target, code, offset) = self.gate_target(gate)?;
        let gate32 = gate.is_32bit_system();
        let size = if gate32 { Size::Dword } else { Size::Word };
        let offset = if gate32 { offset } else { offset & 0xFFFF };
        self.check_code_limit(&code, offset)?;

        let cpl = self.cpl();
        let return_cs = self.seg(SegReg::Cs).selector as u32;
        let return_eip = self.eip;
        let snapshot = self.stack_snapshot();

        if code.is_conforming() || code.dpl() == cpl {
            let pushed = self.push(size, return_cs).and_then(|_| self.push(size, return_eip));
            if let Err(fault) = pushed {
                self.restore_stack(snapshot);
                return Err(fault);
            }
            self.commit_cs(target, &code, cpl);
            self.eip = offset;
            self.clock(self.timings.call_pm_gate);
            return Ok(());
        }

        // More privileged: switch to the inner stack and copy parameters
        let dpl = code.dpl();
        let (new_ss, new_esp) = self.tss_stack(dpl)?;
        let ss_desc = self.fetch_stack_descriptor(new_ss, dpl, Fault::InvalidTss)?;
        let count = gate.gate_param_count();
        let mut params = Vec::with_capacity(count as usize);
        for i in 0..count {
            params.push(self.peek_stack(size, i * size.bytes())?);
        }
        let old_ss = snapshot.ss.selector as u32;
        let old_esp = snapshot.esp;

        self.switch_stack(new_ss, &ss_desc, new_esp);
        let pushed = (|| -> Result<()> {
            self.push(size, old_ss)?;
            self.push(size, old_esp)?;
            for &param in params.iter().rev() {
                self.push(size, param)?;
            }
            self.push(size, return_cs)?;
            self.push(size, return_eip)
        })();
        if let Err(fault) = pushed {
            self.restore_stack(snapshot);
            return Err(fault);
        }
        self.commit_cs(target, &code, dpl);
        self.eip = offset;
        log::debug!("[FAR] call gate {selector:04X} to ring {dpl}");
        self.clock(self.timings.call_pm_gate_inner);
        Ok(())
    }

    // ====================================================================
    // RETF
    // ====================================================================

    /// Far return, releasing `release` bytes of parameters from each stack
    /// it returns through.
    pub fn far_return(&mut self, op32: bool, release: u32) -> Result<()> {
        let size = if op32 { Size::Dword } else { Size::Word };
        let bytes = size.bytes();
        let offset = self.peek_stack(size, 0)?;
        let selector = self.peek_stack(size, bytes)? as u16;

        if !self.pmode_not_v86() {
            self.adjust_sp(2 * bytes + release);
            self.load_cs_real(selector);
            self.eip = offset;
            self.clock(self.timings.retf_rm);
            return Ok(());
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
        self.check_code_limit(&desc, offset)?;

        if rpl == cpl {
            self.mark_accessed(addr, &desc)?;
            self.adjust_sp(2 * bytes + release);
            self.commit_cs(selector, &desc, cpl);
            self.eip = offset;
            self.clock(self.timings.retf_pm);
            return Ok(());
        }

        // Outer ring: the caller's SS:ESP sits above the parameters
        let new_esp = self.peek_stack(size, 2 * bytes + release)?;
        let new_ss = self.peek_stack(size, 3 * bytes + release)? as u16;
        let ss_desc = self.fetch_stack_descriptor(new_ss, rpl, Fault::GeneralProtection)?;
        self.mark_accessed(addr, &desc)?;
        self.commit_cs(selector, &desc, rpl);
        self.switch_stack(new_ss, &ss_desc, new_esp.wrapping_add(release));
        self.eip = offset;
        self.invalidate_inaccessible_segs();
        self.clock(self.timings.retf_pm_outer);
        Ok(())
    }

    /// RETF and IRET targets: a present code segment matching the RPL.
    pub(crate) fn check_return_descriptor(&self, selector: u16, desc: &Descriptor) -> Result<()> {
        let rpl = (selector & 3) as u8;
        let err = Fault::GeneralProtection(selector & 0xFFFC);
        if !desc.is_code() {
            return Err(err);
        }
        if desc.is_conforming() {
            if desc.dpl() > rpl {
                return Err(err);
            }
        } else if desc.dpl() != rpl {
            return Err(err);
        }
        if !desc.present() {
            return Err(Fault::SegmentNotPresent(selector & 0xFFFC));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{CpuConfig, CpuModel};
    use crate::cpu::{Cpu, CR0_PE, ESP};
    use crate::error::Fault;
    use crate::segment::{Descriptor, SegReg};

    const GDT: u32 = 0x1000;

    // Flat 32-bit ring 0 code and data, a ring 3 code segment and a call gate
    fn pmode_cpu() -> Cpu {
        let mut cpu = Cpu::new(CpuConfig::new(CpuModel::I486Dx));
        cpu.bus.write_64(GDT as usize + 0x08, 0x00CF_9A00_0000_FFFF);
        cpu.bus.write_64(GDT as usize + 0x10, 0x00CF_9200_0000_FFFF);
        cpu.bus.write_64(GDT as usize + 0x18, 0x00CF_FA00_0000_FFFF);
        cpu.gdt.base = GDT;
        cpu.gdt.limit = 0x3F;
        cpu.cr0 |= CR0_PE;
        let code = Descriptor(0x00CF_9A00_0000_FFFF);
        cpu.commit_cs(0x08, &code, 0);
        cpu.load_seg(SegReg::Ss, 0x10).unwrap();
        cpu.load_seg(SegReg::Ds, 0x10).unwrap();
        cpu.regs[ESP] = 0x9000;
        cpu.eip = 0x2000;
        cpu
    }

    #[test]
    fn same_ring_far_call_and_return() {
        let mut cpu = pmode_cpu();
        cpu.far_call(0x08, 0x3000, true).unwrap();
        assert_eq!(cpu.eip, 0x3000);
        assert_eq!(cpu.regs[ESP], 0x9000 - 8);
        assert_eq!(cpu.bus.read_32(0x9000 - 4), 0x08);
        cpu.far_return(true, 0).unwrap();
        assert_eq!(cpu.eip, 0x2000);
        assert_eq!(cpu.regs[ESP], 0x9000);
    }

    #[test]
    fn far_call_to_outer_ring_code_faults() {
        let mut cpu = pmode_cpu();
        assert_eq!(cpu.far_call(0x1B, 0, true), Err(Fault::GeneralProtection(0x18)));
        assert_eq!(cpu.regs[ESP], 0x9000);
    }

    #[test]
    fn null_selector_jump_faults() {
        let mut cpu = pmode_cpu();
        assert_eq!(cpu.far_jump(0, 0, true), Err(Fault::GeneralProtection(0)));
    }
}
