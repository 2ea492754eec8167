use crate::cpu::{Cpu, CR0_PG, CR0_TS, EAX, EDI};
use crate::error::{Fault, Result};
use crate::flags::{CpuFlags, Size};
use crate::segment::{
    Descriptor, SegReg, SegmentCache, SYS_TSS286_AVAIL, SYS_TSS286_BUSY, SYS_TSS386_AVAIL, SYS_TSS386_BUSY,
};

/// What started a task switch. Decides the busy-bit and back-link rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSwitch {
    Jump,
    Call,
    /// Interrupt or exception through a task gate; nests like CALL.
    Interrupt,
    /// IRET with NT set, back to the task named in the back link.
    Iret,
}

impl TaskSwitch {
    fn nests(self) -> bool {
        matches!(self, TaskSwitch::Call | TaskSwitch::Interrupt)
    }
}

// 32-bit TSS layout
const TSS32_CR3: u32 = 0x1C;
const TSS32_EIP: u32 = 0x20;
const TSS32_EFLAGS: u32 = 0x24;
const TSS32_REGS: u32 = 0x28;
const TSS32_SEGS: u32 = 0x48;
const TSS32_LDT: u32 = 0x60;
const TSS32_MIN_LIMIT: u32 = 103;

// 16-bit TSS layout
const TSS16_IP: u32 = 0x0E;
const TSS16_FLAGS: u32 = 0x10;
const TSS16_REGS: u32 = 0x12;
const TSS16_SEGS: u32 = 0x22;
const TSS16_LDT: u32 = 0x2A;
const TSS16_MIN_LIMIT: u32 = 43;

/// Register image read from an incoming TSS.
struct TaskImage {
    cr3: Option<u32>,
    eip: u32,
    eflags: u32,
    regs: [u32; 8],
    /// ES, CS, SS, DS, FS, GS
    selectors: [u16; 6],
    ldt: u16,
}

impl Cpu {
    /// Switches to the task whose TSS descriptor `selector` names.
    /// `error_code` is pushed on the new task's stack for exceptions.
    pub fn task_switch(&mut self, selector: u16, kind: TaskSwitch, error_code: Option<u16>) -> Result<()> {
        let ts_err = |sel: u16| Fault::InvalidTss(sel & 0xFFFC);
        if selector & 4 != 0 {
            return Err(ts_err(selector));
        }
        let (desc, desc_addr) = self.read_descriptor(selector, Fault::GeneralProtection)?;
        let busy = matches!(desc.system_type(), SYS_TSS286_BUSY | SYS_TSS386_BUSY);
        let available = matches!(desc.system_type(), SYS_TSS286_AVAIL | SYS_TSS386_AVAIL);
        if desc.is_segment() || (kind == TaskSwitch::Iret && !busy) || (kind != TaskSwitch::Iret && !available) {
            return Err(if kind == TaskSwitch::Iret {
                ts_err(selector)
            } else {
                Fault::GeneralProtection(selector & 0xFFFC)
            });
        }
        if !desc.present() {
            return Err(Fault::SegmentNotPresent(selector & 0xFFFC));
        }
        let new32 = desc.is_32bit_system();
        let min_limit = if new32 { TSS32_MIN_LIMIT } else { TSS16_MIN_LIMIT };
        if desc.limit() < min_limit {
            return Err(ts_err(selector));
        }
        let is386 = self.model.is_386_class();
        let new_base = desc.base(is386);

        // Read the incoming image before anything is committed
        let image = self.read_task_image(new_base, new32)?;

        // Save the outgoing task
        let mut eflags = self.get_cpu_flags().bits();
        if kind == TaskSwitch::Iret {
            eflags &= !CpuFlags::NT.bits();
        }
        self.save_task_image(eflags)?;
        if matches!(kind, TaskSwitch::Jump | TaskSwitch::Iret) {
            self.set_tss_busy(self.tr.selector, false)?;
        }
        if kind.nests() {
            self.write_sys_16(new_base, self.tr.selector)?;
        }
        if kind != TaskSwitch::Iret {
            self.write_sys_8(desc_addr + 5, desc.access() | 0x02)?;
        }

        // Commit TR and the incoming register image
        let mut tr_desc = desc;
        tr_desc.0 |= 2u64 << 40;
        self.tr = SegmentCache::from_descriptor(selector, &tr_desc, is386);
        self.cr0 |= CR0_TS;
        if let Some(cr3) = image.cr3 {
            if self.cr0 & CR0_PG != 0 {
                self.cr3 = cr3;
                self.flush_tlb();
            }
        }
        let mut flags = CpuFlags::from_bits_truncate(image.eflags);
        if kind.nests() {
            flags |= CpuFlags::NT;
        }
        self.set_cpu_flags(flags);
        if new32 {
            self.regs = image.regs;
        } else {
            for (reg, value) in image.regs.iter().enumerate() {
                self.set_reg16(reg, *value as u16);
            }
        }
        self.eip = image.eip;
        log::debug!("[TASK] switch to {selector:04X} by {kind:?}");

        self.load_task_segments(&image)?;
        if !self.seg(SegReg::Cs).contains(self.eip, 1) {
            return Err(Fault::GeneralProtection(0));
        }
        if let Some(code) = error_code {
            let size = if new32 { Size::Dword } else { Size::Word };
            self.push(size, code as u32)?;
        }
        self.clock(if is386 { 300 } else { 180 });
        Ok(())
    }

    fn read_task_image(&mut self, base: u32, tss32: bool) -> Result<TaskImage> {
        let mut regs = [0u32; 8];
        let mut selectors = [0u16; 6];
        if tss32 {
            for (i, reg) in regs.iter_mut().enumerate() {
                *reg = self.read_sys_32(base + TSS32_REGS + i as u32 * 4)?;
            }
            for (i, sel) in selectors.iter_mut().enumerate() {
                *sel = self.read_sys_16(base + TSS32_SEGS + i as u32 * 4)?;
            }
            Ok(TaskImage {
                cr3: Some(self.read_sys_32(base + TSS32_CR3)?),
                eip: self.read_sys_32(base + TSS32_EIP)?,
                eflags: self.read_sys_32(base + TSS32_EFLAGS)?,
                regs,
                selectors,
                ldt: self.read_sys_16(base + TSS32_LDT)?,
            })
        } else {
            for (i, reg) in regs.iter_mut().enumerate() {
                *reg = self.read_sys_16(base + TSS16_REGS + i as u32 * 2)? as u32;
            }
            // 16-bit TSSs hold ES, CS, SS, DS only
            for (i, sel) in selectors.iter_mut().take(4).enumerate() {
                *sel = self.read_sys_16(base + TSS16_SEGS + i as u32 * 2)?;
            }
            Ok(TaskImage {
                cr3: None,
                eip: self.read_sys_16(base + TSS16_IP)? as u32,
                eflags: self.read_sys_16(base + TSS16_FLAGS)? as u32,
                regs,
                selectors,
                ldt: self.read_sys_16(base + TSS16_LDT)?,
            })
        }
    }

    fn save_task_image(&mut self, eflags: u32) -> Result<()> {
        let base = self.tr.base;
        if self.tr.access & 0x08 != 0 {
            self.write_sys_32(base + TSS32_EIP, self.eip)?;
            self.write_sys_32(base + TSS32_EFLAGS, eflags)?;
            for reg in EAX..=EDI {
                self.write_sys_32(base + TSS32_REGS + reg as u32 * 4, self.regs[reg])?;
            }
            for (i, seg) in SegReg::ALL.iter().enumerate() {
                self.write_sys_16(base + TSS32_SEGS + i as u32 * 4, self.seg(*seg).selector)?;
            }
        } else {
            self.write_sys_16(base + TSS16_IP, self.eip as u16)?;
            self.write_sys_16(base + TSS16_FLAGS, eflags as u16)?;
            for reg in EAX..=EDI {
                self.write_sys_16(base + TSS16_REGS + reg as u32 * 2, self.regs[reg] as u16)?;
            }
            for (i, seg) in SegReg::ALL.iter().take(4).enumerate() {
                self.write_sys_16(base + TSS16_SEGS + i as u32 * 2, self.seg(*seg).selector)?;
            }
        }
        Ok(())
    }

    /// Sets or clears the busy bit in the GDT entry for TSS `selector`.
    pub(crate) fn set_tss_busy(&mut self, selector: u16, busy: bool) -> Result<()> {
        let addr = self.descriptor_addr(selector, Fault::InvalidTss)?;
        let access = self.read_sys_8(addr + 5)?;
        let access = if busy { access | 0x02 } else { access & !0x02 };
        self.write_sys_8(addr + 5, access)
    }

    /// Loads LDTR and the segment registers of the incoming task. Faults
    /// here are raised in the context of the new task.
    fn load_task_segments(&mut self, image: &TaskImage) -> Result<()> {
        self.ldt = SegmentCache::null(0);
        if self.v86_mode() {
            for (seg, sel) in SegReg::ALL.iter().zip(image.selectors) {
                self.segs[*seg as usize] = SegmentCache::v86(sel);
            }
            self.update_status();
            return Ok(());
        }
        self.load_ldt(image.ldt, Fault::InvalidTss)?;

        let [es, cs, ss, ds, fs, gs] = image.selectors;
        if cs & !3 == 0 {
            return Err(Fault::InvalidTss(0));
        }
        let (code, _) = self.read_descriptor(cs, Fault::InvalidTss)?;
        let cpl = (cs & 3) as u8;
        let conforming_ok = code.is_conforming() && code.dpl() <= cpl;
        if !code.is_code() || !(conforming_ok || code.dpl() == cpl) {
            return Err(Fault::InvalidTss(cs & 0xFFFC));
        }
        if !code.present() {
            return Err(Fault::SegmentNotPresent(cs & 0xFFFC));
        }
        self.commit_cs(cs, &code, cpl);

        let stack: Descriptor = self.fetch_stack_descriptor(ss, cpl, Fault::InvalidTss)?;
        self.commit_ss(ss, &stack);

        for (seg, sel) in [(SegReg::Es, es), (SegReg::Ds, ds), (SegReg::Fs, fs), (SegReg::Gs, gs)] {
            self.load_seg(seg, sel).map_err(|fault| match fault {
                Fault::GeneralProtection(code) => Fault::InvalidTss(code),
                other => other,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{CpuConfig, CpuModel};
    use crate::cpu::{Cpu, CR0_PE, CR0_TS, EAX, ESP};
    use crate::flags::CpuFlags;
    use crate::segment::{Descriptor, SegReg};

    use super::TaskSwitch;

    const GDT: usize = 0x1000;
    const OLD_TSS: usize = 0x2000;
    const NEW_TSS: usize = 0x3000;

    fn tss_descriptor(base: usize, busy: bool) -> u64 {
        let kind: u64 = if busy { 0x8B } else { 0x89 };
        0x67 | ((base as u64 & 0xFFFFFF) << 16) | (kind << 40)
    }

    fn two_task_cpu() -> Cpu {
        let mut cpu = Cpu::new(CpuConfig::new(CpuModel::I486Dx));
        cpu.bus.write_64(GDT + 0x08, 0x00CF_9A00_0000_FFFF);
        cpu.bus.write_64(GDT + 0x10, 0x00CF_9200_0000_FFFF);
        cpu.bus.write_64(GDT + 0x18, tss_descriptor(OLD_TSS, true));
        cpu.bus.write_64(GDT + 0x20, tss_descriptor(NEW_TSS, false));
        cpu.gdt.base = GDT as u32;
        cpu.gdt.limit = 0x27;
        cpu.cr0 |= CR0_PE;
        cpu.commit_cs(0x08, &Descriptor(0x00CF_9A00_0000_FFFF), 0);
        cpu.load_seg(SegReg::Ss, 0x10).unwrap();
        cpu.tr = crate::segment::SegmentCache::from_descriptor(0x18, &Descriptor(tss_descriptor(OLD_TSS, true)), true);

        // Incoming task: EIP 0x4000, EAX 0x1234, flat selectors
        cpu.bus.write_32(NEW_TSS + 0x20, 0x4000);
        cpu.bus.write_32(NEW_TSS + 0x24, 0x0002);
        cpu.bus.write_32(NEW_TSS + 0x28, 0x1234);
        cpu.bus.write_32(NEW_TSS + 0x38, 0x8000);
        for (i, sel) in [0x10u16, 0x08, 0x10, 0x10, 0, 0].iter().enumerate() {
            cpu.bus.write_16(NEW_TSS + 0x48 + i * 4, *sel);
        }
        cpu.eip = 0x1000;
        cpu
    }

    #[test]
    fn call_nests_and_iret_returns() {
        let mut cpu = two_task_cpu();
        cpu.task_switch(0x20, TaskSwitch::Call, None).unwrap();
        assert_eq!(cpu.eip, 0x4000);
        assert_eq!(cpu.regs[EAX], 0x1234);
        assert_eq!(cpu.regs[ESP], 0x8000);
        assert_eq!(cpu.tr.selector, 0x20);
        assert!(cpu.get_cpu_flag(CpuFlags::NT));
        assert_ne!(cpu.cr0 & CR0_TS, 0);
        assert_eq!(cpu.bus.read_16(NEW_TSS), 0x18);
        assert_eq!(cpu.bus.read_32(OLD_TSS + 0x20), 0x1000);

        cpu.task_switch(0x18, TaskSwitch::Iret, None).unwrap();
        assert_eq!(cpu.eip, 0x1000);
        assert_eq!(cpu.tr.selector, 0x18);
        // The nested task is no longer busy
        assert_eq!(cpu.bus.read_8(GDT + 0x25) & 0x0F, 0x09);
    }

    #[test]
    fn jump_to_busy_task_faults() {
        let mut cpu = two_task_cpu();
        assert_eq!(
            cpu.task_switch(0x18, TaskSwitch::Jump, None),
            Err(crate::error::Fault::GeneralProtection(0x18))
        );
    }
}
