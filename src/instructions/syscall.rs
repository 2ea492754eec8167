use crate::cpu::{Cpu, CpuFlags, ECX};
use crate::error::{Fault, Result};
use crate::segment::{Descriptor, SegReg};

// Flat 4 GiB, 32-bit, page granular descriptors SYSCALL/SYSRET install
// without touching the GDT.
const FLAT_CODE_RING0: Descriptor = Descriptor(0x00CF_9B00_0000_FFFF);
const FLAT_STACK_RING0: Descriptor = Descriptor(0x00CF_9300_0000_FFFF);
const FLAT_CODE_RING3: Descriptor = Descriptor(0x00CF_FB00_0000_FFFF);
const FLAT_STACK_RING3: Descriptor = Descriptor(0x00CF_F300_0000_FFFF);

const SYSCALL_CYCLES: i32 = 20;

/// Fields of the STAR MSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Star {
    pub syscall_eip: u32,
    pub syscall_cs: u16,
    pub sysret_cs: u16,
}

impl From<u64> for Star {
    fn from(raw: u64) -> Self {
        Self {
            syscall_eip: raw as u32,
            syscall_cs: (raw >> 32) as u16,
            sysret_cs: (raw >> 48) as u16,
        }
    }
}

impl Cpu {
    /// Replaces CS and SS with synthetic flat descriptors. Page checks are
    /// suspended while the caches are rewritten; the selector still has to
    /// name a slot inside its descriptor table.
    fn load_flat_segments(&mut self, selector: u16, cpl: u8, code: Descriptor, stack: Descriptor) -> Result<()> {
        self.with_cpl_override(|cpu| {
            cpu.descriptor_addr(selector, Fault::GeneralProtection)?;
            cpu.commit_cs(selector, &code, cpl);
            cpu.commit_ss((selector.wrapping_add(8) & !3) | cpl as u16, &stack);
            Ok(())
        })
    }
}

/// 0F 05 on K6-class parts: SYSCALL
pub fn syscall(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let star = Star::from(cpu.msr.star);
    if !cpu.protected_mode() || star.syscall_cs & !3 == 0 {
        return Err(Fault::InvalidOpcode);
    }
    cpu.load_flat_segments(star.syscall_cs & !3, 0, FLAT_CODE_RING0, FLAT_STACK_RING0)?;
    cpu.regs[ECX] = cpu.eip;
    let flags = cpu.get_cpu_flags() - (CpuFlags::VM | CpuFlags::IF | CpuFlags::RF);
    cpu.set_cpu_flags(flags);
    cpu.update_status();
    cpu.eip = star.syscall_eip;
    log::trace!("[SYSCALL] CS={:04X} EIP={:08X}", cpu.seg(SegReg::Cs).selector, cpu.eip);
    cpu.clock(SYSCALL_CYCLES);
    Ok(())
}

/// 0F 07 on K6-class parts: SYSRET
pub fn sysret(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let star = Star::from(cpu.msr.star);
    if !cpu.protected_mode() || star.sysret_cs & !3 == 0 {
        return Err(Fault::InvalidOpcode);
    }
    if cpu.cpl() != 0 {
        return Err(Fault::GeneralProtection(0));
    }
    cpu.load_flat_segments(star.sysret_cs & !3, 3, FLAT_CODE_RING3, FLAT_STACK_RING3)?;
    cpu.eip = cpu.regs[ECX];
    cpu.set_cpu_flag(CpuFlags::IF, true);
    cpu.flush_tlb();
    cpu.clock(SYSCALL_CYCLES);
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::config::{CpuConfig, CpuModel};
    use crate::cpu::{Cpu, CR0_PE, ECX};
    use crate::error::Fault;
    use crate::segment::SegmentCache;

    use super::*;

    fn pmode_cpu() -> Cpu {
        let mut cpu = Cpu::new(CpuConfig::new(CpuModel::K6));
        cpu.cr0 |= CR0_PE;
        cpu.gdt.base = 0x1000;
        cpu.gdt.limit = 0x3F;
        cpu.segs[SegReg::Cs as usize] = SegmentCache::from_descriptor(0x08, &FLAT_CODE_RING0, true);
        cpu.update_status();
        cpu.eip = 0x4002;
        cpu.msr.star = 0x0023_0008_0008_0000;
        cpu
    }

    #[test]
    fn star_fields() {
        let star = Star::from(0x1B2B_0010_DEAD_BEEF);
        assert_eq!(star.syscall_eip, 0xDEAD_BEEF);
        assert_eq!(star.syscall_cs, 0x0010);
        assert_eq!(star.sysret_cs, 0x1B2B);
    }

    #[test]
    fn syscall_then_sysret() {
        let mut cpu = pmode_cpu();
        cpu.set_cpu_flag(CpuFlags::IF, true);
        syscall(&mut cpu, 0).unwrap();
        assert_eq!(cpu.regs[ECX], 0x4002);
        assert_eq!(cpu.eip, 0x0008_0000);
        assert_eq!(cpu.seg(SegReg::Cs).selector, 0x08);
        assert_eq!(cpu.seg(SegReg::Ss).selector, 0x10);
        assert_eq!(cpu.cpl(), 0);
        assert!(cpu.use32() && cpu.stack32());
        assert!(!cpu.get_cpu_flag(CpuFlags::IF));

        sysret(&mut cpu, 0).unwrap();
        assert_eq!(cpu.eip, 0x4002);
        assert_eq!(cpu.seg(SegReg::Cs).selector, 0x23);
        assert_eq!(cpu.seg(SegReg::Ss).selector, 0x2B);
        assert_eq!(cpu.cpl(), 3);
        assert!(cpu.get_cpu_flag(CpuFlags::IF));
    }

    #[test]
    fn unusable_outside_protected_mode_or_with_null_selector() {
        let mut cpu = Cpu::new(CpuConfig::new(CpuModel::K6));
        cpu.msr.star = 0x0023_0008_0000_0000;
        assert_eq!(syscall(&mut cpu, 0), Err(Fault::InvalidOpcode));
        let mut cpu = pmode_cpu();
        cpu.msr.star = 0;
        assert_eq!(syscall(&mut cpu, 0), Err(Fault::InvalidOpcode));
    }

    #[test]
    fn sysret_from_user_mode_faults() {
        let mut cpu = pmode_cpu();
        syscall(&mut cpu, 0).unwrap();
        sysret(&mut cpu, 0).unwrap();
        assert_eq!(sysret(&mut cpu, 0), Err(Fault::GeneralProtection(0)));
    }
}
