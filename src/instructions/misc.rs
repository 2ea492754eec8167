use crate::config::{CpuModel, Features, Vendor};
use crate::cpu::{Cpu, CpuState, AH, AL, CR4_TSD, EAX, EBX, ECX, EDX};
use crate::error::{Fault, Result};
use crate::flags::{CpuFlags, Size};

use super::Width;

// Bits a FLAGS image may change regardless of mode
const FLAGS_WRITABLE: u32 = 0x0FD5;

impl Cpu {
    /// Loads a FLAGS/EFLAGS image the way POPF and IRET do: bits the current
    /// privilege cannot change keep their old value. VM and RF are never
    /// taken from the image here.
    pub fn load_flags(&mut self, value: u32, size: Size) {
        let mut writable = FLAGS_WRITABLE;
        if self.model.is_386_class() || self.protected_mode() {
            writable |= (CpuFlags::IOPL | CpuFlags::NT).bits();
        }
        if size == Size::Dword {
            if self.model.is_486_class() {
                writable |= CpuFlags::AC.bits();
            }
            if self.has_feature(Features::CPUID) {
                writable |= CpuFlags::ID.bits();
            }
        }
        if self.protected_mode() {
            if self.v86_mode() || self.cpl() > 0 {
                writable &= !CpuFlags::IOPL.bits();
            }
            if !self.v86_mode() && self.cpl() > self.iopl() {
                writable &= !CpuFlags::IF.bits();
            }
        }
        if size != Size::Dword {
            writable &= 0xFFFF;
        }
        let current = self.get_cpu_flags().bits();
        let new = (current & !writable) | (value & writable);
        self.set_cpu_flags(CpuFlags::from_bits_truncate(new));
        self.update_status();
    }
}

// ========================================================================
// Flag instructions
// ========================================================================

/// 90: NOP
pub fn nop(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    cpu.clock(if cpu.model.is_486_class() { 1 } else { 3 });
    Ok(())
}

/// F5: CMC
pub fn cmc(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let cf = cpu.cf();
    cpu.set_cpu_flag(CpuFlags::CF, !cf);
    cpu.clock(2);
    Ok(())
}

/// F8/F9: CLC/STC
pub fn set_carry<const VALUE: bool>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    cpu.set_cpu_flag(CpuFlags::CF, VALUE);
    cpu.clock(2);
    Ok(())
}

/// FC/FD: CLD/STD
pub fn set_direction<const VALUE: bool>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    cpu.set_dflag(VALUE);
    cpu.clock(2);
    Ok(())
}

/// FA: CLI
pub fn cli(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    cpu.check_iopl()?;
    cpu.set_cpu_flag(CpuFlags::IF, false);
    cpu.clock(3);
    Ok(())
}

/// FB: STI. The instruction after it still runs with interrupts held off.
pub fn sti(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    cpu.check_iopl()?;
    if !cpu.get_cpu_flag(CpuFlags::IF) {
        cpu.inhibit_irq = true;
    }
    cpu.set_cpu_flag(CpuFlags::IF, true);
    cpu.clock(2);
    Ok(())
}

/// 9E: SAHF
pub fn sahf(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let ah = cpu.get_reg8(AH) as u32;
    cpu.flags_rebuild();
    let mask = (CpuFlags::SF | CpuFlags::ZF | CpuFlags::AF | CpuFlags::PF | CpuFlags::CF).bits();
    let flags = (cpu.get_cpu_flags().bits() & !mask) | (ah & mask);
    cpu.set_cpu_flags(CpuFlags::from_bits_truncate(flags));
    cpu.clock(3);
    Ok(())
}

/// 9F: LAHF
pub fn lahf(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let flags = cpu.get_cpu_flags().bits();
    cpu.set_reg8(AH, flags as u8);
    cpu.clock(3);
    Ok(())
}

/// D6: SALC, AL = CF ? FF : 00
pub fn salc(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let value = if cpu.cf() { 0xFF } else { 0 };
    cpu.set_reg8(AL, value);
    cpu.clock(1);
    Ok(())
}

/// 9C: PUSHF/PUSHFD. VM and RF read as zero in the pushed image.
pub fn pushf<W: Width>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    if cpu.v86_mode() && cpu.iopl() != 3 {
        return Err(Fault::GeneralProtection(0));
    }
    let flags = cpu.get_cpu_flags() - (CpuFlags::VM | CpuFlags::RF);
    cpu.push(W::SIZE, flags.bits())?;
    cpu.clock(if cpu.model.is_486_class() { 3 } else { 4 });
    Ok(())
}

/// 9D: POPF/POPFD
pub fn popf<W: Width>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    if cpu.v86_mode() && cpu.iopl() != 3 {
        return Err(Fault::GeneralProtection(0));
    }
    let value = cpu.pop(W::SIZE)?;
    cpu.load_flags(value, W::SIZE);
    cpu.clock(if cpu.model.is_486_class() { 9 } else { 5 });
    Ok(())
}

// ========================================================================
// HLT, BOUND, ARPL
// ========================================================================

/// F4: HLT. The core sleeps until an unmasked interrupt or NMI arrives.
pub fn hlt(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    cpu.check_cpl0()?;
    log::debug!("[CPU] HLT at {:04X}:{:08X}", cpu.seg(crate::segment::SegReg::Cs).selector, cpu.oldpc);
    cpu.state = CpuState::Halted;
    cpu.clock(if cpu.model.is_486_class() { 4 } else { 5 });
    Ok(())
}

/// 62: BOUND r, m. Raises #BR when the signed index lies outside the
/// inclusive pair stored at the operand.
pub fn bound<W: Width, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    cpu.require_mem(&m)?;
    let size = W::SIZE;
    let low = cpu.read_mem(size, m.seg, m.offset)?;
    let high_at = cpu.ea_offset(&m, size.bytes());
    let high = cpu.read_mem(size, m.seg, high_at)?;
    let index = size.sign_extend(cpu.reg_w::<W>(&m)) as i32;
    let (low, high) = (size.sign_extend(low) as i32, size.sign_extend(high) as i32);
    cpu.clock(if cpu.model.is_486_class() { 7 } else { 10 });
    if index < low || index > high {
        return Err(Fault::BoundRange);
    }
    Ok(())
}

/// 63: ARPL r/m16, r16. Protected mode only.
pub fn arpl<const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    if !cpu.pmode_not_v86() {
        return Err(Fault::InvalidOpcode);
    }
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let dest = cpu.read_rm_for_write(Size::Word, &m)? as u16;
    let src = cpu.get_reg16(m.reg());
    let adjust = (dest & 3) < (src & 3);
    if adjust {
        cpu.write_rm(Size::Word, &m, ((dest & !3) | (src & 3)) as u32)?;
    }
    cpu.set_cpu_flag(CpuFlags::ZF, adjust);
    cpu.clock_rm(if cpu.model.is_486_class() { 9 } else { 20 }, if cpu.model.is_486_class() { 9 } else { 21 });
    Ok(())
}

// ========================================================================
// CPUID, RDTSC, MSRs
// ========================================================================

fn brand_words(model: CpuModel) -> Option<[u32; 12]> {
    let brand: &[u8] = match model {
        CpuModel::K6 => b"AMD-K6tm w/ multimedia extensions",
        CpuModel::K62 => b"AMD-K6(tm) 3D processor",
        _ => return None,
    };
    let mut bytes = [0u8; 48];
    bytes[..brand.len()].copy_from_slice(brand);
    let mut words = [0u32; 12];
    for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Some(words)
}

impl Cpu {
    /// EDX feature word of leaf 1.
    fn cpuid_features(&self) -> u32 {
        let mut edx = 0;
        for (feature, bit) in [
            (Features::FPU, 0),
            (Features::VME, 1),
            (Features::PSE, 3),
            (Features::TSC, 4),
            (Features::MSR, 5),
            (Features::CX8, 8),
            (Features::CMOV, 15),
            (Features::MMX, 23),
        ] {
            if self.has_feature(feature) {
                edx |= 1 << bit;
            }
        }
        edx
    }

    /// Fills EAX, EBX, ECX and EDX for the leaf in EAX.
    pub fn cpuid(&mut self) {
        let leaf = self.regs[EAX];
        let extended = self.has_feature(Features::SYSCALL);
        let [ebx, edx, ecx] = self.model.vendor().id_words();
        let result = match leaf {
            0 => [1, ebx, ecx, edx],
            1 => [self.model.signature(), 0, 0, self.cpuid_features()],
            0x8000_0000 if extended => [0x8000_0005, 0, 0, 0],
            0x8000_0001 if extended => {
                let mut edx = self.cpuid_features() | 1 << 11;
                if self.has_feature(Features::AMD3DNOW) {
                    edx |= 1 << 31;
                }
                [self.model.signature() + 0x100, 0, 0, edx]
            }
            0x8000_0002..=0x8000_0004 if extended => match brand_words(self.model) {
                Some(words) => {
                    let i = (leaf - 0x8000_0002) as usize * 4;
                    [words[i], words[i + 1], words[i + 2], words[i + 3]]
                }
                None => [0; 4],
            },
            0x8000_0005 if extended => [0, 0x0280_0140, 0x2002_0220, 0x2002_0220],
            _ => [0, self.regs[EBX], self.regs[ECX], self.regs[EDX]],
        };
        let [eax, ebx, ecx, edx] = result;
        self.regs[EAX] = eax;
        self.regs[EBX] = ebx;
        self.regs[ECX] = ecx;
        self.regs[EDX] = edx;
    }

    pub fn read_msr(&mut self, index: u32) -> Result<u64> {
        let vendor = self.model.vendor();
        Ok(match (index, vendor) {
            (0x10, _) => self.msr.tsc,
            (0x0E, Vendor::Centaur | Vendor::Amd) => self.msr.tr12 as u64,
            (0x107, Vendor::Centaur) => self.msr.fcr as u64,
            (0x108, Vendor::Centaur) => self.msr.fcr2,
            (0xC000_0080, Vendor::Amd) => self.msr.efer,
            (0xC000_0081, Vendor::Amd) => self.msr.star,
            (_, Vendor::Amd) => {
                log::warn!("[MSR] read of unknown MSR {index:08X}");
                return Err(Fault::GeneralProtection(0));
            }
            _ => {
                log::trace!("[MSR] read of unimplemented MSR {index:08X}");
                0
            }
        })
    }

    pub fn write_msr(&mut self, index: u32, value: u64) -> Result<()> {
        let vendor = self.model.vendor();
        match (index, vendor) {
            (0x10, _) => self.msr.tsc = value,
            (0x0E, Vendor::Centaur | Vendor::Amd) => self.msr.tr12 = value as u32,
            (0x107, Vendor::Centaur) => self.msr.fcr = value as u32,
            (0x108, Vendor::Centaur) => self.msr.fcr2 = value,
            (0x109, Vendor::Centaur) => self.msr.fcr3 = value,
            (0xC000_0080, Vendor::Amd) => self.msr.efer = value,
            (0xC000_0081, Vendor::Amd) => self.msr.star = value,
            (_, Vendor::Amd) => {
                log::warn!("[MSR] write of unknown MSR {index:08X}");
                return Err(Fault::GeneralProtection(0));
            }
            _ => log::trace!("[MSR] write {value:016X} to unimplemented MSR {index:08X} ignored"),
        }
        Ok(())
    }
}

/// 0F A2: CPUID
pub fn cpuid(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    if !cpu.has_feature(Features::CPUID) {
        return Err(Fault::InvalidOpcode);
    }
    cpu.cpuid();
    cpu.clock(9);
    Ok(())
}

/// 0F 31: RDTSC. CR4.TSD restricts it to ring 0.
pub fn rdtsc(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    if !cpu.has_feature(Features::TSC) {
        return Err(Fault::InvalidOpcode);
    }
    if cpu.cr4 & CR4_TSD != 0 && cpu.protected_mode() && (cpu.v86_mode() || cpu.cpl() > 0) {
        return Err(Fault::GeneralProtection(0));
    }
    let tsc = cpu.msr.tsc;
    cpu.regs[EAX] = tsc as u32;
    cpu.regs[EDX] = (tsc >> 32) as u32;
    cpu.clock(1);
    Ok(())
}

/// 0F 32: RDMSR
pub fn rdmsr(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    if !cpu.has_feature(Features::MSR) {
        return Err(Fault::InvalidOpcode);
    }
    cpu.check_cpl0()?;
    let value = cpu.read_msr(cpu.regs[ECX])?;
    cpu.regs[EAX] = value as u32;
    cpu.regs[EDX] = (value >> 32) as u32;
    cpu.clock(9);
    Ok(())
}

/// 0F 30: WRMSR
pub fn wrmsr(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    if !cpu.has_feature(Features::MSR) {
        return Err(Fault::InvalidOpcode);
    }
    cpu.check_cpl0()?;
    let value = (cpu.regs[EDX] as u64) << 32 | cpu.regs[EAX] as u64;
    cpu.write_msr(cpu.regs[ECX], value)?;
    cpu.clock(9);
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::config::{CpuConfig, CpuModel};
    use crate::cpu::{Cpu, CR0_PE, EAX, EBX, ECX, EDX, ESP};
    use crate::error::Fault;
    use crate::flags::{CpuFlags, Size};
    use crate::instructions::Word;
    use crate::segment::Descriptor;

    fn cpu(model: CpuModel) -> Cpu {
        let mut cpu = Cpu::new(CpuConfig::new(model));
        cpu.load_cs_real(0);
        cpu.eip = 0x100;
        cpu.oldpc = 0x100;
        cpu.regs[ESP] = 0x8000;
        cpu
    }

    #[test]
    fn popf_on_286_real_mode_clears_upper_bits() {
        let mut cpu = cpu(CpuModel::I286);
        cpu.load_flags(0xF0D5, Size::Word);
        assert_eq!(cpu.get_cpu_flags().bits() & 0xF000, 0);
        assert!(cpu.get_cpu_flag(CpuFlags::CF));
    }

    #[test]
    fn ring3_popf_keeps_iopl_and_if() {
        let mut cpu = cpu(CpuModel::I486Dx);
        cpu.cr0 |= CR0_PE;
        cpu.commit_cs(0x1B, &Descriptor(0x00CF_FA00_0000_FFFF), 3);
        cpu.set_cpu_flags(CpuFlags::IF);
        cpu.load_flags(0x3001, Size::Dword);
        assert_eq!(cpu.iopl(), 0);
        assert!(cpu.get_cpu_flag(CpuFlags::IF));
        assert!(cpu.get_cpu_flag(CpuFlags::CF));
    }

    #[test]
    fn pushf_popf_round_trip() {
        // 9C 9D: PUSHF; POPF
        let mut cpu = cpu(CpuModel::I386Dx);
        cpu.set_cpu_flags(CpuFlags::CF | CpuFlags::ZF | CpuFlags::DF);
        super::pushf::<Word>(&mut cpu, 0).unwrap();
        assert_eq!(cpu.bus.read_16(0x7FFE), 0x0443);
        cpu.set_cpu_flags(CpuFlags::empty());
        super::popf::<Word>(&mut cpu, 0).unwrap();
        assert!(cpu.zf() && cpu.cf() && cpu.dflag());
    }

    #[test]
    fn bound_outside_range_raises_br() {
        // 62 06 00 20: BOUND AX, [2000]
        let mut cpu = cpu(CpuModel::I486Dx);
        cpu.bus.load(0x100, &[0x06, 0x00, 0x20]);
        cpu.bus.write_16(0x2000, 10);
        cpu.bus.write_16(0x2002, 20);
        cpu.regs[EAX] = 25;
        let fetchdat = cpu.peek_fetchdat();
        assert_eq!(super::bound::<Word, false>(&mut cpu, fetchdat), Err(Fault::BoundRange));
        assert_eq!(cpu.regs[EAX], 25);

        cpu.eip = 0x100;
        cpu.regs[EAX] = 20;
        assert_eq!(super::bound::<Word, false>(&mut cpu, fetchdat), Ok(()));
    }

    #[test]
    fn cpuid_reports_vendor_and_extended_leaves() {
        // 0F A2: CPUID
        let mut cpu = cpu(CpuModel::K62);
        cpu.regs[EAX] = 0;
        cpu.cpuid();
        let vendor: Vec<u8> = [cpu.regs[EBX], cpu.regs[EDX], cpu.regs[ECX]]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        assert_eq!(&vendor, b"AuthenticAMD");

        cpu.regs[EAX] = 0x8000_0001;
        cpu.cpuid();
        assert_ne!(cpu.regs[EDX] & (1 << 31), 0);
        assert_ne!(cpu.regs[EDX] & (1 << 11), 0);

        let mut intel = self::cpu(CpuModel::Pentium);
        intel.regs[EAX] = 1;
        intel.cpuid();
        assert_eq!(intel.regs[EAX], 0x052C);
        assert_eq!(intel.regs[EDX] & (1 << 23), 0);
    }

    #[test]
    fn msr_tsc_and_unknown_index() {
        let mut cpu = cpu(CpuModel::K6);
        cpu.write_msr(0x10, 0x1234).unwrap();
        assert_eq!(cpu.read_msr(0x10), Ok(0x1234));
        assert_eq!(cpu.read_msr(0x1234_5678), Err(Fault::GeneralProtection(0)));
        let mut pentium = self::cpu(CpuModel::Pentium);
        assert_eq!(pentium.read_msr(0x1234_5678), Ok(0));
    }
}
