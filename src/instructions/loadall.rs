use crate::cpu::{Cpu, CpuFlags, CR0_PE, CR0_PG, EAX, EBP, EBX, ECX, EDI, EDX, ESI, ESP};
use crate::error::Result;
use crate::segment::{DescriptorTable, SegReg, SegmentCache};

/// Physical address of the 286 LOADALL image.
const LOADALL286_BASE: u32 = 0x800;

// Selector and register order of the two images
const IMAGE_REGS: [usize; 8] = [EDI, ESI, EBP, ESP, EBX, EDX, ECX, EAX];
const SEGS_286: [SegReg; 4] = [SegReg::Ds, SegReg::Ss, SegReg::Cs, SegReg::Es];
const CACHES_286: [SegReg; 4] = [SegReg::Es, SegReg::Cs, SegReg::Ss, SegReg::Ds];
const SEGS_386: [SegReg; 6] = [SegReg::Gs, SegReg::Fs, SegReg::Ds, SegReg::Ss, SegReg::Cs, SegReg::Es];

impl Cpu {
    /// 286 six-byte cache: 24-bit base, access rights, 16-bit limit.
    fn loadall286_cache(&mut self, addr: u32, selector: u16) -> Result<SegmentCache> {
        let base = self.read_sys_16(addr)? as u32 | (self.read_sys_8(addr + 2)? as u32) << 16;
        let access = self.read_sys_8(addr + 3)?;
        let limit = self.read_sys_16(addr + 4)? as u32;
        Ok(SegmentCache::from_parts(selector, base, limit, access, 0))
    }

    fn loadall286_table(&mut self, addr: u32) -> Result<DescriptorTable> {
        let base = self.read_sys_16(addr)? as u32 | (self.read_sys_8(addr + 2)? as u32) << 16;
        let limit = self.read_sys_16(addr + 4)?;
        Ok(DescriptorTable { base, limit })
    }

    /// 386 twelve-byte cache: attribute dword (rights in bits 8-15, G/D in
    /// 16-23), base, byte-granular limit.
    fn loadall386_cache(&mut self, addr: u32, selector: u16) -> Result<SegmentCache> {
        let attrib = self.read_sys_32(addr)?;
        let base = self.read_sys_32(addr + 4)?;
        let limit = self.read_sys_32(addr + 8)?;
        let access = (attrib >> 8) as u8;
        let ar_high = (attrib >> 16) as u8 & 0xF0;
        Ok(SegmentCache::from_parts(selector, base, limit, access, ar_high))
    }

    /// Loads every visible and hidden register from the image at physical
    /// 800h. Caches are taken as stored; no descriptor is validated.
    pub fn loadall286(&mut self) -> Result<()> {
        let at = |offset: u32| LOADALL286_BASE + offset;
        let msw = self.read_sys_16(at(0x06))? as u32;
        let tr_selector = self.read_sys_16(at(0x16))?;
        let flags = self.read_sys_16(at(0x18))? as u32;
        let ip = self.read_sys_16(at(0x1A))? as u32;
        let ldt_selector = self.read_sys_16(at(0x1C))?;
        let mut selectors = [0u16; 6];
        for (i, seg) in SEGS_286.iter().enumerate() {
            selectors[*seg as usize] = self.read_sys_16(at(0x1E + 2 * i as u32))?;
        }
        let mut regs = [0u16; 8];
        for (i, slot) in regs.iter_mut().enumerate() {
            *slot = self.read_sys_16(at(0x26 + 2 * i as u32))?;
        }
        let mut caches = [SegmentCache::default(); 4];
        for (i, seg) in CACHES_286.iter().enumerate() {
            caches[i] = self.loadall286_cache(at(0x36 + 6 * i as u32), selectors[*seg as usize])?;
        }
        let gdt = self.loadall286_table(at(0x4E))?;
        let ldt = self.loadall286_cache(at(0x54), ldt_selector)?;
        let idt = self.loadall286_table(at(0x5A))?;
        let tr = self.loadall286_cache(at(0x60), tr_selector)?;

        // Nothing is committed until the whole image has been read
        self.cr0 = (self.cr0 & (0xFFF0 | CR0_PE)) | (msw & 0xF);
        for (reg, value) in IMAGE_REGS.iter().zip(regs) {
            self.set_reg16(*reg, value);
        }
        for (seg, cache) in CACHES_286.iter().zip(caches) {
            self.segs[*seg as usize] = cache;
        }
        self.gdt = gdt;
        self.idt = idt;
        self.ldt = ldt;
        self.tr = tr;
        self.set_cpu_flags(CpuFlags::from_bits_truncate((flags & 0xFFD5) | 2));
        self.eip = ip;
        self.update_status();
        log::debug!("[LOADALL] CS:IP {:04X}:{:04X} MSW {:04X}", self.seg(SegReg::Cs).selector, ip, self.cr0 as u16);
        Ok(())
    }

    /// Loads the 386 image at ES:EDI, bypassing descriptor validation.
    pub fn loadall386(&mut self) -> Result<()> {
        let base = self.seg(SegReg::Es).base.wrapping_add(self.regs[EDI]);
        let at = |offset: u32| base.wrapping_add(offset);
        let cr0 = self.read_sys_32(at(0x00))?;
        let eflags = self.read_sys_32(at(0x04))?;
        let eip = self.read_sys_32(at(0x08))?;
        let mut regs = [0u32; 8];
        for (i, slot) in regs.iter_mut().enumerate() {
            *slot = self.read_sys_32(at(0x0C + 4 * i as u32))?;
        }
        let dr6 = self.read_sys_32(at(0x2C))?;
        let dr7 = self.read_sys_32(at(0x30))?;
        let tr_selector = self.read_sys_16(at(0x34))?;
        let ldt_selector = self.read_sys_16(at(0x38))?;
        let mut selectors = [0u16; 6];
        for (i, slot) in selectors.iter_mut().enumerate() {
            *slot = self.read_sys_16(at(0x3C + 4 * i as u32))?;
        }
        let tr = self.loadall386_cache(at(0x54), tr_selector)?;
        let idt = self.loadall386_cache(at(0x60), 0)?;
        let gdt = self.loadall386_cache(at(0x6C), 0)?;
        let ldt = self.loadall386_cache(at(0x78), ldt_selector)?;
        let mut caches = [SegmentCache::default(); 6];
        for (i, cache) in caches.iter_mut().enumerate() {
            *cache = self.loadall386_cache(at(0x84 + 12 * i as u32), selectors[i])?;
        }

        let paging_changed = (self.cr0 ^ cr0) & CR0_PG != 0;
        self.cr0 = cr0;
        for (reg, value) in IMAGE_REGS.iter().zip(regs) {
            self.regs[*reg] = value;
        }
        self.dr[6] = dr6;
        self.dr[7] = dr7;
        for (seg, cache) in SEGS_386.iter().zip(caches) {
            self.segs[*seg as usize] = cache;
        }
        self.tr = tr;
        self.ldt = ldt;
        self.idt = DescriptorTable { base: idt.base, limit: idt.limit as u16 };
        self.gdt = DescriptorTable { base: gdt.base, limit: gdt.limit as u16 };
        self.set_cpu_flags(CpuFlags::from_bits_truncate(eflags));
        self.eip = eip;
        self.update_status();
        if paging_changed || self.cpl() == 3 {
            self.flush_tlb();
        }
        log::debug!("[LOADALL] CS:EIP {:04X}:{:08X} CR0 {:08X}", self.seg(SegReg::Cs).selector, eip, cr0);
        Ok(())
    }
}

/// 0F 05 on the 286: LOADALL
pub fn loadall(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    cpu.check_cpl0()?;
    cpu.loadall286()?;
    cpu.clock(195);
    Ok(())
}

/// 0F 07 on the 386: LOADALL
pub fn loadall386(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    cpu.check_cpl0()?;
    cpu.loadall386()?;
    cpu.clock(350);
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::config::{CpuConfig, CpuModel};
    use crate::cpu::{Cpu, CpuFlags, CR0_PE, EAX, EDI, ESP};
    use crate::segment::{SegReg, SegmentCache};

    #[test]
    fn loadall286_bulk_loads_caches() {
        let mut cpu = Cpu::new(CpuConfig::new(CpuModel::I286));
        let at = |offset: usize| 0x800 + offset;
        cpu.bus.write_16(at(0x06), 0xFFF1);
        cpu.bus.write_16(at(0x18), 0x0202);
        cpu.bus.write_16(at(0x1A), 0x1234);
        cpu.bus.write_16(at(0x22), 0x0008);
        cpu.bus.write_16(at(0x2C), 0x0FFE);
        cpu.bus.write_16(at(0x34), 0xAAAA);
        // CS cache: base 0x012000, present DPL0 code, limit 0xFFFF
        cpu.bus.load(at(0x3C), &[0x00, 0x20, 0x01, 0x9B, 0xFF, 0xFF]);
        // DS cache: base 0xABCDE0 with a 0x0FFF limit
        cpu.bus.load(at(0x48), &[0xE0, 0xCD, 0xAB, 0x93, 0xFF, 0x0F]);
        cpu.bus.load(at(0x4E), &[0x00, 0x10, 0x00, 0x00, 0xFF, 0x00]);

        super::loadall(&mut cpu, 0).unwrap();
        assert!(cpu.cr0 & CR0_PE != 0);
        assert_eq!(cpu.eip, 0x1234);
        assert_eq!(cpu.regs[ESP], 0x0FFE);
        assert_eq!(cpu.regs[EAX], 0xAAAA);
        assert_eq!(cpu.seg(SegReg::Cs).selector, 0x0008);
        assert_eq!(cpu.seg(SegReg::Cs).base, 0x01_2000);
        assert_eq!(cpu.seg(SegReg::Ds).base, 0xAB_CDE0);
        assert_eq!(cpu.seg(SegReg::Ds).limit, 0x0FFF);
        assert_eq!(cpu.gdt.base, 0x1000);
        assert_eq!(cpu.gdt.limit, 0xFF);
        assert!(cpu.get_cpu_flag(CpuFlags::IF));
        assert_eq!(cpu.cycles, -195);
    }

    #[test]
    fn loadall386_reads_at_es_edi() {
        let mut cpu = Cpu::new(CpuConfig::new(CpuModel::I386Dx));
        cpu.segs[SegReg::Es as usize] = SegmentCache::real_mode(0x100);
        cpu.regs[EDI] = 0x10;
        let image = 0x1010;
        cpu.bus.write_32(image, 0x0000_0011);
        cpu.bus.write_32(image + 0x04, 0x0000_0002);
        cpu.bus.write_32(image + 0x08, 0x0000_8000);
        cpu.bus.write_32(image + 0x28, 0xCAFE_F00D);
        cpu.bus.write_16(image + 0x4C, 0x0010);
        // CS cache: 32-bit code, base 0, 4 GiB
        cpu.bus.write_32(image + 0xB4, 0x0040_9B00);
        cpu.bus.write_32(image + 0xB8, 0);
        cpu.bus.write_32(image + 0xBC, 0xFFFF_FFFF);

        super::loadall386(&mut cpu, 0).unwrap();
        assert_eq!(cpu.eip, 0x8000);
        assert_eq!(cpu.regs[EAX], 0xCAFE_F00D);
        assert_eq!(cpu.seg(SegReg::Cs).selector, 0x10);
        assert!(cpu.use32());
        assert_eq!(cpu.cycles, -350);
    }
}
