use crate::cpu::{Cpu, CR0_PG, CR0_WP, CR4_PSE, ESP};
use crate::error::{Fault, Result};
use crate::flags::Size;
use crate::segment::SegReg;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

// Page table entry bits
const PTE_PRESENT: u32 = 1 << 0;
const PTE_RW: u32 = 1 << 1;
const PTE_USER: u32 = 1 << 2;
const PTE_ACCESSED: u32 = 1 << 5;
const PTE_DIRTY: u32 = 1 << 6;
const PDE_LARGE: u32 = 1 << 7;

impl Cpu {
    fn limit_fault(seg: SegReg) -> Fault {
        if seg == SegReg::Ss {
            Fault::StackFault(0)
        } else {
            Fault::GeneralProtection(0)
        }
    }

    /// Segment-level read check: null selector, execute-only code, limit.
    pub fn check_read(&self, seg: SegReg, offset: u32, size: u32) -> Result<()> {
        let cache = &self.segs[seg as usize];
        if self.pmode_not_v86() && (!cache.present() || !cache.is_readable()) {
            return Err(Self::limit_fault(seg));
        }
        if !cache.contains(offset, size) {
            return Err(Self::limit_fault(seg));
        }
        Ok(())
    }

    /// Segment-level write check: writable data segment and limit.
    pub fn check_write(&self, seg: SegReg, offset: u32, size: u32) -> Result<()> {
        let cache = &self.segs[seg as usize];
        if self.pmode_not_v86() && (!cache.present() || !cache.is_writable()) {
            return Err(Self::limit_fault(seg));
        }
        if !cache.contains(offset, size) {
            return Err(Self::limit_fault(seg));
        }
        Ok(())
    }

    // ====================================================================
    // Paging
    // ====================================================================

    /// Translates a linear address, updating accessed/dirty bits. Raises #PF
    /// with the architectural error code on a miss or protection violation.
    pub fn translate(&mut self, linear: u32, access: Access) -> Result<u32> {
        if self.cr0 & CR0_PG == 0 {
            return Ok(linear);
        }
        let user = self.cpl() == 3 && !self.cpl_override;
        let write = access == Access::Write;
        let fault = |present: bool| Fault::PageFault {
            addr: linear,
            code: present as u16 | ((write as u16) << 1) | ((user as u16) << 2),
        };
        let wp = self.cr0 & CR0_WP != 0;

        let pde_addr = (self.cr3 & !0xFFF).wrapping_add((linear >> 22) << 2);
        let pde = self.bus.read_32(pde_addr as usize);
        if pde & PTE_PRESENT == 0 {
            return Err(fault(false));
        }

        if pde & PDE_LARGE != 0 && self.cr4 & CR4_PSE != 0 {
            if user && pde & PTE_USER == 0 {
                return Err(fault(true));
            }
            if write && pde & PTE_RW == 0 && (user || wp) {
                return Err(fault(true));
            }
            let dirty = if write { PTE_DIRTY } else { 0 };
            self.bus.write_32(pde_addr as usize, pde | PTE_ACCESSED | dirty);
            return Ok((pde & 0xFFC0_0000) | (linear & 0x003F_FFFF));
        }

        let pte_addr = (pde & !0xFFF).wrapping_add(((linear >> 12) & 0x3FF) << 2);
        let pte = self.bus.read_32(pte_addr as usize);
        if pte & PTE_PRESENT == 0 {
            return Err(fault(false));
        }
        let user_ok = pde & pte & PTE_USER != 0;
        let write_ok = pde & pte & PTE_RW != 0;
        if user && !user_ok {
            return Err(fault(true));
        }
        if write && !write_ok && (user || wp) {
            return Err(fault(true));
        }
        if pde & PTE_ACCESSED == 0 {
            self.bus.write_32(pde_addr as usize, pde | PTE_ACCESSED);
        }
        let dirty = if write { PTE_DIRTY } else { 0 };
        if pte & (PTE_ACCESSED | dirty) != PTE_ACCESSED | dirty {
            self.bus.write_32(pte_addr as usize, pte | PTE_ACCESSED | dirty);
        }
        Ok((pte & !0xFFF) | (linear & 0xFFF))
    }

    /// Side-effect free translation for the fetch peek and the tracer.
    pub fn probe(&self, linear: u32) -> Option<u32> {
        if self.cr0 & CR0_PG == 0 {
            return Some(linear);
        }
        let pde = self.bus.read_32(((self.cr3 & !0xFFF) + ((linear >> 22) << 2)) as usize);
        if pde & PTE_PRESENT == 0 {
            return None;
        }
        if pde & PDE_LARGE != 0 && self.cr4 & CR4_PSE != 0 {
            return Some((pde & 0xFFC0_0000) | (linear & 0x003F_FFFF));
        }
        let pte = self.bus.read_32(((pde & !0xFFF) + (((linear >> 12) & 0x3FF) << 2)) as usize);
        (pte & PTE_PRESENT != 0).then_some((pte & !0xFFF) | (linear & 0xFFF))
    }

    /// Called after CR3 writes and INVLPG. Translations are walked on every
    /// access, so there is nothing cached to drop.
    pub fn flush_tlb(&mut self) {
        log::trace!("[MMU] translation flush, CR3={:08X}", self.cr3);
    }

    // ====================================================================
    // Linear accesses
    // ====================================================================

    pub fn read_linear(&mut self, linear: u32, size: u32, access: Access) -> Result<u64> {
        if (linear & 0xFFF) + size <= 0x1000 {
            let phys = self.translate(linear, access)? as usize;
            return Ok(match size {
                1 => self.bus.read_8(phys) as u64,
                2 => self.bus.read_16(phys) as u64,
                4 => self.bus.read_32(phys) as u64,
                _ => self.bus.read_64(phys),
            });
        }
        // Page-crossing access, byte by byte
        let mut value = 0u64;
        for i in 0..size {
            let phys = self.translate(linear.wrapping_add(i), access)? as usize;
            value |= (self.bus.read_8(phys) as u64) << (i * 8);
        }
        Ok(value)
    }

    pub fn write_linear(&mut self, linear: u32, size: u32, value: u64) -> Result<()> {
        if (linear & 0xFFF) + size <= 0x1000 {
            let phys = self.translate(linear, Access::Write)? as usize;
            match size {
                1 => self.bus.write_8(phys, value as u8),
                2 => self.bus.write_16(phys, value as u16),
                4 => self.bus.write_32(phys, value as u32),
                _ => self.bus.write_64(phys, value),
            }
            return Ok(());
        }
        // Both pages must be writable before any byte lands
        let first = self.translate(linear, Access::Write)?;
        let last = self.translate(linear.wrapping_add(size - 1), Access::Write)?;
        let split = 0x1000 - (linear & 0xFFF);
        for i in 0..size {
            let phys = if i < split {
                first + i
            } else {
                (last & !0xFFF) + (i - split)
            };
            self.bus.write_8(phys as usize, (value >> (i * 8)) as u8);
        }
        Ok(())
    }

    // System structure accesses (descriptor tables, TSS, IDT) bypass the
    // CPL page check.
    pub(crate) fn with_cpl_override<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let saved = self.cpl_override;
        self.cpl_override = true;
        let result = f(self);
        self.cpl_override = saved;
        result
    }

    pub fn read_sys_8(&mut self, linear: u32) -> Result<u8> {
        self.with_cpl_override(|cpu| cpu.read_linear(linear, 1, Access::Read).map(|v| v as u8))
    }

    pub fn read_sys_16(&mut self, linear: u32) -> Result<u16> {
        self.with_cpl_override(|cpu| cpu.read_linear(linear, 2, Access::Read).map(|v| v as u16))
    }

    pub fn read_sys_32(&mut self, linear: u32) -> Result<u32> {
        self.with_cpl_override(|cpu| cpu.read_linear(linear, 4, Access::Read).map(|v| v as u32))
    }

    pub fn read_sys_64(&mut self, linear: u32) -> Result<u64> {
        self.with_cpl_override(|cpu| cpu.read_linear(linear, 8, Access::Read))
    }

    pub fn write_sys_8(&mut self, linear: u32, value: u8) -> Result<()> {
        self.with_cpl_override(|cpu| cpu.write_linear(linear, 1, value as u64))
    }

    pub fn write_sys_16(&mut self, linear: u32, value: u16) -> Result<()> {
        self.with_cpl_override(|cpu| cpu.write_linear(linear, 2, value as u64))
    }

    pub fn write_sys_32(&mut self, linear: u32, value: u32) -> Result<()> {
        self.with_cpl_override(|cpu| cpu.write_linear(linear, 4, value as u64))
    }

    // ====================================================================
    // Segmented accesses
    // ====================================================================

    fn seg_linear(&self, seg: SegReg, offset: u32) -> u32 {
        self.segs[seg as usize].base.wrapping_add(offset)
    }

    pub fn read_mem(&mut self, size: Size, seg: SegReg, offset: u32) -> Result<u32> {
        self.check_read(seg, offset, size.bytes())?;
        let linear = self.seg_linear(seg, offset);
        Ok(self.read_linear(linear, size.bytes(), Access::Read)? as u32)
    }

    pub fn write_mem(&mut self, size: Size, seg: SegReg, offset: u32, value: u32) -> Result<()> {
        self.check_write(seg, offset, size.bytes())?;
        let linear = self.seg_linear(seg, offset);
        self.write_linear(linear, size.bytes(), value as u64)
    }

    pub fn read_mem_8(&mut self, seg: SegReg, offset: u32) -> Result<u8> {
        self.read_mem(Size::Byte, seg, offset).map(|v| v as u8)
    }

    pub fn read_mem_16(&mut self, seg: SegReg, offset: u32) -> Result<u16> {
        self.read_mem(Size::Word, seg, offset).map(|v| v as u16)
    }

    pub fn read_mem_32(&mut self, seg: SegReg, offset: u32) -> Result<u32> {
        self.read_mem(Size::Dword, seg, offset)
    }

    pub fn read_mem_64(&mut self, seg: SegReg, offset: u32) -> Result<u64> {
        self.check_read(seg, offset, 8)?;
        let linear = self.seg_linear(seg, offset);
        self.read_linear(linear, 8, Access::Read)
    }

    pub fn write_mem_8(&mut self, seg: SegReg, offset: u32, value: u8) -> Result<()> {
        self.write_mem(Size::Byte, seg, offset, value as u32)
    }

    pub fn write_mem_16(&mut self, seg: SegReg, offset: u32, value: u16) -> Result<()> {
        self.write_mem(Size::Word, seg, offset, value as u32)
    }

    pub fn write_mem_32(&mut self, seg: SegReg, offset: u32, value: u32) -> Result<()> {
        self.write_mem(Size::Dword, seg, offset, value)
    }

    pub fn write_mem_64(&mut self, seg: SegReg, offset: u32, value: u64) -> Result<()> {
        self.check_write(seg, offset, 8)?;
        let linear = self.seg_linear(seg, offset);
        self.write_linear(linear, 8, value)
    }

    /// Probes that a read-modify-write destination is writable, so the read
    /// half never runs against a location the write half would fault on.
    pub fn check_write_access(&mut self, seg: SegReg, offset: u32, size: u32) -> Result<()> {
        self.check_write(seg, offset, size)?;
        let linear = self.seg_linear(seg, offset);
        self.translate(linear, Access::Write)?;
        if (linear & 0xFFF) + size > 0x1000 {
            self.translate(linear.wrapping_add(size - 1), Access::Write)?;
        }
        Ok(())
    }

    // ====================================================================
    // Instruction fetch
    // ====================================================================

    fn fetch(&mut self, size: u32) -> Result<u32> {
        let eip = self.eip;
        let cs = self.segs[SegReg::Cs as usize];
        let next = if self.use32() { eip.wrapping_add(size) } else { eip.wrapping_add(size) & 0xFFFF };
        let max_len = if self.model.is_386_class() { 15 } else { 10 };
        if next.wrapping_sub(self.oldpc) > max_len {
            return Err(Fault::GeneralProtection(0));
        }
        if !cs.contains(eip, size) {
            return Err(Fault::GeneralProtection(0));
        }
        let value = self.read_linear(cs.base.wrapping_add(eip), size, Access::Execute)?;
        self.eip = next;
        Ok(value as u32)
    }

    pub fn fetch_u8(&mut self) -> Result<u8> {
        self.fetch(1).map(|v| v as u8)
    }

    pub fn fetch_u16(&mut self) -> Result<u16> {
        self.fetch(2).map(|v| v as u16)
    }

    pub fn fetch_u32(&mut self) -> Result<u32> {
        self.fetch(4)
    }

    /// Immediate of the current operand size, zero-extended.
    pub fn fetch_imm(&mut self, size: Size) -> Result<u32> {
        match size {
            Size::Byte => self.fetch_u8().map(|v| v as u32),
            Size::Word => self.fetch_u16().map(|v| v as u32),
            Size::Dword => self.fetch_u32(),
        }
    }

    /// Consumes bytes already seen through the fetch word.
    pub fn skip(&mut self, count: u32) -> Result<()> {
        self.fetch(count).map(|_| ())
    }

    /// The four bytes at CS:EIP without faulting; bytes that cannot be
    /// read come back as zero and fault when actually consumed.
    pub fn peek_fetchdat(&self) -> u32 {
        let cs = &self.segs[SegReg::Cs as usize];
        let mut value = 0;
        for i in 0..4 {
            let linear = cs.base.wrapping_add(self.eip.wrapping_add(i));
            if let Some(phys) = self.probe(linear) {
                value |= (self.bus.read_8(phys as usize) as u32) << (i * 8);
            }
        }
        value
    }

    // ====================================================================
    // Stack
    // ====================================================================

    fn stack_ptr(&self) -> u32 {
        if self.stack32() { self.regs[ESP] } else { self.regs[ESP] & 0xFFFF }
    }

    fn set_stack_ptr(&mut self, value: u32) {
        if self.stack32() {
            self.regs[ESP] = value;
        } else {
            self.set_reg16(ESP, value as u16);
        }
    }

    /// Address `delta` bytes from the top of stack under the stack size.
    pub fn stack_offset(&self, delta: u32) -> u32 {
        let sp = self.stack_ptr().wrapping_add(delta);
        if self.stack32() { sp } else { sp & 0xFFFF }
    }

    pub fn push(&mut self, size: Size, value: u32) -> Result<()> {
        let sp = self.stack_offset(size.bytes().wrapping_neg());
        self.write_mem(size, SegReg::Ss, sp, value)?;
        self.set_stack_ptr(sp);
        Ok(())
    }

    pub fn pop(&mut self, size: Size) -> Result<u32> {
        let sp = self.stack_ptr();
        let value = self.read_mem(size, SegReg::Ss, sp)?;
        self.set_stack_ptr(self.stack_offset(size.bytes()));
        Ok(value)
    }

    pub fn push16(&mut self, value: u16) -> Result<()> {
        self.push(Size::Word, value as u32)
    }

    pub fn push32(&mut self, value: u32) -> Result<()> {
        self.push(Size::Dword, value)
    }

    pub fn pop16(&mut self) -> Result<u16> {
        self.pop(Size::Word).map(|v| v as u16)
    }

    pub fn pop32(&mut self) -> Result<u32> {
        self.pop(Size::Dword)
    }

    /// Reads the stack `delta` bytes above the top without popping.
    pub fn peek_stack(&mut self, size: Size, delta: u32) -> Result<u32> {
        let sp = self.stack_offset(delta);
        self.read_mem(size, SegReg::Ss, sp)
    }

    pub fn adjust_sp(&mut self, delta: u32) {
        let sp = self.stack_offset(delta);
        self.set_stack_ptr(sp);
    }

    // ====================================================================
    // Port I/O
    // ====================================================================

    /// In protected mode with CPL > IOPL, or in V86 mode, every byte of the
    /// access must be clear in the TSS I/O permission bitmap.
    pub fn check_io_perm(&mut self, port: u16, size: u32) -> Result<()> {
        let pmode = self.protected_mode();
        if !pmode || (!self.v86_mode() && self.cpl() <= self.iopl()) {
            return Ok(());
        }
        let tss_32 = self.tr.access & 0x08 != 0;
        if !tss_32 || self.tr.limit < 0x67 {
            return Err(Fault::GeneralProtection(0));
        }
        let map_base = self.read_sys_16(self.tr.base.wrapping_add(0x66))? as u32;
        let byte_offset = map_base + (port as u32 >> 3);
        if byte_offset + 1 > self.tr.limit {
            return Err(Fault::GeneralProtection(0));
        }
        let bits = self.read_sys_16(self.tr.base.wrapping_add(byte_offset))? as u32;
        let mask = ((1u32 << size) - 1) << (port & 7);
        if bits & mask != 0 {
            return Err(Fault::GeneralProtection(0));
        }
        Ok(())
    }

    pub fn io_in(&mut self, size: Size, port: u16) -> Result<u32> {
        self.check_io_perm(port, size.bytes())?;
        if size == Size::Byte {
            if let Some(value) = self.cyrix_port_read(port) {
                return Ok(value as u32);
            }
        }
        Ok(match size {
            Size::Byte => self.bus.io_read_8(port) as u32,
            Size::Word => self.bus.io_read_16(port) as u32,
            Size::Dword => self.bus.io_read_32(port),
        })
    }

    pub fn io_out(&mut self, size: Size, port: u16, value: u32) -> Result<()> {
        self.check_io_perm(port, size.bytes())?;
        if size == Size::Byte && self.cyrix_port_write(port, value as u8) {
            return Ok(());
        }
        match size {
            Size::Byte => self.bus.io_write_8(port, value as u8),
            Size::Word => self.bus.io_write_16(port, value as u16),
            Size::Dword => self.bus.io_write_32(port, value),
        }
        Ok(())
    }

    /// Privileged instructions (CLI/STI/IN/OUT class) in protected mode
    /// require CPL <= IOPL; V86 code requires IOPL 3.
    pub fn check_iopl(&self) -> Result<()> {
        let denied = if self.v86_mode() {
            self.iopl() != 3
        } else {
            self.protected_mode() && self.cpl() > self.iopl()
        };
        if denied { Err(Fault::GeneralProtection(0)) } else { Ok(()) }
    }

    /// CPL 0 instructions: #GP(0) outside ring 0 in protected or V86 mode.
    pub fn check_cpl0(&self) -> Result<()> {
        if self.protected_mode() && (self.v86_mode() || self.cpl() > 0) {
            Err(Fault::GeneralProtection(0))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{CpuConfig, CpuModel};
    use crate::cpu::{Cpu, CR0_PE, CR0_PG};
    use crate::error::Fault;
    use crate::segment::SegReg;

    use super::Access;

    fn cpu() -> Cpu {
        let mut cpu = Cpu::new(CpuConfig::new(CpuModel::Pentium));
        cpu.load_seg(SegReg::Ds, 0).unwrap();
        cpu
    }

    #[test]
    fn real_mode_limit_faults() {
        let mut cpu = cpu();
        assert_eq!(cpu.read_mem_16(SegReg::Ds, 0xFFFF), Err(Fault::GeneralProtection(0)));
        assert_eq!(cpu.read_mem_16(SegReg::Ss, 0xFFFF), Err(Fault::StackFault(0)));
        assert!(cpu.read_mem_8(SegReg::Ds, 0xFFFF).is_ok());
    }

    #[test]
    fn page_walk_sets_accessed_and_dirty() {
        let mut cpu = cpu();
        // Page directory at 0x1000, page table at 0x2000, map 0x400000 -> 0x5000
        cpu.bus.write_32(0x1000 + 4, 0x2000 | 0x7);
        cpu.bus.write_32(0x2000, 0x5000 | 0x7);
        cpu.cr3 = 0x1000;
        cpu.cr0 |= CR0_PE | CR0_PG;
        assert_eq!(cpu.translate(0x0040_0123, Access::Write), Ok(0x5123));
        assert_eq!(cpu.bus.read_32(0x2000) & 0x60, 0x60);
        assert_eq!(
            cpu.translate(0x0080_0000, Access::Read),
            Err(Fault::PageFault { addr: 0x0080_0000, code: 0 })
        );
    }
}
