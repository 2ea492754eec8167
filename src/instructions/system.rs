use crate::config::Features;
use crate::cpu::{Cpu, CR0_ET, CR0_PE, CR0_PG, CR0_TS, CR4_DE};
use crate::error::{Fault, Result};
use crate::flags::{CpuFlags, Size};
use crate::segment::{
    Descriptor, DescriptorTable, SegmentCache, SYS_CALL_GATE286, SYS_CALL_GATE386, SYS_LDT, SYS_TASK_GATE,
    SYS_TSS286_AVAIL, SYS_TSS286_BUSY, SYS_TSS386_AVAIL, SYS_TSS386_BUSY,
};

use super::Width;

// CR4 bits this core implements
const CR4_MASK: u32 = 0x1F;

impl Cpu {
    fn require_pmode(&self) -> Result<()> {
        if self.pmode_not_v86() { Ok(()) } else { Err(Fault::InvalidOpcode) }
    }

    /// Reads the descriptor for LAR/LSL/VERR/VERW. A selector outside its
    /// table, or a null one, reports "not accessible" instead of faulting.
    fn probe_descriptor(&mut self, selector: u16) -> Result<Option<Descriptor>> {
        if selector & !3 == 0 {
            return Ok(None);
        }
        let Ok(addr) = self.descriptor_addr(selector, Fault::GeneralProtection) else {
            return Ok(None);
        };
        Ok(Some(Descriptor(self.read_sys_64(addr)?)))
    }

    fn descriptor_visible(&self, selector: u16, desc: &Descriptor) -> bool {
        let rpl = (selector & 3) as u8;
        desc.is_conforming() || (desc.dpl() >= self.cpl() && desc.dpl() >= rpl)
    }

    /// Stores a new CR0, logging mode switches and dropping translations
    /// when paging changes.
    pub fn write_cr0(&mut self, value: u32) -> Result<()> {
        if value & CR0_PG != 0 && value & CR0_PE == 0 {
            return Err(Fault::GeneralProtection(0));
        }
        let old = self.cr0;
        let mut value = value;
        if !self.model.is_486_class() {
            value |= CR0_ET;
        }
        self.cr0 = value;
        if (old ^ value) & CR0_PE != 0 {
            log::debug!("[CPU] {} protected mode", if value & CR0_PE != 0 { "entering" } else { "leaving" });
        }
        if (old ^ value) & CR0_PG != 0 {
            log::debug!("[MMU] paging {}", if value & CR0_PG != 0 { "enabled" } else { "disabled" });
            self.flush_tlb();
        }
        self.update_status();
        Ok(())
    }
}

/// Splits a register-only ModRM byte into (reg, rm). The mod field is
/// ignored, as on hardware.
fn register_operands(cpu: &mut Cpu, fetchdat: u32) -> Result<(usize, usize)> {
    let byte = fetchdat as u8;
    cpu.skip(1)?;
    Ok((((byte >> 3) & 7) as usize, (byte & 7) as usize))
}

// ========================================================================
// 0F 00: SLDT, STR, LLDT, LTR, VERR, VERW
// ========================================================================

pub fn group_0f00<const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    cpu.require_pmode()?;
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    match m.reg {
        0 | 1 => {
            let selector = if m.reg == 0 { cpu.ldt.selector } else { cpu.tr.selector };
            let size = if m.is_reg() && cpu.op32 { Size::Dword } else { Size::Word };
            cpu.write_rm(size, &m, selector as u32)?;
            cpu.clock_rm(2, 3);
            Ok(())
        }
        2 => {
            cpu.check_cpl0()?;
            let selector = cpu.read_rm(Size::Word, &m)? as u16;
            cpu.load_ldt(selector, Fault::GeneralProtection)?;
            cpu.clock(if cpu.model.is_486_class() { 11 } else { 20 });
            Ok(())
        }
        3 => {
            cpu.check_cpl0()?;
            let selector = cpu.read_rm(Size::Word, &m)? as u16;
            load_task_register(cpu, selector)?;
            cpu.clock(if cpu.model.is_486_class() { 20 } else { 23 });
            Ok(())
        }
        4 | 5 => {
            let selector = cpu.read_rm(Size::Word, &m)? as u16;
            let ok = match cpu.probe_descriptor(selector)? {
                Some(desc) if desc.is_segment() && cpu.descriptor_visible(selector, &desc) => {
                    if m.reg == 4 { desc.is_readable() } else { desc.is_writable_data() }
                }
                _ => false,
            };
            cpu.set_cpu_flag(CpuFlags::ZF, ok);
            cpu.clock(if cpu.model.is_486_class() { 11 } else { 10 });
            Ok(())
        }
        _ => Err(Fault::InvalidOpcode),
    }
}

fn load_task_register(cpu: &mut Cpu, selector: u16) -> Result<()> {
    if selector & !3 == 0 {
        return Err(Fault::GeneralProtection(0));
    }
    if selector & 4 != 0 {
        return Err(Fault::GeneralProtection(selector & 0xFFFC));
    }
    let (desc, _) = cpu.read_descriptor(selector, Fault::GeneralProtection)?;
    let kind = desc.system_type();
    if desc.is_segment() || !(kind == SYS_TSS286_AVAIL || kind == SYS_TSS386_AVAIL) {
        return Err(Fault::GeneralProtection(selector & 0xFFFC));
    }
    if !desc.present() {
        return Err(Fault::SegmentNotPresent(selector & 0xFFFC));
    }
    cpu.set_tss_busy(selector, true)?;
    let is386 = cpu.model.is_386_class();
    cpu.tr = SegmentCache::from_descriptor(selector, &Descriptor(desc.0 | 2u64 << 40), is386);
    Ok(())
}

// ========================================================================
// 0F 01: SGDT, SIDT, LGDT, LIDT, SMSW, LMSW, INVLPG
// ========================================================================

pub fn group_0f01<W: Width, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let op32 = W::SIZE == Size::Dword;
    match m.reg {
        0 | 1 => {
            cpu.require_mem(&m)?;
            let table = if m.reg == 0 { cpu.gdt } else { cpu.idt };
            // 16-bit forms store a 24-bit base; the 286 fills the top byte
            let base = match (op32, cpu.model.is_386_class()) {
                (true, _) => table.base,
                (false, true) => table.base & 0x00FF_FFFF,
                (false, false) => table.base | 0xFF00_0000,
            };
            cpu.check_write_access(m.seg, m.offset, 6)?;
            cpu.write_mem_16(m.seg, m.offset, table.limit)?;
            let base_at = cpu.ea_offset(&m, 2);
            cpu.write_mem_32(m.seg, base_at, base)?;
            cpu.clock(if cpu.model.is_486_class() { 10 } else { 9 });
            Ok(())
        }
        2 | 3 => {
            cpu.check_cpl0()?;
            cpu.require_mem(&m)?;
            let limit = cpu.read_mem_16(m.seg, m.offset)?;
            let base_at = cpu.ea_offset(&m, 2);
            let mut base = cpu.read_mem_32(m.seg, base_at)?;
            if !op32 {
                base &= 0x00FF_FFFF;
            }
            let table = DescriptorTable { base, limit };
            if m.reg == 2 {
                cpu.gdt = table;
            } else {
                cpu.idt = table;
            }
            log::trace!("[CPU] {} base={base:08X} limit={limit:04X}", if m.reg == 2 { "LGDT" } else { "LIDT" });
            cpu.clock(11);
            Ok(())
        }
        4 => {
            let size = if m.is_reg() && op32 { Size::Dword } else { Size::Word };
            cpu.write_rm(size, &m, cpu.cr0)?;
            cpu.clock_rm(2, 3);
            Ok(())
        }
        6 => {
            cpu.check_cpl0()?;
            let value = cpu.read_rm(Size::Word, &m)?;
            // PE can be set but not cleared
            let low = (cpu.cr0 & 0x1) | (value & 0xF);
            let cr0 = (cpu.cr0 & !0xF) | low;
            cpu.write_cr0(cr0)?;
            cpu.clock(if cpu.model.is_486_class() { 13 } else { 10 });
            Ok(())
        }
        7 if cpu.model.is_486_class() => {
            cpu.check_cpl0()?;
            cpu.require_mem(&m)?;
            cpu.flush_tlb();
            cpu.clock(12);
            Ok(())
        }
        _ => Err(Fault::InvalidOpcode),
    }
}

// ========================================================================
// LAR, LSL
// ========================================================================

/// 0F 02: LAR r, r/m16
pub fn lar<W: Width, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    cpu.require_pmode()?;
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let selector = cpu.read_rm(Size::Word, &m)? as u16;
    let rights = match cpu.probe_descriptor(selector)? {
        Some(desc) if cpu.descriptor_visible(selector, &desc) => {
            let valid = desc.is_segment()
                || matches!(
                    desc.system_type(),
                    SYS_TSS286_AVAIL
                        | SYS_LDT
                        | SYS_TSS286_BUSY
                        | SYS_CALL_GATE286
                        | SYS_TASK_GATE
                        | SYS_TSS386_AVAIL
                        | SYS_TSS386_BUSY
                        | SYS_CALL_GATE386
                );
            valid.then(|| (desc.0 >> 32) as u32 & 0x00FF_FF00)
        }
        _ => None,
    };
    if let Some(rights) = rights {
        cpu.set_reg_w::<W>(&m, rights);
    }
    cpu.set_cpu_flag(CpuFlags::ZF, rights.is_some());
    cpu.clock(if cpu.model.is_486_class() { 11 } else { 15 });
    Ok(())
}

/// 0F 03: LSL r, r/m16
pub fn lsl<W: Width, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    cpu.require_pmode()?;
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let selector = cpu.read_rm(Size::Word, &m)? as u16;
    let limit = match cpu.probe_descriptor(selector)? {
        Some(desc) if cpu.descriptor_visible(selector, &desc) => {
            let valid = desc.is_segment()
                || matches!(
                    desc.system_type(),
                    SYS_TSS286_AVAIL | SYS_LDT | SYS_TSS286_BUSY | SYS_TSS386_AVAIL | SYS_TSS386_BUSY
                );
            valid.then(|| desc.limit())
        }
        _ => None,
    };
    if let Some(limit) = limit {
        cpu.set_reg_w::<W>(&m, limit);
    }
    cpu.set_cpu_flag(CpuFlags::ZF, limit.is_some());
    cpu.clock(if cpu.model.is_486_class() { 10 } else { 20 });
    Ok(())
}

// ========================================================================
// Cache and TS control
// ========================================================================

/// 0F 06: CLTS
pub fn clts(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    cpu.check_cpl0()?;
    cpu.cr0 &= !CR0_TS;
    cpu.clock(if cpu.model.is_486_class() { 7 } else { 5 });
    Ok(())
}

/// 0F 08/09: INVD, WBINVD. There is no cache to act on.
pub fn invd(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    cpu.check_cpl0()?;
    cpu.clock(if cpu.model.is_486_class() { 4 } else { 1000 });
    Ok(())
}

// ========================================================================
// MOV to and from control, debug and test registers
// ========================================================================

/// 0F 20: MOV r32, CRn
pub fn mov_r_cr(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let (cr, rm) = register_operands(cpu, fetchdat)?;
    cpu.check_cpl0()?;
    let value = match cr {
        0 => cpu.cr0,
        2 => cpu.cr2,
        3 => cpu.cr3,
        4 if cpu.has_feature(Features::CR4) => cpu.cr4,
        _ => return Err(Fault::InvalidOpcode),
    };
    cpu.regs[rm] = value;
    cpu.clock(if cpu.model.is_486_class() { 4 } else { 6 });
    Ok(())
}

/// 0F 22: MOV CRn, r32
pub fn mov_cr_r(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let (cr, rm) = register_operands(cpu, fetchdat)?;
    cpu.check_cpl0()?;
    let value = cpu.regs[rm];
    match cr {
        0 => cpu.write_cr0(value)?,
        2 => cpu.cr2 = value,
        3 => {
            cpu.cr3 = value & 0xFFFF_F018;
            cpu.flush_tlb();
        }
        4 if cpu.has_feature(Features::CR4) => {
            if value & !CR4_MASK != 0 {
                return Err(Fault::GeneralProtection(0));
            }
            cpu.cr4 = value;
            cpu.flush_tlb();
        }
        _ => return Err(Fault::InvalidOpcode),
    }
    cpu.clock(if cpu.model.is_486_class() { 16 } else { 10 });
    Ok(())
}

impl Cpu {
    /// DR4/DR5 alias DR6/DR7 unless CR4.DE is set, where they are reserved.
    fn debug_register_index(&self, dr: usize) -> Result<usize> {
        match dr {
            4 | 5 if self.cr4 & CR4_DE != 0 => Err(Fault::InvalidOpcode),
            4 | 5 => Ok(dr + 2),
            _ => Ok(dr),
        }
    }
}

/// 0F 21: MOV r32, DRn
pub fn mov_r_dr(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let (dr, rm) = register_operands(cpu, fetchdat)?;
    cpu.check_cpl0()?;
    let dr = cpu.debug_register_index(dr)?;
    cpu.regs[rm] = cpu.dr[dr];
    cpu.clock(if cpu.model.is_486_class() { 10 } else { 22 });
    Ok(())
}

/// 0F 23: MOV DRn, r32
pub fn mov_dr_r(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let (dr, rm) = register_operands(cpu, fetchdat)?;
    cpu.check_cpl0()?;
    let dr = cpu.debug_register_index(dr)?;
    cpu.dr[dr] = cpu.regs[rm];
    cpu.clock(if cpu.model.is_486_class() { 11 } else { 22 });
    Ok(())
}

impl Cpu {
    /// TR6/TR7 on the 386, TR3-TR7 on the 486.
    fn test_register_index(&self, tr: usize) -> Result<usize> {
        let lowest = if self.model.is_486_class() { 3 } else { 6 };
        if tr < lowest { Err(Fault::InvalidOpcode) } else { Ok(tr) }
    }
}

/// 0F 24: MOV r32, TRn
pub fn mov_r_tr(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let (tr, rm) = register_operands(cpu, fetchdat)?;
    cpu.check_cpl0()?;
    let tr = cpu.test_register_index(tr)?;
    cpu.regs[rm] = cpu.test_regs[tr];
    cpu.clock(if cpu.model.is_486_class() { 4 } else { 12 });
    Ok(())
}

/// 0F 26: MOV TRn, r32
pub fn mov_tr_r(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let (tr, rm) = register_operands(cpu, fetchdat)?;
    cpu.check_cpl0()?;
    let tr = cpu.test_register_index(tr)?;
    cpu.test_regs[tr] = cpu.regs[rm];
    cpu.clock(if cpu.model.is_486_class() { 4 } else { 12 });
    Ok(())
}
