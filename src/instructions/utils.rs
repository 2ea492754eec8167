use crate::cpu::{Cpu, EBP, EBX, EDI, ESI, ESP};
use crate::error::{Fault, Result};
use crate::flags::Size;
use crate::segment::SegReg;

use super::Width;

/// A decoded ModRM operand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModRm {
    pub mod_: u8,
    pub reg: u8,
    pub rm: u8,
    /// Segment of the memory operand, override applied.
    pub seg: SegReg,
    /// Effective address, already wrapped to the address size.
    pub offset: u32,
}

impl ModRm {
    pub fn is_reg(&self) -> bool {
        self.mod_ == 3
    }

    pub fn reg(&self) -> usize {
        self.reg as usize
    }

    pub fn rm(&self) -> usize {
        self.rm as usize
    }
}

// ========================================================================
// Effective address decoding
// ========================================================================

impl Cpu {
    /// Decodes the ModRM byte at the head of `fetchdat`, consuming it along
    /// with any SIB and displacement bytes, and latches the result in `ea`.
    pub fn decode_modrm<const A32: bool>(&mut self, fetchdat: u32) -> Result<ModRm> {
        let byte = fetchdat as u8;
        self.skip(1)?;
        let mut m = ModRm {
            mod_: byte >> 6,
            reg: (byte >> 3) & 7,
            rm: byte & 7,
            seg: SegReg::Ds,
            offset: 0,
        };
        if m.mod_ != 3 {
            let (default_seg, offset) = if A32 {
                self.ea_32(m.mod_, m.rm)?
            } else {
                self.ea_16(m.mod_, m.rm)?
            };
            m.seg = self.seg_override.unwrap_or(default_seg);
            m.offset = offset;
        }
        self.ea = m;
        Ok(m)
    }

    fn displacement(&mut self, mod_: u8, wide: bool) -> Result<u32> {
        Ok(match mod_ {
            1 => self.fetch_u8()? as i8 as i32 as u32,
            2 if wide => self.fetch_u32()?,
            2 => self.fetch_u16()? as i16 as i32 as u32,
            _ => 0,
        })
    }

    fn ea_16(&mut self, mod_: u8, rm: u8) -> Result<(SegReg, u32)> {
        if mod_ == 0 && rm == 6 {
            return Ok((SegReg::Ds, self.fetch_u16()? as u32));
        }
        let r = |cpu: &Cpu, n: usize| cpu.regs[n] & 0xFFFF;
        let (seg, base) = match rm {
            0 => (SegReg::Ds, r(self, EBX) + r(self, ESI)),
            1 => (SegReg::Ds, r(self, EBX) + r(self, EDI)),
            2 => (SegReg::Ss, r(self, EBP) + r(self, ESI)),
            3 => (SegReg::Ss, r(self, EBP) + r(self, EDI)),
            4 => (SegReg::Ds, r(self, ESI)),
            5 => (SegReg::Ds, r(self, EDI)),
            6 => (SegReg::Ss, r(self, EBP)),
            _ => (SegReg::Ds, r(self, EBX)),
        };
        let disp = self.displacement(mod_, false)?;
        Ok((seg, base.wrapping_add(disp) & 0xFFFF))
    }

    fn ea_32(&mut self, mod_: u8, rm: u8) -> Result<(SegReg, u32)> {
        let (seg, base) = if rm == 4 {
            let sib = self.fetch_u8()?;
            let scale = sib >> 6;
            let index = ((sib >> 3) & 7) as usize;
            let base_reg = (sib & 7) as usize;
            let (seg, base) = if base_reg == EBP && mod_ == 0 {
                (SegReg::Ds, self.fetch_u32()?)
            } else if base_reg == ESP || base_reg == EBP {
                (SegReg::Ss, self.regs[base_reg])
            } else {
                (SegReg::Ds, self.regs[base_reg])
            };
            let scaled = if index == ESP { 0 } else { self.regs[index] << scale };
            (seg, base.wrapping_add(scaled))
        } else if rm == 5 && mod_ == 0 {
            return Ok((SegReg::Ds, self.fetch_u32()?));
        } else if rm as usize == EBP {
            (SegReg::Ss, self.regs[EBP])
        } else {
            (SegReg::Ds, self.regs[rm as usize])
        };
        let disp = self.displacement(mod_, true)?;
        Ok((seg, base.wrapping_add(disp)))
    }

    // ====================================================================
    // Operand access
    // ====================================================================

    pub fn read_rm(&mut self, size: Size, m: &ModRm) -> Result<u32> {
        if m.is_reg() {
            Ok(self.get_reg(size, m.rm()))
        } else {
            self.read_mem(size, m.seg, m.offset)
        }
    }

    pub fn write_rm(&mut self, size: Size, m: &ModRm, value: u32) -> Result<()> {
        if m.is_reg() {
            self.set_reg(size, m.rm(), value);
            Ok(())
        } else {
            self.write_mem(size, m.seg, m.offset, value)
        }
    }

    /// Reads the destination of a read-modify-write after proving the
    /// write half cannot fault.
    pub fn read_rm_for_write(&mut self, size: Size, m: &ModRm) -> Result<u32> {
        if !m.is_reg() {
            self.check_write_access(m.seg, m.offset, size.bytes())?;
        }
        self.read_rm(size, m)
    }

    pub fn read_rm_w<W: Width>(&mut self, m: &ModRm) -> Result<u32> {
        self.read_rm(W::SIZE, m)
    }

    pub fn write_rm_w<W: Width>(&mut self, m: &ModRm, value: u32) -> Result<()> {
        self.write_rm(W::SIZE, m, value)
    }

    /// Register named by the `reg` field, at the handler's width.
    pub fn reg_w<W: Width>(&self, m: &ModRm) -> u32 {
        self.get_reg(W::SIZE, m.reg())
    }

    pub fn set_reg_w<W: Width>(&mut self, m: &ModRm, value: u32) {
        self.set_reg(W::SIZE, m.reg(), value)
    }

    /// Memory-only operand forms (LEA, LDS, BOUND, LGDT...) reject mod 3.
    pub fn require_mem(&self, m: &ModRm) -> Result<()> {
        if m.is_reg() { Err(Fault::InvalidOpcode) } else { Ok(()) }
    }

    /// Address `delta` bytes past the decoded operand, wrapped to the
    /// address size of the instruction.
    pub fn ea_offset(&self, m: &ModRm, delta: u32) -> u32 {
        let offset = m.offset.wrapping_add(delta);
        if self.a32 { offset } else { offset & 0xFFFF }
    }

    /// Cycle charge for an operand of `size`: register form, or the 16/32-bit
    /// memory form.
    pub fn clock_ea(&mut self, size: Size, rr: i32, mem: i32, mem32: i32) {
        let cost = match (self.ea.is_reg(), size) {
            (true, _) => rr,
            (false, Size::Dword) => mem32,
            (false, _) => mem,
        };
        self.clock(cost);
    }
}
