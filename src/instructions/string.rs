use crate::cpu::{Cpu, EAX, EDI, EDX, ESI};
use crate::error::Result;
use crate::flags::Size;
use crate::segment::SegReg;

use super::Width;

// String operation codes, used as const parameters of the handlers
pub const MOVS: u8 = 0;
pub const STOS: u8 = 1;
pub const LODS: u8 = 2;
pub const CMPS: u8 = 3;
pub const SCAS: u8 = 4;
pub const INS: u8 = 5;
pub const OUTS: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringOp {
    Movs,
    Stos,
    Lods,
    Cmps,
    Scas,
    Ins,
    Outs,
}

impl StringOp {
    pub const fn from_code(code: u8) -> StringOp {
        match code {
            MOVS => StringOp::Movs,
            STOS => StringOp::Stos,
            LODS => StringOp::Lods,
            CMPS => StringOp::Cmps,
            SCAS => StringOp::Scas,
            INS => StringOp::Ins,
            _ => StringOp::Outs,
        }
    }

    /// CMPS and SCAS also stop on the REPE/REPNE zero-flag condition.
    pub fn is_conditional(self) -> bool {
        matches!(self, StringOp::Cmps | StringOp::Scas)
    }

    /// Cost of one element under a REP prefix.
    pub fn iteration_cost(self, is486: bool) -> i32 {
        match (self, is486) {
            (StringOp::Movs, true) => 3,
            (StringOp::Movs, false) => 4,
            (StringOp::Stos | StringOp::Lods, true) => 4,
            (StringOp::Stos | StringOp::Lods, false) => 5,
            (StringOp::Cmps, true) => 7,
            (StringOp::Cmps, false) => 9,
            (StringOp::Scas, true) => 5,
            (StringOp::Scas, false) => 8,
            (StringOp::Ins, _) => 15,
            (StringOp::Outs, _) => 14,
        }
    }

    /// Cost of the unprefixed form.
    pub fn single_cost(self, is486: bool) -> i32 {
        match self {
            StringOp::Movs => 7,
            StringOp::Stos => 4,
            StringOp::Lods => 5,
            StringOp::Cmps if is486 => 8,
            StringOp::Cmps => 10,
            StringOp::Scas => 7,
            StringOp::Ins => 15,
            StringOp::Outs => 14,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StringOp::Movs => "MOVS",
            StringOp::Stos => "STOS",
            StringOp::Lods => "LODS",
            StringOp::Cmps => "CMPS",
            StringOp::Scas => "SCAS",
            StringOp::Ins => "INS",
            StringOp::Outs => "OUTS",
        }
    }
}

impl Cpu {
    fn step_index(&mut self, reg: usize, size: Size) {
        let delta = if self.dflag() { size.bytes().wrapping_neg() } else { size.bytes() };
        let value = self.get_addr_reg(reg).wrapping_add(delta);
        self.set_addr_reg(reg, value);
    }

    /// Moves, stores, loads, compares or scans one element and steps the
    /// index registers by the element width in the direction of DF. The
    /// count register is left alone. Nothing is committed if an access faults.
    ///
    /// `seg` is the source segment (DS or the override); the destination is
    /// always ES.
    pub fn string_element(&mut self, op: StringOp, size: Size, seg: SegReg) -> Result<()> {
        let si = self.get_addr_reg(ESI);
        let di = self.get_addr_reg(EDI);
        match op {
            StringOp::Movs => {
                self.check_write_access(SegReg::Es, di, size.bytes())?;
                let value = self.read_mem(size, seg, si)?;
                self.write_mem(size, SegReg::Es, di, value)?;
                self.step_index(ESI, size);
                self.step_index(EDI, size);
            }
            StringOp::Stos => {
                let value = self.get_reg(size, EAX);
                self.write_mem(size, SegReg::Es, di, value)?;
                self.step_index(EDI, size);
            }
            StringOp::Lods => {
                let value = self.read_mem(size, seg, si)?;
                self.set_reg(size, EAX, value);
                self.step_index(ESI, size);
            }
            StringOp::Cmps => {
                let src = self.read_mem(size, seg, si)?;
                let dest = self.read_mem(size, SegReg::Es, di)?;
                self.alu_sub(size, src, dest);
                self.step_index(ESI, size);
                self.step_index(EDI, size);
            }
            StringOp::Scas => {
                let dest = self.read_mem(size, SegReg::Es, di)?;
                let acc = self.get_reg(size, EAX);
                self.alu_sub(size, acc, dest);
                self.step_index(EDI, size);
            }
            StringOp::Ins => {
                self.check_write_access(SegReg::Es, di, size.bytes())?;
                let port = self.get_reg16(EDX);
                let value = self.io_in(size, port)?;
                self.write_mem(size, SegReg::Es, di, value)?;
                self.step_index(EDI, size);
            }
            StringOp::Outs => {
                let value = self.read_mem(size, seg, si)?;
                let port = self.get_reg16(EDX);
                self.io_out(size, port, value)?;
                self.step_index(ESI, size);
            }
        }
        Ok(())
    }
}

/// A4-A7, AA-AF, 6C-6F without a REP prefix: one element.
pub fn string_once<W: Width, const OP: u8>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let op = StringOp::from_code(OP);
    let seg = cpu.data_seg();
    cpu.string_element(op, W::SIZE, seg)?;
    cpu.clock(op.single_cost(cpu.model.is_486_class()));
    Ok(())
}
