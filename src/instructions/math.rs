use crate::cpu::{Cpu, AH, AL, EAX, EDX};
use crate::error::{Fault, Result};
use crate::flags::{parity, CpuFlags, Size};

use super::{Byte, Width};

// Group 1 operation numbers, in ModRM reg order
pub const ADD: u8 = 0;
pub const OR: u8 = 1;
pub const ADC: u8 = 2;
pub const SBB: u8 = 3;
pub const AND: u8 = 4;
pub const SUB: u8 = 5;
pub const XOR: u8 = 6;
pub const CMP: u8 = 7;

impl Cpu {
    /// Runs group-1 operation `op` and stages its flags. CMP returns the
    /// difference but callers do not store it.
    pub fn alu_op(&mut self, op: u8, size: Size, dest: u32, src: u32) -> u32 {
        match op & 7 {
            ADD => self.alu_add(size, dest, src),
            OR => self.alu_or(size, dest, src),
            ADC => self.alu_adc(size, dest, src),
            SBB => self.alu_sbb(size, dest, src),
            AND => self.alu_and(size, dest, src),
            SUB => self.alu_sub(size, dest, src),
            XOR => self.alu_xor(size, dest, src),
            _ => self.alu_sub(size, dest, src),
        }
    }

    /// Eagerly sets ZF, SF and PF from a byte result, keeping the other flags.
    fn store_szp_8(&mut self, value: u8) {
        self.flags_rebuild();
        self.flags.set(CpuFlags::ZF, value == 0);
        self.flags.set(CpuFlags::SF, value & 0x80 != 0);
        self.flags.set(CpuFlags::PF, parity(value as u32));
    }

    fn mul_cost(&self, size: Size, signed: bool) -> i32 {
        let is486 = self.model.is_486_class();
        match (size, signed) {
            (Size::Byte, false) => if is486 { 13 } else { 9 },
            (Size::Word, false) => if is486 { 13 } else { 12 },
            (Size::Dword, false) => if is486 { 13 } else { 17 },
            (Size::Byte, true) => if is486 { 13 } else { 9 },
            (Size::Word, true) => if is486 { 14 } else { 12 },
            (Size::Dword, true) => if is486 { 14 } else { 17 },
        }
    }

    fn div_cost(&self, size: Size, signed: bool) -> i32 {
        let is486 = self.model.is_486_class();
        match (size, signed) {
            (Size::Byte, false) => if is486 { 16 } else { 14 },
            (Size::Word, false) => if is486 { 24 } else { 22 },
            (Size::Dword, false) => if is486 { 40 } else { 38 },
            (Size::Byte, true) => 19,
            (Size::Word, true) => 27,
            (Size::Dword, true) => 43,
        }
    }

    /// Unsigned multiply of the accumulator; CF and OF report a non-zero
    /// upper half.
    pub fn mul_acc(&mut self, size: Size, src: u32) {
        let acc = self.get_reg(size, EAX) as u64;
        let product = acc * src as u64;
        let high = match size {
            Size::Byte => {
                self.set_reg16(EAX, product as u16);
                (product >> 8) & 0xFF
            }
            Size::Word => {
                self.set_reg16(EAX, product as u16);
                self.set_reg16(EDX, (product >> 16) as u16);
                (product >> 16) & 0xFFFF
            }
            Size::Dword => {
                self.regs[EAX] = product as u32;
                self.regs[EDX] = (product >> 32) as u32;
                product >> 32
            }
        };
        let low = product as u32 & size.mask();
        self.set_znp(size, low);
        self.flags_rebuild();
        self.flags.set(CpuFlags::CF | CpuFlags::OF, high != 0);
    }

    /// Signed multiply of the accumulator; CF and OF report a product that
    /// does not fit the low half.
    pub fn imul_acc(&mut self, size: Size, src: u32) {
        let acc = size.sign_extend(self.get_reg(size, EAX)) as i32 as i64;
        let product = acc * size.sign_extend(src) as i32 as i64;
        let fits = match size {
            Size::Byte => {
                self.set_reg16(EAX, product as u16);
                product == product as i8 as i64
            }
            Size::Word => {
                self.set_reg16(EAX, product as u16);
                self.set_reg16(EDX, (product >> 16) as u16);
                product == product as i16 as i64
            }
            Size::Dword => {
                self.regs[EAX] = product as u32;
                self.regs[EDX] = (product >> 32) as u32;
                product == product as i32 as i64
            }
        };
        self.set_znp(size, product as u32 & size.mask());
        self.flags_rebuild();
        self.flags.set(CpuFlags::CF | CpuFlags::OF, !fits);
    }

    /// Truncating signed multiply used by the two- and three-operand IMUL.
    pub fn imul_trunc(&mut self, size: Size, a: u32, b: u32) -> u32 {
        let product = size.sign_extend(a) as i32 as i64 * size.sign_extend(b) as i32 as i64;
        let result = product as u32 & size.mask();
        let fits = size.sign_extend(result) as i32 as i64 == product;
        self.set_znp(size, result);
        self.flags_rebuild();
        self.flags.set(CpuFlags::CF | CpuFlags::OF, !fits);
        result
    }

    /// Unsigned divide of AX, DX:AX or EDX:EAX. Registers change only when
    /// the quotient fits.
    pub fn div_acc(&mut self, size: Size, divisor: u32) -> Result<()> {
        if divisor == 0 {
            return Err(Fault::DivideError);
        }
        let divisor = divisor as u64;
        match size {
            Size::Byte => {
                let dividend = self.get_reg16(EAX) as u64;
                let quotient = dividend / divisor;
                if quotient > 0xFF {
                    return Err(Fault::DivideError);
                }
                self.set_reg8(AL, quotient as u8);
                self.set_reg8(AH, (dividend % divisor) as u8);
            }
            Size::Word => {
                let dividend = (self.get_reg16(EDX) as u64) << 16 | self.get_reg16(EAX) as u64;
                let quotient = dividend / divisor;
                if quotient > 0xFFFF {
                    return Err(Fault::DivideError);
                }
                self.set_reg16(EAX, quotient as u16);
                self.set_reg16(EDX, (dividend % divisor) as u16);
            }
            Size::Dword => {
                let dividend = (self.regs[EDX] as u64) << 32 | self.regs[EAX] as u64;
                let quotient = dividend / divisor;
                if quotient > 0xFFFF_FFFF {
                    return Err(Fault::DivideError);
                }
                self.regs[EAX] = quotient as u32;
                self.regs[EDX] = (dividend % divisor) as u32;
            }
        }
        Ok(())
    }

    pub fn idiv_acc(&mut self, size: Size, divisor: u32) -> Result<()> {
        let divisor = size.sign_extend(divisor) as i32 as i64;
        if divisor == 0 {
            return Err(Fault::DivideError);
        }
        let dividend = match size {
            Size::Byte => self.get_reg16(EAX) as i16 as i64,
            Size::Word => ((self.get_reg16(EDX) as u32) << 16 | self.get_reg16(EAX) as u32) as i32 as i64,
            Size::Dword => ((self.regs[EDX] as u64) << 32 | self.regs[EAX] as u64) as i64,
        };
        let quotient = dividend.checked_div(divisor).ok_or(Fault::DivideError)?;
        let remainder = dividend.wrapping_rem(divisor);
        let fits = match size {
            Size::Byte => quotient == quotient as i8 as i64,
            Size::Word => quotient == quotient as i16 as i64,
            Size::Dword => quotient == quotient as i32 as i64,
        };
        if !fits {
            return Err(Fault::DivideError);
        }
        match size {
            Size::Byte => {
                self.set_reg8(AL, quotient as u8);
                self.set_reg8(AH, remainder as u8);
            }
            Size::Word => {
                self.set_reg16(EAX, quotient as u16);
                self.set_reg16(EDX, remainder as u16);
            }
            Size::Dword => {
                self.regs[EAX] = quotient as u32;
                self.regs[EDX] = remainder as u32;
            }
        }
        Ok(())
    }
}

// ========================================================================
// ALU forms
// ========================================================================

/// 00/01 08/09 ... 38/39: op r/m, reg
pub fn alu_rm_r<W: Width, const OP: u8, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let t = cpu.timings;
    let src = cpu.reg_w::<W>(&m);
    if OP == CMP {
        let dest = cpu.read_rm_w::<W>(&m)?;
        cpu.alu_op(OP, W::SIZE, dest, src);
        cpu.clock_ea(W::SIZE, t.rr, t.rm, t.rml);
    } else {
        let dest = cpu.read_rm_for_write(W::SIZE, &m)?;
        let res = cpu.alu_op(OP, W::SIZE, dest, src);
        cpu.write_rm_w::<W>(&m, res)?;
        cpu.clock_ea(W::SIZE, t.rr, t.mr, t.mrl);
    }
    Ok(())
}

/// 02/03 0A/0B ... 3A/3B: op reg, r/m
pub fn alu_r_rm<W: Width, const OP: u8, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let t = cpu.timings;
    let src = cpu.read_rm_w::<W>(&m)?;
    let dest = cpu.reg_w::<W>(&m);
    let res = cpu.alu_op(OP, W::SIZE, dest, src);
    if OP != CMP {
        cpu.set_reg_w::<W>(&m, res);
    }
    cpu.clock_ea(W::SIZE, t.rr, t.rm, t.rml);
    Ok(())
}

/// 04/05 0C/0D ... 3C/3D: op accumulator, immediate
pub fn alu_acc_imm<W: Width, const OP: u8>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let imm = cpu.fetch_imm(W::SIZE)?;
    let dest = cpu.get_reg(W::SIZE, EAX);
    let res = cpu.alu_op(OP, W::SIZE, dest, imm);
    if OP != CMP {
        cpu.set_reg(W::SIZE, EAX, res);
    }
    cpu.clock(cpu.timings.rr);
    Ok(())
}

/// 80/81/82/83: group 1 with an immediate. `IMM8` selects the
/// sign-extended byte immediate of 83.
pub fn group1<W: Width, const IMM8: bool, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let t = cpu.timings;
    let op = m.reg;
    let dest = if op == CMP {
        cpu.read_rm_w::<W>(&m)?
    } else {
        cpu.read_rm_for_write(W::SIZE, &m)?
    };
    let imm = if IMM8 {
        cpu.fetch_u8()? as i8 as u32 & W::SIZE.mask()
    } else {
        cpu.fetch_imm(W::SIZE)?
    };
    let res = cpu.alu_op(op, W::SIZE, dest, imm);
    if op == CMP {
        cpu.clock_ea(W::SIZE, t.rr, t.rm, t.rml);
    } else {
        cpu.write_rm_w::<W>(&m, res)?;
        cpu.clock_ea(W::SIZE, t.rr, t.mr, t.mrl);
    }
    Ok(())
}

// ========================================================================
// INC / DEC / NEG
// ========================================================================

/// 40-4F: INC/DEC reg
pub fn inc_dec_reg<W: Width, const DEC: bool, const R: u8>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let value = cpu.get_reg(W::SIZE, R as usize);
    let res = if DEC { cpu.alu_dec(W::SIZE, value) } else { cpu.alu_inc(W::SIZE, value) };
    cpu.set_reg(W::SIZE, R as usize, res);
    cpu.clock(cpu.timings.rr);
    Ok(())
}

/// FE: INC/DEC r/m8
pub fn group_fe<const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    if m.reg > 1 {
        return Err(Fault::InvalidOpcode);
    }
    inc_dec_rm::<Byte>(cpu, &m)
}

pub(crate) fn inc_dec_rm<W: Width>(cpu: &mut Cpu, m: &super::utils::ModRm) -> Result<()> {
    let t = cpu.timings;
    let value = cpu.read_rm_for_write(W::SIZE, m)?;
    let res = if m.reg == 1 {
        cpu.alu_dec(W::SIZE, value)
    } else {
        cpu.alu_inc(W::SIZE, value)
    };
    cpu.write_rm_w::<W>(m, res)?;
    cpu.clock_ea(W::SIZE, t.rr, t.mm, t.mml);
    Ok(())
}

/// F6/F7: TEST imm, NOT, NEG, MUL, IMUL, DIV, IDIV
pub fn group3<W: Width, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let t = cpu.timings;
    let size = W::SIZE;
    match m.reg {
        0 | 1 => {
            let dest = cpu.read_rm_w::<W>(&m)?;
            let imm = cpu.fetch_imm(size)?;
            cpu.alu_and(size, dest, imm);
            cpu.clock_ea(size, t.rr, t.rm, t.rml);
        }
        2 => {
            let dest = cpu.read_rm_for_write(size, &m)?;
            cpu.write_rm_w::<W>(&m, !dest & size.mask())?;
            cpu.clock_ea(size, t.rr, t.mm, t.mml);
        }
        3 => {
            let dest = cpu.read_rm_for_write(size, &m)?;
            let res = cpu.alu_sub(size, 0, dest);
            cpu.write_rm_w::<W>(&m, res)?;
            cpu.clock_ea(size, t.rr, t.mm, t.mml);
        }
        4 => {
            let src = cpu.read_rm_w::<W>(&m)?;
            cpu.mul_acc(size, src);
            cpu.clock(cpu.mul_cost(size, false));
        }
        5 => {
            let src = cpu.read_rm_w::<W>(&m)?;
            cpu.imul_acc(size, src);
            cpu.clock(cpu.mul_cost(size, true));
        }
        6 => {
            let src = cpu.read_rm_w::<W>(&m)?;
            cpu.div_acc(size, src)?;
            cpu.clock(cpu.div_cost(size, false));
        }
        _ => {
            let src = cpu.read_rm_w::<W>(&m)?;
            cpu.idiv_acc(size, src)?;
            cpu.clock(cpu.div_cost(size, true));
        }
    }
    Ok(())
}

/// 69/6B: IMUL reg, r/m, imm
pub fn imul_imm<W: Width, const IMM8: bool, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let src = cpu.read_rm_w::<W>(&m)?;
    let imm = if IMM8 {
        cpu.fetch_u8()? as i8 as i32 as u32 & W::SIZE.mask()
    } else {
        cpu.fetch_imm(W::SIZE)?
    };
    let res = cpu.imul_trunc(W::SIZE, src, imm);
    cpu.set_reg_w::<W>(&m, res);
    cpu.clock(cpu.mul_cost(W::SIZE, true));
    Ok(())
}

/// 0F AF: IMUL reg, r/m
pub fn imul_r_rm<W: Width, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let src = cpu.read_rm_w::<W>(&m)?;
    let dest = cpu.reg_w::<W>(&m);
    let res = cpu.imul_trunc(W::SIZE, dest, src);
    cpu.set_reg_w::<W>(&m, res);
    cpu.clock(cpu.mul_cost(W::SIZE, true));
    Ok(())
}

// ========================================================================
// Decimal adjust
// ========================================================================

/// 27: DAA
pub fn daa(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    cpu.flags_rebuild();
    let old_al = cpu.get_reg8(AL);
    let old_cf = cpu.flags.contains(CpuFlags::CF);
    let mut al = old_al;
    if al & 0x0F > 9 || cpu.flags.contains(CpuFlags::AF) {
        al = al.wrapping_add(6);
        cpu.flags.insert(CpuFlags::AF);
    } else {
        cpu.flags.remove(CpuFlags::AF);
    }
    if old_al > 0x99 || old_cf {
        al = al.wrapping_add(0x60);
        cpu.flags.insert(CpuFlags::CF);
    } else {
        cpu.flags.remove(CpuFlags::CF);
    }
    cpu.set_reg8(AL, al);
    cpu.store_szp_8(al);
    cpu.clock(4);
    Ok(())
}

/// 2F: DAS
pub fn das(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    cpu.flags_rebuild();
    let old_al = cpu.get_reg8(AL);
    let old_cf = cpu.flags.contains(CpuFlags::CF);
    let mut al = old_al;
    if al & 0x0F > 9 || cpu.flags.contains(CpuFlags::AF) {
        al = al.wrapping_sub(6);
        cpu.flags.insert(CpuFlags::AF);
    } else {
        cpu.flags.remove(CpuFlags::AF);
    }
    if old_al > 0x99 || old_cf {
        al = al.wrapping_sub(0x60);
        cpu.flags.insert(CpuFlags::CF);
    } else {
        cpu.flags.remove(CpuFlags::CF);
    }
    cpu.set_reg8(AL, al);
    cpu.store_szp_8(al);
    cpu.clock(4);
    Ok(())
}

/// 37: AAA
pub fn aaa(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    cpu.flags_rebuild();
    let adjust = cpu.get_reg8(AL) & 0x0F > 9 || cpu.flags.contains(CpuFlags::AF);
    if adjust {
        let ax = cpu.get_reg16(EAX).wrapping_add(0x106);
        cpu.set_reg16(EAX, ax);
    }
    cpu.flags.set(CpuFlags::AF | CpuFlags::CF, adjust);
    let al = cpu.get_reg8(AL) & 0x0F;
    cpu.set_reg8(AL, al);
    cpu.clock(if cpu.model.is_486_class() { 3 } else { 4 });
    Ok(())
}

/// 3F: AAS
pub fn aas(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    cpu.flags_rebuild();
    let adjust = cpu.get_reg8(AL) & 0x0F > 9 || cpu.flags.contains(CpuFlags::AF);
    if adjust {
        let al = cpu.get_reg8(AL).wrapping_sub(6);
        let ah = cpu.get_reg8(AH).wrapping_sub(1);
        cpu.set_reg8(AL, al);
        cpu.set_reg8(AH, ah);
    }
    cpu.flags.set(CpuFlags::AF | CpuFlags::CF, adjust);
    let al = cpu.get_reg8(AL) & 0x0F;
    cpu.set_reg8(AL, al);
    cpu.clock(if cpu.model.is_486_class() { 3 } else { 4 });
    Ok(())
}

/// D4 ib: AAM. A zero base raises #DE.
pub fn aam(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let base = cpu.fetch_u8()?;
    if base == 0 {
        return Err(Fault::DivideError);
    }
    let al = cpu.get_reg8(AL);
    cpu.set_reg8(AH, al / base);
    cpu.set_reg8(AL, al % base);
    cpu.set_znp(Size::Byte, (al % base) as u32);
    cpu.clock(if cpu.model.is_486_class() { 15 } else { 17 });
    Ok(())
}

/// D5 ib: AAD
pub fn aad(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let base = cpu.fetch_u8()?;
    let al = cpu.get_reg8(AL).wrapping_add(cpu.get_reg8(AH).wrapping_mul(base));
    cpu.set_reg16(EAX, al as u16);
    cpu.set_znp(Size::Byte, al as u32);
    cpu.clock(if cpu.model.is_486_class() { 14 } else { 19 });
    Ok(())
}
