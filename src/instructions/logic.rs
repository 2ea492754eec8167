use crate::cpu::{Cpu, CL, EAX};
use crate::error::{Fault, Result};
use crate::flags::{CpuFlags, Size};

use super::utils::ModRm;
use super::{Byte, Width};

// Shift count sources for group 2
pub const BY_ONE: u8 = 0;
pub const BY_CL: u8 = 1;
pub const BY_IMM: u8 = 2;

/// 84/85: TEST r/m, reg
pub fn test_rm_r<W: Width, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let t = cpu.timings;
    let dest = cpu.read_rm_w::<W>(&m)?;
    let src = cpu.reg_w::<W>(&m);
    cpu.alu_and(W::SIZE, dest, src);
    cpu.clock_ea(W::SIZE, t.rr, t.rm, t.rml);
    Ok(())
}

/// A8/A9: TEST accumulator, immediate
pub fn test_acc_imm<W: Width>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let imm = cpu.fetch_imm(W::SIZE)?;
    let acc = cpu.get_reg(W::SIZE, EAX);
    cpu.alu_and(W::SIZE, acc, imm);
    cpu.clock(cpu.timings.rr);
    Ok(())
}

// ========================================================================
// Shifts and rotates
// ========================================================================

impl Cpu {
    /// Group 2 operation `op` on `value` with a masked, non-zero count.
    pub fn shift_op(&mut self, op: u8, size: Size, value: u32, count: u32) -> u32 {
        match op & 7 {
            0 => self.alu_rol(size, value, count),
            1 => self.alu_ror(size, value, count),
            2 => self.alu_rcl(size, value, count),
            3 => self.alu_rcr(size, value, count),
            4 | 6 => self.alu_shl(size, value, count),
            5 => self.alu_shr(size, value, count),
            _ => self.alu_sar(size, value, count),
        }
    }
}

/// C0/C1, D0/D1, D2/D3: ROL ROR RCL RCR SHL SHR SAL SAR
pub fn group2<W: Width, const SRC: u8, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let value = cpu.read_rm_for_write(W::SIZE, &m)?;
    let raw = match SRC {
        BY_ONE => 1,
        BY_CL => cpu.get_reg8(CL) as u32,
        _ => cpu.fetch_u8()? as u32,
    };
    let count = raw & 0x1F;
    let is486 = cpu.model.is_486_class();
    if count == 0 {
        cpu.clock(if is486 { 2 } else { 3 });
        return Ok(());
    }
    let res = cpu.shift_op(m.reg, W::SIZE, value, count);
    cpu.write_rm_w::<W>(&m, res)?;
    let rotate_carry = m.reg == 2 || m.reg == 3;
    let cost = match (rotate_carry, m.is_reg(), is486) {
        (true, true, true) => 9,
        (true, false, true) => 10,
        (true, _, false) => 9,
        (false, true, _) => 3,
        (false, false, true) => 4,
        (false, false, false) => 7,
    };
    cpu.clock(cost);
    Ok(())
}

impl Cpu {
    /// Double-precision shift of `dest` with bits from `src`. Flags are
    /// computed eagerly: CF is the last bit out, OF a sign change.
    fn double_shift(&mut self, size: Size, dest: u32, src: u32, count: u32, left: bool) -> u32 {
        let bits = size.bits();
        let (dest, src) = (dest as u64, src as u64);
        let (res, cf) = if left {
            // dest:src concatenated, shifted left
            let combined = (dest << bits) | src;
            let shifted = combined << count;
            let res = (shifted >> bits) as u32 & size.mask();
            let cf = (combined >> (2 * bits - count)) & 1 != 0;
            (res, cf)
        } else {
            let combined = (src << bits) | dest;
            let res = (combined >> count) as u32 & size.mask();
            let cf = (combined >> (count - 1)) & 1 != 0;
            (res, cf)
        };
        self.set_znp(size, res);
        self.flags_rebuild();
        self.flags.set(CpuFlags::CF, cf);
        self.flags.set(CpuFlags::OF, (res ^ dest as u32) & size.sign() != 0);
        res
    }
}

/// 0F A4/A5/AC/AD: SHLD/SHRD r/m, reg, imm8|CL
pub fn shift_double<W: Width, const LEFT: bool, const BY_CL_COUNT: bool, const A32: bool>(
    cpu: &mut Cpu,
    fetchdat: u32,
) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let dest = cpu.read_rm_for_write(W::SIZE, &m)?;
    let count = if BY_CL_COUNT { cpu.get_reg8(CL) } else { cpu.fetch_u8()? } as u32 & 0x1F;
    if count != 0 && count <= W::SIZE.bits() {
        let src = cpu.reg_w::<W>(&m);
        let res = cpu.double_shift(W::SIZE, dest, src, count, LEFT);
        cpu.write_rm_w::<W>(&m, res)?;
    }
    cpu.clock_ea(W::SIZE, 3, 7, 7);
    Ok(())
}

// ========================================================================
// Bit test and scan
// ========================================================================

// Bit operation numbers, matching the 0F BA group
pub const BT: u8 = 4;
pub const BTS: u8 = 5;
pub const BTR: u8 = 6;
pub const BTC: u8 = 7;

fn apply_bit_op(cpu: &mut Cpu, op: u8, value: u32, bit: u32) -> Option<u32> {
    let mask = 1 << bit;
    cpu.flags_rebuild();
    cpu.flags.set(CpuFlags::CF, value & mask != 0);
    match op {
        BTS => Some(value | mask),
        BTR => Some(value & !mask),
        BTC => Some(value ^ mask),
        _ => None,
    }
}

fn bit_op<W: Width>(cpu: &mut Cpu, m: &ModRm, op: u8, offset: u32, from_reg: bool) -> Result<()> {
    let bits = W::SIZE.bits();
    if m.is_reg() {
        let value = cpu.get_reg(W::SIZE, m.rm());
        if let Some(res) = apply_bit_op(cpu, op, value, offset & (bits - 1)) {
            cpu.set_reg(W::SIZE, m.rm(), res);
        }
        cpu.clock(if cpu.model.is_486_class() { 3 } else { 6 });
        return Ok(());
    }
    // A register bit offset may address outside the operand, signed
    let displacement = if from_reg {
        let signed = W::SIZE.sign_extend(offset) as i32;
        (signed >> bits.trailing_zeros()).wrapping_mul(W::SIZE.bytes() as i32) as u32
    } else {
        0
    };
    let addr = cpu.ea_offset(m, displacement);
    let value = if op == BT {
        cpu.read_mem(W::SIZE, m.seg, addr)?
    } else {
        cpu.check_write_access(m.seg, addr, W::SIZE.bytes())?;
        cpu.read_mem(W::SIZE, m.seg, addr)?
    };
    if let Some(res) = apply_bit_op(cpu, op, value, offset & (bits - 1)) {
        cpu.write_mem(W::SIZE, m.seg, addr, res)?;
    }
    cpu.clock(if cpu.model.is_486_class() { 8 } else { 12 });
    Ok(())
}

/// 0F A3/AB/B3/BB: BT/BTS/BTR/BTC r/m, reg
pub fn bt_rm_r<W: Width, const OP: u8, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let offset = cpu.reg_w::<W>(&m);
    bit_op::<W>(cpu, &m, OP, offset, true)
}

/// 0F BA: BT/BTS/BTR/BTC r/m, imm8
pub fn group8<W: Width, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    if m.reg < BT {
        return Err(Fault::InvalidOpcode);
    }
    let offset = cpu.fetch_u8()? as u32;
    bit_op::<W>(cpu, &m, m.reg, offset, false)
}

/// 0F BC/BD: BSF/BSR. A zero source sets ZF and leaves the destination.
pub fn bit_scan<W: Width, const REVERSE: bool, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let src = cpu.read_rm_w::<W>(&m)?;
    cpu.flags_rebuild();
    if src == 0 {
        cpu.flags.insert(CpuFlags::ZF);
        cpu.clock(if cpu.model.is_486_class() { 6 } else { 10 });
        return Ok(());
    }
    cpu.flags.remove(CpuFlags::ZF);
    let index = if REVERSE { 31 - src.leading_zeros() } else { src.trailing_zeros() };
    cpu.set_reg_w::<W>(&m, index);
    let scanned = if REVERSE { W::SIZE.bits() - index } else { index };
    cpu.clock(if cpu.model.is_486_class() { 6 + scanned as i32 } else { 10 + 3 * scanned as i32 });
    Ok(())
}

/// 0F 90-9F: SETcc r/m8
pub fn setcc<const CC: u8, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let value = cpu.condition(CC) as u32;
    cpu.write_rm_w::<Byte>(&m, value)?;
    cpu.clock_ea(Size::Byte, 4, 3, 3);
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::config::{CpuConfig, CpuModel};
    use crate::cpu::Cpu;
    use crate::flags::{CpuFlags, Size};

    #[test]
    fn shld_carries_last_bit_out() {
        let mut cpu = Cpu::new(CpuConfig::new(CpuModel::I486Dx));
        let res = cpu.double_shift(Size::Word, 0x8001, 0xF000, 4, true);
        assert_eq!(res, 0x001F);
        assert!(!cpu.get_cpu_flag(CpuFlags::CF));
        let res = cpu.double_shift(Size::Dword, 0x1, 0x8000_0000, 1, false);
        assert_eq!(res, 0);
        assert!(cpu.get_cpu_flag(CpuFlags::CF));
        assert!(cpu.get_cpu_flag(CpuFlags::ZF));
    }
}
