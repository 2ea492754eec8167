use crate::cpu::{Cpu, CR0_EM, CR0_TS};
use crate::error::{Fault, Result};
use crate::flags::Size;

use super::utils::ModRm;

// ========================================================================
// Lane arithmetic
// ========================================================================

fn lane_mask(bits: u32) -> u64 {
    if bits == 64 { u64::MAX } else { (1 << bits) - 1 }
}

fn lane(value: u64, index: u32, bits: u32) -> u64 {
    (value >> (index * bits)) & lane_mask(bits)
}

fn sext(value: u64, bits: u32) -> i64 {
    ((value << (64 - bits)) as i64) >> (64 - bits)
}

fn saturate_signed(value: i64, bits: u32) -> u64 {
    let max = (1i64 << (bits - 1)) - 1;
    let min = -(1i64 << (bits - 1));
    (value.clamp(min, max) as u64) & lane_mask(bits)
}

fn saturate_unsigned(value: i64, bits: u32) -> u64 {
    value.clamp(0, lane_mask(bits) as i64) as u64
}

/// Applies `f` lane by lane; each result is truncated to the lane width.
fn map_lanes(a: u64, b: u64, bits: u32, f: impl Fn(u64, u64) -> u64) -> u64 {
    (0..64 / bits).fold(0, |out, i| {
        out | ((f(lane(a, i, bits), lane(b, i, bits)) & lane_mask(bits)) << (i * bits))
    })
}

fn compare_lanes(a: u64, b: u64, bits: u32, f: impl Fn(u64, u64) -> bool) -> u64 {
    map_lanes(a, b, bits, |x, y| if f(x, y) { u64::MAX } else { 0 })
}

/// Interleaves the low (or high) halves of `a` and `b`, `a` first.
fn unpack(a: u64, b: u64, bits: u32, high: bool) -> u64 {
    let first = if high { 32 / bits } else { 0 };
    (0..32 / bits).fold(0, |out, i| {
        let x = lane(a, first + i, bits);
        let y = lane(b, first + i, bits);
        out | x << (2 * i * bits) | y << ((2 * i + 1) * bits)
    })
}

/// Narrows the signed lanes of `a` into the low half and of `b` into the high half.
fn pack(a: u64, b: u64, bits: u32, unsigned: bool) -> u64 {
    let narrow = bits / 2;
    let count = 64 / bits;
    let sat = |v: i64| if unsigned { saturate_unsigned(v, narrow) } else { saturate_signed(v, narrow) };
    (0..count).fold(0, |out, i| {
        out | sat(sext(lane(a, i, bits), bits)) << (i * narrow)
            | sat(sext(lane(b, i, bits), bits)) << ((i + count) * narrow)
    })
}

/// Logical shifts clear every lane once the count reaches the lane width.
fn shift_left(a: u64, count: u64, bits: u32) -> u64 {
    if count >= bits as u64 { 0 } else { map_lanes(a, 0, bits, |x, _| x << count) }
}

fn shift_right(a: u64, count: u64, bits: u32) -> u64 {
    if count >= bits as u64 { 0 } else { map_lanes(a, 0, bits, |x, _| x >> count) }
}

/// Arithmetic shifts saturate the count to width - 1, filling with the sign.
fn shift_arith(a: u64, count: u64, bits: u32) -> u64 {
    let count = count.min(bits as u64 - 1);
    map_lanes(a, 0, bits, |x, _| (sext(x, bits) >> count) as u64)
}

fn madd(a: u64, b: u64) -> u64 {
    (0..2).fold(0, |out, i| {
        let lo = sext(lane(a, 2 * i, 16), 16) * sext(lane(b, 2 * i, 16), 16);
        let hi = sext(lane(a, 2 * i + 1, 16), 16) * sext(lane(b, 2 * i + 1, 16), 16);
        out | ((lo.wrapping_add(hi) as u64) & 0xFFFF_FFFF) << (32 * i)
    })
}

/// Two-operand MMX arithmetic keyed by the 0F opcode byte. `None` for bytes
/// that are not register/memory packed operations.
pub fn packed_op(opcode: u8, dest: u64, src: u64) -> Option<u64> {
    let signed = |bits: u32, f: fn(i64, i64) -> i64| {
        map_lanes(dest, src, bits, move |x, y| saturate_signed(f(sext(x, bits), sext(y, bits)), bits))
    };
    let unsigned = |bits: u32, f: fn(i64, i64) -> i64| {
        map_lanes(dest, src, bits, move |x, y| saturate_unsigned(f(x as i64, y as i64), bits))
    };
    let add: fn(i64, i64) -> i64 = i64::wrapping_add;
    let sub: fn(i64, i64) -> i64 = i64::wrapping_sub;
    Some(match opcode {
        0x60 => unpack(dest, src, 8, false),
        0x61 => unpack(dest, src, 16, false),
        0x62 => unpack(dest, src, 32, false),
        0x63 => pack(dest, src, 16, false),
        0x64 => compare_lanes(dest, src, 8, |x, y| sext(x, 8) > sext(y, 8)),
        0x65 => compare_lanes(dest, src, 16, |x, y| sext(x, 16) > sext(y, 16)),
        0x66 => compare_lanes(dest, src, 32, |x, y| sext(x, 32) > sext(y, 32)),
        0x67 => pack(dest, src, 16, true),
        0x68 => unpack(dest, src, 8, true),
        0x69 => unpack(dest, src, 16, true),
        0x6A => unpack(dest, src, 32, true),
        0x6B => pack(dest, src, 32, false),
        0x74 => compare_lanes(dest, src, 8, |x, y| x == y),
        0x75 => compare_lanes(dest, src, 16, |x, y| x == y),
        0x76 => compare_lanes(dest, src, 32, |x, y| x == y),
        0xD1 => shift_right(dest, src, 16),
        0xD2 => shift_right(dest, src, 32),
        0xD3 => shift_right(dest, src, 64),
        0xD5 => map_lanes(dest, src, 16, |x, y| x.wrapping_mul(y)),
        0xD8 => unsigned(8, sub),
        0xD9 => unsigned(16, sub),
        0xDB => dest & src,
        0xDC => unsigned(8, add),
        0xDD => unsigned(16, add),
        0xDF => !dest & src,
        0xE1 => shift_arith(dest, src, 16),
        0xE2 => shift_arith(dest, src, 32),
        0xE5 => map_lanes(dest, src, 16, |x, y| ((sext(x, 16) * sext(y, 16)) >> 16) as u64),
        0xE8 => signed(8, sub),
        0xE9 => signed(16, sub),
        0xEB => dest | src,
        0xEC => signed(8, add),
        0xED => signed(16, add),
        0xEF => dest ^ src,
        0xF1 => shift_left(dest, src, 16),
        0xF2 => shift_left(dest, src, 32),
        0xF3 => shift_left(dest, src, 64),
        0xF5 => madd(dest, src),
        0xF8 => map_lanes(dest, src, 8, u64::wrapping_sub),
        0xF9 => map_lanes(dest, src, 16, u64::wrapping_sub),
        0xFA => map_lanes(dest, src, 32, u64::wrapping_sub),
        0xFC => map_lanes(dest, src, 8, u64::wrapping_add),
        0xFD => map_lanes(dest, src, 16, u64::wrapping_add),
        0xFE => map_lanes(dest, src, 32, u64::wrapping_add),
        _ => return None,
    })
}

// ========================================================================
// Handlers
// ========================================================================

impl Cpu {
    /// Every MMX and 3DNow! instruction starts here: CR0.EM makes them
    /// undefined, CR0.TS defers to the task-switch handler, and otherwise
    /// the shared register file flips to its MMX view.
    pub(crate) fn mmx_enter(&mut self) -> Result<()> {
        if self.cr0 & CR0_EM != 0 {
            return Err(Fault::InvalidOpcode);
        }
        if self.cr0 & CR0_TS != 0 {
            return Err(Fault::DeviceNotAvailable);
        }
        self.fpu.enter_mmx();
        Ok(())
    }

    pub(crate) fn mmx_source(&mut self, m: &ModRm) -> Result<u64> {
        if m.is_reg() {
            Ok(self.fpu.mmx(m.rm()))
        } else {
            self.read_mem_64(m.seg, m.offset)
        }
    }
}

fn shift_immediate(cpu: &mut Cpu, opcode: u8, m: &ModRm) -> Result<()> {
    if !m.is_reg() {
        return Err(Fault::InvalidOpcode);
    }
    let count = cpu.fetch_u8()? as u64;
    let value = cpu.fpu.mmx(m.rm());
    let bits = match opcode {
        0x71 => 16,
        0x72 => 32,
        _ => 64,
    };
    let result = match (m.reg, bits) {
        (2, _) => shift_right(value, count, bits),
        (4, 16 | 32) => shift_arith(value, count, bits),
        (6, _) => shift_left(value, count, bits),
        _ => return Err(Fault::InvalidOpcode),
    };
    cpu.fpu.set_mmx(m.rm(), result);
    Ok(())
}

/// 0F 60-7F, D1-FE: MMX register file operations.
pub fn mmx_op<const OPCODE: u8, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    cpu.mmx_enter()?;
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    match OPCODE {
        // MOVD mm, r/m32
        0x6E => {
            let value = cpu.read_rm(Size::Dword, &m)?;
            cpu.fpu.set_mmx(m.reg(), value as u64);
        }
        // MOVQ mm, mm/m64
        0x6F => {
            let value = cpu.mmx_source(&m)?;
            cpu.fpu.set_mmx(m.reg(), value);
        }
        // MOVD r/m32, mm
        0x7E => {
            let value = cpu.fpu.mmx(m.reg()) as u32;
            cpu.write_rm(Size::Dword, &m, value)?;
        }
        // MOVQ mm/m64, mm
        0x7F => {
            let value = cpu.fpu.mmx(m.reg());
            if m.is_reg() {
                cpu.fpu.set_mmx(m.rm(), value);
            } else {
                cpu.write_mem_64(m.seg, m.offset, value)?;
            }
        }
        0x71..=0x73 => shift_immediate(cpu, OPCODE, &m)?,
        _ => {
            let src = cpu.mmx_source(&m)?;
            let dest = cpu.fpu.mmx(m.reg());
            let result = packed_op(OPCODE, dest, src).ok_or(Fault::InvalidOpcode)?;
            cpu.fpu.set_mmx(m.reg(), result);
        }
    }
    cpu.clock_rm(1, 2);
    Ok(())
}

/// 0F 77: EMMS
pub fn emms(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    if cpu.cr0 & CR0_EM != 0 {
        return Err(Fault::InvalidOpcode);
    }
    if cpu.cr0 & CR0_TS != 0 {
        return Err(Fault::DeviceNotAvailable);
    }
    cpu.fpu.emms();
    cpu.clock(1);
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::config::{CpuConfig, CpuModel};
    use crate::cpu::{Cpu, CR0_EM, CR0_TS, EAX};
    use crate::error::Fault;
    use crate::fpu::RegisterMode;

    use super::*;

    fn cpu_with_code(code: &[u8]) -> Cpu {
        let mut cpu = Cpu::new(CpuConfig::new(CpuModel::PentiumMmx));
        cpu.load_cs_real(0);
        cpu.eip = 0x100;
        cpu.oldpc = 0x100;
        cpu.bus.load(0x100, code);
        cpu
    }

    #[test]
    fn saturating_adds() {
        // PADDSB: 0x7F + 1 clamps, 0x80 + 0xFF clamps low
        assert_eq!(packed_op(0xEC, 0x807F, 0xFF01), Some(0x807F));
        // PADDUSB: 0xF0 + 0x20 clamps at 0xFF
        assert_eq!(packed_op(0xDC, 0xF0, 0x20), Some(0xFF));
        // PSUBUSW: 1 - 2 clamps at 0
        assert_eq!(packed_op(0xD9, 1, 2), Some(0));
        // PADDB wraps
        assert_eq!(packed_op(0xFC, 0xFF, 0x02), Some(0x01));
    }

    #[test]
    fn packed_shift_counts_saturate() {
        let value = 0x8000_7FFF_1234_F00F;
        // PSRLW by 16 clears every lane
        assert_eq!(packed_op(0xD1, value, 16), Some(0));
        // PSRAW by 16 behaves as a shift by 15
        assert_eq!(packed_op(0xE1, value, 16), Some(0xFFFF_0000_0000_FFFF));
        assert_eq!(packed_op(0xE1, value, 15), packed_op(0xE1, value, 16));
        // PSLLQ by 4
        assert_eq!(packed_op(0xF3, 0x1, 4), Some(0x10));
    }

    #[test]
    fn pack_and_unpack() {
        // PACKSSWB: 0x0100 -> 0x7F, 0xFF00 -> 0x80
        assert_eq!(packed_op(0x63, 0xFF00_0100_0001_0002, 0), Some(0x807F_0102));
        // PACKUSWB: negative clamps to 0
        assert_eq!(packed_op(0x67, 0x0000_0000_FFFF_0080, 0), Some(0x0080));
        // PUNPCKLBW
        assert_eq!(packed_op(0x60, 0x0403_0201, 0x0807_0605), Some(0x0804_0703_0602_0501));
        // PUNPCKHDQ
        assert_eq!(packed_op(0x6A, 0xAAAA_AAAA_0000_0000, 0xBBBB_BBBB_0000_0000), Some(0xBBBB_BBBB_AAAA_AAAA));
    }

    #[test]
    fn multiply_forms() {
        // PMULHW: 0x4000 * 0x4000 = 0x1000_0000
        assert_eq!(packed_op(0xE5, 0x4000, 0x4000), Some(0x1000));
        // PMADDWD: 0x8000 * 0x8000 twice wraps to 0x8000_0000
        assert_eq!(packed_op(0xF5, 0x8000_8000, 0x8000_8000), Some(0x8000_0000));
        // PCMPGTW is signed
        assert_eq!(packed_op(0x65, 0x0001, 0xFFFF), Some(0xFFFF));
    }

    #[test]
    fn movd_enters_mmx_state() {
        // 0F 6E C0: MOVD MM0, EAX
        let mut cpu = cpu_with_code(&[0xC0]);
        cpu.fpu.status = 3 << 11;
        cpu.regs[EAX] = 0xDEAD_BEEF;
        let fetchdat = cpu.peek_fetchdat();
        mmx_op::<0x6E, false>(&mut cpu, fetchdat).unwrap();
        assert_eq!(cpu.fpu.mmx(0), 0xDEAD_BEEF);
        assert_eq!(cpu.fpu.top(), 0);
        assert_eq!(cpu.fpu.tag, 0);
        assert_eq!(cpu.fpu.mode, RegisterMode::Mmx);
    }

    #[test]
    fn immediate_shift_group() {
        // 0F 71 D1 04: PSRLW MM1, 4
        let mut cpu = cpu_with_code(&[0xD1, 0x04]);
        cpu.fpu.set_mmx(1, 0x00F0_00F0_00F0_00F0);
        let fetchdat = cpu.peek_fetchdat();
        mmx_op::<0x71, false>(&mut cpu, fetchdat).unwrap();
        assert_eq!(cpu.fpu.mmx(1), 0x000F_000F_000F_000F);
        assert_eq!(cpu.eip, 0x102);
    }

    #[test]
    fn cr0_gates() {
        let mut cpu = cpu_with_code(&[0xC0]);
        cpu.cr0 |= CR0_EM;
        assert_eq!(mmx_op::<0xEF, false>(&mut cpu, 0xC0), Err(Fault::InvalidOpcode));
        cpu.cr0 = CR0_TS;
        assert_eq!(mmx_op::<0xEF, false>(&mut cpu, 0xC0), Err(Fault::DeviceNotAvailable));
        assert_eq!(emms(&mut cpu, 0), Err(Fault::DeviceNotAvailable));
    }
}
