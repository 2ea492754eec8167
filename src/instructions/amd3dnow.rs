use crate::cpu::Cpu;
use crate::error::{Fault, Result};

use super::mmx::emms;

/// A 3DNow! operation on (destination, source) register images.
pub type SuffixFn = fn(u64, u64) -> u64;

fn floats(value: u64) -> [f32; 2] {
    [f32::from_bits(value as u32), f32::from_bits((value >> 32) as u32)]
}

fn join(lo: f32, hi: f32) -> u64 {
    lo.to_bits() as u64 | (hi.to_bits() as u64) << 32
}

fn ints(value: u64) -> [i32; 2] {
    [value as i32, (value >> 32) as i32]
}

fn join_ints(lo: i32, hi: i32) -> u64 {
    lo as u32 as u64 | (hi as u32 as u64) << 32
}

fn lanewise(dest: u64, src: u64, f: fn(f32, f32) -> f32) -> u64 {
    let [d0, d1] = floats(dest);
    let [s0, s1] = floats(src);
    join(f(d0, s0), f(d1, s1))
}

fn compare(dest: u64, src: u64, f: fn(f32, f32) -> bool) -> u64 {
    let [d0, d1] = floats(dest);
    let [s0, s1] = floats(src);
    let mask = |hit: bool| if hit { -1 } else { 0 };
    join_ints(mask(f(d0, s0)), mask(f(d1, s1)))
}

fn pi2fd(_dest: u64, src: u64) -> u64 {
    let [s0, s1] = ints(src);
    join(s0 as f32, s1 as f32)
}

/// Truncates toward zero; out-of-range values clamp, NaN reads as zero.
fn pf2id(_dest: u64, src: u64) -> u64 {
    let [s0, s1] = floats(src);
    join_ints(s0 as i32, s1 as i32)
}

fn pfcmpge(dest: u64, src: u64) -> u64 {
    compare(dest, src, |d, s| d >= s)
}

fn pfcmpgt(dest: u64, src: u64) -> u64 {
    compare(dest, src, |d, s| d > s)
}

fn pfcmpeq(dest: u64, src: u64) -> u64 {
    compare(dest, src, |d, s| d == s)
}

fn pfmin(dest: u64, src: u64) -> u64 {
    lanewise(dest, src, |d, s| if d < s { d } else { s })
}

fn pfmax(dest: u64, src: u64) -> u64 {
    lanewise(dest, src, |d, s| if d > s { d } else { s })
}

fn pfadd(dest: u64, src: u64) -> u64 {
    lanewise(dest, src, |d, s| d + s)
}

fn pfsub(dest: u64, src: u64) -> u64 {
    lanewise(dest, src, |d, s| d - s)
}

fn pfsubr(dest: u64, src: u64) -> u64 {
    lanewise(dest, src, |d, s| s - d)
}

fn pfmul(dest: u64, src: u64) -> u64 {
    lanewise(dest, src, |d, s| d * s)
}

fn pfacc(dest: u64, src: u64) -> u64 {
    let [d0, d1] = floats(dest);
    let [s0, s1] = floats(src);
    join(d0 + d1, s0 + s1)
}

/// Full precision from the low source lane, broadcast to both lanes.
fn pfrcp(_dest: u64, src: u64) -> u64 {
    let r = 1.0 / floats(src)[0];
    join(r, r)
}

fn pfrsqrt(_dest: u64, src: u64) -> u64 {
    let r = 1.0 / floats(src)[0].sqrt();
    join(r, r)
}

/// PFRCPIT1, PFRCPIT2 and PFRSQIT1. PFRCP/PFRSQRT already return a full
/// precision result, so the refinement steps pass the source through.
fn refine(_dest: u64, src: u64) -> u64 {
    src
}

fn pmulhrw(dest: u64, src: u64) -> u64 {
    (0..4).fold(0, |out, i| {
        let d = (dest >> (16 * i)) as i16 as i32;
        let s = (src >> (16 * i)) as i16 as i32;
        let product = (d * s + 0x8000) >> 16;
        out | ((product as u64) & 0xFFFF) << (16 * i)
    })
}

fn pavgusb(dest: u64, src: u64) -> u64 {
    (0..8).fold(0, |out, i| {
        let d = (dest >> (8 * i)) & 0xFF;
        let s = (src >> (8 * i)) & 0xFF;
        out | ((d + s + 1) >> 1) << (8 * i)
    })
}

const fn suffix_table() -> [Option<SuffixFn>; 256] {
    let mut table: [Option<SuffixFn>; 256] = [None; 256];
    table[0x0D] = Some(pi2fd as SuffixFn);
    table[0x1D] = Some(pf2id as SuffixFn);
    table[0x90] = Some(pfcmpge as SuffixFn);
    table[0x94] = Some(pfmin as SuffixFn);
    table[0x96] = Some(pfrcp as SuffixFn);
    table[0x97] = Some(pfrsqrt as SuffixFn);
    table[0x9A] = Some(pfsub as SuffixFn);
    table[0x9E] = Some(pfadd as SuffixFn);
    table[0xA0] = Some(pfcmpgt as SuffixFn);
    table[0xA4] = Some(pfmax as SuffixFn);
    table[0xA6] = Some(refine as SuffixFn);
    table[0xA7] = Some(refine as SuffixFn);
    table[0xAA] = Some(pfsubr as SuffixFn);
    table[0xAE] = Some(pfacc as SuffixFn);
    table[0xB0] = Some(pfcmpeq as SuffixFn);
    table[0xB4] = Some(pfmul as SuffixFn);
    table[0xB6] = Some(refine as SuffixFn);
    table[0xB7] = Some(pmulhrw as SuffixFn);
    table[0xBF] = Some(pavgusb as SuffixFn);
    table
}

/// Operations selected by the byte that trails a 0F 0F instruction.
pub static SUFFIXES: [Option<SuffixFn>; 256] = suffix_table();

/// 0F 0F /r ib: the suffix byte follows the operand and picks the operation.
pub fn amd3dnow<const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    cpu.mmx_enter()?;
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let suffix = cpu.fetch_u8()?;
    let op = SUFFIXES[suffix as usize].ok_or(Fault::InvalidOpcode)?;
    let src = cpu.mmx_source(&m)?;
    let dest = cpu.fpu.mmx(m.reg());
    cpu.fpu.set_mmx(m.reg(), op(dest, src));
    cpu.clock_rm(1, 2);
    Ok(())
}

/// 0F 0E: FEMMS
pub fn femms(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    emms(cpu, fetchdat)
}

/// 0F 0D /0, /1: PREFETCH, PREFETCHW. No cache is modelled.
pub fn prefetch<const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    cpu.require_mem(&m)?;
    cpu.clock(1);
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::config::{CpuConfig, CpuModel};
    use crate::cpu::Cpu;
    use crate::error::Fault;

    use super::*;

    fn pair(lo: f32, hi: f32) -> u64 {
        join(lo, hi)
    }

    fn cpu_with_code(code: &[u8]) -> Cpu {
        let mut cpu = Cpu::new(CpuConfig::new(CpuModel::K62));
        cpu.load_cs_real(0);
        cpu.eip = 0x100;
        cpu.oldpc = 0x100;
        cpu.bus.load(0x100, code);
        cpu
    }

    #[test]
    fn float_arithmetic() {
        assert_eq!(pfadd(pair(1.5, 2.0), pair(0.5, -4.0)), pair(2.0, -2.0));
        assert_eq!(pfsubr(pair(1.0, 1.0), pair(3.0, 5.0)), pair(2.0, 4.0));
        assert_eq!(pfacc(pair(1.0, 2.0), pair(10.0, 20.0)), pair(3.0, 30.0));
        assert_eq!(pfcmpge(pair(1.0, 0.0), pair(1.0, 1.0)), 0x0000_0000_FFFF_FFFF);
    }

    #[test]
    fn reciprocal_broadcasts_and_iterations_pass_through() {
        let approx = pfrcp(0, pair(4.0, 100.0));
        assert_eq!(approx, pair(0.25, 0.25));
        // PFRCPIT1 / PFRCPIT2 leave the first approximation untouched
        assert_eq!(SUFFIXES[0xA6].map(|f| f(pair(4.0, 4.0), approx)), Some(approx));
        assert_eq!(SUFFIXES[0xB6].map(|f| f(approx, approx)), Some(approx));
        assert_eq!(pfrsqrt(0, pair(16.0, 0.0)), pair(0.25, 0.25));
    }

    #[test]
    fn integer_conversions() {
        assert_eq!(pi2fd(0, join_ints(-3, 7)), pair(-3.0, 7.0));
        assert_eq!(pf2id(0, pair(-2.75, 3e10)), join_ints(-2, i32::MAX));
        assert_eq!(pavgusb(0x00FF_0001, 0x00FF_0002), 0x00FF_0002);
        // 0x4000 * 0x4000 rounds to 0x1000
        assert_eq!(pmulhrw(0x4000, 0x4000), 0x1000);
        assert_eq!(pmulhrw(0xFFFF, 0x8000), 0x0001);
    }

    #[test]
    fn suffix_dispatch() {
        // 0F 0F C1 9E: PFADD MM0, MM1
        let mut cpu = cpu_with_code(&[0xC1, 0x9E]);
        cpu.fpu.set_mmx(0, pair(1.0, 2.0));
        cpu.fpu.set_mmx(1, pair(3.0, 4.0));
        let fetchdat = cpu.peek_fetchdat();
        amd3dnow::<false>(&mut cpu, fetchdat).unwrap();
        assert_eq!(cpu.fpu.mmx(0), pair(4.0, 6.0));
        assert_eq!(cpu.eip, 0x102);
    }

    #[test]
    fn unknown_suffix_is_illegal() {
        // 0F 0F C1 FF
        let mut cpu = cpu_with_code(&[0xC1, 0xFF]);
        let fetchdat = cpu.peek_fetchdat();
        assert_eq!(amd3dnow::<false>(&mut cpu, fetchdat), Err(Fault::InvalidOpcode));
    }
}
