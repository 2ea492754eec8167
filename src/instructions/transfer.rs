use crate::cpu::{Cpu, AL, EAX, EBP, EBX, ECX, EDX, ESP};
use crate::error::{Fault, Result};
use crate::flags::{CpuFlags, Size};
use crate::segment::SegReg;

use super::{Width, Word};

// ========================================================================
// MOV
// ========================================================================

/// 88/89: MOV r/m, reg
pub fn mov_rm_r<W: Width, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let value = cpu.reg_w::<W>(&m);
    cpu.write_rm_w::<W>(&m, value)?;
    cpu.clock_ea(W::SIZE, cpu.timings.rr, cpu.timings.mr, cpu.timings.mrl);
    Ok(())
}

/// 8A/8B: MOV reg, r/m
pub fn mov_r_rm<W: Width, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let value = cpu.read_rm_w::<W>(&m)?;
    cpu.set_reg_w::<W>(&m, value);
    cpu.clock_ea(W::SIZE, cpu.timings.rr, cpu.timings.rm, cpu.timings.rml);
    Ok(())
}

/// 8C: MOV r/m16, Sreg. Register destinations take the selector
/// zero-extended at 32-bit operand size.
pub fn mov_rm_sreg<W: Width, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let seg = sreg_operand(cpu, m.reg)?;
    let selector = cpu.seg(seg).selector as u32;
    if m.is_reg() {
        cpu.set_reg(W::SIZE, m.rm(), selector);
    } else {
        cpu.write_rm_w::<Word>(&m, selector)?;
    }
    cpu.clock_ea(Size::Word, 2, 3, 3);
    Ok(())
}

/// 8E: MOV Sreg, r/m16. CS is not a valid destination; loading SS holds
/// off interrupts for one instruction.
pub fn mov_sreg_rm<const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let seg = sreg_operand(cpu, m.reg)?;
    if seg == SegReg::Cs {
        return Err(Fault::InvalidOpcode);
    }
    let selector = cpu.read_rm_w::<Word>(&m)? as u16;
    cpu.load_seg(seg, selector)?;
    if seg == SegReg::Ss {
        cpu.inhibit_irq = true;
    }
    let pm = cpu.pmode_not_v86();
    cpu.clock_ea(Size::Word, if pm { 9 } else { 2 }, if pm { 10 } else { 3 }, 3);
    Ok(())
}

fn sreg_operand(cpu: &Cpu, reg: u8) -> Result<SegReg> {
    match SegReg::from_index(reg) {
        Some(SegReg::Fs | SegReg::Gs) if !cpu.model.is_386_class() => Err(Fault::InvalidOpcode),
        Some(seg) => Ok(seg),
        None => Err(Fault::InvalidOpcode),
    }
}

/// A0-A3: MOV between the accumulator and a direct offset.
pub fn mov_acc_moffs<W: Width, const TO_MEM: bool, const A32: bool>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let offset = if A32 { cpu.fetch_u32()? } else { cpu.fetch_u16()? as u32 };
    let seg = cpu.data_seg();
    if TO_MEM {
        let value = cpu.get_reg(W::SIZE, EAX);
        cpu.write_mem(W::SIZE, seg, offset, value)?;
    } else {
        let value = cpu.read_mem(W::SIZE, seg, offset)?;
        cpu.set_reg(W::SIZE, EAX, value);
    }
    cpu.clock(1);
    Ok(())
}

/// B0-BF: MOV reg, imm
pub fn mov_r_imm<W: Width, const R: u8>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let imm = cpu.fetch_imm(W::SIZE)?;
    cpu.set_reg(W::SIZE, R as usize, imm);
    cpu.clock(cpu.timings.rr);
    Ok(())
}

/// C6/C7: MOV r/m, imm
pub fn mov_rm_imm<W: Width, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    if m.reg != 0 {
        return Err(Fault::InvalidOpcode);
    }
    let imm = cpu.fetch_imm(W::SIZE)?;
    cpu.write_rm_w::<W>(&m, imm)?;
    cpu.clock_ea(W::SIZE, cpu.timings.rr, cpu.timings.mr, cpu.timings.mrl);
    Ok(())
}

/// 8D: LEA
pub fn lea<W: Width, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    cpu.require_mem(&m)?;
    cpu.set_reg_w::<W>(&m, m.offset & W::SIZE.mask());
    cpu.clock(cpu.timings.rr);
    Ok(())
}

/// 0F B6/B7/BE/BF: MOVZX/MOVSX reg, r/m. `S` is the source width.
pub fn mov_extend<W: Width, S: Width, const SIGNED: bool, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let src = cpu.read_rm_w::<S>(&m)?;
    let value = if SIGNED { S::SIZE.sign_extend(src) } else { src };
    cpu.set_reg_w::<W>(&m, value & W::SIZE.mask());
    cpu.clock(3);
    Ok(())
}

/// 0F 40-4F: CMOVcc. The source is read whether or not the move happens.
pub fn cmov<W: Width, const CC: u8, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let value = cpu.read_rm_w::<W>(&m)?;
    if cpu.condition(CC) {
        cpu.set_reg_w::<W>(&m, value);
    }
    cpu.clock(1);
    Ok(())
}

// ========================================================================
// Exchange
// ========================================================================

/// 86/87: XCHG r/m, reg
pub fn xchg_rm_r<W: Width, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let dest = cpu.read_rm_for_write(W::SIZE, &m)?;
    let src = cpu.reg_w::<W>(&m);
    cpu.write_rm_w::<W>(&m, src)?;
    cpu.set_reg_w::<W>(&m, dest);
    cpu.clock_ea(W::SIZE, 3, 5, 5);
    Ok(())
}

/// 91-97: XCHG accumulator, reg
pub fn xchg_acc<W: Width, const R: u8>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let acc = cpu.get_reg(W::SIZE, EAX);
    let other = cpu.get_reg(W::SIZE, R as usize);
    cpu.set_reg(W::SIZE, EAX, other);
    cpu.set_reg(W::SIZE, R as usize, acc);
    cpu.clock(3);
    Ok(())
}

/// 0F C8-CF: BSWAP
pub fn bswap<const R: u8>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let value = cpu.regs[R as usize];
    cpu.regs[R as usize] = value.swap_bytes();
    cpu.clock(1);
    Ok(())
}

/// 0F C0/C1: XADD r/m, reg
pub fn xadd<W: Width, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let dest = cpu.read_rm_for_write(W::SIZE, &m)?;
    let src = cpu.reg_w::<W>(&m);
    let sum = cpu.alu_add(W::SIZE, dest, src);
    cpu.write_rm_w::<W>(&m, sum)?;
    // For XADD reg,reg with the same register the sum wins
    if !(m.is_reg() && m.rm == m.reg) {
        cpu.set_reg_w::<W>(&m, dest);
    }
    cpu.clock_ea(W::SIZE, 3, 4, 4);
    Ok(())
}

/// 0F B0/B1: CMPXCHG r/m, reg
pub fn cmpxchg<W: Width, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let dest = cpu.read_rm_for_write(W::SIZE, &m)?;
    let acc = cpu.get_reg(W::SIZE, EAX);
    cpu.alu_sub(W::SIZE, acc, dest);
    if acc == dest {
        let src = cpu.reg_w::<W>(&m);
        cpu.write_rm_w::<W>(&m, src)?;
    } else {
        // The destination is written back unchanged, as the bus cycle does
        cpu.write_rm_w::<W>(&m, dest)?;
        cpu.set_reg(W::SIZE, EAX, dest);
    }
    cpu.clock_ea(W::SIZE, 6, 7, 7);
    Ok(())
}

/// 0F C7 /1: CMPXCHG8B m64
pub fn cmpxchg8b<const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    if m.reg != 1 {
        return Err(Fault::InvalidOpcode);
    }
    cpu.require_mem(&m)?;
    cpu.check_write_access(m.seg, m.offset, 8)?;
    let value = cpu.read_mem_64(m.seg, m.offset)?;
    let expected = (cpu.regs[EDX] as u64) << 32 | cpu.regs[EAX] as u64;
    cpu.flags_rebuild();
    if value == expected {
        let replacement = (cpu.regs[ECX] as u64) << 32 | cpu.regs[EBX] as u64;
        cpu.write_mem_64(m.seg, m.offset, replacement)?;
        cpu.flags.insert(CpuFlags::ZF);
    } else {
        cpu.write_mem_64(m.seg, m.offset, value)?;
        cpu.regs[EAX] = value as u32;
        cpu.regs[EDX] = (value >> 32) as u32;
        cpu.flags.remove(CpuFlags::ZF);
    }
    cpu.clock(10);
    Ok(())
}

// ========================================================================
// Stack
// ========================================================================

/// 50-57: PUSH reg. PUSH SP stores the value before the decrement.
pub fn push_reg<W: Width, const R: u8>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let value = cpu.get_reg(W::SIZE, R as usize);
    cpu.push(W::SIZE, value)?;
    cpu.clock(if cpu.model.is_486_class() { 1 } else { 2 });
    Ok(())
}

/// 58-5F: POP reg
pub fn pop_reg<W: Width, const R: u8>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let value = cpu.pop(W::SIZE)?;
    cpu.set_reg(W::SIZE, R as usize, value);
    cpu.clock(if cpu.model.is_486_class() { 1 } else { 4 });
    Ok(())
}

/// 68/6A: PUSH imm
pub fn push_imm<W: Width, const IMM8: bool>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let imm = if IMM8 {
        cpu.fetch_u8()? as i8 as u32 & W::SIZE.mask()
    } else {
        cpu.fetch_imm(W::SIZE)?
    };
    cpu.push(W::SIZE, imm)?;
    cpu.clock(if cpu.model.is_486_class() { 1 } else { 2 });
    Ok(())
}

/// 8F /0: POP r/m. The address is formed after ESP has been incremented.
pub fn pop_rm<W: Width, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let value = cpu.peek_stack(W::SIZE, 0)?;
    let saved_esp = cpu.regs[ESP];
    let saved_eip = cpu.eip;
    cpu.adjust_sp(W::SIZE.bytes());
    let result = (|| -> Result<()> {
        let m = cpu.decode_modrm::<A32>(fetchdat)?;
        if m.reg != 0 {
            return Err(Fault::InvalidOpcode);
        }
        cpu.write_rm_w::<W>(&m, value)
    })();
    if let Err(fault) = result {
        cpu.regs[ESP] = saved_esp;
        cpu.eip = saved_eip;
        return Err(fault);
    }
    cpu.clock(if cpu.model.is_486_class() { 6 } else { 5 });
    Ok(())
}

/// 06/0E/16/1E, 0F A0/A8: PUSH Sreg. A 32-bit push writes the selector
/// zero-extended.
pub fn push_sreg<W: Width, const SEG: u8>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let seg = SegReg::ALL[SEG as usize];
    let selector = cpu.seg(seg).selector as u32;
    cpu.push(W::SIZE, selector)?;
    cpu.clock(if cpu.model.is_486_class() { 3 } else { 2 });
    Ok(())
}

/// 07/17/1F, 0F A1/A9: POP Sreg. The stack pointer moves only once the
/// selector has loaded.
pub fn pop_sreg<W: Width, const SEG: u8>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let seg = SegReg::ALL[SEG as usize];
    let selector = cpu.peek_stack(W::SIZE, 0)? as u16;
    cpu.load_seg(seg, selector)?;
    cpu.adjust_sp(W::SIZE.bytes());
    if seg == SegReg::Ss {
        cpu.inhibit_irq = true;
    }
    cpu.clock(if cpu.pmode_not_v86() { 21 } else { 7 });
    Ok(())
}

/// 60: PUSHA/PUSHAD
pub fn pusha<W: Width>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let size = W::SIZE;
    let bytes = size.bytes();
    let original_sp = cpu.get_reg(size, ESP);
    for (i, reg) in (0..8).enumerate() {
        let value = if reg == ESP { original_sp } else { cpu.get_reg(size, reg) };
        let offset = cpu.stack_offset((bytes * (i as u32 + 1)).wrapping_neg());
        cpu.write_mem(size, SegReg::Ss, offset, value)?;
    }
    cpu.adjust_sp((bytes * 8).wrapping_neg());
    cpu.clock(if cpu.model.is_486_class() { 11 } else { 18 });
    Ok(())
}

/// 61: POPA/POPAD. The stored stack pointer is discarded.
pub fn popa<W: Width>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let size = W::SIZE;
    let bytes = size.bytes();
    let mut values = [0u32; 8];
    for (i, value) in values.iter_mut().enumerate() {
        *value = cpu.peek_stack(size, bytes * (7 - i as u32))?;
    }
    for (reg, value) in values.into_iter().enumerate() {
        if reg != ESP {
            cpu.set_reg(size, reg, value);
        }
    }
    cpu.adjust_sp(bytes * 8);
    cpu.clock(if cpu.model.is_486_class() { 9 } else { 24 });
    Ok(())
}

/// C8 iw ib: ENTER
pub fn enter<W: Width>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let alloc = cpu.fetch_u16()? as u32;
    let level = (cpu.fetch_u8()? & 0x1F) as u32;
    let saved = (cpu.regs[ESP], cpu.regs[EBP]);
    let result = (|| -> Result<()> {
        let size = W::SIZE;
        let stack32 = cpu.stack32();
        let bp = cpu.get_reg(size, EBP);
        cpu.push(size, bp)?;
        let frame = cpu.regs[ESP];
        if level > 0 {
            let mut bp = cpu.regs[EBP];
            for _ in 1..level {
                bp = bp.wrapping_sub(size.bytes());
                let offset = if stack32 { bp } else { bp & 0xFFFF };
                let value = cpu.read_mem(size, SegReg::Ss, offset)?;
                cpu.push(size, value)?;
            }
            cpu.push(size, frame & size.mask())?;
        }
        cpu.set_reg(size, EBP, frame);
        cpu.adjust_sp(alloc.wrapping_neg());
        // The new top of stack must be writable
        let top = cpu.stack_offset(0);
        cpu.check_write(SegReg::Ss, top, 1)?;
        Ok(())
    })();
    if let Err(fault) = result {
        (cpu.regs[ESP], cpu.regs[EBP]) = saved;
        return Err(fault);
    }
    cpu.clock(if cpu.model.is_486_class() { 14 + level as i32 * 3 } else { 10 + level as i32 * 4 });
    Ok(())
}

/// C9: LEAVE
pub fn leave<W: Width>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let saved = cpu.regs[ESP];
    if cpu.stack32() {
        cpu.regs[ESP] = cpu.regs[EBP];
    } else {
        let bp = cpu.get_reg16(EBP);
        cpu.set_reg16(ESP, bp);
    }
    match cpu.pop(W::SIZE) {
        Ok(value) => cpu.set_reg(W::SIZE, EBP, value),
        Err(fault) => {
            cpu.regs[ESP] = saved;
            return Err(fault);
        }
    }
    cpu.clock(if cpu.model.is_486_class() { 5 } else { 4 });
    Ok(())
}

// ========================================================================
// Far pointers
// ========================================================================

/// C4/C5, 0F B2/B4/B5: LES/LDS/LSS/LFS/LGS
pub fn load_far_ptr<W: Width, const SEG: u8, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    cpu.require_mem(&m)?;
    let offset = cpu.read_mem(W::SIZE, m.seg, m.offset)?;
    let selector_addr = cpu.ea_offset(&m, W::SIZE.bytes());
    let selector = cpu.read_mem_16(m.seg, selector_addr)?;
    let seg = SegReg::ALL[SEG as usize];
    cpu.load_seg(seg, selector)?;
    if seg == SegReg::Ss {
        cpu.inhibit_irq = true;
    }
    cpu.set_reg_w::<W>(&m, offset);
    cpu.clock(if cpu.pmode_not_v86() { 22 } else { 7 });
    Ok(())
}

// ========================================================================
// Conversions and table lookup
// ========================================================================

/// 98: CBW/CWDE
pub fn cbw<W: Width>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    if W::SIZE == Size::Dword {
        cpu.regs[EAX] = cpu.regs[EAX] as u16 as i16 as i32 as u32;
    } else {
        let al = cpu.get_reg8(AL);
        cpu.set_reg16(EAX, al as i8 as i16 as u16);
    }
    cpu.clock(3);
    Ok(())
}

/// 99: CWD/CDQ
pub fn cwd<W: Width>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let acc = cpu.get_reg(W::SIZE, EAX);
    let fill = if acc & W::SIZE.sign() != 0 { W::SIZE.mask() } else { 0 };
    cpu.set_reg(W::SIZE, EDX, fill);
    cpu.clock(2);
    Ok(())
}

/// D7: XLAT
pub fn xlat<const A32: bool>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let base = cpu.regs[EBX].wrapping_add(cpu.get_reg8(AL) as u32);
    let offset = if A32 { base } else { base & 0xFFFF };
    let seg = cpu.data_seg();
    let value = cpu.read_mem_8(seg, offset)?;
    cpu.set_reg8(AL, value);
    cpu.clock(if cpu.model.is_486_class() { 4 } else { 5 });
    Ok(())
}

// ========================================================================
// Port I/O
// ========================================================================

fn io_cost(cpu: &Cpu) -> i32 {
    if cpu.pmode_not_v86() && cpu.cpl() > cpu.iopl() {
        28
    } else if cpu.v86_mode() {
        27
    } else {
        12
    }
}

/// E4/E5: IN accumulator, imm8
pub fn in_imm<W: Width>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let port = cpu.fetch_u8()? as u16;
    let value = cpu.io_in(W::SIZE, port)?;
    cpu.set_reg(W::SIZE, EAX, value);
    cpu.clock(io_cost(cpu));
    Ok(())
}

/// E6/E7: OUT imm8, accumulator
pub fn out_imm<W: Width>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let port = cpu.fetch_u8()? as u16;
    let value = cpu.get_reg(W::SIZE, EAX);
    cpu.io_out(W::SIZE, port, value)?;
    cpu.clock(io_cost(cpu));
    Ok(())
}

/// EC/ED: IN accumulator, DX
pub fn in_dx<W: Width>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let port = cpu.get_reg16(EDX);
    let value = cpu.io_in(W::SIZE, port)?;
    cpu.set_reg(W::SIZE, EAX, value);
    cpu.clock(io_cost(cpu));
    Ok(())
}

/// EE/EF: OUT DX, accumulator
pub fn out_dx<W: Width>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let port = cpu.get_reg16(EDX);
    let value = cpu.get_reg(W::SIZE, EAX);
    cpu.io_out(W::SIZE, port, value)?;
    cpu.clock(io_cost(cpu));
    Ok(())
}
