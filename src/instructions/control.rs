use crate::cpu::{Cpu, ECX};
use crate::error::{Fault, Result};
use crate::flags::Size;
use crate::segment::SegReg;

use super::math::inc_dec_rm;
use super::Width;

// LOOP flavours, by the low bits of E0-E2
pub const LOOPNE: u8 = 0;
pub const LOOPE: u8 = 1;
pub const LOOP: u8 = 2;

impl Cpu {
    /// Validates a near branch target against CS, masked to the operand
    /// size of the instruction.
    pub fn near_target(&self, target: u32) -> Result<u32> {
        let target = if self.op32 { target } else { target & 0xFFFF };
        if !self.seg(SegReg::Cs).contains(target, 1) {
            return Err(Fault::GeneralProtection(0));
        }
        Ok(target)
    }

    pub fn branch_to(&mut self, target: u32) -> Result<()> {
        self.eip = self.near_target(target)?;
        Ok(())
    }

    fn branch_cost(&mut self, taken: bool) {
        let t = self.timings;
        self.clock(if taken { t.bnt + t.bt } else { t.bnt });
    }
}

// ========================================================================
// Near branches
// ========================================================================

/// 70-7F: Jcc rel8
pub fn jcc_short<const CC: u8>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let disp = cpu.fetch_u8()? as i8 as u32;
    let taken = cpu.condition(CC);
    if taken {
        cpu.branch_to(cpu.eip.wrapping_add(disp))?;
    }
    cpu.branch_cost(taken);
    Ok(())
}

/// 0F 80-8F: Jcc rel16/32
pub fn jcc_near<W: Width, const CC: u8>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let disp = W::SIZE.sign_extend(cpu.fetch_imm(W::SIZE)?);
    let taken = cpu.condition(CC);
    if taken {
        cpu.branch_to(cpu.eip.wrapping_add(disp))?;
    }
    cpu.branch_cost(taken);
    Ok(())
}

/// EB: JMP rel8
pub fn jmp_short(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let disp = cpu.fetch_u8()? as i8 as u32;
    cpu.branch_to(cpu.eip.wrapping_add(disp))?;
    cpu.clock(if cpu.model.is_486_class() { 3 } else { 7 });
    Ok(())
}

/// E9: JMP rel16/32
pub fn jmp_near<W: Width>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let disp = W::SIZE.sign_extend(cpu.fetch_imm(W::SIZE)?);
    cpu.branch_to(cpu.eip.wrapping_add(disp))?;
    cpu.clock(if cpu.model.is_486_class() { 3 } else { 7 });
    Ok(())
}

/// E8: CALL rel16/32
pub fn call_near<W: Width>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let disp = W::SIZE.sign_extend(cpu.fetch_imm(W::SIZE)?);
    let target = cpu.near_target(cpu.eip.wrapping_add(disp))?;
    cpu.push(W::SIZE, cpu.eip)?;
    cpu.eip = target;
    cpu.clock(if cpu.model.is_486_class() { 3 } else { 7 });
    Ok(())
}

/// C2/C3: RET near, optionally releasing imm16 bytes of parameters.
pub fn ret_near<W: Width, const IMM: bool>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let release = if IMM { cpu.fetch_u16()? as u32 } else { 0 };
    let target = cpu.peek_stack(W::SIZE, 0)?;
    let target = cpu.near_target(target)?;
    cpu.adjust_sp(W::SIZE.bytes() + release);
    cpu.eip = target;
    cpu.clock(if cpu.model.is_486_class() { 5 } else { 10 });
    Ok(())
}

/// E0-E2: LOOPNE/LOOPE/LOOP. The counter is CX or ECX by address size.
pub fn loop_op<const KIND: u8, const A32: bool>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let disp = cpu.fetch_u8()? as i8 as u32;
    let count = if A32 { cpu.regs[ECX] } else { cpu.regs[ECX] & 0xFFFF }.wrapping_sub(1);
    let count = if A32 { count } else { count & 0xFFFF };
    let taken = count != 0
        && match KIND {
            LOOPNE => !cpu.zf(),
            LOOPE => cpu.zf(),
            _ => true,
        };
    let target = if taken { Some(cpu.near_target(cpu.eip.wrapping_add(disp))?) } else { None };
    if A32 {
        cpu.regs[ECX] = count;
    } else {
        cpu.set_reg16(ECX, count as u16);
    }
    if let Some(target) = target {
        cpu.eip = target;
    }
    let is486 = cpu.model.is_486_class();
    cpu.clock(match (taken, is486) {
        (true, true) => 7,
        (false, true) => 6,
        (true, false) => 11,
        (false, false) => 4,
    });
    Ok(())
}

/// E3: JCXZ/JECXZ
pub fn jcxz<const A32: bool>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let disp = cpu.fetch_u8()? as i8 as u32;
    let count = if A32 { cpu.regs[ECX] } else { cpu.regs[ECX] & 0xFFFF };
    let taken = count == 0;
    if taken {
        cpu.branch_to(cpu.eip.wrapping_add(disp))?;
    }
    cpu.clock(if taken { 8 } else { 5 });
    Ok(())
}

// ========================================================================
// Far transfers
// ========================================================================

/// EA: JMP ptr16:16/32
pub fn jmp_far<W: Width>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let offset = cpu.fetch_imm(W::SIZE)?;
    let selector = cpu.fetch_u16()?;
    cpu.far_jump(selector, offset, W::SIZE == Size::Dword)
}

/// 9A: CALL ptr16:16/32
pub fn call_far<W: Width>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let offset = cpu.fetch_imm(W::SIZE)?;
    let selector = cpu.fetch_u16()?;
    cpu.far_call(selector, offset, W::SIZE == Size::Dword)
}

/// CA/CB: RETF, optionally releasing imm16 bytes of parameters.
pub fn retf<W: Width, const IMM: bool>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let release = if IMM { cpu.fetch_u16()? as u32 } else { 0 };
    cpu.far_return(W::SIZE == Size::Dword, release)
}

// ========================================================================
// Software interrupts
// ========================================================================

/// CD: INT imm8. In V86 mode the instruction is IOPL-sensitive.
pub fn int_imm(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let vector = cpu.fetch_u8()?;
    if cpu.v86_mode() && cpu.iopl() != 3 {
        return Err(Fault::GeneralProtection(0));
    }
    cpu.clock(cpu.timings.int);
    Err(Fault::Interrupt(vector))
}

/// CC: INT3
pub fn int3(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    cpu.clock(cpu.timings.int);
    Err(Fault::Breakpoint)
}

/// CE: INTO
pub fn into(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    if cpu.of() {
        cpu.clock(cpu.timings.int);
        return Err(Fault::Overflow);
    }
    cpu.clock(3);
    Ok(())
}

/// CF: IRET/IRETD
pub fn iret<W: Width>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    cpu.interrupt_return(W::SIZE == Size::Dword)
}

// ========================================================================
// Group 5
// ========================================================================

/// FF: INC, DEC, CALL, CALL far, JMP, JMP far, PUSH on r/m
pub fn group_ff<W: Width, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let size = W::SIZE;
    let is486 = cpu.model.is_486_class();
    match m.reg {
        0 | 1 => inc_dec_rm::<W>(cpu, &m),
        2 => {
            let target = cpu.read_rm_w::<W>(&m)?;
            let target = cpu.near_target(target)?;
            cpu.push(size, cpu.eip)?;
            cpu.eip = target;
            cpu.clock_ea(size, if is486 { 5 } else { 7 }, if is486 { 5 } else { 10 }, if is486 { 5 } else { 10 });
            Ok(())
        }
        3 | 5 => {
            cpu.require_mem(&m)?;
            let offset = cpu.read_mem(size, m.seg, m.offset)?;
            let selector_addr = cpu.ea_offset(&m, size.bytes());
            let selector = cpu.read_mem_16(m.seg, selector_addr)?;
            let op32 = size == Size::Dword;
            if m.reg == 3 {
                cpu.far_call(selector, offset, op32)
            } else {
                cpu.far_jump(selector, offset, op32)
            }
        }
        4 => {
            let target = cpu.read_rm_w::<W>(&m)?;
            cpu.branch_to(target)?;
            cpu.clock_ea(size, if is486 { 5 } else { 7 }, if is486 { 5 } else { 10 }, if is486 { 5 } else { 10 });
            Ok(())
        }
        6 => {
            let value = cpu.read_rm_w::<W>(&m)?;
            cpu.push(size, value)?;
            cpu.clock_ea(size, if is486 { 1 } else { 2 }, if is486 { 4 } else { 5 }, if is486 { 4 } else { 5 });
            Ok(())
        }
        _ => Err(Fault::InvalidOpcode),
    }
}
