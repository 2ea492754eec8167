use crate::cpu::Cpu;
use crate::error::{Fault, Result};
use crate::segment::SegReg;

use super::rep::RepKind;

impl Cpu {
    /// Dispatches the next opcode of the instruction in flight through the
    /// tables for the current prefix state. Prefix handlers land here after
    /// recording their effect.
    pub fn dispatch_next(&mut self) -> Result<()> {
        let opcode = self.fetch_u8()?;
        let fetchdat = self.peek_fetchdat();
        let handler = self.tables.lookup(opcode, self.op32, self.a32, self.rep_prefix);
        handler(self, fetchdat)
    }
}

/// 26/2E/36/3E/64/65: segment override.
pub fn seg_override<const SEG: u8>(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    cpu.seg_override = SegReg::from_index(SEG);
    cpu.clock(4);
    cpu.dispatch_next()
}

/// 66: operand size is the opposite of the code segment default.
pub fn op_size(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    cpu.op32 = !cpu.use32();
    cpu.clock(2);
    cpu.dispatch_next()
}

/// 67: address size override.
pub fn addr_size(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    cpu.a32 = !cpu.use32();
    cpu.clock(2);
    cpu.dispatch_next()
}

/// F0: bus lock. Only the cycle charge is modelled; LOCK NOP is rejected.
pub fn lock(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    if fetchdat as u8 == 0x90 {
        return Err(Fault::InvalidOpcode);
    }
    cpu.clock(4);
    cpu.dispatch_next()
}

/// F3: REP/REPE.
pub fn repe(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    cpu.rep_prefix = Some(RepKind::Repe);
    cpu.clock(2);
    cpu.dispatch_next()
}

/// F2: REPNE.
pub fn repne(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    cpu.rep_prefix = Some(RepKind::Repne);
    cpu.clock(2);
    cpu.dispatch_next()
}

/// 0F: two-byte opcode escape.
pub fn escape_0f(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    let opcode = cpu.fetch_u8()?;
    let fetchdat = cpu.peek_fetchdat();
    let handler = cpu.tables.lookup_ext(opcode, cpu.op32, cpu.a32);
    handler(cpu, fetchdat)
}

/// Trampoline for every slot the active model leaves undefined.
pub fn illegal(_cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    Err(Fault::InvalidOpcode)
}
