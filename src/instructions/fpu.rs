use crate::cpu::{Cpu, CR0_EM, CR0_MP, CR0_TS};
use crate::error::{Fault, Result};
use crate::fpu::EscapeOp;

/// D8-DF: x87 escape. The CPU side decodes the operand and raises #NM;
/// the arithmetic belongs to the installed coprocessor. An empty socket
/// swallows the instruction, so FNSTSW/FNSTCW probes leave memory as it was.
pub fn escape<const OPCODE: u8, const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    if cpu.cr0 & (CR0_EM | CR0_TS) != 0 {
        return Err(Fault::DeviceNotAvailable);
    }
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let op = EscapeOp {
        opcode: OPCODE,
        modrm: fetchdat as u8,
        operand: (!m.is_reg()).then_some((m.seg, m.offset)),
    };
    if let Some(mut copro) = cpu.coprocessor.take() {
        let result = copro.escape(cpu, op);
        cpu.coprocessor = Some(copro);
        result?;
    } else {
        log::trace!("[FPU] escape {:02X} {:02X} with no coprocessor", OPCODE, op.modrm);
    }
    cpu.clock(if cpu.model.is_486_class() { 3 } else { 6 });
    Ok(())
}

/// 9B: WAIT/FWAIT
pub fn wait(cpu: &mut Cpu, _fetchdat: u32) -> Result<()> {
    if cpu.cr0 & (CR0_TS | CR0_MP) == (CR0_TS | CR0_MP) {
        return Err(Fault::DeviceNotAvailable);
    }
    if let Some(mut copro) = cpu.coprocessor.take() {
        let result = copro.wait(cpu);
        cpu.coprocessor = Some(copro);
        result?;
    }
    cpu.clock(if cpu.model.is_486_class() { 1 } else { 3 });
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::config::{CpuConfig, CpuModel};
    use crate::cpu::{Cpu, CR0_EM, CR0_MP, CR0_TS};
    use crate::error::{Fault, Result};
    use crate::fpu::{Coprocessor, EscapeOp};
    use crate::segment::SegReg;

    fn cpu() -> Cpu {
        let mut cpu = Cpu::new(CpuConfig::new(CpuModel::I486Dx));
        cpu.load_cs_real(0);
        cpu.eip = 0x100;
        cpu.oldpc = 0x100;
        cpu
    }

    /// Stores 0x037F for any memory-form escape.
    struct ControlWordStub;

    impl Coprocessor for ControlWordStub {
        fn reset(&mut self) {}

        fn escape(&mut self, cpu: &mut Cpu, op: EscapeOp) -> Result<()> {
            if let Some((seg, offset)) = op.operand {
                cpu.write_mem_16(seg, offset, 0x037F)?;
            }
            Ok(())
        }
    }

    #[test]
    fn empty_socket_leaves_memory_alone() {
        // D9 3E 00 20: FNSTCW [2000]
        let mut cpu = cpu();
        cpu.bus.load(0x100, &[0x3E, 0x00, 0x20]);
        cpu.bus.write_16(0x2000, 0x5A5A);
        let fetchdat = cpu.peek_fetchdat();
        super::escape::<0xD9, false>(&mut cpu, fetchdat).unwrap();
        assert_eq!(cpu.bus.read_16(0x2000), 0x5A5A);
        assert_eq!(cpu.eip, 0x103);
    }

    #[test]
    fn installed_coprocessor_sees_operand() {
        let mut cpu = cpu();
        cpu.coprocessor = Some(Box::new(ControlWordStub));
        cpu.bus.load(0x100, &[0x3E, 0x00, 0x20]);
        let fetchdat = cpu.peek_fetchdat();
        super::escape::<0xD9, false>(&mut cpu, fetchdat).unwrap();
        assert_eq!(cpu.read_mem_16(SegReg::Ds, 0x2000), Ok(0x037F));
        assert!(cpu.coprocessor.is_some());
    }

    #[test]
    fn em_and_ts_raise_nm() {
        let mut cpu = cpu();
        cpu.cr0 |= CR0_EM;
        assert_eq!(super::escape::<0xD8, false>(&mut cpu, 0xC1), Err(Fault::DeviceNotAvailable));
        cpu.cr0 = CR0_TS;
        assert_eq!(super::wait(&mut cpu, 0), Ok(()));
        cpu.cr0 = CR0_TS | CR0_MP;
        assert_eq!(super::wait(&mut cpu, 0), Err(Fault::DeviceNotAvailable));
    }
}
