use crate::cpu::Cpu;
use crate::error::Result;
use crate::segment::SegReg;

/// How the shared x87/MMX register storage is currently interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegisterMode {
    #[default]
    X87,
    Mmx,
}

/// The eight physical x87 registers. MMX registers alias the 64-bit
/// significand of each entry; the tag word and TOP decide which view is live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FpuRegisterFile {
    pub significand: [u64; 8],
    pub exponent: [u16; 8],
    pub control: u16,
    pub status: u16,
    pub tag: u16,
    pub mode: RegisterMode,
}

impl Default for FpuRegisterFile {
    fn default() -> Self {
        Self {
            significand: [0; 8],
            exponent: [0; 8],
            control: 0x037F,
            status: 0,
            tag: 0xFFFF,
            mode: RegisterMode::X87,
        }
    }
}

impl FpuRegisterFile {
    pub fn top(&self) -> u8 {
        ((self.status >> 11) & 7) as u8
    }

    /// Switches the storage to the MMX view: every tag valid, TOP = 0.
    pub fn enter_mmx(&mut self) {
        if self.mode != RegisterMode::Mmx {
            log::trace!("[FPU] register file switched to MMX");
        }
        self.tag = 0;
        self.status &= !(7 << 11);
        self.mode = RegisterMode::Mmx;
    }

    /// EMMS/FEMMS: mark every register empty and hand the file back to x87.
    pub fn emms(&mut self) {
        self.tag = 0xFFFF;
        self.mode = RegisterMode::X87;
    }

    pub fn mmx(&self, reg: usize) -> u64 {
        self.significand[reg & 7]
    }

    /// MMX writes set the aliased exponent to all ones, as the hardware does.
    pub fn set_mmx(&mut self, reg: usize, value: u64) {
        self.significand[reg & 7] = value;
        self.exponent[reg & 7] = 0xFFFF;
    }
}

/// Memory operand of an FPU escape, already resolved by the ModRM decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscapeOp {
    /// D8..DF
    pub opcode: u8,
    pub modrm: u8,
    pub operand: Option<(SegReg, u32)>,
}

/// The numeric core behind the D8-DF escapes.
///
/// The CPU owns decoding, #NM checks and operand addressing; an
/// implementation only performs the arithmetic, reading and writing memory
/// through the `Cpu` it is handed.
pub trait Coprocessor {
    fn reset(&mut self);

    fn escape(&mut self, cpu: &mut Cpu, op: EscapeOp) -> Result<()>;

    /// WAIT/FWAIT: deliver any pending unmasked exception.
    fn wait(&mut self, _cpu: &mut Cpu) -> Result<()> {
        Ok(())
    }
}
