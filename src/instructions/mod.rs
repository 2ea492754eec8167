use crate::cpu::Cpu;
use crate::error::Result;
use crate::flags::Size;

pub mod utils;
pub mod tables;
pub mod prefix;
pub mod math;
pub mod logic;
pub mod control;
pub mod transfer;
pub mod string;
pub mod rep;
pub mod misc;
pub mod system;
pub mod fpu;
pub mod mmx;
pub mod amd3dnow;
pub mod syscall;
pub mod cyrix;
pub mod loadall;

/// An opcode handler. `fetchdat` holds the four code bytes following the
/// opcode, read without faulting; EIP already points at the first of them.
pub type OpFn = fn(&mut Cpu, u32) -> Result<()>;

/// Operand width chosen by the table slot a handler is instantiated into.
pub trait Width {
    const SIZE: Size;
}

pub struct Byte;
pub struct Word;
pub struct Dword;

impl Width for Byte {
    const SIZE: Size = Size::Byte;
}

impl Width for Word {
    const SIZE: Size = Size::Word;
}

impl Width for Dword {
    const SIZE: Size = Size::Dword;
}

/// Slot in a 1024-entry table: opcode byte, operand size, address size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpcodeIndex(u16);

impl OpcodeIndex {
    pub const COUNT: usize = 1024;

    pub fn new(opcode: u8, op32: bool, a32: bool) -> Self {
        Self(opcode as u16 | (op32 as u16) << 8 | (a32 as u16) << 9)
    }

    pub fn opcode(self) -> u8 {
        self.0 as u8
    }

    pub fn op32(self) -> bool {
        self.0 & 0x100 != 0
    }

    pub fn a32(self) -> bool {
        self.0 & 0x200 != 0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}
