use bitflags::bitflags;

use crate::cpu::Cpu;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CpuFlags: u32 {
        const CF = 0x0000_0001;
        const RESERVED = 0x0000_0002; // Bit 1 always reads as 1
        const PF = 0x0000_0004;
        const AF = 0x0000_0010;
        const ZF = 0x0000_0040;
        const SF = 0x0000_0080;
        const TF = 0x0000_0100;
        const IF = 0x0000_0200;
        const DF = 0x0000_0400;
        const OF = 0x0000_0800;
        const IOPL = 0x0000_3000;
        const NT = 0x0000_4000;
        const RF = 0x0001_0000;
        const VM = 0x0002_0000;
        const AC = 0x0004_0000;
        const VIF = 0x0008_0000;
        const VIP = 0x0010_0000;
        const ID = 0x0020_0000;

        // Condition codes staged lazily by the ALU
        const ARITH = Self::CF.bits() | Self::PF.bits() | Self::AF.bits() |
                      Self::ZF.bits() | Self::SF.bits() | Self::OF.bits();
    }
}

/// Operand width of an ALU operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Size {
    Byte,
    Word,
    Dword,
}

impl Size {
    pub const fn bits(self) -> u32 {
        match self {
            Size::Byte => 8,
            Size::Word => 16,
            Size::Dword => 32,
        }
    }

    pub const fn bytes(self) -> u32 {
        self.bits() / 8
    }

    pub const fn mask(self) -> u32 {
        match self {
            Size::Byte => 0xFF,
            Size::Word => 0xFFFF,
            Size::Dword => 0xFFFF_FFFF,
        }
    }

    pub const fn sign(self) -> u32 {
        1 << (self.bits() - 1)
    }

    /// Sign-extends the low `bits()` of `value` to 32 bits.
    pub const fn sign_extend(self, value: u32) -> u32 {
        match self {
            Size::Byte => value as u8 as i8 as i32 as u32,
            Size::Word => value as u16 as i16 as i32 as u32,
            Size::Dword => value,
        }
    }
}

const fn build_parity_table() -> [bool; 256] {
    let mut table = [false; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = (i as u8).count_ones() % 2 == 0;
        i += 1;
    }
    table
}

static PARITY: [bool; 256] = build_parity_table();

pub fn parity(value: u32) -> bool {
    PARITY[(value & 0xFF) as usize]
}

/// The operation whose operands are parked in [`LazyFlags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlagsOp {
    /// Flags register holds the authoritative values.
    #[default]
    Unknown,
    /// Logic result: CF, OF and AF cleared.
    Zn,
    Add,
    Adc,
    Sub,
    Sbc,
    /// INC and DEC keep CF from the flags register.
    Inc,
    Dec,
    Shl,
    Shr,
    Sar,
    /// Rotates only define CF and OF; the rest stays in the flags register.
    Rol,
    Ror,
}

/// Deferred condition-code state: the result and operands of the last
/// flag-producing operation. Flags are computed only when read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LazyFlags {
    pub op: FlagsOp,
    pub size: Size,
    pub res: u32,
    pub op1: u32,
    pub op2: u32,
}

impl Default for LazyFlags {
    fn default() -> Self {
        Self {
            op: FlagsOp::Unknown,
            size: Size::Byte,
            res: 0,
            op1: 0,
            op2: 0,
        }
    }
}

impl LazyFlags {
    fn keeps_result_flags(&self) -> bool {
        matches!(self.op, FlagsOp::Unknown | FlagsOp::Rol | FlagsOp::Ror)
    }

    pub fn cf(&self, stored: CpuFlags) -> bool {
        let sign = self.size.sign();
        let mask = self.size.mask();
        match self.op {
            FlagsOp::Zn => false,
            FlagsOp::Add => (self.res & mask) < (self.op1 & mask),
            FlagsOp::Adc => {
                self.res < self.op1 || (self.res == self.op1 && self.op2 == mask)
            }
            FlagsOp::Sub => self.op1 < self.op2,
            FlagsOp::Sbc => self.op1 < self.op2 || (self.op1 == self.op2 && self.res != 0),
            FlagsOp::Shl => (self.op1 << (self.op2 - 1)) & sign != 0,
            FlagsOp::Shr => (self.op1 >> (self.op2 - 1)) & 1 != 0,
            FlagsOp::Sar => {
                let signed = self.size.sign_extend(self.op1) as i32;
                (signed >> (self.op2 - 1)) & 1 != 0
            }
            FlagsOp::Rol => self.res & 1 != 0,
            FlagsOp::Ror => self.res & sign != 0,
            FlagsOp::Inc | FlagsOp::Dec | FlagsOp::Unknown => stored.contains(CpuFlags::CF),
        }
    }

    pub fn zf(&self, stored: CpuFlags) -> bool {
        if self.keeps_result_flags() {
            return stored.contains(CpuFlags::ZF);
        }
        self.res & self.size.mask() == 0
    }

    pub fn sf(&self, stored: CpuFlags) -> bool {
        if self.keeps_result_flags() {
            return stored.contains(CpuFlags::SF);
        }
        self.res & self.size.sign() != 0
    }

    pub fn pf(&self, stored: CpuFlags) -> bool {
        if self.keeps_result_flags() {
            return stored.contains(CpuFlags::PF);
        }
        parity(self.res)
    }

    pub fn af(&self, stored: CpuFlags) -> bool {
        match self.op {
            FlagsOp::Add
            | FlagsOp::Adc
            | FlagsOp::Sub
            | FlagsOp::Sbc
            | FlagsOp::Inc
            | FlagsOp::Dec => (self.op1 ^ self.op2 ^ self.res) & 0x10 != 0,
            FlagsOp::Zn | FlagsOp::Shl | FlagsOp::Shr | FlagsOp::Sar => false,
            FlagsOp::Rol | FlagsOp::Ror | FlagsOp::Unknown => stored.contains(CpuFlags::AF),
        }
    }

    pub fn of(&self, stored: CpuFlags) -> bool {
        let sign = self.size.sign();
        match self.op {
            FlagsOp::Zn | FlagsOp::Sar => false,
            FlagsOp::Add | FlagsOp::Adc | FlagsOp::Inc => {
                (!(self.op1 ^ self.op2) & (self.op1 ^ self.res)) & sign != 0
            }
            FlagsOp::Sub | FlagsOp::Sbc | FlagsOp::Dec => {
                ((self.op1 ^ self.op2) & (self.op1 ^ self.res)) & sign != 0
            }
            FlagsOp::Shl => {
                ((self.op1 << self.op2) ^ (self.op1 << (self.op2 - 1))) & sign != 0
            }
            FlagsOp::Shr => self.op2 == 1 && self.op1 & sign != 0,
            FlagsOp::Rol => (self.res ^ (self.res >> (self.size.bits() - 1))) & 1 != 0,
            FlagsOp::Ror => (self.res ^ (self.res >> 1)) & (sign >> 1) != 0,
            FlagsOp::Unknown => stored.contains(CpuFlags::OF),
        }
    }

    /// Folds the staged operation into `stored` and returns the result.
    pub fn materialize(&self, stored: CpuFlags) -> CpuFlags {
        if self.op == FlagsOp::Unknown {
            return stored;
        }
        let mut flags = stored - CpuFlags::ARITH;
        flags.set(CpuFlags::CF, self.cf(stored));
        flags.set(CpuFlags::PF, self.pf(stored));
        flags.set(CpuFlags::AF, self.af(stored));
        flags.set(CpuFlags::ZF, self.zf(stored));
        flags.set(CpuFlags::SF, self.sf(stored));
        flags.set(CpuFlags::OF, self.of(stored));
        flags
    }
}

// ========================================================================
// Flag access on the CPU
// ========================================================================

impl Cpu {
    /// Commits any staged arithmetic flags into the flags register.
    pub fn flags_rebuild(&mut self) {
        if self.lazy.op != FlagsOp::Unknown {
            self.flags = self.lazy.materialize(self.flags);
            self.lazy.op = FlagsOp::Unknown;
        }
    }

    /// Commits only CF, leaving the staged operation in place.
    pub fn flags_rebuild_c(&mut self) {
        if self.lazy.op != FlagsOp::Unknown {
            let cf = self.lazy.cf(self.flags);
            self.flags.set(CpuFlags::CF, cf);
        }
    }

    pub fn get_cpu_flags(&self) -> CpuFlags {
        self.lazy.materialize(self.flags)
    }

    // Helper to get a flag state
    pub fn get_cpu_flag(&self, mask: CpuFlags) -> bool {
        if mask.intersects(CpuFlags::ARITH) {
            self.get_cpu_flags().intersects(mask)
        } else {
            self.flags.intersects(mask)
        }
    }

    // Helper to set/clear a flag
    pub fn set_cpu_flag(&mut self, mask: CpuFlags, value: bool) {
        if mask.intersects(CpuFlags::ARITH) {
            self.flags_rebuild();
        }
        self.flags.set(mask, value);
    }

    /// Replaces the whole flags register. Callers apply their own
    /// writable-bit mask; bit 1 is forced on.
    pub fn set_cpu_flags(&mut self, new_flags: CpuFlags) {
        self.lazy.op = FlagsOp::Unknown;
        self.flags = new_flags | CpuFlags::RESERVED;
    }

    pub fn cf(&self) -> bool {
        self.lazy.cf(self.flags)
    }

    pub fn zf(&self) -> bool {
        self.lazy.zf(self.flags)
    }

    pub fn sf(&self) -> bool {
        self.lazy.sf(self.flags)
    }

    pub fn of(&self) -> bool {
        self.lazy.of(self.flags)
    }

    pub fn pf(&self) -> bool {
        self.lazy.pf(self.flags)
    }

    pub fn dflag(&self) -> bool {
        self.flags.contains(CpuFlags::DF)
    }

    pub fn set_dflag(&mut self, value: bool) {
        self.flags.set(CpuFlags::DF, value);
    }

    pub fn iopl(&self) -> u8 {
        ((self.flags.bits() >> 12) & 3) as u8
    }

    /// Evaluates condition code `cc` (low nibble of Jcc/SETcc/CMOVcc).
    pub fn condition(&self, cc: u8) -> bool {
        let result = match (cc >> 1) & 7 {
            0 => self.of(),
            1 => self.cf(),
            2 => self.zf(),
            3 => self.cf() || self.zf(),
            4 => self.sf(),
            5 => self.pf(),
            6 => self.sf() != self.of(),
            _ => self.zf() || (self.sf() != self.of()),
        };
        result ^ (cc & 1 != 0)
    }

    // ====================================================================
    // ALU primitives
    // ====================================================================

    fn stage(&mut self, op: FlagsOp, size: Size, res: u32, op1: u32, op2: u32) {
        self.lazy = LazyFlags { op, size, res, op1, op2 };
    }

    pub fn set_znp(&mut self, size: Size, value: u32) {
        self.stage(FlagsOp::Zn, size, value & size.mask(), 0, 0);
    }

    pub fn alu_add(&mut self, size: Size, dest: u32, src: u32) -> u32 {
        let (a, b) = (dest & size.mask(), src & size.mask());
        let res = a.wrapping_add(b) & size.mask();
        self.stage(FlagsOp::Add, size, res, a, b);
        res
    }

    pub fn alu_adc(&mut self, size: Size, dest: u32, src: u32) -> u32 {
        let carry = self.cf() as u32;
        let (a, b) = (dest & size.mask(), src & size.mask());
        let res = a.wrapping_add(b).wrapping_add(carry) & size.mask();
        // Carry-in 0 degenerates to a plain add
        let op = if carry != 0 { FlagsOp::Adc } else { FlagsOp::Add };
        self.stage(op, size, res, a, b);
        res
    }

    pub fn alu_sub(&mut self, size: Size, dest: u32, src: u32) -> u32 {
        let (a, b) = (dest & size.mask(), src & size.mask());
        let res = a.wrapping_sub(b) & size.mask();
        self.stage(FlagsOp::Sub, size, res, a, b);
        res
    }

    pub fn alu_sbb(&mut self, size: Size, dest: u32, src: u32) -> u32 {
        let borrow = self.cf() as u32;
        let (a, b) = (dest & size.mask(), src & size.mask());
        let res = a.wrapping_sub(b).wrapping_sub(borrow) & size.mask();
        let op = if borrow != 0 { FlagsOp::Sbc } else { FlagsOp::Sub };
        self.stage(op, size, res, a, b);
        res
    }

    pub fn alu_inc(&mut self, size: Size, dest: u32) -> u32 {
        self.flags_rebuild_c();
        let a = dest & size.mask();
        let res = a.wrapping_add(1) & size.mask();
        self.stage(FlagsOp::Inc, size, res, a, 1);
        res
    }

    pub fn alu_dec(&mut self, size: Size, dest: u32) -> u32 {
        self.flags_rebuild_c();
        let a = dest & size.mask();
        let res = a.wrapping_sub(1) & size.mask();
        self.stage(FlagsOp::Dec, size, res, a, 1);
        res
    }

    pub fn alu_and(&mut self, size: Size, dest: u32, src: u32) -> u32 {
        let res = dest & src & size.mask();
        self.set_znp(size, res);
        res
    }

    pub fn alu_or(&mut self, size: Size, dest: u32, src: u32) -> u32 {
        let res = (dest | src) & size.mask();
        self.set_znp(size, res);
        res
    }

    pub fn alu_xor(&mut self, size: Size, dest: u32, src: u32) -> u32 {
        let res = (dest ^ src) & size.mask();
        self.set_znp(size, res);
        res
    }

    /// SHL/SAL with a pre-masked, non-zero count.
    pub fn alu_shl(&mut self, size: Size, dest: u32, count: u32) -> u32 {
        let a = dest & size.mask();
        let res = if count >= 32 { 0 } else { (a << count) & size.mask() };
        if count <= size.bits() {
            self.stage(FlagsOp::Shl, size, res, a, count);
        } else {
            // Every bit shifted out; flags follow the zero result
            self.stage(FlagsOp::Zn, size, res, 0, 0);
        }
        res
    }

    pub fn alu_shr(&mut self, size: Size, dest: u32, count: u32) -> u32 {
        let a = dest & size.mask();
        let res = if count >= 32 { 0 } else { a >> count };
        if count <= size.bits() {
            self.stage(FlagsOp::Shr, size, res, a, count);
        } else {
            self.stage(FlagsOp::Zn, size, res, 0, 0);
        }
        res
    }

    pub fn alu_sar(&mut self, size: Size, dest: u32, count: u32) -> u32 {
        let a = dest & size.mask();
        let signed = size.sign_extend(a) as i32;
        let res = (signed >> count.min(31)) as u32 & size.mask();
        let staged = count.min(size.bits());
        self.stage(FlagsOp::Sar, size, res, a, staged);
        res
    }

    pub fn alu_rol(&mut self, size: Size, dest: u32, count: u32) -> u32 {
        let bits = size.bits();
        let a = dest & size.mask();
        let n = count % bits;
        let res = if n == 0 { a } else { ((a << n) | (a >> (bits - n))) & size.mask() };
        self.flags_rebuild();
        self.stage(FlagsOp::Rol, size, res, a, count);
        res
    }

    pub fn alu_ror(&mut self, size: Size, dest: u32, count: u32) -> u32 {
        let bits = size.bits();
        let a = dest & size.mask();
        let n = count % bits;
        let res = if n == 0 { a } else { ((a >> n) | (a << (bits - n))) & size.mask() };
        self.flags_rebuild();
        self.stage(FlagsOp::Ror, size, res, a, count);
        res
    }

    /// Rotate through carry; flags are computed eagerly.
    pub fn alu_rcl(&mut self, size: Size, dest: u32, count: u32) -> u32 {
        self.flags_rebuild();
        let bits = size.bits();
        let mut value = dest & size.mask();
        let mut carry = self.flags.contains(CpuFlags::CF);
        for _ in 0..count % (bits + 1) {
            let out = value & size.sign() != 0;
            value = ((value << 1) | carry as u32) & size.mask();
            carry = out;
        }
        self.flags.set(CpuFlags::CF, carry);
        self.flags.set(
            CpuFlags::OF,
            (value & size.sign() != 0) != carry,
        );
        value
    }

    pub fn alu_rcr(&mut self, size: Size, dest: u32, count: u32) -> u32 {
        self.flags_rebuild();
        let bits = size.bits();
        let mut value = dest & size.mask();
        let mut carry = self.flags.contains(CpuFlags::CF);
        for _ in 0..count % (bits + 1) {
            let out = value & 1 != 0;
            value = (value >> 1) | if carry { size.sign() } else { 0 };
            carry = out;
        }
        self.flags.set(CpuFlags::CF, carry);
        let top = value & size.sign() != 0;
        let next = value & (size.sign() >> 1) != 0;
        self.flags.set(CpuFlags::OF, top != next);
        value
    }
}
