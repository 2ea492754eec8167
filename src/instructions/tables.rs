use crate::config::{CpuModel, Features};

use super::amd3dnow::{amd3dnow, femms, prefetch};
use super::control::*;
use super::cyrix::{rsdc, rsldt, rsts, svdc, svldt, svts};
use super::fpu::{escape, wait};
use super::loadall::{loadall, loadall386};
use super::logic::*;
use super::math::*;
use super::misc::*;
use super::mmx::{emms, mmx_op};
use super::prefix::*;
use super::rep::{rep_string, RepKind};
use super::string::*;
use super::syscall::{syscall, sysret};
use super::system::*;
use super::transfer::*;
use super::{Byte, Dword, OpFn, OpcodeIndex, Word};

// Slot builders. Each expands to the four handlers of one opcode, ordered
// by `op32 | a32 << 1`. Constant arguments are passed through in order; the
// address-size flag, where a handler takes one, always comes last.

/// Same handler in every slot.
macro_rules! one {
    ($h:ident) => {
        [$h as OpFn; 4]
    };
}

/// Constant-only generics.
macro_rules! c {
    ($h:ident, $($c:expr),+) => {
        [$h::<$({ $c }),+> as OpFn; 4]
    };
}

/// Byte operand.
macro_rules! b {
    ($h:ident $(, $c:expr)*) => {
        [$h::<Byte $(, { $c })*> as OpFn; 4]
    };
}

/// Word or dword operand by operand size.
macro_rules! w {
    ($h:ident $(, $c:expr)*) => {
        [
            $h::<Word $(, { $c })*> as OpFn,
            $h::<Dword $(, { $c })*> as OpFn,
            $h::<Word $(, { $c })*> as OpFn,
            $h::<Dword $(, { $c })*> as OpFn,
        ]
    };
}

/// Address size only.
macro_rules! a {
    ($h:ident $(, $c:expr)*) => {
        [
            $h::<$({ $c },)* false> as OpFn,
            $h::<$({ $c },)* false> as OpFn,
            $h::<$({ $c },)* true> as OpFn,
            $h::<$({ $c },)* true> as OpFn,
        ]
    };
}

/// Byte operand with a ModRM address.
macro_rules! ba {
    ($h:ident $(, $c:expr)*) => {
        [
            $h::<Byte $(, { $c })*, false> as OpFn,
            $h::<Byte $(, { $c })*, false> as OpFn,
            $h::<Byte $(, { $c })*, true> as OpFn,
            $h::<Byte $(, { $c })*, true> as OpFn,
        ]
    };
}

/// Word or dword operand with a ModRM address.
macro_rules! wa {
    ($h:ident $(, $c:expr)*) => {
        [
            $h::<Word $(, { $c })*, false> as OpFn,
            $h::<Dword $(, { $c })*, false> as OpFn,
            $h::<Word $(, { $c })*, true> as OpFn,
            $h::<Dword $(, { $c })*, true> as OpFn,
        ]
    };
}

/// Eight consecutive opcodes, the low three bits naming a register.
macro_rules! per_reg {
    ($t:ident.$set:ident($op:expr, $mac:ident!($($args:tt)*))) => {
        $t.$set($op, $mac!($($args)*, 0));
        $t.$set($op + 1, $mac!($($args)*, 1));
        $t.$set($op + 2, $mac!($($args)*, 2));
        $t.$set($op + 3, $mac!($($args)*, 3));
        $t.$set($op + 4, $mac!($($args)*, 4));
        $t.$set($op + 5, $mac!($($args)*, 5));
        $t.$set($op + 6, $mac!($($args)*, 6));
        $t.$set($op + 7, $mac!($($args)*, 7));
    };
}

/// Sixteen consecutive opcodes, the low nibble naming a condition.
macro_rules! per_cc {
    ($t:ident.$set:ident($op:expr, $mac:ident!($($args:tt)*))) => {
        $t.$set($op, $mac!($($args)*, 0));
        $t.$set($op + 1, $mac!($($args)*, 1));
        $t.$set($op + 2, $mac!($($args)*, 2));
        $t.$set($op + 3, $mac!($($args)*, 3));
        $t.$set($op + 4, $mac!($($args)*, 4));
        $t.$set($op + 5, $mac!($($args)*, 5));
        $t.$set($op + 6, $mac!($($args)*, 6));
        $t.$set($op + 7, $mac!($($args)*, 7));
        $t.$set($op + 8, $mac!($($args)*, 8));
        $t.$set($op + 9, $mac!($($args)*, 9));
        $t.$set($op + 10, $mac!($($args)*, 10));
        $t.$set($op + 11, $mac!($($args)*, 11));
        $t.$set($op + 12, $mac!($($args)*, 12));
        $t.$set($op + 13, $mac!($($args)*, 13));
        $t.$set($op + 14, $mac!($($args)*, 14));
        $t.$set($op + 15, $mac!($($args)*, 15));
    };
}

/// The eight ALU operations at `op`: r/m,r and r,r/m in both widths, then
/// the accumulator-immediate pair.
macro_rules! alu_row {
    ($t:ident, $op:expr, $kind:expr) => {
        $t.base($op, ba!(alu_rm_r, $kind));
        $t.base($op + 1, wa!(alu_rm_r, $kind));
        $t.base($op + 2, ba!(alu_r_rm, $kind));
        $t.base($op + 3, wa!(alu_r_rm, $kind));
        $t.base($op + 4, b!(alu_acc_imm, $kind));
        $t.base($op + 5, w!(alu_acc_imm, $kind));
    };
}

/// Handler tables for one CPU model. Each table has a slot per opcode,
/// operand size and address size; slots the model does not define hold
/// the illegal-opcode trampoline.
pub struct OpcodeTables {
    model: CpuModel,
    base: [OpFn; OpcodeIndex::COUNT],
    ext: [OpFn; OpcodeIndex::COUNT],
    repe: [Option<OpFn>; OpcodeIndex::COUNT],
    repne: [Option<OpFn>; OpcodeIndex::COUNT],
}

impl OpcodeTables {
    /// Builds the tables by layering each generation's additions over the
    /// previous one, then the feature-gated extensions.
    pub fn for_model(model: CpuModel) -> Self {
        let mut t = Self {
            model,
            base: [illegal as OpFn; OpcodeIndex::COUNT],
            ext: [illegal as OpFn; OpcodeIndex::COUNT],
            repe: [None; OpcodeIndex::COUNT],
            repne: [None; OpcodeIndex::COUNT],
        };
        t.install_286();
        if model.is_386_class() {
            t.install_386();
        }
        if model.is_486_class() {
            t.install_486();
        }
        t.install_features(model.features());
        log::debug!("[CPU] opcode tables built for {:?}", model);
        t
    }

    pub fn model(&self) -> CpuModel {
        self.model
    }

    /// Handler for a one-byte opcode under the current prefix state. REP
    /// tables only override the string slots.
    pub fn lookup(&self, opcode: u8, op32: bool, a32: bool, rep: Option<RepKind>) -> OpFn {
        let idx = OpcodeIndex::new(opcode, op32, a32).as_usize();
        let over = match rep {
            Some(RepKind::Repe) => self.repe[idx],
            Some(RepKind::Repne) => self.repne[idx],
            None => None,
        };
        over.unwrap_or(self.base[idx])
    }

    /// Handler for the byte following 0F.
    pub fn lookup_ext(&self, opcode: u8, op32: bool, a32: bool) -> OpFn {
        self.ext[OpcodeIndex::new(opcode, op32, a32).as_usize()]
    }

    fn slots(opcode: u8) -> impl Iterator<Item = usize> {
        (0..4).map(move |mode| OpcodeIndex::new(opcode, mode & 1 != 0, mode & 2 != 0).as_usize())
    }

    fn base(&mut self, opcode: u8, handlers: [OpFn; 4]) {
        for (idx, h) in Self::slots(opcode).zip(handlers) {
            self.base[idx] = h;
        }
    }

    fn ext(&mut self, opcode: u8, handlers: [OpFn; 4]) {
        for (idx, h) in Self::slots(opcode).zip(handlers) {
            self.ext[idx] = h;
        }
    }

    fn clear_ext(&mut self, opcode: u8) {
        self.ext(opcode, one!(illegal));
    }

    /// Same handler under F3 and F2; the handler reads the prefix kind.
    fn rep(&mut self, opcode: u8, handlers: [OpFn; 4]) {
        for (idx, h) in Self::slots(opcode).zip(handlers) {
            self.repe[idx] = Some(h);
            self.repne[idx] = Some(h);
        }
    }

    fn string(&mut self, opcode: u8, byte: [OpFn; 4], wide: [OpFn; 4], rep_byte: [OpFn; 4], rep_wide: [OpFn; 4]) {
        self.base(opcode, byte);
        self.base(opcode + 1, wide);
        self.rep(opcode, rep_byte);
        self.rep(opcode + 1, rep_wide);
    }

    /// The 286 set, including the 186 additions and the 286 system
    /// opcodes. Operand and address size prefixes do not exist yet.
    fn install_286(&mut self) {
        let t = self;
        alu_row!(t, 0x00, ADD);
        alu_row!(t, 0x08, OR);
        alu_row!(t, 0x10, ADC);
        alu_row!(t, 0x18, SBB);
        alu_row!(t, 0x20, AND);
        alu_row!(t, 0x28, SUB);
        alu_row!(t, 0x30, XOR);
        alu_row!(t, 0x38, CMP);

        t.base(0x06, w!(push_sreg, 0));
        t.base(0x07, w!(pop_sreg, 0));
        t.base(0x0E, w!(push_sreg, 1));
        t.base(0x0F, one!(escape_0f));
        t.base(0x16, w!(push_sreg, 2));
        t.base(0x17, w!(pop_sreg, 2));
        t.base(0x1E, w!(push_sreg, 3));
        t.base(0x1F, w!(pop_sreg, 3));
        t.base(0x26, c!(seg_override, 0));
        t.base(0x27, one!(daa));
        t.base(0x2E, c!(seg_override, 1));
        t.base(0x2F, one!(das));
        t.base(0x36, c!(seg_override, 2));
        t.base(0x37, one!(aaa));
        t.base(0x3E, c!(seg_override, 3));
        t.base(0x3F, one!(aas));

        per_reg!(t.base(0x40, w!(inc_dec_reg, false)));
        per_reg!(t.base(0x48, w!(inc_dec_reg, true)));
        per_reg!(t.base(0x50, w!(push_reg)));
        per_reg!(t.base(0x58, w!(pop_reg)));

        t.base(0x60, w!(pusha));
        t.base(0x61, w!(popa));
        t.base(0x62, wa!(bound));
        t.base(0x63, a!(arpl));
        t.base(0x68, w!(push_imm, false));
        t.base(0x69, wa!(imul_imm, false));
        t.base(0x6A, w!(push_imm, true));
        t.base(0x6B, wa!(imul_imm, true));
        t.string(0x6C, b!(string_once, INS), w!(string_once, INS), b!(rep_string, INS), w!(rep_string, INS));
        t.string(0x6E, b!(string_once, OUTS), w!(string_once, OUTS), b!(rep_string, OUTS), w!(rep_string, OUTS));

        per_cc!(t.base(0x70, c!(jcc_short)));

        t.base(0x80, ba!(group1, false));
        t.base(0x81, wa!(group1, false));
        t.base(0x82, ba!(group1, false));
        t.base(0x83, wa!(group1, true));
        t.base(0x84, ba!(test_rm_r));
        t.base(0x85, wa!(test_rm_r));
        t.base(0x86, ba!(xchg_rm_r));
        t.base(0x87, wa!(xchg_rm_r));
        t.base(0x88, ba!(mov_rm_r));
        t.base(0x89, wa!(mov_rm_r));
        t.base(0x8A, ba!(mov_r_rm));
        t.base(0x8B, wa!(mov_r_rm));
        t.base(0x8C, wa!(mov_rm_sreg));
        t.base(0x8D, wa!(lea));
        t.base(0x8E, a!(mov_sreg_rm));
        t.base(0x8F, wa!(pop_rm));

        per_reg!(t.base(0x90, w!(xchg_acc)));
        t.base(0x90, one!(nop));
        t.base(0x98, w!(cbw));
        t.base(0x99, w!(cwd));
        t.base(0x9A, w!(call_far));
        t.base(0x9B, one!(wait));
        t.base(0x9C, w!(pushf));
        t.base(0x9D, w!(popf));
        t.base(0x9E, one!(sahf));
        t.base(0x9F, one!(lahf));

        t.base(0xA0, ba!(mov_acc_moffs, false));
        t.base(0xA1, wa!(mov_acc_moffs, false));
        t.base(0xA2, ba!(mov_acc_moffs, true));
        t.base(0xA3, wa!(mov_acc_moffs, true));
        t.string(0xA4, b!(string_once, MOVS), w!(string_once, MOVS), b!(rep_string, MOVS), w!(rep_string, MOVS));
        t.string(0xA6, b!(string_once, CMPS), w!(string_once, CMPS), b!(rep_string, CMPS), w!(rep_string, CMPS));
        t.base(0xA8, b!(test_acc_imm));
        t.base(0xA9, w!(test_acc_imm));
        t.string(0xAA, b!(string_once, STOS), w!(string_once, STOS), b!(rep_string, STOS), w!(rep_string, STOS));
        t.string(0xAC, b!(string_once, LODS), w!(string_once, LODS), b!(rep_string, LODS), w!(rep_string, LODS));
        t.string(0xAE, b!(string_once, SCAS), w!(string_once, SCAS), b!(rep_string, SCAS), w!(rep_string, SCAS));

        per_reg!(t.base(0xB0, b!(mov_r_imm)));
        per_reg!(t.base(0xB8, w!(mov_r_imm)));

        t.base(0xC0, ba!(group2, BY_IMM));
        t.base(0xC1, wa!(group2, BY_IMM));
        t.base(0xC2, w!(ret_near, true));
        t.base(0xC3, w!(ret_near, false));
        t.base(0xC4, wa!(load_far_ptr, 0));
        t.base(0xC5, wa!(load_far_ptr, 3));
        t.base(0xC6, ba!(mov_rm_imm));
        t.base(0xC7, wa!(mov_rm_imm));
        t.base(0xC8, w!(enter));
        t.base(0xC9, w!(leave));
        t.base(0xCA, w!(retf, true));
        t.base(0xCB, w!(retf, false));
        t.base(0xCC, one!(int3));
        t.base(0xCD, one!(int_imm));
        t.base(0xCE, one!(into));
        t.base(0xCF, w!(iret));

        t.base(0xD0, ba!(group2, BY_ONE));
        t.base(0xD1, wa!(group2, BY_ONE));
        t.base(0xD2, ba!(group2, BY_CL));
        t.base(0xD3, wa!(group2, BY_CL));
        t.base(0xD4, one!(aam));
        t.base(0xD5, one!(aad));
        t.base(0xD6, one!(salc));
        t.base(0xD7, a!(xlat));
        t.base(0xD8, a!(escape, 0xD8));
        t.base(0xD9, a!(escape, 0xD9));
        t.base(0xDA, a!(escape, 0xDA));
        t.base(0xDB, a!(escape, 0xDB));
        t.base(0xDC, a!(escape, 0xDC));
        t.base(0xDD, a!(escape, 0xDD));
        t.base(0xDE, a!(escape, 0xDE));
        t.base(0xDF, a!(escape, 0xDF));

        t.base(0xE0, a!(loop_op, LOOPNE));
        t.base(0xE1, a!(loop_op, LOOPE));
        t.base(0xE2, a!(loop_op, LOOP));
        t.base(0xE3, a!(jcxz));
        t.base(0xE4, b!(in_imm));
        t.base(0xE5, w!(in_imm));
        t.base(0xE6, b!(out_imm));
        t.base(0xE7, w!(out_imm));
        t.base(0xE8, w!(call_near));
        t.base(0xE9, w!(jmp_near));
        t.base(0xEA, w!(jmp_far));
        t.base(0xEB, one!(jmp_short));
        t.base(0xEC, b!(in_dx));
        t.base(0xED, w!(in_dx));
        t.base(0xEE, b!(out_dx));
        t.base(0xEF, w!(out_dx));

        t.base(0xF0, one!(lock));
        t.base(0xF2, one!(repne));
        t.base(0xF3, one!(repe));
        t.base(0xF4, one!(hlt));
        t.base(0xF5, one!(cmc));
        t.base(0xF6, ba!(group3));
        t.base(0xF7, wa!(group3));
        t.base(0xF8, c!(set_carry, false));
        t.base(0xF9, c!(set_carry, true));
        t.base(0xFA, one!(cli));
        t.base(0xFB, one!(sti));
        t.base(0xFC, c!(set_direction, false));
        t.base(0xFD, c!(set_direction, true));
        t.base(0xFE, a!(group_fe));
        t.base(0xFF, wa!(group_ff));

        t.ext(0x00, a!(group_0f00));
        t.ext(0x01, wa!(group_0f01));
        t.ext(0x02, wa!(lar));
        t.ext(0x03, wa!(lsl));
        t.ext(0x05, one!(loadall));
        t.ext(0x06, one!(clts));
    }

    fn install_386(&mut self) {
        let t = self;
        t.base(0x64, c!(seg_override, 4));
        t.base(0x65, c!(seg_override, 5));
        t.base(0x66, one!(op_size));
        t.base(0x67, one!(addr_size));

        // 286 LOADALL moved to 0F 07 with a new image format
        t.clear_ext(0x05);
        t.ext(0x07, one!(loadall386));
        t.ext(0x20, one!(mov_r_cr));
        t.ext(0x21, one!(mov_r_dr));
        t.ext(0x22, one!(mov_cr_r));
        t.ext(0x23, one!(mov_dr_r));
        t.ext(0x24, one!(mov_r_tr));
        t.ext(0x26, one!(mov_tr_r));
        per_cc!(t.ext(0x80, w!(jcc_near)));
        per_cc!(t.ext(0x90, a!(setcc)));
        t.ext(0xA0, w!(push_sreg, 4));
        t.ext(0xA1, w!(pop_sreg, 4));
        t.ext(0xA3, wa!(bt_rm_r, BT));
        t.ext(0xA4, wa!(shift_double, true, false));
        t.ext(0xA5, wa!(shift_double, true, true));
        t.ext(0xA8, w!(push_sreg, 5));
        t.ext(0xA9, w!(pop_sreg, 5));
        t.ext(0xAB, wa!(bt_rm_r, BTS));
        t.ext(0xAC, wa!(shift_double, false, false));
        t.ext(0xAD, wa!(shift_double, false, true));
        t.ext(0xAF, wa!(imul_r_rm));
        t.ext(0xB2, wa!(load_far_ptr, 2));
        t.ext(0xB3, wa!(bt_rm_r, BTR));
        t.ext(0xB4, wa!(load_far_ptr, 4));
        t.ext(0xB5, wa!(load_far_ptr, 5));
        t.ext(0xB6, [
            mov_extend::<Word, Byte, false, false> as OpFn,
            mov_extend::<Dword, Byte, false, false>,
            mov_extend::<Word, Byte, false, true>,
            mov_extend::<Dword, Byte, false, true>,
        ]);
        t.ext(0xB7, [
            mov_extend::<Word, Word, false, false> as OpFn,
            mov_extend::<Dword, Word, false, false>,
            mov_extend::<Word, Word, false, true>,
            mov_extend::<Dword, Word, false, true>,
        ]);
        t.ext(0xBA, wa!(group8));
        t.ext(0xBB, wa!(bt_rm_r, BTC));
        t.ext(0xBC, wa!(bit_scan, false));
        t.ext(0xBD, wa!(bit_scan, true));
        t.ext(0xBE, [
            mov_extend::<Word, Byte, true, false> as OpFn,
            mov_extend::<Dword, Byte, true, false>,
            mov_extend::<Word, Byte, true, true>,
            mov_extend::<Dword, Byte, true, true>,
        ]);
        t.ext(0xBF, [
            mov_extend::<Word, Word, true, false> as OpFn,
            mov_extend::<Dword, Word, true, false>,
            mov_extend::<Word, Word, true, true>,
            mov_extend::<Dword, Word, true, true>,
        ]);
    }

    fn install_486(&mut self) {
        let t = self;
        t.clear_ext(0x07);
        t.ext(0x08, one!(invd));
        t.ext(0x09, one!(invd));
        t.ext(0xB0, ba!(cmpxchg));
        t.ext(0xB1, wa!(cmpxchg));
        t.ext(0xC0, ba!(xadd));
        t.ext(0xC1, wa!(xadd));
        per_reg!(t.ext(0xC8, c!(bswap)));
    }

    fn install_features(&mut self, features: Features) {
        let t = self;
        if features.contains(Features::CPUID) {
            t.ext(0xA2, one!(cpuid));
        }
        if features.contains(Features::MSR) {
            t.ext(0x30, one!(wrmsr));
            t.ext(0x32, one!(rdmsr));
        }
        if features.contains(Features::TSC) {
            t.ext(0x31, one!(rdtsc));
        }
        if features.contains(Features::CX8) {
            t.ext(0xC7, a!(cmpxchg8b));
        }
        if features.contains(Features::CMOV) {
            per_cc!(t.ext(0x40, wa!(cmov)));
        }
        if features.contains(Features::MMX) {
            t.install_mmx();
        }
        if features.contains(Features::SYSCALL) {
            t.ext(0x05, one!(syscall));
            t.ext(0x07, one!(sysret));
        }
        if features.contains(Features::AMD3DNOW) {
            t.ext(0x0D, a!(prefetch));
            t.ext(0x0E, one!(femms));
            t.ext(0x0F, a!(amd3dnow));
        }
        if features.contains(Features::CYRIX_EXT) {
            t.ext(0x78, a!(svdc));
            t.ext(0x79, a!(rsdc));
            t.ext(0x7A, a!(svldt));
            t.ext(0x7B, a!(rsldt));
            t.ext(0x7C, a!(svts));
            t.ext(0x7D, a!(rsts));
        }
    }

    fn install_mmx(&mut self) {
        let t = self;
        macro_rules! mmx {
            ($($op:literal)*) => {
                $( t.ext($op, a!(mmx_op, $op)); )*
            };
        }
        mmx!(0x60 0x61 0x62 0x63 0x64 0x65 0x66 0x67 0x68 0x69 0x6A 0x6B 0x6E 0x6F);
        mmx!(0x71 0x72 0x73 0x74 0x75 0x76 0x7E 0x7F);
        mmx!(0xD1 0xD2 0xD3 0xD5 0xD8 0xD9 0xDB 0xDC 0xDD 0xDF);
        mmx!(0xE1 0xE2 0xE5 0xE8 0xE9 0xEB 0xEC 0xED 0xEF);
        mmx!(0xF1 0xF2 0xF3 0xF5 0xF8 0xF9 0xFA 0xFC 0xFD 0xFE);
        t.ext(0x77, one!(emms));
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{CpuConfig, CpuModel};
    use crate::cpu::{Cpu, EAX};
    use crate::error::Fault;

    use super::OpcodeTables;

    fn cpu_with_code(model: CpuModel, code: &[u8]) -> Cpu {
        let mut cpu = Cpu::new(CpuConfig::new(model));
        cpu.load_cs_real(0);
        cpu.eip = 0x100;
        cpu.oldpc = 0x100;
        cpu.bus.load(0x100, code);
        cpu
    }

    fn run_ext(cpu: &mut Cpu, opcode: u8) -> Result<(), Fault> {
        let tables = OpcodeTables::for_model(cpu.model);
        let fetchdat = cpu.peek_fetchdat();
        tables.lookup_ext(opcode, false, false)(cpu, fetchdat)
    }

    #[test]
    fn movzx_arrives_with_the_386() {
        // 0F B6 C0: MOVZX AX, AL
        let mut cpu = cpu_with_code(CpuModel::I286, &[0xC0]);
        assert_eq!(run_ext(&mut cpu, 0xB6), Err(Fault::InvalidOpcode));

        let mut cpu = cpu_with_code(CpuModel::I386Dx, &[0xC0]);
        cpu.regs[EAX] = 0x12F0;
        assert_eq!(run_ext(&mut cpu, 0xB6), Ok(()));
        assert_eq!(cpu.regs[EAX] & 0xFFFF, 0x00F0);
    }

    #[test]
    fn size_prefixes_are_illegal_on_the_286() {
        let tables = OpcodeTables::for_model(CpuModel::I286);
        let mut cpu = cpu_with_code(CpuModel::I286, &[0x90]);
        assert_eq!(tables.lookup(0x66, false, false, None)(&mut cpu, 0), Err(Fault::InvalidOpcode));
        assert_eq!(tables.lookup(0x64, false, false, None)(&mut cpu, 0), Err(Fault::InvalidOpcode));
    }

    #[test]
    fn vendor_rows_follow_features() {
        // 0F 0E: FEMMS only on 3DNow! parts
        let mut cpu = cpu_with_code(CpuModel::K6, &[]);
        assert_eq!(run_ext(&mut cpu, 0x0E), Err(Fault::InvalidOpcode));
        let mut cpu = cpu_with_code(CpuModel::K62, &[]);
        assert_eq!(run_ext(&mut cpu, 0x0E), Ok(()));

        // 0F 07 is LOADALL on the 386, gone on the 486
        let mut cpu = cpu_with_code(CpuModel::I486Dx, &[]);
        assert_eq!(run_ext(&mut cpu, 0x07), Err(Fault::InvalidOpcode));

        // 0F 40 C1: CMOVO AX, CX needs CMOV
        let mut cpu = cpu_with_code(CpuModel::Pentium, &[0xC1]);
        assert_eq!(run_ext(&mut cpu, 0x40), Err(Fault::InvalidOpcode));
        let mut cpu = cpu_with_code(CpuModel::Cyrix6x86Mx, &[0xC1]);
        assert_eq!(run_ext(&mut cpu, 0x40), Ok(()));
    }

    #[test]
    fn cpuid_needs_the_feature() {
        let mut cpu = cpu_with_code(CpuModel::I386Dx, &[]);
        assert_eq!(run_ext(&mut cpu, 0xA2), Err(Fault::InvalidOpcode));
        let mut cpu = cpu_with_code(CpuModel::I486Sx, &[]);
        assert_eq!(run_ext(&mut cpu, 0xA2), Ok(()));
    }
}
