use proptest::prelude::*;
use rust_x86::config::CpuModel;
use rust_x86::cpu::{Cpu, CpuFlags, EAX, EBX, ECX, EDX};
mod testrunners;
use testrunners::{new_cpu, run_cpu_code};

#[derive(Debug, PartialEq)]
struct ArithFlags {
    cf: bool,
    pf: bool,
    af: bool,
    zf: bool,
    sf: bool,
    of: bool,
}

fn observed(cpu: &Cpu) -> ArithFlags {
    ArithFlags {
        cf: cpu.get_cpu_flag(CpuFlags::CF),
        pf: cpu.get_cpu_flag(CpuFlags::PF),
        af: cpu.get_cpu_flag(CpuFlags::AF),
        zf: cpu.get_cpu_flag(CpuFlags::ZF),
        sf: cpu.get_cpu_flag(CpuFlags::SF),
        of: cpu.get_cpu_flag(CpuFlags::OF),
    }
}

fn expected_add8(a: u8, b: u8) -> (u8, ArithFlags) {
    let r = a.wrapping_add(b);
    (
        r,
        ArithFlags {
            cf: a as u16 + b as u16 > 0xFF,
            pf: r.count_ones() % 2 == 0,
            af: (a ^ b ^ r) & 0x10 != 0,
            zf: r == 0,
            sf: r & 0x80 != 0,
            of: (a ^ r) & (b ^ r) & 0x80 != 0,
        },
    )
}

fn expected_sub8(a: u8, b: u8) -> (u8, ArithFlags) {
    let r = a.wrapping_sub(b);
    (
        r,
        ArithFlags {
            cf: a < b,
            pf: r.count_ones() % 2 == 0,
            af: (a ^ b ^ r) & 0x10 != 0,
            zf: r == 0,
            sf: r & 0x80 != 0,
            of: (a ^ b) & (a ^ r) & 0x80 != 0,
        },
    )
}

fn expected_sub32(a: u32, b: u32) -> (u32, ArithFlags) {
    let r = a.wrapping_sub(b);
    (
        r,
        ArithFlags {
            cf: a < b,
            pf: (r as u8).count_ones() % 2 == 0,
            af: (a ^ b ^ r) & 0x10 != 0,
            zf: r == 0,
            sf: r & 0x8000_0000 != 0,
            of: (a ^ b) & (a ^ r) & 0x8000_0000 != 0,
        },
    )
}

fn boundary_u8() -> impl Strategy<Value = u8> {
    prop_oneof![Just(0u8), Just(1), Just(0x7F), Just(0x80), Just(0xFF), any::<u8>()]
}

proptest! {
    #[test]
    fn add_al_imm8_flags(a in boundary_u8(), b in boundary_u8()) {
        let mut cpu = new_cpu(CpuModel::I486Dx);
        cpu.regs[EAX] = a as u32;
        // 04 ib: ADD AL, imm8
        run_cpu_code(&mut cpu, &[0x04, b]);
        let (r, flags) = expected_add8(a, b);
        prop_assert_eq!(cpu.regs[EAX] & 0xFF, r as u32);
        prop_assert_eq!(observed(&cpu), flags);
    }

    #[test]
    fn sub_and_cmp_agree(a in boundary_u8(), b in boundary_u8()) {
        let (r, flags) = expected_sub8(a, b);

        let mut cpu = new_cpu(CpuModel::I386Dx);
        cpu.regs[EAX] = a as u32;
        // 2C ib: SUB AL, imm8
        run_cpu_code(&mut cpu, &[0x2C, b]);
        prop_assert_eq!(cpu.regs[EAX] & 0xFF, r as u32);
        prop_assert_eq!(observed(&cpu), flags);

        let mut cpu = new_cpu(CpuModel::I386Dx);
        cpu.regs[EAX] = a as u32;
        // 3C ib: CMP AL, imm8
        run_cpu_code(&mut cpu, &[0x3C, b]);
        prop_assert_eq!(cpu.regs[EAX] & 0xFF, a as u32);
        prop_assert_eq!(observed(&cpu), expected_sub8(a, b).1);
    }

    #[test]
    fn sub_eax_ebx_dword_flags(a in any::<u32>(), b in prop_oneof![Just(0u32), Just(1), Just(0x8000_0000), any::<u32>()]) {
        let mut cpu = new_cpu(CpuModel::Pentium);
        cpu.regs[EAX] = a;
        cpu.regs[EBX] = b;
        // 66 29 D8: SUB EAX, EBX
        run_cpu_code(&mut cpu, &[0x66, 0x29, 0xD8]);
        let (r, flags) = expected_sub32(a, b);
        prop_assert_eq!(cpu.regs[EAX], r);
        prop_assert_eq!(observed(&cpu), flags);
    }
}

#[test]
fn inc_leaves_carry_alone() {
    let mut cpu = new_cpu(CpuModel::I286);
    cpu.regs[EAX] = 0xFFFF;
    // F9: STC; 40: INC AX
    run_cpu_code(&mut cpu, &[0xF9, 0x40]);
    assert_eq!(cpu.regs[EAX] & 0xFFFF, 0);
    assert!(cpu.get_cpu_flag(CpuFlags::CF), "INC must not touch CF");
    assert!(cpu.get_cpu_flag(CpuFlags::ZF));
    assert!(cpu.get_cpu_flag(CpuFlags::AF));
}

#[test]
fn adc_chains_a_carry_through_two_words() {
    let mut cpu = new_cpu(CpuModel::I286);
    cpu.regs[EAX] = 0xFFFF;
    cpu.regs[EDX] = 0x0001;
    // 05 01 00: ADD AX, 1; 83 D2 00: ADC DX, 0
    run_cpu_code(&mut cpu, &[0x05, 0x01, 0x00, 0x83, 0xD2, 0x00]);
    assert_eq!(cpu.regs[EAX] & 0xFFFF, 0);
    assert_eq!(cpu.regs[EDX] & 0xFFFF, 2);
    assert!(!cpu.get_cpu_flag(CpuFlags::CF));
}

#[test]
fn mul_sets_carry_when_the_high_half_is_used() {
    let mut cpu = new_cpu(CpuModel::I386Dx);
    cpu.regs[EAX] = 0x1234;
    cpu.regs[ECX] = 0x0100;
    // F7 E1: MUL CX
    run_cpu_code(&mut cpu, &[0xF7, 0xE1]);
    assert_eq!(cpu.regs[EAX] & 0xFFFF, 0x3400);
    assert_eq!(cpu.regs[EDX] & 0xFFFF, 0x0012);
    assert!(cpu.get_cpu_flag(CpuFlags::CF));
    assert!(cpu.get_cpu_flag(CpuFlags::OF));
}

#[test]
fn imul_three_operand_truncates() {
    let mut cpu = new_cpu(CpuModel::I486Dx);
    cpu.regs[EBX] = 0xFFFE;
    // 6B C3 03: IMUL AX, BX, 3
    run_cpu_code(&mut cpu, &[0x6B, 0xC3, 0x03]);
    assert_eq!(cpu.regs[EAX] & 0xFFFF, 0xFFFA);
    assert!(!cpu.get_cpu_flag(CpuFlags::CF));
}

#[test]
fn daa_adjusts_packed_bcd() {
    let mut cpu = new_cpu(CpuModel::I286);
    cpu.regs[EAX] = 0x19;
    // 04 28: ADD AL, 28h; 27: DAA
    run_cpu_code(&mut cpu, &[0x04, 0x28, 0x27]);
    assert_eq!(cpu.regs[EAX] & 0xFF, 0x47);
    assert!(!cpu.get_cpu_flag(CpuFlags::CF));
}

#[test]
fn shl_by_cl_reports_last_bit_out() {
    let mut cpu = new_cpu(CpuModel::I386Dx);
    cpu.regs[EAX] = 0x81;
    cpu.regs[ECX] = 1;
    // D2 E0: SHL AL, CL
    run_cpu_code(&mut cpu, &[0xD2, 0xE0]);
    assert_eq!(cpu.regs[EAX] & 0xFF, 0x02);
    assert!(cpu.get_cpu_flag(CpuFlags::CF));
    assert!(cpu.get_cpu_flag(CpuFlags::OF));
}

#[test]
fn bsf_finds_the_lowest_set_bit() {
    let mut cpu = new_cpu(CpuModel::I386Dx);
    cpu.regs[EBX] = 0x0000_0100;
    // 66 0F BC C3: BSF EAX, EBX
    run_cpu_code(&mut cpu, &[0x66, 0x0F, 0xBC, 0xC3]);
    assert_eq!(cpu.regs[EAX], 8);
    assert!(!cpu.get_cpu_flag(CpuFlags::ZF));
}
