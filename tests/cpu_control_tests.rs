use rust_x86::config::CpuModel;
use rust_x86::cpu::{CpuFlags, CpuState, EAX, EBX, ECX, EDX};
use rust_x86::error::Fault;
use rust_x86::exec::StepOutcome;
mod testrunners;
use testrunners::{new_cpu, run_cpu_code, set_vector, stack_word, CODE_SEG};

#[test]
fn divide_by_zero_vectors_with_the_faulting_ip() {
    let mut cpu = new_cpu(CpuModel::I386Dx);
    set_vector(&mut cpu, 0, 0x0000, 0x0400);
    cpu.regs[EAX] = 0x1234;
    cpu.regs[EBX] = 0;
    // 90: NOP; F7 F3: DIV BX
    let outcomes = run_cpu_code(&mut cpu, &[0x90, 0xF7, 0xF3]);
    assert_eq!(outcomes, vec![StepOutcome::Retired, StepOutcome::Faulted(Fault::DivideError)]);
    assert_eq!(cpu.eip, 0x400);
    // IP, CS, FLAGS on the handler stack
    assert_eq!(stack_word(&cpu, 0), 0x0001);
    assert_eq!(stack_word(&cpu, 2), CODE_SEG);
    assert_eq!(cpu.regs[EAX] & 0xFFFF, 0x1234, "no partial result");
}

#[test]
fn quotient_overflow_is_a_divide_error() {
    let mut cpu = new_cpu(CpuModel::I286);
    set_vector(&mut cpu, 0, 0x0000, 0x0400);
    cpu.regs[EAX] = 0x0000;
    cpu.regs[EDX] = 0x0002;
    cpu.regs[ECX] = 0x0001;
    // F7 F1: DIV CX, 0x20000 / 1 does not fit in AX
    let outcomes = run_cpu_code(&mut cpu, &[0xF7, 0xF1]);
    assert_eq!(outcomes, vec![StepOutcome::Faulted(Fault::DivideError)]);
}

#[test]
fn bound_out_of_range_raises_br() {
    let mut cpu = new_cpu(CpuModel::I486Dx);
    set_vector(&mut cpu, 5, 0x0000, 0x0500);
    cpu.bus.write_16(0x300, 10);
    cpu.bus.write_16(0x302, 20);
    cpu.regs[EAX] = 21;
    // 62 06 00 03: BOUND AX, [0300]
    let outcomes = run_cpu_code(&mut cpu, &[0x62, 0x06, 0x00, 0x03]);
    assert_eq!(outcomes, vec![StepOutcome::Faulted(Fault::BoundRange)]);
    assert_eq!(stack_word(&cpu, 0), 0x0000);
}

#[test]
fn bound_in_range_falls_through() {
    let mut cpu = new_cpu(CpuModel::I486Dx);
    cpu.bus.write_16(0x300, 10);
    cpu.bus.write_16(0x302, 20);
    cpu.regs[EAX] = 20;
    // 62 06 00 03: BOUND AX, [0300]
    let outcomes = run_cpu_code(&mut cpu, &[0x62, 0x06, 0x00, 0x03]);
    assert_eq!(outcomes, vec![StepOutcome::Retired]);
    assert_eq!(cpu.eip, 4);
}

#[test]
fn illegal_opcode_restores_the_prefetch_pc() {
    let mut cpu = new_cpu(CpuModel::I286);
    set_vector(&mut cpu, 6, 0x0000, 0x0600);
    // 66 40: operand-size prefix does not exist on the 286
    let outcomes = run_cpu_code(&mut cpu, &[0x66, 0x40]);
    assert_eq!(outcomes, vec![StepOutcome::Faulted(Fault::InvalidOpcode)]);
    assert_eq!(stack_word(&cpu, 0), 0x0000);
}

#[test]
fn register_form_of_a_memory_only_opcode_is_illegal() {
    let mut cpu = new_cpu(CpuModel::I386Dx);
    set_vector(&mut cpu, 6, 0x0000, 0x0600);
    // 90: NOP; 8D C0: LEA AX, AX
    run_cpu_code(&mut cpu, &[0x90, 0x8D, 0xC0]);
    assert_eq!(cpu.eip, 0x600);
    assert_eq!(stack_word(&cpu, 0), 0x0001);
}

#[test]
fn int_and_iret_round_trip() {
    let mut cpu = new_cpu(CpuModel::I386Dx);
    // Handler at 0000:0700: 40 CF (INC AX; IRET)
    set_vector(&mut cpu, 0x21, 0x0000, 0x0700);
    cpu.bus.load(0x700, &[0x40, 0xCF]);
    cpu.set_cpu_flag(CpuFlags::IF, true);

    // CD 21: INT 21h; 43: INC BX
    run_cpu_code(&mut cpu, &[0xCD, 0x21, 0x43]);
    assert_eq!(cpu.eip, 0x700);
    assert!(!cpu.get_cpu_flag(CpuFlags::IF));
    assert_eq!(cpu.step(), StepOutcome::Retired);
    assert_eq!(cpu.step(), StepOutcome::Retired);
    assert_eq!(cpu.eip, 2);
    assert!(cpu.get_cpu_flag(CpuFlags::IF));
    assert_eq!(cpu.step(), StepOutcome::Retired);
    assert_eq!(cpu.regs[EAX], 1);
    assert_eq!(cpu.regs[EBX], 1);
}

#[test]
fn loop_counts_cx_down() {
    let mut cpu = new_cpu(CpuModel::I486Dx);
    cpu.regs[ECX] = 4;
    // 40: INC AX; E2 FD: LOOP -3
    run_cpu_code(&mut cpu, &[0x40, 0xE2, 0xFD]);
    assert_eq!(cpu.regs[EAX], 4);
    assert_eq!(cpu.regs[ECX], 0);
    assert_eq!(cpu.eip, 3);
}

#[test]
fn near_call_and_return() {
    let mut cpu = new_cpu(CpuModel::I286);
    // E8 02 00: CALL +2; F4: HLT; 90: NOP; 40: INC AX; C3: RET
    let code = [0xE8, 0x02, 0x00, 0xF4, 0x90, 0x40, 0xC3];
    run_cpu_code(&mut cpu, &code);
    assert_eq!(cpu.regs[EAX], 1);
    assert_eq!(cpu.state, CpuState::Halted);
    assert_eq!(cpu.eip, 4);
}

#[test]
fn conditional_jump_on_zero() {
    let mut cpu = new_cpu(CpuModel::I386Dx);
    // 31 C0: XOR AX, AX; 74 01: JZ +1; 40: INC AX; 43: INC BX
    run_cpu_code(&mut cpu, &[0x31, 0xC0, 0x74, 0x01, 0x40, 0x43]);
    assert_eq!(cpu.regs[EAX], 0);
    assert_eq!(cpu.regs[EBX], 1);
}

#[test]
fn near_jcc_needs_a_386() {
    let mut cpu = new_cpu(CpuModel::I286);
    set_vector(&mut cpu, 6, 0x0000, 0x0600);
    // 0F 84 00 00: JZ near
    let outcomes = run_cpu_code(&mut cpu, &[0x0F, 0x84, 0x00, 0x00]);
    assert_eq!(outcomes, vec![StepOutcome::Faulted(Fault::InvalidOpcode)]);
}
