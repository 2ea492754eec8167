use rust_x86::config::CpuModel;
use rust_x86::cpu::{EAX, EBX, ECX, EDX};
use rust_x86::error::Fault;
use rust_x86::exec::StepOutcome;
use rust_x86::fpu::RegisterMode;
mod testrunners;
use testrunners::{new_cpu, run_cpu_code, set_vector};

fn pair(lo: f32, hi: f32) -> u64 {
    lo.to_bits() as u64 | (hi.to_bits() as u64) << 32
}

#[test]
fn paddusb_saturates_each_lane() {
    let mut cpu = new_cpu(CpuModel::PentiumMmx);
    cpu.fpu.set_mmx(0, 0x10FF_8001_0000_00F0);
    cpu.fpu.set_mmx(1, 0x0001_8001_0000_0020);
    // 0F DC C1: PADDUSB MM0, MM1
    run_cpu_code(&mut cpu, &[0x0F, 0xDC, 0xC1]);
    assert_eq!(cpu.fpu.mmx(0), 0x10FF_FF02_0000_00FF);
    assert_eq!(cpu.fpu.mode, RegisterMode::Mmx);
    assert_eq!(cpu.fpu.tag, 0);
}

#[test]
fn emms_hands_the_registers_back_to_x87() {
    let mut cpu = new_cpu(CpuModel::PentiumMmx);
    // 0F EF C0: PXOR MM0, MM0; 0F 77: EMMS
    run_cpu_code(&mut cpu, &[0x0F, 0xEF, 0xC0, 0x0F, 0x77]);
    assert_eq!(cpu.fpu.mmx(0), 0);
    assert_eq!(cpu.fpu.mode, RegisterMode::X87);
    assert_eq!(cpu.fpu.tag, 0xFFFF);
}

#[test]
fn mmx_opcodes_are_illegal_without_the_feature() {
    let mut cpu = new_cpu(CpuModel::Pentium);
    set_vector(&mut cpu, 6, 0x0000, 0x0600);
    // 0F DC C1: PADDUSB MM0, MM1
    let outcomes = run_cpu_code(&mut cpu, &[0x0F, 0xDC, 0xC1]);
    assert_eq!(outcomes, vec![StepOutcome::Faulted(Fault::InvalidOpcode)]);
}

#[test]
fn pfadd_adds_both_lanes() {
    let mut cpu = new_cpu(CpuModel::K62);
    cpu.fpu.set_mmx(2, pair(1.5, -4.0));
    cpu.fpu.set_mmx(3, pair(2.25, 1.0));
    // 0F 0F D3 9E: PFADD MM2, MM3
    run_cpu_code(&mut cpu, &[0x0F, 0x0F, 0xD3, 0x9E]);
    assert_eq!(cpu.fpu.mmx(2), pair(3.75, -3.0));
    assert_eq!(cpu.eip, 4);
}

#[test]
fn unknown_3dnow_suffix_is_illegal() {
    let mut cpu = new_cpu(CpuModel::K62);
    set_vector(&mut cpu, 6, 0x0000, 0x0600);
    // 0F 0F C0 00: no such suffix
    let outcomes = run_cpu_code(&mut cpu, &[0x0F, 0x0F, 0xC0, 0x00]);
    assert_eq!(outcomes, vec![StepOutcome::Faulted(Fault::InvalidOpcode)]);
}

#[test]
fn cpuid_reports_the_vendor_string() {
    for (model, vendor) in [
        (CpuModel::Pentium, b"GenuineIntel"),
        (CpuModel::K6, b"AuthenticAMD"),
        (CpuModel::Cyrix6x86Mx, b"CyrixInstead"),
        (CpuModel::WinChip, b"CentaurHauls"),
    ] {
        let mut cpu = new_cpu(model);
        // 0F A2: CPUID
        run_cpu_code(&mut cpu, &[0x0F, 0xA2]);
        assert_eq!(cpu.regs[EAX], 1, "{model:?}");
        let bytes: Vec<u8> = [cpu.regs[EBX], cpu.regs[EDX], cpu.regs[ECX]]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        assert_eq!(&bytes, vendor, "{model:?}");
    }
}

#[test]
fn cpuid_is_illegal_on_the_386() {
    let mut cpu = new_cpu(CpuModel::I386Dx);
    set_vector(&mut cpu, 6, 0x0000, 0x0600);
    // 0F A2: CPUID
    let outcomes = run_cpu_code(&mut cpu, &[0x0F, 0xA2]);
    assert_eq!(outcomes, vec![StepOutcome::Faulted(Fault::InvalidOpcode)]);
}

#[test]
fn syscall_in_real_mode_is_illegal() {
    let mut cpu = new_cpu(CpuModel::K6);
    set_vector(&mut cpu, 6, 0x0000, 0x0600);
    // 0F 05: SYSCALL
    let outcomes = run_cpu_code(&mut cpu, &[0x0F, 0x05]);
    assert_eq!(outcomes, vec![StepOutcome::Faulted(Fault::InvalidOpcode)]);
}

#[test]
fn rdtsc_counts_consumed_cycles() {
    let mut cpu = new_cpu(CpuModel::Pentium);
    // 90 90 90: NOP x3; 0F 31: RDTSC
    run_cpu_code(&mut cpu, &[0x90, 0x90, 0x90, 0x0F, 0x31]);
    assert!(cpu.regs[EAX] >= 3);
    assert_eq!(cpu.regs[EDX], 0);
}

#[test]
fn cmov_moves_only_when_the_condition_holds() {
    let mut cpu = new_cpu(CpuModel::Cyrix6x86Mx);
    cpu.regs[EBX] = 0x55;
    cpu.regs[ECX] = 0x77;
    cpu.regs[EDX] = 0;
    // 31 C0: XOR AX, AX; 0F 44 C3: CMOVZ AX, BX; 0F 45 D1: CMOVNZ DX, CX
    run_cpu_code(&mut cpu, &[0x31, 0xC0, 0x0F, 0x44, 0xC3, 0x0F, 0x45, 0xD1]);
    assert_eq!(cpu.regs[EAX], 0x55);
    assert_eq!(cpu.regs[EDX] & 0xFFFF, 0);
}
