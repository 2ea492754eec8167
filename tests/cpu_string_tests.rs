use proptest::prelude::*;
use rust_x86::config::{CpuConfig, CpuModel, ExecMode};
use rust_x86::cpu::{Cpu, CpuFlags, CpuState, EAX, ECX, EDI, ESI};
use rust_x86::instructions::string::StringOp;
use rust_x86::segment::{SegReg, SegmentCache};
mod testrunners;
use testrunners::{linear_pc, new_cpu, run_cpu_code, with_config};

#[test]
fn rep_movsb_forward() {
    let mut cpu = new_cpu(CpuModel::I386Dx);
    cpu.segs[SegReg::Ds as usize] = SegmentCache::real_mode(0x1000);
    cpu.segs[SegReg::Es as usize] = SegmentCache::real_mode(0x2000);
    cpu.regs[ESI] = 0;
    cpu.regs[EDI] = 0x10;
    cpu.regs[ECX] = 5;
    for i in 0..5 {
        cpu.bus.write_8(0x10000 + i, (i + 1) as u8);
    }

    // F3 A4: REP MOVSB
    run_cpu_code(&mut cpu, &[0xF3, 0xA4]);

    for i in 0..5 {
        assert_eq!(cpu.bus.read_8(0x20010 + i), (i + 1) as u8, "byte {i} mismatch");
    }
    assert_eq!(cpu.regs[ECX], 0, "CX should be 0");
    assert_eq!(cpu.regs[ESI], 5);
    assert_eq!(cpu.regs[EDI], 0x15);
}

#[test]
fn rep_stosw_backward() {
    let mut cpu = new_cpu(CpuModel::I286);
    cpu.segs[SegReg::Es as usize] = SegmentCache::real_mode(0x1000);
    cpu.regs[EDI] = 8;
    cpu.regs[ECX] = 3;
    cpu.regs[EAX] = 0xABCD;

    // FD: STD; F3 AB: REP STOSW
    run_cpu_code(&mut cpu, &[0xFD, 0xF3, 0xAB]);

    assert_eq!(cpu.bus.read_16(0x10008), 0xABCD);
    assert_eq!(cpu.bus.read_16(0x10006), 0xABCD);
    assert_eq!(cpu.bus.read_16(0x10004), 0xABCD);
    assert_eq!(cpu.bus.read_16(0x10002), 0);
    assert_eq!(cpu.regs[EDI], 2);
    assert_eq!(cpu.regs[ECX], 0);
}

#[test]
fn rep_stosb_cycle_cost_per_generation() {
    for (model, per_element) in [(CpuModel::I386Dx, 5), (CpuModel::I486Dx, 4)] {
        let mut cpu = new_cpu(model);
        cpu.regs[ECX] = 5;
        cpu.regs[EDI] = 0x100;
        cpu.cycles = 10_000;
        // F3 AA: REP STOSB
        run_cpu_code(&mut cpu, &[0xF3, 0xAA]);
        assert_eq!(10_000 - cpu.cycles, 2 + 5 * per_element, "{model:?}");
    }
}

#[test]
fn rep_with_zero_count_only_costs_the_prefix() {
    let mut cpu = new_cpu(CpuModel::I486Dx);
    cpu.regs[ECX] = 0;
    cpu.regs[EDI] = 0x100;
    cpu.cycles = 1000;
    // F3 AA: REP STOSB
    run_cpu_code(&mut cpu, &[0xF3, 0xAA]);
    assert_eq!(1000 - cpu.cycles, 3);
    assert_eq!(cpu.regs[EDI], 0x100);
    assert_eq!(cpu.eip, 2);
}

#[test]
fn repne_scasb_finds_the_terminator() {
    let mut cpu = new_cpu(CpuModel::Pentium);
    cpu.segs[SegReg::Es as usize] = SegmentCache::real_mode(0x3000);
    cpu.bus.load(0x30000, b"hello\0world");
    cpu.regs[EDI] = 0;
    cpu.regs[ECX] = 0xFFFF;
    cpu.regs[EAX] = 0;

    // F2 AE: REPNE SCASB
    run_cpu_code(&mut cpu, &[0xF2, 0xAE]);

    assert!(cpu.get_cpu_flag(CpuFlags::ZF));
    assert_eq!(cpu.regs[EDI], 6);
    assert_eq!(cpu.regs[ECX], 0xFFFF - 6);
}

#[test]
fn repe_cmpsw_stops_at_the_first_difference() {
    let mut cpu = new_cpu(CpuModel::I486Dx);
    cpu.bus.load(0x500, &[1, 0, 2, 0, 3, 0, 4, 0]);
    cpu.bus.load(0x600, &[1, 0, 2, 0, 9, 0, 4, 0]);
    cpu.regs[ESI] = 0x500;
    cpu.regs[EDI] = 0x600;
    cpu.regs[ECX] = 4;

    // F3 A7: REPE CMPSW
    run_cpu_code(&mut cpu, &[0xF3, 0xA7]);

    assert!(!cpu.get_cpu_flag(CpuFlags::ZF));
    assert_eq!(cpu.regs[ECX], 1);
    assert_eq!(cpu.regs[ESI], 0x506);
}

#[test]
fn segment_override_applies_to_the_source_only() {
    let mut cpu = new_cpu(CpuModel::I386Dx);
    cpu.segs[SegReg::Fs as usize] = SegmentCache::real_mode(0x4000);
    cpu.bus.load(0x40000, &[0xAA, 0xBB]);
    cpu.regs[ESI] = 0;
    cpu.regs[EDI] = 0x700;
    cpu.regs[ECX] = 2;

    // 64 F3 A4: REP MOVSB with FS source
    run_cpu_code(&mut cpu, &[0x64, 0xF3, 0xA4]);

    assert_eq!(cpu.bus.read_8(0x700), 0xAA);
    assert_eq!(cpu.bus.read_8(0x701), 0xBB);
}

#[test]
fn lodsd_uses_the_operand_size_prefix() {
    let mut cpu = new_cpu(CpuModel::I386Dx);
    cpu.bus.write_32(0x800, 0xDEAD_BEEF);
    cpu.regs[ESI] = 0x800;
    // 66 AD: LODSD
    run_cpu_code(&mut cpu, &[0x66, 0xAD]);
    assert_eq!(cpu.regs[EAX], 0xDEAD_BEEF);
    assert_eq!(cpu.regs[ESI], 0x804);
}

fn fill_pattern(cpu: &mut rust_x86::Cpu, base: usize, len: usize) {
    for i in 0..len {
        cpu.bus.write_8(base + i, (i * 7 + 3) as u8);
    }
}


/// Steps `code` like `run_cpu_code`, returning the cycles each step spent.
fn step_costs(cpu: &mut Cpu, code: &[u8]) -> Vec<i32> {
    let start = linear_pc(cpu);
    cpu.bus.load(start as usize, code);
    let end = start + code.len() as u32;
    let mut costs = Vec::new();
    while (start..end).contains(&linear_pc(cpu)) && cpu.state == CpuState::Running && costs.len() < 100_000 {
        cpu.cycles = 1_000_000;
        cpu.step();
        costs.push(1_000_000 - cpu.cycles);
    }
    costs
}

proptest! {
    // A loop split across many scheduler batches ends in the same state as
    // one that runs in a single large batch.
    #[test]
    fn rep_movsb_reentry_is_idempotent(count in 1usize..3000) {
        let run = |mode: ExecMode| {
            let mut cpu = with_config(CpuConfig {
                exec_mode: mode,
                memory_size: 2 * 1024 * 1024,
                ..CpuConfig::new(CpuModel::I486Dx)
            });
            fill_pattern(&mut cpu, 0x10000, count);
            cpu.segs[SegReg::Ds as usize] = SegmentCache::real_mode(0x1000);
            cpu.regs[ESI] = 0;
            cpu.segs[SegReg::Es as usize] = SegmentCache::real_mode(0x3000);
            cpu.regs[EDI] = 0;
            cpu.regs[ECX] = count as u32;
            // F3 A4: REP MOVSB
            let steps = run_cpu_code(&mut cpu, &[0xF3, 0xA4]).len();
            let copied: Vec<u8> = (0..count).map(|i| cpu.bus.read_8(0x30000 + i)).collect();
            (cpu.registers(), copied, steps)
        };
        let (split_regs, split_mem, split_steps) = run(ExecMode::Interpreter);
        let (whole_regs, whole_mem, whole_steps) = run(ExecMode::Recompiler);
        prop_assert_eq!(split_regs, whole_regs);
        prop_assert_eq!(split_mem, whole_mem);
        prop_assert!(split_steps >= whole_steps);
    }

    // Copying forwards from the start or backwards from the end lands the
    // same bytes.
    #[test]
    fn movs_direction_symmetry(count in 1u32..512) {
        let copy = |backward: bool| {
            let mut cpu = new_cpu(CpuModel::Pentium);
            fill_pattern(&mut cpu, 0x10000, count as usize);
            cpu.segs[SegReg::Ds as usize] = SegmentCache::real_mode(0x1000);
            cpu.segs[SegReg::Es as usize] = SegmentCache::real_mode(0x3000);
            let start = if backward { count - 1 } else { 0 };
            cpu.regs[ESI] = start;
            cpu.regs[EDI] = start;
            cpu.regs[ECX] = count;
            cpu.set_dflag(backward);
            // F3 A4: REP MOVSB
            run_cpu_code(&mut cpu, &[0xF3, 0xA4]);
            let end_si = cpu.regs[ESI];
            let copied: Vec<u8> = (0..count as usize).map(|i| cpu.bus.read_8(0x30000 + i)).collect();
            (copied, end_si)
        };
        let (forward, forward_si) = copy(false);
        let (backward, backward_si) = copy(true);
        prop_assert_eq!(forward, backward);
        prop_assert_eq!(forward_si, count);
        prop_assert_eq!(backward_si, 0xFFFF);
    }

    // REPNE SCASB and REPE CMPSB resumed across batches agree with a single
    // long batch, and no dispatch overruns its batch by more than one element.
    #[test]
    fn rep_scan_and_compare_reentry_is_idempotent(count in 1usize..3000, hit in 0usize..3000, compare: bool) {
        let (op, code): (StringOp, &[u8]) = if compare {
            // F3 A6: REPE CMPSB
            (StringOp::Cmps, &[0xF3, 0xA6])
        } else {
            // F2 AE: REPNE SCASB
            (StringOp::Scas, &[0xF2, 0xAE])
        };
        let run = |mode: ExecMode| {
            let mut cpu = with_config(CpuConfig {
                exec_mode: mode,
                memory_size: 2 * 1024 * 1024,
                ..CpuConfig::new(CpuModel::I486Dx)
            });
            for i in 0..count {
                let byte = (i % 0xE0) as u8;
                cpu.bus.write_8(0x10000 + i, byte);
                cpu.bus.write_8(0x30000 + i, if i == hit { 0xEE } else { byte });
            }
            cpu.segs[SegReg::Ds as usize] = SegmentCache::real_mode(0x1000);
            cpu.segs[SegReg::Es as usize] = SegmentCache::real_mode(0x3000);
            cpu.regs[ESI] = 0;
            cpu.regs[EDI] = 0;
            cpu.regs[EAX] = 0xEE;
            cpu.regs[ECX] = count as u32;
            let costs = step_costs(&mut cpu, code);
            let batch = cpu.config.rep_batch();
            (cpu.registers(), costs, batch)
        };
        let element = op.iteration_cost(true);
        let (split_regs, split_costs, split_batch) = run(ExecMode::Interpreter);
        let (whole_regs, whole_costs, whole_batch) = run(ExecMode::Recompiler);
        prop_assert_eq!(split_regs, whole_regs);
        prop_assert!(split_costs.len() >= whole_costs.len());
        // Two cycles of prefix on the first dispatch
        for cost in &split_costs {
            prop_assert!(*cost <= split_batch + element + 2, "interpreter step spent {}", cost);
        }
        for cost in &whole_costs {
            prop_assert!(*cost <= whole_batch + element + 2, "recompiler step spent {}", cost);
        }
    }
}
