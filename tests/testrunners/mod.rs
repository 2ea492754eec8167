#![allow(dead_code)]

use rust_x86::config::{CpuConfig, CpuModel};
use rust_x86::cpu::{Cpu, CpuState, ESP};
use rust_x86::exec::StepOutcome;
use rust_x86::segment::{SegReg, SegmentCache};

/// Code is placed at 0100:0000, the stack tops out at 2000:FFFE.
pub const CODE_SEG: u16 = 0x0100;
pub const STACK_SEG: u16 = 0x2000;

pub fn new_cpu(model: CpuModel) -> Cpu {
    let config = CpuConfig {
        memory_size: 2 * 1024 * 1024,
        ..CpuConfig::new(model)
    };
    with_config(config)
}

pub fn with_config(config: CpuConfig) -> Cpu {
    let mut cpu = Cpu::new(config);
    cpu.load_cs_real(CODE_SEG);
    cpu.eip = 0;
    cpu.segs[SegReg::Ss as usize] = SegmentCache::real_mode(STACK_SEG);
    cpu.regs[ESP] = 0xFFFE;
    cpu
}

pub fn linear_pc(cpu: &Cpu) -> u32 {
    cpu.seg(SegReg::Cs).base.wrapping_add(cpu.eip)
}

/// Writes `code` at CS:EIP and steps until execution leaves it, the CPU
/// stops running, or a step limit is hit. Returns every step's outcome.
pub fn run_cpu_code(cpu: &mut Cpu, code: &[u8]) -> Vec<StepOutcome> {
    let start = linear_pc(cpu);
    cpu.bus.load(start as usize, code);
    let end = start + code.len() as u32;

    let mut outcomes = Vec::new();
    for _ in 0..100_000 {
        let pc = linear_pc(cpu);
        if pc < start || pc >= end || cpu.state != CpuState::Running {
            break;
        }
        if cpu.cycles <= 0 {
            cpu.cycles += 100_000;
        }
        outcomes.push(cpu.step());
    }
    outcomes
}

/// Points an interrupt vector at a real-mode handler.
pub fn set_vector(cpu: &mut Cpu, vector: u8, cs: u16, ip: u16) {
    cpu.bus.write_16(vector as usize * 4, ip);
    cpu.bus.write_16(vector as usize * 4 + 2, cs);
}

/// Word at SS:SP+`offset`.
pub fn stack_word(cpu: &Cpu, offset: u32) -> u16 {
    let ss = cpu.seg(SegReg::Ss).base;
    cpu.bus.read_16((ss + ((cpu.regs[ESP] + offset) & 0xFFFF)) as usize)
}
