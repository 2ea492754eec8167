//! x86 CPU core covering the 286 through Pentium-class parts, with the MMX,
//! 3DNow!, AMD SYSCALL and Cyrix extensions of the later clones.
//!
//! A [`cpu::Cpu`] owns its register file, a physical [`bus::Bus`] and the
//! opcode tables for its [`config::CpuModel`]. Drive it with
//! [`cpu::Cpu::step`] or [`cpu::Cpu::run`].

pub mod bus;
pub mod config;
pub mod cpu;
pub mod error;
pub mod exec;
pub mod far;
pub mod flags;
pub mod fpu;
pub mod instructions;
pub mod interrupt;
pub mod memory;
pub mod segment;
pub mod task;

pub use config::{CpuConfig, CpuModel, ExecMode};
pub use cpu::Cpu;
pub use error::Fault;
pub use exec::StepOutcome;
