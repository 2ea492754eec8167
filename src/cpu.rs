use std::fmt;
use std::rc::Rc;

use bitflags::bitflags;

use crate::bus::Bus;
use crate::config::{CpuConfig, CpuModel, Features, Timings};
use crate::fpu::{Coprocessor, FpuRegisterFile};
use crate::instructions::rep::{RepKind, RepLoop};
use crate::instructions::tables::OpcodeTables;
use crate::instructions::utils::ModRm;
use crate::segment::{DescriptorTable, SegReg, SegmentCache};

pub use crate::flags::{CpuFlags, Size};

// General purpose register numbers, in ModRM encoding order
pub const EAX: usize = 0;
pub const ECX: usize = 1;
pub const EDX: usize = 2;
pub const EBX: usize = 3;
pub const ESP: usize = 4;
pub const EBP: usize = 5;
pub const ESI: usize = 6;
pub const EDI: usize = 7;

// 8-bit register numbers
pub const AL: usize = 0;
pub const CL: usize = 1;
pub const DL: usize = 2;
pub const BL: usize = 3;
pub const AH: usize = 4;
pub const CH: usize = 5;
pub const DH: usize = 6;
pub const BH: usize = 7;

// CR0 bits
pub const CR0_PE: u32 = 1 << 0;
pub const CR0_MP: u32 = 1 << 1;
pub const CR0_EM: u32 = 1 << 2;
pub const CR0_TS: u32 = 1 << 3;
pub const CR0_ET: u32 = 1 << 4;
pub const CR0_NE: u32 = 1 << 5;
pub const CR0_WP: u32 = 1 << 16;
pub const CR0_AM: u32 = 1 << 18;
pub const CR0_PG: u32 = 1 << 31;

// CR4 bits
pub const CR4_VME: u32 = 1 << 0;
pub const CR4_PVI: u32 = 1 << 1;
pub const CR4_TSD: u32 = 1 << 2;
pub const CR4_DE: u32 = 1 << 3;
pub const CR4_PSE: u32 = 1 << 4;

bitflags! {
    /// Mode bits cached from CR0, EFLAGS and the CS/SS descriptors so hot
    /// paths can test them without decoding the source registers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CpuStatus: u32 {
        const USE32 = 1 << 0;
        const STACK32 = 1 << 1;
        const PMODE = 1 << 2;
        const V86 = 1 << 3;
        const NOT_FLAT_DS = 1 << 4;
        const NOT_FLAT_SS = 1 << 5;
    }
}

#[derive(PartialEq, Debug, Clone, Copy)]
pub enum CpuState {
    Running,
    Halted,
    /// Triple fault with no way out; only `reset()` restarts the core.
    Shutdown,
}

/// Model-specific registers reachable through RDMSR/WRMSR.
#[derive(Debug, Clone, Default)]
pub struct Msrs {
    pub tsc: u64,
    pub star: u64,
    pub efer: u64,
    /// WinChip feature control register.
    pub fcr: u32,
    pub fcr2: u64,
    pub fcr3: u64,
    pub tr12: u32,
}

/// Cyrix configuration registers, reached through ports 22h/23h.
#[derive(Debug, Clone, Default)]
pub struct CyrixRegs {
    /// CCR0-CCR3 (C0h-C3h) then CCR4-CCR6 (E8h-EAh).
    pub ccr: [u8; 7],
    /// Index written to port 22h, consumed by the next port 23h access.
    pub index: Option<u8>,
}

/// Architectural state visible to software, for dumps and comparisons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registers {
    pub gpr: [u32; 8],
    pub eip: u32,
    pub eflags: u32,
    pub selectors: [u16; 6],
    pub cr0: u32,
}

impl fmt::Display for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [eax, ecx, edx, ebx, esp, ebp, esi, edi] = self.gpr;
        let [es, cs, ss, ds, fs, gs] = self.selectors;
        writeln!(f, "EAX={eax:08X} EBX={ebx:08X} ECX={ecx:08X} EDX={edx:08X}")?;
        writeln!(f, "ESI={esi:08X} EDI={edi:08X} EBP={ebp:08X} ESP={esp:08X}")?;
        writeln!(f, "EIP={:08X} EFLAGS={:08X} CR0={:08X}", self.eip, self.eflags, self.cr0)?;
        write!(f, "CS={cs:04X} DS={ds:04X} ES={es:04X} SS={ss:04X} FS={fs:04X} GS={gs:04X}")
    }
}

pub struct Cpu {
    pub regs: [u32; 8],
    pub eip: u32,
    /// EIP of the first byte (prefixes included) of the instruction in flight.
    pub oldpc: u32,
    pub(crate) flags: CpuFlags,
    pub lazy: crate::flags::LazyFlags,

    // Segmentation
    pub segs: [SegmentCache; 6],
    pub gdt: DescriptorTable,
    pub idt: DescriptorTable,
    pub ldt: SegmentCache,
    pub tr: SegmentCache,
    pub status: CpuStatus,

    // System registers
    pub cr0: u32,
    pub cr2: u32,
    pub cr3: u32,
    pub cr4: u32,
    pub dr: [u32; 8],
    pub test_regs: [u32; 8],
    pub msr: Msrs,
    pub cyrix: CyrixRegs,

    // x87 storage (shared with MMX) and the optional numeric core
    pub fpu: FpuRegisterFile,
    pub coprocessor: Option<Box<dyn Coprocessor>>,

    pub bus: Bus,
    pub config: CpuConfig,
    pub model: CpuModel,
    pub timings: Timings,
    features: Features,
    pub(crate) tables: Rc<OpcodeTables>,

    pub state: CpuState,
    /// Cycles left in the current scheduler slice; handlers count it down.
    pub cycles: i32,
    pub ins_count: u64,

    // Per-instruction decode state
    pub op32: bool,
    pub a32: bool,
    pub ea: ModRm,
    pub seg_override: Option<SegReg>,
    /// F2/F3 seen on the instruction in flight.
    pub rep_prefix: Option<RepKind>,
    /// Trap flag sampled at the instruction boundary.
    pub trap: bool,
    pub rep: Option<RepLoop>,

    /// Suspends CPL-based page checks while the core touches system tables.
    pub cpl_override: bool,
    /// Interrupts are held off for one instruction after MOV SS, POP SS, STI.
    pub inhibit_irq: bool,
    pub pending_irq: Option<u8>,
    pub nmi_pending: bool,
    pub(crate) in_delivery: Option<crate::error::Fault>,
}

impl Cpu {
    pub fn new(config: CpuConfig) -> Self {
        let model = config.model;
        let mut cpu = Self {
            regs: [0; 8],
            eip: 0,
            oldpc: 0,
            flags: CpuFlags::RESERVED,
            lazy: Default::default(),
            segs: [SegmentCache::default(); 6],
            gdt: DescriptorTable::default(),
            idt: DescriptorTable::default(),
            ldt: SegmentCache::default(),
            tr: SegmentCache::default(),
            status: CpuStatus::empty(),
            cr0: 0,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            dr: [0; 8],
            test_regs: [0; 8],
            msr: Msrs::default(),
            cyrix: CyrixRegs::default(),
            fpu: FpuRegisterFile::default(),
            coprocessor: None,
            bus: Bus::new(config.memory_size, model.address_mask()),
            timings: model.timings(),
            features: config.features(),
            tables: Rc::new(OpcodeTables::for_model(model)),
            model,
            config,
            state: CpuState::Running,
            cycles: 0,
            ins_count: 0,
            op32: false,
            a32: false,
            ea: ModRm::default(),
            seg_override: None,
            rep_prefix: None,
            trap: false,
            rep: None,
            cpl_override: false,
            inhibit_irq: false,
            pending_irq: None,
            nmi_pending: false,
            in_delivery: None,
        };
        cpu.reset();
        cpu
    }

    /// Power-on state: real mode, executing from the reset vector.
    pub fn reset(&mut self) {
        self.regs = [0; 8];
        self.regs[EDX] = self.model.signature();
        self.set_cpu_flags(CpuFlags::empty());
        self.cr0 = match self.model {
            CpuModel::I286 => 0xFFF0,
            _ if self.features.contains(Features::FPU) => CR0_ET,
            _ => 0,
        };
        self.cr2 = 0;
        self.cr3 = 0;
        self.cr4 = 0;
        self.dr = [0; 8];
        self.dr[6] = 0xFFFF_0FF0;
        self.dr[7] = 0x0000_0400;
        self.msr = Msrs::default();
        if self.model.vendor() == crate::config::Vendor::Centaur {
            self.msr.fcr = (1 << 8) | (1 << 9) | (1 << 12) | (1 << 16) | (1 << 19) | (1 << 21);
        }
        self.cyrix = CyrixRegs::default();
        self.fpu = FpuRegisterFile::default();
        if let Some(copro) = self.coprocessor.as_mut() {
            copro.reset();
        }

        for seg in &mut self.segs {
            *seg = SegmentCache::real_mode(0);
        }
        let cs_base = if self.model.is_386_class() { 0xFFFF_0000 } else { 0x00FF_0000 };
        self.segs[SegReg::Cs as usize] = SegmentCache {
            base: cs_base,
            ..SegmentCache::real_mode(0xF000)
        };
        self.gdt = DescriptorTable::default();
        self.idt = DescriptorTable { base: 0, limit: 0x03FF };
        self.ldt = SegmentCache::default();
        self.tr = SegmentCache::default();
        self.eip = 0xFFF0;
        self.oldpc = self.eip;

        self.state = CpuState::Running;
        self.rep = None;
        self.seg_override = None;
        self.cpl_override = false;
        self.inhibit_irq = false;
        self.pending_irq = None;
        self.nmi_pending = false;
        self.in_delivery = None;
        self.bus.set_a20(true);
        self.update_status();
        log::debug!("[CPU] reset as {:?}", self.model);
    }

    pub fn has_feature(&self, feature: Features) -> bool {
        self.features.contains(feature)
    }

    pub fn registers(&self) -> Registers {
        Registers {
            gpr: self.regs,
            eip: self.eip,
            eflags: self.get_cpu_flags().bits(),
            selectors: self.segs.map(|s| s.selector),
            cr0: self.cr0,
        }
    }

    pub fn clock(&mut self, cycles: i32) {
        self.cycles -= cycles;
    }

    /// Register-form cost or the memory-form cost, by the decoded ModRM.
    pub fn clock_rm(&mut self, rr: i32, mem: i32) {
        self.cycles -= if self.ea.is_reg() { rr } else { mem };
    }

    // ====================================================================
    // Mode queries
    // ====================================================================

    pub fn protected_mode(&self) -> bool {
        self.cr0 & CR0_PE != 0
    }

    pub fn v86_mode(&self) -> bool {
        self.flags.contains(CpuFlags::VM)
    }

    /// Protected mode proper, excluding virtual-8086.
    pub fn pmode_not_v86(&self) -> bool {
        self.protected_mode() && !self.v86_mode()
    }

    pub fn cpl(&self) -> u8 {
        (self.segs[SegReg::Cs as usize].access >> 5) & 3
    }

    pub fn use32(&self) -> bool {
        self.status.contains(CpuStatus::USE32)
    }

    pub fn stack32(&self) -> bool {
        self.status.contains(CpuStatus::STACK32)
    }

    /// Recomputes the cached mode bits after CR0, EFLAGS, CS or SS change.
    pub fn update_status(&mut self) {
        let cs = self.segs[SegReg::Cs as usize];
        let ss = self.segs[SegReg::Ss as usize];
        let ds = self.segs[SegReg::Ds as usize];
        let pmode = self.protected_mode();
        let v86 = pmode && self.v86_mode();
        self.status.set(CpuStatus::PMODE, pmode);
        self.status.set(CpuStatus::V86, v86);
        self.status.set(CpuStatus::USE32, pmode && !v86 && cs.is_32bit());
        self.status.set(CpuStatus::STACK32, pmode && !v86 && ss.is_32bit());
        self.status.set(CpuStatus::NOT_FLAT_DS, !ds.is_flat());
        self.status.set(CpuStatus::NOT_FLAT_SS, !ss.is_flat());
    }

    // ====================================================================
    // Register file
    // ====================================================================

    pub fn get_reg8(&self, reg: usize) -> u8 {
        if reg < 4 {
            self.regs[reg] as u8
        } else {
            (self.regs[reg - 4] >> 8) as u8
        }
    }

    pub fn set_reg8(&mut self, reg: usize, value: u8) {
        if reg < 4 {
            self.regs[reg] = (self.regs[reg] & !0xFF) | value as u32;
        } else {
            let r = &mut self.regs[reg - 4];
            *r = (*r & !0xFF00) | ((value as u32) << 8);
        }
    }

    pub fn get_reg16(&self, reg: usize) -> u16 {
        self.regs[reg] as u16
    }

    pub fn set_reg16(&mut self, reg: usize, value: u16) {
        self.regs[reg] = (self.regs[reg] & 0xFFFF_0000) | value as u32;
    }

    pub fn get_reg32(&self, reg: usize) -> u32 {
        self.regs[reg]
    }

    pub fn set_reg32(&mut self, reg: usize, value: u32) {
        self.regs[reg] = value;
    }

    pub fn get_reg(&self, size: Size, reg: usize) -> u32 {
        match size {
            Size::Byte => self.get_reg8(reg) as u32,
            Size::Word => self.get_reg16(reg) as u32,
            Size::Dword => self.regs[reg],
        }
    }

    pub fn set_reg(&mut self, size: Size, reg: usize, value: u32) {
        match size {
            Size::Byte => self.set_reg8(reg, value as u8),
            Size::Word => self.set_reg16(reg, value as u16),
            Size::Dword => self.regs[reg] = value,
        }
    }

    /// Index or count register under the current address size.
    pub fn get_addr_reg(&self, reg: usize) -> u32 {
        if self.a32 { self.regs[reg] } else { self.regs[reg] & 0xFFFF }
    }

    pub fn set_addr_reg(&mut self, reg: usize, value: u32) {
        if self.a32 {
            self.regs[reg] = value;
        } else {
            self.set_reg16(reg, value as u16);
        }
    }

    pub fn seg(&self, seg: SegReg) -> &SegmentCache {
        &self.segs[seg as usize]
    }

    pub fn seg_mut(&mut self, seg: SegReg) -> &mut SegmentCache {
        &mut self.segs[seg as usize]
    }

    /// Segment used by the memory operand: the override prefix if present,
    /// else the default picked by the addressing mode.
    pub fn data_seg(&self) -> SegReg {
        self.seg_override.unwrap_or(SegReg::Ds)
    }

    /// Real-mode style address helper kept for loaders and tests.
    pub fn get_physical_addr(&self, segment: u16, offset: u16) -> usize {
        ((segment as usize) << 4) + offset as usize
    }

    // ====================================================================
    // External interrupt lines
    // ====================================================================

    pub fn raise_irq(&mut self, vector: u8) {
        self.pending_irq = Some(vector);
    }

    pub fn clear_irq(&mut self) {
        self.pending_irq = None;
    }

    pub fn raise_nmi(&mut self) {
        self.nmi_pending = true;
    }

    /// An interrupt would be taken at the next instruction boundary.
    pub fn interrupt_pending(&self) -> bool {
        self.nmi_pending
            || (self.pending_irq.is_some() && self.flags.contains(CpuFlags::IF) && !self.inhibit_irq)
    }
}
