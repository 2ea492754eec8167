use bitflags::bitflags;
use clap::ValueEnum;

/// CPU generation or vendor profile. Selects the opcode table set, the cycle
/// table and the feature word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum CpuModel {
    #[value(name = "286")]
    I286,
    #[value(name = "386sx")]
    I386Sx,
    #[value(name = "386dx")]
    I386Dx,
    #[value(name = "486sx")]
    I486Sx,
    #[value(name = "486dx")]
    I486Dx,
    #[value(name = "pentium")]
    Pentium,
    #[value(name = "pentium-mmx")]
    PentiumMmx,
    #[value(name = "winchip")]
    WinChip,
    #[value(name = "winchip2")]
    WinChip2,
    #[value(name = "6x86mx")]
    Cyrix6x86Mx,
    #[value(name = "k6")]
    K6,
    #[value(name = "k6-2")]
    K62,
}

/// Whether the host runs the core as a plain interpreter or alongside a
/// recompiler. Only the REP batching budget depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ExecMode {
    #[default]
    Interpreter,
    Recompiler,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u32 {
        const FPU       = 1 << 0;
        const VME       = 1 << 1;
        const PSE       = 1 << 2;
        const TSC       = 1 << 3;
        const MSR       = 1 << 4;
        const CX8       = 1 << 5;
        const CMOV      = 1 << 6;
        const MMX       = 1 << 7;
        const SYSCALL   = 1 << 8;
        const AMD3DNOW  = 1 << 9;
        const CYRIX_EXT = 1 << 10;
        const CPUID     = 1 << 11;
        const CR4       = 1 << 12;
    }
}

/// Cycle costs shared by the handler set. Field names follow the operand
/// shape: `rr` register/register, `rm` register destination with memory
/// source, `mr` memory destination, `mm` memory/memory, `*l` the 32-bit form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub rr: i32,
    pub rm: i32,
    pub mr: i32,
    pub mm: i32,
    pub rml: i32,
    pub mrl: i32,
    pub mml: i32,
    /// Extra cost of a taken branch.
    pub bt: i32,
    /// Cost of a branch not taken.
    pub bnt: i32,
    pub int: i32,
    pub int_rm: i32,
    pub int_v86: i32,
    pub int_pm: i32,
    pub int_pm_outer: i32,
    pub iret_rm: i32,
    pub iret_v86: i32,
    pub iret_pm: i32,
    pub iret_pm_outer: i32,
    pub call_rm: i32,
    pub call_pm: i32,
    pub call_pm_gate: i32,
    pub call_pm_gate_inner: i32,
    pub retf_rm: i32,
    pub retf_pm: i32,
    pub retf_pm_outer: i32,
    pub jmp_rm: i32,
    pub jmp_pm: i32,
    pub jmp_pm_gate: i32,
}

const TIMINGS_286: Timings = Timings {
    rr: 2, rm: 7, mr: 7, mm: 7, rml: 9, mrl: 11, mml: 11,
    bt: 4, bnt: 3,
    int: 0, int_rm: 23, int_v86: 0, int_pm: 40, int_pm_outer: 78,
    iret_rm: 17, iret_v86: 0, iret_pm: 31, iret_pm_outer: 55,
    call_rm: 13, call_pm: 26, call_pm_gate: 52, call_pm_gate_inner: 82,
    retf_rm: 15, retf_pm: 25, retf_pm_outer: 55,
    jmp_rm: 11, jmp_pm: 23, jmp_pm_gate: 38,
};

const TIMINGS_386SX: Timings = Timings {
    rr: 2, rm: 6, mr: 7, mm: 6, rml: 8, mrl: 11, mml: 10,
    bt: 4, bnt: 3,
    int: 0, int_rm: 37, int_v86: 59, int_pm: 99, int_pm_outer: 119,
    iret_rm: 22, iret_v86: 60, iret_pm: 38, iret_pm_outer: 82,
    call_rm: 17, call_pm: 34, call_pm_gate: 52, call_pm_gate_inner: 86,
    retf_rm: 18, retf_pm: 32, retf_pm_outer: 68,
    jmp_rm: 12, jmp_pm: 27, jmp_pm_gate: 45,
};

const TIMINGS_386DX: Timings = Timings {
    rml: 6, mrl: 7, mml: 6,
    ..TIMINGS_386SX
};

const TIMINGS_486: Timings = Timings {
    rr: 1, rm: 2, mr: 3, mm: 3, rml: 2, mrl: 3, mml: 3,
    bt: 2, bnt: 1,
    int: 4, int_rm: 26, int_v86: 82, int_pm: 44, int_pm_outer: 71,
    iret_rm: 15, iret_v86: 36, iret_pm: 20, iret_pm_outer: 36,
    call_rm: 18, call_pm: 20, call_pm_gate: 35, call_pm_gate_inner: 69,
    retf_rm: 13, retf_pm: 17, retf_pm_outer: 35,
    jmp_rm: 17, jmp_pm: 19, jmp_pm_gate: 32,
};

const TIMINGS_WINCHIP: Timings = Timings {
    rr: 1, rm: 2, mr: 2, mm: 3, rml: 2, mrl: 2, mml: 3,
    bt: 2, bnt: 1,
    int: 4, int_rm: 26, int_v86: 82, int_pm: 44, int_pm_outer: 71,
    iret_rm: 7, iret_v86: 26, iret_pm: 10, iret_pm_outer: 26,
    call_rm: 4, call_pm: 15, call_pm_gate: 26, call_pm_gate_inner: 35,
    retf_rm: 4, retf_pm: 7, retf_pm_outer: 23,
    jmp_rm: 5, jmp_pm: 7, jmp_pm_gate: 17,
};

const TIMINGS_PENTIUM: Timings = Timings {
    rr: 1, rm: 2, mr: 3, mm: 3, rml: 2, mrl: 3, mml: 3,
    bt: 0, bnt: 2,
    int: 6, int_rm: 11, int_v86: 54, int_pm: 25, int_pm_outer: 42,
    iret_rm: 7, iret_v86: 27, iret_pm: 10, iret_pm_outer: 27,
    call_rm: 4, call_pm: 4, call_pm_gate: 22, call_pm_gate_inner: 44,
    retf_rm: 4, retf_pm: 4, retf_pm_outer: 23,
    jmp_rm: 3, jmp_pm: 3, jmp_pm_gate: 18,
};

const TIMINGS_PENTIUM_MMX: Timings = Timings { bnt: 1, ..TIMINGS_PENTIUM };

const TIMINGS_6X86MX: Timings = Timings {
    rr: 1, rm: 1, mr: 2, mm: 2, rml: 1, mrl: 2, mml: 2,
    bt: 0, bnt: 2,
    int: 0, int_rm: 9, int_v86: 46, int_pm: 21, int_pm_outer: 32,
    iret_rm: 7, iret_v86: 26, iret_pm: 10, iret_pm_outer: 26,
    call_rm: 3, call_pm: 4, call_pm_gate: 15, call_pm_gate_inner: 26,
    retf_rm: 4, retf_pm: 4, retf_pm_outer: 23,
    jmp_rm: 1, jmp_pm: 4, jmp_pm_gate: 14,
};

const TIMINGS_K6: Timings = Timings { bnt: 1, ..TIMINGS_PENTIUM };

impl CpuModel {
    pub fn timings(self) -> Timings {
        match self {
            CpuModel::I286 => TIMINGS_286,
            CpuModel::I386Sx => TIMINGS_386SX,
            CpuModel::I386Dx => TIMINGS_386DX,
            CpuModel::I486Sx | CpuModel::I486Dx => TIMINGS_486,
            CpuModel::WinChip | CpuModel::WinChip2 => TIMINGS_WINCHIP,
            CpuModel::Pentium => TIMINGS_PENTIUM,
            CpuModel::PentiumMmx => TIMINGS_PENTIUM_MMX,
            CpuModel::Cyrix6x86Mx => TIMINGS_6X86MX,
            CpuModel::K6 | CpuModel::K62 => TIMINGS_K6,
        }
    }

    pub fn features(self) -> Features {
        let pentium = Features::FPU
            | Features::VME
            | Features::PSE
            | Features::TSC
            | Features::MSR
            | Features::CX8
            | Features::CPUID
            | Features::CR4;
        match self {
            CpuModel::I286 | CpuModel::I386Sx | CpuModel::I386Dx => Features::empty(),
            CpuModel::I486Sx => Features::CPUID,
            CpuModel::I486Dx => Features::FPU | Features::CPUID,
            CpuModel::Pentium => pentium,
            CpuModel::PentiumMmx => pentium | Features::MMX,
            CpuModel::WinChip => {
                Features::FPU
                    | Features::TSC
                    | Features::MSR
                    | Features::CX8
                    | Features::MMX
                    | Features::CPUID
                    | Features::CR4
            }
            CpuModel::WinChip2 => CpuModel::WinChip.features() | Features::AMD3DNOW,
            CpuModel::Cyrix6x86Mx => {
                Features::FPU
                    | Features::TSC
                    | Features::MSR
                    | Features::CX8
                    | Features::CMOV
                    | Features::MMX
                    | Features::CYRIX_EXT
                    | Features::CPUID
                    | Features::CR4
            }
            CpuModel::K6 => pentium | Features::MMX | Features::SYSCALL,
            CpuModel::K62 => pentium | Features::MMX | Features::SYSCALL | Features::AMD3DNOW,
        }
    }

    /// 486 and later cores share the faster string and BOUND timings.
    pub fn is_486_class(self) -> bool {
        !matches!(self, CpuModel::I286 | CpuModel::I386Sx | CpuModel::I386Dx)
    }

    pub fn is_386_class(self) -> bool {
        self != CpuModel::I286
    }

    /// 386SX parts only drive 24 address lines.
    pub fn address_mask(self) -> u32 {
        match self {
            CpuModel::I286 | CpuModel::I386Sx => 0x00FF_FFFF,
            _ => 0xFFFF_FFFF,
        }
    }

    /// CPUID leaf 1 EAX, also the EDX signature after reset.
    pub fn signature(self) -> u32 {
        match self {
            CpuModel::I286 => 0,
            CpuModel::I386Sx => 0x2308,
            CpuModel::I386Dx => 0x0308,
            CpuModel::I486Sx => 0x0422,
            CpuModel::I486Dx => 0x0404,
            CpuModel::Pentium => 0x052C,
            CpuModel::PentiumMmx => 0x0543,
            CpuModel::WinChip => 0x0540,
            CpuModel::WinChip2 => 0x0580,
            CpuModel::Cyrix6x86Mx => 0x0600,
            CpuModel::K6 => 0x0562,
            CpuModel::K62 => 0x0580,
        }
    }

    pub fn vendor(self) -> Vendor {
        match self {
            CpuModel::WinChip | CpuModel::WinChip2 => Vendor::Centaur,
            CpuModel::Cyrix6x86Mx => Vendor::Cyrix,
            CpuModel::K6 | CpuModel::K62 => Vendor::Amd,
            _ => Vendor::Intel,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    Intel,
    Amd,
    Centaur,
    Cyrix,
}

impl Vendor {
    /// CPUID leaf 0 identification string as the EBX, EDX, ECX triple.
    pub fn id_words(self) -> [u32; 3] {
        match self {
            Vendor::Intel => [0x756e_6547, 0x4965_6e69, 0x6c65_746e],
            Vendor::Amd => [0x6874_7541, 0x6974_6E65, 0x444D_4163],
            Vendor::Centaur => [0x746e_6543, 0x4872_7561, 0x736c_7561],
            Vendor::Cyrix => [0x6972_7943, 0x736e_4978, 0x6461_6574],
        }
    }
}

#[derive(Debug, Clone)]
pub struct CpuConfig {
    pub model: CpuModel,
    pub exec_mode: ExecMode,
    /// Install an x87 on 386/486SX boards, or remove it from DX parts.
    pub fpu: bool,
    pub memory_size: usize,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            model: CpuModel::I486Dx,
            exec_mode: ExecMode::Interpreter,
            fpu: true,
            memory_size: 16 * 1024 * 1024,
        }
    }
}

impl CpuConfig {
    pub fn new(model: CpuModel) -> Self {
        Self {
            model,
            ..Self::default()
        }
    }

    /// Cycle budget a REP loop may spend before yielding to the scheduler.
    pub fn rep_batch(&self) -> i32 {
        match self.exec_mode {
            ExecMode::Recompiler if self.model.is_386_class() => 1000,
            _ => 100,
        }
    }

    pub fn features(&self) -> Features {
        let mut features = self.model.features();
        features.set(Features::FPU, self.fpu);
        features
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rep_batch_depends_on_exec_mode() {
        let mut config = CpuConfig::new(CpuModel::Pentium);
        assert_eq!(config.rep_batch(), 100);
        config.exec_mode = ExecMode::Recompiler;
        assert_eq!(config.rep_batch(), 1000);
        config.model = CpuModel::I286;
        assert_eq!(config.rep_batch(), 100);
    }

    #[test]
    fn feature_words() {
        assert!(CpuModel::K62.features().contains(Features::AMD3DNOW | Features::SYSCALL));
        assert!(!CpuModel::K6.features().contains(Features::AMD3DNOW));
        assert!(CpuModel::Cyrix6x86Mx.features().contains(Features::CMOV));
        assert!(!CpuModel::Pentium.features().contains(Features::MMX));
        let no_fpu = CpuConfig { fpu: false, ..CpuConfig::new(CpuModel::I486Dx) };
        assert!(!no_fpu.features().contains(Features::FPU));
    }
}
