use thiserror::Error;

pub type Result<T> = std::result::Result<T, Fault>;

/// Architectural exceptions raised while executing an instruction.
///
/// Every memory, port and segment primitive returns `Result<T, Fault>`, and
/// handlers bail out with `?` the moment one is raised. The dispatch loop is
/// the only place that turns a `Fault` into an interrupt delivery.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    #[error("#DE divide error")]
    DivideError,

    #[error("#DB debug trap")]
    Debug,

    #[error("#BP breakpoint")]
    Breakpoint,

    #[error("#OF overflow")]
    Overflow,

    #[error("#BR bound range exceeded")]
    BoundRange,

    #[error("#UD invalid opcode")]
    InvalidOpcode,

    #[error("#NM device not available")]
    DeviceNotAvailable,

    #[error("#DF double fault")]
    DoubleFault,

    #[error("#TS invalid TSS (selector {0:#06x})")]
    InvalidTss(u16),

    #[error("#NP segment not present (selector {0:#06x})")]
    SegmentNotPresent(u16),

    #[error("#SS stack fault (error code {0:#06x})")]
    StackFault(u16),

    #[error("#GP general protection (error code {0:#06x})")]
    GeneralProtection(u16),

    #[error("#PF page fault at {addr:#010x} (error code {code:#x})")]
    PageFault { addr: u32, code: u16 },

    /// Software `INT n`, `INT3` and `INTO` unwind through the same path as
    /// exceptions so the handler that raised them commits nothing further.
    #[error("INT {0:#04x}")]
    Interrupt(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FaultClass {
    Benign,
    Contributory,
    PageFault,
    DoubleFault,
}

impl Fault {
    pub fn vector(&self) -> u8 {
        match self {
            Fault::DivideError => 0,
            Fault::Debug => 1,
            Fault::Breakpoint => 3,
            Fault::Overflow => 4,
            Fault::BoundRange => 5,
            Fault::InvalidOpcode => 6,
            Fault::DeviceNotAvailable => 7,
            Fault::DoubleFault => 8,
            Fault::InvalidTss(_) => 10,
            Fault::SegmentNotPresent(_) => 11,
            Fault::StackFault(_) => 12,
            Fault::GeneralProtection(_) => 13,
            Fault::PageFault { .. } => 14,
            Fault::Interrupt(n) => *n,
        }
    }

    /// Error code pushed on the handler stack in protected mode, if any.
    pub fn error_code(&self) -> Option<u16> {
        match self {
            Fault::DoubleFault => Some(0),
            Fault::InvalidTss(e)
            | Fault::SegmentNotPresent(e)
            | Fault::StackFault(e)
            | Fault::GeneralProtection(e) => Some(*e),
            Fault::PageFault { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Traps are delivered with the program counter already past the
    /// instruction; faults rewind to its first byte.
    pub fn is_trap(&self) -> bool {
        matches!(
            self,
            Fault::Breakpoint | Fault::Overflow | Fault::Interrupt(_)
        )
    }

    pub fn is_software(&self) -> bool {
        matches!(self, Fault::Interrupt(_) | Fault::Breakpoint | Fault::Overflow)
    }

    fn class(&self) -> FaultClass {
        match self {
            Fault::PageFault { .. } => FaultClass::PageFault,
            Fault::DoubleFault => FaultClass::DoubleFault,
            Fault::DivideError
            | Fault::InvalidTss(_)
            | Fault::SegmentNotPresent(_)
            | Fault::StackFault(_)
            | Fault::GeneralProtection(_) => FaultClass::Contributory,
            _ => FaultClass::Benign,
        }
    }

    pub fn is_contributory(&self) -> bool {
        self.class() == FaultClass::Contributory
    }

    /// Whether raising `second` while delivering `self` escalates to #DF.
    pub fn escalates_with(&self, second: &Fault) -> bool {
        use FaultClass as C;
        matches!(
            (self.class(), second.class()),
            (C::Contributory, C::Contributory)
                | (C::PageFault, C::Contributory | C::PageFault)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vectors_match_architecture() {
        assert_eq!(Fault::DivideError.vector(), 0);
        assert_eq!(Fault::BoundRange.vector(), 5);
        assert_eq!(Fault::InvalidOpcode.vector(), 6);
        assert_eq!(Fault::GeneralProtection(0).vector(), 13);
        assert_eq!(Fault::PageFault { addr: 0, code: 0 }.vector(), 14);
        assert_eq!(Fault::Interrupt(0x21).vector(), 0x21);
    }

    #[test]
    fn double_fault_escalation() {
        let gp = Fault::GeneralProtection(0);
        let pf = Fault::PageFault { addr: 0x1000, code: 2 };
        assert!(gp.escalates_with(&Fault::StackFault(0)));
        assert!(pf.escalates_with(&pf));
        assert!(!gp.escalates_with(&pf));
        assert!(!Fault::InvalidOpcode.escalates_with(&gp));
    }
}
