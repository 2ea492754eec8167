use crate::cpu::Cpu;
use crate::error::{Fault, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    #[default]
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegReg {
    pub const ALL: [SegReg; 6] = [SegReg::Es, SegReg::Cs, SegReg::Ss, SegReg::Ds, SegReg::Fs, SegReg::Gs];

    /// Decodes the `reg` field of MOV Sreg and the Cyrix SVDC/RSDC forms.
    pub fn from_index(index: u8) -> Option<SegReg> {
        match index {
            0 => Some(SegReg::Es),
            1 => Some(SegReg::Cs),
            2 => Some(SegReg::Ss),
            3 => Some(SegReg::Ds),
            4 => Some(SegReg::Fs),
            5 => Some(SegReg::Gs),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SegReg::Es => "ES",
            SegReg::Cs => "CS",
            SegReg::Ss => "SS",
            SegReg::Ds => "DS",
            SegReg::Fs => "FS",
            SegReg::Gs => "GS",
        }
    }
}

// Access byte bits
pub const ACC_ACCESSED: u8 = 0x01;
pub const ACC_RW: u8 = 0x02;
pub const ACC_DC: u8 = 0x04;
pub const ACC_CODE: u8 = 0x08;
pub const ACC_SEGMENT: u8 = 0x10;
pub const ACC_PRESENT: u8 = 0x80;

// System descriptor types (low nibble of the access byte, S clear)
pub const SYS_TSS286_AVAIL: u8 = 0x1;
pub const SYS_LDT: u8 = 0x2;
pub const SYS_TSS286_BUSY: u8 = 0x3;
pub const SYS_CALL_GATE286: u8 = 0x4;
pub const SYS_TASK_GATE: u8 = 0x5;
pub const SYS_INT_GATE286: u8 = 0x6;
pub const SYS_TRAP_GATE286: u8 = 0x7;
pub const SYS_TSS386_AVAIL: u8 = 0x9;
pub const SYS_TSS386_BUSY: u8 = 0xB;
pub const SYS_CALL_GATE386: u8 = 0xC;
pub const SYS_INT_GATE386: u8 = 0xE;
pub const SYS_TRAP_GATE386: u8 = 0xF;

/// Hidden part of a segment register.
///
/// Expand-down segments are stored as the valid offset window
/// `limit_low..=limit_high`, so the limit check is the same two compares for
/// both kinds of data segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentCache {
    pub selector: u16,
    pub base: u32,
    pub limit: u32,
    pub limit_low: u32,
    pub limit_high: u32,
    pub access: u8,
    /// High nibble of descriptor byte 6: G, D/B, AVL.
    pub ar_high: u8,
}

impl SegmentCache {
    pub fn real_mode(selector: u16) -> Self {
        Self {
            selector,
            base: (selector as u32) << 4,
            limit: 0xFFFF,
            limit_low: 0,
            limit_high: 0xFFFF,
            access: ACC_PRESENT | ACC_SEGMENT | ACC_RW | ACC_ACCESSED,
            ar_high: 0,
        }
    }

    pub fn v86(selector: u16) -> Self {
        Self {
            access: ACC_PRESENT | (3 << 5) | ACC_SEGMENT | ACC_RW | ACC_ACCESSED,
            ..Self::real_mode(selector)
        }
    }

    /// The state a null selector leaves behind in protected mode.
    pub fn null(selector: u16) -> Self {
        Self {
            selector,
            ..Self::default()
        }
    }

    pub fn from_descriptor(selector: u16, desc: &Descriptor, is386: bool) -> Self {
        Self::from_parts(selector, desc.base(is386), desc.limit(), desc.access(), desc.ar_high())
    }

    /// Builds a cache from already-decoded fields, as LOADALL supplies them.
    pub fn from_parts(selector: u16, base: u32, limit: u32, access: u8, ar_high: u8) -> Self {
        let expand_down = access & (ACC_SEGMENT | ACC_CODE | ACC_DC) == ACC_SEGMENT | ACC_DC;
        let (limit_low, limit_high) = if expand_down {
            let top = if ar_high & 0x40 != 0 { 0xFFFF_FFFF } else { 0xFFFF };
            (limit.wrapping_add(1), top)
        } else {
            (0, limit)
        };
        Self {
            selector,
            base,
            limit,
            limit_low,
            limit_high,
            access,
            ar_high,
        }
    }

    pub fn dpl(&self) -> u8 {
        (self.access >> 5) & 3
    }

    pub fn present(&self) -> bool {
        self.access & ACC_PRESENT != 0
    }

    pub fn is_code(&self) -> bool {
        self.access & (ACC_SEGMENT | ACC_CODE) == ACC_SEGMENT | ACC_CODE
    }

    pub fn is_readable(&self) -> bool {
        !self.is_code() || self.access & ACC_RW != 0
    }

    pub fn is_writable(&self) -> bool {
        self.access & (ACC_SEGMENT | ACC_CODE | ACC_RW) == ACC_SEGMENT | ACC_RW
    }

    pub fn is_32bit(&self) -> bool {
        self.ar_high & 0x40 != 0
    }

    pub fn is_flat(&self) -> bool {
        self.base == 0 && self.limit_low == 0 && self.limit_high == 0xFFFF_FFFF
    }

    /// Whether `size` bytes at `offset` fall inside the segment.
    pub fn contains(&self, offset: u32, size: u32) -> bool {
        let last = offset.wrapping_add(size - 1);
        offset >= self.limit_low && last >= offset && last <= self.limit_high
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescriptorTable {
    pub base: u32,
    pub limit: u16,
}

/// An 8-byte descriptor as stored in the GDT, LDT or IDT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub u64);

impl Descriptor {
    pub fn word(&self, n: u32) -> u16 {
        (self.0 >> (n * 16)) as u16
    }

    pub fn access(&self) -> u8 {
        (self.0 >> 40) as u8
    }

    pub fn ar_high(&self) -> u8 {
        (self.0 >> 48) as u8 & 0xF0
    }

    pub fn dpl(&self) -> u8 {
        (self.access() >> 5) & 3
    }

    pub fn present(&self) -> bool {
        self.access() & ACC_PRESENT != 0
    }

    /// Code or data segment, as opposed to a system descriptor.
    pub fn is_segment(&self) -> bool {
        self.access() & ACC_SEGMENT != 0
    }

    pub fn is_code(&self) -> bool {
        self.is_segment() && self.access() & ACC_CODE != 0
    }

    pub fn is_conforming(&self) -> bool {
        self.is_code() && self.access() & ACC_DC != 0
    }

    pub fn is_readable(&self) -> bool {
        !self.is_code() || self.access() & ACC_RW != 0
    }

    pub fn is_writable_data(&self) -> bool {
        self.is_segment() && self.access() & (ACC_CODE | ACC_RW) == ACC_RW
    }

    pub fn system_type(&self) -> u8 {
        self.access() & 0x0F
    }

    pub fn base(&self, is386: bool) -> u32 {
        let low = (self.0 >> 16) as u32 & 0x00FF_FFFF;
        if is386 {
            low | (((self.0 >> 56) as u32) << 24)
        } else {
            low
        }
    }

    /// Byte-granular limit, scaled when G is set.
    pub fn limit(&self) -> u32 {
        let raw = (self.0 as u32 & 0xFFFF) | (((self.0 >> 48) as u32 & 0xF) << 16);
        if self.ar_high() & 0x80 != 0 {
            (raw << 12) | 0xFFF
        } else {
            raw
        }
    }

    pub fn gate_selector(&self) -> u16 {
        self.word(1)
    }

    pub fn gate_offset(&self) -> u32 {
        if self.system_type() & 0x8 != 0 {
            self.word(0) as u32 | ((self.word(3) as u32) << 16)
        } else {
            self.word(0) as u32
        }
    }

    pub fn gate_param_count(&self) -> u32 {
        (self.0 >> 32) as u32 & 0x1F
    }

    /// 386-style gate or TSS (32-bit pushes and offsets).
    pub fn is_32bit_system(&self) -> bool {
        self.system_type() & 0x8 != 0
    }
}

impl Cpu {
    /// Linear address of the descriptor for `selector`, or `err(selector)`
    /// when it falls outside its table.
    pub fn descriptor_addr(&self, selector: u16, err: fn(u16) -> Fault) -> Result<u32> {
        let index = (selector & !7) as u32;
        let (base, limit) = if selector & 4 != 0 {
            (self.ldt.base, self.ldt.limit)
        } else {
            (self.gdt.base, self.gdt.limit as u32)
        };
        if index + 7 > limit {
            return Err(err(selector & 0xFFFC));
        }
        Ok(base.wrapping_add(index))
    }

    pub fn read_descriptor(&mut self, selector: u16, err: fn(u16) -> Fault) -> Result<(Descriptor, u32)> {
        let addr = self.descriptor_addr(selector, err)?;
        let raw = self.read_sys_64(addr)?;
        Ok((Descriptor(raw), addr))
    }

    pub fn mark_accessed(&mut self, addr: u32, desc: &Descriptor) -> Result<()> {
        if desc.access() & ACC_ACCESSED == 0 {
            self.write_sys_8(addr + 5, desc.access() | ACC_ACCESSED)?;
        }
        Ok(())
    }

    /// Loads a data segment register or SS the way MOV/POP/LxS do.
    pub fn load_seg(&mut self, seg: SegReg, selector: u16) -> Result<()> {
        if !self.protected_mode() {
            // Real mode keeps the cached limit and rights
            let cache = &mut self.segs[seg as usize];
            cache.selector = selector;
            cache.base = (selector as u32) << 4;
            self.update_status();
            return Ok(());
        }
        if self.v86_mode() {
            self.segs[seg as usize] = SegmentCache::v86(selector);
            self.update_status();
            return Ok(());
        }

        if selector & !3 == 0 {
            if seg == SegReg::Ss {
                return Err(Fault::GeneralProtection(0));
            }
            self.segs[seg as usize] = SegmentCache::null(selector);
            self.update_status();
            return Ok(());
        }

        let (desc, addr) = self.read_descriptor(selector, Fault::GeneralProtection)?;
        let rpl = (selector & 3) as u8;
        let cpl = self.cpl();
        let dpl = desc.dpl();
        let err = Fault::GeneralProtection(selector & 0xFFFC);

        if seg == SegReg::Ss {
            if rpl != cpl || dpl != cpl || !desc.is_writable_data() {
                return Err(err);
            }
            if !desc.present() {
                return Err(Fault::StackFault(selector & 0xFFFC));
            }
        } else {
            if !desc.is_segment() || !desc.is_readable() {
                return Err(err);
            }
            if !desc.is_conforming() && (rpl > dpl || cpl > dpl) {
                return Err(err);
            }
            if !desc.present() {
                return Err(Fault::SegmentNotPresent(selector & 0xFFFC));
            }
        }

        self.mark_accessed(addr, &desc)?;
        let is386 = self.model.is_386_class();
        self.segs[seg as usize] = SegmentCache::from_descriptor(selector, &desc, is386);
        self.update_status();
        Ok(())
    }

    /// Real and V86 mode CS load.
    pub fn load_cs_real(&mut self, selector: u16) {
        self.segs[SegReg::Cs as usize] = if self.v86_mode() {
            SegmentCache::v86(selector)
        } else {
            SegmentCache {
                access: ACC_PRESENT | ACC_SEGMENT | ACC_RW | ACC_ACCESSED,
                ..SegmentCache::real_mode(selector)
            }
        };
        self.update_status();
    }

    /// Commits a validated code descriptor to CS, recording `cpl` in the
    /// cached DPL bits and the selector RPL.
    pub fn commit_cs(&mut self, selector: u16, desc: &Descriptor, cpl: u8) {
        let old_use32 = self.use32();
        let is386 = self.model.is_386_class();
        let mut cache = SegmentCache::from_descriptor((selector & !3) | cpl as u16, desc, is386);
        cache.access = (cache.access & !(3 << 5)) | (cpl << 5);
        self.segs[SegReg::Cs as usize] = cache;
        self.update_status();
        if old_use32 != self.use32() {
            log::debug!("[SEG] code segment now {}-bit", if self.use32() { 32 } else { 16 });
        }
    }

    /// Commits a validated stack descriptor to SS.
    pub fn commit_ss(&mut self, selector: u16, desc: &Descriptor) {
        let is386 = self.model.is_386_class();
        self.segs[SegReg::Ss as usize] = SegmentCache::from_descriptor(selector, desc, is386);
        self.update_status();
    }

    /// Fetches and validates a stack segment for a ring transition to
    /// `dpl`. Failures raise `err` (#TS for gates, #GP for returns).
    pub fn fetch_stack_descriptor(
        &mut self,
        selector: u16,
        dpl: u8,
        err: fn(u16) -> Fault,
    ) -> Result<Descriptor> {
        if selector & !3 == 0 {
            return Err(err(0));
        }
        let (desc, addr) = self.read_descriptor(selector, err)?;
        if (selector & 3) as u8 != dpl || desc.dpl() != dpl || !desc.is_writable_data() {
            return Err(err(selector & 0xFFFC));
        }
        if !desc.present() {
            return Err(Fault::StackFault(selector & 0xFFFC));
        }
        self.mark_accessed(addr, &desc)?;
        Ok(desc)
    }

    /// After a return to an outer ring, data segments the new CPL may not
    /// use are nulled.
    pub fn invalidate_inaccessible_segs(&mut self) {
        let cpl = self.cpl();
        for seg in [SegReg::Es, SegReg::Ds, SegReg::Fs, SegReg::Gs] {
            let cache = self.segs[seg as usize];
            let conforming = cache.is_code() && cache.access & ACC_DC != 0;
            let rpl = (cache.selector & 3) as u8;
            if !conforming && (cache.dpl() < cpl || cache.dpl() < rpl) {
                self.segs[seg as usize] = SegmentCache::null(0);
            }
        }
        self.update_status();
    }

    /// Fetches and validates a code descriptor for a far transfer that keeps
    /// or lowers privilege the way JMP and CALL to a plain code segment do.
    pub fn check_code_descriptor(&mut self, selector: u16, desc: &Descriptor) -> Result<()> {
        let cpl = self.cpl();
        let rpl = (selector & 3) as u8;
        let err = Fault::GeneralProtection(selector & 0xFFFC);
        if !desc.is_code() {
            return Err(err);
        }
        if desc.is_conforming() {
            if desc.dpl() > cpl {
                return Err(err);
            }
        } else if rpl > cpl || desc.dpl() != cpl {
            return Err(err);
        }
        if !desc.present() {
            return Err(Fault::SegmentNotPresent(selector & 0xFFFC));
        }
        Ok(())
    }

    /// Loads the LDT register from a GDT selector (LLDT, task switch).
    pub fn load_ldt(&mut self, selector: u16, err: fn(u16) -> Fault) -> Result<()> {
        if selector & !3 == 0 {
            self.ldt = SegmentCache::null(selector);
            return Ok(());
        }
        if selector & 4 != 0 {
            return Err(err(selector & 0xFFFC));
        }
        let (desc, _) = self.read_descriptor(selector, err)?;
        if desc.is_segment() || desc.system_type() != SYS_LDT {
            return Err(err(selector & 0xFFFC));
        }
        if !desc.present() {
            return Err(Fault::SegmentNotPresent(selector & 0xFFFC));
        }
        let is386 = self.model.is_386_class();
        self.ldt = SegmentCache::from_descriptor(selector, &desc, is386);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_fields() {
        // base 0x12345678, limit 0xFFFFF with G, 32-bit, present DPL3 data RW
        let desc = Descriptor(0x12CF_F234_5678_FFFF);
        assert_eq!(desc.base(true), 0x1234_5678);
        assert_eq!(desc.base(false), 0x0034_5678);
        assert_eq!(desc.limit(), 0xFFFF_FFFF);
        assert_eq!(desc.dpl(), 3);
        assert!(desc.is_writable_data());
        let cache = SegmentCache::from_descriptor(0x23, &desc, true);
        assert!(cache.is_32bit());
        assert!(cache.contains(0xFFFF_FFF0, 4));
    }

    #[test]
    fn expand_down_window() {
        // limit 0x0FFF, expand-down RW data, 16-bit
        let desc = Descriptor(0x0000_9600_0000_0FFF);
        let cache = SegmentCache::from_descriptor(0x10, &desc, true);
        assert_eq!(cache.limit_low, 0x1000);
        assert_eq!(cache.limit_high, 0xFFFF);
        assert!(!cache.contains(0x0FFF, 1));
        assert!(cache.contains(0x1000, 2));
        assert!(!cache.contains(0xFFFF, 2));
    }
}
