use crate::config::Features;
use crate::cpu::Cpu;
use crate::error::{Fault, Result};
use crate::segment::{Descriptor, SegReg, SegmentCache};

use super::utils::ModRm;

const PORT_INDEX: u16 = 0x22;
const PORT_DATA: u16 = 0x23;
/// DIR0 device id of a 6x86MX at a 2x clock.
const DIR0: u8 = 0x51;

/// Re-encodes a descriptor cache in GDT format. Large limits are stored
/// page granular.
fn cache_to_descriptor(cache: &SegmentCache) -> Descriptor {
    let (limit, granular) = if cache.limit > 0xF_FFFF { (cache.limit >> 12, 0x80) } else { (cache.limit, 0) };
    let flags = (cache.ar_high & 0x70) | granular;
    Descriptor(
        (limit as u64 & 0xFFFF)
            | (cache.base as u64 & 0xFF_FFFF) << 16
            | (cache.access as u64) << 40
            | ((limit >> 16) as u64 & 0xF) << 48
            | (flags as u64) << 48
            | ((cache.base >> 24) as u64) << 56,
    )
}

impl Cpu {
    fn ccr_slot(index: u8) -> Option<usize> {
        match index {
            0xC0..=0xC3 => Some((index - 0xC0) as usize),
            0xE8..=0xEA => Some((index - 0xE8) as usize + 4),
            _ => None,
        }
    }

    /// Port 23h read on parts with Cyrix configuration registers.
    pub(crate) fn cyrix_port_read(&mut self, port: u16) -> Option<u8> {
        if port != PORT_DATA || !self.has_feature(Features::CYRIX_EXT) {
            return None;
        }
        let index = self.cyrix.index.take()?;
        Some(match index {
            0xFE => DIR0,
            0xFF => 0,
            _ => Self::ccr_slot(index).map_or(0xFF, |slot| self.cyrix.ccr[slot]),
        })
    }

    /// Ports 22h/23h writes; false when the write belongs on the bus.
    pub(crate) fn cyrix_port_write(&mut self, port: u16, value: u8) -> bool {
        if !self.has_feature(Features::CYRIX_EXT) {
            return false;
        }
        match port {
            PORT_INDEX => {
                self.cyrix.index = Some(value);
                true
            }
            PORT_DATA => match self.cyrix.index.take() {
                Some(index) => {
                    if let Some(slot) = Self::ccr_slot(index) {
                        log::debug!("[CYRIX] CCR {:02X} = {:02X}", index, value);
                        self.cyrix.ccr[slot] = value;
                    }
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    fn save_cache(&mut self, m: &ModRm, cache: SegmentCache) -> Result<()> {
        self.require_mem(m)?;
        self.check_cpl0()?;
        let desc = cache_to_descriptor(&cache);
        self.check_write_access(m.seg, m.offset, 10)?;
        self.write_mem_64(m.seg, m.offset, desc.0)?;
        let offset = self.ea_offset(m, 8);
        self.write_mem_16(m.seg, offset, cache.selector)?;
        self.clock(18);
        Ok(())
    }

    fn restore_cache(&mut self, m: &ModRm) -> Result<SegmentCache> {
        self.require_mem(m)?;
        self.check_cpl0()?;
        let raw = self.read_mem_64(m.seg, m.offset)?;
        let offset = self.ea_offset(m, 8);
        let selector = self.read_mem_16(m.seg, offset)?;
        self.clock(24);
        Ok(SegmentCache::from_descriptor(selector, &Descriptor(raw), true))
    }
}

/// 0F 78: SVDC m80, Sreg
pub fn svdc<const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let seg = SegReg::from_index(m.reg).ok_or(Fault::InvalidOpcode)?;
    let cache = *cpu.seg(seg);
    cpu.save_cache(&m, cache)
}

/// 0F 79: RSDC Sreg, m80. CS cannot be the target.
pub fn rsdc<const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let seg = match SegReg::from_index(m.reg) {
        Some(SegReg::Cs) | None => return Err(Fault::InvalidOpcode),
        Some(seg) => seg,
    };
    let cache = cpu.restore_cache(&m)?;
    *cpu.seg_mut(seg) = cache;
    cpu.update_status();
    Ok(())
}

/// 0F 7A: SVLDT m80
pub fn svldt<const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let cache = cpu.ldt;
    cpu.save_cache(&m, cache)
}

/// 0F 7B: RSLDT m80
pub fn rsldt<const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    cpu.ldt = cpu.restore_cache(&m)?;
    Ok(())
}

/// 0F 7C: SVTS m80
pub fn svts<const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    let cache = cpu.tr;
    cpu.save_cache(&m, cache)
}

/// 0F 7D: RSTS m80
pub fn rsts<const A32: bool>(cpu: &mut Cpu, fetchdat: u32) -> Result<()> {
    let m = cpu.decode_modrm::<A32>(fetchdat)?;
    cpu.tr = cpu.restore_cache(&m)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::config::{CpuConfig, CpuModel};
    use crate::cpu::Cpu;
    use crate::error::Fault;
    use crate::flags::Size;
    use crate::segment::{SegReg, SegmentCache};

    use super::*;

    fn cpu_with_code(code: &[u8]) -> Cpu {
        let mut cpu = Cpu::new(CpuConfig::new(CpuModel::Cyrix6x86Mx));
        cpu.load_cs_real(0);
        cpu.eip = 0x100;
        cpu.oldpc = 0x100;
        cpu.bus.load(0x100, code);
        cpu
    }

    #[test]
    fn descriptor_encoding_keeps_flat_limit() {
        let cache = SegmentCache {
            selector: 0x10,
            base: 0x1234_5678,
            limit: 0xFFFF_FFFF,
            limit_low: 0,
            limit_high: 0xFFFF_FFFF,
            access: 0x93,
            ar_high: 0xC0,
        };
        let desc = cache_to_descriptor(&cache);
        assert_eq!(desc.limit(), 0xFFFF_FFFF);
        assert_eq!(desc.base(true), 0x1234_5678);
        assert_eq!(SegmentCache::from_descriptor(0x10, &desc, true), cache);
    }

    #[test]
    fn svdc_then_rsdc_round_trips_es() {
        // 0F 78 06 00 20: SVDC [2000], ES
        let mut cpu = cpu_with_code(&[0x06, 0x00, 0x20]);
        cpu.segs[SegReg::Es as usize] = SegmentCache {
            base: 0x0001_0000,
            ..SegmentCache::real_mode(0x1000)
        };
        let fetchdat = cpu.peek_fetchdat();
        svdc::<false>(&mut cpu, fetchdat).unwrap();
        assert_eq!(cpu.bus.read_16(0x2008), 0x1000);

        // 0F 79 1E 00 20: RSDC DS, [2000]
        cpu.bus.load(0x200, &[0x1E, 0x00, 0x20]);
        cpu.eip = 0x200;
        cpu.oldpc = 0x200;
        let fetchdat = cpu.peek_fetchdat();
        rsdc::<false>(&mut cpu, fetchdat).unwrap();
        assert_eq!(cpu.seg(SegReg::Ds).selector, 0x1000);
        assert_eq!(cpu.seg(SegReg::Ds).base, 0x0001_0000);
        assert_eq!(cpu.seg(SegReg::Ds).limit, 0xFFFF);
    }

    #[test]
    fn rsdc_rejects_cs_and_register_forms() {
        // 0F 79 0E ..: RSDC CS, [..]
        let mut cpu = cpu_with_code(&[0x0E, 0x00, 0x20]);
        let fetchdat = cpu.peek_fetchdat();
        assert_eq!(rsdc::<false>(&mut cpu, fetchdat), Err(Fault::InvalidOpcode));
        // 0F 7A C0: SVLDT with a register operand
        let mut cpu = cpu_with_code(&[0xC0]);
        let fetchdat = cpu.peek_fetchdat();
        assert_eq!(svldt::<false>(&mut cpu, fetchdat), Err(Fault::InvalidOpcode));
    }

    #[test]
    fn configuration_registers_through_ports() {
        let mut cpu = cpu_with_code(&[]);
        cpu.io_out(Size::Byte, 0x22, 0xC1).unwrap();
        cpu.io_out(Size::Byte, 0x23, 0x04).unwrap();
        assert_eq!(cpu.cyrix.ccr[1], 0x04);
        cpu.io_out(Size::Byte, 0x22, 0xFE).unwrap();
        assert_eq!(cpu.io_in(Size::Byte, 0x23), Ok(DIR0 as u32));
        cpu.io_out(Size::Byte, 0x22, 0xC1).unwrap();
        assert_eq!(cpu.io_in(Size::Byte, 0x23), Ok(0x04));
    }
}
