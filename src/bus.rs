use std::collections::HashMap;
use std::ops::RangeInclusive;

/// A device answering on one or more I/O ports.
///
/// Only the byte accessors are required; wider accesses are split into
/// consecutive byte ports, little endian, the way an 8-bit ISA device sees them.
pub trait PortDevice {
    fn read_8(&mut self, port: u16) -> u8;
    fn write_8(&mut self, port: u16, value: u8);

    fn read_16(&mut self, port: u16) -> u16 {
        let low = self.read_8(port) as u16;
        let high = self.read_8(port.wrapping_add(1)) as u16;
        (high << 8) | low
    }

    fn write_16(&mut self, port: u16, value: u16) {
        self.write_8(port, value as u8);
        self.write_8(port.wrapping_add(1), (value >> 8) as u8);
    }

    fn read_32(&mut self, port: u16) -> u32 {
        let low = self.read_16(port) as u32;
        let high = self.read_16(port.wrapping_add(2)) as u32;
        (high << 16) | low
    }

    fn write_32(&mut self, port: u16, value: u32) {
        self.write_16(port, value as u16);
        self.write_16(port.wrapping_add(2), (value >> 16) as u16);
    }
}

/// Physical memory and the I/O port space as seen from the CPU pins.
pub struct Bus {
    pub ram: Vec<u8>,
    /// Highest address bit the package drives (24 bits on 286/386SX).
    address_mask: u32,
    a20: bool,
    devices: Vec<Box<dyn PortDevice>>,
    port_map: HashMap<u16, usize>,
}

impl Bus {
    pub fn new(memory_size: usize, address_mask: u32) -> Self {
        Self {
            ram: vec![0; memory_size],
            address_mask,
            a20: true,
            devices: Vec::new(),
            port_map: HashMap::new(),
        }
    }

    pub fn set_a20(&mut self, enabled: bool) {
        if self.a20 != enabled {
            log::debug!("[BUS] A20 gate {}", if enabled { "enabled" } else { "disabled" });
        }
        self.a20 = enabled;
    }

    pub fn a20(&self) -> bool {
        self.a20
    }

    fn wrap(&self, addr: usize) -> usize {
        let mut addr = addr as u32 & self.address_mask;
        if !self.a20 {
            addr &= !(1 << 20);
        }
        addr as usize
    }

    /// Copies an image into physical memory, clipped to the installed RAM.
    pub fn load(&mut self, addr: usize, data: &[u8]) {
        let start = addr.min(self.ram.len());
        let end = (addr + data.len()).min(self.ram.len());
        self.ram[start..end].copy_from_slice(&data[..end - start]);
    }

    // Reads past the end of RAM float high, like an empty socket
    pub fn read_8(&self, addr: usize) -> u8 {
        let addr = self.wrap(addr);
        self.ram.get(addr).copied().unwrap_or(0xFF)
    }

    pub fn write_8(&mut self, addr: usize, value: u8) {
        let addr = self.wrap(addr);
        if let Some(cell) = self.ram.get_mut(addr) {
            *cell = value;
        }
    }

    /// Little-endian word at `addr`.
    pub fn read_16(&self, addr: usize) -> u16 {
        let low = self.read_8(addr) as u16;
        let high = self.read_8(addr + 1) as u16;
        (high << 8) | low
    }

    /// Stores `value` little-endian at `addr`.
    pub fn write_16(&mut self, addr: usize, value: u16) {
        self.write_8(addr, (value & 0xFF) as u8);
        self.write_8(addr + 1, (value >> 8) as u8);
    }

    pub fn read_32(&self, addr: usize) -> u32 {
        let low = self.read_16(addr) as u32;
        let high = self.read_16(addr + 2) as u32;
        (high << 16) | low
    }

    pub fn write_32(&mut self, addr: usize, value: u32) {
        self.write_16(addr, (value & 0xFFFF) as u16);
        self.write_16(addr + 2, (value >> 16) as u16);
    }

    pub fn read_64(&self, addr: usize) -> u64 {
        let low = self.read_32(addr) as u64;
        let high = self.read_32(addr + 4) as u64;
        (high << 32) | low
    }

    pub fn write_64(&mut self, addr: usize, value: u64) {
        self.write_32(addr, (value & 0xFFFF_FFFF) as u32);
        self.write_32(addr + 4, (value >> 32) as u32);
    }

    // ====================================================================
    // I/O ports
    // ====================================================================

    /// Maps every port in `ports` to `device`. Later attachments win.
    pub fn attach_port(&mut self, ports: RangeInclusive<u16>, device: Box<dyn PortDevice>) {
        let index = self.devices.len();
        self.devices.push(device);
        for port in ports {
            self.port_map.insert(port, index);
        }
    }

    fn device(&mut self, port: u16) -> Option<&mut Box<dyn PortDevice>> {
        let index = *self.port_map.get(&port)?;
        self.devices.get_mut(index)
    }

    // Unclaimed ports read as open bus
    pub fn io_read_8(&mut self, port: u16) -> u8 {
        match self.device(port) {
            Some(dev) => dev.read_8(port),
            None => {
                log::trace!("[IO] unhandled read from port {:04X}", port);
                0xFF
            }
        }
    }

    pub fn io_read_16(&mut self, port: u16) -> u16 {
        match self.device(port) {
            Some(dev) => dev.read_16(port),
            None => 0xFFFF,
        }
    }

    pub fn io_read_32(&mut self, port: u16) -> u32 {
        match self.device(port) {
            Some(dev) => dev.read_32(port),
            None => 0xFFFF_FFFF,
        }
    }

    pub fn io_write_8(&mut self, port: u16, value: u8) {
        match self.device(port) {
            Some(dev) => dev.write_8(port, value),
            None => log::trace!("[IO] unhandled write {:02X} to port {:04X}", value, port),
        }
    }

    pub fn io_write_16(&mut self, port: u16, value: u16) {
        if let Some(dev) = self.device(port) {
            dev.write_16(port, value);
        }
    }

    pub fn io_write_32(&mut self, port: u16, value: u32) {
        if let Some(dev) = self.device(port) {
            dev.write_32(port, value);
        }
    }
}
