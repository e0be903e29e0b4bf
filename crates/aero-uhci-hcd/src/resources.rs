use std::sync::Arc;

use crate::memory::DmaRegion;
use crate::Result;

/// Port-mapped I/O access with byte/word/dword granularity.
///
/// `port` is an absolute I/O port number; `size` is 1, 2 or 4.
pub trait PortIo: Send + Sync {
    fn read(&self, port: u16, size: u8) -> u32;
    fn write(&self, port: u16, size: u8, value: u32);
}

/// Platform services the controller core depends on.
///
/// DMA regions handed out here must stay at the same physical address until dropped; the
/// controller writes those addresses into hardware link pointers.
pub trait ResourceManager: Send + Sync {
    fn allocate_dma(&self, size: usize, align: usize) -> Result<DmaRegion>;

    fn claim_io_ports(&self, base: u16, len: u16) -> Result<Arc<dyn PortIo>>;

    fn claim_irq(&self, line: u8) -> Result<()>;

    /// Write a 16-bit value into the controller function's PCI configuration space.
    fn write_pci_config_u16(&self, offset: u16, value: u16) -> Result<()>;
}
