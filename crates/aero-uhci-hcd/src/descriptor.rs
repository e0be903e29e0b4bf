use crate::memory::{DmaBacking, DmaRegion};
use crate::resources::ResourceManager;
use crate::{Result, UsbError};

/// A hardware-layout memory block with a fixed physical alignment.
///
/// The backing region is over-allocated by `alignment - 1` bytes and the descriptor starts at the
/// first suitably aligned address inside it. Field offsets passed to the accessors are relative to
/// that aligned start. The physical address is computed once and is stable for the lifetime of
/// the descriptor.
pub struct AlignedDescriptor {
    region: DmaRegion,
    offset: usize,
    size: usize,
}

impl AlignedDescriptor {
    pub fn allocate(rm: &dyn ResourceManager, payload_size: usize, alignment: usize) -> Result<Self> {
        if !alignment.is_power_of_two() || alignment < 4 {
            return Err(UsbError::InvalidArgument(
                "descriptor alignment must be a power of two >= 4",
            ));
        }
        let region = rm.allocate_dma(payload_size + alignment - 1, 4)?;
        let mask = alignment as u32 - 1;
        let aligned = region
            .phys()
            .checked_add(mask)
            .ok_or(UsbError::OutOfMemory {
                size: payload_size,
                align: alignment,
            })?
            & !mask;
        let offset = (aligned - region.phys()) as usize;
        Ok(Self {
            region,
            offset,
            size: payload_size,
        })
    }

    pub fn physical_address(&self) -> u32 {
        self.region.phys() + self.offset as u32
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn read_u32(&self, field_offset: usize) -> u32 {
        debug_assert!(field_offset + 4 <= self.size);
        self.region.read_u32(self.offset + field_offset)
    }

    pub fn write_u32(&self, field_offset: usize, value: u32) {
        debug_assert!(field_offset + 4 <= self.size);
        self.region.write_u32(self.offset + field_offset, value);
    }

    /// The memory this descriptor lives in, for following hardware links to other descriptors.
    pub fn bus(&self) -> &dyn DmaBacking {
        self.region.bus()
    }
}
