//! UHCI transfer descriptors.
//!
//! Layout (UHCI 1.1, section 3.2): link pointer at 0x00, control/status at 0x04, token at
//! 0x08 and buffer pointer at 0x0C. The remaining 16 bytes of the 32-byte block are reserved for
//! software and left untouched.

use bitflags::bitflags;

use crate::descriptor::AlignedDescriptor;
use crate::link::LinkPointer;
use crate::memory::DmaRegion;
use crate::resources::ResourceManager;
use crate::{Result, UsbError};

pub const TD_SIZE: usize = 32;
pub const TD_ALIGN: usize = 16;

const TD_LINK: usize = 0x00;
const TD_CTRL: usize = 0x04;
const TD_TOKEN: usize = 0x08;
const TD_BUFFER: usize = 0x0C;

pub const TD_CTRL_ACTLEN_MASK: u32 = 0x7FF;
pub const TD_CTRL_ERROR_COUNT_SHIFT: u32 = 27;

const TD_TOKEN_DEVADDR_SHIFT: u32 = 8;
const TD_TOKEN_ENDPT_SHIFT: u32 = 15;
const TD_TOKEN_D: u32 = 1 << 19;
const TD_TOKEN_MAXLEN_SHIFT: u32 = 21;

/// Encoded length meaning "zero bytes" in both the token MaxLen and the ActLen fields.
pub const NULL_LENGTH: u32 = 0x7FF;

/// Largest data payload a single UHCI TD can describe.
pub const MAX_TD_LENGTH: usize = 1280;

bitflags! {
    /// Bits of the TD control/status word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TdStatus: u32 {
        const BITSTUFF = 1 << 17;
        const CRC_TIMEOUT = 1 << 18;
        const NAK = 1 << 19;
        const BABBLE = 1 << 20;
        const DATA_BUFFER = 1 << 21;
        const STALLED = 1 << 22;
        const ACTIVE = 1 << 23;
        const IOC = 1 << 24;
        const ISOCHRONOUS = 1 << 25;
        const LOW_SPEED = 1 << 26;
        const SHORT_PACKET_DETECT = 1 << 29;

        const ERRORS = Self::BITSTUFF.bits()
            | Self::CRC_TIMEOUT.bits()
            | Self::NAK.bits()
            | Self::BABBLE.bits()
            | Self::DATA_BUFFER.bits()
            | Self::STALLED.bits();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketId {
    Setup = 0x2D,
    In = 0x69,
    Out = 0xE1,
}

impl PacketId {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0x2D => Some(PacketId::Setup),
            0x69 => Some(PacketId::In),
            0xE1 => Some(PacketId::Out),
            _ => None,
        }
    }
}

/// Token and control fields of a TD to be created.
#[derive(Debug, Clone, Copy)]
pub struct TdFields {
    pub device_address: u8,
    pub endpoint: u8,
    pub packet_id: PacketId,
    pub data_toggle: bool,
    pub length: usize,
    pub isochronous: bool,
    pub low_speed: bool,
    pub interrupt_on_complete: bool,
}

fn encode_length(length: usize) -> u32 {
    if length == 0 {
        NULL_LENGTH
    } else {
        (length as u32 - 1) & NULL_LENGTH
    }
}

/// A single USB transaction descriptor plus the software view of the chain that follows it.
///
/// TDs of one transfer form a singly linked list. The hardware link word is the source of truth
/// for the controller; `next` mirrors TD-typed links so software can walk and own the chain, and
/// stays `None` when the TD terminates or links into a queue head.
pub struct TransferDescriptor {
    desc: AlignedDescriptor,
    initial_ctrl: u32,
    length: usize,
    link: LinkPointer,
    next: Option<Box<TransferDescriptor>>,
}

impl TransferDescriptor {
    /// Build a TD. `buffer` is the DMA region holding the packet data and the offset within it;
    /// `None` describes a zero-length packet (buffer pointer 0).
    pub fn new(
        rm: &dyn ResourceManager,
        fields: TdFields,
        buffer: Option<(&DmaRegion, usize)>,
    ) -> Result<Self> {
        if fields.device_address > 0x7F {
            return Err(UsbError::InvalidArgument("USB device address out of range"));
        }
        if fields.endpoint > 0x0F {
            return Err(UsbError::InvalidArgument("endpoint number out of range"));
        }
        if fields.length > MAX_TD_LENGTH {
            return Err(UsbError::InvalidArgument("TD length exceeds 1280 bytes"));
        }
        let buffer_phys = match buffer {
            Some((region, offset)) => {
                if offset + fields.length > region.len() {
                    return Err(UsbError::InvalidArgument("TD buffer range exceeds DMA region"));
                }
                region.phys() + offset as u32
            }
            None if fields.length != 0 => {
                return Err(UsbError::InvalidArgument("non-zero length TD without a buffer"));
            }
            None => 0,
        };

        let mut ctrl = TdStatus::ACTIVE | TdStatus::SHORT_PACKET_DETECT;
        if fields.isochronous {
            ctrl |= TdStatus::ISOCHRONOUS;
        }
        if fields.low_speed {
            ctrl |= TdStatus::LOW_SPEED;
        }
        if fields.interrupt_on_complete {
            ctrl |= TdStatus::IOC;
        }
        let initial_ctrl = ctrl.bits() | (3 << TD_CTRL_ERROR_COUNT_SHIFT) | NULL_LENGTH;

        let token = u32::from(fields.packet_id as u8)
            | (u32::from(fields.device_address) << TD_TOKEN_DEVADDR_SHIFT)
            | (u32::from(fields.endpoint) << TD_TOKEN_ENDPT_SHIFT)
            | if fields.data_toggle { TD_TOKEN_D } else { 0 }
            | (encode_length(fields.length) << TD_TOKEN_MAXLEN_SHIFT);

        let desc = AlignedDescriptor::allocate(rm, TD_SIZE, TD_ALIGN)?;
        desc.write_u32(TD_LINK, LinkPointer::Terminate.encode());
        desc.write_u32(TD_TOKEN, token);
        desc.write_u32(TD_BUFFER, buffer_phys);
        desc.write_u32(TD_CTRL, initial_ctrl);

        Ok(Self {
            desc,
            initial_ctrl,
            length: fields.length,
            link: LinkPointer::Terminate,
            next: None,
        })
    }

    pub fn physical_address(&self) -> u32 {
        self.desc.physical_address()
    }

    /// Rewrite the control word to its post-construction value, re-arming the TD.
    ///
    /// Only valid while the controller cannot reach this TD, or after it has observed
    /// `Active == 0`.
    pub fn reset_status(&self) {
        self.desc.write_u32(TD_CTRL, self.initial_ctrl);
    }

    /// Clear the Active bit without touching anything else (used for placeholder TDs).
    pub fn deactivate(&self) {
        let ctrl = self.desc.read_u32(TD_CTRL) & !TdStatus::ACTIVE.bits();
        self.desc.write_u32(TD_CTRL, ctrl);
    }

    /// Link to a queue head. Any TD previously chained behind this one is released to the caller.
    pub fn set_link_qh(&mut self, qh_addr: u32, depth_first: bool) -> Option<Box<TransferDescriptor>> {
        self.write_link(LinkPointer::Qh {
            addr: qh_addr,
            depth_first,
        });
        self.next.take()
    }

    /// Chain `next` behind this TD, taking ownership of it.
    pub fn set_next_td(
        &mut self,
        next: TransferDescriptor,
        depth_first: bool,
    ) -> Option<Box<TransferDescriptor>> {
        self.write_link(LinkPointer::Td {
            addr: next.physical_address(),
            depth_first,
        });
        self.next.replace(Box::new(next))
    }

    /// Terminate the link and hand back whatever TD chain was behind this one.
    pub fn remove_link(&mut self) -> Option<Box<TransferDescriptor>> {
        self.write_link(LinkPointer::Terminate);
        self.next.take()
    }

    fn write_link(&mut self, link: LinkPointer) {
        self.link = link;
        self.desc.write_u32(TD_LINK, link.encode());
    }

    pub fn link(&self) -> LinkPointer {
        self.link
    }

    /// Walk to the last TD of this chain and link `other` behind it.
    pub fn append(&mut self, other: TransferDescriptor, depth_first: bool) {
        let mut tail = self;
        loop {
            let cur = tail;
            match cur.next {
                Some(ref mut next) => tail = next,
                None => {
                    cur.set_next_td(other, depth_first);
                    return;
                }
            }
        }
    }

    pub fn next_td(&self) -> Option<&TransferDescriptor> {
        self.next.as_deref()
    }

    pub fn iter(&self) -> TdIter<'_> {
        TdIter { cur: Some(self) }
    }

    pub fn control_status(&self) -> u32 {
        self.desc.read_u32(TD_CTRL)
    }

    pub fn token(&self) -> u32 {
        self.desc.read_u32(TD_TOKEN)
    }

    pub fn buffer_pointer(&self) -> u32 {
        self.desc.read_u32(TD_BUFFER)
    }

    pub fn packet_id(&self) -> Option<PacketId> {
        PacketId::from_u8((self.token() & 0xFF) as u8)
    }

    pub fn data_toggle(&self) -> bool {
        self.token() & TD_TOKEN_D != 0
    }

    /// Rewrite the DATA0/DATA1 bit. Same reachability rule as [`Self::reset_status`].
    pub fn set_data_toggle(&self, toggle: bool) {
        let token = self.token();
        let token = if toggle {
            token | TD_TOKEN_D
        } else {
            token & !TD_TOKEN_D
        };
        self.desc.write_u32(TD_TOKEN, token);
    }

    /// The number of bytes this TD was built to move.
    pub fn max_length(&self) -> usize {
        self.length
    }

    fn status(&self) -> TdStatus {
        TdStatus::from_bits_retain(self.control_status())
    }

    pub fn is_active(&self) -> bool {
        self.status().contains(TdStatus::ACTIVE)
    }

    pub fn is_stalled(&self) -> bool {
        self.status().contains(TdStatus::STALLED)
    }

    pub fn is_data_buffer_error(&self) -> bool {
        self.status().contains(TdStatus::DATA_BUFFER)
    }

    pub fn is_babble(&self) -> bool {
        self.status().contains(TdStatus::BABBLE)
    }

    pub fn is_nak(&self) -> bool {
        self.status().contains(TdStatus::NAK)
    }

    pub fn is_crc_timeout(&self) -> bool {
        self.status().contains(TdStatus::CRC_TIMEOUT)
    }

    pub fn is_bitstuff_error(&self) -> bool {
        self.status().contains(TdStatus::BITSTUFF)
    }

    pub fn is_any_error(&self) -> bool {
        self.status().intersects(TdStatus::ERRORS)
    }

    pub fn is_interrupt_on_complete(&self) -> bool {
        self.status().contains(TdStatus::IOC)
    }

    pub fn get_actual_length(&self) -> usize {
        let raw = self.control_status() & TD_CTRL_ACTLEN_MASK;
        if raw == NULL_LENGTH {
            0
        } else {
            raw as usize + 1
        }
    }
}

impl Drop for TransferDescriptor {
    fn drop(&mut self) {
        // Unlink iteratively so very long bulk chains don't recurse through Box drops.
        let mut next = self.next.take();
        while let Some(mut td) = next {
            next = td.next.take();
        }
    }
}

pub struct TdIter<'a> {
    cur: Option<&'a TransferDescriptor>,
}

impl<'a> Iterator for TdIter<'a> {
    type Item = &'a TransferDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.cur?;
        self.cur = cur.next_td();
        Some(cur)
    }
}
