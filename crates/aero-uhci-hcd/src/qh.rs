//! UHCI queue heads (UHCI 1.1, section 3.3).

use std::fmt;

use crate::descriptor::AlignedDescriptor;
use crate::link::LinkPointer;
use crate::resources::ResourceManager;
use crate::td::TransferDescriptor;
use crate::{Result, UsbError};

pub const QH_SIZE: usize = 16;
pub const QH_ALIGN: usize = 16;

const QH_LINK: u32 = 0x00;
const QH_ELEMENT: u32 = 0x04;

/// Upper bound on horizontal links followed when searching the schedule.
///
/// The skeleton ends in a loop (terminator QH back to the control queue), so the walk also stops
/// when it comes back around to where it started.
const MAX_HORIZONTAL_WALK: usize = 4096;

pub struct QueueHead {
    desc: AlignedDescriptor,
}

impl QueueHead {
    pub fn new(rm: &dyn ResourceManager) -> Result<Self> {
        let desc = AlignedDescriptor::allocate(rm, QH_SIZE, QH_ALIGN)?;
        desc.write_u32(QH_LINK as usize, LinkPointer::Terminate.encode());
        desc.write_u32(QH_ELEMENT as usize, LinkPointer::Terminate.encode());
        Ok(Self { desc })
    }

    pub fn physical_address(&self) -> u32 {
        self.desc.physical_address()
    }

    pub fn link(&self) -> LinkPointer {
        LinkPointer::decode(self.desc.read_u32(QH_LINK as usize))
    }

    pub fn element(&self) -> LinkPointer {
        LinkPointer::decode(self.desc.read_u32(QH_ELEMENT as usize))
    }

    /// Point the horizontal link at a TD or QH (or terminate it).
    pub fn set_link(&self, link: LinkPointer) {
        self.desc.write_u32(QH_LINK as usize, link.encode());
    }

    pub fn clear_link(&self) {
        self.set_link(LinkPointer::Terminate);
    }

    /// Redirect the element pointer. Used to skip straight to a control transfer's status stage.
    pub fn set_element(&self, element: LinkPointer) {
        self.desc.write_u32(QH_ELEMENT as usize, element.encode());
    }

    /// Splice `other` into the horizontal list directly after `self`.
    ///
    /// `other` must not have an outgoing link yet; only freshly created (or fully removed) queue
    /// heads may be inserted.
    pub fn insert_link(&self, other: &QueueHead) -> Result<()> {
        if !other.link().is_terminate() {
            return Err(UsbError::InvalidState("queue head is already linked"));
        }
        // Publish the new QH's forward link before making it reachable.
        other.set_link(self.link());
        self.set_link(LinkPointer::qh(other.physical_address()));
        Ok(())
    }

    /// Search the horizontal list starting at `self` for the QH linking to `target` and splice
    /// `target` out.
    ///
    /// Silently does nothing when `target` isn't found: the list may hold a TD where a QH was
    /// expected, or `target` may already have been removed by an earlier unlink.
    pub fn remove_link(&self, target: &QueueHead) {
        let bus = self.desc.bus();
        let start = self.physical_address();
        let target_addr = target.physical_address();

        let mut cur = start;
        for _ in 0..MAX_HORIZONTAL_WALK {
            match LinkPointer::decode(bus.read_u32(cur + QH_LINK)) {
                LinkPointer::Qh { addr, .. } if addr == target_addr => {
                    bus.write_u32(cur + QH_LINK, target.link().encode());
                    target.clear_link();
                    return;
                }
                LinkPointer::Qh { addr, .. } if addr != start => cur = addr,
                _ => return,
            }
        }
    }

    /// Attach a TD chain as this queue's element list.
    pub fn add(&self, first_td: &TransferDescriptor) -> Result<()> {
        if !self.is_empty() {
            return Err(UsbError::InvalidState("queue head is not empty"));
        }
        self.set_element(LinkPointer::td(first_td.physical_address()));
        Ok(())
    }

    /// Detach the chain starting at `first_td` if the element pointer currently points into it.
    ///
    /// No-op when the chain was never attached or has already been removed.
    pub fn remove(&self, first_td: &TransferDescriptor) {
        let LinkPointer::Td { addr, .. } = self.element() else {
            return;
        };
        if first_td.iter().any(|td| td.physical_address() == addr) {
            self.set_element(LinkPointer::Terminate);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.element().is_terminate()
    }
}

impl fmt::Debug for QueueHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueHead")
            .field("phys", &format_args!("{:#x}", self.physical_address()))
            .field("link", &self.link())
            .field("element", &self.element())
            .finish()
    }
}
