//! UHCI link pointers.
//!
//! The hardware stores a physical address in bits 31:4 and uses the low bits as tags:
//! T (bit 0) terminates the list, Q (bit 1) marks a queue head target, and Vf (bit 2, TD links
//! and frame list entries) selects depth-first traversal.

pub const LINK_PTR_TERMINATE: u32 = 1 << 0;
pub const LINK_PTR_QH: u32 = 1 << 1;
pub const LINK_PTR_DEPTH_FIRST: u32 = 1 << 2;
pub const LINK_PTR_ADDR_MASK: u32 = 0xFFFF_FFF0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPointer {
    Terminate,
    Td { addr: u32, depth_first: bool },
    Qh { addr: u32, depth_first: bool },
}

impl LinkPointer {
    pub fn td(addr: u32) -> Self {
        LinkPointer::Td {
            addr,
            depth_first: false,
        }
    }

    pub fn qh(addr: u32) -> Self {
        LinkPointer::Qh {
            addr,
            depth_first: false,
        }
    }

    pub fn encode(self) -> u32 {
        let vf = |df: bool| if df { LINK_PTR_DEPTH_FIRST } else { 0 };
        match self {
            LinkPointer::Terminate => LINK_PTR_TERMINATE,
            LinkPointer::Td { addr, depth_first } => {
                debug_assert_eq!(addr & !LINK_PTR_ADDR_MASK, 0);
                (addr & LINK_PTR_ADDR_MASK) | vf(depth_first)
            }
            LinkPointer::Qh { addr, depth_first } => {
                debug_assert_eq!(addr & !LINK_PTR_ADDR_MASK, 0);
                (addr & LINK_PTR_ADDR_MASK) | LINK_PTR_QH | vf(depth_first)
            }
        }
    }

    pub fn decode(raw: u32) -> Self {
        if raw & LINK_PTR_TERMINATE != 0 {
            return LinkPointer::Terminate;
        }
        let addr = raw & LINK_PTR_ADDR_MASK;
        let depth_first = raw & LINK_PTR_DEPTH_FIRST != 0;
        if raw & LINK_PTR_QH != 0 {
            LinkPointer::Qh { addr, depth_first }
        } else {
            LinkPointer::Td { addr, depth_first }
        }
    }

    pub fn is_terminate(self) -> bool {
        matches!(self, LinkPointer::Terminate)
    }

    pub fn addr(self) -> Option<u32> {
        match self {
            LinkPointer::Terminate => None,
            LinkPointer::Td { addr, .. } | LinkPointer::Qh { addr, .. } => Some(addr),
        }
    }

    /// True when this link targets the queue head at `addr`, regardless of the Vf bit.
    pub fn targets_qh(self, qh_addr: u32) -> bool {
        matches!(self, LinkPointer::Qh { addr, .. } if addr == qh_addr)
    }
}
