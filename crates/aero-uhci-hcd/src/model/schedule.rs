//! Frame schedule execution for [`super::UhciModel`].
//!
//! Queue heads follow UHCI element semantics: a successful TD advances the QH element pointer to
//! the TD's link, while an error, a NAK or a short packet with SPD set leaves the element where it
//! is so the queue stays blocked until software repairs it. A horizontal link that leads back to
//! an already visited QH (the bandwidth reclamation loop) ends the frame.

use crate::link::{LinkPointer, LINK_PTR_DEPTH_FIRST};
use crate::memory::MemoryBus;
use crate::regs::{USBSTS_HCPROCESSERR, USBSTS_HSE, USBSTS_USBERRINT, USBSTS_USBINT};
use crate::request::SetupPacket;
use crate::td::{PacketId, TdStatus, NULL_LENGTH, TD_CTRL_ACTLEN_MASK};

use super::{ModelPort, UsbHandshake};

/// Upper bound on link pointers followed in one frame.
const MAX_LINKS_PER_FRAME: usize = 4096;

/// Upper bound on TDs executed from one QH element list per frame.
const MAX_QH_ELEMENT_STEPS: usize = 1024;

pub(super) struct FrameContext<'a> {
    pub mem: &'a dyn MemoryBus,
    pub ports: &'a mut [ModelPort],
    pub usbsts: &'a mut u16,
}

pub(super) fn process_frame(ctx: &mut FrameContext<'_>, flbaseadd: u32, frame: u16) {
    let Some(entry) = flbaseadd.checked_add(u32::from(frame) * 4) else {
        *ctx.usbsts |= USBSTS_HSE;
        return;
    };
    let mut link = LinkPointer::decode(ctx.mem.read_u32(entry));
    let mut visited_qhs: Vec<u32> = Vec::new();

    for _ in 0..MAX_LINKS_PER_FRAME {
        link = match link {
            LinkPointer::Terminate => return,
            LinkPointer::Qh { addr, .. } => {
                if addr == 0 || visited_qhs.contains(&addr) {
                    return;
                }
                visited_qhs.push(addr);
                process_qh(ctx, addr);
                LinkPointer::decode(ctx.mem.read_u32(addr))
            }
            LinkPointer::Td { addr, .. } => {
                if addr == 0 {
                    return;
                }
                // TDs hung directly off the frame list are executed once and never advanced.
                let next = LinkPointer::decode(ctx.mem.read_u32(addr));
                execute_td(ctx, addr);
                next
            }
        };
    }

    tracing::warn!(frame, "UHCI model: schedule walk budget exhausted");
    *ctx.usbsts |= USBSTS_HCPROCESSERR;
}

fn process_qh(ctx: &mut FrameContext<'_>, qh_addr: u32) {
    for _ in 0..MAX_QH_ELEMENT_STEPS {
        let LinkPointer::Td { addr: td_addr, .. } = LinkPointer::decode(ctx.mem.read_u32(qh_addr + 4))
        else {
            return;
        };
        if td_addr == 0 {
            return;
        }
        if execute_td(ctx, td_addr) != TdOutcome::Advance {
            return;
        }
        let next = ctx.mem.read_u32(td_addr);
        // Vf is reserved in a QH element pointer.
        ctx.mem.write_u32(qh_addr + 4, next & !LINK_PTR_DEPTH_FIRST);
        if next & LINK_PTR_DEPTH_FIRST == 0 {
            return;
        }
    }
    *ctx.usbsts |= USBSTS_HCPROCESSERR;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TdOutcome {
    /// Not active; nothing was done.
    Idle,
    /// Completed normally; the queue may move on.
    Advance,
    /// NAKed, failed or ended short; the queue stays on this TD.
    Block,
}

fn execute_td(ctx: &mut FrameContext<'_>, td_addr: u32) -> TdOutcome {
    let ctrl = ctx.mem.read_u32(td_addr + 4);
    let token = ctx.mem.read_u32(td_addr + 8);
    let buffer = ctx.mem.read_u32(td_addr + 12);

    if ctrl & TdStatus::ACTIVE.bits() == 0 {
        return TdOutcome::Idle;
    }
    let ctrl = ctrl & !TdStatus::ERRORS.bits();

    let pid = PacketId::from_u8((token & 0xFF) as u8);
    let dev_addr = ((token >> 8) & 0x7F) as u8;
    let endpoint = ((token >> 15) & 0x0F) as u8;
    let max_len = match (token >> 21) & 0x7FF {
        NULL_LENGTH => 0,
        n => n as usize + 1,
    };

    let device = ctx
        .ports
        .iter_mut()
        .filter_map(ModelPort::reachable_device)
        .find(|dev| dev.address() == dev_addr);
    let Some(device) = device else {
        tracing::trace!(dev_addr, td_addr, "UHCI model: no function at address");
        return fail_td(ctx, td_addr, ctrl, TdStatus::CRC_TIMEOUT);
    };

    let (handshake, in_data) = match pid {
        Some(PacketId::Setup) => {
            if max_len != SetupPacket::LEN {
                return fail_td(ctx, td_addr, ctrl, TdStatus::DATA_BUFFER);
            }
            let mut bytes = [0u8; SetupPacket::LEN];
            ctx.mem.read_physical(buffer, &mut bytes);
            (device.handle_setup(SetupPacket::from_bytes(bytes)), None)
        }
        Some(PacketId::Out) => {
            let mut data = vec![0u8; max_len];
            ctx.mem.read_physical(buffer, &mut data);
            (device.handle_out(endpoint, &data), None)
        }
        Some(PacketId::In) => {
            let mut data = vec![0u8; max_len];
            let hs = device.handle_in(endpoint, &mut data);
            (hs, Some(data))
        }
        None => return fail_td(ctx, td_addr, ctrl, TdStatus::STALLED),
    };

    match handshake {
        UsbHandshake::Ack { bytes } => {
            let bytes = bytes.min(max_len);
            if let Some(data) = in_data {
                ctx.mem.write_physical(buffer, &data[..bytes]);
            }
            retire(ctx.mem, td_addr, ctrl, bytes);
            if ctrl & TdStatus::IOC.bits() != 0 {
                *ctx.usbsts |= USBSTS_USBINT;
            }
            let short = pid == Some(PacketId::In)
                && bytes < max_len
                && ctrl & TdStatus::SHORT_PACKET_DETECT.bits() != 0;
            if short {
                *ctx.usbsts |= USBSTS_USBINT;
                TdOutcome::Block
            } else {
                TdOutcome::Advance
            }
        }
        UsbHandshake::Nak => {
            ctx.mem
                .write_u32(td_addr + 4, ctrl | TdStatus::NAK.bits());
            TdOutcome::Block
        }
        UsbHandshake::Stall => fail_td(ctx, td_addr, ctrl, TdStatus::STALLED),
        UsbHandshake::Timeout => fail_td(ctx, td_addr, ctrl, TdStatus::CRC_TIMEOUT),
    }
}

fn fail_td(ctx: &mut FrameContext<'_>, td_addr: u32, ctrl: u32, error: TdStatus) -> TdOutcome {
    retire(ctx.mem, td_addr, ctrl | error.bits(), 0);
    *ctx.usbsts |= USBSTS_USBERRINT;
    if ctrl & TdStatus::IOC.bits() != 0 {
        *ctx.usbsts |= USBSTS_USBINT;
    }
    TdOutcome::Block
}

fn retire(mem: &dyn MemoryBus, td_addr: u32, ctrl: u32, bytes: usize) {
    let actlen = if bytes == 0 {
        NULL_LENGTH
    } else {
        (bytes as u32 - 1) & TD_CTRL_ACTLEN_MASK
    };
    let ctrl = (ctrl & !(TdStatus::ACTIVE.bits() | TD_CTRL_ACTLEN_MASK)) | actlen;
    mem.write_u32(td_addr + 4, ctrl);
}
