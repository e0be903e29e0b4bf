//! UHCI I/O register block (UHCI 1.1, section 2.1).

use std::sync::Arc;

use crate::resources::PortIo;

pub const REG_USBCMD: u16 = 0x00;
pub const REG_USBSTS: u16 = 0x02;
pub const REG_USBINTR: u16 = 0x04;
pub const REG_FRNUM: u16 = 0x06;
pub const REG_FRBASEADD: u16 = 0x08;
pub const REG_SOFMOD: u16 = 0x0C;
pub const REG_PORTSC1: u16 = 0x10;
pub const REG_PORTSC2: u16 = 0x12;

/// Size of the register block without port registers.
pub const REG_BLOCK_BASE_LEN: u16 = 0x10;

pub const fn reg_portsc(port: usize) -> u16 {
    REG_PORTSC1 + 2 * port as u16
}

// Section 2.1.1 "USB Command (USBCMD)".
pub const USBCMD_RS: u16 = 1 << 0;
pub const USBCMD_HCRESET: u16 = 1 << 1;
pub const USBCMD_GRESET: u16 = 1 << 2;
pub const USBCMD_EGSM: u16 = 1 << 3;
pub const USBCMD_FGR: u16 = 1 << 4;
pub const USBCMD_SWDBG: u16 = 1 << 5;
pub const USBCMD_CF: u16 = 1 << 6;
pub const USBCMD_MAXP: u16 = 1 << 7;

// Section 2.1.2 "USB Status (USBSTS)".
pub const USBSTS_USBINT: u16 = 1 << 0;
pub const USBSTS_USBERRINT: u16 = 1 << 1;
pub const USBSTS_RESUMEDETECT: u16 = 1 << 2;
pub const USBSTS_HSE: u16 = 1 << 3;
pub const USBSTS_HCPROCESSERR: u16 = 1 << 4;
pub const USBSTS_HCHALTED: u16 = 1 << 5;

/// Bits which are write-1-to-clear in [`REG_USBSTS`].
pub const USBSTS_W1C_MASK: u16 = USBSTS_USBINT
    | USBSTS_USBERRINT
    | USBSTS_RESUMEDETECT
    | USBSTS_HSE
    | USBSTS_HCPROCESSERR;

// Section 2.1.3 "USB Interrupt Enable (USBINTR)".
pub const USBINTR_TIMEOUT_CRC: u16 = 1 << 0;
pub const USBINTR_RESUME: u16 = 1 << 1;
pub const USBINTR_IOC: u16 = 1 << 2;
pub const USBINTR_SHORT_PACKET: u16 = 1 << 3;
pub const USBINTR_ALL: u16 =
    USBINTR_TIMEOUT_CRC | USBINTR_RESUME | USBINTR_IOC | USBINTR_SHORT_PACKET;

pub const FRNUM_MASK: u16 = 0x07FF;
pub const FRBASEADD_MASK: u32 = 0xFFFF_F000;
pub const SOFMOD_DEFAULT: u8 = 64;

// Section 2.1.7 "Port Status and Control (PORTSC)".
pub const PORTSC_CCS: u16 = 1 << 0;
pub const PORTSC_CSC: u16 = 1 << 1;
pub const PORTSC_PED: u16 = 1 << 2;
pub const PORTSC_PEDC: u16 = 1 << 3;
pub const PORTSC_LS_MASK: u16 = 0b11 << 4;
pub const PORTSC_RD: u16 = 1 << 6;
pub const PORTSC_LSDA: u16 = 1 << 8;
pub const PORTSC_PR: u16 = 1 << 9;
pub const PORTSC_SUSP: u16 = 1 << 12;

/// PORTSC change bits; writing them back as 1 clears them.
pub const PORTSC_W1C_MASK: u16 = PORTSC_CSC | PORTSC_PEDC;

/// Legacy support register in PCI configuration space (section 5.2.1).
pub const PCI_LEGSUP: u16 = 0xC0;
/// PIRQ enable only; turns off SMI-based keyboard/mouse emulation.
pub const PCI_LEGSUP_PIRQ_ONLY: u16 = 0x2000;

/// Register accessor over a claimed I/O window.
#[derive(Clone)]
pub struct UhciRegisters {
    io: Arc<dyn PortIo>,
    base: u16,
}

impl UhciRegisters {
    pub fn new(io: Arc<dyn PortIo>, base: u16) -> Self {
        Self { io, base }
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    pub fn read_u8(&self, reg: u16) -> u8 {
        self.io.read(self.base + reg, 1) as u8
    }

    pub fn read_u16(&self, reg: u16) -> u16 {
        self.io.read(self.base + reg, 2) as u16
    }

    pub fn read_u32(&self, reg: u16) -> u32 {
        self.io.read(self.base + reg, 4)
    }

    pub fn write_u8(&self, reg: u16, value: u8) {
        self.io.write(self.base + reg, 1, u32::from(value));
    }

    pub fn write_u16(&self, reg: u16, value: u16) {
        self.io.write(self.base + reg, 2, u32::from(value));
    }

    pub fn write_u32(&self, reg: u16, value: u32) {
        self.io.write(self.base + reg, 4, value);
    }
}
