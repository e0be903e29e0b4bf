//! Root hub ports (PORTSC registers).

use std::thread;
use std::time::Duration;

use bitflags::bitflags;

use crate::regs::*;
use crate::{Result, UsbError};

bitflags! {
    /// Decoded PORTSC value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortStatus: u16 {
        const CONNECTED = PORTSC_CCS;
        const CONNECT_CHANGE = PORTSC_CSC;
        const ENABLED = PORTSC_PED;
        const ENABLE_CHANGE = PORTSC_PEDC;
        const RESUME_DETECT = PORTSC_RD;
        const LOW_SPEED = PORTSC_LSDA;
        const RESET = PORTSC_PR;
        const SUSPENDED = PORTSC_SUSP;
    }
}

pub struct RootHub {
    regs: UhciRegisters,
    port_count: usize,
    reset_hold: Duration,
    reset_recovery: Duration,
}

impl RootHub {
    pub fn new(
        regs: UhciRegisters,
        port_count: usize,
        reset_hold: Duration,
        reset_recovery: Duration,
    ) -> Self {
        Self {
            regs,
            port_count,
            reset_hold,
            reset_recovery,
        }
    }

    pub fn port_count(&self) -> usize {
        self.port_count
    }

    fn portsc(&self, port: usize) -> Result<u16> {
        if port >= self.port_count {
            return Err(UsbError::InvalidArgument("root hub port out of range"));
        }
        Ok(reg_portsc(port))
    }

    /// Read-modify-write that never acknowledges a change bit by accident.
    fn modify(&self, port: usize, set: u16, clear: u16) -> Result<()> {
        let reg = self.portsc(port)?;
        let cur = self.regs.read_u16(reg);
        self.regs
            .write_u16(reg, (cur & !PORTSC_W1C_MASK & !clear) | set);
        Ok(())
    }

    pub fn port_status(&self, port: usize) -> Result<PortStatus> {
        let reg = self.portsc(port)?;
        Ok(PortStatus::from_bits_truncate(self.regs.read_u16(reg)))
    }

    pub fn is_port_connected(&self, port: usize) -> Result<bool> {
        Ok(self.port_status(port)?.contains(PortStatus::CONNECTED))
    }

    pub fn is_port_low_speed(&self, port: usize) -> Result<bool> {
        Ok(self.port_status(port)?.contains(PortStatus::LOW_SPEED))
    }

    pub fn is_port_enabled(&self, port: usize) -> Result<bool> {
        Ok(self.port_status(port)?.contains(PortStatus::ENABLED))
    }

    pub fn is_connection_status_changed(&self, port: usize) -> Result<bool> {
        Ok(self.port_status(port)?.contains(PortStatus::CONNECT_CHANGE))
    }

    pub fn clear_connection_status_changed(&self, port: usize) -> Result<()> {
        self.modify(port, PORTSC_CSC, 0)
    }

    pub fn set_port_enabled(&self, port: usize, enabled: bool) -> Result<()> {
        if enabled {
            self.modify(port, PORTSC_PED, 0)
        } else {
            self.modify(port, 0, PORTSC_PED)
        }
    }

    /// Drive reset on the port, then enable it. Blocks for the configured hold and recovery
    /// times.
    pub fn reset_port(&self, port: usize) -> Result<()> {
        self.modify(port, PORTSC_PR, 0)?;
        thread::sleep(self.reset_hold);
        self.modify(port, 0, PORTSC_PR)?;
        self.modify(port, PORTSC_PED, 0)?;
        thread::sleep(self.reset_recovery);
        // Acknowledge the enable change we caused ourselves.
        self.modify(port, PORTSC_PEDC, 0)?;
        tracing::debug!(
            port,
            status = ?self.port_status(port)?,
            "UHCI root port reset"
        );
        Ok(())
    }

    pub fn suspend_port(&self, port: usize) -> Result<()> {
        self.modify(port, PORTSC_SUSP, 0)
    }

    pub fn resume_port(&self, port: usize) -> Result<()> {
        self.modify(port, 0, PORTSC_SUSP)
    }
}
