use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::regs::REG_BLOCK_BASE_LEN;
use crate::{Result, UsbError};

/// UHCI allows up to 7 root ports in the register window (PORTSC at 0x10..0x1E).
pub const MAX_ROOT_PORTS: usize = 7;

/// Controller bring-up parameters.
///
/// Missing fields take their defaults, so a minimal config only needs `io_base` and `irq_line`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// First I/O port of the register block (PCI BAR4).
    pub io_base: u16,
    pub io_len: u16,
    pub irq_line: u8,
    pub port_count: usize,
    /// Write PIRQ-only to the PCI legacy support register during init.
    pub legacy_support: bool,
    pub global_reset_hold_ms: u64,
    pub host_reset_timeout_ms: u64,
    pub port_reset_hold_ms: u64,
    pub port_reset_recovery_ms: u64,
    /// EP0 max packet size used before the device descriptor has been read.
    pub default_max_packet_size: u16,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            io_base: 0,
            io_len: 0x20,
            irq_line: 0,
            port_count: 2,
            legacy_support: true,
            global_reset_hold_ms: 50,
            host_reset_timeout_ms: 10,
            port_reset_hold_ms: 50,
            port_reset_recovery_ms: 10,
            default_max_packet_size: 8,
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.port_count == 0 {
            return Err(UsbError::InvalidConfig("at least one root port is required"));
        }
        if self.port_count > MAX_ROOT_PORTS {
            return Err(UsbError::InvalidConfig("too many root ports"));
        }
        let needed = usize::from(REG_BLOCK_BASE_LEN) + 2 * self.port_count;
        if usize::from(self.io_len) < needed {
            return Err(UsbError::InvalidConfig(
                "I/O window does not cover the port registers",
            ));
        }
        if u32::from(self.io_base) + u32::from(self.io_len) > 0x1_0000 {
            return Err(UsbError::InvalidConfig("I/O window exceeds the port space"));
        }
        if !(8..=64).contains(&self.default_max_packet_size) {
            return Err(UsbError::InvalidConfig(
                "default max packet size must be within 8..=64",
            ));
        }
        Ok(())
    }

    pub fn global_reset_hold(&self) -> Duration {
        Duration::from_millis(self.global_reset_hold_ms)
    }

    pub fn host_reset_timeout(&self) -> Duration {
        Duration::from_millis(self.host_reset_timeout_ms)
    }

    pub fn port_reset_hold(&self) -> Duration {
        Duration::from_millis(self.port_reset_hold_ms)
    }

    pub fn port_reset_recovery(&self) -> Duration {
        Duration::from_millis(self.port_reset_recovery_ms)
    }
}
