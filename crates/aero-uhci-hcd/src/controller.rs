//! Host controller bring-up and interrupt entry point.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::ControllerConfig;
use crate::pipe::{DeviceInfo, EndpointInfo, Pipe};
use crate::pipe_manager::PipeManager;
use crate::regs::*;
use crate::resources::ResourceManager;
use crate::root_hub::RootHub;
use crate::schedule::Schedule;
use crate::{Result, UsbError};

const REGISTER_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A running UHCI host controller.
///
/// Construction performs the whole init sequence (resource claims, legacy handoff, global and
/// host controller reset, schedule install, run). Dropping the controller stops it.
pub struct UhciController {
    config: ControllerConfig,
    regs: UhciRegisters,
    schedule: Arc<Schedule>,
    pipes: Arc<PipeManager>,
    root_hub: RootHub,
}

impl UhciController {
    pub fn new(resources: Arc<dyn ResourceManager>, config: ControllerConfig) -> Result<Self> {
        config.validate()?;

        let io = resources.claim_io_ports(config.io_base, config.io_len)?;
        resources.claim_irq(config.irq_line)?;
        if config.legacy_support {
            resources.write_pci_config_u16(PCI_LEGSUP, PCI_LEGSUP_PIRQ_ONLY)?;
        }
        let regs = UhciRegisters::new(io, config.io_base);

        let schedule = Arc::new(Schedule::new(&*resources)?);

        regs.write_u16(REG_USBCMD, USBCMD_GRESET);
        thread::sleep(config.global_reset_hold());
        regs.write_u16(REG_USBCMD, 0);

        regs.write_u16(REG_USBCMD, USBCMD_HCRESET);
        if !poll_until(config.host_reset_timeout(), || {
            regs.read_u16(REG_USBCMD) & USBCMD_HCRESET == 0
        }) {
            tracing::error!(
                io_base = format_args!("{:#x}", config.io_base),
                "UHCI host controller reset did not complete"
            );
            return Err(UsbError::ControllerHalted);
        }

        regs.write_u32(REG_FRBASEADD, schedule.frame_list().physical_address());
        regs.write_u16(REG_FRNUM, 0);
        regs.write_u8(REG_SOFMOD, SOFMOD_DEFAULT);
        regs.write_u16(REG_USBSTS, USBSTS_W1C_MASK);
        regs.write_u16(REG_USBINTR, USBINTR_ALL);
        regs.write_u16(REG_USBCMD, USBCMD_RS | USBCMD_CF | USBCMD_MAXP);

        let pipes = PipeManager::new(
            resources.clone(),
            schedule.clone(),
            config.default_max_packet_size,
        );
        let root_hub = RootHub::new(
            regs.clone(),
            config.port_count,
            config.port_reset_hold(),
            config.port_reset_recovery(),
        );

        tracing::debug!(
            io_base = format_args!("{:#x}", config.io_base),
            irq = config.irq_line,
            ports = config.port_count,
            frame_list = format_args!("{:#x}", schedule.frame_list().physical_address()),
            "UHCI controller running"
        );

        Ok(Self {
            config,
            regs,
            schedule,
            pipes,
            root_hub,
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn schedule(&self) -> &Arc<Schedule> {
        &self.schedule
    }

    pub fn pipe_manager(&self) -> &Arc<PipeManager> {
        &self.pipes
    }

    pub fn root_hub(&self) -> &RootHub {
        &self.root_hub
    }

    pub fn create_pipe(&self, device: DeviceInfo, endpoint: EndpointInfo) -> Result<Arc<Pipe>> {
        self.pipes.create_pipe(device, endpoint)
    }

    /// Endpoint 0 of `device`, sized with the configured default max packet size.
    pub fn default_control_pipe(&self, device: DeviceInfo) -> Result<Arc<Pipe>> {
        self.pipes
            .create_pipe(device, EndpointInfo::default_control(0))
    }

    pub fn frame_number(&self) -> u16 {
        self.regs.read_u16(REG_FRNUM) & FRNUM_MASK
    }

    pub fn is_running(&self) -> bool {
        self.regs.read_u16(REG_USBCMD) & USBCMD_RS != 0
            && self.regs.read_u16(REG_USBSTS) & USBSTS_HCHALTED == 0
    }

    /// Interrupt handler. Returns `false` if the interrupt was not raised by this controller.
    pub fn handle_interrupt(&self) -> bool {
        let status = self.regs.read_u16(REG_USBSTS) & USBSTS_W1C_MASK;
        if status == 0 {
            return false;
        }
        self.regs.write_u16(REG_USBSTS, status);

        if status & USBSTS_HSE != 0 {
            tracing::error!(status, "UHCI host system error");
        }
        if status & USBSTS_HCPROCESSERR != 0 {
            tracing::error!(status, "UHCI host controller process error");
        }
        if status & USBSTS_RESUMEDETECT != 0 {
            tracing::debug!("UHCI resume detected");
        }

        self.pipes.handle_interrupt();
        true
    }

    /// Clear Run/Stop and wait for the controller to report halted.
    pub fn stop(&self) -> Result<()> {
        let cmd = self.regs.read_u16(REG_USBCMD);
        self.regs.write_u16(REG_USBCMD, cmd & !USBCMD_RS);
        if poll_until(self.config.host_reset_timeout(), || {
            self.regs.read_u16(REG_USBSTS) & USBSTS_HCHALTED != 0
        }) {
            Ok(())
        } else {
            Err(UsbError::Timeout)
        }
    }
}

impl Drop for UhciController {
    fn drop(&mut self) {
        let cmd = self.regs.read_u16(REG_USBCMD);
        self.regs.write_u16(REG_USBCMD, cmd & !USBCMD_RS);
    }
}

fn poll_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(REGISTER_POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SimPlatform;
    use crate::resources::PortIo;

    fn config() -> ControllerConfig {
        ControllerConfig {
            io_base: 0xC000,
            irq_line: 11,
            global_reset_hold_ms: 0,
            port_reset_hold_ms: 0,
            port_reset_recovery_ms: 0,
            ..ControllerConfig::default()
        }
    }

    #[test]
    fn init_programs_the_register_block() {
        let platform = Arc::new(SimPlatform::new());
        let hc = UhciController::new(platform.clone(), config()).unwrap();

        let regs = platform.model().registers();
        assert_eq!(regs.usbcmd, USBCMD_RS | USBCMD_CF | USBCMD_MAXP);
        assert_eq!(regs.usbintr, USBINTR_ALL);
        assert_eq!(regs.sofmod, SOFMOD_DEFAULT);
        assert_eq!(regs.frbaseadd, hc.schedule().frame_list().physical_address());
        assert_eq!(regs.usbsts & USBSTS_HCHALTED, 0);
        assert!(hc.is_running());

        assert_eq!(platform.pci_config_u16(PCI_LEGSUP), Some(PCI_LEGSUP_PIRQ_ONLY));
        assert_eq!(platform.claimed_irqs(), vec![11]);
    }

    #[test]
    fn legacy_handoff_is_optional() {
        let platform = Arc::new(SimPlatform::new());
        let cfg = ControllerConfig {
            legacy_support: false,
            ..config()
        };
        let _hc = UhciController::new(platform.clone(), cfg).unwrap();
        assert_eq!(platform.pci_config_u16(PCI_LEGSUP), None);
    }

    #[test]
    fn invalid_config_claims_nothing() {
        let platform = Arc::new(SimPlatform::new());
        let cfg = ControllerConfig {
            port_count: 0,
            ..config()
        };
        assert!(matches!(
            UhciController::new(platform.clone(), cfg),
            Err(UsbError::InvalidConfig(_))
        ));
        assert!(platform.claimed_irqs().is_empty());
    }

    #[test]
    fn frames_advance_and_stop_halts() {
        let platform = Arc::new(SimPlatform::new());
        let hc = UhciController::new(platform.clone(), config()).unwrap();
        platform.model().run_frames(5);
        assert_eq!(hc.frame_number(), 5);

        hc.stop().unwrap();
        assert!(!hc.is_running());
        platform.model().run_frames(3);
        assert_eq!(hc.frame_number(), 5);
    }

    #[test]
    fn handle_interrupt_acknowledges_status() {
        let platform = Arc::new(SimPlatform::new());
        let hc = UhciController::new(platform.clone(), config()).unwrap();
        assert!(!hc.handle_interrupt());

        platform.model().raise_status(USBSTS_HSE | USBSTS_USBINT);
        assert!(platform.model().irq_asserted());
        assert!(hc.handle_interrupt());
        assert_eq!(platform.model().registers().usbsts & USBSTS_W1C_MASK, 0);
        assert!(!platform.model().irq_asserted());
    }

    #[test]
    fn drop_clears_run_stop() {
        let platform = Arc::new(SimPlatform::new());
        let hc = UhciController::new(platform.clone(), config()).unwrap();
        drop(hc);
        let cmd = platform.model().read(0xC000 + REG_USBCMD, 2) as u16;
        assert_eq!(cmd & USBCMD_RS, 0);
    }
}
