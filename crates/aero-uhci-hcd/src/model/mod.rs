//! A software UHCI controller.
//!
//! `UhciModel` implements the register block over [`PortIo`] and executes the frame schedule out
//! of DMA memory one frame per [`UhciModel::step_frame`] call. It is not a full UHCI
//! implementation (no bandwidth accounting or error-counter retries), but it
//! follows the hardware rules the driver depends on: Active/IOC/SPD handling, QH element advance
//! on success, queue blocking on errors and the Q/T/Vf link bits.
//!
//! `SimPlatform` ties a [`DmaPool`] and a model together as a [`ResourceManager`].

mod schedule;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::memory::{DmaPool, DmaRegion, MemoryBus};
use crate::regs::*;
use crate::request::SetupPacket;
use crate::resources::{PortIo, ResourceManager};
use crate::{Result, UsbError};

/// Handshake returned by a function for one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbHandshake {
    /// Transaction accepted; `bytes` is the payload size moved.
    Ack { bytes: usize },
    Nak,
    Stall,
    /// No response (CRC/timeout error on the bus).
    Timeout,
}

/// A USB device function attached to a model root port.
pub trait UsbFunction: Send {
    /// Address the function currently answers on.
    fn address(&self) -> u8;

    fn is_low_speed(&self) -> bool {
        false
    }

    /// Bus reset from the root port.
    fn reset(&mut self) {}

    fn handle_setup(&mut self, setup: SetupPacket) -> UsbHandshake;

    fn handle_out(&mut self, endpoint: u8, data: &[u8]) -> UsbHandshake;

    /// Fill `buf` (sized to the TD's max length) and report how much was written.
    fn handle_in(&mut self, endpoint: u8, buf: &mut [u8]) -> UsbHandshake;
}

/// Snapshot of the model's register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelRegisters {
    pub usbcmd: u16,
    pub usbsts: u16,
    pub usbintr: u16,
    pub frnum: u16,
    pub frbaseadd: u32,
    pub sofmod: u8,
}

impl ModelRegisters {
    fn power_on() -> Self {
        Self {
            usbcmd: USBCMD_MAXP,
            usbsts: USBSTS_HCHALTED,
            usbintr: 0,
            frnum: 0,
            frbaseadd: 0,
            sofmod: SOFMOD_DEFAULT,
        }
    }

    fn running(&self) -> bool {
        self.usbcmd & USBCMD_RS != 0
    }

    fn irq_pending(&self) -> bool {
        let sts = self.usbsts;
        let intr = self.usbintr;
        (sts & USBSTS_USBINT != 0 && intr & (USBINTR_IOC | USBINTR_SHORT_PACKET) != 0)
            || (sts & USBSTS_USBERRINT != 0 && intr & USBINTR_TIMEOUT_CRC != 0)
            || (sts & USBSTS_RESUMEDETECT != 0 && intr & USBINTR_RESUME != 0)
            || sts & (USBSTS_HSE | USBSTS_HCPROCESSERR) != 0
    }
}

/// Bits of PORTSC stored by the port; CCS and LSDA are derived from the attached function.
const PORTSC_STORED_MASK: u16 = PORTSC_CSC | PORTSC_PED | PORTSC_PEDC | PORTSC_RD | PORTSC_PR | PORTSC_SUSP;

#[derive(Default)]
pub(crate) struct ModelPort {
    reg: u16,
    device: Option<Box<dyn UsbFunction>>,
}

impl ModelPort {
    fn value(&self) -> u16 {
        let mut v = self.reg & PORTSC_STORED_MASK;
        if let Some(dev) = self.device.as_ref() {
            v |= PORTSC_CCS;
            if dev.is_low_speed() {
                v |= PORTSC_LSDA;
            }
        }
        v
    }

    /// The function on this port if it can currently see bus traffic.
    pub(crate) fn reachable_device(&mut self) -> Option<&mut (dyn UsbFunction + 'static)> {
        if self.reg & PORTSC_PED == 0 || self.reg & (PORTSC_PR | PORTSC_SUSP) != 0 {
            return None;
        }
        self.device.as_deref_mut()
    }
}

struct ModelState {
    io_base: u16,
    regs: ModelRegisters,
    ports: Vec<ModelPort>,
}

pub struct UhciModel {
    mem: Arc<dyn MemoryBus>,
    state: Mutex<ModelState>,
}

impl UhciModel {
    pub fn new(mem: Arc<dyn MemoryBus>, port_count: usize) -> Self {
        Self {
            mem,
            state: Mutex::new(ModelState {
                io_base: 0,
                regs: ModelRegisters::power_on(),
                ports: (0..port_count).map(|_| ModelPort::default()).collect(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ModelState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn set_io_base(&self, io_base: u16) {
        self.lock().io_base = io_base;
    }

    pub fn registers(&self) -> ModelRegisters {
        self.lock().regs
    }

    pub fn irq_asserted(&self) -> bool {
        self.lock().regs.irq_pending()
    }

    /// Plug a function into a root port. Sets the connect status change bit.
    pub fn attach(&self, port: usize, device: Box<dyn UsbFunction>) {
        let mut state = self.lock();
        if let Some(p) = state.ports.get_mut(port) {
            p.device = Some(device);
            p.reg |= PORTSC_CSC;
        }
    }

    /// Unplug whatever is on `port`. The port is disabled.
    pub fn detach(&self, port: usize) -> Option<Box<dyn UsbFunction>> {
        let mut state = self.lock();
        let p = state.ports.get_mut(port)?;
        let device = p.device.take();
        if device.is_some() {
            p.reg |= PORTSC_CSC;
            if p.reg & PORTSC_PED != 0 {
                p.reg = (p.reg & !PORTSC_PED) | PORTSC_PEDC;
            }
        }
        device
    }

    /// Latch status bits as if the hardware had raised them (HSE, resume detect, ...).
    pub fn raise_status(&self, bits: u16) {
        self.lock().regs.usbsts |= bits & USBSTS_W1C_MASK;
    }

    /// Run one 1ms frame. Returns the interrupt line level afterwards.
    pub fn step_frame(&self) -> bool {
        let mut state = self.lock();
        let state = &mut *state;
        if !state.regs.running() || state.regs.frbaseadd == 0 {
            state.regs.usbsts |= USBSTS_HCHALTED;
            return state.regs.irq_pending();
        }

        let frame = state.regs.frnum & 0x03FF;
        let mut ctx = schedule::FrameContext {
            mem: &*self.mem,
            ports: &mut state.ports,
            usbsts: &mut state.regs.usbsts,
        };
        schedule::process_frame(&mut ctx, state.regs.frbaseadd, frame);

        state.regs.frnum = state.regs.frnum.wrapping_add(1) & FRNUM_MASK;
        state.regs.irq_pending()
    }

    /// Run `frames` frames; returns whether the interrupt line was raised in any of them.
    pub fn run_frames(&self, frames: usize) -> bool {
        (0..frames).fold(false, |irq, _| self.step_frame() | irq)
    }

    fn write_usbcmd(state: &mut ModelState, value: u16) {
        if value & USBCMD_GRESET != 0 {
            // Global reset: everything downstream sees a bus reset too.
            state.regs = ModelRegisters::power_on();
            state.regs.usbcmd |= USBCMD_GRESET;
            for port in &mut state.ports {
                port.reg &= PORTSC_CSC;
                if let Some(dev) = port.device.as_mut() {
                    dev.reset();
                }
            }
            return;
        }
        if value & USBCMD_HCRESET != 0 {
            // Self-clearing; the register reads back with HCRESET already low.
            state.regs = ModelRegisters::power_on();
            return;
        }
        state.regs.usbcmd = value
            & (USBCMD_RS
                | USBCMD_EGSM
                | USBCMD_FGR
                | USBCMD_SWDBG
                | USBCMD_CF
                | USBCMD_MAXP);
        if state.regs.running() {
            state.regs.usbsts &= !USBSTS_HCHALTED;
        } else {
            state.regs.usbsts |= USBSTS_HCHALTED;
        }
    }

    fn write_portsc(port: &mut ModelPort, value: u16) {
        port.reg &= !(value & PORTSC_W1C_MASK);

        if value & PORTSC_PR != 0 {
            if port.reg & PORTSC_PR == 0 {
                port.reg = (port.reg | PORTSC_PR) & !PORTSC_PED;
                if let Some(dev) = port.device.as_mut() {
                    dev.reset();
                }
            }
            return;
        }
        port.reg &= !PORTSC_PR;

        if value & PORTSC_PED != 0 && port.device.is_some() {
            port.reg |= PORTSC_PED;
        } else {
            port.reg &= !PORTSC_PED;
        }
        if value & PORTSC_SUSP != 0 {
            port.reg |= PORTSC_SUSP;
        } else {
            port.reg &= !PORTSC_SUSP;
        }
    }
}

impl PortIo for UhciModel {
    fn read(&self, port: u16, size: u8) -> u32 {
        let state = self.lock();
        let Some(offset) = port.checked_sub(state.io_base) else {
            return 0xFFFF_FFFF;
        };
        let value = match offset {
            REG_USBCMD => u32::from(state.regs.usbcmd),
            REG_USBSTS => u32::from(state.regs.usbsts),
            REG_USBINTR => u32::from(state.regs.usbintr),
            REG_FRNUM => u32::from(state.regs.frnum & FRNUM_MASK),
            REG_FRBASEADD => state.regs.frbaseadd,
            REG_SOFMOD => u32::from(state.regs.sofmod),
            off if off >= REG_PORTSC1 && off % 2 == 0 => {
                let idx = usize::from((off - REG_PORTSC1) / 2);
                match state.ports.get(idx) {
                    Some(p) => u32::from(p.value()),
                    None => 0xFFFF_FFFF,
                }
            }
            _ => 0xFFFF_FFFF,
        };
        match size {
            1 => value & 0xFF,
            2 => value & 0xFFFF,
            4 => value,
            _ => 0xFFFF_FFFF,
        }
    }

    fn write(&self, port: u16, size: u8, value: u32) {
        let mut state = self.lock();
        let state = &mut *state;
        let Some(offset) = port.checked_sub(state.io_base) else {
            return;
        };
        let value16 = (value & 0xFFFF) as u16;
        match (offset, size) {
            (REG_USBCMD, 2) => Self::write_usbcmd(state, value16),
            (REG_USBSTS, 2) => state.regs.usbsts &= !(value16 & USBSTS_W1C_MASK),
            (REG_USBINTR, 2) => state.regs.usbintr = value16 & USBINTR_ALL,
            (REG_FRNUM, 2) => state.regs.frnum = value16 & FRNUM_MASK,
            (REG_FRBASEADD, 4) => state.regs.frbaseadd = value & FRBASEADD_MASK,
            (REG_SOFMOD, 1) => state.regs.sofmod = (value & 0x7F) as u8,
            (off, 2) if off >= REG_PORTSC1 && off % 2 == 0 => {
                let idx = usize::from((off - REG_PORTSC1) / 2);
                if let Some(p) = state.ports.get_mut(idx) {
                    Self::write_portsc(p, value16);
                }
            }
            _ => {}
        }
    }
}

pub const SIM_DMA_BASE: u32 = 0x0010_0000;
pub const SIM_DMA_SIZE: usize = 2 * 1024 * 1024;

/// Resource manager backed by a [`DmaPool`] and a [`UhciModel`].
pub struct SimPlatform {
    pool: Arc<DmaPool>,
    model: Arc<UhciModel>,
    io_window: Mutex<Option<(u16, u16)>>,
    irqs: Mutex<Vec<u8>>,
    pci_config: Mutex<HashMap<u16, u16>>,
}

impl SimPlatform {
    pub fn new() -> Self {
        Self::with_layout(SIM_DMA_BASE, SIM_DMA_SIZE, 2)
    }

    pub fn with_memory(base: u32, size: usize) -> Self {
        Self::with_layout(base, size, 2)
    }

    pub fn with_layout(base: u32, size: usize, port_count: usize) -> Self {
        let pool = DmaPool::new(base, size);
        let model = Arc::new(UhciModel::new(pool.clone(), port_count));
        Self {
            pool,
            model,
            io_window: Mutex::new(None),
            irqs: Mutex::new(Vec::new()),
            pci_config: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &Arc<DmaPool> {
        &self.pool
    }

    pub fn model(&self) -> &Arc<UhciModel> {
        &self.model
    }

    pub fn pci_config_u16(&self, offset: u16) -> Option<u16> {
        self.pci_config
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .get(&offset)
            .copied()
    }

    pub fn claimed_irqs(&self) -> Vec<u8> {
        self.irqs
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceManager for SimPlatform {
    fn allocate_dma(&self, size: usize, align: usize) -> Result<DmaRegion> {
        self.pool.allocate(size, align)
    }

    fn claim_io_ports(&self, base: u16, len: u16) -> Result<Arc<dyn PortIo>> {
        let mut window = self
            .io_window
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if let Some((b, l)) = *window {
            return Err(UsbError::ResourceClaim(format!(
                "I/O ports {b:#x}+{l:#x} already claimed"
            )));
        }
        *window = Some((base, len));
        self.model.set_io_base(base);
        Ok(self.model.clone())
    }

    fn claim_irq(&self, line: u8) -> Result<()> {
        let mut irqs = self.irqs.lock().unwrap_or_else(|poison| poison.into_inner());
        if irqs.contains(&line) {
            return Err(UsbError::ResourceClaim(format!("IRQ {line} already claimed")));
        }
        irqs.push(line);
        Ok(())
    }

    fn write_pci_config_u16(&self, offset: u16, value: u16) -> Result<()> {
        self.pci_config
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .insert(offset, value);
        Ok(())
    }
}
