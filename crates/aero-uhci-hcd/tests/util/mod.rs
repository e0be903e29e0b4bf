#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use aero_uhci_hcd::model::{SimPlatform, UsbFunction, UsbHandshake};
use aero_uhci_hcd::{
    ControllerConfig, DeviceInfo, EndpointInfo, Pipe, PipeListener, Request, SetupPacket,
    UhciController,
};

pub const IO_BASE: u16 = 0xC000;
pub const IRQ_LINE: u8 = 11;

/// Endpoint numbers served by [`TestDevice`].
pub const EP_BULK_IN: u8 = 1;
pub const EP_BULK_OUT: u8 = 2;
pub const EP_INTERRUPT_IN: u8 = 3;

pub const REQ_SET_ADDRESS: u8 = 0x05;
pub const REQ_GET_DESCRIPTOR: u8 = 0x06;

pub const DEVICE_DESCRIPTOR: [u8; 18] = [
    18, 0x01, 0x10, 0x01, 0x00, 0x00, 0x00, 8, 0x34, 0x12, 0x78, 0x56, 0x00, 0x01, 0, 0, 0, 1,
];

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Controller config with every bring-up delay shortened to nothing.
pub fn fast_config() -> ControllerConfig {
    ControllerConfig {
        io_base: IO_BASE,
        irq_line: IRQ_LINE,
        global_reset_hold_ms: 0,
        port_reset_hold_ms: 0,
        port_reset_recovery_ms: 0,
        ..ControllerConfig::default()
    }
}

pub fn get_descriptor(length: u16) -> SetupPacket {
    SetupPacket {
        bm_request_type: 0x80,
        b_request: REQ_GET_DESCRIPTOR,
        w_value: 0x0100,
        w_index: 0,
        w_length: length,
    }
}

pub fn set_address(address: u8) -> SetupPacket {
    SetupPacket {
        bm_request_type: 0x00,
        b_request: REQ_SET_ADDRESS,
        w_value: u16::from(address),
        w_index: 0,
        w_length: 0,
    }
}

/// Observable state of a [`TestDevice`].
#[derive(Default)]
pub struct DeviceState {
    pub address: u8,
    pending_address: Option<u8>,
    pub low_speed: bool,
    pub resets: usize,
    pub setups: Vec<SetupPacket>,
    control_in: VecDeque<u8>,
    pub bulk_in: VecDeque<u8>,
    pub bulk_out: Vec<u8>,
    pub reports: VecDeque<Vec<u8>>,
    pub stalled_endpoint: Option<u8>,
}

/// A small device: EP0 answers GET_DESCRIPTOR and SET_ADDRESS, EP1 is bulk IN, EP2 bulk OUT and
/// EP3 interrupt IN. IN endpoints NAK while they have nothing queued.
pub struct TestDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl TestDevice {
    pub fn new(low_speed: bool) -> (Self, DeviceHandle) {
        let state = Arc::new(Mutex::new(DeviceState {
            low_speed,
            ..DeviceState::default()
        }));
        (
            Self {
                state: state.clone(),
            },
            DeviceHandle(state),
        )
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap()
    }
}

#[derive(Clone)]
pub struct DeviceHandle(Arc<Mutex<DeviceState>>);

impl DeviceHandle {
    pub fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.0.lock().unwrap()
    }
}

fn drain_into(src: &mut VecDeque<u8>, buf: &mut [u8]) -> usize {
    let n = src.len().min(buf.len());
    for (dst, byte) in buf.iter_mut().zip(src.drain(..n)) {
        *dst = byte;
    }
    n
}

impl UsbFunction for TestDevice {
    fn address(&self) -> u8 {
        self.lock().address
    }

    fn is_low_speed(&self) -> bool {
        self.lock().low_speed
    }

    fn reset(&mut self) {
        let mut s = self.lock();
        s.address = 0;
        s.pending_address = None;
        s.control_in.clear();
        s.resets += 1;
    }

    fn handle_setup(&mut self, setup: SetupPacket) -> UsbHandshake {
        let mut s = self.lock();
        s.setups.push(setup);
        if s.stalled_endpoint == Some(0) {
            return UsbHandshake::Stall;
        }
        s.control_in.clear();
        match setup.b_request {
            REQ_GET_DESCRIPTOR => {
                let n = usize::from(setup.w_length).min(DEVICE_DESCRIPTOR.len());
                s.control_in.extend(&DEVICE_DESCRIPTOR[..n]);
            }
            REQ_SET_ADDRESS => s.pending_address = Some(setup.w_value as u8),
            _ => {}
        }
        UsbHandshake::Ack { bytes: 8 }
    }

    fn handle_out(&mut self, endpoint: u8, data: &[u8]) -> UsbHandshake {
        let mut s = self.lock();
        if s.stalled_endpoint == Some(endpoint) {
            return UsbHandshake::Stall;
        }
        match endpoint {
            0 => {}
            EP_BULK_OUT => s.bulk_out.extend_from_slice(data),
            _ => return UsbHandshake::Stall,
        }
        UsbHandshake::Ack { bytes: data.len() }
    }

    fn handle_in(&mut self, endpoint: u8, buf: &mut [u8]) -> UsbHandshake {
        let mut s = self.lock();
        if s.stalled_endpoint == Some(endpoint) {
            return UsbHandshake::Stall;
        }
        match endpoint {
            0 => {
                if s.control_in.is_empty() {
                    // Status stage of a no-data or OUT request.
                    if let Some(addr) = s.pending_address.take() {
                        s.address = addr;
                    }
                    return UsbHandshake::Ack { bytes: 0 };
                }
                let n = drain_into(&mut s.control_in, buf);
                UsbHandshake::Ack { bytes: n }
            }
            EP_BULK_IN => {
                if s.bulk_in.is_empty() {
                    return UsbHandshake::Nak;
                }
                let n = drain_into(&mut s.bulk_in, buf);
                UsbHandshake::Ack { bytes: n }
            }
            EP_INTERRUPT_IN => match s.reports.pop_front() {
                Some(report) => {
                    let n = report.len().min(buf.len());
                    buf[..n].copy_from_slice(&report[..n]);
                    UsbHandshake::Ack { bytes: n }
                }
                None => UsbHandshake::Nak,
            },
            _ => UsbHandshake::Stall,
        }
    }
}

/// Records listener callbacks as `(completed, data)` pairs.
#[derive(Default)]
pub struct RecordingListener {
    pub events: Mutex<Vec<(bool, Vec<u8>)>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<(bool, Vec<u8>)> {
        self.events.lock().unwrap().clone()
    }
}

impl PipeListener for RecordingListener {
    fn request_completed(&self, request: &Request) {
        let n = request.actual_length();
        let mut data = request.data();
        data.truncate(n);
        self.events.lock().unwrap().push((true, data));
    }

    fn request_failed(&self, _request: &Request) {
        self.events.lock().unwrap().push((false, Vec::new()));
    }
}

/// A controller on a simulated platform with one [`TestDevice`] on root port 0.
pub struct Bench {
    pub platform: Arc<SimPlatform>,
    pub hc: Arc<UhciController>,
    pub device: DeviceHandle,
}

impl Bench {
    pub fn new() -> Self {
        Self::with_speed(false)
    }

    pub fn with_speed(low_speed: bool) -> Self {
        init_tracing();
        let platform = Arc::new(SimPlatform::new());
        let hc = UhciController::new(platform.clone(), fast_config()).unwrap();
        let (dev, device) = TestDevice::new(low_speed);
        platform.model().attach(0, Box::new(dev));
        hc.root_hub().reset_port(0).unwrap();
        hc.root_hub().clear_connection_status_changed(0).unwrap();
        Self {
            platform,
            hc: Arc::new(hc),
            device,
        }
    }

    pub fn device_info(&self, address: u8) -> DeviceInfo {
        DeviceInfo {
            address,
            low_speed: self.device.lock().low_speed,
        }
    }

    pub fn control_pipe(&self, address: u8) -> Arc<Pipe> {
        let pipe = self
            .hc
            .default_control_pipe(self.device_info(address))
            .unwrap();
        pipe.open().unwrap();
        pipe
    }

    pub fn endpoint_pipe(&self, address: u8, endpoint: EndpointInfo) -> Arc<Pipe> {
        let pipe = self
            .hc
            .create_pipe(self.device_info(address), endpoint)
            .unwrap();
        pipe.open().unwrap();
        pipe
    }

    /// Run `frames` frames, servicing the controller interrupt after each one that raised it.
    pub fn run_frames(&self, frames: usize) {
        for _ in 0..frames {
            if self.platform.model().step_frame() {
                self.hc.handle_interrupt();
            }
        }
    }

    /// Step frames on a background thread until the returned guard is dropped.
    pub fn spawn_frame_clock(&self) -> FrameClock {
        let stop = Arc::new(AtomicBool::new(false));
        let platform = self.platform.clone();
        let hc = self.hc.clone();
        let flag = stop.clone();
        let thread = thread::spawn(move || {
            while !flag.load(Ordering::Acquire) {
                if platform.model().step_frame() {
                    hc.handle_interrupt();
                }
                thread::sleep(Duration::from_micros(200));
            }
        });
        FrameClock {
            stop,
            thread: Some(thread),
        }
    }
}

pub struct FrameClock {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for FrameClock {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
