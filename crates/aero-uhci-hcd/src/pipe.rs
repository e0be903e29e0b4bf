//! Pipes: one endpoint's queue head, request FIFO and completion handling.
//!
//! At most one request per pipe is attached to the queue head at a time. Everything else waits
//! in submission order and is activated from the interrupt path once the queue head drains.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crate::link::LinkPointer;
use crate::memory::DmaRegion;
use crate::pipe_manager::PipeManager;
use crate::qh::QueueHead;
use crate::request::{Request, RequestDirection, RequestStatus, SetupPacket, TdChain};
use crate::resources::ResourceManager;
use crate::schedule::{interrupt_index_for_interval, Schedule, SkeletonQueue};
use crate::td::{PacketId, TdFields, TransferDescriptor, MAX_TD_LENGTH};
use crate::{Result, UsbError};

/// Completion callbacks for requests on a pipe.
///
/// Called from the interrupt path with the pipe locked; implementations must not call back into
/// the same pipe.
pub trait PipeListener: Send + Sync {
    fn request_completed(&self, request: &Request);
    fn request_failed(&self, request: &Request);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TryFrom<u8> for TransferType {
    type Error = UsbError;

    fn try_from(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(TransferType::Control),
            1 => Ok(TransferType::Isochronous),
            2 => Ok(TransferType::Bulk),
            3 => Ok(TransferType::Interrupt),
            other => Err(UsbError::UnknownTransferType(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub address: u8,
    pub low_speed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub number: u8,
    pub direction: RequestDirection,
    /// Transfer type code as found in `bmAttributes` bits 1:0.
    pub transfer_type: u8,
    /// 0 selects the controller's default (EP0 before the device descriptor is read).
    pub max_packet_size: u16,
    pub interval_ms: u8,
}

impl EndpointInfo {
    /// Endpoint 0.
    pub fn default_control(max_packet_size: u16) -> Self {
        Self {
            number: 0,
            direction: RequestDirection::Out,
            transfer_type: 0,
            max_packet_size,
            interval_ms: 0,
        }
    }

    /// Build from the fields of a standard endpoint descriptor.
    pub fn from_descriptor(
        b_endpoint_address: u8,
        bm_attributes: u8,
        w_max_packet_size: u16,
        b_interval: u8,
    ) -> Self {
        Self {
            number: b_endpoint_address & 0x0F,
            direction: if b_endpoint_address & 0x80 != 0 {
                RequestDirection::In
            } else {
                RequestDirection::Out
            },
            transfer_type: bm_attributes & 0x03,
            max_packet_size: w_max_packet_size & 0x07FF,
            interval_ms: b_interval,
        }
    }
}

struct PipeState {
    open: bool,
    active: Option<Arc<Request>>,
    queue: VecDeque<Arc<Request>>,
    /// Next DATA0/DATA1 value for bulk and interrupt endpoints.
    data_toggle: bool,
    listeners: Vec<Arc<dyn PipeListener>>,
}

enum ChainOutcome {
    Pending,
    /// Short packet in a control data stage; run the status stage next.
    SkipToStatus(u32),
    Finished {
        status: RequestStatus,
        actual_length: usize,
        resume_toggle: Option<bool>,
    },
}

pub struct Pipe {
    resources: Arc<dyn ResourceManager>,
    schedule: Arc<Schedule>,
    manager: Weak<PipeManager>,
    device: DeviceInfo,
    endpoint: EndpointInfo,
    transfer_type: TransferType,
    max_packet_size: usize,
    skeleton: SkeletonQueue,
    qh: QueueHead,
    state: Mutex<PipeState>,
}

impl Pipe {
    pub(crate) fn new(
        resources: Arc<dyn ResourceManager>,
        schedule: Arc<Schedule>,
        manager: Weak<PipeManager>,
        device: DeviceInfo,
        endpoint: EndpointInfo,
        default_max_packet_size: u16,
    ) -> Result<Self> {
        let transfer_type = TransferType::try_from(endpoint.transfer_type)?;
        if device.address > 0x7F {
            return Err(UsbError::InvalidArgument("USB device address out of range"));
        }
        if endpoint.number > 0x0F {
            return Err(UsbError::InvalidArgument("endpoint number out of range"));
        }
        let max_packet_size = match endpoint.max_packet_size {
            0 => usize::from(default_max_packet_size),
            mps => usize::from(mps),
        };
        if max_packet_size == 0 || max_packet_size > MAX_TD_LENGTH {
            return Err(UsbError::InvalidArgument("unsupported max packet size"));
        }

        let skeleton = match transfer_type {
            TransferType::Control if device.low_speed => SkeletonQueue::LowSpeedControl,
            TransferType::Control => SkeletonQueue::HighSpeedControl,
            TransferType::Bulk => SkeletonQueue::Bulk,
            TransferType::Interrupt => {
                SkeletonQueue::Interrupt(interrupt_index_for_interval(u32::from(endpoint.interval_ms)))
            }
            TransferType::Isochronous => SkeletonQueue::Interrupt(0),
        };
        let qh = QueueHead::new(&*resources)?;

        Ok(Self {
            resources,
            schedule,
            manager,
            device,
            endpoint,
            transfer_type,
            max_packet_size,
            skeleton,
            qh,
            state: Mutex::new(PipeState {
                open: false,
                active: None,
                queue: VecDeque::new(),
                data_toggle: false,
                listeners: Vec::new(),
            }),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn device(&self) -> DeviceInfo {
        self.device
    }

    pub fn endpoint(&self) -> EndpointInfo {
        self.endpoint
    }

    pub fn transfer_type(&self) -> TransferType {
        self.transfer_type
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    pub fn skeleton(&self) -> SkeletonQueue {
        self.skeleton
    }

    pub fn queue_head(&self) -> &QueueHead {
        &self.qh
    }

    pub fn is_open(&self) -> bool {
        self.lock_state().open
    }

    /// DATA0/DATA1 value the next bulk or interrupt packet will carry.
    pub fn data_toggle(&self) -> bool {
        self.lock_state().data_toggle
    }

    /// Reset the endpoint toggle to DATA0 (after a ClearFeature(ENDPOINT_HALT)).
    pub fn reset_data_toggle(&self) {
        self.lock_state().data_toggle = false;
    }

    pub fn has_active_request(&self) -> bool {
        self.lock_state().active.is_some()
    }

    /// Requests waiting behind the active one.
    pub fn queued_requests(&self) -> usize {
        self.lock_state().queue.len()
    }

    pub fn add_listener(&self, listener: Arc<dyn PipeListener>) {
        self.lock_state().listeners.push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn PipeListener>) {
        let target = Arc::as_ptr(listener) as *const ();
        self.lock_state()
            .listeners
            .retain(|l| Arc::as_ptr(l) as *const () != target);
    }

    /// Link the pipe's queue head into the schedule. No-op when already open.
    pub fn open(self: &Arc<Self>) -> Result<()> {
        let mut state = self.lock_state();
        if state.open {
            return Ok(());
        }
        self.schedule.attach(self.skeleton, &self.qh)?;
        state.open = true;
        if let Some(manager) = self.manager.upgrade() {
            manager.register(self);
        }
        tracing::debug!(
            device = self.device.address,
            endpoint = self.endpoint.number,
            transfer_type = ?self.transfer_type,
            qh = format_args!("{:#x}", self.qh.physical_address()),
            "USB pipe opened"
        );
        Ok(())
    }

    /// Unlink the queue head and abandon the active and queued requests.
    ///
    /// Abandoned requests are neither completed nor reported to listeners; they become
    /// submittable again and a reopened pipe starts with an empty queue.
    pub fn close(&self) {
        let mut state = self.lock_state();
        if !state.open {
            return;
        }
        self.schedule.detach(self.skeleton, &self.qh);
        state.open = false;
        if let Some(request) = state.active.take() {
            if let Some(chain) = request.lock_state().chain.as_ref() {
                self.qh.remove(&chain.head);
            }
            request.abandon();
        }
        for request in state.queue.drain(..) {
            request.abandon();
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.unregister(self);
        }
        tracing::debug!(
            device = self.device.address,
            endpoint = self.endpoint.number,
            "USB pipe closed"
        );
    }

    /// Queue a request. Never blocks.
    pub fn submit(&self, request: &Arc<Request>) -> Result<()> {
        let mut state = self.lock_state();
        if !state.open {
            return Err(UsbError::NotOpen);
        }
        match (self.transfer_type, request.setup()) {
            (TransferType::Control, None) => {
                return Err(UsbError::InvalidArgument("control pipe requires a setup packet"))
            }
            (TransferType::Control, Some(setup)) => {
                if usize::from(setup.w_length) != request.length() {
                    return Err(UsbError::InvalidArgument(
                        "data stage length does not match wLength",
                    ));
                }
            }
            (_, None) => {}
            (_, Some(_)) => {
                return Err(UsbError::InvalidArgument("setup packet on a non-control pipe"))
            }
        }
        request.reset_for_submit()?;

        if state.active.is_none() && self.qh.is_empty() {
            if let Err(err) = self.activate(&mut state, request.clone()) {
                request.abandon();
                return Err(err);
            }
        } else {
            state.queue.push_back(request.clone());
        }
        Ok(())
    }

    /// Submit and block until the request completes.
    ///
    /// On timeout the request stays attached to the schedule and may still complete later.
    pub fn submit_and_wait(&self, request: &Arc<Request>, timeout: Duration) -> Result<()> {
        let seen = request.completions();
        self.submit(request)?;
        request.wait_for_completion_after(seen, timeout)
    }

    /// Completion processing for one controller interrupt.
    pub fn handle_interrupt(&self) {
        let mut state = self.lock_state();
        if !state.open {
            return;
        }
        self.process_active(&mut state);
        self.activate_next(&mut state);
    }

    fn process_active(&self, state: &mut PipeState) {
        let Some(request) = state.active.clone() else {
            return;
        };
        let outcome = match request.lock_state().chain.as_ref() {
            Some(chain) => self.evaluate(chain),
            None => return,
        };

        let (status, actual_length, resume_toggle) = match outcome {
            ChainOutcome::Pending => return,
            ChainOutcome::SkipToStatus(status_td) => {
                if self.qh.element().addr() != Some(status_td) {
                    self.qh.set_element(LinkPointer::td(status_td));
                }
                return;
            }
            ChainOutcome::Finished {
                status,
                actual_length,
                resume_toggle,
            } => (status, actual_length, resume_toggle),
        };

        if let Some(chain) = request.lock_state().chain.as_ref() {
            self.qh.remove(&chain.head);
        }
        state.active = None;
        if matches!(self.transfer_type, TransferType::Bulk | TransferType::Interrupt) {
            if let Some(toggle) = resume_toggle {
                state.data_toggle = toggle;
            }
        }

        request.complete(status, actual_length);
        self.notify(state, &request, status);

        if self.transfer_type == TransferType::Interrupt && state.open {
            request.rearm();
            if let Err(err) = self.activate(state, request.clone()) {
                self.fail_activation(state, &request, &err);
            }
        }
    }

    fn activate_next(&self, state: &mut PipeState) {
        while state.active.is_none() && self.qh.is_empty() {
            let Some(next) = state.queue.pop_front() else {
                break;
            };
            if let Err(err) = self.activate(state, next.clone()) {
                self.fail_activation(state, &next, &err);
            }
        }
    }

    fn fail_activation(&self, state: &PipeState, request: &Request, err: &UsbError) {
        tracing::error!(
            device = self.device.address,
            endpoint = self.endpoint.number,
            error = %err,
            "failed to activate USB request"
        );
        // No hardware status applies; BITSTUFF stands in for an internal failure.
        request.complete(RequestStatus::BITSTUFF, 0);
        self.notify(state, request, RequestStatus::BITSTUFF);
    }

    fn notify(&self, state: &PipeState, request: &Request, status: RequestStatus) {
        if status.is_error() {
            // Periodic polling NAKs routinely; there is nothing to report yet.
            if self.transfer_type == TransferType::Interrupt
                && status & RequestStatus::ERROR_MASK == RequestStatus::NAK
            {
                return;
            }
            for listener in &state.listeners {
                listener.request_failed(request);
            }
        } else {
            for listener in &state.listeners {
                listener.request_completed(request);
            }
        }
    }

    /// Build (or recycle) the request's TD chain and attach it to the queue head.
    fn activate(&self, state: &mut PipeState, request: Arc<Request>) -> Result<()> {
        {
            let mut rs = request.lock_state();
            let rs = &mut *rs;
            let chain = match rs.chain.take() {
                Some(chain) if chain.owner_qh == self.qh.physical_address() => {
                    self.recycle(&chain, state);
                    chain
                }
                _ => self.build_chain(request.setup(), &rs.data, state)?,
            };
            let attached = self.qh.add(&chain.head);
            rs.chain = Some(chain);
            attached?;
        }
        state.active = Some(request);
        Ok(())
    }

    fn recycle(&self, chain: &TdChain, state: &mut PipeState) {
        let restamp = matches!(self.transfer_type, TransferType::Bulk | TransferType::Interrupt);
        for (i, td) in chain.head.iter().enumerate() {
            if restamp && chain.data_tds.contains(&i) {
                td.set_data_toggle(state.data_toggle);
                state.data_toggle = !state.data_toggle;
            }
            td.reset_status();
        }
    }

    fn build_chain(
        &self,
        setup: Option<&SetupPacket>,
        data: &[u8],
        state: &mut PipeState,
    ) -> Result<TdChain> {
        match self.transfer_type {
            TransferType::Control => {
                let setup = setup.ok_or(UsbError::InvalidArgument(
                    "control pipe requires a setup packet",
                ))?;
                self.build_control_chain(setup, data)
            }
            TransferType::Bulk | TransferType::Interrupt => {
                self.build_data_chain(data, Some(&mut state.data_toggle))
            }
            TransferType::Isochronous => self.build_data_chain(data, None),
        }
    }

    fn build_control_chain(&self, setup: &SetupPacket, data: &[u8]) -> Result<TdChain> {
        let inbound = setup.direction() == RequestDirection::In;
        let setup_buffer = self.resources.allocate_dma(SetupPacket::LEN, 4)?;
        setup_buffer.write(0, &setup.to_bytes());
        let data_buffer = self.data_buffer(data, inbound)?;

        let mut tds = vec![self.td(
            PacketId::Setup,
            false,
            SetupPacket::LEN,
            Some((&setup_buffer, 0)),
            false,
        )?];

        let data_pid = if inbound { PacketId::In } else { PacketId::Out };
        if let Some(buffer) = &data_buffer {
            let mut toggle = true;
            for (offset, len) in packet_chunks(data.len(), self.max_packet_size) {
                tds.push(self.td(data_pid, toggle, len, Some((buffer, offset)), false)?);
                toggle = !toggle;
            }
        }
        let data_end = tds.len();

        let status_pid = if inbound && !data.is_empty() {
            PacketId::Out
        } else {
            PacketId::In
        };
        let status = self.td(status_pid, true, 0, None, true)?;
        let status_td = status.physical_address();
        tds.push(status);

        Ok(TdChain {
            head: link_chain(tds)?,
            _setup_buffer: Some(setup_buffer),
            data_buffer,
            data_tds: 1..data_end,
            status_td: Some(status_td),
            inbound,
            owner_qh: self.qh.physical_address(),
        })
    }

    /// Bulk, interrupt and isochronous chains. `toggle` is the endpoint's running toggle;
    /// isochronous endpoints have none and always send DATA0.
    fn build_data_chain(&self, data: &[u8], mut toggle: Option<&mut bool>) -> Result<TdChain> {
        let inbound = self.endpoint.direction == RequestDirection::In;
        let data_buffer = self.data_buffer(data, inbound)?;
        let pid = if inbound { PacketId::In } else { PacketId::Out };

        let mut chunks = packet_chunks(data.len(), self.max_packet_size);
        if chunks.is_empty() {
            chunks.push((0, 0));
        }
        let count = chunks.len();
        let mut tds = Vec::with_capacity(count);
        for (i, (offset, len)) in chunks.into_iter().enumerate() {
            let data_toggle = match toggle.as_deref_mut() {
                Some(t) => {
                    let cur = *t;
                    *t = !cur;
                    cur
                }
                None => false,
            };
            let buffer = data_buffer.as_ref().filter(|_| len != 0).map(|b| (b, offset));
            tds.push(self.td(pid, data_toggle, len, buffer, i + 1 == count)?);
        }

        Ok(TdChain {
            head: link_chain(tds)?,
            _setup_buffer: None,
            data_buffer,
            data_tds: 0..count,
            status_td: None,
            inbound,
            owner_qh: self.qh.physical_address(),
        })
    }

    fn data_buffer(&self, data: &[u8], inbound: bool) -> Result<Option<DmaRegion>> {
        if data.is_empty() {
            return Ok(None);
        }
        let region = self.resources.allocate_dma(data.len(), 4)?;
        if !inbound {
            region.write(0, data);
        }
        Ok(Some(region))
    }

    fn td(
        &self,
        packet_id: PacketId,
        data_toggle: bool,
        length: usize,
        buffer: Option<(&DmaRegion, usize)>,
        interrupt_on_complete: bool,
    ) -> Result<TransferDescriptor> {
        TransferDescriptor::new(
            &*self.resources,
            TdFields {
                device_address: self.device.address,
                endpoint: self.endpoint.number,
                packet_id,
                data_toggle,
                length,
                isochronous: self.transfer_type == TransferType::Isochronous,
                low_speed: self.device.low_speed,
                interrupt_on_complete,
            },
            buffer,
        )
    }

    /// Inspect the chain in order and decide whether the request has finished.
    fn evaluate(&self, chain: &TdChain) -> ChainOutcome {
        let mut actual_length = 0;
        let mut resume_toggle = None;

        for (i, td) in chain.head.iter().enumerate() {
            // An active TD may carry NAK from a retried attempt; it is still in progress.
            if td.is_active() {
                return ChainOutcome::Pending;
            }
            let is_data = chain.data_tds.contains(&i);
            if td.is_any_error() {
                if is_data {
                    actual_length += td.get_actual_length();
                    resume_toggle = Some(td.data_toggle());
                }
                return ChainOutcome::Finished {
                    status: RequestStatus::from_td(td),
                    actual_length,
                    resume_toggle,
                };
            }
            if !is_data {
                continue;
            }

            let len = td.get_actual_length();
            actual_length += len;
            resume_toggle = Some(!td.data_toggle());
            if len >= td.max_length() {
                continue;
            }

            // Short packet: the rest of the data stage is skipped.
            let status = match chain.status_td {
                None => RequestStatus::COMPLETED,
                Some(addr) => match chain.head.iter().find(|t| t.physical_address() == addr) {
                    Some(status_td) if status_td.is_active() => {
                        return ChainOutcome::SkipToStatus(addr)
                    }
                    Some(status_td) => RequestStatus::from_td(status_td),
                    None => RequestStatus::COMPLETED,
                },
            };
            return ChainOutcome::Finished {
                status,
                actual_length,
                resume_toggle,
            };
        }

        ChainOutcome::Finished {
            status: RequestStatus::COMPLETED,
            actual_length,
            resume_toggle,
        }
    }
}

/// Split `len` bytes into `(offset, len)` packets of at most `max_packet_size` bytes.
fn packet_chunks(len: usize, max_packet_size: usize) -> Vec<(usize, usize)> {
    (0..len)
        .step_by(max_packet_size)
        .map(|offset| (offset, max_packet_size.min(len - offset)))
        .collect()
}

/// Link TDs depth-first in order and return the head.
fn link_chain(tds: Vec<TransferDescriptor>) -> Result<TransferDescriptor> {
    let mut next: Option<TransferDescriptor> = None;
    for mut td in tds.into_iter().rev() {
        if let Some(n) = next.take() {
            td.set_next_td(n, true);
        }
        next = Some(td);
    }
    next.ok_or(UsbError::InvalidState("empty TD chain"))
}
