//! Transfer requests and their completion state.

use std::fmt;
use std::ops::Range;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::memory::DmaRegion;
use crate::td::TransferDescriptor;
use crate::{Result, UsbError};

bitflags! {
    /// Outcome of a finished request.
    ///
    /// `COMPLETED` alone means success; any bit in [`RequestStatus::ERROR_MASK`] names the
    /// hardware condition that ended the transfer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RequestStatus: u32 {
        const COMPLETED = 1 << 0;
        const STALLED = 1 << 1;
        const DATA_BUFFER = 1 << 2;
        const BABBLE = 1 << 3;
        const NAK = 1 << 4;
        const CRC_TIMEOUT = 1 << 5;
        const BITSTUFF = 1 << 6;

        const ERROR_MASK = Self::STALLED.bits()
            | Self::DATA_BUFFER.bits()
            | Self::BABBLE.bits()
            | Self::NAK.bits()
            | Self::CRC_TIMEOUT.bits()
            | Self::BITSTUFF.bits();
    }
}

impl RequestStatus {
    /// Translate the error bits of a retired TD.
    pub fn from_td(td: &TransferDescriptor) -> Self {
        let mut status = RequestStatus::empty();
        if td.is_stalled() {
            status |= RequestStatus::STALLED;
        }
        if td.is_data_buffer_error() {
            status |= RequestStatus::DATA_BUFFER;
        }
        if td.is_babble() {
            status |= RequestStatus::BABBLE;
        }
        if td.is_nak() {
            status |= RequestStatus::NAK;
        }
        if td.is_crc_timeout() {
            status |= RequestStatus::CRC_TIMEOUT;
        }
        if td.is_bitstuff_error() {
            status |= RequestStatus::BITSTUFF;
        }
        if status.is_empty() {
            RequestStatus::COMPLETED
        } else {
            status
        }
    }

    pub fn is_error(self) -> bool {
        self.intersects(RequestStatus::ERROR_MASK)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestDirection {
    /// Host to device.
    Out,
    /// Device to host.
    In,
}

/// The 8-byte SETUP stage of a control transfer (USB 2.0, section 9.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl SetupPacket {
    pub const LEN: usize = 8;

    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[0] = self.bm_request_type;
        bytes[1] = self.b_request;
        bytes[2..4].copy_from_slice(&self.w_value.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.w_index.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.w_length.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self {
            bm_request_type: bytes[0],
            b_request: bytes[1],
            w_value: u16::from_le_bytes([bytes[2], bytes[3]]),
            w_index: u16::from_le_bytes([bytes[4], bytes[5]]),
            w_length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn direction(&self) -> RequestDirection {
        if self.bm_request_type & 0x80 != 0 {
            RequestDirection::In
        } else {
            RequestDirection::Out
        }
    }
}

/// TD chain and DMA buffers built for a request.
///
/// Kept on the request after completion so periodic and repeated submissions can recycle it.
pub(crate) struct TdChain {
    pub(crate) head: TransferDescriptor,
    /// Holds the SETUP bytes the first TD points at.
    pub(crate) _setup_buffer: Option<DmaRegion>,
    pub(crate) data_buffer: Option<DmaRegion>,
    /// Index range (in chain order) of the TDs that move payload bytes.
    pub(crate) data_tds: Range<usize>,
    /// Control transfers only: the status stage TD.
    pub(crate) status_td: Option<u32>,
    /// Data stage moves bytes device-to-host.
    pub(crate) inbound: bool,
    /// Queue head the chain was built for; a chain is never shared across pipes.
    pub(crate) owner_qh: u32,
}

pub(crate) struct RequestState {
    pub(crate) pending: bool,
    pub(crate) completed: bool,
    pub(crate) status: RequestStatus,
    pub(crate) actual_length: usize,
    pub(crate) data: Vec<u8>,
    pub(crate) completions: u64,
    pub(crate) chain: Option<TdChain>,
}

/// A USB transfer submitted to a [`crate::Pipe`].
///
/// For IN transfers the buffer passed at construction is the receive buffer and its length is the
/// requested length; received bytes are visible through [`Request::data`] once the request
/// completes.
pub struct Request {
    setup: Option<SetupPacket>,
    length: usize,
    state: Mutex<RequestState>,
    completion: Condvar,
}

impl Request {
    /// A control transfer. `data` is the data stage (empty for no data stage).
    pub fn control(setup: SetupPacket, data: Vec<u8>) -> Self {
        Self::new(Some(setup), data)
    }

    /// A bulk, interrupt or isochronous transfer.
    pub fn transfer(data: Vec<u8>) -> Self {
        Self::new(None, data)
    }

    fn new(setup: Option<SetupPacket>, data: Vec<u8>) -> Self {
        Self {
            setup,
            length: data.len(),
            state: Mutex::new(RequestState {
                pending: false,
                completed: false,
                status: RequestStatus::empty(),
                actual_length: 0,
                data,
                completions: 0,
                chain: None,
            }),
            completion: Condvar::new(),
        }
    }

    pub fn setup(&self) -> Option<&SetupPacket> {
        self.setup.as_ref()
    }

    /// Requested data stage length in bytes.
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn is_completed(&self) -> bool {
        self.lock_state().completed
    }

    pub fn status(&self) -> RequestStatus {
        self.lock_state().status
    }

    pub fn actual_length(&self) -> usize {
        self.lock_state().actual_length
    }

    pub fn data(&self) -> Vec<u8> {
        self.lock_state().data.clone()
    }

    /// Block until the request completes. Returns `false` on timeout.
    pub fn wait_until_complete(&self, timeout: Duration) -> bool {
        let state = self.lock_state();
        let (state, _) = self
            .completion
            .wait_timeout_while(state, timeout, |s| !s.completed)
            .unwrap_or_else(|poison| poison.into_inner());
        state.completed
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, RequestState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    pub(crate) fn completions(&self) -> u64 {
        self.lock_state().completions
    }

    /// Wait for a completion after the `seen`-th one. Used by synchronous submission, where an
    /// interrupt pipe may already have re-armed (and cleared `completed`) by the time the waiter
    /// wakes.
    pub(crate) fn wait_for_completion_after(&self, seen: u64, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock_state();
        while state.completions == seen {
            let now = Instant::now();
            if now >= deadline {
                return Err(UsbError::Timeout);
            }
            state = self
                .completion
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poison| poison.into_inner())
                .0;
        }
        if state.status.is_error() {
            return Err(UsbError::Transfer(state.status));
        }
        Ok(())
    }

    /// Clear the outcome of any previous run ahead of a new submission.
    pub(crate) fn reset_for_submit(&self) -> Result<()> {
        let mut state = self.lock_state();
        if state.pending {
            return Err(UsbError::InvalidState("request is already submitted"));
        }
        state.pending = true;
        state.completed = false;
        state.status = RequestStatus::empty();
        state.actual_length = 0;
        Ok(())
    }

    /// Periodic re-arm: the previous outcome stays readable until the next completion.
    pub(crate) fn rearm(&self) {
        let mut state = self.lock_state();
        state.pending = true;
        state.completed = false;
    }

    pub(crate) fn abandon(&self) {
        self.lock_state().pending = false;
    }

    pub(crate) fn complete(&self, status: RequestStatus, actual_length: usize) {
        let mut state = self.lock_state();
        let state = &mut *state;
        if let Some(chain) = state.chain.as_ref().filter(|c| c.inbound) {
            if let Some(buffer) = chain.data_buffer.as_ref() {
                let n = actual_length.min(state.data.len());
                buffer.read(0, &mut state.data[..n]);
            }
        }
        state.pending = false;
        state.completed = true;
        state.status = status;
        state.actual_length = actual_length;
        state.completions += 1;
        self.completion.notify_all();
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("Request")
            .field("setup", &self.setup)
            .field("length", &self.length)
            .field("completed", &state.completed)
            .field("status", &state.status)
            .field("actual_length", &state.actual_length)
            .finish()
    }
}
