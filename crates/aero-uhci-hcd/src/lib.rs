//! UHCI (USB 1.1) host controller scheduling core.
//!
//! The crate owns the hardware-visible data structures a UHCI controller walks every millisecond:
//! transfer descriptors ([`td`]), queue heads ([`qh`]) and the 1024-entry frame list with its
//! skeleton of interrupt/control/bulk queues ([`schedule`]). On top of that sit per-endpoint
//! [`Pipe`]s, which turn [`Request`]s into TD chains, track data toggles and report completion, and
//! the [`UhciController`], which brings the controller up and fans interrupts out to the pipes.
//!
//! Everything platform specific (DMA memory, I/O ports, IRQ lines, PCI config writes) goes through
//! [`ResourceManager`]. The [`model`] module provides a software controller and a matching
//! platform so the whole stack can run without hardware.
#![forbid(unsafe_code)]

pub mod config;
pub mod controller;
pub mod descriptor;
pub mod error;
pub mod link;
pub mod memory;
pub mod model;
pub mod pipe;
pub mod pipe_manager;
pub mod qh;
pub mod regs;
pub mod request;
pub mod resources;
pub mod root_hub;
pub mod schedule;
pub mod td;

pub use config::ControllerConfig;
pub use controller::UhciController;
pub use error::{Result, UsbError};
pub use memory::{DmaPool, DmaRegion, MemoryBus};
pub use pipe::{DeviceInfo, EndpointInfo, Pipe, PipeListener, TransferType};
pub use pipe_manager::PipeManager;
pub use request::{Request, RequestDirection, RequestStatus, SetupPacket};
pub use resources::{PortIo, ResourceManager};
pub use root_hub::{PortStatus, RootHub};
pub use schedule::{Schedule, SkeletonQueue};
