//! Frame list and skeleton queue heads.
//!
//! The skeleton is built once and never torn down:
//!
//! ```text
//! frame[i] -> int128 -> int64 -> ... -> int1 -> ls-control -> hs-control -> bulk -> terminator
//!                                                                ^                      |
//!                                                                +----------------------+
//! ```
//!
//! Frame list entries point into the interrupt part of the chain according to the trailing zero
//! bits of the frame index, so the 1ms queue is visited every frame, the 2ms queue every other
//! frame and so on. The terminator loops back to the high-speed control queue to keep the
//! controller busy; some chipsets mishandle a schedule that goes fully idle.

use std::sync::Mutex;

use crate::descriptor::AlignedDescriptor;
use crate::link::LinkPointer;
use crate::qh::QueueHead;
use crate::resources::ResourceManager;
use crate::td::{PacketId, TdFields, TransferDescriptor};
use crate::Result;

pub const FRAME_LIST_ENTRIES: usize = 1024;
pub const FRAME_LIST_ALIGN: usize = 4096;

/// Polling intervals (ms) of the interrupt skeleton queues, shortest first.
pub const INTERRUPT_INTERVALS_MS: [u32; 8] = [1, 2, 4, 8, 16, 32, 64, 128];

/// The 4KiB-aligned table the controller indexes with the current frame number.
pub struct FrameList {
    desc: AlignedDescriptor,
}

impl FrameList {
    pub fn new(rm: &dyn ResourceManager) -> Result<Self> {
        let desc = AlignedDescriptor::allocate(rm, FRAME_LIST_ENTRIES * 4, FRAME_LIST_ALIGN)?;
        for i in 0..FRAME_LIST_ENTRIES {
            desc.write_u32(i * 4, LinkPointer::Terminate.encode());
        }
        Ok(Self { desc })
    }

    pub fn physical_address(&self) -> u32 {
        self.desc.physical_address()
    }

    pub fn len(&self) -> usize {
        FRAME_LIST_ENTRIES
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn get_list_pointer(&self, frame: usize) -> LinkPointer {
        LinkPointer::decode(self.raw_entry(frame))
    }

    pub fn raw_entry(&self, frame: usize) -> u32 {
        self.desc.read_u32((frame % FRAME_LIST_ENTRIES) * 4)
    }

    pub fn set_list_pointer(&self, frame: usize, link: LinkPointer) {
        self.desc.write_u32((frame % FRAME_LIST_ENTRIES) * 4, link.encode());
    }
}

/// Index into [`INTERRUPT_INTERVALS_MS`] of the queue a frame list slot routes to.
pub fn interrupt_index_for_frame(frame: usize) -> usize {
    let mut idx = 0;
    while idx < INTERRUPT_INTERVALS_MS.len() - 1 && frame & (1 << idx) == 0 {
        idx += 1;
    }
    idx
}

/// Index of the longest interrupt queue whose interval does not exceed `interval_ms`.
///
/// Intervals below 1ms use the 1ms queue and anything from 128ms up uses the 128ms queue; e.g. a
/// 10ms endpoint is polled every 8ms.
pub fn interrupt_index_for_interval(interval_ms: u32) -> usize {
    match interval_ms {
        0..=1 => 0,
        2..=3 => 1,
        4..=7 => 2,
        8..=15 => 3,
        16..=31 => 4,
        32..=63 => 5,
        64..=127 => 6,
        _ => 7,
    }
}

/// Which skeleton queue a pipe's QH is inserted behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkeletonQueue {
    /// Interrupt queue by index into [`INTERRUPT_INTERVALS_MS`].
    Interrupt(usize),
    LowSpeedControl,
    HighSpeedControl,
    Bulk,
}

pub struct Schedule {
    frame_list: FrameList,
    /// Interrupt queues, 1ms first.
    interrupt_qhs: Vec<QueueHead>,
    ls_control_qh: QueueHead,
    hs_control_qh: QueueHead,
    bulk_qh: QueueHead,
    terminator_qh: QueueHead,
    // Kept alive for as long as the terminator QH references it.
    terminator_td: TransferDescriptor,
    /// Serializes horizontal link edits (pipe QH insert/remove).
    edit_lock: Mutex<()>,
}

impl Schedule {
    pub fn new(rm: &dyn ResourceManager) -> Result<Self> {
        let frame_list = FrameList::new(rm)?;
        let interrupt_qhs = INTERRUPT_INTERVALS_MS
            .iter()
            .map(|_| QueueHead::new(rm))
            .collect::<Result<Vec<_>>>()?;
        let ls_control_qh = QueueHead::new(rm)?;
        let hs_control_qh = QueueHead::new(rm)?;
        let bulk_qh = QueueHead::new(rm)?;
        let terminator_qh = QueueHead::new(rm)?;

        // 128ms -> 64ms -> ... -> 1ms
        for pair in interrupt_qhs.windows(2) {
            pair[1].set_link(LinkPointer::qh(pair[0].physical_address()));
        }
        interrupt_qhs[0].set_link(LinkPointer::qh(ls_control_qh.physical_address()));
        ls_control_qh.set_link(LinkPointer::qh(hs_control_qh.physical_address()));
        hs_control_qh.set_link(LinkPointer::qh(bulk_qh.physical_address()));
        bulk_qh.set_link(LinkPointer::qh(terminator_qh.physical_address()));
        terminator_qh.set_link(LinkPointer::qh(hs_control_qh.physical_address()));

        let terminator_td = TransferDescriptor::new(
            rm,
            TdFields {
                device_address: 0x7F,
                endpoint: 0,
                packet_id: PacketId::In,
                data_toggle: false,
                length: 0,
                isochronous: false,
                low_speed: false,
                interrupt_on_complete: false,
            },
            None,
        )?;
        terminator_td.deactivate();
        terminator_qh.add(&terminator_td)?;

        for frame in 0..FRAME_LIST_ENTRIES {
            let qh = &interrupt_qhs[interrupt_index_for_frame(frame)];
            frame_list.set_list_pointer(
                frame,
                LinkPointer::Qh {
                    addr: qh.physical_address(),
                    depth_first: true,
                },
            );
        }

        tracing::debug!(
            frame_list = format_args!("{:#x}", frame_list.physical_address()),
            "UHCI schedule built"
        );

        Ok(Self {
            frame_list,
            interrupt_qhs,
            ls_control_qh,
            hs_control_qh,
            bulk_qh,
            terminator_qh,
            terminator_td,
            edit_lock: Mutex::new(()),
        })
    }

    pub fn frame_list(&self) -> &FrameList {
        &self.frame_list
    }

    pub fn get_interrupt_qh(&self, interval_ms: u32) -> &QueueHead {
        &self.interrupt_qhs[interrupt_index_for_interval(interval_ms)]
    }

    /// Interrupt queue by index; `0` is the 1ms queue.
    pub fn interrupt_qh(&self, index: usize) -> &QueueHead {
        &self.interrupt_qhs[index.min(self.interrupt_qhs.len() - 1)]
    }

    pub fn low_speed_control_qh(&self) -> &QueueHead {
        &self.ls_control_qh
    }

    pub fn high_speed_control_qh(&self) -> &QueueHead {
        &self.hs_control_qh
    }

    pub fn bulk_qh(&self) -> &QueueHead {
        &self.bulk_qh
    }

    pub fn terminator_qh(&self) -> &QueueHead {
        &self.terminator_qh
    }

    pub fn terminator_td(&self) -> &TransferDescriptor {
        &self.terminator_td
    }

    pub fn skeleton(&self, queue: SkeletonQueue) -> &QueueHead {
        match queue {
            SkeletonQueue::Interrupt(idx) => self.interrupt_qh(idx),
            SkeletonQueue::LowSpeedControl => &self.ls_control_qh,
            SkeletonQueue::HighSpeedControl => &self.hs_control_qh,
            SkeletonQueue::Bulk => &self.bulk_qh,
        }
    }

    /// Insert `qh` right after the given skeleton queue.
    pub fn attach(&self, queue: SkeletonQueue, qh: &QueueHead) -> Result<()> {
        let _guard = self.edit_lock.lock().unwrap_or_else(|poison| poison.into_inner());
        self.skeleton(queue).insert_link(qh)
    }

    /// Remove `qh` from the list behind the given skeleton queue.
    pub fn detach(&self, queue: SkeletonQueue, qh: &QueueHead) {
        let _guard = self.edit_lock.lock().unwrap_or_else(|poison| poison.into_inner());
        self.skeleton(queue).remove_link(qh);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SimPlatform;

    #[test]
    fn interval_brackets_pick_largest_queue_not_exceeding_request() {
        let cases = [
            (0, 1),
            (1, 1),
            (2, 2),
            (3, 2),
            (4, 4),
            (7, 4),
            (8, 8),
            (10, 8),
            (15, 8),
            (16, 16),
            (31, 16),
            (32, 32),
            (63, 32),
            (64, 64),
            (127, 64),
            (128, 128),
            (200, 128),
            (255, 128),
        ];
        for (interval, expected) in cases {
            assert_eq!(
                INTERRUPT_INTERVALS_MS[interrupt_index_for_interval(interval)],
                expected,
                "interval {interval}"
            );
        }
    }

    #[test]
    fn frame_routing_follows_trailing_zero_bits() {
        assert_eq!(interrupt_index_for_frame(0), 7);
        assert_eq!(interrupt_index_for_frame(1), 0);
        assert_eq!(interrupt_index_for_frame(2), 1);
        assert_eq!(interrupt_index_for_frame(12), 2);
        assert_eq!(interrupt_index_for_frame(127), 0);
        assert_eq!(interrupt_index_for_frame(128), 7);
        assert_eq!(interrupt_index_for_frame(256), 7);
        assert_eq!(interrupt_index_for_frame(64), 6);
    }

    #[test]
    fn every_frame_list_entry_routes_to_the_right_interrupt_queue() {
        let platform = SimPlatform::new();
        let schedule = Schedule::new(&platform).unwrap();
        let fl = schedule.frame_list();
        assert_eq!(fl.physical_address() % 4096, 0);

        for frame in 0..FRAME_LIST_ENTRIES {
            let LinkPointer::Qh { addr, depth_first } = fl.get_list_pointer(frame) else {
                panic!("frame {frame} does not point at a QH");
            };
            assert!(depth_first);
            let idx = (0..INTERRUPT_INTERVALS_MS.len())
                .find(|&i| schedule.interrupt_qh(i).physical_address() == addr)
                .expect("frame entry must target an interrupt QH");
            let interval = INTERRUPT_INTERVALS_MS[idx] as usize;

            // The routed queue's interval divides the frame index (frame 0 divides everything),
            // and no longer queue would also divide it.
            assert_eq!(frame % interval, 0, "frame {frame} -> {interval}ms");
            if idx + 1 < INTERRUPT_INTERVALS_MS.len() {
                assert_ne!(frame % (interval * 2), 0, "frame {frame} under-routed");
            }
        }

        let int128 = schedule.get_interrupt_qh(128).physical_address();
        let int1 = schedule.get_interrupt_qh(1).physical_address();
        assert!(fl.get_list_pointer(0).targets_qh(int128));
        assert!(fl.get_list_pointer(127).targets_qh(int1));
        assert!(fl.get_list_pointer(128).targets_qh(int128));
    }

    #[test]
    fn skeleton_chain_order_and_terminator_loop() {
        let platform = SimPlatform::new();
        let schedule = Schedule::new(&platform).unwrap();

        let mut expected = Vec::new();
        for idx in (0..INTERRUPT_INTERVALS_MS.len()).rev() {
            expected.push(schedule.interrupt_qh(idx).physical_address());
        }
        expected.push(schedule.low_speed_control_qh().physical_address());
        expected.push(schedule.high_speed_control_qh().physical_address());
        expected.push(schedule.bulk_qh().physical_address());
        expected.push(schedule.terminator_qh().physical_address());

        let mut walked = vec![schedule.interrupt_qh(7).physical_address()];
        let mut qh = schedule.interrupt_qh(7);
        let all: Vec<&QueueHead> = (0..8)
            .map(|i| schedule.interrupt_qh(i))
            .chain([
                schedule.low_speed_control_qh(),
                schedule.high_speed_control_qh(),
                schedule.bulk_qh(),
                schedule.terminator_qh(),
            ])
            .collect();
        while walked.len() < expected.len() {
            let next = qh.link().addr().unwrap();
            walked.push(next);
            qh = all.iter().find(|q| q.physical_address() == next).unwrap();
        }
        assert_eq!(walked, expected);

        assert!(schedule
            .terminator_qh()
            .link()
            .targets_qh(schedule.high_speed_control_qh().physical_address()));

        // Terminator QH holds an inactive placeholder TD; every other skeleton QH is empty.
        assert!(!schedule.terminator_qh().is_empty());
        assert!(!schedule.terminator_td().is_active());
        assert!(all[..11].iter().all(|q| q.is_empty()));
    }

    #[test]
    fn attach_and_detach_go_through_the_skeleton() {
        let platform = SimPlatform::new();
        let schedule = Schedule::new(&platform).unwrap();
        let qh = QueueHead::new(&platform).unwrap();

        schedule.attach(SkeletonQueue::Bulk, &qh).unwrap();
        assert!(schedule.bulk_qh().link().targets_qh(qh.physical_address()));
        assert!(qh
            .link()
            .targets_qh(schedule.terminator_qh().physical_address()));

        schedule.detach(SkeletonQueue::Bulk, &qh);
        assert!(schedule
            .bulk_qh()
            .link()
            .targets_qh(schedule.terminator_qh().physical_address()));
        assert!(qh.link().is_terminate());
    }
}
