//! Bounded FIFO between the radio-receive context and the protocol engine.
//!
//! The producer side is the (deferred) radio interrupt, the consumer is
//! `service_once`; `heapless::spsc` keeps the index handshake lock-free.
//! A full queue drops the incoming frame; the protocol recovers by
//! timeout, so there is no retry.

use crate::mac_frame::MessageKind;
use crate::radio::RxQuality;
use crate::time::Timestamp;
use crate::{ShortAddress, FRAME_BUF_LEN, INTAKE_QUEUE_SIZE};

// spsc::Queue<_, N> stores N - 1 elements.
const INTAKE_SLOTS: usize = INTAKE_QUEUE_SIZE + 1;

/// One received frame awaiting protocol processing.
///
/// The RX timestamp and signal-quality snapshot are captured at enqueue
/// time: by the time the engine drains the queue the radio's own latches
/// may already describe a newer frame.
#[derive(Debug, Clone)]
pub struct RxFrame {
    buf: [u8; FRAME_BUF_LEN],
    len: u8,
    pub src: ShortAddress,
    pub kind: MessageKind,
    pub rx_time: Timestamp,
    pub quality: RxQuality,
    pub arrival_ms: u64,
}

impl RxFrame {
    /// Copies `frame` into a queue item; `None` if it exceeds the engine
    /// buffer size.
    pub fn new(
        frame: &[u8],
        src: ShortAddress,
        kind: MessageKind,
        rx_time: Timestamp,
        quality: RxQuality,
        arrival_ms: u64,
    ) -> Option<Self> {
        if frame.len() > FRAME_BUF_LEN {
            return None;
        }
        let mut buf = [0u8; FRAME_BUF_LEN];
        buf[..frame.len()].copy_from_slice(frame);
        Some(RxFrame {
            buf,
            len: frame.len() as u8,
            src,
            kind,
            rx_time,
            quality,
            arrival_ms,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }
}

/// The intake ring. Capacity is [`INTAKE_QUEUE_SIZE`] usable slots.
pub struct IntakeQueue {
    queue: heapless::spsc::Queue<RxFrame, INTAKE_SLOTS>,
}

impl IntakeQueue {
    pub const fn new() -> Self {
        IntakeQueue {
            queue: heapless::spsc::Queue::new(),
        }
    }

    /// `false` (and the frame is lost) when the ring is full.
    pub fn enqueue(&mut self, frame: RxFrame) -> bool {
        self.queue.enqueue(frame).is_ok()
    }

    pub fn dequeue(&mut self) -> Option<RxFrame> {
        self.queue.dequeue()
    }

    pub fn clear(&mut self) {
        while self.queue.dequeue().is_some() {}
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub const fn capacity(&self) -> usize {
        INTAKE_QUEUE_SIZE
    }
}

impl Default for IntakeQueue {
    fn default() -> Self {
        Self::new()
    }
}
