//! Outbound throttle categories. Shaping policy lives elsewhere; this
//! layer only preserves category ordering and FIFO order within one.

use crate::reliability::OutgoingPacket;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

/// Drain order is the declaration order: resends always go out first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThrottleCategory {
    Resend,
    Land,
    Wind,
    Cloud,
    Task,
    Texture,
    Asset,
}

pub const CATEGORY_COUNT: usize = 7;

impl ThrottleCategory {
    pub const ALL: [ThrottleCategory; CATEGORY_COUNT] = [
        ThrottleCategory::Resend,
        ThrottleCategory::Land,
        ThrottleCategory::Wind,
        ThrottleCategory::Cloud,
        ThrottleCategory::Task,
        ThrottleCategory::Texture,
        ThrottleCategory::Asset,
    ];

    fn index(self) -> usize {
        match self {
            ThrottleCategory::Resend => 0,
            ThrottleCategory::Land => 1,
            ThrottleCategory::Wind => 2,
            ThrottleCategory::Cloud => 3,
            ThrottleCategory::Task => 4,
            ThrottleCategory::Texture => 5,
            ThrottleCategory::Asset => 6,
        }
    }
}

/// Per-category FIFO queues feeding the send pump.
#[derive(Debug, Default)]
pub struct ThrottleQueues {
    queues: Mutex<[VecDeque<OutgoingPacket>; CATEGORY_COUNT]>,
    /// Woken whenever a packet is queued.
    pub ready: Notify,
}

impl ThrottleQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, packet: OutgoingPacket) {
        let idx = packet.category.index();
        self.queues.lock().unwrap()[idx].push_back(packet);
        self.ready.notify_one();
    }

    /// Takes the next packet, highest-priority category first.
    pub fn pop(&self) -> Option<OutgoingPacket> {
        let mut queues = self.queues.lock().unwrap();
        queues.iter_mut().find_map(VecDeque::pop_front)
    }

    pub fn is_empty(&self) -> bool {
        self.queues.lock().unwrap().iter().all(VecDeque::is_empty)
    }

    pub fn clear(&self) {
        for queue in self.queues.lock().unwrap().iter_mut() {
            queue.clear();
        }
    }
}
