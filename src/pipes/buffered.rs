//! A ring of events decoupling producer and consumer rates.
//!
//! The ring rejects sends when full and drains toward its output on
//! every tick. Two watermarks drive back-pressure toward the upstream
//! source: crossing HIGH (7/8 full) on the way up emits
//! `HighWater(true)` along the reverse path, and crossing LOW (1/2
//! full) on the way down emits `HighWater(false)`. The notifications
//! are delivered from `tick`, so a source that is mid-send never sees
//! its own buffer call back into it.

use crate::event::{Event, SendResult};
use crate::pipe::{send_to, Pipe, PipeRef};
use heapless::Deque;

/// Default ring capacity, as events. Must be a power of two.
pub const DEFAULT_RING_SIZE: usize = 512;

pub struct BufferedPipe<const N: usize = DEFAULT_RING_SIZE> {
    ring: Deque<Event, N>,
    out: Option<PipeRef>,
    /// Reverse path toward the stage that fills this ring.
    back: Option<PipeRef>,
    high_water: bool,
    pending_notice: Option<bool>,
}

impl<const N: usize> BufferedPipe<N> {
    const HIGH_MARK: usize = N - N / 8;
    const LOW_MARK: usize = N / 2;

    pub fn new() -> BufferedPipe<N> {
        const { assert!(N.is_power_of_two() && N >= 32) };
        BufferedPipe {
            ring: Deque::new(),
            out: None,
            back: None,
            high_water: false,
            pending_notice: None,
        }
    }

    /// Assign the reverse path for `HighWater` notifications.
    pub fn set_back(&mut self, back: PipeRef) {
        self.back = Some(back);
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

impl<const N: usize> Default for BufferedPipe<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Pipe for BufferedPipe<N> {
    fn send(&mut self, event: Event) -> SendResult {
        if self.ring.push_back(event).is_err() {
            return SendResult::Rejected;
        }
        if !self.high_water && self.ring.len() >= Self::HIGH_MARK {
            self.high_water = true;
            self.pending_notice = Some(true);
        }
        SendResult::Ok
    }

    fn tick(&mut self, _cycle_us: u32) -> SendResult {
        while let Some(&event) = self.ring.front() {
            if send_to(&self.out, event).is_rejected() {
                break;
            }
            self.ring.pop_front();
        }
        if self.high_water && self.pending_notice.is_none() && self.ring.len() <= Self::LOW_MARK {
            self.high_water = false;
            self.pending_notice = Some(false);
        }
        if let Some(on) = self.pending_notice {
            if send_to(&self.back, Event::HighWater(on)).is_ok() {
                self.pending_notice = None;
            }
        }
        SendResult::Ok
    }

    fn set_out(&mut self, out: PipeRef) {
        self.out = Some(out);
    }
}
