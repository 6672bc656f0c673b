//! Cooperative round-robin scheduler.
//!
//! A single thread of control calls every registered stage once per
//! round, then drains the signal queue by broadcasting each queued event
//! to every signal-subscribed stage. Stages never block; back-pressure
//! is expressed through `SendResult::Rejected` and retried on the next
//! round.

use crate::event::{Event, SendResult};
use crate::pipe::PipeRef;
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::rc::Rc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::cell::RefCell;

/// Monotonic time source, supplied by the platform.
pub trait Clock {
    fn now_us(&mut self) -> u64;
}

bitflags! {
    /// Which scheduler services a stage subscribes to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Jobs: u8 {
        const TICKS = 0x01;
        const SIGNALS = 0x02;
    }
}

/// Queue of pending broadcasts, shared with stages that originate
/// signals (e.g. the Hayes filter after a register write).
#[derive(Clone, Default)]
pub struct SignalQueue(Rc<RefCell<VecDeque<Event>>>);

impl SignalQueue {
    pub fn new() -> SignalQueue {
        SignalQueue::default()
    }

    /// Enqueue an event for broadcast after the current round.
    pub fn push(&self, event: Event) {
        self.0.borrow_mut().push_back(event);
    }

    fn pop(&self) -> Option<Event> {
        self.0.borrow_mut().pop_front()
    }
}

pub struct Scheduler {
    tick_list: Vec<PipeRef>,
    signal_list: Vec<PipeRef>,
    signals: SignalQueue,
    clock: Box<dyn Clock>,
    last_us: u64,
    cycle_us: u32,
    rounds: u32,
}

impl Scheduler {
    pub fn new(clock: Box<dyn Clock>) -> Scheduler {
        Scheduler {
            tick_list: Vec::new(),
            signal_list: Vec::new(),
            signals: SignalQueue::new(),
            clock,
            last_us: 0,
            cycle_us: 1,
            rounds: 0,
        }
    }

    /// Register a stage for ticks, signals, or both.
    pub fn add(&mut self, stage: PipeRef, jobs: Jobs) -> &mut Scheduler {
        if jobs.contains(Jobs::TICKS) {
            self.tick_list.push(stage.clone());
        }
        if jobs.contains(Jobs::SIGNALS) {
            self.signal_list.push(stage);
        }
        self
    }

    /// Handle through which stages enqueue broadcasts.
    pub fn signal_queue(&self) -> SignalQueue {
        self.signals.clone()
    }

    /// Enqueue an event for broadcast in the next round.
    pub fn signal_all(&self, event: Event) {
        self.signals.push(event);
    }

    /// Wall time spent in the previous round, in microseconds. Never
    /// zero; filters rely on this for timeouts.
    pub fn cycle_time_us(&self) -> u32 {
        self.cycle_us
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// Run forever.
    pub fn run(&mut self) -> ! {
        loop {
            self.round();
        }
    }

    /// Run a bounded number of rounds (test harnesses and hosted use).
    pub fn run_rounds(&mut self, n: u32) {
        for _ in 0..n {
            self.round();
        }
    }

    fn round(&mut self) {
        self.update_time();
        for stage in &self.tick_list {
            let _ = stage.borrow_mut().tick(self.cycle_us);
        }
        // Every queued signal is delivered before the next round begins.
        while let Some(event) = self.signals.pop() {
            for stage in &self.signal_list {
                let _: SendResult = stage.borrow_mut().signal(event);
            }
        }
        self.rounds = self.rounds.wrapping_add(1);
    }

    fn update_time(&mut self) {
        let now = self.clock.now_us();
        let delta = now.saturating_sub(self.last_us);
        self.last_us = now;
        self.cycle_us = (delta as u32).max(1);
    }
}
