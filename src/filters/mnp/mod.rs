//! MNP link layer: framing, sequencing, acknowledgement, retransmission.
//!
//! The filter sits between the byte stream from the handheld and the
//! Dock engine. Downstream bytes are reassembled into frames
//! ([`rx::MnpReceiver`]); valid frames drive the session state machine
//! here; outbound frames are serialized one at a time
//! ([`tx::MnpSender`]). Dock payload arriving on the dock side is
//! aggregated into LT frames of at most 256 bytes, flushed on a frame
//! boundary. Transmission is stop-and-wait: a sent LT frame is retained
//! until the matching LA arrives, and resubmitted after one second or
//! on an out-of-sequence LA.
//!
//! The filter is agnostic to the payload; clients just stream bytes in
//! and out.

pub mod frame;
pub mod rx;
pub mod tx;

use crate::event::{Event, MnpEvent, SendResult};
use crate::pipe::{send_to, Pipe, PipeRef};
use alloc::collections::VecDeque;
use alloc::rc::Rc;
use core::cell::RefCell;
use frame::{FrameIx, FramePool, FRAME_LA, FRAME_LD, FRAME_LR, FRAME_LT, MAX_LT_PAYLOAD};
use rx::{MnpReceiver, RxOutcome};
use tx::{MnpSender, TxProgress};

/// Fixed LR reply: octet framing, window k=1, max info field 64,
/// fixed LT/LA header format.
const LR_REPLY_HEADER: [u8; 23] = [
    FRAME_LR, 0x02, 0x01, 0x06, 0x01, 0x00, 0x00, 0x00, 0x00, 0xFF, 0x02, 0x01, 0x02, 0x03, 0x01,
    0x01, 0x04, 0x02, 0x40, 0x00, 0x08, 0x01, 0x03,
];

/// User-initiated disconnect, per the MNP LD reason table.
const LD_REASON_USER: u8 = 255;

/// Resend the unacknowledged LT frame after this long.
const RETRANSMIT_US: u32 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Negotiating,
    Connected,
}

/// A queued outbound control frame.
#[derive(Debug, Clone, Copy)]
enum CtrlJob {
    Lr,
    La { seq: u8 },
    Ld { reason: u8 },
}

/// In-pool payload on its way to the Dock engine.
struct DockDelivery {
    ix: FrameIx,
    pos: usize,
    start_sent: bool,
}

pub struct MnpFilter {
    in_pool: FramePool,
    out_pool: FramePool,
    receiver: MnpReceiver,
    sender: MnpSender,
    state: SessionState,
    /// Last in-sequence LT number accepted from the peer.
    in_seq: u8,
    /// Last LT sequence number we transmitted.
    out_seq: u8,

    ctrl_jobs: VecDeque<CtrlJob>,
    lt_jobs: VecDeque<FrameIx>,
    /// Frame currently on the wire (out-pool index, is_lt).
    active_tx: Option<(FrameIx, bool)>,
    /// Sent LT frame waiting for its LA.
    awaiting_ack: Option<FrameIx>,
    retransmit_us: u32,

    dock_jobs: VecDeque<FrameIx>,
    delivery: Option<DockDelivery>,
    /// Out-pool frame being filled with Dock payload.
    building_lt: Option<FrameIx>,

    /// Byte stream toward the handheld.
    out: Option<PipeRef>,
    /// Events toward the Dock engine.
    dock_out: Option<PipeRef>,
}

impl MnpFilter {
    pub fn new() -> Rc<RefCell<MnpFilter>> {
        Rc::new(RefCell::new(MnpFilter {
            in_pool: FramePool::new(),
            out_pool: FramePool::new(),
            receiver: MnpReceiver::new(),
            sender: MnpSender::new(),
            state: SessionState::Disconnected,
            in_seq: 0,
            out_seq: 0,
            ctrl_jobs: VecDeque::new(),
            lt_jobs: VecDeque::new(),
            active_tx: None,
            awaiting_ack: None,
            retransmit_us: 0,
            dock_jobs: VecDeque::new(),
            delivery: None,
            building_lt: None,
            out: None,
            dock_out: None,
        }))
    }

    /// The pipe the Dock engine writes into.
    pub fn dock_port(filter: &Rc<RefCell<MnpFilter>>) -> PipeRef {
        Rc::new(RefCell::new(DockPort(filter.clone())))
    }

    pub fn set_dock_out(&mut self, out: PipeRef) {
        self.dock_out = Some(out);
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    // -- Dock side ---------------------------------------------------

    fn dock_send(&mut self, event: Event) -> SendResult {
        match event {
            Event::Data(byte) => {
                if self.state != SessionState::Connected {
                    return SendResult::Rejected;
                }
                let ix = match self.building_lt {
                    Some(ix) => ix,
                    None => match self.out_pool.acquire() {
                        Some(ix) => {
                            self.building_lt = Some(ix);
                            ix
                        }
                        None => return SendResult::Rejected,
                    },
                };
                let frame = self.out_pool.get_mut(ix);
                let _ = frame.data.push(byte);
                if frame.data.len() >= MAX_LT_PAYLOAD {
                    self.flush_building_lt();
                }
                SendResult::Ok
            }
            Event::Mnp(MnpEvent::FrameStart, _) => SendResult::Ok,
            Event::Mnp(MnpEvent::FrameEnd, _) => {
                self.flush_building_lt();
                SendResult::Ok
            }
            _ => SendResult::OK_NOT_HANDLED,
        }
    }

    /// Seal the LT frame under construction and queue it for sending.
    fn flush_building_lt(&mut self) {
        let Some(ix) = self.building_lt.take() else {
            return;
        };
        if self.out_pool.get(ix).data.is_empty() {
            self.out_pool.release(ix);
            return;
        }
        self.out_seq = self.out_seq.wrapping_add(1);
        let seq = self.out_seq;
        let frame = self.out_pool.get_mut(ix);
        let _ = frame.header.push(FRAME_LT);
        let _ = frame.header.push(seq);
        frame.prepare_to_send();
        self.lt_jobs.push_back(ix);
    }

    // -- Newton side -------------------------------------------------

    fn handle_frame(&mut self, ix: FrameIx) {
        match self.in_pool.get(ix).frame_type() {
            FRAME_LR => {
                // A new LR can arrive in any state; renegotiate.
                self.in_pool.release(ix);
                if self.state != SessionState::Disconnected {
                    self.drop_session();
                }
                log::info!("MNP: negotiating");
                self.state = SessionState::Negotiating;
                self.notify_dock(MnpEvent::Negotiating);
                self.ctrl_jobs.push_back(CtrlJob::Lr);
            }
            FRAME_LD => {
                log::info!("MNP: disconnected by peer");
                self.in_pool.release(ix);
                self.drop_session();
                self.state = SessionState::Disconnected;
                self.notify_dock(MnpEvent::Disconnected);
            }
            FRAME_LT => self.handle_lt(ix),
            FRAME_LA => self.handle_la(ix),
            _ => unreachable!("receiver only delivers known frame types"),
        }
    }

    fn handle_lt(&mut self, ix: FrameIx) {
        if self.state != SessionState::Connected {
            log::debug!("MNP: LT while not connected");
            self.in_pool.release(ix);
            self.ctrl_jobs.push_back(CtrlJob::Ld {
                reason: LD_REASON_USER,
            });
            return;
        }
        let frame = self.in_pool.get(ix);
        let seq = match frame.header.len() {
            2 => frame.header[1],
            4 => frame.header[3],
            n => {
                log::debug!("MNP: unexpected LT header size {n}");
                self.in_pool.release(ix);
                return;
            }
        };
        if seq == self.in_seq.wrapping_add(1) {
            self.in_seq = seq;
            self.ctrl_jobs.push_back(CtrlJob::La { seq: self.in_seq });
            self.dock_jobs.push_back(ix);
        } else {
            // Out of sequence: acknowledge the last good frame and let
            // the peer retransmit.
            log::debug!("MNP: LT seq {seq}, expected {}", self.in_seq.wrapping_add(1));
            self.ctrl_jobs.push_back(CtrlJob::La { seq: self.in_seq });
            self.in_pool.release(ix);
        }
    }

    fn handle_la(&mut self, ix: FrameIx) {
        let frame = self.in_pool.get(ix);
        // Short LA `05 seq credit` or the long optimised-format header.
        let seq = match frame.header.len() {
            3 => frame.header[1],
            7 => frame.header[3],
            n => {
                log::debug!("MNP: unexpected LA header size {n}");
                self.in_pool.release(ix);
                return;
            }
        };
        self.in_pool.release(ix);
        match self.state {
            SessionState::Negotiating => {
                self.state = SessionState::Connected;
                self.out_seq = seq;
                self.retransmit_us = 0;
                log::info!("MNP: connected");
                self.notify_dock(MnpEvent::Connected);
            }
            SessionState::Connected => {
                if let Some(ack_ix) = self.awaiting_ack.take() {
                    let sent_seq = self.out_pool.get(ack_ix).header[1];
                    if seq == sent_seq {
                        self.out_pool.release(ack_ix);
                    } else {
                        log::debug!("MNP: LA seq {seq} != {sent_seq}, resending");
                        self.lt_jobs.push_front(ack_ix);
                    }
                    self.retransmit_us = 0;
                }
            }
            SessionState::Disconnected => {}
        }
    }

    /// Tear down all link state atomically (within this tick).
    fn drop_session(&mut self) {
        self.in_pool.release_all();
        self.out_pool.release_all();
        self.ctrl_jobs.clear();
        self.lt_jobs.clear();
        self.dock_jobs.clear();
        self.active_tx = None;
        self.awaiting_ack = None;
        self.building_lt = None;
        self.delivery = None;
        self.retransmit_us = 0;
        self.in_seq = 0;
        self.out_seq = 0;
        self.receiver = MnpReceiver::new();
        self.sender = MnpSender::new();
    }

    fn notify_dock(&mut self, event: MnpEvent) {
        let _ = send_to(&self.dock_out, Event::Mnp(event, 0));
    }

    // -- Transmit scheduling -----------------------------------------

    fn start_next_job(&mut self) {
        if self.active_tx.is_some() {
            return;
        }
        if let Some(job) = self.ctrl_jobs.front().copied() {
            let Some(ix) = self.out_pool.acquire() else {
                return; // pool dry; retry next tick
            };
            self.ctrl_jobs.pop_front();
            let frame = self.out_pool.get_mut(ix);
            match job {
                CtrlJob::Lr => {
                    let _ = frame.header.extend_from_slice(&LR_REPLY_HEADER);
                }
                CtrlJob::La { seq } => {
                    let _ = frame.header.extend_from_slice(&[FRAME_LA, seq, 1]);
                }
                CtrlJob::Ld { reason } => {
                    let _ = frame.header.extend_from_slice(&[FRAME_LD, 1, 1, reason]);
                }
            }
            frame.prepare_to_send();
            self.active_tx = Some((ix, false));
            return;
        }
        // Stop-and-wait: no new LT while one is unacknowledged.
        if self.awaiting_ack.is_none() {
            if let Some(ix) = self.lt_jobs.pop_front() {
                self.active_tx = Some((ix, true));
            }
        }
    }

    fn pump_tx(&mut self) {
        self.start_next_job();
        while let Some((ix, is_lt)) = self.active_tx {
            match self.sender.pump(self.out_pool.get(ix), &self.out) {
                TxProgress::Blocked => break,
                TxProgress::Done => {
                    self.active_tx = None;
                    if is_lt {
                        self.awaiting_ack = Some(ix);
                        self.retransmit_us = 0;
                    } else {
                        self.out_pool.release(ix);
                    }
                    self.start_next_job();
                }
            }
        }
    }

    fn pump_dock_delivery(&mut self) {
        loop {
            if self.delivery.is_none() {
                let Some(ix) = self.dock_jobs.pop_front() else {
                    return;
                };
                self.delivery = Some(DockDelivery {
                    ix,
                    pos: 0,
                    start_sent: false,
                });
            }
            let Some(delivery) = self.delivery.as_mut() else {
                return;
            };
            if !delivery.start_sent {
                if send_to(&self.dock_out, Event::Mnp(MnpEvent::FrameStart, 0)).is_rejected() {
                    return;
                }
                delivery.start_sent = true;
            }
            while delivery.pos < self.in_pool.get(delivery.ix).data.len() {
                let byte = self.in_pool.get(delivery.ix).data[delivery.pos];
                if send_to(&self.dock_out, Event::Data(byte)).is_rejected() {
                    return;
                }
                delivery.pos += 1;
            }
            if send_to(&self.dock_out, Event::Mnp(MnpEvent::FrameEnd, 0)).is_rejected() {
                return;
            }
            let ix = delivery.ix;
            self.delivery = None;
            self.in_pool.release(ix);
        }
    }

    fn check_retransmit(&mut self, cycle_us: u32) {
        let Some(ix) = self.awaiting_ack else {
            self.retransmit_us = 0;
            return;
        };
        self.retransmit_us = self.retransmit_us.saturating_add(cycle_us);
        if self.retransmit_us >= RETRANSMIT_US {
            log::debug!("MNP: LA timeout, resending LT {}", self.out_pool.get(ix).header[1]);
            self.awaiting_ack = None;
            self.lt_jobs.push_front(ix);
            self.retransmit_us = 0;
        }
    }
}

impl Pipe for MnpFilter {
    /// Byte stream arriving from the handheld.
    fn send(&mut self, event: Event) -> SendResult {
        match event {
            Event::Data(byte) => match self.receiver.push_byte(byte, &mut self.in_pool) {
                RxOutcome::Consumed => SendResult::Ok,
                RxOutcome::Rejected => SendResult::Rejected,
                RxOutcome::Frame(ix) => {
                    self.handle_frame(ix);
                    SendResult::Ok
                }
            },
            _ => SendResult::OK_NOT_HANDLED,
        }
    }

    fn tick(&mut self, cycle_us: u32) -> SendResult {
        self.check_retransmit(cycle_us);
        self.pump_tx();
        self.pump_dock_delivery();
        SendResult::Ok
    }

    fn set_out(&mut self, out: PipeRef) {
        self.out = Some(out);
    }
}

struct DockPort(Rc<RefCell<MnpFilter>>);

impl Pipe for DockPort {
    fn send(&mut self, event: Event) -> SendResult {
        self.0.borrow_mut().dock_send(event)
    }
    fn set_out(&mut self, out: PipeRef) {
        self.0.borrow_mut().set_dock_out(out);
    }
}
