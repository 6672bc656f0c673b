//! Frame to byte stream: the MNP transmit state machine.
//!
//! One frame is serialized at a time. Every phase advances only after
//! the output pipe accepts the corresponding byte; a rejection holds
//! the machine in place and the byte is offered again on the next
//! pump. Any 0x10 in the header-length octet, the header or the
//! payload is stuffed with a second 0x10.

use super::frame::{Frame, DLE, ETX, STX, SYN};
use crate::event::Event;
use crate::pipe::{send_to, PipeRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SendSyn,
    SendDle,
    SendStx,
    SendHdrSize,
    SendHdrSizeDle,
    SendHdrData,
    SendHdrDataDle,
    SendData,
    SendDataDle,
    SendDle2,
    SendEtx,
    SendCrcLo,
    SendCrcHi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxProgress {
    /// The output rejected a byte; call again next tick.
    Blocked,
    /// The whole frame including CRC is on the wire.
    Done,
}

pub struct MnpSender {
    state: State,
    cursor: usize,
}

impl MnpSender {
    pub const fn new() -> MnpSender {
        MnpSender {
            state: State::SendSyn,
            cursor: 0,
        }
    }

    /// Push as much of `frame` as the output accepts. The frame must
    /// have been finalized with [`Frame::prepare_to_send`].
    pub fn pump(&mut self, frame: &Frame, out: &Option<PipeRef>) -> TxProgress {
        loop {
            let byte = match self.state {
                State::SendSyn => SYN,
                State::SendDle | State::SendDle2 => DLE,
                State::SendStx => STX,
                State::SendHdrSize | State::SendHdrSizeDle => frame.header_size,
                State::SendHdrData | State::SendHdrDataDle => frame.header[self.cursor],
                State::SendData | State::SendDataDle => frame.data[self.cursor],
                State::SendEtx => ETX,
                State::SendCrcLo => frame.crc as u8,
                State::SendCrcHi => (frame.crc >> 8) as u8,
            };
            // The stuffing states resend the same value a second time.
            let on_wire = match self.state {
                State::SendHdrSizeDle | State::SendHdrDataDle | State::SendDataDle => DLE,
                _ => byte,
            };
            if send_to(out, Event::Data(on_wire)).is_rejected() {
                return TxProgress::Blocked;
            }
            self.state = match self.state {
                State::SendSyn => State::SendDle,
                State::SendDle => State::SendStx,
                State::SendStx => State::SendHdrSize,
                State::SendHdrSize => {
                    self.cursor = 0;
                    if frame.header_size == DLE {
                        State::SendHdrSizeDle
                    } else {
                        State::SendHdrData
                    }
                }
                State::SendHdrSizeDle => {
                    self.cursor = 0;
                    State::SendHdrData
                }
                State::SendHdrData | State::SendHdrDataDle => {
                    if self.state == State::SendHdrData && byte == DLE {
                        State::SendHdrDataDle
                    } else {
                        self.cursor += 1;
                        if self.cursor < frame.header.len() {
                            State::SendHdrData
                        } else {
                            self.cursor = 0;
                            if frame.data.is_empty() {
                                State::SendDle2
                            } else {
                                State::SendData
                            }
                        }
                    }
                }
                State::SendData | State::SendDataDle => {
                    if self.state == State::SendData && byte == DLE {
                        State::SendDataDle
                    } else {
                        self.cursor += 1;
                        if self.cursor < frame.data.len() {
                            State::SendData
                        } else {
                            State::SendDle2
                        }
                    }
                }
                State::SendDle2 => State::SendEtx,
                State::SendEtx => State::SendCrcLo,
                State::SendCrcLo => State::SendCrcHi,
                State::SendCrcHi => {
                    self.cursor = 0;
                    self.state = State::SendSyn;
                    return TxProgress::Done;
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SendResult;
    use crate::filters::mnp::frame::{FramePool, FRAME_LA, FRAME_LT};
    use crate::filters::mnp::rx::{MnpReceiver, RxOutcome};
    use crate::pipe::Pipe;
    use alloc::rc::Rc;
    use alloc::vec::Vec;
    use core::cell::RefCell;

    struct ByteSink {
        bytes: Vec<u8>,
        budget: usize,
    }

    impl Pipe for ByteSink {
        fn send(&mut self, event: Event) -> SendResult {
            match event {
                Event::Data(b) if self.budget > 0 => {
                    self.budget -= 1;
                    self.bytes.push(b);
                    SendResult::Ok
                }
                Event::Data(_) => SendResult::Rejected,
                _ => SendResult::Ok,
            }
        }
        fn set_out(&mut self, _out: PipeRef) {}
    }

    fn sink(budget: usize) -> Rc<RefCell<ByteSink>> {
        Rc::new(RefCell::new(ByteSink {
            bytes: Vec::new(),
            budget,
        }))
    }

    #[test]
    fn emits_framing_and_crc_for_la() {
        let out = sink(usize::MAX);
        let out_ref: PipeRef = out.clone();
        let mut pool = FramePool::new();
        let ix = pool.acquire().unwrap();
        let frame = pool.get_mut(ix);
        frame
            .header
            .extend_from_slice(&[FRAME_LA, 0x00, 0x01])
            .unwrap();
        frame.prepare_to_send();

        let mut tx = MnpSender::new();
        assert_eq!(tx.pump(pool.get(ix), &Some(out_ref)), TxProgress::Done);
        assert_eq!(
            out.borrow().bytes,
            [0x16, 0x10, 0x02, 0x03, 0x05, 0x00, 0x01, 0x10, 0x03, 0x05, 0x5D]
        );
    }

    #[test]
    fn rejection_holds_state_without_losing_bytes() {
        let out = sink(4);
        let out_ref: PipeRef = out.clone();
        let mut pool = FramePool::new();
        let ix = pool.acquire().unwrap();
        let frame = pool.get_mut(ix);
        frame
            .header
            .extend_from_slice(&[FRAME_LA, 0x07, 0x01])
            .unwrap();
        frame.prepare_to_send();

        let mut tx = MnpSender::new();
        assert_eq!(
            tx.pump(pool.get(ix), &Some(out_ref.clone())),
            TxProgress::Blocked
        );
        out.borrow_mut().budget = usize::MAX;
        assert_eq!(tx.pump(pool.get(ix), &Some(out_ref)), TxProgress::Done);

        let bytes = out.borrow().bytes.clone();
        assert_eq!(&bytes[..4], &[0x16, 0x10, 0x02, 0x03]);
        assert_eq!(bytes.len(), 11);
        // No duplicate from the retried byte.
        assert_eq!(bytes[4], FRAME_LA);
    }

    /// Invariants 1 and 7: anything the sender emits, the receiver
    /// reassembles byte-identically, stuffing included.
    #[test]
    fn sender_output_loops_back_through_receiver() {
        let out = sink(usize::MAX);
        let out_ref: PipeRef = out.clone();
        let mut pool = FramePool::new();
        let ix = pool.acquire().unwrap();
        let frame = pool.get_mut(ix);
        frame.header.extend_from_slice(&[FRAME_LT, 0x10]).unwrap();
        frame
            .data
            .extend_from_slice(&[0x00, 0x10, 0x10, 0x42, 0x10])
            .unwrap();
        frame.prepare_to_send();

        let mut tx = MnpSender::new();
        assert_eq!(tx.pump(pool.get(ix), &Some(out_ref)), TxProgress::Done);

        let mut rx = MnpReceiver::new();
        let mut rx_pool = FramePool::new();
        let mut got = None;
        for &b in &out.borrow().bytes {
            if let RxOutcome::Frame(rix) = rx.push_byte(b, &mut rx_pool) {
                got = Some(rix);
            }
        }
        let rix = got.expect("loopback frame did not parse");
        assert_eq!(rx_pool.get(rix).header, pool.get(ix).header);
        assert_eq!(rx_pool.get(rix).data, pool.get(ix).data);
    }
}
