//! Byte stream to frame: the MNP receive state machine.
//!
//! Frames arrive as SYN DLE STX, a length-prefixed header, an optional
//! payload terminated by DLE ETX, and a little-endian CRC. A 0x10
//! inside header or payload is DLE-stuffed on the wire and collapses to
//! a single octet here. Malformed input of any kind silently discards
//! the working frame and resynchronises on the next SYN; MNP relies on
//! the peer's retransmission, so no error crosses this boundary.

use super::frame::{FrameIx, FramePool, DLE, ETX, FRAME_LA, FRAME_LD, FRAME_LR, FRAME_LT, STX, SYN};

/// What became of one input byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxOutcome {
    /// Byte consumed; nothing to report.
    Consumed,
    /// No pool frame free; resubmit the same byte later.
    Rejected,
    /// A frame with a valid CRC is complete; ownership of the pool
    /// slot passes to the caller.
    Frame(FrameIx),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitForSyn,
    WaitForDle,
    WaitForStx,
    WaitForHdrSize,
    WaitForHdrType,
    WaitForHdrData,
    WaitForData,
    WaitForEtx,
    WaitForCrcLo,
    WaitForCrcHi,
}

pub struct MnpReceiver {
    state: State,
    frame: Option<FrameIx>,
    escaping_dle: bool,
    header_size: u8,
    crc_lo: u8,
}

impl MnpReceiver {
    pub const fn new() -> MnpReceiver {
        MnpReceiver {
            state: State::WaitForSyn,
            frame: None,
            escaping_dle: false,
            header_size: 0,
            crc_lo: 0,
        }
    }

    /// Feed one byte from the line.
    pub fn push_byte(&mut self, byte: u8, pool: &mut FramePool) -> RxOutcome {
        match self.state {
            State::WaitForSyn => {
                if byte == SYN {
                    self.state = State::WaitForDle;
                }
            }
            State::WaitForDle => {
                if byte == DLE {
                    self.state = State::WaitForStx;
                } else {
                    self.abort(pool, "expected DLE");
                }
            }
            State::WaitForStx => {
                if byte == STX {
                    // Accumulation starts here; apply back-pressure
                    // instead of losing the frame when the pool is dry.
                    match pool.acquire() {
                        Some(ix) => {
                            self.frame = Some(ix);
                            self.escaping_dle = false;
                            self.state = State::WaitForHdrSize;
                        }
                        None => return RxOutcome::Rejected,
                    }
                } else {
                    self.abort(pool, "expected STX");
                }
            }
            State::WaitForHdrSize => {
                if byte == 0 || byte == 0xFF {
                    self.abort(pool, "impossible header length");
                } else {
                    self.header_size = byte;
                    self.state = State::WaitForHdrType;
                }
            }
            State::WaitForHdrType => match byte {
                FRAME_LR | FRAME_LD | FRAME_LT | FRAME_LA => {
                    let frame = pool.get_mut(self.frame_ix());
                    frame.header_size = self.header_size;
                    let _ = frame.header.push(byte);
                    self.state = if self.header_size == 1 {
                        State::WaitForData
                    } else {
                        State::WaitForHdrData
                    };
                }
                _ => self.abort(pool, "unsupported frame type"),
            },
            State::WaitForHdrData => {
                if byte == DLE && !self.escaping_dle {
                    self.escaping_dle = true;
                } else if self.escaping_dle && byte != DLE {
                    self.abort(pool, "invalid DLE escape in header");
                } else {
                    self.escaping_dle = false;
                    let frame = pool.get_mut(self.frame_ix());
                    if frame.header.push(byte).is_err() {
                        self.abort(pool, "header overflow");
                        return RxOutcome::Consumed;
                    }
                    if frame.header.len() == self.header_size as usize {
                        self.state = State::WaitForData;
                    }
                }
            }
            State::WaitForData => {
                if byte == DLE {
                    self.state = State::WaitForEtx;
                } else {
                    self.push_data(byte, pool);
                }
            }
            State::WaitForEtx => {
                if byte == DLE {
                    // Stuffed escape: a literal 0x10 in the payload.
                    self.push_data(DLE, pool);
                    if self.state == State::WaitForEtx {
                        self.state = State::WaitForData;
                    }
                } else if byte == ETX {
                    self.state = State::WaitForCrcLo;
                } else {
                    self.abort(pool, "expected ETX");
                }
            }
            State::WaitForCrcLo => {
                self.crc_lo = byte;
                self.state = State::WaitForCrcHi;
            }
            State::WaitForCrcHi => {
                debug_assert!(self.frame.is_some(), "CRC state without a frame");
                let ix = self.frame.take().unwrap_or(0);
                self.state = State::WaitForSyn;
                let frame = pool.get_mut(ix);
                frame.crc = u16::from_le_bytes([self.crc_lo, byte]);
                if frame.calculate_crc() == frame.crc {
                    return RxOutcome::Frame(ix);
                }
                log::debug!(
                    "MNP rx: CRC mismatch {:#06x} != {:#06x}, frame dropped",
                    frame.crc,
                    frame.calculate_crc()
                );
                pool.release(ix);
            }
        }
        RxOutcome::Consumed
    }

    fn push_data(&mut self, byte: u8, pool: &mut FramePool) {
        let frame = pool.get_mut(self.frame_ix());
        if frame.data.push(byte).is_err() {
            self.abort(pool, "payload overflow");
        }
    }

    /// The frame being accumulated. States past WAIT_STX always hold one.
    fn frame_ix(&self) -> FrameIx {
        debug_assert!(self.frame.is_some(), "accumulating without a frame");
        self.frame.unwrap_or(0)
    }

    fn abort(&mut self, pool: &mut FramePool, reason: &str) {
        log::debug!("MNP rx: {reason}, resynchronising");
        if let Some(ix) = self.frame.take() {
            pool.release(ix);
        }
        self.escaping_dle = false;
        self.state = State::WaitForSyn;
    }
}
