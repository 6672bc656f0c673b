//! MNP frame buffers and the fixed frame pool.
//!
//! A frame is a header (first octet is the frame type), an optional
//! payload (only LT frames carry one) and a CRC-16/ARC computed over
//! the header-length octet, the header, the payload and the closing
//! ETX. Frames live in a preallocated pool of four; ownership moves
//! between the receiver, the session logic and the sender, and the
//! last holder releases the slot. Nothing is allocated in the steady
//! state.

use crc::{Crc, CRC_16_ARC};
use heapless::Vec;

pub const FRAME_LR: u8 = 1;
pub const FRAME_LD: u8 = 2;
pub const FRAME_LT: u8 = 4;
pub const FRAME_LA: u8 = 5;

pub const SYN: u8 = 0x16;
pub const DLE: u8 = 0x10;
pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;

/// Header lengths 0 and 255 are rejected on the wire.
pub const MAX_HEADER: usize = 254;
/// Receive-side payload tolerance.
pub const MAX_DATA: usize = 1024;
/// Outbound LT frames are flushed at this payload size.
pub const MAX_LT_PAYLOAD: usize = 256;

pub const POOL_SIZE: usize = 4;

/// The MNP frame check sequence (polynomial x^16+x^15+x^2+1, init 0).
pub const FCS: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

#[derive(Debug)]
pub struct Frame {
    pub header: Vec<u8, MAX_HEADER>,
    pub data: Vec<u8, MAX_DATA>,
    /// Header length as declared on the wire (receive side).
    pub header_size: u8,
    /// CRC as received, or as computed by [`Frame::prepare_to_send`].
    pub crc: u16,
    in_use: bool,
}

impl Frame {
    const fn new() -> Frame {
        Frame {
            header: Vec::new(),
            data: Vec::new(),
            header_size: 0,
            crc: 0,
            in_use: false,
        }
    }

    pub fn clear(&mut self) {
        self.header.clear();
        self.data.clear();
        self.header_size = 0;
        self.crc = 0;
    }

    pub fn frame_type(&self) -> u8 {
        self.header.first().copied().unwrap_or(0)
    }

    pub fn calculate_crc(&self) -> u16 {
        let mut digest = FCS.digest();
        digest.update(&[self.header.len() as u8]);
        digest.update(&self.header);
        digest.update(&self.data);
        digest.update(&[ETX]);
        digest.finalize()
    }

    /// Finalize an outbound frame: record the header size and CRC.
    pub fn prepare_to_send(&mut self) {
        self.header_size = self.header.len() as u8;
        self.crc = self.calculate_crc();
    }
}

/// Index of a frame within a pool.
pub type FrameIx = u8;

pub struct FramePool {
    frames: [Frame; POOL_SIZE],
}

impl FramePool {
    pub const fn new() -> FramePool {
        FramePool {
            frames: [Frame::new(), Frame::new(), Frame::new(), Frame::new()],
        }
    }

    /// Take a free slot, cleared and marked in use.
    pub fn acquire(&mut self) -> Option<FrameIx> {
        for (ix, frame) in self.frames.iter_mut().enumerate() {
            if !frame.in_use {
                frame.in_use = true;
                frame.clear();
                return Some(ix as FrameIx);
            }
        }
        None
    }

    /// Return a slot to the pool. Releasing a free slot is a
    /// programming error.
    pub fn release(&mut self, ix: FrameIx) {
        let frame = &mut self.frames[ix as usize];
        debug_assert!(frame.in_use, "double release of frame {ix}");
        frame.in_use = false;
    }

    pub fn release_all(&mut self) {
        for frame in &mut self.frames {
            frame.in_use = false;
        }
    }

    pub fn get(&self, ix: FrameIx) -> &Frame {
        &self.frames[ix as usize]
    }

    pub fn get_mut(&mut self, ix: FrameIx) -> &mut Frame {
        &mut self.frames[ix as usize]
    }

    pub fn in_use_count(&self) -> usize {
        self.frames.iter().filter(|f| f.in_use).count()
    }
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new()
    }
}
