//! In-memory stand-ins for the dongle's hardware collaborators plus
//! MNP wire helpers, shared by the integration tests.

// Each test binary uses its own slice of these helpers.
#![allow(dead_code)]

use crabdock::bridge::Bridge;
use crabdock::endpoints::cdc::{CdcDriver, CdcLineEvent};
use crabdock::endpoints::sdcard::{DirEntry, EntryAttr, SdCardDriver, SdError};
use crabdock::endpoints::uart::{Busy, UartDriver};
use crabdock::filters::mnp::frame::FCS;
use crabdock::sched::Clock;
use crabdock::settings::{SettingsStore, StoreError, PAGE_SIZE};
use crabdock::status::{LedColor, StatusLamp};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

// -- Clock -----------------------------------------------------------

pub struct StepClock {
    now: u64,
    pub step: u64,
}

impl StepClock {
    pub fn new(step: u64) -> StepClock {
        StepClock { now: 0, step }
    }
}

#[derive(Clone)]
pub struct SharedClock(pub Rc<RefCell<StepClock>>);

impl Clock for SharedClock {
    fn now_us(&mut self) -> u64 {
        let mut clock = self.0.borrow_mut();
        clock.now += clock.step;
        clock.now
    }
}

// -- Serial ports ----------------------------------------------------

#[derive(Default)]
pub struct FakeUart {
    pub rx: VecDeque<u8>,
    pub tx: Vec<u8>,
    pub bitrate: Option<u32>,
    pub flow: Option<bool>,
}

#[derive(Clone)]
pub struct SharedUart(pub Rc<RefCell<FakeUart>>);

impl UartDriver for SharedUart {
    fn try_send(&mut self, byte: u8) -> Result<(), Busy> {
        self.0.borrow_mut().tx.push(byte);
        Ok(())
    }
    fn try_recv(&mut self) -> Option<u8> {
        self.0.borrow_mut().rx.pop_front()
    }
    fn set_bitrate(&mut self, rate: u32) {
        self.0.borrow_mut().bitrate = Some(rate);
    }
    fn set_flow_pin(&mut self, ready: bool) {
        self.0.borrow_mut().flow = Some(ready);
    }
}

#[derive(Default)]
pub struct FakeCdc {
    pub rx: VecDeque<u8>,
    pub tx: Vec<u8>,
    pub line_events: VecDeque<CdcLineEvent>,
}

#[derive(Clone)]
pub struct SharedCdc(pub Rc<RefCell<FakeCdc>>);

impl CdcDriver for SharedCdc {
    fn try_write(&mut self, byte: u8) -> Result<(), Busy> {
        self.0.borrow_mut().tx.push(byte);
        Ok(())
    }
    fn peek(&mut self) -> Option<u8> {
        self.0.borrow().rx.front().copied()
    }
    fn consume(&mut self) {
        self.0.borrow_mut().rx.pop_front();
    }
    fn flush(&mut self) {}
    fn poll_line_event(&mut self) -> Option<CdcLineEvent> {
        self.0.borrow_mut().line_events.pop_front()
    }
}

// -- Storage card ----------------------------------------------------

pub struct FakeSd {
    pub label: String,
    pub entries: Vec<DirEntry>,
    pub files: Vec<(String, Vec<u8>)>,
    pub chdirs: Vec<String>,
    dir_pos: usize,
    open: Option<(usize, usize)>,
}

impl FakeSd {
    pub fn new() -> FakeSd {
        FakeSd {
            label: String::from("TESTCARD"),
            entries: Vec::new(),
            files: Vec::new(),
            chdirs: Vec::new(),
            dir_pos: 0,
            open: None,
        }
    }

    pub fn with_package(name: &str, contents: Vec<u8>) -> FakeSd {
        let mut sd = FakeSd::new();
        sd.entries.push(DirEntry {
            name: name.to_string(),
            attr: EntryAttr::empty(),
        });
        sd.files.push((name.to_string(), contents));
        sd
    }
}

impl SdCardDriver for FakeSd {
    fn label(&mut self) -> Result<String, SdError> {
        Ok(self.label.clone())
    }
    fn chdir(&mut self, path: &str) -> Result<(), SdError> {
        self.chdirs.push(path.to_string());
        Ok(())
    }
    fn open_dir(&mut self) -> Result<(), SdError> {
        self.dir_pos = 0;
        Ok(())
    }
    fn read_dir(&mut self) -> Result<Option<DirEntry>, SdError> {
        let entry = self.entries.get(self.dir_pos).cloned();
        self.dir_pos += 1;
        Ok(entry)
    }
    fn close_dir(&mut self) {}
    fn open_file(&mut self, name: &str) -> Result<(), SdError> {
        match self.files.iter().position(|(n, _)| n == name) {
            Some(index) => {
                self.open = Some((index, 0));
                Ok(())
            }
            None => Err(SdError::NoFile),
        }
    }
    fn file_size(&mut self) -> u32 {
        match self.open {
            Some((index, _)) => self.files[index].1.len() as u32,
            None => 0,
        }
    }
    fn read_file(&mut self, buf: &mut [u8]) -> Result<usize, SdError> {
        let Some((index, pos)) = self.open.as_mut() else {
            return Err(SdError::NoFile);
        };
        let data = &self.files[*index].1;
        let n = buf.len().min(data.len() - *pos);
        buf[..n].copy_from_slice(&data[*pos..*pos + n]);
        *pos += n;
        Ok(n)
    }
    fn close_file(&mut self) {
        self.open = None;
    }
}

// -- Settings store and lamp -----------------------------------------

pub struct RamStore {
    pub pages: Vec<[u8; PAGE_SIZE]>,
}

impl RamStore {
    pub fn new() -> RamStore {
        RamStore {
            pages: vec![[0xFF; PAGE_SIZE]; 16],
        }
    }
}

impl SettingsStore for RamStore {
    fn read_page(&mut self, page: u8, buf: &mut [u8; PAGE_SIZE]) -> Result<(), StoreError> {
        *buf = self.pages[page as usize];
        Ok(())
    }
    fn erase(&mut self) -> Result<(), StoreError> {
        self.pages.iter_mut().for_each(|p| *p = [0xFF; PAGE_SIZE]);
        Ok(())
    }
    fn program_page(&mut self, page: u8, data: &[u8; PAGE_SIZE]) -> Result<(), StoreError> {
        self.pages[page as usize] = *data;
        Ok(())
    }
}

pub struct FakeLamp;

impl StatusLamp for FakeLamp {
    fn set_color(&mut self, _color: LedColor) {}
}

// -- MNP wire helpers ------------------------------------------------

pub const LT: u8 = 4;
pub const LA: u8 = 5;
pub const LD: u8 = 2;

fn stuff_dle(out: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        out.push(b);
        if b == 0x10 {
            out.push(0x10);
        }
    }
}

/// Frame a header and payload the way the handheld would.
pub fn mnp_frame(header: &[u8], data: &[u8]) -> Vec<u8> {
    let mut digest = FCS.digest();
    digest.update(&[header.len() as u8]);
    digest.update(header);
    digest.update(data);
    digest.update(&[0x03]);
    let crc = digest.finalize();

    let mut wire = vec![0x16, 0x10, 0x02, header.len() as u8];
    stuff_dle(&mut wire, header);
    stuff_dle(&mut wire, data);
    wire.push(0x10);
    wire.push(0x03);
    wire.push(crc as u8);
    wire.push((crc >> 8) as u8);
    wire
}

pub fn lt_frame(seq: u8, payload: &[u8]) -> Vec<u8> {
    mnp_frame(&[LT, seq], payload)
}

pub fn la_frame(seq: u8) -> Vec<u8> {
    mnp_frame(&[LA, seq, 1], &[])
}

pub fn ld_frame() -> Vec<u8> {
    mnp_frame(&[LD, 1, 1, 255], &[])
}

/// The LR a MessagePad sends to start negotiation.
pub fn newton_lr() -> Vec<u8> {
    mnp_frame(
        &[
            0x01, 0x02, 0x01, 0x06, 0x01, 0x00, 0x00, 0x00, 0x00, 0xFF, 0x02, 0x01, 0x02, 0x03,
            0x01, 0x01, 0x04, 0x02, 0x40, 0x00, 0x08, 0x01, 0x03,
        ],
        &[],
    )
}

/// A Dock command as it appears in the LT payload stream.
pub fn dock_cmd(verb: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let aligned = (payload.len() + 3) & !3;
    let mut bytes = Vec::with_capacity(16 + aligned);
    bytes.extend_from_slice(b"newtdock");
    bytes.extend_from_slice(verb);
    bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    bytes.extend_from_slice(payload);
    bytes.resize(16 + aligned, 0);
    bytes
}

/// Reassembles MNP frames from the dongle's transmit stream.
#[derive(Default)]
pub struct FrameScanner {
    state: u8,
    escaping: bool,
    header_len: u8,
    header: Vec<u8>,
    data: Vec<u8>,
    crc_lo: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub header: Vec<u8>,
    pub data: Vec<u8>,
}

impl WireFrame {
    pub fn frame_type(&self) -> u8 {
        self.header[0]
    }
}

impl FrameScanner {
    pub fn push(&mut self, byte: u8) -> Option<WireFrame> {
        match self.state {
            0 => {
                if byte == 0x16 {
                    self.state = 1;
                }
            }
            1 => self.state = if byte == 0x10 { 2 } else { 0 },
            2 => {
                if byte == 0x02 {
                    self.header.clear();
                    self.data.clear();
                    self.escaping = false;
                    self.state = 3;
                } else {
                    self.state = 0;
                }
            }
            3 => {
                self.header_len = byte;
                self.state = 4;
            }
            4 => {
                if byte == 0x10 && !self.escaping {
                    self.escaping = true;
                    return None;
                }
                self.escaping = false;
                self.header.push(byte);
                if self.header.len() == self.header_len as usize {
                    self.state = 5;
                }
            }
            5 => {
                if byte == 0x10 {
                    self.state = 6;
                } else {
                    self.data.push(byte);
                }
            }
            6 => {
                if byte == 0x10 {
                    self.data.push(0x10);
                    self.state = 5;
                } else {
                    assert_eq!(byte, 0x03, "malformed frame trailer from the dongle");
                    self.state = 7;
                }
            }
            7 => {
                self.crc_lo = byte;
                self.state = 8;
            }
            _ => {
                self.state = 0;
                let frame = WireFrame {
                    header: std::mem::take(&mut self.header),
                    data: std::mem::take(&mut self.data),
                };
                let mut digest = FCS.digest();
                digest.update(&[frame.header.len() as u8]);
                digest.update(&frame.header);
                digest.update(&frame.data);
                digest.update(&[0x03]);
                let expect = digest.finalize();
                let got = u16::from_le_bytes([self.crc_lo, byte]);
                assert_eq!(got, expect, "dongle emitted a bad CRC");
                return Some(frame);
            }
        }
        None
    }
}

// -- Bridge harness --------------------------------------------------

pub struct Harness {
    pub bridge: Bridge,
    pub uart: Rc<RefCell<FakeUart>>,
    pub cdc: Rc<RefCell<FakeCdc>>,
    pub sd: Rc<RefCell<FakeSd>>,
    scanner: FrameScanner,
    tx_seen: usize,
}

impl Harness {
    pub fn new(step_us: u64) -> Harness {
        Harness::with_sd(FakeSd::new(), step_us)
    }

    pub fn with_sd(sd: FakeSd, step_us: u64) -> Harness {
        let uart = Rc::new(RefCell::new(FakeUart::default()));
        let cdc = Rc::new(RefCell::new(FakeCdc::default()));
        let sd = Rc::new(RefCell::new(sd));
        let clock = Rc::new(RefCell::new(StepClock::new(step_us)));
        let bridge = Bridge::new(
            Box::new(SharedUart(uart.clone())),
            Box::new(SharedCdc(cdc.clone())),
            sd.clone(),
            Some(Box::new(RamStore::new())),
            Box::new(FakeLamp),
            Box::new(SharedClock(clock)),
        );
        Harness {
            bridge,
            uart,
            cdc,
            sd,
            scanner: FrameScanner::default(),
            tx_seen: 0,
        }
    }

    pub fn feed_uart(&self, bytes: &[u8]) {
        self.uart.borrow_mut().rx.extend(bytes);
    }

    pub fn run(&mut self, rounds: u32) {
        self.bridge.run_rounds(rounds);
    }

    /// New complete frames on the UART transmit side.
    pub fn harvest_frames(&mut self) -> Vec<WireFrame> {
        let tx = self.uart.borrow().tx.clone();
        let mut frames = Vec::new();
        for &byte in &tx[self.tx_seen..] {
            if let Some(frame) = self.scanner.push(byte) {
                frames.push(frame);
            }
        }
        self.tx_seen = tx.len();
        frames
    }

    /// Run until the dongle goes quiet, acknowledging every LT frame
    /// it sends. Returns all frames transmitted in the meantime.
    pub fn drive(&mut self) -> Vec<WireFrame> {
        let mut collected = Vec::new();
        let mut idle_passes = 0;
        while idle_passes < 8 {
            self.run(40);
            let frames = self.harvest_frames();
            if frames.is_empty() && self.uart.borrow().rx.is_empty() {
                idle_passes += 1;
            } else {
                idle_passes = 0;
            }
            for frame in frames {
                if frame.frame_type() == LT {
                    self.feed_uart(&la_frame(frame.header[1]));
                }
                collected.push(frame);
            }
        }
        collected
    }

    /// Bring the MNP link up. Consumes the LR reply and the first
    /// transmitted frames.
    pub fn connect(&mut self) {
        self.feed_uart(&newton_lr());
        let frames = self.drive();
        assert!(
            frames.iter().any(|f| f.frame_type() == 1),
            "no LR reply seen"
        );
        self.feed_uart(&la_frame(0));
        self.drive();
        assert!(self.bridge.dock.borrow().is_connected());
    }

    /// The concatenated payload stream of the given frames' LTs.
    pub fn dock_stream(frames: &[WireFrame]) -> Vec<u8> {
        frames
            .iter()
            .filter(|f| f.frame_type() == LT)
            .flat_map(|f| f.data.iter().copied())
            .collect()
    }
}
