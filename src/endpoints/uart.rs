//! The hardware UART endpoint facing the handheld.
//!
//! The driver trait is the thin seam to the platform serial port. The
//! endpoint polls it for received bytes, buffering the single pending
//! event a rejecting pipe leaves behind (the FIFO cannot be peeked, so
//! a read byte must not be lost). On the transmit side it honours CTS,
//! delay events and the high-water flow pin.

use crate::event::{DelayUnit, Event, SendResult, DEFAULT_BITRATE};
use crate::pipe::{send_to, Pipe, PipeRef};
use alloc::boxed::Box;

/// The peripheral cannot take a byte right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Busy;

/// Platform serial port access.
pub trait UartDriver {
    fn try_send(&mut self, byte: u8) -> Result<(), Busy>;
    fn try_recv(&mut self) -> Option<u8>;
    fn set_bitrate(&mut self, rate: u32);
    /// Drive the handshake line: `true` means we can take data.
    fn set_flow_pin(&mut self, ready: bool);
    /// The peer's handshake line; `true` when we may transmit.
    fn clear_to_send(&mut self) -> bool {
        true
    }
    /// True when the transmit FIFO has fully drained.
    fn tx_idle(&mut self) -> bool {
        true
    }
}

pub struct UartEndpoint {
    driver: Box<dyn UartDriver>,
    bitrate: u32,
    /// Byte read from hardware but not yet accepted downstream.
    pending: Option<Event>,
    tx_delay_us: u32,
    /// A delay starts counting only once the FIFO has drained.
    tx_wait_fifo_empty: bool,
    out: Option<PipeRef>,
}

impl UartEndpoint {
    pub fn new(driver: Box<dyn UartDriver>) -> UartEndpoint {
        UartEndpoint {
            driver,
            bitrate: DEFAULT_BITRATE,
            pending: None,
            tx_delay_us: 0,
            tx_wait_fifo_empty: false,
            out: None,
        }
    }

    fn add_delay(&mut self, usec: u32, chars: u32) {
        let mut total = usec;
        if chars > 0 {
            // Ten bit times per character: start, eight data, stop.
            total += (chars * 1_000_000 / self.bitrate) * 10;
        }
        if total > 0 {
            if self.tx_delay_us == 0 {
                self.tx_wait_fifo_empty = true;
            }
            self.tx_delay_us += total;
        }
    }
}

impl Pipe for UartEndpoint {
    fn send(&mut self, event: Event) -> SendResult {
        match event {
            Event::Data(byte) => {
                if self.tx_wait_fifo_empty {
                    if !self.driver.tx_idle() {
                        return SendResult::Rejected;
                    }
                    self.tx_wait_fifo_empty = false;
                }
                if self.tx_delay_us > 0 {
                    return SendResult::Rejected;
                }
                if !self.driver.clear_to_send() {
                    return SendResult::Rejected;
                }
                match self.driver.try_send(byte) {
                    Ok(()) => {
                        crate::logger::trace_byte(crate::logger::TraceDir::Out, byte);
                        SendResult::Ok
                    }
                    Err(Busy) => SendResult::Rejected,
                }
            }
            Event::SetBitrate(id) => {
                self.bitrate = Event::bitrate_value(id);
                self.driver.set_bitrate(self.bitrate);
                SendResult::Ok
            }
            Event::Delay(DelayUnit::Micros, n) => {
                self.add_delay(n as u32, 0);
                SendResult::Ok
            }
            Event::Delay(DelayUnit::Millis, n) => {
                self.add_delay(n as u32 * 1000, 0);
                SendResult::Ok
            }
            Event::Delay(DelayUnit::Chars, n) => {
                self.add_delay(0, n as u32);
                SendResult::Ok
            }
            Event::HighWater(on) => {
                // Drop the handshake line while the dongle is flooded.
                self.driver.set_flow_pin(!on);
                SendResult::Ok
            }
            _ => SendResult::OK_NOT_HANDLED,
        }
    }

    fn tick(&mut self, cycle_us: u32) -> SendResult {
        if self.tx_wait_fifo_empty && self.driver.tx_idle() {
            self.tx_wait_fifo_empty = false;
        }
        if !self.tx_wait_fifo_empty {
            self.tx_delay_us = self.tx_delay_us.saturating_sub(cycle_us);
        }

        if let Some(event) = self.pending {
            if send_to(&self.out, event).is_rejected() {
                return SendResult::Ok;
            }
            self.pending = None;
        }
        if let Some(byte) = self.driver.try_recv() {
            crate::logger::trace_byte(crate::logger::TraceDir::In, byte);
            let event = Event::Data(byte);
            if send_to(&self.out, event).is_rejected() {
                self.pending = Some(event);
            }
        }
        SendResult::Ok
    }

    fn set_out(&mut self, out: PipeRef) {
        self.out = Some(out);
    }
}
