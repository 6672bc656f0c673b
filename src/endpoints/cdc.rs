//! The USB CDC-ACM endpoint facing the host.
//!
//! The driver buffers in both directions; received bytes are peeked
//! and only consumed once the pipe accepts them, so downstream
//! back-pressure reaches the USB buffer directly. Host line-coding
//! changes propagate into the graph as `SetBitrate`, DTR changes as
//! `Uart` line events. Written bytes are flushed after a short
//! timeout in case the driver's own threshold flush does not fire.

use crate::event::{Event, LineState, SendResult};
use crate::pipe::{send_to, Pipe, PipeRef};
use crate::status::{AppStatus, StatusRef};
use super::uart::Busy;
use alloc::boxed::Box;

/// Flush pending transmit data after this long without a write.
const FLUSH_TIMEOUT_US: u32 = 1000;

/// Asynchronous notifications from the USB stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdcLineEvent {
    /// The host changed the line coding.
    Bitrate(u32),
    /// The host raised or dropped DTR.
    Dtr(bool),
}

/// Platform USB CDC access.
pub trait CdcDriver {
    fn try_write(&mut self, byte: u8) -> Result<(), Busy>;
    /// Next received byte without consuming it.
    fn peek(&mut self) -> Option<u8>;
    /// Consume the byte last returned by `peek`.
    fn consume(&mut self);
    fn flush(&mut self);
    /// Drain one queued line event, if any.
    fn poll_line_event(&mut self) -> Option<CdcLineEvent>;
}

pub struct CdcEndpoint {
    driver: Box<dyn CdcDriver>,
    tx_pending: u32,
    flush_timeout_us: u32,
    status: Option<StatusRef>,
    out: Option<PipeRef>,
}

impl CdcEndpoint {
    pub fn new(driver: Box<dyn CdcDriver>) -> CdcEndpoint {
        CdcEndpoint {
            driver,
            tx_pending: 0,
            flush_timeout_us: 0,
            status: None,
            out: None,
        }
    }

    pub fn link_status(&mut self, status: StatusRef) {
        self.status = Some(status);
    }

    fn handle_line_event(&mut self, line_event: CdcLineEvent) {
        match line_event {
            CdcLineEvent::Bitrate(rate) => {
                log::info!("CDC: host set {rate} baud");
                // Low frequency; a rejecting pipe would only drop a
                // repeat of the same setting.
                let _ = send_to(&self.out, Event::bitrate(rate));
            }
            CdcLineEvent::Dtr(asserted) => {
                log::info!("CDC: DTR {}", if asserted { "up" } else { "down" });
                if let Some(status) = &self.status {
                    status.borrow_mut().set(if asserted {
                        AppStatus::UsbConnected
                    } else {
                        AppStatus::UsbReady
                    });
                }
                let _ = send_to(
                    &self.out,
                    Event::Uart(LineState::Dtr, asserted as u16),
                );
            }
        }
    }
}

impl Pipe for CdcEndpoint {
    fn send(&mut self, event: Event) -> SendResult {
        match event {
            Event::Data(byte) => match self.driver.try_write(byte) {
                Ok(()) => {
                    if self.tx_pending == 0 {
                        self.flush_timeout_us = FLUSH_TIMEOUT_US;
                    }
                    self.tx_pending += 1;
                    SendResult::Ok
                }
                Err(Busy) => SendResult::Rejected,
            },
            // Rate changes originate at the host on this side, and
            // delays only matter toward the handheld.
            _ => SendResult::Ok,
        }
    }

    fn tick(&mut self, cycle_us: u32) -> SendResult {
        while let Some(line_event) = self.driver.poll_line_event() {
            self.handle_line_event(line_event);
        }

        if let Some(byte) = self.driver.peek() {
            if send_to(&self.out, Event::Data(byte)).is_ok() {
                self.driver.consume();
            }
        }

        if self.tx_pending > 0 {
            if self.flush_timeout_us <= cycle_us {
                self.driver.flush();
                self.tx_pending = 0;
                self.flush_timeout_us = 0;
            } else {
                self.flush_timeout_us -= cycle_us;
            }
        }
        SendResult::Ok
    }

    fn set_out(&mut self, out: PipeRef) {
        self.out = Some(out);
    }
}
