//! End-of-frame pacing toward the Newton.
//!
//! The Newton cannot digest MNP frames that arrive back to back and
//! eventually hangs the connection; resynchronisation does not recover
//! it. This pipe watches the outbound byte stream for the end of an MNP
//! frame (DLE, ETX, CRC low, CRC high, with DLE-stuffing inside the
//! payload accounted for) and injects a `Delay` event after the last
//! CRC byte. The pause is `S300 + S301 * (10_000_000 / bitrate)`
//! microseconds; both registers live in the user settings.

use crate::event::{Event, SendResult, DEFAULT_BITRATE};
use crate::pipe::{send_to, Pipe, PipeRef};
use crate::settings::SettingsRef;

const DLE: u8 = 0x10;
const ETX: u8 = 0x03;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitForDle,
    WaitForEtx,
    WaitForCrcLo,
    WaitForCrcHi,
    /// The delay event was rejected downstream; retry before anything else.
    ResendDelay,
}

pub struct MnpThrottle {
    state: State,
    pending_delay: Event,
    bitrate: u32,
    absolute_delay_us: u32,
    num_char_delay: u32,
    settings: SettingsRef,
    out: Option<PipeRef>,
}

impl MnpThrottle {
    pub fn new(settings: SettingsRef) -> MnpThrottle {
        let data = settings.borrow().data;
        MnpThrottle {
            state: State::WaitForDle,
            pending_delay: Event::Delay(crate::event::DelayUnit::Micros, 0),
            bitrate: DEFAULT_BITRATE,
            absolute_delay_us: data.mnpt_absolute_delay,
            num_char_delay: data.mnpt_num_char_delay as u32,
            settings,
            out: None,
        }
    }

    fn frame_gap(&self) -> Event {
        Event::delay_us(self.absolute_delay_us + (self.num_char_delay * 10_000_000) / self.bitrate)
    }
}

impl Pipe for MnpThrottle {
    fn send(&mut self, event: Event) -> SendResult {
        if self.state == State::ResendDelay {
            if send_to(&self.out, self.pending_delay).is_ok() {
                self.state = State::WaitForDle;
            } else {
                return SendResult::Rejected;
            }
        }

        if let Event::SetBitrate(id) = event {
            self.bitrate = Event::bitrate_value(id);
        }

        let result = send_to(&self.out, event);
        if result.is_rejected() {
            return result;
        }

        if let Event::Data(byte) = event {
            match self.state {
                State::WaitForDle => {
                    if byte == DLE {
                        self.state = State::WaitForEtx;
                    }
                }
                State::WaitForEtx => {
                    // A second DLE is an escaped data byte, not a frame end.
                    self.state = if byte == ETX {
                        State::WaitForCrcLo
                    } else {
                        State::WaitForDle
                    };
                }
                State::WaitForCrcLo => self.state = State::WaitForCrcHi,
                State::WaitForCrcHi => {
                    self.pending_delay = self.frame_gap();
                    if send_to(&self.out, self.pending_delay).is_ok() {
                        self.state = State::WaitForDle;
                    } else {
                        self.state = State::ResendDelay;
                    }
                }
                State::ResendDelay => {}
            }
        }
        result
    }

    fn tick(&mut self, _cycle_us: u32) -> SendResult {
        // A held delay must not wait for the next data byte.
        if self.state == State::ResendDelay && send_to(&self.out, self.pending_delay).is_ok() {
            self.state = State::WaitForDle;
        }
        SendResult::Ok
    }

    fn signal(&mut self, event: Event) -> SendResult {
        if let Event::Signal(crate::event::Signal::UserSettingsChanged) = event {
            let data = self.settings.borrow().data;
            self.absolute_delay_us = data.mnpt_absolute_delay;
            self.num_char_delay = data.mnpt_num_char_delay as u32;
        }
        SendResult::Ok
    }

    fn set_out(&mut self, out: PipeRef) {
        self.out = Some(out);
    }
}
