//! Status LED animation.
//!
//! One RGB lamp tells the user what the dongle is doing: steady yellow
//! when idle, a slow yellow/green alternation when the USB side is
//! ready, steady green when the host is connected, a blue flash while
//! the storage card is busy and a rapid red blink on errors. Temporary
//! statuses override the main indication for a bounded number of
//! animation steps and then fall back.

use crate::event::{Event, SendResult};
use crate::pipe::{Pipe, PipeRef};
use alloc::boxed::Box;
use alloc::rc::Rc;
use core::cell::RefCell;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppStatus {
    Idle,
    Error,
    UsbReady,
    UsbConnected,
    DockConnected,
    SdCardActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedColor {
    Off,
    Red,
    Yellow,
    Green,
    Blue,
}

/// Platform LED access.
pub trait StatusLamp {
    fn set_color(&mut self, color: LedColor);
}

pub struct StatusDisplay {
    lamp: Box<dyn StatusLamp>,
    main: AppStatus,
    /// Temporary override and its remaining animation steps.
    temp: Option<(AppStatus, u32)>,
    phase: bool,
    elapsed_us: u32,
    last_color: Option<LedColor>,
}

pub type StatusRef = Rc<RefCell<StatusDisplay>>;

impl StatusDisplay {
    pub fn new(lamp: Box<dyn StatusLamp>) -> StatusRef {
        Rc::new(RefCell::new(StatusDisplay {
            lamp,
            main: AppStatus::Idle,
            temp: None,
            phase: false,
            elapsed_us: 0,
            last_color: None,
        }))
    }

    /// Change the main status.
    pub fn set(&mut self, status: AppStatus) {
        if self.main != status {
            log::debug!("status: {status:?}");
            self.main = status;
            self.apply();
        }
    }

    /// Show a temporary status for the given number of animation
    /// steps, then fall back to the main status.
    pub fn repeat(&mut self, status: AppStatus, steps: u32) {
        self.temp = Some((status, steps));
        self.apply();
    }

    pub fn current(&self) -> AppStatus {
        match self.temp {
            Some((status, _)) => status,
            None => self.main,
        }
    }

    fn step_us(status: AppStatus) -> u32 {
        match status {
            AppStatus::Error => 62_500,
            AppStatus::UsbReady => 500_000,
            _ => 250_000,
        }
    }

    fn color(status: AppStatus, phase: bool) -> LedColor {
        match status {
            AppStatus::Idle => LedColor::Yellow,
            AppStatus::Error => {
                if phase {
                    LedColor::Red
                } else {
                    LedColor::Off
                }
            }
            AppStatus::UsbReady => {
                if phase {
                    LedColor::Yellow
                } else {
                    LedColor::Green
                }
            }
            AppStatus::UsbConnected => LedColor::Green,
            AppStatus::DockConnected => {
                if phase {
                    LedColor::Green
                } else {
                    LedColor::Off
                }
            }
            AppStatus::SdCardActive => {
                if phase {
                    LedColor::Blue
                } else {
                    LedColor::Off
                }
            }
        }
    }

    fn apply(&mut self) {
        let color = Self::color(self.current(), self.phase);
        if self.last_color != Some(color) {
            self.lamp.set_color(color);
            self.last_color = Some(color);
        }
    }
}

impl Pipe for StatusDisplay {
    fn send(&mut self, _event: Event) -> SendResult {
        SendResult::OK_NOT_HANDLED
    }

    fn tick(&mut self, cycle_us: u32) -> SendResult {
        self.elapsed_us = self.elapsed_us.saturating_add(cycle_us);
        let step = Self::step_us(self.current());
        if self.elapsed_us < step {
            return SendResult::Ok;
        }
        self.elapsed_us = 0;
        self.phase = !self.phase;
        if let Some((status, steps)) = self.temp {
            self.temp = if steps > 1 {
                Some((status, steps - 1))
            } else {
                None
            };
        }
        self.apply();
        SendResult::Ok
    }

    fn set_out(&mut self, _out: PipeRef) {}
}
