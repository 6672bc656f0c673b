//! Hayes modem emulation.
//!
//! The dongle behaves like a modem on both of its serial faces. In data
//! mode everything passes through unchanged; the pause-`+++`-pause
//! escape drops into command mode, where lines are edited locally and
//! executed on CR. The filter withholds `+` characters while an escape
//! may be in progress and releases them if the guard time or a foreign
//! character breaks the sequence.
//!
//! Downstream is the side facing the device (MessagePad or PC);
//! upstream faces the inside of the dongle.

use crate::endpoints::sdcard::SdCardRef;
use crate::event::{Event, SendResult, Signal};
use crate::pipe::{send_to, Pipe, PipeRef};
use crate::sched::SignalQueue;
use crate::settings::SettingsRef;
use alloc::rc::Rc;
use core::cell::RefCell;
use core::fmt::Write;
use heapless::Vec;

/// 1/50 s, the unit of register S12.
const GUARD_UNIT_US: u32 = 20_000;

const BS: u8 = 127;
const ESC: u8 = 27;
const BELL: u8 = 0x07;

pub struct HayesFilter {
    /// 0 = UART face, 1 = CDC face; selects the S12 register.
    index: u8,
    data_mode: bool,
    /// 0 idle, 1 pause seen, 2..=3 that many `+` withheld, 4 waiting
    /// for the final pause.
    escape_progress: u8,
    escape_timer_us: u32,
    guard_time_us: u32,
    cmd: Vec<u8, 256>,
    prev_cmd: Vec<u8, 256>,
    cmd_ready: bool,
    cr_received: bool,
    current_register: u32,
    settings: SettingsRef,
    signals: SignalQueue,
    sdcard: Option<SdCardRef>,
    up_out: Option<PipeRef>,
    down_out: Option<PipeRef>,
}

impl HayesFilter {
    pub fn new(
        index: u8,
        settings: SettingsRef,
        signals: SignalQueue,
    ) -> Rc<RefCell<HayesFilter>> {
        let guard = guard_register(&settings, index);
        Rc::new(RefCell::new(HayesFilter {
            index,
            data_mode: true,
            escape_progress: 0,
            escape_timer_us: 0,
            guard_time_us: guard as u32 * GUARD_UNIT_US,
            cmd: Vec::new(),
            prev_cmd: Vec::new(),
            cmd_ready: false,
            cr_received: false,
            current_register: 0,
            settings,
            signals,
            sdcard: None,
            up_out: None,
            down_out: None,
        }))
    }

    /// The pipe personality facing the inside of the dongle.
    pub fn upstream_port(filter: &Rc<RefCell<HayesFilter>>) -> PipeRef {
        Rc::new(RefCell::new(UpstreamPort(filter.clone())))
    }

    /// Give the command interpreter access to the storage card.
    pub fn link_sdcard(&mut self, sdcard: SdCardRef) {
        self.sdcard = Some(sdcard);
    }

    pub fn set_upstream_out(&mut self, out: PipeRef) {
        self.up_out = Some(out);
    }

    fn switch_to_command_mode(&mut self) {
        self.data_mode = false;
        self.escape_progress = 0;
        self.escape_timer_us = 0;
        self.send_str("OK\r\n");
    }

    fn switch_to_data_mode(&mut self) {
        self.send_str("CONNECT\r\n");
        self.data_mode = true;
        self.escape_progress = 0;
        self.escape_timer_us = 0;
    }

    /// Re-emit `+` characters that were withheld for a failed escape.
    fn release_withheld(&mut self, count: u8) {
        for _ in 0..count {
            let _ = send_to(&self.up_out, Event::Data(b'+'));
        }
    }

    fn upstream_send(&mut self, event: Event) -> SendResult {
        if self.data_mode {
            send_to(&self.down_out, event)
        } else {
            // Traffic from inside the dongle is dropped while the user
            // holds the command prompt.
            SendResult::OK_NOT_CONNECTED
        }
    }

    fn downstream_send(&mut self, event: Event) -> SendResult {
        if self.data_mode && event.is_data() {
            let byte = match event {
                Event::Data(b) => b,
                _ => unreachable!(),
            };
            match self.escape_progress {
                0 => self.escape_timer_us = 0,
                1 => {
                    if byte == b'+' {
                        self.escape_progress = 2;
                        self.escape_timer_us = 0;
                        return SendResult::Ok; // withhold
                    }
                    self.escape_progress = 0;
                    self.escape_timer_us = 0;
                }
                2 => {
                    if byte == b'+' {
                        self.escape_progress = 3;
                        self.escape_timer_us = 0;
                        return SendResult::Ok;
                    }
                    self.release_withheld(1);
                    self.escape_progress = 0;
                    self.escape_timer_us = 0;
                }
                3 => {
                    if byte == b'+' {
                        self.escape_progress = 4;
                        self.escape_timer_us = 0;
                        return SendResult::Ok;
                    }
                    self.release_withheld(2);
                    self.escape_progress = 0;
                    self.escape_timer_us = 0;
                }
                _ => {
                    self.release_withheld(3);
                    self.escape_progress = 0;
                    self.escape_timer_us = 0;
                }
            }
        }

        if self.data_mode {
            return send_to(&self.up_out, event);
        }
        self.command_mode_input(event)
    }

    fn command_mode_input(&mut self, mut event: Event) -> SendResult {
        if let Event::Data(byte) = event {
            match byte {
                b'\r' => {
                    // Some terminals send a bare CR; run the line on it.
                    self.cmd_ready = true;
                    self.cr_received = true;
                    let _ = send_to(&self.down_out, Event::Data(b'\r'));
                    event = Event::Data(b'\n');
                }
                b'\n' => {
                    if self.cr_received {
                        // The CR already ran the command.
                        self.cr_received = false;
                        return SendResult::Ok;
                    }
                    self.cmd_ready = true;
                    let _ = send_to(&self.down_out, Event::Data(b'\r'));
                }
                BS | 8 => {
                    if !self.cmd.is_empty() {
                        self.cmd.pop();
                        self.send_str("\x1b[1D \x1b[1D");
                    }
                    return SendResult::Ok;
                }
                ESC => {
                    self.cmd.clear();
                    let _ = send_to(&self.down_out, Event::Data(b'\r'));
                    return send_to(&self.down_out, Event::Data(b'\n'));
                }
                b'/' if self.cmd.len() == 1 && self.cmd[0].eq_ignore_ascii_case(&b'A') => {
                    // "A/" repeats the previous command line.
                    self.cmd = self.prev_cmd.clone();
                    self.cmd_ready = true;
                    let _ = send_to(&self.down_out, event);
                    let _ = send_to(&self.down_out, Event::Data(b'\r'));
                    event = Event::Data(b'\n');
                }
                _ => {
                    if self.cmd.push(byte).is_err() {
                        event = Event::Data(BELL);
                    }
                }
            }
        }
        let result = send_to(&self.down_out, event);
        if self.cmd_ready {
            self.cmd_ready = false;
            if self.cmd.len() >= 2 && self.cmd[..2].eq_ignore_ascii_case(b"AT") {
                self.run_cmd_line();
            }
            self.prev_cmd = self.cmd.clone();
            self.cmd.clear();
        }
        result
    }

    // -- Command interpreter -----------------------------------------

    fn run_cmd_line(&mut self) {
        let line = self.cmd.clone();
        let mut pos = 2; // past "AT"
        loop {
            match self.run_next_cmd(&line, pos) {
                Some(next) => pos = next,
                None => break,
            }
        }
    }

    /// Execute one command, returning the position of the next.
    fn run_next_cmd(&mut self, line: &[u8], mut pos: usize) -> Option<usize> {
        let Some(&c) = line.get(pos) else {
            self.send_str("OK\r\n");
            return None;
        };
        pos += 1;
        match c.to_ascii_uppercase() {
            // The rest of a dial command would be a phone number; there
            // is nothing to dial here.
            b'D' => {
                self.send_str("ERROR\r\n");
                None
            }
            b'I' => {
                let (info, next) = read_int(line, pos);
                if self.send_info(info) {
                    Some(next)
                } else {
                    self.send_str("ERROR\r\n");
                    None
                }
            }
            b'O' => {
                self.switch_to_data_mode();
                None
            }
            b'S' => {
                if line.get(pos).is_some_and(u8::is_ascii_digit) {
                    let (register, next) = read_int(line, pos);
                    self.current_register = register;
                    pos = next;
                }
                match line.get(pos) {
                    Some(&b'=') => {
                        let (value, next) = read_int(line, pos + 1);
                        if self.set_register(self.current_register, value) {
                            Some(next)
                        } else {
                            self.send_str("ERROR\r\n");
                            None
                        }
                    }
                    Some(&b'?') => {
                        let value = self.get_register(self.current_register);
                        self.send_number(value);
                        self.send_str("\r\n");
                        Some(pos + 1)
                    }
                    _ => {
                        self.send_str("ERROR\r\n");
                        None
                    }
                }
            }
            b'&' => self.run_ampersand_cmd(line, pos),
            b'[' => self.run_sdcard_cmd(line, pos),
            _ => {
                self.send_str("ERROR\r\n");
                None
            }
        }
    }

    fn run_ampersand_cmd(&mut self, line: &[u8], pos: usize) -> Option<usize> {
        match line.get(pos).map(u8::to_ascii_uppercase) {
            Some(b'W') => {
                let (_, next) = read_int(line, pos + 1);
                if self.settings.borrow_mut().write().is_err() {
                    self.send_str("ERROR\r\n");
                    return None;
                }
                Some(next)
            }
            _ => {
                self.send_str("ERROR\r\n");
                None
            }
        }
    }

    /// `AT[` extension namespace: storage card and factory data.
    fn run_sdcard_cmd(&mut self, line: &[u8], pos: usize) -> Option<usize> {
        let rest = &line[pos.min(line.len())..];
        if rest.len() >= 2 && rest[..2].eq_ignore_ascii_case(b"GL") {
            let Some(sdcard) = self.sdcard.clone() else {
                self.send_str("ERROR\r\n");
                return None;
            };
            match sdcard.borrow_mut().label() {
                Ok(label) => {
                    self.send_str("\"");
                    for c in label.chars() {
                        let printable = if (' '..='~').contains(&c) { c } else { '.' };
                        let _ = send_to(&self.down_out, Event::Data(printable as u8));
                    }
                    self.send_str("\"\r\n");
                    Some(pos + 2)
                }
                Err(err) => {
                    self.send_str(err.as_str());
                    self.send_str("\r\nERROR\r\n");
                    None
                }
            }
        } else if rest.len() >= 2 && rest[..2].eq_ignore_ascii_case(b"SN") {
            // AT[SN<serial>:<id>.<version>.<revision> programs the
            // factory identity page.
            let mut p = pos + 2;
            let (serial, next) = read_int(line, p);
            p = next;
            let mut fields = [0u32; 3];
            for (field, separator) in fields.iter_mut().zip([b':', b'.', b'.']) {
                if line.get(p) != Some(&separator) {
                    self.send_str("ERROR\r\n");
                    return None;
                }
                let (value, next) = read_int(line, p + 1);
                *field = value;
                p = next;
            }
            let [id, version, revision] = fields;
            let write_result = self
                .settings
                .borrow_mut()
                .write_serial(serial, id as u16, version as u16, revision as u16);
            match write_result {
                Ok(()) => {
                    self.send_str("Flashed ");
                    self.send_number(serial);
                    self.send_str("\r\n");
                    Some(p)
                }
                Err(_) => {
                    self.send_str("Rejected\r\nERROR\r\n");
                    None
                }
            }
        } else {
            self.send_str("ERROR\r\n");
            None
        }
    }

    fn set_register(&mut self, register: u32, value: u32) -> bool {
        {
            let mut settings = self.settings.borrow_mut();
            match register {
                12 => {
                    if self.index == 0 {
                        settings.data.hayes0_esc_guard_time = value as u8;
                    } else {
                        settings.data.hayes1_esc_guard_time = value as u8;
                    }
                }
                300 => settings.data.mnpt_absolute_delay = value,
                301 => settings.data.mnpt_num_char_delay = value as u8,
                _ => return false,
            }
        }
        self.signals.push(Event::Signal(Signal::UserSettingsChanged));
        true
    }

    fn get_register(&self, register: u32) -> u32 {
        let settings = self.settings.borrow();
        match register {
            12 => {
                if self.index == 0 {
                    settings.data.hayes0_esc_guard_time as u32
                } else {
                    settings.data.hayes1_esc_guard_time as u32
                }
            }
            300 => settings.data.mnpt_absolute_delay,
            301 => settings.data.mnpt_num_char_delay as u32,
            _ => 0,
        }
    }

    fn send_info(&mut self, index: u32) -> bool {
        match index {
            0 => {
                self.send_str(concat!("CrabDock V", env!("CARGO_PKG_VERSION"), "\r\n"));
            }
            1 => {
                let serial = self.settings.borrow().serial();
                self.send_str("Serial No.: ");
                self.send_number(serial);
                self.send_str("\r\n");
            }
            2 => {
                let (version, revision) = {
                    let settings = self.settings.borrow();
                    (settings.hardware_version(), settings.hardware_revision())
                };
                self.send_str("Hardware: V");
                self.send_number(version as u32);
                self.send_str(".");
                self.send_number(revision as u32);
                self.send_str("\r\n");
            }
            _ => return false,
        }
        true
    }

    fn send_str(&mut self, text: &str) {
        for &byte in text.as_bytes() {
            let _ = send_to(&self.down_out, Event::Data(byte));
        }
    }

    fn send_number(&mut self, value: u32) {
        let mut buf: heapless::String<12> = heapless::String::new();
        let _ = write!(buf, "{value}");
        self.send_str(&buf);
    }
}

impl Pipe for HayesFilter {
    /// The downstream personality: traffic from the attached device.
    fn send(&mut self, event: Event) -> SendResult {
        self.downstream_send(event)
    }

    fn tick(&mut self, cycle_us: u32) -> SendResult {
        if !self.data_mode {
            return SendResult::Ok;
        }
        self.escape_timer_us = self.escape_timer_us.saturating_add(cycle_us);
        let timed_out = self.escape_timer_us > self.guard_time_us;
        match self.escape_progress {
            0 if timed_out => {
                // Quiet long enough; a `+` may now start an escape.
                self.escape_progress = 1;
                self.escape_timer_us = 0;
            }
            2 if timed_out => {
                self.release_withheld(1);
                self.escape_progress = 0;
                self.escape_timer_us = 0;
            }
            3 if timed_out => {
                self.release_withheld(2);
                self.escape_progress = 0;
                self.escape_timer_us = 0;
            }
            4 if timed_out => {
                log::info!("Hayes {}: entering command mode", self.index);
                self.switch_to_command_mode();
            }
            _ => {}
        }
        SendResult::Ok
    }

    fn signal(&mut self, event: Event) -> SendResult {
        if event == Event::Signal(Signal::UserSettingsChanged) {
            let guard = guard_register(&self.settings, self.index);
            self.guard_time_us = guard as u32 * GUARD_UNIT_US;
        }
        SendResult::Ok
    }

    /// Downstream personality output (toward the attached device).
    fn set_out(&mut self, out: PipeRef) {
        self.down_out = Some(out);
    }
}

fn guard_register(settings: &SettingsRef, index: u8) -> u8 {
    let data = settings.borrow().data;
    if index == 0 {
        data.hayes0_esc_guard_time
    } else {
        data.hayes1_esc_guard_time
    }
}

/// Parse a decimal number, returning the value and the next position.
fn read_int(line: &[u8], mut pos: usize) -> (u32, usize) {
    let mut value: u32 = 0;
    while let Some(d) = line.get(pos).filter(|b| b.is_ascii_digit()) {
        value = value.wrapping_mul(10).wrapping_add((d - b'0') as u32);
        pos += 1;
    }
    (value, pos)
}

struct UpstreamPort(Rc<RefCell<HayesFilter>>);

impl Pipe for UpstreamPort {
    fn send(&mut self, event: Event) -> SendResult {
        self.0.borrow_mut().upstream_send(event)
    }
    fn set_out(&mut self, out: PipeRef) {
        self.0.borrow_mut().set_upstream_out(out);
    }
}
