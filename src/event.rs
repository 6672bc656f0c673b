//! Event and result values carried through the pipe graph.
//!
//! Every stage in the dongle exchanges these 4-byte tagged values. Data
//! bytes, bitrate changes, transmission pauses, back-pressure notes and
//! the MNP/Dock engine messages all travel the same pipes, so both types
//! are kept word-sized and trivially copyable.

/// Scheduler broadcast subjects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// The user settings changed; stages re-read their registers.
    UserSettingsChanged,
}

/// Units for a transmission pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayUnit {
    Micros,
    Millis,
    /// Character times at the current bitrate (10 bits per character).
    Chars,
}

/// Messages exchanged between the MNP link layer and the Dock engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MnpEvent {
    /// Send a Link Acknowledgement (data = sequence number).
    SendLa,
    /// Send a Link Disconnect (data = reason).
    SendLd,
    /// Send a Link Request reply (data = in-pool frame index).
    SendLr,
    /// Send a Link Transfer (data = out-pool frame index).
    SendLt,
    /// A Link Acknowledgement arrived (data = sequence number).
    ReceivedLa,
    /// Stream a received payload on to the Dock (data = in-pool index).
    DataToDock,
    /// A connection is being negotiated.
    Negotiating,
    /// The link is up.
    Connected,
    /// The link was torn down.
    Disconnected,
    /// The original data stream had a frame boundary here.
    FrameStart,
    FrameEnd,
}

/// Serial line state changes, propagated from the USB host side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    /// Data Terminal Ready (data = 0 or 1).
    Dtr,
}

/// A single event travelling through a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// One octet of a byte stream. Order is significant.
    Data(u8),
    /// Switch the line rate; the id indexes [`BITRATES`].
    SetBitrate(u8),
    /// Pause transmission for the given count of units.
    Delay(DelayUnit, u16),
    /// Back-pressure notification travelling against the data flow.
    HighWater(bool),
    /// Scheduler broadcast.
    Signal(Signal),
    /// MNP engine message (subtype, payload).
    Mnp(MnpEvent, u16),
    /// Line state change (subtype, value).
    Uart(LineState, u16),
}

const _: () = assert!(size_of::<Event>() == 4);

/// The closed table of supported line rates.
pub const BITRATES: [u32; 12] = [
    300, 1200, 2400, 4800, 9600, 14400, 19200, 28800, 38400, 57600, 115200, 230400,
];

/// Fallback rate when an id or rate is not in the table.
pub const DEFAULT_BITRATE: u32 = 38400;

impl Event {
    /// Build a `SetBitrate` event for a rate in the table. Unsupported
    /// rates map to the default.
    pub fn bitrate(rate: u32) -> Event {
        match BITRATES.iter().position(|&r| r == rate) {
            Some(id) => Event::SetBitrate(id as u8),
            None => {
                log::warn!("unsupported bitrate {rate}");
                Event::SetBitrate(8) // 38400
            }
        }
    }

    /// The line rate carried by a `SetBitrate` event.
    pub fn bitrate_value(id: u8) -> u32 {
        match BITRATES.get(id as usize) {
            Some(&rate) => rate,
            None => {
                log::warn!("unsupported bitrate id {id}");
                DEFAULT_BITRATE
            }
        }
    }

    /// Build a `Delay` event, switching to milliseconds when the
    /// duration does not fit the 16-bit field.
    pub fn delay_us(usec: u32) -> Event {
        if usec > 0xFFFF {
            Event::Delay(DelayUnit::Millis, (usec / 1000) as u16)
        } else {
            Event::Delay(DelayUnit::Micros, usec as u16)
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(self, Event::Data(_))
    }
}

/// Why a send was rejected or only partially handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendCause {
    /// No output pipe connected; the event was discarded.
    NotConnected,
    /// The stage does not recognize this event type.
    NotHandled,
}

/// The outcome of handing an event to a pipe.
///
/// `Rejected` is the back-pressure signal: the sender keeps the event
/// and resubmits the same event on a later tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    Ok,
    OkWith(SendCause),
    Rejected,
    RejectedWith(SendCause),
}

const _: () = assert!(size_of::<SendResult>() <= 4);

impl SendResult {
    pub const OK_NOT_CONNECTED: SendResult = SendResult::OkWith(SendCause::NotConnected);
    pub const OK_NOT_HANDLED: SendResult = SendResult::OkWith(SendCause::NotHandled);
    pub const REJECTED_NOT_CONNECTED: SendResult =
        SendResult::RejectedWith(SendCause::NotConnected);

    pub fn is_ok(&self) -> bool {
        matches!(self, SendResult::Ok | SendResult::OkWith(_))
    }

    pub fn is_rejected(&self) -> bool {
        !self.is_ok()
    }
}
