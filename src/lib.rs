//! CrabDock - a Newton MessagePad dock protocol bridge
//!
//! This library is the chip-independent core of a dongle that connects
//! a Newton MessagePad to a modern host over USB. Toward the handheld
//! it speaks the Dock protocol inside MNP frames over async serial;
//! toward the host it is a CDC serial port. When the host side is
//! closed, the dongle answers the handheld itself and serves package
//! files from a storage card.
//!
//! All hardware access goes through collaborator traits
//! ([`endpoints::UartDriver`], [`endpoints::CdcDriver`],
//! [`endpoints::SdCardDriver`], [`settings::SettingsStore`],
//! [`status::StatusLamp`], [`sched::Clock`]); the integrating firmware
//! implements them, builds a [`bridge::Bridge`] and calls `run()`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bridge;
pub mod endpoints;
pub mod event;
pub mod filters;
pub mod logger;
pub mod newton;
pub mod pipe;
pub mod pipes;
pub mod sched;
pub mod settings;
pub mod status;

pub use bridge::Bridge;
pub use event::{Event, SendResult};
pub use pipe::{Pipe, PipeRef};
pub use sched::{Jobs, Scheduler};
