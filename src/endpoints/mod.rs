//! Endpoints own a hardware resource and terminate the pipe graph.

pub mod cdc;
pub mod dock;
pub mod sdcard;
pub mod uart;

pub use cdc::{CdcDriver, CdcEndpoint};
pub use dock::Dock;
pub use sdcard::{SdCardDriver, SdCardRef};
pub use uart::{UartDriver, UartEndpoint};
