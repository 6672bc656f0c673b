//! Newton data formats: the streamed object format and the DES
//! variant used by the Dock password exchange.

pub mod des;
pub mod nsof;
