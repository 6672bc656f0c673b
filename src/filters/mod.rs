//! Filters: stages that transform or route the event stream.

pub mod dtr;
pub mod hayes;
pub mod mnp;

pub use dtr::DtrSwitch;
pub use hayes::HayesFilter;
pub use mnp::MnpFilter;
