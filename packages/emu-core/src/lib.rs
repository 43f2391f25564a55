#[macro_use]
extern crate bitflags;

pub mod bus;
pub mod conformance;
pub mod cpu;
pub mod devices;
pub mod error;
pub mod io_bus;
pub mod machine;
pub mod memory;

pub use error::EmuError;
pub use machine::Machine;
