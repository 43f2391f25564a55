//! Peripheral models wired onto the port I/O bus (§4.5).

pub mod cga;
pub mod dma;
pub mod keyboard;
pub mod pic;
pub mod pit;
