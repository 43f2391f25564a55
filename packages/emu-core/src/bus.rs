//! The trait the CPU executor is generic over: access to its own
//! register file, to linear memory, and to the port I/O bus (§4.5).
//!
//! Mirrors the reference crate's `Motherboard`/`WithCpu` split- the CPU
//! logic in `cpu::exec` never names a concrete `Machine` type, so the
//! conformance harness can drive it against any type that wires these
//! three together.

use crate::cpu::regs::CpuState;
use crate::memory::Memory;

pub trait WithCpu {
    fn cpu(&self) -> &CpuState;
    fn cpu_mut(&mut self) -> &mut CpuState;
}

/// Port widths the bus dispatch needs to distinguish, since IN/OUT can
/// address either AL or AX.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum PortWidth {
    Byte,
    Word,
}

pub trait Bus: WithCpu {
    fn mem(&self) -> &Memory;
    fn mem_mut(&mut self) -> &mut Memory;

    /// Disjoint mutable access to the register file and linear memory at
    /// once, for the interrupt acceptance sequence (§4.6), which writes
    /// both in the same micro-op. Implementors hold these as separate
    /// struct fields, so this is a real split borrow, not a trick.
    fn cpu_and_mem_mut(&mut self) -> (&mut CpuState, &mut Memory);

    /// Read from the port bus (§4.5). Width selects AL-sized vs
    /// AX-sized access; a word access to an 8-bit-only device reads the
    /// low byte into both halves via the device's own combining rule.
    fn port_in(&mut self, port: u16, width: PortWidth) -> u16;

    fn port_out(&mut self, port: u16, width: PortWidth, value: u16);

    /// Called once a per-instruction tick (§4.7) has fired; advances
    /// PIT/keyboard/PIC. Given a default no-op so that bare test
    /// harnesses driving single instructions don't need to implement it.
    fn tick_peripherals(&mut self) {}

    /// Returns `Some(vector)` and clears the corresponding IRR/ISR state
    /// if the PIC has an unmasked, pending IRQ to hand the CPU. Default
    /// `None` for minimal harnesses with no PIC.
    fn pic_ack(&mut self) -> Option<u8> {
        None
    }
}
