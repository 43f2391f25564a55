//! Typed errors surfaced by the core crate. Execution-time faults the
//! CPU itself resolves (illegal opcode, divide error) still get a log
//! line through [`log`]; this type is for errors a caller needs to
//! branch on- loading a bad program image or a malformed conformance
//! fixture.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmuError {
    #[error("illegal opcode {byte:02X} at {cs:04X}:{ip:04X}")]
    IllegalOpcode { byte: u8, cs: u16, ip: u16 },

    #[error("no device registered at port {0:#06X}")]
    UnregisteredPort(u16),

    #[error("program image too large: {size} bytes at offset {offset:#x}")]
    ProgramTooLarge { size: usize, offset: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
