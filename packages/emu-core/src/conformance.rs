//! Schema and seed/compare helpers for the external JSON conformance
//! fixtures (§4.12). Parsing the fixture files themselves happens in the
//! integration test that owns the file paths; this module only knows
//! the shape and how to apply/compare it against a `CpuState`+`Memory`.

use serde::{Deserialize, Serialize};

use crate::cpu::regs::CpuState;
use crate::memory::Memory;

#[derive(Debug, Serialize, Deserialize)]
pub struct RegSnapshot {
    pub ax: u16,
    pub bx: u16,
    pub cx: u16,
    pub dx: u16,
    pub si: u16,
    pub di: u16,
    pub bp: u16,
    pub sp: u16,
    pub cs: u16,
    pub ds: u16,
    pub es: u16,
    pub ss: u16,
    pub ip: u16,
    pub flags: u16,
}

/// A sparse RAM overlay: `[address, byte]` pairs, applied or compared
/// only at the listed addresses rather than requiring a full memory
/// dump per fixture.
#[derive(Debug, Serialize, Deserialize)]
pub struct RamCell(pub u32, pub u8);

#[derive(Debug, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub regs: RegSnapshot,
    #[serde(default)]
    pub ram: Vec<RamCell>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConformanceCase {
    pub name: String,
    /// Raw instruction bytes, placed at CS:IP from `initial` before
    /// stepping.
    pub bytes: Vec<u8>,
    pub initial: MachineSnapshot,
    #[serde(rename = "final")]
    pub expected: MachineSnapshot,
}

pub fn seed(cpu: &mut CpuState, mem: &mut Memory, case: &ConformanceCase) {
    apply_snapshot(cpu, mem, &case.initial);
    let base = crate::memory::physical_addr(cpu.cs, cpu.ip);
    mem.load_image(base, &case.bytes);
}

fn apply_snapshot(cpu: &mut CpuState, mem: &mut Memory, snap: &MachineSnapshot) {
    cpu.ax = snap.regs.ax;
    cpu.bx = snap.regs.bx;
    cpu.cx = snap.regs.cx;
    cpu.dx = snap.regs.dx;
    cpu.si = snap.regs.si;
    cpu.di = snap.regs.di;
    cpu.bp = snap.regs.bp;
    cpu.sp = snap.regs.sp;
    cpu.cs = snap.regs.cs;
    cpu.ds = snap.regs.ds;
    cpu.es = snap.regs.es;
    cpu.ss = snap.regs.ss;
    cpu.ip = snap.regs.ip;
    cpu.flags = crate::cpu::regs::Flags::from_bits_truncate(crate::cpu::regs::canonicalize(
        snap.regs.flags,
    ));
    for RamCell(addr, val) in &snap.ram {
        mem.store_u8(*addr, *val);
    }
}

/// Compare live state against a fixture's expected snapshot, returning
/// a list of human-readable mismatches (empty means a pass).
pub fn diff(cpu: &CpuState, mem: &Memory, expected: &MachineSnapshot) -> Vec<String> {
    let mut mismatches = Vec::new();
    macro_rules! check {
        ($field:ident, $name:literal) => {
            if cpu.$field != expected.regs.$field {
                mismatches.push(format!(
                    "{}: expected {:#06X}, got {:#06X}",
                    $name, expected.regs.$field, cpu.$field
                ));
            }
        };
    }
    check!(ax, "ax");
    check!(bx, "bx");
    check!(cx, "cx");
    check!(dx, "dx");
    check!(si, "si");
    check!(di, "di");
    check!(bp, "bp");
    check!(sp, "sp");
    check!(cs, "cs");
    check!(ds, "ds");
    check!(es, "es");
    check!(ss, "ss");
    check!(ip, "ip");
    if cpu.flags.bits() != expected.regs.flags {
        mismatches.push(format!(
            "flags: expected {:#06X}, got {:#06X}",
            expected.regs.flags,
            cpu.flags.bits()
        ));
    }
    for RamCell(addr, val) in &expected.ram {
        let got = mem.load_u8(*addr);
        if got != *val {
            mismatches.push(format!(
                "ram[{:#07X}]: expected {:#04X}, got {:#04X}",
                addr, val, got
            ));
        }
    }
    mismatches
}
