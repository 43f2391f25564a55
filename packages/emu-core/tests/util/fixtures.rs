//! Loads conformance fixtures embedded as JSON literals and drives one
//! `Machine` instruction per case through the seed/diff helpers in
//! `emu_core::conformance`.

use emu_core::conformance::{ConformanceCase, RamCell};
use emu_core::machine::Machine;

pub fn load_cases(json: &str) -> Vec<ConformanceCase> {
    serde_json::from_str(json).expect("fixture JSON should parse into ConformanceCase")
}

pub fn run_case(case: &ConformanceCase) -> Vec<String> {
    let mut mb = Machine::new();
    seed(&mut mb, case);
    mb.step();
    emu_core::conformance::diff(mb.cpu_state(), mb.memory(), &case.expected)
}

fn seed(mb: &mut Machine, case: &ConformanceCase) {
    let regs = &case.initial.regs;
    mb.load_program(regs.cs, regs.ip, &case.bytes);

    let cpu = mb.cpu_state_mut();
    cpu.ax = regs.ax;
    cpu.bx = regs.bx;
    cpu.cx = regs.cx;
    cpu.dx = regs.dx;
    cpu.si = regs.si;
    cpu.di = regs.di;
    cpu.bp = regs.bp;
    cpu.sp = regs.sp;
    cpu.ds = regs.ds;
    cpu.es = regs.es;
    cpu.ss = regs.ss;
    cpu.flags = emu_core::cpu::regs::Flags::from_bits_truncate(
        emu_core::cpu::regs::canonicalize(regs.flags),
    );

    for RamCell(addr, val) in &case.initial.ram {
        mb.memory_mut().store_u8(*addr, *val);
    }
}
