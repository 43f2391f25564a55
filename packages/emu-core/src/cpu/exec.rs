//! Execution dispatch (§4.4): fetch, classify, decode, and run one
//! instruction against a `Bus`.

use super::alu::{self, AluOp, DivResult, Rotate, Shift, Width};
use super::decode::{
    classify, consume_prefix, effective_address, rm_reg16, ModRm, OpClass, Prefixes,
};
use super::interrupt;
use super::regs::{Flags, Reg16, Reg8, SegReg};
use crate::bus::{Bus, PortWidth};
use crate::memory::physical_addr;

/// Run one instruction: prefixes, opcode, body, then the tick/interrupt
/// poll of §4.4 step 6. This is the entry point `Machine::step` calls.
pub fn step<T: Bus>(mb: &mut T) {
    mb.cpu_mut().begin_instruction();

    let mut prefixes = Prefixes::default();
    let mut op = fetch_u8(mb);
    while consume_prefix(op, &mut prefixes) {
        op = fetch_u8(mb);
    }

    mb.cpu_mut().seg_override = prefixes.seg_override;

    execute_opcode(mb, op, &prefixes);

    mb.cpu_mut().tot_instructions += 1;
    mb.tick_peripherals();
    poll_interrupts(mb);
}

fn poll_interrupts<T: Bus>(mb: &mut T) {
    let trap_pending = mb.cpu().flags.contains(Flags::TF);
    let int_src = mb.cpu().int_src;
    let if_set = mb.cpu().flags.contains(Flags::IF);

    // §4.6 priority order: a pending software source always outranks a
    // PIC poll, which in turn must come before the trap check. The PIC
    // poll is the only branch that needs a second mutable borrow of
    // `mb`, so it only runs once nothing higher-priority is pending.
    let source = if let Some(v) = int_src {
        Some(interrupt::InterruptSource::Software(v))
    } else if if_set {
        mb.pic_ack().map(interrupt::InterruptSource::External)
    } else {
        None
    };
    let source = source.or(if trap_pending {
        Some(interrupt::InterruptSource::SingleStep)
    } else {
        None
    });

    if let Some(source) = source {
        let (cpu, mem) = mb.cpu_and_mem_mut();
        interrupt::accept(cpu, mem, source);
    }
}

fn execute_opcode<T: Bus>(mb: &mut T, op: u8, prefixes: &Prefixes) {
    match classify(op) {
        OpClass::AluRm => exec_alu_rm(mb, op),
        OpClass::AluAcc => exec_alu_acc(mb, op),
        OpClass::IncR16 => {
            let reg = Reg16::from_field(op & 0x7);
            let val = mb.cpu().get_reg16(reg) as u32;
            let result = {
                let cpu = mb.cpu_mut();
                alu::inc(&mut cpu.flags, Width::Word, val)
            };
            mb.cpu_mut().set_reg16(reg, result as u16);
        }
        OpClass::DecR16 => {
            let reg = Reg16::from_field(op & 0x7);
            let val = mb.cpu().get_reg16(reg) as u32;
            let result = {
                let cpu = mb.cpu_mut();
                alu::dec(&mut cpu.flags, Width::Word, val)
            };
            mb.cpu_mut().set_reg16(reg, result as u16);
        }
        OpClass::PushR16 => {
            let reg = Reg16::from_field(op & 0x7);
            let val = mb.cpu().get_reg16(reg);
            push16(mb, val);
        }
        OpClass::PopR16 => {
            let reg = Reg16::from_field(op & 0x7);
            let val = pop16(mb);
            mb.cpu_mut().set_reg16(reg, val);
        }
        OpClass::XchgAccR16 => {
            let reg = Reg16::from_field(op & 0x7);
            let a = mb.cpu().ax;
            let b = mb.cpu().get_reg16(reg);
            mb.cpu_mut().ax = b;
            mb.cpu_mut().set_reg16(reg, a);
        }
        OpClass::MovR16Imm => {
            let reg = Reg16::from_field(op & 0x7);
            let imm = fetch_u16(mb);
            mb.cpu_mut().set_reg16(reg, imm);
        }
        OpClass::MovR8Imm => {
            let reg = Reg8::from_field(op & 0x7);
            let imm = fetch_u8(mb);
            mb.cpu_mut().set_reg8(reg, imm);
        }
        OpClass::CondBranch => exec_cond_branch(mb, op),
        OpClass::AluImm => exec_alu_imm(mb, op),
        OpClass::ShiftRotate => exec_shift_rotate(mb, op),
        OpClass::StringOp => exec_string_op(mb, op, prefixes),
        OpClass::Prefix => unreachable!("prefixes are consumed before classification"),
        OpClass::Singleton => exec_singleton(mb, op),
    }
}

// ---- fetch / stack helpers -------------------------------------------------

pub fn fetch_u8<T: Bus>(mb: &mut T) -> u8 {
    let cs = mb.cpu().cs;
    let ip = mb.cpu().ip;
    let byte = mb.mem().read_seg_u8(cs, ip);
    mb.cpu_mut().ip = ip.wrapping_add(1);
    byte
}

pub fn fetch_u16<T: Bus>(mb: &mut T) -> u16 {
    let lo = fetch_u8(mb) as u16;
    let hi = fetch_u8(mb) as u16;
    lo | (hi << 8)
}

fn read_modrm<T: Bus>(mb: &mut T) -> ModRm {
    let byte = fetch_u8(mb);
    let mut modrm = ModRm::decode(byte);
    match modrm.disp_len() {
        1 => modrm.disp = (fetch_u8(mb) as i8) as i32,
        2 => modrm.disp = fetch_u16(mb) as i32,
        _ => {}
    }
    modrm
}

pub fn push16<T: Bus>(mb: &mut T, val: u16) {
    let sp = mb.cpu().sp.wrapping_sub(2);
    mb.cpu_mut().sp = sp;
    let ss = mb.cpu().ss;
    mb.mem_mut().write_seg_u16(ss, sp, val);
}

pub fn pop16<T: Bus>(mb: &mut T) -> u16 {
    let ss = mb.cpu().ss;
    let sp = mb.cpu().sp;
    let val = mb.mem().read_seg_u16(ss, sp);
    mb.cpu_mut().sp = sp.wrapping_add(2);
    val
}

/// Resolve a memory ModR/M to its physical address, recording the
/// default-segment choice (BP forms imply SS) for `effective_seg` to
/// pick up, honoring any override prefix already recorded this
/// instruction.
fn modrm_addr<T: Bus>(mb: &mut T, modrm: &ModRm) -> u32 {
    let cpu = mb.cpu();
    let ea = effective_address(modrm.rm, modrm.md, modrm.disp, cpu.bx, cpu.bp, cpu.si, cpu.di);
    mb.cpu_mut().default_seg = ea.default_seg;
    let seg = mb.cpu().effective_seg();
    physical_addr(seg, ea.offset)
}

fn read_rm<T: Bus>(mb: &mut T, modrm: &ModRm, width: Width) -> u32 {
    if modrm.is_register() {
        match width {
            Width::Byte => mb.cpu().get_reg8(Reg8::from_field(modrm.rm)) as u32,
            Width::Word => mb.cpu().get_reg16(rm_reg16(modrm.rm)) as u32,
        }
    } else {
        let addr = modrm_addr(mb, modrm);
        match width {
            Width::Byte => mb.mem().load_u8(addr) as u32,
            Width::Word => mb.mem().load_u16(addr) as u32,
        }
    }
}

fn write_rm<T: Bus>(mb: &mut T, modrm: &ModRm, width: Width, val: u32) {
    if modrm.is_register() {
        match width {
            Width::Byte => mb.cpu_mut().set_reg8(Reg8::from_field(modrm.rm), val as u8),
            Width::Word => mb.cpu_mut().set_reg16(rm_reg16(modrm.rm), val as u16),
        }
    } else {
        let addr = modrm_addr(mb, modrm);
        match width {
            Width::Byte => mb.mem_mut().store_u8(addr, val as u8),
            Width::Word => mb.mem_mut().store_u16(addr, val as u16),
        }
    }
}

fn read_reg_field<T: Bus>(mb: &T, modrm: &ModRm, width: Width) -> u32 {
    match width {
        Width::Byte => mb.cpu().get_reg8(Reg8::from_field(modrm.reg)) as u32,
        Width::Word => mb.cpu().get_reg16(Reg16::from_field(modrm.reg)) as u32,
    }
}

fn write_reg_field<T: Bus>(mb: &mut T, modrm: &ModRm, width: Width, val: u32) {
    match width {
        Width::Byte => mb.cpu_mut().set_reg8(Reg8::from_field(modrm.reg), val as u8),
        Width::Word => mb.cpu_mut().set_reg16(Reg16::from_field(modrm.reg), val as u16),
    }
}

// ---- class 1: ALU r/m <-> reg, and MOV -------------------------------------

fn exec_alu_rm<T: Bus>(mb: &mut T, op: u8) {
    let width = if op & 1 == 1 { Width::Word } else { Width::Byte };
    let reg_is_dst = (op >> 1) & 1 == 1;
    let modrm = read_modrm(mb);

    if (op & 0xFC) == 0x88 {
        if reg_is_dst {
            let val = read_rm(mb, &modrm, width);
            write_reg_field(mb, &modrm, width, val);
        } else {
            let val = read_reg_field(mb, &modrm, width);
            write_rm(mb, &modrm, width, val);
        }
        return;
    }

    let alu_op = AluOp::from_field((op >> 3) & 0x7);
    let rm_val = read_rm(mb, &modrm, width);
    let reg_val = read_reg_field(mb, &modrm, width);
    let (dst, src) = if reg_is_dst {
        (reg_val, rm_val)
    } else {
        (rm_val, reg_val)
    };
    let result = {
        let cpu = mb.cpu_mut();
        alu::apply(alu_op, &mut cpu.flags, width, dst, src)
    };
    if alu_op.writes_result() {
        if reg_is_dst {
            write_reg_field(mb, &modrm, width, result);
        } else {
            write_rm(mb, &modrm, width, result);
        }
    }
}

// ---- class 2: ALU acc <-> imm ----------------------------------------------

fn exec_alu_acc<T: Bus>(mb: &mut T, op: u8) {
    let width = if op & 1 == 1 { Width::Word } else { Width::Byte };
    let alu_op = AluOp::from_field((op >> 3) & 0x7);
    let imm = if width == Width::Word {
        fetch_u16(mb) as u32
    } else {
        fetch_u8(mb) as u32
    };
    let acc = if width == Width::Word {
        mb.cpu().ax as u32
    } else {
        mb.cpu().get_reg8(Reg8::AL) as u32
    };
    let result = {
        let cpu = mb.cpu_mut();
        alu::apply(alu_op, &mut cpu.flags, width, acc, imm)
    };
    if alu_op.writes_result() {
        if width == Width::Word {
            mb.cpu_mut().ax = result as u16;
        } else {
            mb.cpu_mut().set_reg8(Reg8::AL, result as u8);
        }
    }
}

// ---- class 10: conditional short branch ------------------------------------

fn condition_holds(flags: Flags, cc: u8) -> bool {
    let cf = flags.contains(Flags::CF);
    let zf = flags.contains(Flags::ZF);
    let sf = flags.contains(Flags::SF);
    let of = flags.contains(Flags::OF);
    let pf = flags.contains(Flags::PF);
    match cc & 0xF {
        0x0 => of,
        0x1 => !of,
        0x2 => cf,
        0x3 => !cf,
        0x4 => zf,
        0x5 => !zf,
        0x6 => cf || zf,
        0x7 => !cf && !zf,
        0x8 => sf,
        0x9 => !sf,
        0xA => pf,
        0xB => !pf,
        0xC => sf != of,
        0xD => sf == of,
        0xE => zf || (sf != of),
        0xF => !zf && (sf == of),
        _ => unreachable!(),
    }
}

fn exec_cond_branch<T: Bus>(mb: &mut T, op: u8) {
    let disp = fetch_u8(mb) as i8;
    let taken = if op == 0xE3 {
        mb.cpu().cx == 0
    } else {
        condition_holds(mb.cpu().flags, op)
    };
    if taken {
        let ip = mb.cpu().ip;
        mb.cpu_mut().ip = ip.wrapping_add(disp as i16 as u16);
    }
}

// ---- class 11: immediate-form ALU (group 80-83) ----------------------------

fn exec_alu_imm<T: Bus>(mb: &mut T, op: u8) {
    let width = if op == 0x81 || op == 0x83 {
        Width::Word
    } else {
        Width::Byte
    };
    let modrm = read_modrm(mb);
    let imm = match op {
        0x80 | 0x82 => fetch_u8(mb) as u32,
        0x81 => fetch_u16(mb) as u32,
        0x83 => (fetch_u8(mb) as i8 as i16 as u16) as u32,
        _ => unreachable!(),
    };
    let alu_op = AluOp::from_field(modrm.reg);
    let dst = read_rm(mb, &modrm, width);
    let result = {
        let cpu = mb.cpu_mut();
        alu::apply(alu_op, &mut cpu.flags, width, dst, imm)
    };
    if alu_op.writes_result() {
        write_rm(mb, &modrm, width, result);
    }
}

// ---- class 12: shift/rotate group D0-D3 ------------------------------------

fn exec_shift_rotate<T: Bus>(mb: &mut T, op: u8) {
    let width = if op & 1 == 1 { Width::Word } else { Width::Byte };
    let by_cl = (op >> 1) & 1 == 1;
    let modrm = read_modrm(mb);
    let count = if by_cl {
        u32::from(mb.cpu().get_reg8(Reg8::CL))
    } else {
        1
    };
    let val = read_rm(mb, &modrm, width);
    let result = {
        let cpu = mb.cpu_mut();
        match modrm.reg & 0x7 {
            0 => alu::rotate(&mut cpu.flags, width, Rotate::Rol, val, count),
            1 => alu::rotate(&mut cpu.flags, width, Rotate::Ror, val, count),
            2 => alu::rotate(&mut cpu.flags, width, Rotate::Rcl, val, count),
            3 => alu::rotate(&mut cpu.flags, width, Rotate::Rcr, val, count),
            4 | 6 => alu::shift(&mut cpu.flags, width, Shift::Shl, val, count),
            5 => alu::shift(&mut cpu.flags, width, Shift::Shr, val, count),
            7 => alu::shift(&mut cpu.flags, width, Shift::Sar, val, count),
            _ => unreachable!(),
        }
    };
    write_rm(mb, &modrm, width, result);
}

// ---- class 13: string primitives -------------------------------------------

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
enum StringKind {
    Movs,
    Cmps,
    Stos,
    Lods,
    Scas,
}

fn advance(cur: u16, width: Width, df: bool) -> u16 {
    let step = match width {
        Width::Byte => 1i16,
        Width::Word => 2,
    };
    cur.wrapping_add(if df { step.wrapping_neg() } else { step } as u16)
}

fn run_string_primitive<T: Bus>(mb: &mut T, kind: StringKind, width: Width) {
    let df = mb.cpu().flags.contains(Flags::DF);
    match kind {
        StringKind::Movs => {
            let src_seg = mb.cpu().data_seg();
            let si = mb.cpu().si;
            let es = mb.cpu().es;
            let di = mb.cpu().di;
            match width {
                Width::Byte => {
                    let v = mb.mem().read_seg_u8(src_seg, si);
                    mb.mem_mut().write_seg_u8(es, di, v);
                }
                Width::Word => {
                    let v = mb.mem().read_seg_u16(src_seg, si);
                    mb.mem_mut().write_seg_u16(es, di, v);
                }
            }
            mb.cpu_mut().si = advance(si, width, df);
            mb.cpu_mut().di = advance(di, width, df);
        }
        StringKind::Cmps => {
            let src_seg = mb.cpu().data_seg();
            let si = mb.cpu().si;
            let es = mb.cpu().es;
            let di = mb.cpu().di;
            let (a, b) = match width {
                Width::Byte => (
                    mb.mem().read_seg_u8(src_seg, si) as u32,
                    mb.mem().read_seg_u8(es, di) as u32,
                ),
                Width::Word => (
                    mb.mem().read_seg_u16(src_seg, si) as u32,
                    mb.mem().read_seg_u16(es, di) as u32,
                ),
            };
            {
                let cpu = mb.cpu_mut();
                alu::sub(&mut cpu.flags, width, a, b, 0);
            }
            mb.cpu_mut().si = advance(si, width, df);
            mb.cpu_mut().di = advance(di, width, df);
        }
        StringKind::Stos => {
            let es = mb.cpu().es;
            let di = mb.cpu().di;
            match width {
                Width::Byte => {
                    let al = mb.cpu().get_reg8(Reg8::AL);
                    mb.mem_mut().write_seg_u8(es, di, al);
                }
                Width::Word => {
                    let ax = mb.cpu().ax;
                    mb.mem_mut().write_seg_u16(es, di, ax);
                }
            }
            mb.cpu_mut().di = advance(di, width, df);
        }
        StringKind::Lods => {
            let src_seg = mb.cpu().data_seg();
            let si = mb.cpu().si;
            match width {
                Width::Byte => {
                    let v = mb.mem().read_seg_u8(src_seg, si);
                    mb.cpu_mut().set_reg8(Reg8::AL, v);
                }
                Width::Word => {
                    let v = mb.mem().read_seg_u16(src_seg, si);
                    mb.cpu_mut().ax = v;
                }
            }
            mb.cpu_mut().si = advance(si, width, df);
        }
        StringKind::Scas => {
            let es = mb.cpu().es;
            let di = mb.cpu().di;
            let (a, b) = match width {
                Width::Byte => (
                    mb.cpu().get_reg8(Reg8::AL) as u32,
                    mb.mem().read_seg_u8(es, di) as u32,
                ),
                Width::Word => (mb.cpu().ax as u32, mb.mem().read_seg_u16(es, di) as u32),
            };
            {
                let cpu = mb.cpu_mut();
                alu::sub(&mut cpu.flags, width, a, b, 0);
            }
            mb.cpu_mut().di = advance(di, width, df);
        }
    }
}

fn exec_string_op<T: Bus>(mb: &mut T, op: u8, prefixes: &Prefixes) {
    let width = if op & 1 == 1 { Width::Word } else { Width::Byte };
    let kind = match op {
        0xA4 | 0xA5 => StringKind::Movs,
        0xA6 | 0xA7 => StringKind::Cmps,
        0xAA | 0xAB => StringKind::Stos,
        0xAC | 0xAD => StringKind::Lods,
        0xAE | 0xAF => StringKind::Scas,
        _ => unreachable!(),
    };

    match prefixes.rep {
        None => run_string_primitive(mb, kind, width),
        Some(rep) => loop {
            if mb.cpu().cx == 0 {
                break;
            }
            run_string_primitive(mb, kind, width);
            let cx = mb.cpu().cx.wrapping_sub(1);
            mb.cpu_mut().cx = cx;
            if matches!(kind, StringKind::Cmps | StringKind::Scas) {
                let zf = mb.cpu().flags.contains(Flags::ZF);
                if zf != rep.z_condition() {
                    break;
                }
            }
            if mb.cpu().cx == 0 {
                break;
            }
        },
    }
}

// ---- singleton opcodes ------------------------------------------------------

fn exec_singleton<T: Bus>(mb: &mut T, op: u8) {
    match op {
        0x06 => {
            let v = mb.cpu().es;
            push16(mb, v);
        }
        0x07 => {
            let v = pop16(mb);
            mb.cpu_mut().es = v;
        }
        0x0E => {
            let v = mb.cpu().cs;
            push16(mb, v);
        }
        0x16 => {
            let v = mb.cpu().ss;
            push16(mb, v);
        }
        0x17 => {
            let v = pop16(mb);
            mb.cpu_mut().ss = v;
        }
        0x1E => {
            let v = mb.cpu().ds;
            push16(mb, v);
        }
        0x1F => {
            let v = pop16(mb);
            mb.cpu_mut().ds = v;
        }
        0x84 | 0x85 => {
            let width = if op == 0x85 { Width::Word } else { Width::Byte };
            let modrm = read_modrm(mb);
            let a = read_rm(mb, &modrm, width);
            let b = read_reg_field(mb, &modrm, width);
            let cpu = mb.cpu_mut();
            alu::test(&mut cpu.flags, width, a, b);
        }
        0x86 | 0x87 => {
            let width = if op == 0x87 { Width::Word } else { Width::Byte };
            let modrm = read_modrm(mb);
            let a = read_rm(mb, &modrm, width);
            let b = read_reg_field(mb, &modrm, width);
            write_rm(mb, &modrm, width, b);
            write_reg_field(mb, &modrm, width, a);
        }
        0x8C | 0x8E => {
            let modrm = read_modrm(mb);
            let sreg = SegReg::from_field(modrm.reg);
            if op == 0x8C {
                let v = mb.cpu().get_seg(sreg) as u32;
                write_rm(mb, &modrm, Width::Word, v);
            } else {
                let v = read_rm(mb, &modrm, Width::Word) as u16;
                mb.cpu_mut().set_seg(sreg, v);
            }
        }
        0x8D => {
            // LEA wants the 16-bit offset only, never the segment fold,
            // so compute the effective address directly rather than
            // through `modrm_addr`.
            let modrm = read_modrm(mb);
            let cpu = mb.cpu();
            let ea = effective_address(modrm.rm, modrm.md, modrm.disp, cpu.bx, cpu.bp, cpu.si, cpu.di);
            write_reg_field(mb, &modrm, Width::Word, ea.offset as u32);
        }
        0x8F => {
            let modrm = read_modrm(mb);
            let v = pop16(mb);
            write_rm(mb, &modrm, Width::Word, v as u32);
        }
        0x98 => {
            let al = mb.cpu().get_reg8(Reg8::AL);
            mb.cpu_mut().ax = (al as i8) as i16 as u16;
        }
        0x99 => {
            let ax = mb.cpu().ax;
            mb.cpu_mut().dx = if (ax as i16) < 0 { 0xFFFF } else { 0x0000 };
        }
        0x9A => {
            let new_ip = fetch_u16(mb);
            let new_cs = fetch_u16(mb);
            let cs = mb.cpu().cs;
            push16(mb, cs);
            let ip = mb.cpu().ip;
            push16(mb, ip);
            mb.cpu_mut().cs = new_cs;
            mb.cpu_mut().ip = new_ip;
        }
        0x9C => {
            let flags = mb.cpu().flags.bits();
            push16(mb, flags);
        }
        0x9D => {
            let v = pop16(mb);
            mb.cpu_mut().flags = Flags::from_bits_truncate(super::regs::canonicalize(v));
        }
        0x9E => {
            let ah = mb.cpu().get_reg8(Reg8::AH);
            let preserved = mb.cpu().flags.bits() & 0xFF00;
            mb.cpu_mut().flags =
                Flags::from_bits_truncate(super::regs::canonicalize(preserved | u16::from(ah)));
        }
        0x9F => {
            let low = mb.cpu().flags.bits() as u8;
            mb.cpu_mut().set_reg8(Reg8::AH, low);
        }
        0xA0 => {
            let off = fetch_u16(mb);
            let seg = mb.cpu().data_seg();
            let v = mb.mem().read_seg_u8(seg, off);
            mb.cpu_mut().set_reg8(Reg8::AL, v);
        }
        0xA1 => {
            let off = fetch_u16(mb);
            let seg = mb.cpu().data_seg();
            let v = mb.mem().read_seg_u16(seg, off);
            mb.cpu_mut().ax = v;
        }
        0xA2 => {
            let off = fetch_u16(mb);
            let seg = mb.cpu().data_seg();
            let al = mb.cpu().get_reg8(Reg8::AL);
            mb.mem_mut().write_seg_u8(seg, off, al);
        }
        0xA3 => {
            let off = fetch_u16(mb);
            let seg = mb.cpu().data_seg();
            let ax = mb.cpu().ax;
            mb.mem_mut().write_seg_u16(seg, off, ax);
        }
        0xA8 => {
            let imm = fetch_u8(mb) as u32;
            let al = mb.cpu().get_reg8(Reg8::AL) as u32;
            let cpu = mb.cpu_mut();
            alu::test(&mut cpu.flags, Width::Byte, al, imm);
        }
        0xA9 => {
            let imm = fetch_u16(mb) as u32;
            let ax = mb.cpu().ax as u32;
            let cpu = mb.cpu_mut();
            alu::test(&mut cpu.flags, Width::Word, ax, imm);
        }
        0xC2 => {
            let imm = fetch_u16(mb);
            let ip = pop16(mb);
            mb.cpu_mut().ip = ip;
            let sp = mb.cpu().sp.wrapping_add(imm);
            mb.cpu_mut().sp = sp;
        }
        0xC3 => {
            let ip = pop16(mb);
            mb.cpu_mut().ip = ip;
        }
        0xC4 | 0xC5 => {
            let modrm = read_modrm(mb);
            let addr = modrm_addr(mb, &modrm);
            let off = mb.mem().load_u16(addr);
            let seg = mb.mem().load_u16(addr.wrapping_add(2));
            write_reg_field(mb, &modrm, Width::Word, off as u32);
            if op == 0xC4 {
                mb.cpu_mut().es = seg;
            } else {
                mb.cpu_mut().ds = seg;
            }
        }
        0xC6 | 0xC7 => {
            let width = if op == 0xC7 { Width::Word } else { Width::Byte };
            let modrm = read_modrm(mb);
            let imm = if width == Width::Word {
                fetch_u16(mb) as u32
            } else {
                fetch_u8(mb) as u32
            };
            write_rm(mb, &modrm, width, imm);
        }
        0xCA => {
            let imm = fetch_u16(mb);
            let ip = pop16(mb);
            let cs = pop16(mb);
            mb.cpu_mut().ip = ip;
            mb.cpu_mut().cs = cs;
            let sp = mb.cpu().sp.wrapping_add(imm);
            mb.cpu_mut().sp = sp;
        }
        0xCB => {
            let ip = pop16(mb);
            let cs = pop16(mb);
            mb.cpu_mut().ip = ip;
            mb.cpu_mut().cs = cs;
        }
        0xCC => mb.cpu_mut().int_src = Some(3),
        0xCD => {
            let vec = fetch_u8(mb);
            mb.cpu_mut().int_src = Some(vec);
        }
        0xCE => {
            if mb.cpu().flags.contains(Flags::OF) {
                mb.cpu_mut().int_src = Some(4);
            }
        }
        0xCF => {
            let (cpu, mem) = mb.cpu_and_mem_mut();
            interrupt::iret(cpu, mem);
        }
        0xD7 => {
            let seg = mb.cpu().data_seg();
            let bx = mb.cpu().bx;
            let al = mb.cpu().get_reg8(Reg8::AL);
            let off = bx.wrapping_add(u16::from(al));
            let v = mb.mem().read_seg_u8(seg, off);
            mb.cpu_mut().set_reg8(Reg8::AL, v);
        }
        0xE0 | 0xE1 | 0xE2 => {
            let disp = fetch_u8(mb) as i8;
            let cx = mb.cpu().cx.wrapping_sub(1);
            mb.cpu_mut().cx = cx;
            let take = match op {
                0xE0 => cx != 0 && !mb.cpu().flags.contains(Flags::ZF),
                0xE1 => cx != 0 && mb.cpu().flags.contains(Flags::ZF),
                0xE2 => cx != 0,
                _ => unreachable!(),
            };
            if take {
                let ip = mb.cpu().ip;
                mb.cpu_mut().ip = ip.wrapping_add(disp as i16 as u16);
            }
        }
        0xE4 => {
            let port = fetch_u8(mb) as u16;
            let v = mb.port_in(port, PortWidth::Byte) as u8;
            mb.cpu_mut().set_reg8(Reg8::AL, v);
        }
        0xE5 => {
            let port = fetch_u8(mb) as u16;
            let v = mb.port_in(port, PortWidth::Word);
            mb.cpu_mut().ax = v;
        }
        0xE6 => {
            let port = fetch_u8(mb) as u16;
            let al = mb.cpu().get_reg8(Reg8::AL);
            mb.port_out(port, PortWidth::Byte, u16::from(al));
        }
        0xE7 => {
            let port = fetch_u8(mb) as u16;
            let ax = mb.cpu().ax;
            mb.port_out(port, PortWidth::Word, ax);
        }
        0xE8 => {
            let rel = fetch_u16(mb) as i16;
            let ip = mb.cpu().ip;
            push16(mb, ip);
            mb.cpu_mut().ip = ip.wrapping_add(rel as u16);
        }
        0xE9 => {
            let rel = fetch_u16(mb) as i16;
            let ip = mb.cpu().ip;
            mb.cpu_mut().ip = ip.wrapping_add(rel as u16);
        }
        0xEA => {
            let new_ip = fetch_u16(mb);
            let new_cs = fetch_u16(mb);
            mb.cpu_mut().ip = new_ip;
            mb.cpu_mut().cs = new_cs;
        }
        0xEB => {
            let rel = fetch_u8(mb) as i8;
            let ip = mb.cpu().ip;
            mb.cpu_mut().ip = ip.wrapping_add(rel as i16 as u16);
        }
        0xEC => {
            let port = mb.cpu().dx;
            let v = mb.port_in(port, PortWidth::Byte) as u8;
            mb.cpu_mut().set_reg8(Reg8::AL, v);
        }
        0xED => {
            let port = mb.cpu().dx;
            let v = mb.port_in(port, PortWidth::Word);
            mb.cpu_mut().ax = v;
        }
        0xEE => {
            let port = mb.cpu().dx;
            let al = mb.cpu().get_reg8(Reg8::AL);
            mb.port_out(port, PortWidth::Byte, u16::from(al));
        }
        0xEF => {
            let port = mb.cpu().dx;
            let ax = mb.cpu().ax;
            mb.port_out(port, PortWidth::Word, ax);
        }
        0xF4 => mb.cpu_mut().halted = true,
        0xF5 => {
            let cf = mb.cpu().flags.contains(Flags::CF);
            mb.cpu_mut().flags.set(Flags::CF, !cf);
        }
        0xF6 | 0xF7 => exec_group_f6_f7(mb, op),
        0xF8 => mb.cpu_mut().flags.remove(Flags::CF),
        0xF9 => mb.cpu_mut().flags.insert(Flags::CF),
        0xFA => mb.cpu_mut().flags.remove(Flags::IF),
        0xFB => mb.cpu_mut().flags.insert(Flags::IF),
        0xFC => mb.cpu_mut().flags.remove(Flags::DF),
        0xFD => mb.cpu_mut().flags.insert(Flags::DF),
        0xFE => {
            let modrm = read_modrm(mb);
            let val = read_rm(mb, &modrm, Width::Byte);
            let result = {
                let cpu = mb.cpu_mut();
                match modrm.reg & 0x7 {
                    0 => alu::inc(&mut cpu.flags, Width::Byte, val),
                    1 => alu::dec(&mut cpu.flags, Width::Byte, val),
                    _ => val, // undefined sub-opcodes: no-op rather than UB
                }
            };
            write_rm(mb, &modrm, Width::Byte, result);
        }
        0xFF => exec_group_ff(mb),
        _ => {
            log::error!(
                "illegal opcode {:02X} at {:04X}:{:04X}",
                op,
                mb.cpu().cs,
                mb.cpu().ip
            );
            mb.cpu_mut().halted = true;
        }
    }
}

fn exec_group_f6_f7<T: Bus>(mb: &mut T, op: u8) {
    let width = if op == 0xF7 { Width::Word } else { Width::Byte };
    let modrm = read_modrm(mb);
    match modrm.reg & 0x7 {
        0 | 1 => {
            let imm = if width == Width::Word {
                fetch_u16(mb) as u32
            } else {
                fetch_u8(mb) as u32
            };
            let val = read_rm(mb, &modrm, width);
            let cpu = mb.cpu_mut();
            alu::test(&mut cpu.flags, width, val, imm);
        }
        2 => {
            let val = read_rm(mb, &modrm, width);
            write_rm(mb, &modrm, width, !val & width_mask(width));
        }
        3 => {
            let val = read_rm(mb, &modrm, width);
            let result = {
                let cpu = mb.cpu_mut();
                alu::neg(&mut cpu.flags, width, val)
            };
            write_rm(mb, &modrm, width, result);
        }
        4 => exec_mul(mb, &modrm, width),
        5 => exec_imul(mb, &modrm, width),
        6 => exec_div(mb, &modrm, width),
        7 => exec_idiv(mb, &modrm, width),
        _ => unreachable!(),
    }
}

fn width_mask(width: Width) -> u32 {
    match width {
        Width::Byte => 0xFF,
        Width::Word => 0xFFFF,
    }
}

fn exec_mul<T: Bus>(mb: &mut T, modrm: &ModRm, width: Width) {
    let operand = read_rm(mb, modrm, width);
    let acc = match width {
        Width::Byte => u32::from(mb.cpu().get_reg8(Reg8::AL)),
        Width::Word => u32::from(mb.cpu().ax),
    };
    let product = {
        let cpu = mb.cpu_mut();
        alu::mul(&mut cpu.flags, width, acc, operand)
    };
    match width {
        Width::Byte => mb.cpu_mut().ax = product as u16,
        Width::Word => {
            mb.cpu_mut().ax = product as u16;
            mb.cpu_mut().dx = (product >> 16) as u16;
        }
    }
}

fn exec_imul<T: Bus>(mb: &mut T, modrm: &ModRm, width: Width) {
    let operand = read_rm(mb, modrm, width);
    let acc = match width {
        Width::Byte => u32::from(mb.cpu().get_reg8(Reg8::AL)),
        Width::Word => u32::from(mb.cpu().ax),
    };
    let product = {
        let cpu = mb.cpu_mut();
        alu::imul(&mut cpu.flags, width, acc, operand)
    };
    let bits = product as u64 as u32;
    match width {
        Width::Byte => mb.cpu_mut().ax = (bits & 0xFFFF) as u16,
        Width::Word => {
            mb.cpu_mut().ax = (bits & 0xFFFF) as u16;
            mb.cpu_mut().dx = ((bits >> 16) & 0xFFFF) as u16;
        }
    }
}

fn exec_div<T: Bus>(mb: &mut T, modrm: &ModRm, width: Width) {
    let divisor = read_rm(mb, modrm, width);
    let dividend = match width {
        Width::Byte => u32::from(mb.cpu().ax),
        Width::Word => (u32::from(mb.cpu().dx) << 16) | u32::from(mb.cpu().ax),
    };
    match alu::div(width, dividend, divisor) {
        Some(DivResult {
            quotient,
            remainder,
        }) => match width {
            Width::Byte => {
                mb.cpu_mut().set_reg8(Reg8::AL, quotient as u8);
                mb.cpu_mut().set_reg8(Reg8::AH, remainder as u8);
            }
            Width::Word => {
                mb.cpu_mut().ax = quotient as u16;
                mb.cpu_mut().dx = remainder as u16;
            }
        },
        None => raise_divide_fault(mb),
    }
}

fn exec_idiv<T: Bus>(mb: &mut T, modrm: &ModRm, width: Width) {
    let divisor_raw = read_rm(mb, modrm, width);
    let divisor = sign_extend(divisor_raw, width);
    let dividend: i64 = match width {
        Width::Byte => i64::from(mb.cpu().ax as i16),
        Width::Word => {
            let combined = (u32::from(mb.cpu().dx) << 16) | u32::from(mb.cpu().ax);
            i64::from(combined as i32)
        }
    };
    match alu::idiv(width, dividend, divisor) {
        Some(DivResult {
            quotient,
            remainder,
        }) => match width {
            Width::Byte => {
                mb.cpu_mut().set_reg8(Reg8::AL, quotient as u8);
                mb.cpu_mut().set_reg8(Reg8::AH, remainder as u8);
            }
            Width::Word => {
                mb.cpu_mut().ax = quotient as u16;
                mb.cpu_mut().dx = remainder as u16;
            }
        },
        None => raise_divide_fault(mb),
    }
}

fn sign_extend(val: u32, width: Width) -> i64 {
    match width {
        Width::Byte => i64::from(val as u8 as i8),
        Width::Word => i64::from(val as u16 as i16),
    }
}

fn raise_divide_fault<T: Bus>(mb: &mut T) {
    let ax = mb.cpu().ax;
    {
        let cpu = mb.cpu_mut();
        interrupt::divide_fault_flags(&mut cpu.flags, ax);
    }
    mb.cpu_mut().int_src = Some(0);
}

fn exec_group_ff<T: Bus>(mb: &mut T) {
    let modrm = read_modrm(mb);
    match modrm.reg & 0x7 {
        0 => {
            let val = read_rm(mb, &modrm, Width::Word);
            let result = {
                let cpu = mb.cpu_mut();
                alu::inc(&mut cpu.flags, Width::Word, val)
            };
            write_rm(mb, &modrm, Width::Word, result);
        }
        1 => {
            let val = read_rm(mb, &modrm, Width::Word);
            let result = {
                let cpu = mb.cpu_mut();
                alu::dec(&mut cpu.flags, Width::Word, val)
            };
            write_rm(mb, &modrm, Width::Word, result);
        }
        2 => {
            // CALL near indirect
            let target = read_rm(mb, &modrm, Width::Word) as u16;
            let ip = mb.cpu().ip;
            push16(mb, ip);
            mb.cpu_mut().ip = target;
        }
        3 => {
            // CALL far indirect: operand is a pointer to a far address
            let addr = modrm_addr(mb, &modrm);
            let new_ip = mb.mem().load_u16(addr);
            let new_cs = mb.mem().load_u16(addr.wrapping_add(2));
            let cs = mb.cpu().cs;
            push16(mb, cs);
            let ip = mb.cpu().ip;
            push16(mb, ip);
            mb.cpu_mut().cs = new_cs;
            mb.cpu_mut().ip = new_ip;
        }
        4 => {
            // JMP near indirect
            let target = read_rm(mb, &modrm, Width::Word) as u16;
            mb.cpu_mut().ip = target;
        }
        5 => {
            // JMP far indirect
            let addr = modrm_addr(mb, &modrm);
            let new_ip = mb.mem().load_u16(addr);
            let new_cs = mb.mem().load_u16(addr.wrapping_add(2));
            mb.cpu_mut().ip = new_ip;
            mb.cpu_mut().cs = new_cs;
        }
        6 => {
            // PUSH m16: predecrement SP, then read the operand using the
            // already-adjusted SP- the canonical 8086 quirk (§4.4).
            let sp = mb.cpu().sp.wrapping_sub(2);
            mb.cpu_mut().sp = sp;
            let val = read_rm(mb, &modrm, Width::Word);
            let ss = mb.cpu().ss;
            let sp = mb.cpu().sp;
            mb.mem_mut().write_seg_u16(ss, sp, val as u16);
        }
        _ => {
            log::warn!("group FF /7 has no defined operation");
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::bus::{Bus, PortWidth};
    use crate::cpu::regs::Flags;
    use crate::machine::Machine;

    fn mb_with(bytes: &[u8]) -> Machine {
        let mut mb = Machine::new();
        mb.load_program(0, 0, bytes);
        mb
    }

    #[test]
    fn group_ff_6_decrements_sp_before_reading_the_operand() {
        // push word ptr [bx] ; bx points at a known word in DS.
        let mut mb = mb_with(&[0xFF, 0x37]);
        mb.cpu_state_mut().bx = 0x0050;
        mb.cpu_state_mut().sp = 0x0100;
        mb.memory_mut().store_u16(0x0050, 0xBEEF);
        mb.step();
        assert_eq!(mb.cpu_state().sp, 0x00FE);
        assert_eq!(mb.memory().read_seg_u16(0, 0x00FE), 0xBEEF);
    }

    #[test]
    fn fe_group_dispatches_inc_and_dec_on_the_reg_field() {
        // inc al (reg field 0, mod=11 rm=AL)
        let mut mb = mb_with(&[0xFE, 0xC0]);
        mb.cpu_state_mut().set_reg8(super::Reg8::AL, 0x7F);
        mb.step();
        assert_eq!(mb.cpu_state().get_reg8(super::Reg8::AL), 0x80);

        // dec cl (reg field 1, mod=11 rm=CL)
        let mut mb = mb_with(&[0xFE, 0xC9]);
        mb.cpu_state_mut().set_reg8(super::Reg8::CL, 0x01);
        mb.step();
        assert_eq!(mb.cpu_state().get_reg8(super::Reg8::CL), 0x00);
    }

    #[test]
    fn fe_group_undefined_reg_field_leaves_the_operand_unchanged() {
        // reg field 5 is undefined for group FE; operand passes through.
        let mut mb = mb_with(&[0xFE, 0xE8]);
        mb.cpu_state_mut().set_reg8(super::Reg8::AL, 0x10);
        mb.step();
        assert_eq!(mb.cpu_state().get_reg8(super::Reg8::AL), 0x10);
    }

    #[test]
    fn segment_override_persists_across_every_rep_movsb_iteration() {
        // es: rep movsb, with ds pointed somewhere that would corrupt the
        // copy if the override were dropped after the first iteration.
        let mut mb = mb_with(&[0x26, 0xF3, 0xA4]);
        mb.cpu_state_mut().ds = 0x1000;
        mb.cpu_state_mut().es = 0x2000;
        mb.cpu_state_mut().si = 0;
        mb.cpu_state_mut().di = 0x0100;
        mb.cpu_state_mut().cx = 3;
        for (i, b) in [0xAA, 0xBB, 0xCC].iter().enumerate() {
            mb.memory_mut()
                .write_seg_u8(0x2000, i as u16, *b);
        }
        mb.step();
        assert_eq!(mb.cpu_state().cx, 0);
        assert_eq!(mb.memory().read_seg_u8(0x2000, 0x0100), 0xAA);
        assert_eq!(mb.memory().read_seg_u8(0x2000, 0x0101), 0xBB);
        assert_eq!(mb.memory().read_seg_u8(0x2000, 0x0102), 0xCC);
    }

    #[test]
    fn segment_register_push_pop_round_trips_through_the_stack() {
        // push es; pop ds
        let mut mb = mb_with(&[0x06, 0x1F]);
        mb.cpu_state_mut().es = 0x3456;
        mb.cpu_state_mut().sp = 0x0100;
        mb.step();
        mb.step();
        assert_eq!(mb.cpu_state().ds, 0x3456);
        assert_eq!(mb.cpu_state().sp, 0x0100);
    }

    #[test]
    fn xchg_rm_swaps_register_and_accumulator() {
        // xchg bl, al
        let mut mb = mb_with(&[0x86, 0xC3]);
        mb.cpu_state_mut().set_reg8(super::Reg8::AL, 1);
        mb.cpu_state_mut().set_reg8(super::Reg8::BL, 2);
        mb.step();
        assert_eq!(mb.cpu_state().get_reg8(super::Reg8::AL), 2);
        assert_eq!(mb.cpu_state().get_reg8(super::Reg8::BL), 1);
    }

    #[test]
    fn les_loads_both_the_offset_register_and_es() {
        // les bx, [0x2000]
        let mut mb = mb_with(&[0xC4, 0x1E, 0x00, 0x20]);
        mb.memory_mut().store_u16(0x2000, 0x0040);
        mb.memory_mut().store_u16(0x2002, 0x0050);
        mb.step();
        assert_eq!(mb.cpu_state().bx, 0x0040);
        assert_eq!(mb.cpu_state().es, 0x0050);
    }

    #[test]
    fn callf_then_retf_restores_the_caller_cs_ip() {
        // at 0x0000:0x0000: callf 0x0050:0x0010
        let mut mb = mb_with(&[0x9A, 0x10, 0x00, 0x50, 0x00]);
        mb.cpu_state_mut().sp = 0x0100;
        // at the call target, a single retf.
        mb.memory_mut()
            .load_image(crate::memory::physical_addr(0x0050, 0x0010), &[0xCB]);
        mb.step(); // callf
        assert_eq!(mb.cpu_state().cs, 0x0050);
        assert_eq!(mb.cpu_state().ip, 0x0010);
        mb.step(); // retf
        assert_eq!(mb.cpu_state().cs, 0x0000);
        assert_eq!(mb.cpu_state().ip, 0x0005);
        assert_eq!(mb.cpu_state().sp, 0x0100);
    }

    #[test]
    fn int_instruction_vectors_through_the_ivt_and_iret_restores_state() {
        // int 0x21 ; the handler is a single iret. Caller stays at cs 0,
        // the segment `mb_with`'s load_program already pointed cs:ip at.
        let mut mb = mb_with(&[0xCD, 0x21]);
        mb.cpu_state_mut().sp = 0x0100;
        mb.memory_mut().store_u16(0x21 * 4, 0x0200); // handler ip
        mb.memory_mut().store_u16(0x21 * 4 + 2, 0x0050); // handler cs
        mb.memory_mut()
            .load_image(crate::memory::physical_addr(0x0050, 0x0200), &[0xCF]);
        mb.step(); // int 0x21, software source outranks the interrupt poll
        assert_eq!(mb.cpu_state().cs, 0x0050);
        assert_eq!(mb.cpu_state().ip, 0x0200);
        mb.step(); // iret
        assert_eq!(mb.cpu_state().cs, 0x0000);
        assert_eq!(mb.cpu_state().ip, 0x0002);
        assert_eq!(mb.cpu_state().sp, 0x0100);
    }

    #[test]
    fn loop_decrements_cx_and_branches_while_nonzero() {
        // loop $-2, cx = 2: both passes should branch until cx hits zero.
        let mut mb = mb_with(&[0xE2, 0xFE]);
        mb.cpu_state_mut().cx = 2;
        mb.step();
        assert_eq!(mb.cpu_state().cx, 1);
        assert_eq!(mb.cpu_state().ip, 0); // branch taken, back to the loop byte
        mb.step();
        assert_eq!(mb.cpu_state().cx, 0);
        assert_eq!(mb.cpu_state().ip, 2); // falls through once cx hits zero
    }

    #[test]
    fn loopnz_stops_early_once_zf_is_set() {
        let mut mb = mb_with(&[0xE0, 0xFE]);
        mb.cpu_state_mut().cx = 5;
        mb.cpu_state_mut().flags.insert(Flags::ZF);
        mb.step();
        assert_eq!(mb.cpu_state().cx, 4);
        assert_eq!(mb.cpu_state().ip, 2); // zf set -> no branch despite cx != 0
    }

    #[test]
    fn shift_by_cl_shifts_the_operand_by_the_register_count() {
        // shl ax, cl
        let mut mb = mb_with(&[0xD3, 0xE0]);
        mb.cpu_state_mut().ax = 0x0001;
        mb.cpu_state_mut().set_reg8(super::Reg8::CL, 3);
        mb.step();
        assert_eq!(mb.cpu_state().ax, 0x0008);
    }

    #[test]
    fn repe_cmpsb_stops_at_the_first_mismatch() {
        // repe cmpsb, comparing four bytes that mismatch at index 2.
        let mut mb = mb_with(&[0xF3, 0xA6]);
        mb.cpu_state_mut().ds = 0;
        mb.cpu_state_mut().es = 0;
        mb.cpu_state_mut().si = 0x0100;
        mb.cpu_state_mut().di = 0x0200;
        mb.cpu_state_mut().cx = 4;
        for i in 0..4u16 {
            mb.memory_mut().store_u8(0x0100 + i as u32, 5);
            mb.memory_mut().store_u8(0x0200 + i as u32, 5);
        }
        mb.memory_mut().store_u8(0x0102, 9); // mismatch at the third byte
        mb.step();
        assert_eq!(mb.cpu_state().cx, 1); // stopped after comparing 3 bytes
        assert_eq!(mb.cpu_state().si, 0x0103);
        assert_eq!(mb.cpu_state().di, 0x0203);
    }

    #[test]
    fn group_f6_7_div_dispatches_to_unsigned_divide() {
        // div cl
        let mut mb = mb_with(&[0xF6, 0xF1]);
        mb.cpu_state_mut().ax = 20;
        mb.cpu_state_mut().set_reg8(super::Reg8::CL, 6);
        mb.step();
        assert_eq!(mb.cpu_state().get_reg8(super::Reg8::AL), 3); // quotient
        assert_eq!(mb.cpu_state().get_reg8(super::Reg8::AH), 2); // remainder
    }

    #[test]
    fn group_f6_7_mul_dispatches_to_unsigned_multiply() {
        // mul cl
        let mut mb = mb_with(&[0xF6, 0xE1]);
        mb.cpu_state_mut().set_reg8(super::Reg8::AL, 12);
        mb.cpu_state_mut().set_reg8(super::Reg8::CL, 12);
        mb.step();
        assert_eq!(mb.cpu_state().ax, 144);
    }

    #[test]
    fn port_out_to_exit_port_records_the_code() {
        let mut mb = mb_with(&[]);
        mb.port_out(0xFF, PortWidth::Byte, 42);
        assert_eq!(mb.exit_code(), Some(42));
    }
}
