//! Register file, flags, and the per-instruction transient state for the
//! 8086 CPU core.

/// An 8-bit general register, selected by a ModR/M `reg`/`rm` field when
/// the instruction's width bit selects byte operands.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Reg8 {
    AL,
    CL,
    DL,
    BL,
    AH,
    CH,
    DH,
    BH,
}

impl Reg8 {
    pub fn from_field(field: u8) -> Reg8 {
        match field & 0x7 {
            0 => Reg8::AL,
            1 => Reg8::CL,
            2 => Reg8::DL,
            3 => Reg8::BL,
            4 => Reg8::AH,
            5 => Reg8::CH,
            6 => Reg8::DH,
            7 => Reg8::BH,
            _ => unreachable!(),
        }
    }
}

/// A 16-bit general register, selected by a ModR/M `reg`/`rm` field when
/// the instruction's width bit selects word operands, or directly by the
/// low 3 bits of opcodes in classes 3 through 8.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Reg16 {
    AX,
    CX,
    DX,
    BX,
    SP,
    BP,
    SI,
    DI,
}

impl Reg16 {
    pub fn from_field(field: u8) -> Reg16 {
        match field & 0x7 {
            0 => Reg16::AX,
            1 => Reg16::CX,
            2 => Reg16::DX,
            3 => Reg16::BX,
            4 => Reg16::SP,
            5 => Reg16::BP,
            6 => Reg16::SI,
            7 => Reg16::DI,
            _ => unreachable!(),
        }
    }
}

/// A segment register, selected by the 2-bit `sr` sub-field of a handful
/// of opcodes (segment push/pop, MOV sreg, segment-override prefixes).
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum SegReg {
    ES,
    CS,
    SS,
    DS,
}

impl SegReg {
    pub fn from_field(field: u8) -> SegReg {
        match field & 0x3 {
            0 => SegReg::ES,
            1 => SegReg::CS,
            2 => SegReg::SS,
            3 => SegReg::DS,
            _ => unreachable!(),
        }
    }
}

bitflags! {
    /// The 8086 FLAGS register.
    ///
    /// Reserved bits are not part of the named set- they're handled
    /// separately by [`canonicalize`], since they always read back a fixed
    /// value rather than being independently settable.
    pub struct Flags: u16 {
        const CF = 0x0001;
        const PF = 0x0004;
        const AF = 0x0010;
        const ZF = 0x0040;
        const SF = 0x0080;
        const TF = 0x0100;
        const IF = 0x0200;
        const DF = 0x0400;
        const OF = 0x0800;

        /// Bits that must always read as 1: bit 1, and bits 15:12.
        const RESERVED_ON = 0xF002;
    }
}

/// Bits that must always read as 0 (bits 3 and 5).
const RESERVED_OFF: u16 = 0x0028;

/// Force the reserved bits of a raw flags word to their canonical 8086
/// values. Every flags write- whether from an ALU op or a POPF/IRET- must
/// be passed through this before being stored.
pub fn canonicalize(raw: u16) -> u16 {
    (raw | Flags::RESERVED_ON.bits()) & !RESERVED_OFF
}

/// The power-on FLAGS value: all flags clear, reserved bits canonical.
pub const FLAGS_POWERON: u16 = Flags::RESERVED_ON.bits();

/// Marks where an effective address's default segment came from, so that
/// an explicit override prefix can still win.
///
/// The source this is distilled from used a sentinel value of `-2` for
/// "implicit SS via a BP-based addressing form" layered on top of a
/// `-1` sentinel for "no override requested". Modeled here as two
/// independent booleans-worth of information instead of overloading one
/// integer.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum DefaultSeg {
    /// No BP-based addressing form was used; default segment is DS.
    Ds,
    /// A BP-based effective address was computed; default segment is SS,
    /// but an explicit override prefix still takes priority.
    ImplicitSs,
}

/// The complete visible and transient state of one 8086 core.
#[derive(Debug, Clone)]
pub struct CpuState {
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

    pub flags: Flags,

    /// Total number of instructions retired. Not architectural state- only
    /// used for debugging, tracing, and test comparison.
    pub tot_instructions: u64,

    /// Segment override selected by a prefix for the instruction currently
    /// executing. Cleared at the start of every instruction.
    pub seg_override: Option<SegReg>,
    /// Set by a BP-based effective-address computation, to signal that a
    /// missing `seg_override` should resolve to SS rather than DS.
    pub default_seg: DefaultSeg,
    /// Pending software/fault interrupt vector, set by INT/INTO/INT3 or a
    /// divide fault during the instruction just executed.
    pub int_src: Option<u8>,
    /// Set by HLT; cleared by any accepted interrupt.
    pub halted: bool,
}

impl CpuState {
    pub fn new() -> CpuState {
        CpuState {
            ax: 0,
            bx: 0,
            cx: 0,
            dx: 0,
            si: 0,
            di: 0,
            bp: 0,
            sp: 0,
            cs: 0xFFFF,
            ds: 0,
            es: 0,
            ss: 0,
            ip: 0,
            flags: Flags::from_bits_truncate(FLAGS_POWERON),
            tot_instructions: 0,
            seg_override: None,
            default_seg: DefaultSeg::Ds,
            int_src: None,
            halted: false,
        }
    }

    pub fn get_reg8(&self, reg: Reg8) -> u8 {
        match reg {
            Reg8::AL => self.ax as u8,
            Reg8::AH => (self.ax >> 8) as u8,
            Reg8::CL => self.cx as u8,
            Reg8::CH => (self.cx >> 8) as u8,
            Reg8::DL => self.dx as u8,
            Reg8::DH => (self.dx >> 8) as u8,
            Reg8::BL => self.bx as u8,
            Reg8::BH => (self.bx >> 8) as u8,
        }
    }

    pub fn set_reg8(&mut self, reg: Reg8, val: u8) {
        let val = u16::from(val);
        match reg {
            Reg8::AL => self.ax = (self.ax & 0xFF00) | val,
            Reg8::AH => self.ax = (self.ax & 0x00FF) | (val << 8),
            Reg8::CL => self.cx = (self.cx & 0xFF00) | val,
            Reg8::CH => self.cx = (self.cx & 0x00FF) | (val << 8),
            Reg8::DL => self.dx = (self.dx & 0xFF00) | val,
            Reg8::DH => self.dx = (self.dx & 0x00FF) | (val << 8),
            Reg8::BL => self.bx = (self.bx & 0xFF00) | val,
            Reg8::BH => self.bx = (self.bx & 0x00FF) | (val << 8),
        }
    }

    pub fn get_reg16(&self, reg: Reg16) -> u16 {
        match reg {
            Reg16::AX => self.ax,
            Reg16::CX => self.cx,
            Reg16::DX => self.dx,
            Reg16::BX => self.bx,
            Reg16::SP => self.sp,
            Reg16::BP => self.bp,
            Reg16::SI => self.si,
            Reg16::DI => self.di,
        }
    }

    pub fn set_reg16(&mut self, reg: Reg16, val: u16) {
        match reg {
            Reg16::AX => self.ax = val,
            Reg16::CX => self.cx = val,
            Reg16::DX => self.dx = val,
            Reg16::BX => self.bx = val,
            Reg16::SP => self.sp = val,
            Reg16::BP => self.bp = val,
            Reg16::SI => self.si = val,
            Reg16::DI => self.di = val,
        }
    }

    pub fn get_seg(&self, seg: SegReg) -> u16 {
        match seg {
            SegReg::ES => self.es,
            SegReg::CS => self.cs,
            SegReg::SS => self.ss,
            SegReg::DS => self.ds,
        }
    }

    pub fn set_seg(&mut self, seg: SegReg, val: u16) {
        match seg {
            SegReg::ES => self.es = val,
            SegReg::CS => self.cs = val,
            SegReg::SS => self.ss = val,
            SegReg::DS => self.ds = val,
        }
    }

    /// The segment to use for a memory reference that didn't pick its own
    /// (i.e. anything other than a BP-based effective address): the
    /// override if one was set by a prefix, else DS.
    pub fn data_seg(&self) -> u16 {
        match self.seg_override {
            Some(sr) => self.get_seg(sr),
            None => self.ds,
        }
    }

    /// The segment for an effective address computed this instruction,
    /// honoring both the override prefix and a BP-implied SS default.
    pub fn effective_seg(&self) -> u16 {
        match self.seg_override {
            Some(sr) => self.get_seg(sr),
            None => match self.default_seg {
                DefaultSeg::ImplicitSs => self.ss,
                DefaultSeg::Ds => self.ds,
            },
        }
    }

    /// Reset per-instruction transient state. Called at the start of every
    /// fetch, per invariant 3/4 (§3 of the design).
    pub fn begin_instruction(&mut self) {
        self.seg_override = None;
        self.default_seg = DefaultSeg::Ds;
        self.int_src = None;
    }
}

impl Default for CpuState {
    fn default() -> CpuState {
        CpuState::new()
    }
}
