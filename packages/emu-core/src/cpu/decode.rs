//! Layer 1 (opcode class) and layer 2 (ModR/M) decoding, plus
//! effective-address computation.

use super::regs::{DefaultSeg, Reg16, SegReg};

/// The fourteen opcode classes of §4.2, in priority order of match, plus
/// a catch-all for the explicit singleton opcodes handled outside the
/// class table.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum OpClass {
    /// ALU r/m <-> reg (8 group ops + MOV)
    AluRm,
    /// ALU AX/AL <-> imm
    AluAcc,
    IncR16,
    DecR16,
    PushR16,
    PopR16,
    XchgAccR16,
    MovR16Imm,
    MovR8Imm,
    CondBranch,
    /// immediate-form ALU, group 80..83
    AluImm,
    /// shift/rotate group D0..D3
    ShiftRotate,
    StringOp,
    Prefix,
    Singleton,
}

/// Classify the primary opcode byte. Mirrors the mask table of §4.2
/// verbatim, in priority order- several masks overlap and the first match
/// wins.
pub fn classify(op: u8) -> OpClass {
    if (op & 0xC4) == 0x00 || (op & 0xFC) == 0x88 {
        OpClass::AluRm
    } else if (op & 0xC6) == 0x04 {
        OpClass::AluAcc
    } else if (op & 0xF8) == 0x40 {
        OpClass::IncR16
    } else if (op & 0xF8) == 0x48 {
        OpClass::DecR16
    } else if (op & 0xF8) == 0x50 {
        OpClass::PushR16
    } else if (op & 0xF8) == 0x58 {
        OpClass::PopR16
    } else if (op & 0xF8) == 0x90 {
        OpClass::XchgAccR16
    } else if (op & 0xF8) == 0xB8 {
        OpClass::MovR16Imm
    } else if (op & 0xF8) == 0xB0 {
        OpClass::MovR8Imm
    } else if (op & 0xF0) == 0x70 || op == 0xE3 {
        OpClass::CondBranch
    } else if (op & 0xFC) == 0x80 {
        OpClass::AluImm
    } else if (op & 0xFC) == 0xD0 {
        OpClass::ShiftRotate
    } else if (op & 0xF4) == 0xA4 || (op & 0xFE) == 0xAA {
        OpClass::StringOp
    } else if (op & 0xFC) == 0xF0 || (op & 0xE7) == 0x26 {
        OpClass::Prefix
    } else {
        OpClass::Singleton
    }
}

/// REPNE (F2) vs REPE/REP (F3). The "Z bit" referred to in §4.4 step 5 is
/// `true` for REPE/REP and `false` for REPNE.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum RepKind {
    Repne,
    Repe,
}

impl RepKind {
    pub fn z_condition(self) -> bool {
        matches!(self, RepKind::Repe)
    }
}

/// Accumulated prefix state for the instruction being decoded.
#[derive(Debug, Default, Copy, Clone)]
pub struct Prefixes {
    pub rep: Option<RepKind>,
    pub seg_override: Option<SegReg>,
}

/// Consume a single prefix byte, updating `prefixes`. Returns `true` if
/// `op` was in fact a prefix byte (caller should fetch another byte and
/// try again).
pub fn consume_prefix(op: u8, prefixes: &mut Prefixes) -> bool {
    match op {
        0xF0 => true,             // LOCK, ignored
        0xF2 => {
            prefixes.rep = Some(RepKind::Repne);
            true
        }
        0xF3 => {
            prefixes.rep = Some(RepKind::Repe);
            true
        }
        0x26 => {
            prefixes.seg_override = Some(SegReg::ES);
            true
        }
        0x2E => {
            prefixes.seg_override = Some(SegReg::CS);
            true
        }
        0x36 => {
            prefixes.seg_override = Some(SegReg::SS);
            true
        }
        0x3E => {
            prefixes.seg_override = Some(SegReg::DS);
            true
        }
        _ => false,
    }
}

/// A decoded ModR/M byte plus any trailing displacement.
#[derive(Debug, Copy, Clone)]
pub struct ModRm {
    pub md: u8,
    pub reg: u8,
    pub rm: u8,
    pub disp: i32,
}

impl ModRm {
    pub fn decode(byte: u8) -> ModRm {
        ModRm {
            md: (byte >> 6) & 0x3,
            reg: (byte >> 3) & 0x7,
            rm: byte & 0x7,
            disp: 0,
        }
    }

    /// Number of displacement bytes that follow the ModR/M byte itself
    /// (and, for `mod==00, rm==110`, the direct disp16 case).
    pub fn disp_len(&self) -> usize {
        match self.md {
            0b01 => 1,
            0b10 => 2,
            0b00 if self.rm == 0b110 => 2,
            _ => 0,
        }
    }

    pub fn is_register(&self) -> bool {
        self.md == 0b11
    }
}

/// The outcome of effective-address computation for a memory ModR/M:
/// the 16-bit offset and which segment it defaults to.
pub struct EffectiveAddress {
    pub offset: u16,
    pub default_seg: DefaultSeg,
}

/// Compute the effective address offset for a non-register ModR/M, per
/// the rm base table in §4.2. `regs` supplies the current BX/BP/SI/DI
/// values; `disp16` is the already-sign-extended or direct displacement.
pub fn effective_address(
    rm: u8,
    md: u8,
    disp: i32,
    bx: u16,
    bp: u16,
    si: u16,
    di: u16,
) -> EffectiveAddress {
    let (base, default_seg) = match rm {
        0b000 => (bx.wrapping_add(si), DefaultSeg::Ds),
        0b001 => (bx.wrapping_add(di), DefaultSeg::Ds),
        0b010 => (bp.wrapping_add(si), DefaultSeg::ImplicitSs),
        0b011 => (bp.wrapping_add(di), DefaultSeg::ImplicitSs),
        0b100 => (si, DefaultSeg::Ds),
        0b101 => (di, DefaultSeg::Ds),
        0b110 => {
            if md == 0b00 {
                (0u16, DefaultSeg::Ds) // direct disp16, no base
            } else {
                (bp, DefaultSeg::ImplicitSs)
            }
        }
        0b111 => (bx, DefaultSeg::Ds),
        _ => unreachable!(),
    };
    EffectiveAddress {
        offset: base.wrapping_add(disp as u16),
        default_seg,
    }
}

/// Selects the 16-bit register a ModR/M `rm` field names when `mod==11`.
pub fn rm_reg16(rm: u8) -> Reg16 {
    Reg16::from_field(rm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_mov_ax_imm16_as_mov_r16_imm() {
        assert_eq!(classify(0xB8), OpClass::MovR16Imm);
    }

    #[test]
    fn classifies_add_ax_imm_as_alu_acc() {
        assert_eq!(classify(0x05), OpClass::AluAcc);
    }

    #[test]
    fn bp_forms_default_to_ss() {
        let ea = effective_address(0b010, 0b00, 0, 0, 0x100, 0x10, 0);
        assert_eq!(ea.default_seg, DefaultSeg::ImplicitSs);
    }

    #[test]
    fn mod_00_rm_110_is_direct_address() {
        let modrm = ModRm::decode(0b00_000_110);
        assert_eq!(modrm.disp_len(), 2);
    }
}
