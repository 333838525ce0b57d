//! Decoder for the legacy 32-bit instruction set (fixed 4-byte, predicated
//! encodings).
//!
//! Subset notes: the program counter (register 15) is only reachable through
//! the branch forms; encodings that name r15 as a data-processing or
//! load/store operand decode as undefined rather than silently aliasing a
//! general register. Branch offsets are reported relative to the instruction
//! address (the architectural pc-plus-8 is folded in here, so downstream
//! consumers never see the pipeline offset).

use vesper_types::{Cond, RegOrSp, RegOrZr, Width};

use crate::inst::{A32AluOp, A32Operand2, AddrMode, Inst, ShiftKind};
use crate::DecodeError;

#[inline]
fn bits(word: u32, hi: u32, lo: u32) -> u32 {
    (word >> lo) & ((1 << (hi - lo + 1)) - 1)
}

#[inline]
fn bit(word: u32, pos: u32) -> bool {
    (word >> pos) & 1 != 0
}

fn undefined(word: u32) -> DecodeError {
    DecodeError::Undefined { word }
}

fn gpr(word: u32, field: u32) -> Result<RegOrZr, DecodeError> {
    let idx = bits(word, field + 3, field);
    if idx == 15 {
        return Err(undefined(word));
    }
    Ok(RegOrZr::from_bits(idx))
}

fn gpr_base(word: u32, field: u32) -> Result<RegOrSp, DecodeError> {
    let idx = bits(word, field + 3, field);
    if idx == 15 {
        return Err(undefined(word));
    }
    Ok(RegOrSp::from_bits(idx))
}

/// Decode one legacy-width instruction word.
pub fn decode(word: u32) -> Result<Inst, DecodeError> {
    let cond_bits = bits(word, 31, 28);
    if cond_bits == 0b1111 {
        // Unconditional space (BLX imm, preload hints, ...): outside the
        // supported subset.
        return Err(undefined(word));
    }
    let cond = Cond::from_bits(cond_bits);

    match bits(word, 27, 25) {
        0b000 | 0b001 => data_processing(word, cond),
        0b010 => load_store_imm(word, cond),
        0b101 => Ok(Inst::A32Branch {
            cond,
            offset: sext24(bits(word, 23, 0)) + 8,
            link: bit(word, 24),
        }),
        0b111 if bits(word, 27, 24) == 0b1111 => Ok(Inst::A32Svc {
            cond,
            imm: bits(word, 23, 0),
        }),
        _ => Err(undefined(word)),
    }
}

#[inline]
fn sext24(value: u32) -> i64 {
    (((value as i64) << 40) >> 40) << 2
}

fn alu_op(opcode: u32) -> A32AluOp {
    match opcode {
        0b0000 => A32AluOp::And,
        0b0001 => A32AluOp::Eor,
        0b0010 => A32AluOp::Sub,
        0b0011 => A32AluOp::Rsb,
        0b0100 => A32AluOp::Add,
        0b0101 => A32AluOp::Adc,
        0b0110 => A32AluOp::Sbc,
        0b0111 => A32AluOp::Rsc,
        0b1000 => A32AluOp::Tst,
        0b1001 => A32AluOp::Teq,
        0b1010 => A32AluOp::Cmp,
        0b1011 => A32AluOp::Cmn,
        0b1100 => A32AluOp::Orr,
        0b1101 => A32AluOp::Mov,
        0b1110 => A32AluOp::Bic,
        _ => A32AluOp::Mvn,
    }
}

impl A32AluOp {
    /// Compare/test group: no destination register, always sets flags.
    pub fn is_compare(self) -> bool {
        matches!(
            self,
            A32AluOp::Tst | A32AluOp::Teq | A32AluOp::Cmp | A32AluOp::Cmn
        )
    }

    /// MOV/MVN ignore `rn`.
    pub fn ignores_rn(self) -> bool {
        matches!(self, A32AluOp::Mov | A32AluOp::Mvn)
    }
}

fn data_processing(word: u32, cond: Cond) -> Result<Inst, DecodeError> {
    let immediate = bit(word, 25);
    let opcode = bits(word, 24, 21);
    let set_flags = bit(word, 20);

    // The compare group without S is the miscellaneous space (BX, MRS, ...).
    if (0b1000..=0b1011).contains(&opcode) && !set_flags {
        // BX rm: cond 0001_0010 1111_1111_1111 0001 rm
        if !immediate && bits(word, 27, 20) == 0b0001_0010 && bits(word, 19, 4) == 0xfff1 {
            return Ok(Inst::A32BranchExchange {
                cond,
                rm: gpr(word, 0)?,
            });
        }
        return Err(undefined(word));
    }

    let op = alu_op(opcode);

    let op2 = if immediate {
        let rot = bits(word, 11, 8) * 2;
        let imm8 = bits(word, 7, 0);
        let value = imm8.rotate_right(rot);
        A32Operand2::Imm {
            value,
            carry: if rot == 0 {
                None
            } else {
                Some(value & 0x8000_0000 != 0)
            },
        }
    } else {
        if bit(word, 4) {
            // Register-shifted-register operand: outside the subset.
            return Err(undefined(word));
        }
        let imm5 = bits(word, 11, 7);
        let (shift, amount) = match bits(word, 6, 5) {
            0b00 => (ShiftKind::Lsl, imm5),
            0b01 => (ShiftKind::Lsr, if imm5 == 0 { 32 } else { imm5 }),
            0b10 => (ShiftKind::Asr, if imm5 == 0 { 32 } else { imm5 }),
            // imm5 == 0 encodes RRX, represented as ROR #0.
            _ => (ShiftKind::Ror, imm5),
        };
        A32Operand2::ShiftedReg {
            rm: gpr(word, 0)?,
            shift,
            amount,
        }
    };

    let rd = if op.is_compare() {
        RegOrZr::Zr
    } else {
        gpr(word, 12)?
    };
    let rn = if op.ignores_rn() {
        RegOrZr::Zr
    } else {
        gpr(word, 16)?
    };

    Ok(Inst::A32Alu {
        cond,
        op,
        set_flags: set_flags || op.is_compare(),
        rd,
        rn,
        op2,
    })
}

fn load_store_imm(word: u32, cond: Cond) -> Result<Inst, DecodeError> {
    let pre = bit(word, 24);
    let up = bit(word, 23);
    let byte = bit(word, 22);
    let writeback = bit(word, 21);
    let load = bit(word, 20);

    let imm = bits(word, 11, 0) as i64;
    let offset = if up { imm } else { -imm };

    let mode = match (pre, writeback) {
        (true, false) => AddrMode::Offset,
        (true, true) => AddrMode::PreIndex,
        (false, false) => AddrMode::PostIndex,
        // P=0 W=1 is the unprivileged (LDRT/STRT) form.
        (false, true) => return Err(undefined(word)),
    };

    Ok(Inst::A32LoadStore {
        cond,
        load,
        byte,
        rt: gpr(word, 12)?,
        rn: gpr_base(word, 16)?,
        offset,
        mode,
    })
}

/// Width of an A32 load/store access.
pub fn a32_access_width(byte: bool) -> Width {
    if byte {
        Width::W8
    } else {
        Width::W32
    }
}
