//! Decoder for the compact 16-bit sub-mode of the legacy instruction set.
//!
//! Compact encodings are re-expressed as the equivalent legacy-width
//! [`Inst`] variants (condition `AL`, flag-setting where the compact forms
//! architecturally set flags) so the IR lowering has a single legacy path.
//! Branch offsets fold in the architectural pc-plus-4, mirroring the
//! legacy-width decoder's pc-plus-8 convention.

use vesper_types::{Cond, RegOrSp, RegOrZr};

use crate::inst::{A32AluOp, A32Operand2, AddrMode, Inst, ShiftKind};
use crate::DecodeError;

#[inline]
fn bits(half: u16, hi: u32, lo: u32) -> u32 {
    ((half >> lo) & ((1 << (hi - lo + 1)) - 1)) as u32
}

fn undefined(half: u16) -> DecodeError {
    DecodeError::Undefined { word: half as u32 }
}

#[inline]
fn lo_reg(half: u16, field: u32) -> RegOrZr {
    RegOrZr::from_bits(bits(half, field + 2, field))
}

fn imm_op2(value: u32) -> A32Operand2 {
    A32Operand2::Imm { value, carry: None }
}

fn alu(op: A32AluOp, set_flags: bool, rd: RegOrZr, rn: RegOrZr, op2: A32Operand2) -> Inst {
    Inst::A32Alu {
        cond: Cond::Al,
        op,
        set_flags,
        rd,
        rn,
        op2,
    }
}

/// Decode one compact halfword.
pub fn decode(half: u16) -> Result<Inst, DecodeError> {
    if half == 0xbf00 {
        return Ok(Inst::Nop);
    }

    match bits(half, 15, 13) {
        0b000 => {
            let op = bits(half, 12, 11);
            if op != 0b11 {
                // LSLS/LSRS/ASRS immediate.
                let imm5 = bits(half, 10, 6);
                let (shift, amount) = match op {
                    0b00 => (ShiftKind::Lsl, imm5),
                    0b01 => (ShiftKind::Lsr, if imm5 == 0 { 32 } else { imm5 }),
                    _ => (ShiftKind::Asr, if imm5 == 0 { 32 } else { imm5 }),
                };
                return Ok(alu(
                    A32AluOp::Mov,
                    true,
                    lo_reg(half, 0),
                    RegOrZr::Zr,
                    A32Operand2::ShiftedReg {
                        rm: lo_reg(half, 3),
                        shift,
                        amount,
                    },
                ));
            }
            // ADDS/SUBS register or 3-bit immediate.
            let sub = bits(half, 9, 9) != 0;
            let op = if sub { A32AluOp::Sub } else { A32AluOp::Add };
            let op2 = if bits(half, 10, 10) != 0 {
                imm_op2(bits(half, 8, 6))
            } else {
                A32Operand2::ShiftedReg {
                    rm: lo_reg(half, 6),
                    shift: ShiftKind::Lsl,
                    amount: 0,
                }
            };
            Ok(alu(op, true, lo_reg(half, 0), lo_reg(half, 3), op2))
        }
        0b001 => {
            // MOVS/CMP/ADDS/SUBS with 8-bit immediate.
            let rd = lo_reg(half, 8);
            let imm = imm_op2(bits(half, 7, 0));
            match bits(half, 12, 11) {
                0b00 => Ok(alu(A32AluOp::Mov, true, rd, RegOrZr::Zr, imm)),
                0b01 => Ok(alu(A32AluOp::Cmp, true, RegOrZr::Zr, rd, imm)),
                0b10 => Ok(alu(A32AluOp::Add, true, rd, rd, imm)),
                _ => Ok(alu(A32AluOp::Sub, true, rd, rd, imm)),
            }
        }
        0b010 => decode_010(half),
        0b011 => {
            // STR/LDR/STRB/LDRB with scaled 5-bit immediate.
            let byte = bits(half, 12, 12) != 0;
            let load = bits(half, 11, 11) != 0;
            let imm5 = bits(half, 10, 6) as i64;
            let rn = match lo_reg(half, 3) {
                RegOrZr::Reg(r) => RegOrSp::Reg(r),
                RegOrZr::Zr => unreachable!("3-bit register field"),
            };
            Ok(Inst::A32LoadStore {
                cond: Cond::Al,
                load,
                byte,
                rt: lo_reg(half, 0),
                rn,
                offset: if byte { imm5 } else { imm5 * 4 },
                mode: AddrMode::Offset,
            })
        }
        0b110 => {
            if bits(half, 12, 12) == 0 {
                return Err(undefined(half));
            }
            let cond_bits = bits(half, 11, 8);
            match cond_bits {
                0b1111 => Ok(Inst::A32Svc {
                    cond: Cond::Al,
                    imm: bits(half, 7, 0),
                }),
                0b1110 => Err(undefined(half)),
                _ => {
                    let imm8 = bits(half, 7, 0);
                    let offset = (((imm8 as i64) << 56) >> 56) * 2 + 4;
                    Ok(Inst::A32Branch {
                        cond: Cond::from_bits(cond_bits),
                        offset,
                        link: false,
                    })
                }
            }
        }
        0b111 => {
            if bits(half, 12, 11) != 0b00 {
                return Err(undefined(half));
            }
            let imm11 = bits(half, 10, 0);
            let offset = (((imm11 as i64) << 53) >> 53) * 2 + 4;
            Ok(Inst::A32Branch {
                cond: Cond::Al,
                offset,
                link: false,
            })
        }
        _ => Err(undefined(half)),
    }
}

fn decode_010(half: u16) -> Result<Inst, DecodeError> {
    // 010000: register ALU group.
    if bits(half, 15, 10) == 0b010000 {
        let rd = lo_reg(half, 0);
        let rm = lo_reg(half, 3);
        let reg_op2 = A32Operand2::ShiftedReg {
            rm,
            shift: ShiftKind::Lsl,
            amount: 0,
        };
        return match bits(half, 9, 6) {
            0b0000 => Ok(alu(A32AluOp::And, true, rd, rd, reg_op2)),
            0b0001 => Ok(alu(A32AluOp::Eor, true, rd, rd, reg_op2)),
            0b0101 => Ok(alu(A32AluOp::Adc, true, rd, rd, reg_op2)),
            0b0110 => Ok(alu(A32AluOp::Sbc, true, rd, rd, reg_op2)),
            0b1000 => Ok(alu(A32AluOp::Tst, true, RegOrZr::Zr, rd, reg_op2)),
            // NEG: RSBS rd, rm, #0.
            0b1001 => Ok(alu(A32AluOp::Rsb, true, rd, rm, imm_op2(0))),
            0b1010 => Ok(alu(A32AluOp::Cmp, true, RegOrZr::Zr, rd, reg_op2)),
            0b1011 => Ok(alu(A32AluOp::Cmn, true, RegOrZr::Zr, rd, reg_op2)),
            0b1100 => Ok(alu(A32AluOp::Orr, true, rd, rd, reg_op2)),
            0b1110 => Ok(alu(A32AluOp::Bic, true, rd, rd, reg_op2)),
            0b1111 => Ok(alu(A32AluOp::Mvn, true, rd, RegOrZr::Zr, reg_op2)),
            // Register-shift and multiply forms are outside the subset.
            _ => Err(undefined(half)),
        };
    }

    // 010001: hi-register operations and BX.
    if bits(half, 15, 10) == 0b010001 {
        let rm_idx = bits(half, 6, 3);
        match bits(half, 9, 8) {
            0b11 => {
                // BX (BLX is outside the subset).
                if bits(half, 7, 7) != 0 || bits(half, 2, 0) != 0 {
                    return Err(undefined(half));
                }
                if rm_idx == 15 {
                    return Err(undefined(half));
                }
                Ok(Inst::A32BranchExchange {
                    cond: Cond::Al,
                    rm: RegOrZr::from_bits(rm_idx),
                })
            }
            0b10 => {
                // MOV between any two registers, flags untouched.
                let rd_idx = (bits(half, 7, 7) << 3) | bits(half, 2, 0);
                if rm_idx == 15 || rd_idx == 15 {
                    return Err(undefined(half));
                }
                Ok(alu(
                    A32AluOp::Mov,
                    false,
                    RegOrZr::from_bits(rd_idx),
                    RegOrZr::Zr,
                    A32Operand2::ShiftedReg {
                        rm: RegOrZr::from_bits(rm_idx),
                        shift: ShiftKind::Lsl,
                        amount: 0,
                    },
                ))
            }
            _ => Err(undefined(half)),
        }
    } else {
        Err(undefined(half))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesper_types::Gpr;

    fn reg(i: u8) -> RegOrZr {
        RegOrZr::Reg(Gpr::new(i).unwrap())
    }

    #[test]
    fn movs_imm8() {
        // MOVS r3, #7
        let inst = decode(0x2307).unwrap();
        assert_eq!(
            inst,
            Inst::A32Alu {
                cond: Cond::Al,
                op: A32AluOp::Mov,
                set_flags: true,
                rd: reg(3),
                rn: RegOrZr::Zr,
                op2: A32Operand2::Imm {
                    value: 7,
                    carry: None
                },
            }
        );
    }

    #[test]
    fn adds_reg() {
        // ADDS r0, r1, r2
        let inst = decode(0x1888).unwrap();
        match inst {
            Inst::A32Alu {
                op,
                set_flags,
                rd,
                rn,
                op2,
                ..
            } => {
                assert_eq!(op, A32AluOp::Add);
                assert!(set_flags);
                assert_eq!(rd, reg(0));
                assert_eq!(rn, reg(1));
                assert!(matches!(op2, A32Operand2::ShiftedReg { rm, .. } if rm == reg(2)));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn ldr_word_scaled() {
        // LDR r1, [r2, #8]
        let inst = decode(0x6891).unwrap();
        assert_eq!(
            inst,
            Inst::A32LoadStore {
                cond: Cond::Al,
                load: true,
                byte: false,
                rt: reg(1),
                rn: RegOrSp::Reg(Gpr::new(2).unwrap()),
                offset: 8,
                mode: AddrMode::Offset,
            }
        );
    }

    #[test]
    fn cond_branch_offset_includes_pipeline() {
        // BEQ to self: offset = -4/2 = imm8 -2 -> 0xFE
        let inst = decode(0xD0FE).unwrap();
        assert_eq!(
            inst,
            Inst::A32Branch {
                cond: Cond::Eq,
                offset: 0,
                link: false
            }
        );
    }

    #[test]
    fn bx_and_svc() {
        // BX lr
        assert_eq!(
            decode(0x4770).unwrap(),
            Inst::A32BranchExchange {
                cond: Cond::Al,
                rm: reg(14)
            }
        );
        // SVC #1
        assert_eq!(
            decode(0xDF01).unwrap(),
            Inst::A32Svc {
                cond: Cond::Al,
                imm: 1
            }
        );
    }

    #[test]
    fn undefined_compact_encodings() {
        assert!(decode(0xDE00).is_err()); // permanently undefined
        assert!(decode(0x4780).is_err()); // BLX (unsupported subset)
    }
}
