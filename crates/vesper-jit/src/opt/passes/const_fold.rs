//! Constant folding.
//!
//! Forward scan tracking which values are compile-time constants; any pure
//! operation with all-constant inputs is rewritten to [`Op::Const`]. The
//! evaluators are the interpreter's own, so folding cannot disagree with
//! execution. Flag-writing adds are folded only when the flag mask is empty
//! (the dead-flag pass empties it first, which is why the driver iterates).

use std::collections::HashMap;

use crate::interp::{add_with_carry, eval_bin, eval_sext, eval_un};
use crate::ir::{CarryIn, IrBlock, Op, ValueId};

pub fn run(block: &mut IrBlock) -> bool {
    let mut consts: HashMap<u32, u64> = HashMap::new();
    let mut changed = false;

    for op in &mut block.ops {
        let folded: Option<(ValueId, u64)> = match *op {
            Op::Const { dst, value } => {
                consts.insert(dst.0, value);
                None
            }
            Op::Bin {
                dst,
                op: bin,
                width,
                lhs,
                rhs,
            } => both(&consts, lhs, rhs).map(|(a, b)| (dst, eval_bin(bin, width, a, b))),
            Op::Un {
                dst,
                op: un,
                width,
                src,
            } => consts.get(&src.0).map(|&a| (dst, eval_un(un, width, a))),
            Op::Sext { dst, from, src } => {
                consts.get(&src.0).map(|&a| (dst, eval_sext(from, a)))
            }
            Op::Mask { dst, width, src } => {
                consts.get(&src.0).map(|&a| (dst, a & width.mask()))
            }
            Op::AddWithCarry {
                dst,
                width,
                lhs,
                rhs,
                carry,
                flags,
                ..
            } if flags.is_empty() => {
                let carry_in = match carry {
                    CarryIn::Zero => Some(false),
                    CarryIn::One => Some(true),
                    CarryIn::Flag => None,
                };
                match (both(&consts, lhs, rhs), carry_in) {
                    (Some((a, b)), Some(c)) => Some((dst, add_with_carry(width, a, b, c).0)),
                    _ => None,
                }
            }
            Op::Select {
                dst,
                cond,
                if_true,
                if_false,
            } => match consts.get(&cond.0) {
                Some(&c) => {
                    let arm = if c != 0 { if_true } else { if_false };
                    consts.get(&arm.0).map(|&v| (dst, v))
                }
                None => None,
            },
            _ => None,
        };
        if let Some((dst, value)) = folded {
            consts.insert(dst.0, value);
            *op = Op::Const { dst, value };
            changed = true;
        }
    }
    changed
}

fn both(consts: &HashMap<u32, u64>, lhs: ValueId, rhs: ValueId) -> Option<(u64, u64)> {
    Some((*consts.get(&lhs.0)?, *consts.get(&rhs.0)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinOp, Terminator};
    use vesper_types::{IsaMode, Width};

    fn block(ops: Vec<Op>, value_count: u32) -> IrBlock {
        IrBlock {
            entry: 0,
            byte_len: 4,
            inst_count: 1,
            mode: IsaMode::A64,
            code_hash: 0,
            ops,
            term: Terminator::Jump { target: 4 },
            value_count,
        }
    }

    #[test]
    fn folds_constant_chains() {
        let mut b = block(
            vec![
                Op::Const {
                    dst: ValueId(0),
                    value: 6,
                },
                Op::Const {
                    dst: ValueId(1),
                    value: 7,
                },
                Op::Bin {
                    dst: ValueId(2),
                    op: BinOp::Mul,
                    width: Width::W64,
                    lhs: ValueId(0),
                    rhs: ValueId(1),
                },
                Op::Bin {
                    dst: ValueId(3),
                    op: BinOp::Add,
                    width: Width::W64,
                    lhs: ValueId(2),
                    rhs: ValueId(0),
                },
            ],
            4,
        );
        assert!(run(&mut b));
        assert_eq!(
            b.ops[3],
            Op::Const {
                dst: ValueId(3),
                value: 48,
            }
        );
        assert_eq!(b.validate(), Ok(()));
    }

    #[test]
    fn leaves_non_constant_inputs_alone() {
        let mut b = block(
            vec![
                Op::GetReg {
                    dst: ValueId(0),
                    reg: crate::ir::GuestReg::Sp,
                },
                Op::Const {
                    dst: ValueId(1),
                    value: 16,
                },
                Op::Bin {
                    dst: ValueId(2),
                    op: BinOp::Add,
                    width: Width::W64,
                    lhs: ValueId(0),
                    rhs: ValueId(1),
                },
            ],
            3,
        );
        assert!(!run(&mut b));
    }

    #[test]
    fn folding_respects_operation_width() {
        let mut b = block(
            vec![
                Op::Const {
                    dst: ValueId(0),
                    value: 0xffff_ffff,
                },
                Op::Const {
                    dst: ValueId(1),
                    value: 1,
                },
                Op::Bin {
                    dst: ValueId(2),
                    op: BinOp::Add,
                    width: Width::W32,
                    lhs: ValueId(0),
                    rhs: ValueId(1),
                },
            ],
            3,
        );
        assert!(run(&mut b));
        assert_eq!(
            b.ops[2],
            Op::Const {
                dst: ValueId(2),
                value: 0,
            }
        );
    }
}
