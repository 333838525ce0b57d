//! Dead flag-write elimination.
//!
//! Reverse liveness over the four NZCV bits. Liveness at the block boundary
//! is all four flags, since the successor block is unknown; within the
//! block, an unconditional flag write kills the bits it covers, so in a run
//! of flag-setting arithmetic only the writes something actually reads
//! survive. Predicated writes never kill (they may not execute) but their
//! masks still shrink to the live bits.

use vesper_types::FlagSet;

use crate::ir::{IrBlock, Op};

pub fn run(block: &mut IrBlock) -> bool {
    let mut live = FlagSet::NZCV;
    let mut changed = false;
    let mut removed = vec![false; block.ops.len()];

    for (i, op) in block.ops.iter_mut().enumerate().rev() {
        let written = op.flags_written();
        let reads = op.flags_read();
        if !written.is_empty() {
            let keep = written & live;
            if keep != written {
                changed = true;
                match op {
                    Op::AddWithCarry { flags, .. } | Op::SetNz { flags, .. } => *flags = keep,
                    Op::WriteFlag { .. } => {}
                    _ => unreachable!("flag mask on non-flag-writing op"),
                }
                // A flag-only op with nothing left to write disappears.
                match op {
                    Op::SetNz { flags, .. } if flags.is_empty() => removed[i] = true,
                    Op::WriteFlag { .. } => removed[i] = true,
                    _ => {}
                }
            }
            if !op.flags_conditional() && !removed[i] {
                live = live.difference(written);
            }
        }
        live |= reads;
    }

    if removed.iter().any(|&r| r) {
        let mut i = 0;
        block.ops.retain(|_| {
            let keep = !removed[i];
            i += 1;
            keep
        });
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CarryIn, GuestReg, Terminator, ValueId};
    use vesper_types::{Cond, Flag, IsaMode, Width};

    fn adds(dst: u32, lhs: u32, rhs: u32) -> Op {
        Op::AddWithCarry {
            dst: ValueId(dst),
            width: Width::W64,
            lhs: ValueId(lhs),
            rhs: ValueId(rhs),
            carry: CarryIn::Zero,
            flags: FlagSet::NZCV,
            pred: None,
        }
    }

    fn block(ops: Vec<Op>, term: Terminator, value_count: u32) -> IrBlock {
        IrBlock {
            entry: 0,
            byte_len: 8,
            inst_count: 2,
            mode: IsaMode::A64,
            code_hash: 0,
            ops,
            term,
            value_count,
        }
    }

    #[test]
    fn overwritten_flags_are_dropped() {
        // Two ADDS in a row: the first one's flags are fully shadowed.
        let mut b = block(
            vec![
                Op::Const {
                    dst: ValueId(0),
                    value: 1,
                },
                adds(1, 0, 0),
                adds(2, 1, 0),
            ],
            Terminator::Jump { target: 8 },
            3,
        );
        assert!(run(&mut b));
        assert_eq!(b.ops[1].flags_written(), FlagSet::empty());
        assert_eq!(b.ops[2].flags_written(), FlagSet::NZCV);
    }

    #[test]
    fn read_between_writes_keeps_the_bits() {
        let mut b = block(
            vec![
                Op::Const {
                    dst: ValueId(0),
                    value: 1,
                },
                adds(1, 0, 0),
                Op::EvalCond {
                    dst: ValueId(2),
                    cond: Cond::Lt,
                },
                adds(3, 0, 0),
            ],
            Terminator::Jump { target: 8 },
            4,
        );
        assert!(run(&mut b));
        // LT reads N and V: those survive in the first ADDS, Z and C do not.
        assert_eq!(b.ops[1].flags_written(), FlagSet::N | FlagSet::V);
    }

    #[test]
    fn dead_single_flag_write_is_removed() {
        let mut b = block(
            vec![
                Op::Const {
                    dst: ValueId(0),
                    value: 1,
                },
                Op::WriteFlag {
                    flag: Flag::C,
                    src: ValueId(0),
                    pred: None,
                },
                adds(1, 0, 0),
            ],
            Terminator::Jump { target: 8 },
            2,
        );
        assert!(run(&mut b));
        assert!(!b
            .ops
            .iter()
            .any(|op| matches!(op, Op::WriteFlag { .. })));
    }

    #[test]
    fn predicated_write_does_not_kill_liveness() {
        // A conditional flag write may not execute, so the unconditional
        // write before it stays fully live.
        let mut b = block(
            vec![
                Op::Const {
                    dst: ValueId(0),
                    value: 1,
                },
                adds(1, 0, 0),
                Op::AddWithCarry {
                    dst: ValueId(2),
                    width: Width::W64,
                    lhs: ValueId(0),
                    rhs: ValueId(0),
                    carry: CarryIn::Zero,
                    flags: FlagSet::NZCV,
                    pred: Some(ValueId(0)),
                },
            ],
            Terminator::Jump { target: 8 },
            3,
        );
        assert!(!run(&mut b));
        assert_eq!(b.ops[1].flags_written(), FlagSet::NZCV);
    }

    #[test]
    fn boundary_liveness_is_conservative() {
        let mut b = block(
            vec![
                Op::Const {
                    dst: ValueId(0),
                    value: 1,
                },
                adds(1, 0, 0),
                Op::SetReg {
                    reg: GuestReg::Sp,
                    src: ValueId(1),
                },
            ],
            Terminator::Jump { target: 8 },
            2,
        );
        // Last flag write in the block: the next block might read it.
        assert!(!run(&mut b));
        assert_eq!(b.ops[1].flags_written(), FlagSet::NZCV);
    }
}
