//! Block-local intermediate representation.
//!
//! Values are 64-bit scalars in single-assignment form: every [`ValueId`] is
//! defined exactly once and only used after its definition. Operations that
//! work on a narrower width truncate their result to that width, so a value
//! produced by a `W32` operation never carries garbage in its upper half.
//! Flags are not values; they live in the execution context and are written
//! through explicit flag-writing operations carrying a [`FlagSet`] mask,
//! which is what the dead-flag pass shrinks.
//!
//! Predicated execution (the legacy instruction set) threads an optional
//! `pred` value through the side-effecting operations: a false predicate
//! must suppress the memory access or flag write, while pure value
//! computations always run and get folded into register state with
//! [`Op::Select`].

use vesper_types::{Cond, FlagSet, Gpr, IsaMode, Vreg, Width};

/// One IR virtual register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ValueId(pub u32);

/// An architectural register slot addressable by the IR.
///
/// Vector registers appear as independent 64-bit halves; a 128-bit access is
/// two operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuestReg {
    X(Gpr),
    Sp,
    VLo(Vreg),
    VHi(Vreg),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    And,
    Orr,
    Eor,
    /// Shift amount is taken modulo the operation width.
    Lsl,
    Lsr,
    Asr,
    Ror,
    Mul,
    /// Division by zero yields zero (guest ISA rule, not a trap).
    UDiv,
    SDiv,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    Not,
    /// Bit reversal within the operation width.
    Rbit,
    /// Byte reversal within each 16-bit lane.
    Rev16,
    /// Byte reversal within each 32-bit lane.
    Rev32,
    /// Byte reversal of the whole operand.
    Rev,
    Clz,
    Cls,
}

/// Carry-in source of [`Op::AddWithCarry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CarryIn {
    Zero,
    One,
    /// Read the current C flag at execution time.
    Flag,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Const {
        dst: ValueId,
        value: u64,
    },
    GetReg {
        dst: ValueId,
        reg: GuestReg,
    },
    SetReg {
        reg: GuestReg,
        src: ValueId,
    },
    Bin {
        dst: ValueId,
        op: BinOp,
        width: Width,
        lhs: ValueId,
        rhs: ValueId,
    },
    Un {
        dst: ValueId,
        op: UnOp,
        width: Width,
        src: ValueId,
    },
    /// Sign-extend from `from` to 64 bits.
    Sext {
        dst: ValueId,
        from: Width,
        src: ValueId,
    },
    /// Zero-extend from `width` to 64 bits (truncation).
    Mask {
        dst: ValueId,
        width: Width,
        src: ValueId,
    },
    /// The full adder every add/subtract/compare lowers to:
    /// `dst = lhs + rhs + carry`, truncated to `width`. Subtraction passes
    /// the bitwise complement of the subtrahend and carry-in one. NZCV bits
    /// named in `flags` are written from the width-wide result; when `pred`
    /// is present the flag write is suppressed on a false predicate but the
    /// result value is still produced.
    AddWithCarry {
        dst: ValueId,
        width: Width,
        lhs: ValueId,
        rhs: ValueId,
        carry: CarryIn,
        flags: FlagSet,
        pred: Option<ValueId>,
    },
    /// Write N/Z from `src` (logical-operation flag rule); C and V are
    /// cleared if present in `flags`.
    SetNz {
        src: ValueId,
        width: Width,
        flags: FlagSet,
        pred: Option<ValueId>,
    },
    /// Set one flag to `src != 0`.
    WriteFlag {
        flag: vesper_types::Flag,
        src: ValueId,
        pred: Option<ValueId>,
    },
    ReadFlag {
        dst: ValueId,
        flag: vesper_types::Flag,
    },
    /// Evaluate a condition code against the current flags, yielding 0 or 1.
    EvalCond {
        dst: ValueId,
        cond: Cond,
    },
    Select {
        dst: ValueId,
        cond: ValueId,
        if_true: ValueId,
        if_false: ValueId,
    },
    /// Zero-extending load of `size` bytes. A suppressed (false-predicate)
    /// load yields zero; callers select against the old register value.
    /// `pc` is the guest address of the originating instruction, reported on
    /// a memory fault.
    Load {
        dst: ValueId,
        addr: ValueId,
        size: Width,
        pred: Option<ValueId>,
        pc: u64,
    },
    Store {
        addr: ValueId,
        src: ValueId,
        size: Width,
        pred: Option<ValueId>,
        pc: u64,
    },
}

/// Guest-visible trap raised by a block terminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapKind {
    Syscall { imm: u32 },
    Breakpoint { imm: u16 },
    Undefined { pc: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Terminator {
    Jump {
        target: u64,
    },
    CondJump {
        cond: ValueId,
        if_true: u64,
        if_false: u64,
    },
    /// Branch to a computed address. With `exchange`, bit 0 of the target
    /// selects the legacy sub-mode (the dispatcher applies the switch).
    IndirectJump {
        target: ValueId,
        exchange: bool,
    },
    /// Raise a trap, or fall through to `fallthrough` when `pred` evaluates
    /// false. `resume_pc` is where the guest continues if the trap is
    /// handled: past the instruction for system calls, at it for the rest.
    Trap {
        kind: TrapKind,
        resume_pc: u64,
        pred: Option<ValueId>,
        fallthrough: u64,
    },
}

/// One translation unit: straight-line operations plus a single terminator.
#[derive(Clone, Debug)]
pub struct IrBlock {
    /// Guest address of the first instruction.
    pub entry: u64,
    /// Bytes of guest code this block translates.
    pub byte_len: u64,
    pub inst_count: u32,
    pub mode: IsaMode,
    /// Hash of the exact instruction words consumed during translation,
    /// used by the cache to tell real code changes from same-page data
    /// writes.
    pub code_hash: u64,
    pub ops: Vec<Op>,
    pub term: Terminator,
    pub value_count: u32,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum IrError {
    #[error("value v{0} used before definition")]
    UseBeforeDef(u32),
    #[error("value v{0} defined more than once")]
    Redefined(u32),
    #[error("value v{0} out of range (block declares {1} values)")]
    OutOfRange(u32, u32),
}

impl Op {
    /// The value this operation defines, if any.
    pub fn dst(&self) -> Option<ValueId> {
        match *self {
            Op::Const { dst, .. }
            | Op::GetReg { dst, .. }
            | Op::Bin { dst, .. }
            | Op::Un { dst, .. }
            | Op::Sext { dst, .. }
            | Op::Mask { dst, .. }
            | Op::AddWithCarry { dst, .. }
            | Op::ReadFlag { dst, .. }
            | Op::EvalCond { dst, .. }
            | Op::Select { dst, .. }
            | Op::Load { dst, .. } => Some(dst),
            Op::SetReg { .. } | Op::SetNz { .. } | Op::WriteFlag { .. } | Op::Store { .. } => None,
        }
    }

    pub fn for_each_use(&self, mut f: impl FnMut(ValueId)) {
        let mut pred_use = |p: &Option<ValueId>, f: &mut dyn FnMut(ValueId)| {
            if let Some(p) = p {
                f(*p);
            }
        };
        match self {
            Op::Const { .. } | Op::GetReg { .. } | Op::ReadFlag { .. } | Op::EvalCond { .. } => {}
            Op::SetReg { src, .. } => f(*src),
            Op::Bin { lhs, rhs, .. } => {
                f(*lhs);
                f(*rhs);
            }
            Op::Un { src, .. } | Op::Sext { src, .. } | Op::Mask { src, .. } => f(*src),
            Op::AddWithCarry { lhs, rhs, pred, .. } => {
                f(*lhs);
                f(*rhs);
                pred_use(pred, &mut f);
            }
            Op::SetNz { src, pred, .. } | Op::WriteFlag { src, pred, .. } => {
                f(*src);
                pred_use(pred, &mut f);
            }
            Op::Select {
                cond,
                if_true,
                if_false,
                ..
            } => {
                f(*cond);
                f(*if_true);
                f(*if_false);
            }
            Op::Load { addr, pred, .. } => {
                f(*addr);
                pred_use(pred, &mut f);
            }
            Op::Store {
                addr, src, pred, ..
            } => {
                f(*addr);
                f(*src);
                pred_use(pred, &mut f);
            }
        }
    }

    pub fn flags_written(&self) -> FlagSet {
        match *self {
            Op::AddWithCarry { flags, .. } | Op::SetNz { flags, .. } => flags,
            Op::WriteFlag { flag, .. } => flag.into(),
            _ => FlagSet::empty(),
        }
    }

    pub fn flags_read(&self) -> FlagSet {
        match *self {
            Op::AddWithCarry {
                carry: CarryIn::Flag,
                ..
            } => FlagSet::C,
            Op::ReadFlag { flag, .. } => flag.into(),
            Op::EvalCond { cond, .. } => cond_flags(cond),
            _ => FlagSet::empty(),
        }
    }

    /// Whether the flag write (if any) is predicated and therefore only
    /// sometimes happens.
    pub fn flags_conditional(&self) -> bool {
        matches!(
            self,
            Op::AddWithCarry { pred: Some(_), .. }
                | Op::SetNz { pred: Some(_), .. }
                | Op::WriteFlag { pred: Some(_), .. }
        )
    }

    /// Whether this operation has an effect beyond defining `dst`. Loads
    /// count: removing one would remove its fault.
    pub fn has_side_effect(&self) -> bool {
        match self {
            Op::SetReg { .. } | Op::Store { .. } | Op::Load { .. } => true,
            Op::AddWithCarry { flags, .. } | Op::SetNz { flags, .. } => !flags.is_empty(),
            Op::WriteFlag { .. } => true,
            _ => false,
        }
    }
}

/// Flags a condition code reads.
pub fn cond_flags(cond: Cond) -> FlagSet {
    match cond {
        Cond::Eq | Cond::Ne => FlagSet::Z,
        Cond::Cs | Cond::Cc => FlagSet::C,
        Cond::Mi | Cond::Pl => FlagSet::N,
        Cond::Vs | Cond::Vc => FlagSet::V,
        Cond::Hi | Cond::Ls => FlagSet::C | FlagSet::Z,
        Cond::Ge | Cond::Lt => FlagSet::N | FlagSet::V,
        Cond::Gt | Cond::Le => FlagSet::N | FlagSet::Z | FlagSet::V,
        Cond::Al | Cond::Nv => FlagSet::empty(),
    }
}

impl Terminator {
    pub fn for_each_use(&self, mut f: impl FnMut(ValueId)) {
        match self {
            Terminator::Jump { .. } => {}
            Terminator::CondJump { cond, .. } => f(*cond),
            Terminator::IndirectJump { target, .. } => f(*target),
            Terminator::Trap { pred, .. } => {
                if let Some(p) = pred {
                    f(*p);
                }
            }
        }
    }
}

impl IrBlock {
    /// Check the single-assignment invariants. Run under `debug_assert!` by
    /// the translator and directly by tests.
    pub fn validate(&self) -> Result<(), IrError> {
        let n = self.value_count;
        let mut defined = vec![false; n as usize];
        let check_use = |v: ValueId, defined: &[bool]| -> Result<(), IrError> {
            if v.0 >= n {
                return Err(IrError::OutOfRange(v.0, n));
            }
            if !defined[v.0 as usize] {
                return Err(IrError::UseBeforeDef(v.0));
            }
            Ok(())
        };
        for op in &self.ops {
            let mut use_err = None;
            op.for_each_use(|v| {
                if use_err.is_none() {
                    use_err = check_use(v, &defined).err();
                }
            });
            if let Some(e) = use_err {
                return Err(e);
            }
            if let Some(dst) = op.dst() {
                if dst.0 >= n {
                    return Err(IrError::OutOfRange(dst.0, n));
                }
                if defined[dst.0 as usize] {
                    return Err(IrError::Redefined(dst.0));
                }
                defined[dst.0 as usize] = true;
            }
        }
        let mut use_err = None;
        self.term.for_each_use(|v| {
            if use_err.is_none() {
                use_err = check_use(v, &defined).err();
            }
        });
        match use_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesper_types::Flag;

    fn block(ops: Vec<Op>, term: Terminator, value_count: u32) -> IrBlock {
        IrBlock {
            entry: 0x1000,
            byte_len: 4,
            inst_count: 1,
            mode: IsaMode::A64,
            code_hash: 0,
            ops,
            term,
            value_count,
        }
    }

    #[test]
    fn validate_accepts_straight_line_ssa() {
        let b = block(
            vec![
                Op::Const {
                    dst: ValueId(0),
                    value: 1,
                },
                Op::Const {
                    dst: ValueId(1),
                    value: 2,
                },
                Op::Bin {
                    dst: ValueId(2),
                    op: BinOp::Add,
                    width: Width::W64,
                    lhs: ValueId(0),
                    rhs: ValueId(1),
                },
            ],
            Terminator::IndirectJump {
                target: ValueId(2),
                exchange: false,
            },
            3,
        );
        assert_eq!(b.validate(), Ok(()));
    }

    #[test]
    fn validate_rejects_use_before_def() {
        let b = block(
            vec![Op::Bin {
                dst: ValueId(0),
                op: BinOp::Add,
                width: Width::W64,
                lhs: ValueId(1),
                rhs: ValueId(1),
            }],
            Terminator::Jump { target: 0 },
            2,
        );
        assert_eq!(b.validate(), Err(IrError::UseBeforeDef(1)));
    }

    #[test]
    fn validate_rejects_redefinition() {
        let b = block(
            vec![
                Op::Const {
                    dst: ValueId(0),
                    value: 1,
                },
                Op::Const {
                    dst: ValueId(0),
                    value: 2,
                },
            ],
            Terminator::Jump { target: 0 },
            1,
        );
        assert_eq!(b.validate(), Err(IrError::Redefined(0)));
    }

    #[test]
    fn flag_queries() {
        let adds = Op::AddWithCarry {
            dst: ValueId(2),
            width: Width::W64,
            lhs: ValueId(0),
            rhs: ValueId(1),
            carry: CarryIn::Zero,
            flags: FlagSet::NZCV,
            pred: None,
        };
        assert_eq!(adds.flags_written(), FlagSet::NZCV);
        assert_eq!(adds.flags_read(), FlagSet::empty());
        assert!(adds.has_side_effect());

        let adc = Op::AddWithCarry {
            dst: ValueId(2),
            width: Width::W64,
            lhs: ValueId(0),
            rhs: ValueId(1),
            carry: CarryIn::Flag,
            flags: FlagSet::empty(),
            pred: None,
        };
        assert_eq!(adc.flags_read(), FlagSet::C);
        assert!(!adc.has_side_effect());

        let wf = Op::WriteFlag {
            flag: Flag::C,
            src: ValueId(0),
            pred: Some(ValueId(1)),
        };
        assert!(wf.flags_conditional());
        assert_eq!(cond_flags(Cond::Gt), FlagSet::N | FlagSet::Z | FlagSet::V);
    }
}
