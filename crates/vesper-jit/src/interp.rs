//! IR interpreter.
//!
//! Reference execution path for translated blocks: always available, used
//! directly for blocks the native backend declines, and as the oracle the
//! differential tests compare emitted code against. The pure scalar
//! evaluators live here and are shared with the constant folder so both
//! agree bit-for-bit.

use vesper_cpu_core::CpuState;
use vesper_mem::{AddressSpace, MemoryError};
use vesper_types::{Flag, FlagSet, Width};

use crate::ir::{BinOp, CarryIn, GuestReg, IrBlock, Op, Terminator, TrapKind, UnOp};

/// How a block ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Continue at `pc` in the current mode.
    Jump { pc: u64 },
    /// Continue at `pc` after applying the interworking bit.
    Exchange { pc: u64 },
    /// A trap fired; the guest resumes at `resume_pc` once it is handled.
    Trap { kind: TrapKind, resume_pc: u64 },
}

/// Memory fault raised mid-block, attributed to the faulting instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemFault {
    pub pc: u64,
    pub error: MemoryError,
}

/// Execute one block against the given context and address space.
pub fn run_ir(
    block: &IrBlock,
    cpu: &mut CpuState,
    space: &AddressSpace,
) -> Result<BlockOutcome, MemFault> {
    let mut values = vec![0u64; block.value_count as usize];
    let truthy = |values: &[u64], pred: &Option<crate::ir::ValueId>| match pred {
        None => true,
        Some(p) => values[p.0 as usize] != 0,
    };

    for op in &block.ops {
        match *op {
            Op::Const { dst, value } => values[dst.0 as usize] = value,
            Op::GetReg { dst, reg } => values[dst.0 as usize] = get_reg(cpu, reg),
            Op::SetReg { reg, src } => set_reg(cpu, reg, values[src.0 as usize]),
            Op::Bin {
                dst,
                op,
                width,
                lhs,
                rhs,
            } => {
                values[dst.0 as usize] =
                    eval_bin(op, width, values[lhs.0 as usize], values[rhs.0 as usize]);
            }
            Op::Un {
                dst,
                op,
                width,
                src,
            } => {
                values[dst.0 as usize] = eval_un(op, width, values[src.0 as usize]);
            }
            Op::Sext { dst, from, src } => {
                values[dst.0 as usize] = eval_sext(from, values[src.0 as usize]);
            }
            Op::Mask { dst, width, src } => {
                values[dst.0 as usize] = values[src.0 as usize] & width.mask();
            }
            Op::AddWithCarry {
                dst,
                width,
                lhs,
                rhs,
                carry,
                flags,
                pred,
            } => {
                let carry_in = match carry {
                    CarryIn::Zero => false,
                    CarryIn::One => true,
                    CarryIn::Flag => cpu.flag(Flag::C),
                };
                let (res, c, v) = add_with_carry(
                    width,
                    values[lhs.0 as usize],
                    values[rhs.0 as usize],
                    carry_in,
                );
                values[dst.0 as usize] = res;
                if !flags.is_empty() && truthy(&values, &pred) {
                    write_nzcv(cpu, flags, width, res, c, v);
                }
            }
            Op::SetNz {
                src,
                width,
                flags,
                pred,
            } => {
                if truthy(&values, &pred) {
                    let res = values[src.0 as usize] & width.mask();
                    write_nzcv(cpu, flags, width, res, false, false);
                }
            }
            Op::WriteFlag { flag, src, pred } => {
                if truthy(&values, &pred) {
                    cpu.set_flag(flag, values[src.0 as usize] != 0);
                }
            }
            Op::ReadFlag { dst, flag } => {
                values[dst.0 as usize] = cpu.flag(flag) as u64;
            }
            Op::EvalCond { dst, cond } => {
                values[dst.0 as usize] = cond.eval(
                    cpu.flag(Flag::N),
                    cpu.flag(Flag::Z),
                    cpu.flag(Flag::C),
                    cpu.flag(Flag::V),
                ) as u64;
            }
            Op::Select {
                dst,
                cond,
                if_true,
                if_false,
            } => {
                values[dst.0 as usize] = if values[cond.0 as usize] != 0 {
                    values[if_true.0 as usize]
                } else {
                    values[if_false.0 as usize]
                };
            }
            Op::Load {
                dst,
                addr,
                size,
                pred,
                pc,
            } => {
                values[dst.0 as usize] = if truthy(&values, &pred) {
                    space
                        .read(values[addr.0 as usize], size)
                        .map_err(|error| MemFault { pc, error })?
                } else {
                    0
                };
            }
            Op::Store {
                addr,
                src,
                size,
                pred,
                pc,
            } => {
                if truthy(&values, &pred) {
                    space
                        .write(values[addr.0 as usize], size, values[src.0 as usize])
                        .map_err(|error| MemFault { pc, error })?;
                }
            }
        }
    }

    Ok(match block.term {
        Terminator::Jump { target } => BlockOutcome::Jump { pc: target },
        Terminator::CondJump {
            cond,
            if_true,
            if_false,
        } => BlockOutcome::Jump {
            pc: if values[cond.0 as usize] != 0 {
                if_true
            } else {
                if_false
            },
        },
        Terminator::IndirectJump { target, exchange } => {
            let pc = values[target.0 as usize];
            if exchange {
                BlockOutcome::Exchange { pc }
            } else {
                BlockOutcome::Jump { pc }
            }
        }
        Terminator::Trap {
            kind,
            resume_pc,
            pred,
            fallthrough,
        } => {
            if truthy(&values, &pred) {
                BlockOutcome::Trap { kind, resume_pc }
            } else {
                BlockOutcome::Jump { pc: fallthrough }
            }
        }
    })
}

fn get_reg(cpu: &CpuState, reg: GuestReg) -> u64 {
    match reg {
        GuestReg::X(r) => cpu.x(r),
        GuestReg::Sp => cpu.sp,
        GuestReg::VLo(v) => cpu.vreg[v.index() * 2],
        GuestReg::VHi(v) => cpu.vreg[v.index() * 2 + 1],
    }
}

fn set_reg(cpu: &mut CpuState, reg: GuestReg, value: u64) {
    match reg {
        GuestReg::X(r) => cpu.set_x(r, value),
        GuestReg::Sp => cpu.sp = value,
        GuestReg::VLo(v) => cpu.vreg[v.index() * 2] = value,
        GuestReg::VHi(v) => cpu.vreg[v.index() * 2 + 1] = value,
    }
}

fn write_nzcv(cpu: &mut CpuState, flags: FlagSet, width: Width, res: u64, c: bool, v: bool) {
    if flags.contains(FlagSet::N) {
        cpu.set_flag(Flag::N, res >> (width.bits() - 1) & 1 != 0);
    }
    if flags.contains(FlagSet::Z) {
        cpu.set_flag(Flag::Z, res == 0);
    }
    if flags.contains(FlagSet::C) {
        cpu.set_flag(Flag::C, c);
    }
    if flags.contains(FlagSet::V) {
        cpu.set_flag(Flag::V, v);
    }
}

// --- pure scalar evaluators (shared with the constant folder) -------------

pub(crate) fn eval_bin(op: BinOp, width: Width, lhs: u64, rhs: u64) -> u64 {
    let m = width.mask();
    let bits = width.bits();
    let a = lhs & m;
    let b = rhs & m;
    match op {
        BinOp::Add => a.wrapping_add(b) & m,
        BinOp::Sub => a.wrapping_sub(b) & m,
        BinOp::And => a & b,
        BinOp::Orr => a | b,
        BinOp::Eor => a ^ b,
        BinOp::Lsl => {
            let amt = b % bits as u64;
            (a << amt) & m
        }
        BinOp::Lsr => {
            let amt = b % bits as u64;
            a >> amt
        }
        BinOp::Asr => {
            let amt = b % bits as u64;
            ((eval_sext(width, a) as i64) >> amt) as u64 & m
        }
        BinOp::Ror => {
            let amt = b % bits as u64;
            if amt == 0 {
                a
            } else {
                ((a >> amt) | (a << (bits as u64 - amt))) & m
            }
        }
        BinOp::Mul => a.wrapping_mul(b) & m,
        BinOp::UDiv => {
            if b == 0 {
                0
            } else {
                a / b
            }
        }
        BinOp::SDiv => {
            if b == 0 {
                0
            } else {
                let sa = eval_sext(width, a) as i64;
                let sb = eval_sext(width, b) as i64;
                // wrapping_div covers the MIN / -1 overflow case.
                sa.wrapping_div(sb) as u64 & m
            }
        }
    }
}

pub(crate) fn eval_un(op: UnOp, width: Width, src: u64) -> u64 {
    let m = width.mask();
    let bits = width.bits();
    let a = src & m;
    match op {
        UnOp::Not => !a & m,
        UnOp::Rbit => a.reverse_bits() >> (64 - bits),
        UnOp::Rev16 => {
            const LO: u64 = 0x00ff_00ff_00ff_00ff;
            (((a & LO) << 8) | ((a >> 8) & LO)) & m
        }
        UnOp::Rev32 => {
            let lo = (a as u32).swap_bytes() as u64;
            let hi = ((a >> 32) as u32).swap_bytes() as u64;
            ((hi << 32) | lo) & m
        }
        UnOp::Rev => (a.swap_bytes() >> (64 - bits)) & m,
        UnOp::Clz => (a.leading_zeros() - (64 - bits)) as u64,
        UnOp::Cls => {
            // Leading bits equal to the sign bit, not counting the sign bit
            // itself: count zeros of the sign-transition word over width-1
            // bits.
            let y = (a ^ (a >> 1)) & (m >> 1);
            (y.leading_zeros() - (64 - (bits - 1))) as u64
        }
    }
}

pub(crate) fn eval_sext(from: Width, src: u64) -> u64 {
    let bits = from.bits();
    if bits == 64 {
        return src;
    }
    let shift = 64 - bits;
    (((src << shift) as i64) >> shift) as u64
}

/// Full adder over `width` bits. Returns the truncated result and the
/// carry-out and signed-overflow bits.
pub(crate) fn add_with_carry(width: Width, lhs: u64, rhs: u64, carry: bool) -> (u64, bool, bool) {
    let m = width.mask();
    let bits = width.bits();
    let a = lhs & m;
    let b = rhs & m;
    let sum = a as u128 + b as u128 + carry as u128;
    let res = (sum as u64) & m;
    let c = (sum >> bits) != 0;
    let sa = a >> (bits - 1) & 1;
    let sb = b >> (bits - 1) & 1;
    let sr = res >> (bits - 1) & 1;
    let v = sa == sb && sr != sa;
    (res, c, v)
}
