//! Block discovery and instruction lowering.
//!
//! [`translate_block`] fetches and decodes a straight-line run of guest
//! instructions starting at an entry address, lowering each into IR until
//! the first control-flow instruction or the block length limit. The fetch
//! loop also accumulates the hash of the exact instruction words consumed,
//! which becomes the block's staleness fingerprint.
//!
//! Lowering conventions:
//! - 32-bit register writes zero-extend into the 64-bit slot, in every mode.
//! - Every add/subtract/compare goes through the full-adder operation;
//!   subtraction complements the subtrahend and feeds carry-in one, so the
//!   guest's inverted-borrow carry semantics fall out for free.
//! - Legacy-mode predication evaluates the condition once per instruction
//!   and suppresses memory accesses and flag writes with it; register
//!   writebacks select between the new and old value.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

use vesper_cpu_decoder::{
    decode, inst_len, A32AluOp, A32Operand2, AddSubOp, AddrMode, Bit1Op, BitfieldOp, CcmpOperand,
    CondSelOp, Extend, Inst, LogicOp, MemAccess, MoveWideOp, Shift2Op, ShiftKind, VecSize,
};
use vesper_mem::{AddressSpace, MemoryError};
use vesper_types::{Cond, Flag, FlagSet, Gpr, IsaMode, RegOrSp, RegOrZr, Width};

use crate::ir::{BinOp, CarryIn, GuestReg, IrBlock, Op, Terminator, TrapKind, UnOp, ValueId};

/// Translation-unit bounds.
#[derive(Clone, Copy, Debug)]
pub struct BlockLimits {
    /// Maximum guest instructions per block.
    pub max_insts: u32,
}

impl Default for BlockLimits {
    fn default() -> Self {
        BlockLimits { max_insts: 64 }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    /// The first instruction of the block could not be fetched. Mid-block
    /// fetch failures end the block instead, so the fault is raised with a
    /// precise program counter when execution reaches it.
    #[error("instruction fetch failed: {0}")]
    Fetch(#[from] MemoryError),
}

/// Translate one block starting at `entry`.
pub fn translate_block(
    space: &AddressSpace,
    entry: u64,
    mode: IsaMode,
    limits: &BlockLimits,
) -> Result<IrBlock, TranslateError> {
    let ilen = inst_len(mode);
    let fetch_width = match mode {
        IsaMode::T16 => Width::W16,
        _ => Width::W32,
    };
    let mut hasher = DefaultHasher::new();
    let mut lo = Lowerer::new(mode);
    let mut pc = entry;
    let mut count = 0u32;

    while count < limits.max_insts {
        let word = match space.fetch(pc, fetch_width) {
            Ok(w) => w as u32,
            Err(e) => {
                if count == 0 {
                    return Err(TranslateError::Fetch(e));
                }
                break;
            }
        };
        hasher.write_u32(word);
        let inst = match decode(mode, word) {
            Ok(inst) => inst,
            Err(_) => {
                if count == 0 {
                    lo.term = Some(Terminator::Trap {
                        kind: TrapKind::Undefined { pc },
                        resume_pc: pc,
                        pred: None,
                        fallthrough: pc,
                    });
                    pc += ilen;
                    count = 1;
                }
                break;
            }
        };
        lo.pc = pc;
        lo.lower(inst);
        pc += ilen;
        count += 1;
        if lo.term.is_some() {
            break;
        }
    }

    let term = lo.term.take().unwrap_or(Terminator::Jump { target: pc });
    let block = IrBlock {
        entry,
        byte_len: pc - entry,
        inst_count: count,
        mode,
        code_hash: hasher.finish(),
        ops: lo.e.ops,
        term,
        value_count: lo.e.next,
    };
    debug_assert_eq!(block.validate(), Ok(()));
    tracing::trace!(
        entry,
        insts = block.inst_count,
        ops = block.ops.len(),
        "translated block"
    );
    Ok(block)
}

struct Emitter {
    ops: Vec<Op>,
    next: u32,
}

impl Emitter {
    fn value(&mut self) -> ValueId {
        let id = ValueId(self.next);
        self.next += 1;
        id
    }

    fn konst(&mut self, value: u64) -> ValueId {
        let dst = self.value();
        self.ops.push(Op::Const { dst, value });
        dst
    }

    fn bin(&mut self, op: BinOp, width: Width, lhs: ValueId, rhs: ValueId) -> ValueId {
        let dst = self.value();
        self.ops.push(Op::Bin {
            dst,
            op,
            width,
            lhs,
            rhs,
        });
        dst
    }

    fn un(&mut self, op: UnOp, width: Width, src: ValueId) -> ValueId {
        let dst = self.value();
        self.ops.push(Op::Un {
            dst,
            op,
            width,
            src,
        });
        dst
    }

    fn get(&mut self, reg: GuestReg) -> ValueId {
        let dst = self.value();
        self.ops.push(Op::GetReg { dst, reg });
        dst
    }

    fn set(&mut self, reg: GuestReg, src: ValueId) {
        self.ops.push(Op::SetReg { reg, src });
    }

    fn sext(&mut self, from: Width, src: ValueId) -> ValueId {
        let dst = self.value();
        self.ops.push(Op::Sext { dst, from, src });
        dst
    }

    fn mask(&mut self, width: Width, src: ValueId) -> ValueId {
        let dst = self.value();
        self.ops.push(Op::Mask { dst, width, src });
        dst
    }

    fn adc(
        &mut self,
        width: Width,
        lhs: ValueId,
        rhs: ValueId,
        carry: CarryIn,
        flags: FlagSet,
        pred: Option<ValueId>,
    ) -> ValueId {
        let dst = self.value();
        self.ops.push(Op::AddWithCarry {
            dst,
            width,
            lhs,
            rhs,
            carry,
            flags,
            pred,
        });
        dst
    }

    fn set_nz(&mut self, src: ValueId, width: Width, flags: FlagSet, pred: Option<ValueId>) {
        self.ops.push(Op::SetNz {
            src,
            width,
            flags,
            pred,
        });
    }

    fn write_flag(&mut self, flag: Flag, src: ValueId, pred: Option<ValueId>) {
        self.ops.push(Op::WriteFlag { flag, src, pred });
    }

    fn read_flag(&mut self, flag: Flag) -> ValueId {
        let dst = self.value();
        self.ops.push(Op::ReadFlag { dst, flag });
        dst
    }

    fn eval_cond(&mut self, cond: Cond) -> ValueId {
        let dst = self.value();
        self.ops.push(Op::EvalCond { dst, cond });
        dst
    }

    fn select(&mut self, cond: ValueId, if_true: ValueId, if_false: ValueId) -> ValueId {
        let dst = self.value();
        self.ops.push(Op::Select {
            dst,
            cond,
            if_true,
            if_false,
        });
        dst
    }

    fn load(&mut self, addr: ValueId, size: Width, pred: Option<ValueId>, pc: u64) -> ValueId {
        let dst = self.value();
        self.ops.push(Op::Load {
            dst,
            addr,
            size,
            pred,
            pc,
        });
        dst
    }

    fn store(&mut self, addr: ValueId, src: ValueId, size: Width, pred: Option<ValueId>, pc: u64) {
        self.ops.push(Op::Store {
            addr,
            src,
            size,
            pred,
            pc,
        });
    }
}

struct Lowerer {
    e: Emitter,
    pc: u64,
    ilen: u64,
    term: Option<Terminator>,
}

impl Lowerer {
    fn new(mode: IsaMode) -> Self {
        Lowerer {
            e: Emitter {
                ops: Vec::new(),
                next: 0,
            },
            pc: 0,
            ilen: inst_len(mode),
            term: None,
        }
    }

    fn next_pc(&self) -> u64 {
        self.pc + self.ilen
    }

    // --- operand helpers --------------------------------------------------

    fn read_zr(&mut self, reg: RegOrZr) -> ValueId {
        match reg {
            RegOrZr::Reg(r) => self.e.get(GuestReg::X(r)),
            RegOrZr::Zr => self.e.konst(0),
        }
    }

    fn read_sp(&mut self, reg: RegOrSp) -> ValueId {
        match reg {
            RegOrSp::Reg(r) => self.e.get(GuestReg::X(r)),
            RegOrSp::Sp => self.e.get(GuestReg::Sp),
        }
    }

    fn write_zr(&mut self, reg: RegOrZr, src: ValueId) {
        if let RegOrZr::Reg(r) = reg {
            self.e.set(GuestReg::X(r), src);
        }
    }

    fn write_sp(&mut self, reg: RegOrSp, src: ValueId) {
        match reg {
            RegOrSp::Reg(r) => self.e.set(GuestReg::X(r), src),
            RegOrSp::Sp => self.e.set(GuestReg::Sp, src),
        }
    }

    /// Operand read for width-sensitive consumers that do not truncate
    /// internally (selects, branch tests).
    fn read_zr_w(&mut self, reg: RegOrZr, width: Width) -> ValueId {
        let v = self.read_zr(reg);
        match width {
            Width::W64 => v,
            w => self.e.mask(w, v),
        }
    }

    fn shifted(&mut self, val: ValueId, shift: ShiftKind, amount: u32, width: Width) -> ValueId {
        if amount == 0 {
            return val;
        }
        let amt = self.e.konst(amount as u64);
        let op = match shift {
            ShiftKind::Lsl => BinOp::Lsl,
            ShiftKind::Lsr => BinOp::Lsr,
            ShiftKind::Asr => BinOp::Asr,
            ShiftKind::Ror => BinOp::Ror,
        };
        self.e.bin(op, width, val, amt)
    }

    fn extended(&mut self, reg: RegOrZr, extend: Extend, amount: u32, width: Width) -> ValueId {
        let raw = self.read_zr(reg);
        let narrowed = if extend.is_signed() {
            self.e.sext(extend.src_width(), raw)
        } else {
            self.e.mask(extend.src_width(), raw)
        };
        if amount == 0 {
            narrowed
        } else {
            let amt = self.e.konst(amount as u64);
            self.e.bin(BinOp::Lsl, width, narrowed, amt)
        }
    }

    fn add_sub(
        &mut self,
        op: AddSubOp,
        set_flags: bool,
        width: Width,
        lhs: ValueId,
        rhs: ValueId,
    ) -> ValueId {
        let flags = if set_flags {
            FlagSet::NZCV
        } else {
            FlagSet::empty()
        };
        match op {
            AddSubOp::Add => self.e.adc(width, lhs, rhs, CarryIn::Zero, flags, None),
            AddSubOp::Sub => {
                let inv = self.e.un(UnOp::Not, width, rhs);
                self.e.adc(width, lhs, inv, CarryIn::One, flags, None)
            }
        }
    }

    /// Base-plus-offset address with optional writeback value.
    fn address(&mut self, base: ValueId, offset: i64, mode: AddrMode) -> (ValueId, Option<ValueId>) {
        let off = self.e.konst(offset as u64);
        let sum = self.e.bin(BinOp::Add, Width::W64, base, off);
        match mode {
            AddrMode::Offset => (sum, None),
            AddrMode::PreIndex => (sum, Some(sum)),
            AddrMode::PostIndex => (base, Some(sum)),
        }
    }

    fn loaded_value(&mut self, raw: ValueId, access: MemAccess) -> ValueId {
        if !access.signed {
            return raw;
        }
        let s = self.e.sext(access.size, raw);
        match access.reg {
            Width::W32 => self.e.mask(Width::W32, s),
            _ => s,
        }
    }

    // --- per-instruction lowering -----------------------------------------

    fn lower(&mut self, inst: Inst) {
        match inst {
            Inst::AddSubImm {
                width,
                op,
                set_flags,
                rd,
                rn,
                imm,
            } => {
                let lhs = self.read_sp(rn);
                let rhs = self.e.konst(imm);
                let res = self.add_sub(op, set_flags, width, lhs, rhs);
                // Flag-setting form discards a destination encoded as SP.
                if !(set_flags && rd == RegOrSp::Sp) {
                    self.write_sp(rd, res);
                }
            }
            Inst::LogicalImm {
                width,
                op,
                rd,
                rn,
                imm,
            } => {
                let lhs = self.read_zr(rn);
                let rhs = self.e.konst(imm);
                let (bin, flags) = logic_bin(op);
                let res = self.e.bin(bin, width, lhs, rhs);
                if flags {
                    self.e.set_nz(res, width, FlagSet::NZCV, None);
                    // Flag-setting destination 31 is the zero register.
                    if rd != RegOrSp::Sp {
                        self.write_sp(rd, res);
                    }
                } else {
                    self.write_sp(rd, res);
                }
            }
            Inst::MoveWide {
                width,
                op,
                rd,
                imm,
                shift,
            } => {
                let res = match op {
                    MoveWideOp::Movz => self.e.konst((imm as u64) << shift),
                    MoveWideOp::Movn => self.e.konst(!((imm as u64) << shift) & width.mask()),
                    MoveWideOp::Movk => {
                        let old = self.read_zr(rd);
                        let keep = self.e.konst(!(0xffffu64 << shift) & width.mask());
                        let cleared = self.e.bin(BinOp::And, width, old, keep);
                        let ins = self.e.konst((imm as u64) << shift);
                        self.e.bin(BinOp::Orr, width, cleared, ins)
                    }
                };
                self.write_zr(rd, res);
            }
            Inst::Adr { rd, imm, page } => {
                let base = if page { self.pc & !0xfff } else { self.pc };
                let v = self.e.konst(base.wrapping_add(imm as u64));
                self.write_zr(rd, v);
            }
            Inst::Bitfield {
                width,
                op,
                rd,
                rn,
                immr,
                imms,
            } => self.lower_bitfield(width, op, rd, rn, immr, imms),
            Inst::Extract {
                width,
                rd,
                rn,
                rm,
                lsb,
            } => {
                let low = self.read_zr(rm);
                let res = if lsb == 0 {
                    self.read_zr_w(rm, width)
                } else {
                    let hi = self.read_zr(rn);
                    let lsb_v = self.e.konst(lsb as u64);
                    let lo_part = self.e.bin(BinOp::Lsr, width, low, lsb_v);
                    let upshift = self.e.konst((width.bits() - lsb) as u64);
                    let hi_part = self.e.bin(BinOp::Lsl, width, hi, upshift);
                    self.e.bin(BinOp::Orr, width, lo_part, hi_part)
                };
                self.write_zr(rd, res);
            }
            Inst::AddSubShifted {
                width,
                op,
                set_flags,
                rd,
                rn,
                rm,
                shift,
                amount,
            } => {
                let lhs = self.read_zr(rn);
                let rm_v = self.read_zr(rm);
                let rhs = self.shifted(rm_v, shift, amount, width);
                let res = self.add_sub(op, set_flags, width, lhs, rhs);
                self.write_zr(rd, res);
            }
            Inst::AddSubExtended {
                width,
                op,
                set_flags,
                rd,
                rn,
                rm,
                extend,
                amount,
            } => {
                let lhs = self.read_sp(rn);
                let rhs = self.extended(rm, extend, amount, width);
                let res = self.add_sub(op, set_flags, width, lhs, rhs);
                if !(set_flags && rd == RegOrSp::Sp) {
                    self.write_sp(rd, res);
                }
            }
            Inst::AddSubCarry {
                width,
                op,
                set_flags,
                rd,
                rn,
                rm,
            } => {
                let lhs = self.read_zr(rn);
                let rhs = self.read_zr(rm);
                let flags = if set_flags {
                    FlagSet::NZCV
                } else {
                    FlagSet::empty()
                };
                let res = match op {
                    AddSubOp::Add => self.e.adc(width, lhs, rhs, CarryIn::Flag, flags, None),
                    AddSubOp::Sub => {
                        let inv = self.e.un(UnOp::Not, width, rhs);
                        self.e.adc(width, lhs, inv, CarryIn::Flag, flags, None)
                    }
                };
                self.write_zr(rd, res);
            }
            Inst::LogicalShifted {
                width,
                op,
                invert,
                rd,
                rn,
                rm,
                shift,
                amount,
            } => {
                let lhs = self.read_zr(rn);
                let rm_v = self.read_zr(rm);
                let mut rhs = self.shifted(rm_v, shift, amount, width);
                if invert {
                    rhs = self.e.un(UnOp::Not, width, rhs);
                }
                let (bin, flags) = logic_bin(op);
                let res = self.e.bin(bin, width, lhs, rhs);
                if flags {
                    self.e.set_nz(res, width, FlagSet::NZCV, None);
                }
                self.write_zr(rd, res);
            }
            Inst::CondSelect {
                width,
                op,
                rd,
                rn,
                rm,
                cond,
            } => {
                let c = self.e.eval_cond(cond);
                let a = self.read_zr_w(rn, width);
                let b = self.read_zr_w(rm, width);
                let alt = match op {
                    CondSelOp::Csel => b,
                    CondSelOp::Csinc => {
                        let one = self.e.konst(1);
                        self.e.bin(BinOp::Add, width, b, one)
                    }
                    CondSelOp::Csinv => self.e.un(UnOp::Not, width, b),
                    CondSelOp::Csneg => {
                        let zero = self.e.konst(0);
                        self.e.bin(BinOp::Sub, width, zero, b)
                    }
                };
                let res = self.e.select(c, a, alt);
                self.write_zr(rd, res);
            }
            Inst::CondCompare {
                width,
                op,
                rn,
                rm,
                nzcv,
                cond,
            } => {
                let c = self.e.eval_cond(cond);
                let nc = self.e.eval_cond(cond.invert());
                let lhs = self.read_zr(rn);
                let rhs = match rm {
                    CcmpOperand::Imm(v) => self.e.konst(v),
                    CcmpOperand::Reg(r) => self.read_zr(r),
                };
                match op {
                    AddSubOp::Add => {
                        self.e
                            .adc(width, lhs, rhs, CarryIn::Zero, FlagSet::NZCV, Some(c));
                    }
                    AddSubOp::Sub => {
                        let inv = self.e.un(UnOp::Not, width, rhs);
                        self.e
                            .adc(width, lhs, inv, CarryIn::One, FlagSet::NZCV, Some(c));
                    }
                }
                for (flag, bit) in [(Flag::N, 3), (Flag::Z, 2), (Flag::C, 1), (Flag::V, 0)] {
                    let v = self.e.konst(((nzcv >> bit) & 1) as u64);
                    self.e.write_flag(flag, v, Some(nc));
                }
            }
            Inst::DataProc2 {
                width,
                op,
                rd,
                rn,
                rm,
            } => {
                let lhs = self.read_zr(rn);
                let rhs = self.read_zr(rm);
                let bin = match op {
                    Shift2Op::Udiv => BinOp::UDiv,
                    Shift2Op::Sdiv => BinOp::SDiv,
                    Shift2Op::Lslv => BinOp::Lsl,
                    Shift2Op::Lsrv => BinOp::Lsr,
                    Shift2Op::Asrv => BinOp::Asr,
                    Shift2Op::Rorv => BinOp::Ror,
                };
                let res = self.e.bin(bin, width, lhs, rhs);
                self.write_zr(rd, res);
            }
            Inst::DataProc1 { width, op, rd, rn } => {
                let src = self.read_zr(rn);
                let un = match op {
                    Bit1Op::Rbit => UnOp::Rbit,
                    Bit1Op::Rev16 => UnOp::Rev16,
                    Bit1Op::Rev32 => UnOp::Rev32,
                    Bit1Op::Rev => UnOp::Rev,
                    Bit1Op::Clz => UnOp::Clz,
                    Bit1Op::Cls => UnOp::Cls,
                };
                let res = self.e.un(un, width, src);
                self.write_zr(rd, res);
            }
            Inst::MulAdd {
                width,
                sub,
                rd,
                rn,
                rm,
                ra,
            } => {
                let a = self.read_zr(rn);
                let b = self.read_zr(rm);
                let acc = self.read_zr(ra);
                let prod = self.e.bin(BinOp::Mul, width, a, b);
                let res = if sub {
                    self.e.bin(BinOp::Sub, width, acc, prod)
                } else {
                    self.e.bin(BinOp::Add, width, acc, prod)
                };
                self.write_zr(rd, res);
            }
            Inst::LoadImm {
                access,
                rt,
                rn,
                offset,
                mode,
            } => {
                let base = self.read_sp(rn);
                let (ea, wb) = self.address(base, offset, mode);
                let raw = self.e.load(ea, access.size, None, self.pc);
                if let Some(wb) = wb {
                    self.write_sp(rn, wb);
                }
                let v = self.loaded_value(raw, access);
                self.write_zr(rt, v);
            }
            Inst::StoreImm {
                size,
                rt,
                rn,
                offset,
                mode,
            } => {
                let base = self.read_sp(rn);
                let (ea, wb) = self.address(base, offset, mode);
                let v = self.read_zr(rt);
                self.e.store(ea, v, size, None, self.pc);
                if let Some(wb) = wb {
                    self.write_sp(rn, wb);
                }
            }
            Inst::LoadReg {
                access,
                rt,
                rn,
                rm,
                extend,
                shift,
            } => {
                let base = self.read_sp(rn);
                let off = self.extended(rm, extend, shift, Width::W64);
                let ea = self.e.bin(BinOp::Add, Width::W64, base, off);
                let raw = self.e.load(ea, access.size, None, self.pc);
                let v = self.loaded_value(raw, access);
                self.write_zr(rt, v);
            }
            Inst::StoreReg {
                size,
                rt,
                rn,
                rm,
                extend,
                shift,
            } => {
                let base = self.read_sp(rn);
                let off = self.extended(rm, extend, shift, Width::W64);
                let ea = self.e.bin(BinOp::Add, Width::W64, base, off);
                let v = self.read_zr(rt);
                self.e.store(ea, v, size, None, self.pc);
            }
            Inst::LoadPair {
                width,
                signed,
                rt,
                rt2,
                rn,
                offset,
                mode,
            } => {
                let base = self.read_sp(rn);
                let (ea, wb) = self.address(base, offset, mode);
                let step = self.e.konst(width.bytes());
                let ea2 = self.e.bin(BinOp::Add, Width::W64, ea, step);
                let raw1 = self.e.load(ea, width, None, self.pc);
                let raw2 = self.e.load(ea2, width, None, self.pc);
                if let Some(wb) = wb {
                    self.write_sp(rn, wb);
                }
                let (v1, v2) = if signed {
                    (self.e.sext(width, raw1), self.e.sext(width, raw2))
                } else {
                    (raw1, raw2)
                };
                self.write_zr(rt, v1);
                self.write_zr(rt2, v2);
            }
            Inst::StorePair {
                width,
                rt,
                rt2,
                rn,
                offset,
                mode,
            } => {
                let base = self.read_sp(rn);
                let (ea, wb) = self.address(base, offset, mode);
                let step = self.e.konst(width.bytes());
                let ea2 = self.e.bin(BinOp::Add, Width::W64, ea, step);
                let v1 = self.read_zr(rt);
                let v2 = self.read_zr(rt2);
                self.e.store(ea, v1, width, None, self.pc);
                self.e.store(ea2, v2, width, None, self.pc);
                if let Some(wb) = wb {
                    self.write_sp(rn, wb);
                }
            }
            Inst::LoadLiteral { access, rt, offset } => {
                let ea = self.e.konst(self.pc.wrapping_add(offset as u64));
                let raw = self.e.load(ea, access.size, None, self.pc);
                let v = self.loaded_value(raw, access);
                self.write_zr(rt, v);
            }
            Inst::VecLoad {
                size,
                vt,
                rn,
                offset,
                mode,
            } => {
                let base = self.read_sp(rn);
                let (ea, wb) = self.address(base, offset, mode);
                match size {
                    VecSize::S | VecSize::D => {
                        let w = if size == VecSize::S {
                            Width::W32
                        } else {
                            Width::W64
                        };
                        let lo = self.e.load(ea, w, None, self.pc);
                        let zero = self.e.konst(0);
                        self.e.set(GuestReg::VLo(vt), lo);
                        self.e.set(GuestReg::VHi(vt), zero);
                    }
                    VecSize::Q => {
                        let step = self.e.konst(8);
                        let ea2 = self.e.bin(BinOp::Add, Width::W64, ea, step);
                        let lo = self.e.load(ea, Width::W64, None, self.pc);
                        let hi = self.e.load(ea2, Width::W64, None, self.pc);
                        self.e.set(GuestReg::VLo(vt), lo);
                        self.e.set(GuestReg::VHi(vt), hi);
                    }
                }
                if let Some(wb) = wb {
                    self.write_sp(rn, wb);
                }
            }
            Inst::VecStore {
                size,
                vt,
                rn,
                offset,
                mode,
            } => {
                let base = self.read_sp(rn);
                let (ea, wb) = self.address(base, offset, mode);
                match size {
                    VecSize::S | VecSize::D => {
                        let w = if size == VecSize::S {
                            Width::W32
                        } else {
                            Width::W64
                        };
                        let lo = self.e.get(GuestReg::VLo(vt));
                        self.e.store(ea, lo, w, None, self.pc);
                    }
                    VecSize::Q => {
                        let step = self.e.konst(8);
                        let ea2 = self.e.bin(BinOp::Add, Width::W64, ea, step);
                        let lo = self.e.get(GuestReg::VLo(vt));
                        let hi = self.e.get(GuestReg::VHi(vt));
                        self.e.store(ea, lo, Width::W64, None, self.pc);
                        self.e.store(ea2, hi, Width::W64, None, self.pc);
                    }
                }
                if let Some(wb) = wb {
                    self.write_sp(rn, wb);
                }
            }
            Inst::Branch { offset, link } => {
                if link {
                    let ret = self.e.konst(self.next_pc());
                    self.e.set(GuestReg::X(Gpr::LR), ret);
                }
                self.term = Some(Terminator::Jump {
                    target: self.pc.wrapping_add(offset as u64),
                });
            }
            Inst::BranchCond { cond, offset } => {
                let c = self.e.eval_cond(cond);
                self.term = Some(Terminator::CondJump {
                    cond: c,
                    if_true: self.pc.wrapping_add(offset as u64),
                    if_false: self.next_pc(),
                });
            }
            Inst::CompareBranch {
                width,
                nonzero,
                rt,
                offset,
            } => {
                let v = self.read_zr_w(rt, width);
                let target = self.pc.wrapping_add(offset as u64);
                let next = self.next_pc();
                self.term = Some(if nonzero {
                    Terminator::CondJump {
                        cond: v,
                        if_true: target,
                        if_false: next,
                    }
                } else {
                    Terminator::CondJump {
                        cond: v,
                        if_true: next,
                        if_false: target,
                    }
                });
            }
            Inst::TestBranch {
                nonzero,
                rt,
                bit,
                offset,
            } => {
                let v = self.read_zr(rt);
                let sh = self.e.konst(bit as u64);
                let shifted = self.e.bin(BinOp::Lsr, Width::W64, v, sh);
                let one = self.e.konst(1);
                let bit_v = self.e.bin(BinOp::And, Width::W64, shifted, one);
                let target = self.pc.wrapping_add(offset as u64);
                let next = self.next_pc();
                self.term = Some(if nonzero {
                    Terminator::CondJump {
                        cond: bit_v,
                        if_true: target,
                        if_false: next,
                    }
                } else {
                    Terminator::CondJump {
                        cond: bit_v,
                        if_true: next,
                        if_false: target,
                    }
                });
            }
            Inst::BranchReg { rn, link } => {
                let target = self.read_zr(rn);
                if link {
                    let ret = self.e.konst(self.next_pc());
                    self.e.set(GuestReg::X(Gpr::LR), ret);
                }
                self.term = Some(Terminator::IndirectJump {
                    target,
                    exchange: false,
                });
            }
            Inst::Svc { imm } => {
                self.term = Some(Terminator::Trap {
                    kind: TrapKind::Syscall { imm: imm as u32 },
                    resume_pc: self.next_pc(),
                    pred: None,
                    fallthrough: self.next_pc(),
                });
            }
            Inst::Brk { imm } => {
                self.term = Some(Terminator::Trap {
                    kind: TrapKind::Breakpoint { imm },
                    resume_pc: self.pc,
                    pred: None,
                    fallthrough: self.pc,
                });
            }
            Inst::Nop => {}

            Inst::A32Alu {
                cond,
                op,
                set_flags,
                rd,
                rn,
                op2,
            } => self.lower_a32_alu(cond, op, set_flags, rd, rn, op2),
            Inst::A32LoadStore {
                cond,
                load,
                byte,
                rt,
                rn,
                offset,
                mode,
            } => self.lower_a32_mem(cond, load, byte, rt, rn, offset, mode),
            Inst::A32Branch { cond, offset, link } => {
                let pred = self.a32_pred(cond);
                if link {
                    let ret = self.e.konst(self.next_pc());
                    let ret = self.predicated_write_value(pred, ret, a32_lr());
                    self.e.set(GuestReg::X(a32_lr()), ret);
                }
                let target = self.pc.wrapping_add(offset as u64);
                self.term = Some(match pred {
                    None => Terminator::Jump { target },
                    Some(c) => Terminator::CondJump {
                        cond: c,
                        if_true: target,
                        if_false: self.next_pc(),
                    },
                });
            }
            Inst::A32BranchExchange { cond, rm } => {
                let pred = self.a32_pred(cond);
                let mut target = self.read_zr(rm);
                if let Some(c) = pred {
                    // Fallthrough keeps the current (legacy full-width) mode:
                    // bit 0 clear.
                    let next = self.e.konst(self.next_pc());
                    target = self.e.select(c, target, next);
                }
                self.term = Some(Terminator::IndirectJump {
                    target,
                    exchange: true,
                });
            }
            Inst::A32Svc { cond, imm } => {
                let pred = self.a32_pred(cond);
                self.term = Some(Terminator::Trap {
                    kind: TrapKind::Syscall { imm },
                    resume_pc: self.next_pc(),
                    pred,
                    fallthrough: self.next_pc(),
                });
            }
        }
    }

    fn lower_bitfield(
        &mut self,
        width: Width,
        op: BitfieldOp,
        rd: RegOrZr,
        rn: RegOrZr,
        immr: u32,
        imms: u32,
    ) -> () {
        let b = width.bits();
        let src = self.read_zr(rn);
        // Position the field with a shift pair; the same shift amounts
        // serve the extract (imms >= immr) and insert-at-top cases.
        let lsl_amt = b - 1 - imms;
        let shr_amt = if imms >= immr {
            b - 1 - imms + immr
        } else {
            immr - imms - 1
        };
        let lsl_v = self.e.konst(lsl_amt as u64);
        let t = self.e.bin(BinOp::Lsl, width, src, lsl_v);
        let shr_v = self.e.konst(shr_amt as u64);
        let res = match op {
            BitfieldOp::Ubfm => self.e.bin(BinOp::Lsr, width, t, shr_v),
            BitfieldOp::Sbfm => self.e.bin(BinOp::Asr, width, t, shr_v),
            BitfieldOp::Bfm => {
                let extracted = self.e.bin(BinOp::Lsr, width, t, shr_v);
                let field = if imms >= immr {
                    low_mask((imms - immr + 1) as u64)
                } else {
                    low_mask((imms + 1) as u64) << (b - immr)
                };
                let old = self.read_zr(rd);
                let keep = self.e.konst(!field & width.mask());
                let kept = self.e.bin(BinOp::And, width, old, keep);
                self.e.bin(BinOp::Orr, width, kept, extracted)
            }
        };
        self.write_zr(rd, res);
    }

    // --- legacy width -----------------------------------------------------

    fn a32_pred(&mut self, cond: Cond) -> Option<ValueId> {
        match cond {
            Cond::Al | Cond::Nv => None,
            c => Some(self.e.eval_cond(c)),
        }
    }

    /// Select between `new` and the current value of `reg` under `pred`.
    fn predicated_write_value(
        &mut self,
        pred: Option<ValueId>,
        new: ValueId,
        reg: Gpr,
    ) -> ValueId {
        match pred {
            None => new,
            Some(c) => {
                let old = self.e.get(GuestReg::X(reg));
                self.e.select(c, new, old)
            }
        }
    }

    fn a32_operand2(&mut self, op2: A32Operand2) -> (ValueId, Option<ValueId>) {
        match op2 {
            A32Operand2::Imm { value, carry } => {
                let v = self.e.konst(value as u64);
                let c = carry.map(|bit| self.e.konst(bit as u64));
                (v, c)
            }
            A32Operand2::ShiftedReg { rm, shift, amount } => {
                let val = self.read_zr_w(rm, Width::W32);
                match (shift, amount) {
                    (ShiftKind::Lsl, 0) => (val, None),
                    (ShiftKind::Lsl, n) => {
                        let out = self.shifted(val, ShiftKind::Lsl, n, Width::W32);
                        let c = self.bit_of(val, 32 - n);
                        (out, Some(c))
                    }
                    // LSR #0 encodes a shift by 32.
                    (ShiftKind::Lsr, 0) => {
                        let zero = self.e.konst(0);
                        let c = self.bit_of(val, 31);
                        (zero, Some(c))
                    }
                    (ShiftKind::Lsr, n) => {
                        let out = self.shifted(val, ShiftKind::Lsr, n, Width::W32);
                        let c = self.bit_of(val, n - 1);
                        (out, Some(c))
                    }
                    // ASR #0 encodes a shift by 32: every bit is the sign.
                    (ShiftKind::Asr, 0) => {
                        let out = self.shifted(val, ShiftKind::Asr, 31, Width::W32);
                        let c = self.bit_of(val, 31);
                        (out, Some(c))
                    }
                    (ShiftKind::Asr, n) => {
                        let out = self.shifted(val, ShiftKind::Asr, n, Width::W32);
                        let c = self.bit_of(val, n - 1);
                        (out, Some(c))
                    }
                    // ROR #0 encodes RRX: rotate right one through carry.
                    (ShiftKind::Ror, 0) => {
                        let old_c = self.e.read_flag(Flag::C);
                        let sh31 = self.e.konst(31);
                        let top = self.e.bin(BinOp::Lsl, Width::W32, old_c, sh31);
                        let one = self.e.konst(1);
                        let rest = self.e.bin(BinOp::Lsr, Width::W32, val, one);
                        let out = self.e.bin(BinOp::Orr, Width::W32, top, rest);
                        let c = self.bit_of(val, 0);
                        (out, Some(c))
                    }
                    (ShiftKind::Ror, n) => {
                        let out = self.shifted(val, ShiftKind::Ror, n, Width::W32);
                        let c = self.bit_of(val, n - 1);
                        (out, Some(c))
                    }
                }
            }
        }
    }

    fn bit_of(&mut self, val: ValueId, bit: u32) -> ValueId {
        let sh = self.e.konst(bit as u64);
        let shifted = self.e.bin(BinOp::Lsr, Width::W32, val, sh);
        let one = self.e.konst(1);
        self.e.bin(BinOp::And, Width::W32, shifted, one)
    }

    fn lower_a32_alu(
        &mut self,
        cond: Cond,
        op: A32AluOp,
        set_flags: bool,
        rd: RegOrZr,
        rn: RegOrZr,
        op2: A32Operand2,
    ) {
        let pred = self.a32_pred(cond);
        let (op2_v, carry_out) = self.a32_operand2(op2);
        let rn_v = if op.ignores_rn() {
            None
        } else {
            Some(self.read_zr_w(rn, Width::W32))
        };
        let w = Width::W32;
        let arith_flags = if set_flags {
            FlagSet::NZCV
        } else {
            FlagSet::empty()
        };

        let res = match op {
            A32AluOp::And | A32AluOp::Tst => {
                self.e
                    .bin(BinOp::And, w, rn_v.unwrap_or(op2_v), op2_v)
            }
            A32AluOp::Eor | A32AluOp::Teq => {
                self.e
                    .bin(BinOp::Eor, w, rn_v.unwrap_or(op2_v), op2_v)
            }
            A32AluOp::Orr => self.e.bin(BinOp::Orr, w, rn_v.unwrap_or(op2_v), op2_v),
            A32AluOp::Bic => {
                let inv = self.e.un(UnOp::Not, w, op2_v);
                self.e.bin(BinOp::And, w, rn_v.unwrap_or(op2_v), inv)
            }
            A32AluOp::Mov => op2_v,
            A32AluOp::Mvn => self.e.un(UnOp::Not, w, op2_v),
            A32AluOp::Add | A32AluOp::Cmn => {
                let lhs = rn_v.unwrap_or(op2_v);
                self.e.adc(w, lhs, op2_v, CarryIn::Zero, arith_flags, pred)
            }
            A32AluOp::Sub | A32AluOp::Cmp => {
                let lhs = rn_v.unwrap_or(op2_v);
                let inv = self.e.un(UnOp::Not, w, op2_v);
                self.e.adc(w, lhs, inv, CarryIn::One, arith_flags, pred)
            }
            A32AluOp::Rsb => {
                let lhs = rn_v.unwrap_or(op2_v);
                let inv = self.e.un(UnOp::Not, w, lhs);
                self.e.adc(w, op2_v, inv, CarryIn::One, arith_flags, pred)
            }
            A32AluOp::Adc => {
                let lhs = rn_v.unwrap_or(op2_v);
                self.e.adc(w, lhs, op2_v, CarryIn::Flag, arith_flags, pred)
            }
            A32AluOp::Sbc => {
                let lhs = rn_v.unwrap_or(op2_v);
                let inv = self.e.un(UnOp::Not, w, op2_v);
                self.e.adc(w, lhs, inv, CarryIn::Flag, arith_flags, pred)
            }
            A32AluOp::Rsc => {
                let lhs = rn_v.unwrap_or(op2_v);
                let inv = self.e.un(UnOp::Not, w, lhs);
                self.e.adc(w, op2_v, inv, CarryIn::Flag, arith_flags, pred)
            }
        };

        // Logical-class flag rule: N/Z from the result, C from the shifter
        // when it produced one, V untouched.
        let logical = matches!(
            op,
            A32AluOp::And
                | A32AluOp::Eor
                | A32AluOp::Tst
                | A32AluOp::Teq
                | A32AluOp::Orr
                | A32AluOp::Mov
                | A32AluOp::Bic
                | A32AluOp::Mvn
        );
        if set_flags && logical {
            self.e.set_nz(res, w, FlagSet::N | FlagSet::Z, pred);
            if let Some(c) = carry_out {
                self.e.write_flag(Flag::C, c, pred);
            }
        }

        if !op.is_compare() {
            if let RegOrZr::Reg(r) = rd {
                let v = self.predicated_write_value(pred, res, r);
                self.e.set(GuestReg::X(r), v);
            }
        }
    }

    fn lower_a32_mem(
        &mut self,
        cond: Cond,
        load: bool,
        byte: bool,
        rt: RegOrZr,
        rn: RegOrSp,
        offset: i64,
        mode: AddrMode,
    ) {
        let pred = self.a32_pred(cond);
        let size = if byte { Width::W8 } else { Width::W32 };
        let base = self.read_sp(rn);
        let (ea, wb) = self.address(base, offset, mode);
        if load {
            let v = self.e.load(ea, size, pred, self.pc);
            if let Some(wb) = wb {
                let wb = match pred {
                    None => wb,
                    Some(c) => {
                        let sel = self.e.select(c, wb, base);
                        sel
                    }
                };
                self.write_sp(rn, wb);
            }
            if let RegOrZr::Reg(r) = rt {
                let v = self.predicated_write_value(pred, v, r);
                self.e.set(GuestReg::X(r), v);
            }
        } else {
            let v = self.read_zr(rt);
            self.e.store(ea, v, size, pred, self.pc);
            if let Some(wb) = wb {
                let wb = match pred {
                    None => wb,
                    Some(c) => self.e.select(c, wb, base),
                };
                self.write_sp(rn, wb);
            }
        }
    }
}

fn logic_bin(op: LogicOp) -> (BinOp, bool) {
    match op {
        LogicOp::And => (BinOp::And, false),
        LogicOp::Orr => (BinOp::Orr, false),
        LogicOp::Eor => (BinOp::Eor, false),
        LogicOp::Ands => (BinOp::And, true),
    }
}

/// Link register of the legacy register file (r14).
fn a32_lr() -> Gpr {
    match Gpr::new(14) {
        Some(r) => r,
        None => unreachable!("14 is a valid register index"),
    }
}

fn low_mask(bits: u64) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}
