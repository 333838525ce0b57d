//! x86-64 block compiler.
//!
//! Register convention inside a block:
//! - `r12` holds the [`JitEnv`] pointer, `r13` the guest context pointer;
//! - allocated values live in `rbx`/`r14`/`r15` or in the context's spill
//!   area, so they survive helper calls and stay readable at any
//!   suspension point;
//! - `rax`/`rcx`/`rdx`/`rsi`/`rdi`/`r8`/`r9` are per-operation scratch.
//!
//! The block function is `extern "C" fn(*mut JitEnv) -> u64`: the return
//! value is the next guest pc (or the faulting pc), `env.exit_kind` says
//! how to interpret it. Rare or wide operations (the flag-writing adder,
//! memory access, condition evaluation, trap raising) go through the
//! helpers in [`super::env`]; anything the emitter cannot express declines
//! the block instead of guessing.

mod asm;

use vesper_cpu_core::{CpuState, PendingException, SPILL_SLOTS};
use vesper_mem::{AddressSpace, MemoryError};
use vesper_types::{FlagSet, Width};

use self::asm::{Asm, Cc, Label, R12, R13, R8, R9, RAX, RBX, RCX, RDI, RDX, RSI};
use super::env::{
    self, FastWindow, JitEnv, ADC_CARRY_FLAG, ADC_CARRY_ONE, ADC_CARRY_ZERO,
    ENV_EXIT_KIND_OFFSET, ENV_FAULT_PC_OFFSET, ENV_HELPER_OK_OFFSET, EXIT_EXCHANGE, EXIT_JUMP,
    EXIT_TRAP, FLAGS_HAS_PRED, FLAGS_MASK_SHIFT, FLAGS_WIDTH64, RAISE_BREAKPOINT, RAISE_SYSCALL,
    RAISE_UNDEFINED,
};
use super::{CodeBuf, CompileError};
use crate::interp::{BlockOutcome, MemFault};
use crate::ir::{BinOp, CarryIn, GuestReg, IrBlock, Op, Terminator, TrapKind, UnOp, ValueId};

/// A compiled, executable block.
pub struct NativeBlock {
    buf: CodeBuf,
    code_len: usize,
}

type BlockFn = unsafe extern "C" fn(*mut u8) -> u64;

impl NativeBlock {
    pub fn code_len(&self) -> usize {
        self.code_len
    }

    /// Run the block. Outcome mapping mirrors the interpreter's, so the
    /// dispatcher treats both paths identically.
    pub fn execute(
        &self,
        cpu: &mut CpuState,
        space: &AddressSpace,
        window: &mut Option<FastWindow>,
    ) -> Result<BlockOutcome, MemFault> {
        let (exit, pc) = {
            let mut jit_env = JitEnv::new(cpu, space, window.take());
            // SAFETY: the buffer holds a complete function emitted by
            // `compile` for this exact ABI, and is executable.
            let pc = unsafe {
                let entry: BlockFn = std::mem::transmute(self.buf.as_ptr());
                entry(&mut jit_env as *mut JitEnv<'_> as *mut u8)
            };
            *window = jit_env.window.take();
            (jit_env.exit_kind, pc)
        };
        match exit {
            EXIT_JUMP => Ok(BlockOutcome::Jump { pc }),
            EXIT_EXCHANGE => Ok(BlockOutcome::Exchange { pc }),
            _ => match cpu.take_pending() {
                Some(PendingException::MemoryFault { addr, kind }) => Err(MemFault {
                    pc,
                    error: MemoryError::Fault { addr, kind },
                }),
                Some(PendingException::Syscall { imm }) => Ok(BlockOutcome::Trap {
                    kind: TrapKind::Syscall { imm },
                    resume_pc: pc,
                }),
                Some(PendingException::Breakpoint { imm }) => Ok(BlockOutcome::Trap {
                    kind: TrapKind::Breakpoint { imm },
                    resume_pc: pc,
                }),
                Some(PendingException::Undefined { pc: at }) => Ok(BlockOutcome::Trap {
                    kind: TrapKind::Undefined { pc: at },
                    resume_pc: pc,
                }),
                None => Ok(BlockOutcome::Jump { pc }),
            },
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Loc {
    Reg(u8),
    /// Slot in the context's spill area.
    Spill(u32),
}

/// Compile one block, or decline it with [`CompileError::Unsupported`].
pub(crate) fn compile(block: &IrBlock) -> Result<NativeBlock, CompileError> {
    for op in &block.ops {
        if !op_supported(op) {
            return Err(CompileError::Unsupported);
        }
    }

    let locs = allocate(block);
    let slots = locs
        .iter()
        .filter_map(|l| match l {
            Some(Loc::Spill(s)) => Some(s + 1),
            _ => None,
        })
        .max()
        .unwrap_or(0);
    if slots as usize > SPILL_SLOTS {
        return Err(CompileError::Unsupported);
    }

    let mut e = Emit {
        asm: Asm::new(),
        locs,
    };
    e.prologue();
    let exit = e.asm.new_label();
    let fault = e.asm.new_label();
    for op in &block.ops {
        e.op(op, fault);
    }
    e.terminator(&block.term, exit);
    e.asm.bind(fault);
    e.asm.mov_r_m(RAX, R12, ENV_FAULT_PC_OFFSET as i32);
    e.asm
        .mov_m_imm32(R12, ENV_EXIT_KIND_OFFSET as i32, EXIT_TRAP as i32);
    e.asm.bind(exit);
    e.epilogue();

    let code = e.asm.finish();
    let code_len = code.len();
    tracing::trace!(entry = block.entry, bytes = code_len, "compiled block");
    Ok(NativeBlock {
        buf: CodeBuf::new(&code)?,
        code_len,
    })
}

fn op_supported(op: &Op) -> bool {
    match op {
        Op::Bin { op: bin, width, .. } => {
            !matches!(bin, BinOp::UDiv | BinOp::SDiv)
                && matches!(width, Width::W32 | Width::W64)
        }
        Op::Un { op: un, width, .. } => {
            matches!(un, UnOp::Not) && matches!(width, Width::W32 | Width::W64)
        }
        _ => true,
    }
}

/// Linear-scan allocation over [rbx, r14, r15], overflowing to the context
/// spill area. Values keep one location for their whole live range.
fn allocate(block: &IrBlock) -> Vec<Option<Loc>> {
    const POOL: [u8; 3] = [RBX, asm::R14, asm::R15];
    let n = block.value_count as usize;
    let term_idx = block.ops.len();

    let mut last_use = vec![0usize; n];
    for (i, op) in block.ops.iter().enumerate() {
        op.for_each_use(|v| last_use[v.0 as usize] = i);
    }
    block
        .term
        .for_each_use(|v| last_use[v.0 as usize] = term_idx);

    let mut locs: Vec<Option<Loc>> = vec![None; n];
    let mut free: Vec<u8> = POOL.to_vec();
    // (end index, register) for values currently holding a pool register.
    let mut active: Vec<(usize, u8)> = Vec::new();
    let mut slots = 0u32;

    for (i, op) in block.ops.iter().enumerate() {
        let Some(dst) = op.dst() else { continue };
        active.retain(|&(end, reg)| {
            if end < i {
                free.push(reg);
                false
            } else {
                true
            }
        });
        let end = last_use[dst.0 as usize].max(i);
        let loc = match free.pop() {
            Some(reg) => {
                active.push((end, reg));
                Loc::Reg(reg)
            }
            None => {
                let s = slots;
                slots += 1;
                Loc::Spill(s)
            }
        };
        locs[dst.0 as usize] = Some(loc);
    }
    locs
}

struct Emit {
    asm: Asm,
    locs: Vec<Option<Loc>>,
}

impl Emit {
    fn prologue(&mut self) {
        // Five callee-saved pushes leave rsp 16-aligned for helper calls.
        for reg in [RBX, R12, R13, asm::R14, asm::R15] {
            self.asm.push_r(reg);
        }
        self.asm.mov_rr(R12, RDI);
        self.asm.mov_r_m(R13, R12, 0);
    }

    fn epilogue(&mut self) {
        for reg in [asm::R15, asm::R14, R13, R12, RBX] {
            self.asm.pop_r(reg);
        }
        self.asm.ret();
    }

    fn load(&mut self, v: ValueId, reg: u8) {
        match self.locs[v.0 as usize] {
            Some(Loc::Reg(r)) => self.asm.mov_rr(reg, r),
            Some(Loc::Spill(s)) => self.asm.mov_r_m(reg, R13, spill_off(s)),
            None => unreachable!("use of unallocated value v{}", v.0),
        }
    }

    fn store(&mut self, reg: u8, v: ValueId) {
        match self.locs[v.0 as usize] {
            Some(Loc::Reg(r)) => self.asm.mov_rr(r, reg),
            Some(Loc::Spill(s)) => self.asm.mov_m_r(R13, spill_off(s), reg),
            None => unreachable!("definition of unallocated value v{}", v.0),
        }
    }

    fn load_pred(&mut self, pred: &Option<ValueId>, reg: u8) {
        match pred {
            Some(p) => self.load(*p, reg),
            None => self.asm.mov_ri64(reg, 1),
        }
    }

    fn call(&mut self, helper: u64) {
        self.asm.mov_ri64(RAX, helper);
        self.asm.call_r(RAX);
    }

    fn fault_check(&mut self, fault: Label) {
        self.asm.cmp_m_imm8(R12, ENV_HELPER_OK_OFFSET as i32, 0);
        self.asm.jcc(Cc::E, fault);
    }

    fn set_exit(&mut self, kind: u64) {
        self.asm
            .mov_m_imm32(R12, ENV_EXIT_KIND_OFFSET as i32, kind as i32);
    }

    fn op(&mut self, op: &Op, fault: Label) {
        match *op {
            Op::Const { dst, value } => {
                self.asm.mov_ri64(RAX, value);
                self.store(RAX, dst);
            }
            Op::GetReg { dst, reg } => {
                self.asm.mov_r_m(RAX, R13, guest_off(reg));
                self.store(RAX, dst);
            }
            Op::SetReg { reg, src } => {
                self.load(src, RAX);
                self.asm.mov_m_r(R13, guest_off(reg), RAX);
            }
            Op::Bin {
                dst,
                op: bin,
                width,
                lhs,
                rhs,
            } => {
                let w = width == Width::W64;
                self.load(lhs, RAX);
                self.load(rhs, RCX);
                match bin {
                    BinOp::Add => self.asm.add_rr(w, RAX, RCX),
                    BinOp::Sub => self.asm.sub_rr(w, RAX, RCX),
                    BinOp::And => self.asm.and_rr(w, RAX, RCX),
                    BinOp::Orr => self.asm.or_rr(w, RAX, RCX),
                    BinOp::Eor => self.asm.xor_rr(w, RAX, RCX),
                    BinOp::Mul => self.asm.imul_rr(w, RAX, RCX),
                    // Hardware masks cl by the operand width, which is the
                    // IR's modulo rule.
                    BinOp::Lsl => self.asm.shl_cl(w, RAX),
                    BinOp::Lsr => self.asm.shr_cl(w, RAX),
                    BinOp::Asr => self.asm.sar_cl(w, RAX),
                    BinOp::Ror => self.asm.ror_cl(w, RAX),
                    BinOp::UDiv | BinOp::SDiv => unreachable!("rejected by op_supported"),
                }
                if !w {
                    // 32-bit results are zero-extended definitions.
                    self.asm.mov_rr32(RAX, RAX);
                }
                self.store(RAX, dst);
            }
            Op::Un {
                dst,
                op: _,
                width,
                src,
            } => {
                let w = width == Width::W64;
                self.load(src, RAX);
                self.asm.not_r(w, RAX);
                if !w {
                    self.asm.mov_rr32(RAX, RAX);
                }
                self.store(RAX, dst);
            }
            Op::Sext { dst, from, src } => {
                self.load(src, RAX);
                match from {
                    Width::W8 => self.asm.movsx8(RAX, RAX),
                    Width::W16 => self.asm.movsx16(RAX, RAX),
                    Width::W32 => self.asm.movsxd(RAX, RAX),
                    Width::W64 => {}
                }
                self.store(RAX, dst);
            }
            Op::Mask { dst, width, src } => {
                self.load(src, RAX);
                match width {
                    Width::W8 => self.asm.movzx8(RAX, RAX),
                    Width::W16 => self.asm.movzx16(RAX, RAX),
                    Width::W32 => self.asm.mov_rr32(RAX, RAX),
                    Width::W64 => {}
                }
                self.store(RAX, dst);
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
                let carry_sel = match carry {
                    CarryIn::Zero => ADC_CARRY_ZERO,
                    CarryIn::One => ADC_CARRY_ONE,
                    CarryIn::Flag => ADC_CARRY_FLAG,
                };
                let ctrl = carry_sel | flags_ctrl(flags, width, pred.is_some());
                self.asm.mov_rr(RDI, R12);
                self.load(lhs, RSI);
                self.load(rhs, RDX);
                self.asm.mov_ri64(RCX, ctrl);
                self.load_pred(&pred, R8);
                self.call(env::vesper_jit_adc as usize as u64);
                self.store(RAX, dst);
            }
            Op::SetNz {
                src,
                width,
                flags,
                pred,
            } => {
                self.asm.mov_rr(RDI, R12);
                self.load(src, RSI);
                self.asm
                    .mov_ri64(RDX, flags_ctrl(flags, width, pred.is_some()));
                self.load_pred(&pred, RCX);
                self.call(env::vesper_jit_setnz as usize as u64);
            }
            Op::WriteFlag { flag, src, pred } => {
                self.asm.mov_rr(RDI, R12);
                let bits: FlagSet = flag.into();
                self.asm.mov_ri64(RSI, bits.bits() as u64);
                self.load(src, RDX);
                self.asm.mov_ri64(
                    RCX,
                    if pred.is_some() { FLAGS_HAS_PRED } else { 0 },
                );
                self.load_pred(&pred, R8);
                self.call(env::vesper_jit_write_flag as usize as u64);
            }
            Op::ReadFlag { dst, flag } => {
                self.asm.mov_r_m(RAX, R13, CpuState::PSTATE_OFFSET as i32);
                self.asm.mov_ri64(RCX, pstate_bit(flag));
                self.asm.shr_cl(true, RAX);
                self.asm.mov_ri64(RCX, 1);
                self.asm.and_rr(true, RAX, RCX);
                self.store(RAX, dst);
            }
            Op::EvalCond { dst, cond } => {
                self.asm.mov_rr(RDI, R12);
                self.asm.mov_ri64(RSI, cond as u64);
                self.call(env::vesper_jit_cond as usize as u64);
                self.store(RAX, dst);
            }
            Op::Select {
                dst,
                cond,
                if_true,
                if_false,
            } => {
                self.load(cond, RAX);
                self.load(if_false, RDX);
                self.load(if_true, RCX);
                self.asm.test_rr(true, RAX, RAX);
                self.asm.cmov(Cc::Ne, RDX, RCX);
                self.store(RDX, dst);
            }
            Op::Load {
                dst,
                addr,
                size,
                pred,
                pc,
            } => {
                self.asm.mov_rr(RDI, R12);
                self.load(addr, RSI);
                self.asm.mov_ri64(RDX, size_log2(size));
                self.load_pred(&pred, RCX);
                self.asm.mov_ri64(R8, pc);
                self.call(env::vesper_jit_load as usize as u64);
                self.store(RAX, dst);
                self.fault_check(fault);
            }
            Op::Store {
                addr,
                src,
                size,
                pred,
                pc,
            } => {
                self.asm.mov_rr(RDI, R12);
                self.load(addr, RSI);
                self.load(src, RDX);
                self.asm.mov_ri64(RCX, size_log2(size));
                self.load_pred(&pred, R8);
                self.asm.mov_ri64(R9, pc);
                self.call(env::vesper_jit_store as usize as u64);
                self.fault_check(fault);
            }
        }
    }

    fn terminator(&mut self, term: &Terminator, exit: Label) {
        match *term {
            Terminator::Jump { target } => {
                self.asm.mov_ri64(RAX, target);
                self.set_exit(EXIT_JUMP);
                self.asm.jmp(exit);
            }
            Terminator::CondJump {
                cond,
                if_true,
                if_false,
            } => {
                self.load(cond, RCX);
                self.asm.mov_ri64(RAX, if_true);
                self.asm.test_rr(true, RCX, RCX);
                let taken = self.asm.new_label();
                self.asm.jcc(Cc::Ne, taken);
                self.asm.mov_ri64(RAX, if_false);
                self.asm.bind(taken);
                self.set_exit(EXIT_JUMP);
                self.asm.jmp(exit);
            }
            Terminator::IndirectJump { target, exchange } => {
                self.load(target, RAX);
                self.set_exit(if exchange { EXIT_EXCHANGE } else { EXIT_JUMP });
                self.asm.jmp(exit);
            }
            Terminator::Trap {
                kind,
                resume_pc,
                pred,
                fallthrough,
            } => {
                let fall = self.asm.new_label();
                if let Some(p) = pred {
                    self.load(p, RCX);
                    self.asm.test_rr(true, RCX, RCX);
                    self.asm.jcc(Cc::E, fall);
                }
                let (tag, arg) = match kind {
                    TrapKind::Syscall { imm } => (RAISE_SYSCALL, imm as u64),
                    TrapKind::Breakpoint { imm } => (RAISE_BREAKPOINT, imm as u64),
                    TrapKind::Undefined { pc } => (RAISE_UNDEFINED, pc),
                };
                self.asm.mov_rr(RDI, R12);
                self.asm.mov_ri64(RSI, tag);
                self.asm.mov_ri64(RDX, arg);
                self.call(env::vesper_jit_raise as usize as u64);
                self.asm.mov_ri64(RAX, resume_pc);
                self.set_exit(EXIT_TRAP);
                self.asm.jmp(exit);
                self.asm.bind(fall);
                if pred.is_some() {
                    self.asm.mov_ri64(RAX, fallthrough);
                    self.set_exit(EXIT_JUMP);
                    self.asm.jmp(exit);
                }
            }
        }
    }
}

fn spill_off(slot: u32) -> i32 {
    (CpuState::SPILL_OFFSET + slot as usize * 8) as i32
}

fn guest_off(reg: GuestReg) -> i32 {
    match reg {
        GuestReg::X(r) => (CpuState::GPR_OFFSET + r.index() * 8) as i32,
        GuestReg::Sp => CpuState::SP_OFFSET as i32,
        GuestReg::VLo(v) => (CpuState::VREG_OFFSET + v.index() * 16) as i32,
        GuestReg::VHi(v) => (CpuState::VREG_OFFSET + v.index() * 16 + 8) as i32,
    }
}

fn pstate_bit(flag: vesper_types::Flag) -> u64 {
    match flag {
        vesper_types::Flag::N => 31,
        vesper_types::Flag::Z => 30,
        vesper_types::Flag::C => 29,
        vesper_types::Flag::V => 28,
    }
}

fn flags_ctrl(flags: FlagSet, width: Width, has_pred: bool) -> u64 {
    let mut ctrl = (flags.bits() as u64) << FLAGS_MASK_SHIFT;
    if width == Width::W64 {
        ctrl |= FLAGS_WIDTH64;
    }
    if has_pred {
        ctrl |= FLAGS_HAS_PRED;
    }
    ctrl
}

fn size_log2(width: Width) -> u64 {
    width.bytes().trailing_zeros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::run_ir;
    use vesper_mem::Perm;
    use vesper_types::{Flag, Gpr, IsaMode};

    fn block(ops: Vec<Op>, term: Terminator, value_count: u32) -> IrBlock {
        let b = IrBlock {
            entry: 0x1000,
            byte_len: 4,
            inst_count: 1,
            mode: IsaMode::A64,
            code_hash: 0,
            ops,
            term,
            value_count,
        };
        assert_eq!(b.validate(), Ok(()));
        b
    }

    fn run_both(
        block: &IrBlock,
        setup: impl Fn(&mut CpuState),
        space: &AddressSpace,
    ) -> (CpuState, CpuState, BlockOutcome) {
        let native = compile(block).unwrap();
        let mut cpu_n = CpuState::new(block.entry, IsaMode::A64);
        setup(&mut cpu_n);
        let mut cpu_i = cpu_n.clone();
        let mut window = None;
        let out_n = native.execute(&mut cpu_n, space, &mut window).unwrap();
        let out_i = run_ir(block, &mut cpu_i, space).unwrap();
        assert_eq!(out_n, out_i);
        (cpu_n, cpu_i, out_n)
    }

    #[test]
    fn arithmetic_matches_interpreter() {
        let space = AddressSpace::new();
        let x0 = Gpr::new(0).unwrap();
        let x1 = Gpr::new(1).unwrap();
        let b = block(
            vec![
                Op::GetReg {
                    dst: ValueId(0),
                    reg: GuestReg::X(x1),
                },
                Op::Const {
                    dst: ValueId(1),
                    value: 42,
                },
                Op::AddWithCarry {
                    dst: ValueId(2),
                    width: Width::W64,
                    lhs: ValueId(0),
                    rhs: ValueId(1),
                    carry: CarryIn::Zero,
                    flags: FlagSet::NZCV,
                    pred: None,
                },
                Op::SetReg {
                    reg: GuestReg::X(x0),
                    src: ValueId(2),
                },
            ],
            Terminator::Jump { target: 0x1004 },
            3,
        );
        let (cpu_n, cpu_i, out) = run_both(
            &b,
            |cpu| cpu.set_x(Gpr::new(1).unwrap(), u64::MAX),
            &space,
        );
        assert_eq!(out, BlockOutcome::Jump { pc: 0x1004 });
        assert_eq!(cpu_n.x(x0), 41);
        assert_eq!(cpu_n.gpr, cpu_i.gpr);
        assert_eq!(cpu_n.pstate, cpu_i.pstate);
        assert!(cpu_n.flag(Flag::C));
    }

    #[test]
    fn shifts_and_selects_match_interpreter() {
        let space = AddressSpace::new();
        let x0 = Gpr::new(0).unwrap();
        let b = block(
            vec![
                Op::Const {
                    dst: ValueId(0),
                    value: 0x8000_0001,
                },
                Op::Const {
                    dst: ValueId(1),
                    value: 4,
                },
                Op::Bin {
                    dst: ValueId(2),
                    op: BinOp::Asr,
                    width: Width::W32,
                    lhs: ValueId(0),
                    rhs: ValueId(1),
                },
                Op::Const {
                    dst: ValueId(3),
                    value: 0,
                },
                Op::Select {
                    dst: ValueId(4),
                    cond: ValueId(3),
                    if_true: ValueId(0),
                    if_false: ValueId(2),
                },
                Op::SetReg {
                    reg: GuestReg::X(x0),
                    src: ValueId(4),
                },
            ],
            Terminator::Jump { target: 0x1004 },
            5,
        );
        let (cpu_n, _, _) = run_both(&b, |_| {}, &space);
        assert_eq!(cpu_n.x(x0), 0xf800_0000);
    }

    #[test]
    fn memory_round_trip_through_helpers() {
        let space = AddressSpace::new();
        space.map(0x4000, 0x1000, Perm::RW).unwrap();
        let x0 = Gpr::new(0).unwrap();
        let b = block(
            vec![
                Op::Const {
                    dst: ValueId(0),
                    value: 0x4010,
                },
                Op::Const {
                    dst: ValueId(1),
                    value: 0xabcd_ef01,
                },
                Op::Store {
                    addr: ValueId(0),
                    src: ValueId(1),
                    size: Width::W32,
                    pred: None,
                    pc: 0x1000,
                },
                Op::Load {
                    dst: ValueId(2),
                    addr: ValueId(0),
                    size: Width::W32,
                    pred: None,
                    pc: 0x1000,
                },
                Op::SetReg {
                    reg: GuestReg::X(x0),
                    src: ValueId(2),
                },
            ],
            Terminator::Jump { target: 0x1004 },
            3,
        );
        let (cpu_n, _, _) = run_both(&b, |_| {}, &space);
        assert_eq!(cpu_n.x(x0), 0xabcd_ef01);
    }

    #[test]
    fn faulting_store_exits_with_fault_pc() {
        let space = AddressSpace::new();
        let b = block(
            vec![
                Op::Const {
                    dst: ValueId(0),
                    value: 0x9000,
                },
                Op::Store {
                    addr: ValueId(0),
                    src: ValueId(0),
                    size: Width::W64,
                    pred: None,
                    pc: 0x1000,
                },
            ],
            Terminator::Jump { target: 0x1004 },
            1,
        );
        let native = compile(&b).unwrap();
        let mut cpu = CpuState::new(0x1000, IsaMode::A64);
        let mut window = None;
        let fault = native.execute(&mut cpu, &space, &mut window).unwrap_err();
        assert_eq!(fault.pc, 0x1000);
        assert_eq!(fault.error, MemoryError::unmapped(0x9000));
    }

    #[test]
    fn trap_terminator_reports_kind() {
        let space = AddressSpace::new();
        let b = block(
            vec![],
            Terminator::Trap {
                kind: TrapKind::Syscall { imm: 3 },
                resume_pc: 0x1004,
                pred: None,
                fallthrough: 0x1004,
            },
            0,
        );
        let native = compile(&b).unwrap();
        let mut cpu = CpuState::new(0x1000, IsaMode::A64);
        let mut window = None;
        let out = native.execute(&mut cpu, &space, &mut window).unwrap();
        assert_eq!(
            out,
            BlockOutcome::Trap {
                kind: TrapKind::Syscall { imm: 3 },
                resume_pc: 0x1004,
            }
        );
        assert_eq!(cpu.pending(), None);
    }

    #[test]
    fn division_is_declined() {
        let b = block(
            vec![
                Op::Const {
                    dst: ValueId(0),
                    value: 8,
                },
                Op::Bin {
                    dst: ValueId(1),
                    op: BinOp::UDiv,
                    width: Width::W64,
                    lhs: ValueId(0),
                    rhs: ValueId(0),
                },
            ],
            Terminator::Jump { target: 0x1004 },
            2,
        );
        assert!(matches!(compile(&b), Err(CompileError::Unsupported)));
    }

    #[test]
    fn register_pressure_spills_into_the_context() {
        // More simultaneously-live values than pool registers.
        let space = AddressSpace::new();
        let x0 = Gpr::new(0).unwrap();
        let mut ops = Vec::new();
        for i in 0..6u32 {
            ops.push(Op::Const {
                dst: ValueId(i),
                value: 1 << i,
            });
        }
        let mut acc = 0u32;
        for i in 1..6u32 {
            ops.push(Op::Bin {
                dst: ValueId(6 + acc),
                op: BinOp::Add,
                width: Width::W64,
                lhs: ValueId(if acc == 0 { 0 } else { 5 + acc }),
                rhs: ValueId(i),
            });
            acc += 1;
        }
        ops.push(Op::SetReg {
            reg: GuestReg::X(x0),
            src: ValueId(10),
        });
        let b = block(ops, Terminator::Jump { target: 0x1004 }, 11);
        let (cpu_n, _, _) = run_both(&b, |_| {}, &space);
        assert_eq!(cpu_n.x(x0), 0b11_1111);
    }
}
