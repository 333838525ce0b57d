//! Structured opcode descriptors produced by the decoders.
//!
//! `Inst` is a flat tagged enum over a closed set of opcode kinds; the IR
//! lowering in `vesper-jit` is a single `match` over it. Operand fields are
//! fully resolved (register-31 ambiguity, immediate scaling, shift amounts)
//! so nothing downstream re-inspects encoding bits.

use vesper_types::{Cond, Gpr, RegOrSp, RegOrZr, Vreg, Width};

/// Shift applied to a register operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShiftKind {
    Lsl,
    Lsr,
    Asr,
    Ror,
}

impl ShiftKind {
    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0b00 => ShiftKind::Lsl,
            0b01 => ShiftKind::Lsr,
            0b10 => ShiftKind::Asr,
            _ => ShiftKind::Ror,
        }
    }
}

/// Extend applied to a register offset or operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Extend {
    Uxtb,
    Uxth,
    Uxtw,
    Uxtx,
    Sxtb,
    Sxth,
    Sxtw,
    Sxtx,
}

impl Extend {
    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        match bits & 0b111 {
            0b000 => Extend::Uxtb,
            0b001 => Extend::Uxth,
            0b010 => Extend::Uxtw,
            0b011 => Extend::Uxtx,
            0b100 => Extend::Sxtb,
            0b101 => Extend::Sxth,
            0b110 => Extend::Sxtw,
            _ => Extend::Sxtx,
        }
    }

    /// Width of the source field the extend reads.
    #[inline]
    pub const fn src_width(self) -> Width {
        match self {
            Extend::Uxtb | Extend::Sxtb => Width::W8,
            Extend::Uxth | Extend::Sxth => Width::W16,
            Extend::Uxtw | Extend::Sxtw => Width::W32,
            Extend::Uxtx | Extend::Sxtx => Width::W64,
        }
    }

    #[inline]
    pub const fn is_signed(self) -> bool {
        matches!(
            self,
            Extend::Sxtb | Extend::Sxth | Extend::Sxtw | Extend::Sxtx
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddSubOp {
    Add,
    Sub,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Orr,
    Eor,
    /// AND that also clears/sets NZ (C=V=0); `set_flags` on the variant.
    Ands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveWideOp {
    /// Move inverted shifted immediate.
    Movn,
    /// Move shifted immediate, zeroing the rest.
    Movz,
    /// Insert shifted immediate, keeping the rest.
    Movk,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BitfieldOp {
    Sbfm,
    Bfm,
    Ubfm,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CondSelOp {
    Csel,
    Csinc,
    Csinv,
    Csneg,
}

/// Two-source data-processing operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shift2Op {
    Udiv,
    Sdiv,
    Lslv,
    Lsrv,
    Asrv,
    Rorv,
}

/// One-source data-processing operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bit1Op {
    Rbit,
    Rev16,
    Rev32,
    Rev,
    Clz,
    Cls,
}

/// Addressing form of a load/store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddrMode {
    /// `[rn, #imm]` — no base update.
    Offset,
    /// `[rn, #imm]!` — base updated before the access.
    PreIndex,
    /// `[rn], #imm` — base updated after the access.
    PostIndex,
}

/// Memory access width and sign-extension behavior of a scalar load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemAccess {
    /// Width of the memory access itself.
    pub size: Width,
    /// Register width the loaded value lands in (`W32` or `W64`).
    pub reg: Width,
    /// Sign-extend the loaded value up to `reg` width.
    pub signed: bool,
}

/// Vector load/store element size in bytes (4 = S, 8 = D, 16 = Q).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VecSize {
    S,
    D,
    Q,
}

impl VecSize {
    #[inline]
    pub const fn bytes(self) -> u64 {
        match self {
            VecSize::S => 4,
            VecSize::D => 8,
            VecSize::Q => 16,
        }
    }
}

/// Operand-2 of an A32 data-processing instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum A32Operand2 {
    /// Rotated 8-bit immediate, pre-rotated to its final value.
    Imm {
        value: u32,
        /// Shifter carry-out, when the rotation produces one (`None` means
        /// "carry unchanged").
        carry: Option<bool>,
    },
    /// Register with an immediate shift. `RRX` is represented as
    /// `Ror` with `amount == 0`.
    ShiftedReg {
        rm: RegOrZr,
        shift: ShiftKind,
        amount: u32,
    },
}

/// A32 data-processing opcode (the 4-bit `opc` field, minus the compare
/// group which is represented by `set_flags` + discarded destination).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum A32AluOp {
    And,
    Eor,
    Sub,
    Rsb,
    Add,
    Adc,
    Sbc,
    Rsc,
    Tst,
    Teq,
    Cmp,
    Cmn,
    Orr,
    Mov,
    Bic,
    Mvn,
}

/// One decoded guest instruction.
///
/// A64 and A32/T16 variants share this enum; the legacy-width variants carry
/// their condition predicate explicitly (`cond`), A64 variants are
/// unconditional except for the dedicated conditional forms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Inst {
    // ---- A64 data processing, immediate ----
    /// Destination encoding 31 means SP for the plain form and "discard"
    /// (zero register) for the flag-setting form; the lowering applies that
    /// rule, the decoder reports the raw [`RegOrSp`].
    AddSubImm {
        width: Width,
        op: AddSubOp,
        set_flags: bool,
        rd: RegOrSp,
        rn: RegOrSp,
        imm: u64,
    },
    LogicalImm {
        width: Width,
        op: LogicOp,
        rd: RegOrSp,
        rn: RegOrZr,
        imm: u64,
    },
    MoveWide {
        width: Width,
        op: MoveWideOp,
        rd: RegOrZr,
        imm: u16,
        shift: u32,
    },
    /// ADR / ADRP; `imm` is the final byte offset from the (page-aligned,
    /// for ADRP) pc.
    Adr {
        rd: RegOrZr,
        imm: i64,
        page: bool,
    },
    Bitfield {
        width: Width,
        op: BitfieldOp,
        rd: RegOrZr,
        rn: RegOrZr,
        immr: u32,
        imms: u32,
    },
    Extract {
        width: Width,
        rd: RegOrZr,
        rn: RegOrZr,
        rm: RegOrZr,
        lsb: u32,
    },

    // ---- A64 data processing, register ----
    AddSubShifted {
        width: Width,
        op: AddSubOp,
        set_flags: bool,
        rd: RegOrZr,
        rn: RegOrZr,
        rm: RegOrZr,
        shift: ShiftKind,
        amount: u32,
    },
    AddSubExtended {
        width: Width,
        op: AddSubOp,
        set_flags: bool,
        rd: RegOrSp,
        rn: RegOrSp,
        rm: RegOrZr,
        extend: Extend,
        amount: u32,
    },
    AddSubCarry {
        width: Width,
        op: AddSubOp,
        set_flags: bool,
        rd: RegOrZr,
        rn: RegOrZr,
        rm: RegOrZr,
    },
    LogicalShifted {
        width: Width,
        op: LogicOp,
        /// Operand-2 is bitwise-inverted (BIC/ORN/EON/BICS forms).
        invert: bool,
        rd: RegOrZr,
        rn: RegOrZr,
        rm: RegOrZr,
        shift: ShiftKind,
        amount: u32,
    },
    CondSelect {
        width: Width,
        op: CondSelOp,
        rd: RegOrZr,
        rn: RegOrZr,
        rm: RegOrZr,
        cond: Cond,
    },
    CondCompare {
        width: Width,
        op: AddSubOp,
        rn: RegOrZr,
        /// Immediate 5-bit operand or register, pre-resolved.
        rm: CcmpOperand,
        nzcv: u8,
        cond: Cond,
    },
    DataProc2 {
        width: Width,
        op: Shift2Op,
        rd: RegOrZr,
        rn: RegOrZr,
        rm: RegOrZr,
    },
    DataProc1 {
        width: Width,
        op: Bit1Op,
        rd: RegOrZr,
        rn: RegOrZr,
    },
    /// MADD / MSUB (MUL/MNEG when `ra` is the zero register).
    MulAdd {
        width: Width,
        sub: bool,
        rd: RegOrZr,
        rn: RegOrZr,
        rm: RegOrZr,
        ra: RegOrZr,
    },

    // ---- A64 loads/stores ----
    LoadImm {
        access: MemAccess,
        rt: RegOrZr,
        rn: RegOrSp,
        offset: i64,
        mode: AddrMode,
    },
    StoreImm {
        size: Width,
        rt: RegOrZr,
        rn: RegOrSp,
        offset: i64,
        mode: AddrMode,
    },
    LoadReg {
        access: MemAccess,
        rt: RegOrZr,
        rn: RegOrSp,
        rm: RegOrZr,
        extend: Extend,
        shift: u32,
    },
    StoreReg {
        size: Width,
        rt: RegOrZr,
        rn: RegOrSp,
        rm: RegOrZr,
        extend: Extend,
        shift: u32,
    },
    LoadPair {
        width: Width,
        signed: bool,
        rt: RegOrZr,
        rt2: RegOrZr,
        rn: RegOrSp,
        offset: i64,
        mode: AddrMode,
    },
    StorePair {
        width: Width,
        rt: RegOrZr,
        rt2: RegOrZr,
        rn: RegOrSp,
        offset: i64,
        mode: AddrMode,
    },
    /// PC-relative load; `offset` is a byte offset from this instruction.
    LoadLiteral {
        access: MemAccess,
        rt: RegOrZr,
        offset: i64,
    },
    VecLoad {
        size: VecSize,
        vt: Vreg,
        rn: RegOrSp,
        offset: i64,
        mode: AddrMode,
    },
    VecStore {
        size: VecSize,
        vt: Vreg,
        rn: RegOrSp,
        offset: i64,
        mode: AddrMode,
    },

    // ---- A64 branches & system ----
    Branch {
        offset: i64,
        link: bool,
    },
    BranchCond {
        cond: Cond,
        offset: i64,
    },
    CompareBranch {
        width: Width,
        nonzero: bool,
        rt: RegOrZr,
        offset: i64,
    },
    TestBranch {
        nonzero: bool,
        rt: RegOrZr,
        bit: u32,
        offset: i64,
    },
    BranchReg {
        rn: RegOrZr,
        link: bool,
    },
    Svc {
        imm: u16,
    },
    Brk {
        imm: u16,
    },
    Nop,

    // ---- A32 / T16 (legacy width) ----
    A32Alu {
        cond: Cond,
        op: A32AluOp,
        set_flags: bool,
        rd: RegOrZr,
        rn: RegOrZr,
        op2: A32Operand2,
    },
    A32LoadStore {
        cond: Cond,
        load: bool,
        byte: bool,
        rt: RegOrZr,
        rn: RegOrSp,
        offset: i64,
        mode: AddrMode,
    },
    A32Branch {
        cond: Cond,
        offset: i64,
        link: bool,
    },
    /// BX — branch to register, possibly switching to the compact sub-mode
    /// (interworking bit in the target address).
    A32BranchExchange {
        cond: Cond,
        rm: RegOrZr,
    },
    A32Svc {
        cond: Cond,
        imm: u32,
    },
}

/// Second operand of a conditional compare.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CcmpOperand {
    Imm(u64),
    Reg(RegOrZr),
}

impl Inst {
    /// Whether this instruction ends a translation unit.
    pub fn is_block_terminator(&self) -> bool {
        matches!(
            self,
            Inst::Branch { .. }
                | Inst::BranchCond { .. }
                | Inst::CompareBranch { .. }
                | Inst::TestBranch { .. }
                | Inst::BranchReg { .. }
                | Inst::Svc { .. }
                | Inst::Brk { .. }
                | Inst::A32Branch { .. }
                | Inst::A32BranchExchange { .. }
                | Inst::A32Svc { .. }
        )
    }
}
