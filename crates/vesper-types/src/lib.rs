//! Shared leaf types for the Vesper guest CPU core.
//!
//! Everything here is `Copy`, allocation-free, and shared between the
//! decoder, the JIT, and the dispatcher so they agree on operand widths,
//! condition codes, and flag sets without depending on each other.

#![forbid(unsafe_code)]

use bitflags::bitflags;

/// Scalar operand width.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
}

impl Width {
    #[inline]
    pub const fn bits(self) -> u32 {
        match self {
            Width::W8 => 8,
            Width::W16 => 16,
            Width::W32 => 32,
            Width::W64 => 64,
        }
    }

    #[inline]
    pub const fn bytes(self) -> u64 {
        (self.bits() / 8) as u64
    }

    #[inline]
    pub const fn mask(self) -> u64 {
        match self {
            Width::W8 => 0xff,
            Width::W16 => 0xffff,
            Width::W32 => 0xffff_ffff,
            Width::W64 => u64::MAX,
        }
    }

    #[inline]
    pub const fn truncate(self, value: u64) -> u64 {
        value & self.mask()
    }

    /// Sign-extend `value` (already truncated to this width) to 64 bits.
    #[inline]
    pub const fn sign_extend(self, value: u64) -> u64 {
        match self {
            Width::W8 => value as u8 as i8 as i64 as u64,
            Width::W16 => value as u16 as i16 as i64 as u64,
            Width::W32 => value as u32 as i32 as i64 as u64,
            Width::W64 => value,
        }
    }

    /// Register-operand width selected by an instruction's `sf` bit.
    #[inline]
    pub const fn from_sf(sf: bool) -> Self {
        if sf {
            Width::W64
        } else {
            Width::W32
        }
    }
}

/// Guest condition code (the A64/A32 `cond` field encoding).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cond {
    Eq = 0b0000,
    Ne = 0b0001,
    Cs = 0b0010,
    Cc = 0b0011,
    Mi = 0b0100,
    Pl = 0b0101,
    Vs = 0b0110,
    Vc = 0b0111,
    Hi = 0b1000,
    Ls = 0b1001,
    Ge = 0b1010,
    Lt = 0b1011,
    Gt = 0b1100,
    Le = 0b1101,
    Al = 0b1110,
    /// Encoded `0b1111`; behaves as always-true in A64.
    Nv = 0b1111,
}

impl Cond {
    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        match bits & 0xf {
            0b0000 => Cond::Eq,
            0b0001 => Cond::Ne,
            0b0010 => Cond::Cs,
            0b0011 => Cond::Cc,
            0b0100 => Cond::Mi,
            0b0101 => Cond::Pl,
            0b0110 => Cond::Vs,
            0b0111 => Cond::Vc,
            0b1000 => Cond::Hi,
            0b1001 => Cond::Ls,
            0b1010 => Cond::Ge,
            0b1011 => Cond::Lt,
            0b1100 => Cond::Gt,
            0b1101 => Cond::Le,
            0b1110 => Cond::Al,
            _ => Cond::Nv,
        }
    }

    /// The condition with its low bit flipped (the `CSINC Wd, WZR, WZR, cond`
    /// family and conditional compares use this).
    #[inline]
    pub const fn invert(self) -> Self {
        Cond::from_bits(self as u32 ^ 1)
    }

    #[inline]
    pub fn eval(self, n: bool, z: bool, c: bool, v: bool) -> bool {
        match self {
            Cond::Eq => z,
            Cond::Ne => !z,
            Cond::Cs => c,
            Cond::Cc => !c,
            Cond::Mi => n,
            Cond::Pl => !n,
            Cond::Vs => v,
            Cond::Vc => !v,
            Cond::Hi => c && !z,
            Cond::Ls => !(c && !z),
            Cond::Ge => n == v,
            Cond::Lt => n != v,
            Cond::Gt => !z && n == v,
            Cond::Le => !(!z && n == v),
            Cond::Al | Cond::Nv => true,
        }
    }
}

/// One architectural flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Flag {
    N,
    Z,
    C,
    V,
}

bitflags! {
    /// Set of NZCV flags, used to mark which flags an IR operation writes and
    /// which are live across a block boundary.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct FlagSet: u8 {
        const N = 1 << 0;
        const Z = 1 << 1;
        const C = 1 << 2;
        const V = 1 << 3;
    }
}

impl FlagSet {
    pub const NZCV: FlagSet = FlagSet::all();
}

impl From<Flag> for FlagSet {
    #[inline]
    fn from(flag: Flag) -> Self {
        match flag {
            Flag::N => FlagSet::N,
            Flag::Z => FlagSet::Z,
            Flag::C => FlagSet::C,
            Flag::V => FlagSet::V,
        }
    }
}

/// General-purpose register number, `0..=30`.
///
/// Register 31 is not representable here: encodings that use it mean either
/// the zero register or the stack pointer, and the decoder resolves that
/// distinction into [`RegOrZr`]/[`RegOrSp`] before anything downstream sees
/// the operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Gpr(u8);

impl Gpr {
    pub const COUNT: usize = 31;
    pub const LR: Gpr = Gpr(30);

    /// `None` if `index` is 31 (zero register / stack pointer slot).
    #[inline]
    pub const fn new(index: u8) -> Option<Self> {
        if index < 31 {
            Some(Gpr(index))
        } else {
            None
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// A register operand where encoding 31 means the zero register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegOrZr {
    Reg(Gpr),
    Zr,
}

impl RegOrZr {
    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        match Gpr::new((bits & 0x1f) as u8) {
            Some(r) => RegOrZr::Reg(r),
            None => RegOrZr::Zr,
        }
    }
}

/// A register operand where encoding 31 means the stack pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegOrSp {
    Reg(Gpr),
    Sp,
}

impl RegOrSp {
    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        match Gpr::new((bits & 0x1f) as u8) {
            Some(r) => RegOrSp::Reg(r),
            None => RegOrSp::Sp,
        }
    }
}

/// Vector register number, `0..=31`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Vreg(u8);

impl Vreg {
    pub const COUNT: usize = 32;

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Vreg((bits & 0x1f) as u8)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Active instruction-set mode of a guest thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IsaMode {
    /// Primary 64-bit instruction set, fixed 4-byte encodings.
    A64,
    /// Legacy 32-bit instruction set, fixed 4-byte encodings, predicated.
    A32,
    /// Compact 16-bit sub-mode of the legacy instruction set.
    T16,
}

impl IsaMode {
    /// Minimum alignment of an instruction fetch in this mode.
    #[inline]
    pub const fn fetch_align(self) -> u64 {
        match self {
            IsaMode::A64 | IsaMode::A32 => 4,
            IsaMode::T16 => 2,
        }
    }
}
