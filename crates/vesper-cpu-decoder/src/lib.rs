//! Pure instruction decoders for the guest CPU.
//!
//! Three entry points, one per instruction-set mode: [`decode_a64`] for the
//! primary 64-bit set, [`decode_a32`] for the legacy 32-bit set, and
//! [`decode_t16`] for the compact 16-bit sub-mode. All are pure functions of
//! the instruction word — no allocation, no context beyond the mode — and
//! are total: every bit pattern yields either a structured [`Inst`] or a
//! typed [`DecodeError`], never a panic. The dispatcher relies on the typed
//! failure to raise the guest-visible undefined-instruction exception
//! instead of mistranslating.

#![forbid(unsafe_code)]

mod a32;
mod a64;
mod inst;
mod t16;

use thiserror::Error;
use vesper_types::IsaMode;

pub use inst::{
    A32AluOp, A32Operand2, AddSubOp, AddrMode, Bit1Op, BitfieldOp, CcmpOperand, CondSelOp, Extend,
    Inst, LogicOp, MemAccess, MoveWideOp, Shift2Op, ShiftKind, VecSize,
};

/// Typed decode failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Unallocated or reserved encoding, or an encoding outside the
    /// implemented subset. Both raise the same guest-visible exception.
    #[error("undefined encoding {word:#010x}")]
    Undefined { word: u32 },
}

/// Decode one instruction word in the primary 64-bit instruction set.
pub fn decode_a64(word: u32) -> Result<Inst, DecodeError> {
    a64::decode(word)
}

/// Decode one instruction word in the legacy 32-bit instruction set.
pub fn decode_a32(word: u32) -> Result<Inst, DecodeError> {
    a32::decode(word)
}

/// Decode one compact-mode halfword.
pub fn decode_t16(half: u16) -> Result<Inst, DecodeError> {
    t16::decode(half)
}

/// Mode-dispatched decode of a fetched instruction word.
///
/// For [`IsaMode::T16`] only the low halfword of `word` is consumed.
pub fn decode(mode: IsaMode, word: u32) -> Result<Inst, DecodeError> {
    match mode {
        IsaMode::A64 => decode_a64(word),
        IsaMode::A32 => decode_a32(word),
        IsaMode::T16 => decode_t16(word as u16),
    }
}

/// Byte length of one instruction in the given mode.
pub const fn inst_len(mode: IsaMode) -> u64 {
    match mode {
        IsaMode::A64 | IsaMode::A32 => 4,
        IsaMode::T16 => 2,
    }
}
