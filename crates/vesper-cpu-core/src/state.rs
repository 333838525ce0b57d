//! Per-guest-thread execution context.
//!
//! `CpuState` has a fixed `#[repr(C)]` layout with documented byte offsets:
//! emitted code addresses fields by constant offset from the context
//! pointer, and register allocation spills live values into the dedicated
//! spill area rather than arbitrary host stack slots, so the architectural
//! state is always readable at any suspension point (helper call, fault,
//! stop request). All integer fields are host-endian u64.

use vesper_mem::{AccessKind, FaultKind};
use vesper_types::{Flag, Gpr, IsaMode, Vreg};

/// NZCV bit positions inside `pstate` (architectural placement).
pub const PSTATE_N: u64 = 1 << 31;
pub const PSTATE_Z: u64 = 1 << 30;
pub const PSTATE_C: u64 = 1 << 29;
pub const PSTATE_V: u64 = 1 << 28;

/// Number of emitted-code spill slots in the context.
pub const SPILL_SLOTS: usize = 16;

/// Trap condition recorded by translated code or helper calls.
///
/// Stored in the context's pending-exception slot and drained by the
/// dispatcher at the next block boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingException {
    /// Explicit system-call instruction. The immediate is 16 bits in the
    /// primary instruction set and 24 bits in the legacy one.
    Syscall { imm: u32 },
    /// Explicit breakpoint instruction.
    Breakpoint { imm: u16 },
    /// Unallocated or reserved encoding reached the program counter.
    Undefined { pc: u64 },
    /// Data abort or fetch fault from the address-space manager.
    MemoryFault { addr: u64, kind: FaultKind },
}

/// Why `run` returned to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    SystemCall { imm: u32 },
    Breakpoint { imm: u16 },
    UndefinedInstruction { pc: u64 },
    MemoryFault { addr: u64, kind: FaultKind },
    /// External stop request drained at a block boundary.
    Stopped,
}

impl From<PendingException> for ExitReason {
    fn from(pending: PendingException) -> Self {
        match pending {
            PendingException::Syscall { imm } => ExitReason::SystemCall { imm },
            PendingException::Breakpoint { imm } => ExitReason::Breakpoint { imm },
            PendingException::Undefined { pc } => ExitReason::UndefinedInstruction { pc },
            PendingException::MemoryFault { addr, kind } => ExitReason::MemoryFault { addr, kind },
        }
    }
}

// Packed pending-exception encoding shared with emitted code: slow-path
// helpers write `pending_kind`/`pending_a`/`pending_b` directly.
const PENDING_NONE: u64 = 0;
const PENDING_SYSCALL: u64 = 1;
const PENDING_BREAKPOINT: u64 = 2;
const PENDING_UNDEFINED: u64 = 3;
const PENDING_MEM_FAULT: u64 = 4;

/// Complete architectural state of one guest thread.
///
/// Owned by the host thread running it; never shared, never locked.
#[derive(Clone)]
#[repr(C)]
pub struct CpuState {
    /// General-purpose registers x0..x30 (w-views alias the low halves).
    pub gpr: [u64; Gpr::COUNT],
    pub sp: u64,
    pub pc: u64,
    /// NZCV in the architectural bit positions; other bits reserved-zero.
    pub pstate: u64,
    pub fpcr: u64,
    pub fpsr: u64,
    /// Vector registers as lo/hi u64 pairs: `v[2*i]` is the low half of
    /// register i.
    pub vreg: [u64; Vreg::COUNT * 2],
    /// Spill slots for the JIT register allocator.
    pub spill: [u64; SPILL_SLOTS],
    pending_kind: u64,
    pending_a: u64,
    pending_b: u64,
    /// Active instruction-set mode (not addressable by emitted code).
    pub isa_mode: IsaMode,
}

impl CpuState {
    pub const GPR_OFFSET: usize = 0;
    pub const SP_OFFSET: usize = Gpr::COUNT * 8;
    pub const PC_OFFSET: usize = Self::SP_OFFSET + 8;
    pub const PSTATE_OFFSET: usize = Self::PC_OFFSET + 8;
    pub const FPCR_OFFSET: usize = Self::PSTATE_OFFSET + 8;
    pub const FPSR_OFFSET: usize = Self::FPCR_OFFSET + 8;
    pub const VREG_OFFSET: usize = Self::FPSR_OFFSET + 8;
    pub const SPILL_OFFSET: usize = Self::VREG_OFFSET + Vreg::COUNT * 16;

    pub fn new(entry: u64, mode: IsaMode) -> Self {
        CpuState {
            gpr: [0; Gpr::COUNT],
            sp: 0,
            pc: entry,
            pstate: 0,
            fpcr: 0,
            fpsr: 0,
            vreg: [0; Vreg::COUNT * 2],
            spill: [0; SPILL_SLOTS],
            pending_kind: PENDING_NONE,
            pending_a: 0,
            pending_b: 0,
            isa_mode: mode,
        }
    }

    // --- register accessors (used by the OS-service layer for syscall
    // argument/result passing and by debug front-ends) -------------------

    #[inline]
    pub fn x(&self, reg: Gpr) -> u64 {
        self.gpr[reg.index()]
    }

    #[inline]
    pub fn set_x(&mut self, reg: Gpr, value: u64) {
        self.gpr[reg.index()] = value;
    }

    /// 32-bit view; reads the low half.
    #[inline]
    pub fn w(&self, reg: Gpr) -> u32 {
        self.gpr[reg.index()] as u32
    }

    /// 32-bit write: zero-extends into the full register, matching the
    /// architectural rule for 32-bit destination writes.
    #[inline]
    pub fn set_w(&mut self, reg: Gpr, value: u32) {
        self.gpr[reg.index()] = value as u64;
    }

    #[inline]
    pub fn v(&self, reg: Vreg) -> u128 {
        let lo = self.vreg[reg.index() * 2] as u128;
        let hi = self.vreg[reg.index() * 2 + 1] as u128;
        lo | (hi << 64)
    }

    #[inline]
    pub fn set_v(&mut self, reg: Vreg, value: u128) {
        self.vreg[reg.index() * 2] = value as u64;
        self.vreg[reg.index() * 2 + 1] = (value >> 64) as u64;
    }

    #[inline]
    pub fn flag(&self, flag: Flag) -> bool {
        self.pstate & flag_mask(flag) != 0
    }

    #[inline]
    pub fn set_flag(&mut self, flag: Flag, value: bool) {
        let mask = flag_mask(flag);
        if value {
            self.pstate |= mask;
        } else {
            self.pstate &= !mask;
        }
    }

    /// NZCV packed into the low 4 bits (N=8, Z=4, C=2, V=1), the order the
    /// conditional-compare immediate uses.
    pub fn nzcv(&self) -> u8 {
        ((self.pstate >> 28) & 0xf) as u8
    }

    pub fn set_nzcv(&mut self, nzcv: u8) {
        self.set_flag(Flag::N, nzcv & 0b1000 != 0);
        self.set_flag(Flag::Z, nzcv & 0b0100 != 0);
        self.set_flag(Flag::C, nzcv & 0b0010 != 0);
        self.set_flag(Flag::V, nzcv & 0b0001 != 0);
    }

    // --- pending exception ------------------------------------------------

    #[inline]
    pub fn pending(&self) -> Option<PendingException> {
        match self.pending_kind {
            PENDING_NONE => None,
            PENDING_SYSCALL => Some(PendingException::Syscall {
                imm: self.pending_a as u32,
            }),
            PENDING_BREAKPOINT => Some(PendingException::Breakpoint {
                imm: self.pending_a as u16,
            }),
            PENDING_UNDEFINED => Some(PendingException::Undefined { pc: self.pending_a }),
            PENDING_MEM_FAULT => Some(PendingException::MemoryFault {
                addr: self.pending_a,
                kind: unpack_fault_kind(self.pending_b),
            }),
            other => unreachable!("corrupt pending-exception kind {other}"),
        }
    }

    #[inline]
    pub fn set_pending(&mut self, pending: PendingException) {
        match pending {
            PendingException::Syscall { imm } => {
                self.pending_kind = PENDING_SYSCALL;
                self.pending_a = imm as u64;
            }
            PendingException::Breakpoint { imm } => {
                self.pending_kind = PENDING_BREAKPOINT;
                self.pending_a = imm as u64;
            }
            PendingException::Undefined { pc } => {
                self.pending_kind = PENDING_UNDEFINED;
                self.pending_a = pc;
            }
            PendingException::MemoryFault { addr, kind } => {
                self.pending_kind = PENDING_MEM_FAULT;
                self.pending_a = addr;
                self.pending_b = pack_fault_kind(kind);
            }
        }
    }

    /// Consume the pending exception, leaving the slot clear.
    #[inline]
    pub fn take_pending(&mut self) -> Option<PendingException> {
        let pending = self.pending();
        self.pending_kind = PENDING_NONE;
        pending
    }
}

#[inline]
fn flag_mask(flag: Flag) -> u64 {
    match flag {
        Flag::N => PSTATE_N,
        Flag::Z => PSTATE_Z,
        Flag::C => PSTATE_C,
        Flag::V => PSTATE_V,
    }
}

fn pack_fault_kind(kind: FaultKind) -> u64 {
    match kind {
        FaultKind::Unmapped => 0,
        FaultKind::Permission(a) => 0x10 | pack_access(a),
        FaultKind::Misaligned(a) => 0x20 | pack_access(a),
    }
}

fn unpack_fault_kind(packed: u64) -> FaultKind {
    let access = unpack_access(packed & 0xf);
    match packed & 0xf0 {
        0x00 => FaultKind::Unmapped,
        0x10 => FaultKind::Permission(access),
        0x20 => FaultKind::Misaligned(access),
        other => unreachable!("corrupt packed fault kind {other:#x}"),
    }
}

fn pack_access(access: AccessKind) -> u64 {
    match access {
        AccessKind::Read => 0,
        AccessKind::Write => 1,
        AccessKind::Execute => 2,
    }
}

fn unpack_access(packed: u64) -> AccessKind {
    match packed {
        0 => AccessKind::Read,
        1 => AccessKind::Write,
        _ => AccessKind::Execute,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesper_types::Gpr;

    #[test]
    fn w_writes_zero_extend() {
        let mut cpu = CpuState::new(0, IsaMode::A64);
        let r = Gpr::new(5).unwrap();
        cpu.set_x(r, u64::MAX);
        cpu.set_w(r, 0x1234_5678);
        assert_eq!(cpu.x(r), 0x1234_5678);
    }

    #[test]
    fn vector_registers_round_trip() {
        let mut cpu = CpuState::new(0, IsaMode::A64);
        let v = Vreg::from_bits(7);
        cpu.set_v(v, 0x0123_4567_89ab_cdef_fedc_ba98_7654_3210);
        assert_eq!(cpu.v(v), 0x0123_4567_89ab_cdef_fedc_ba98_7654_3210);
        assert_eq!(cpu.vreg[14], 0xfedc_ba98_7654_3210);
        assert_eq!(cpu.vreg[15], 0x0123_4567_89ab_cdef);
    }

    #[test]
    fn nzcv_round_trip() {
        let mut cpu = CpuState::new(0, IsaMode::A64);
        cpu.set_nzcv(0b1010);
        assert!(cpu.flag(Flag::N));
        assert!(!cpu.flag(Flag::Z));
        assert!(cpu.flag(Flag::C));
        assert!(!cpu.flag(Flag::V));
        assert_eq!(cpu.nzcv(), 0b1010);
    }

    #[test]
    fn pending_exception_round_trip() {
        let mut cpu = CpuState::new(0, IsaMode::A64);
        assert_eq!(cpu.pending(), None);
        cpu.set_pending(PendingException::MemoryFault {
            addr: 0x4000,
            kind: FaultKind::Permission(AccessKind::Write),
        });
        assert_eq!(
            cpu.take_pending(),
            Some(PendingException::MemoryFault {
                addr: 0x4000,
                kind: FaultKind::Permission(AccessKind::Write),
            })
        );
        assert_eq!(cpu.pending(), None);
    }
}
