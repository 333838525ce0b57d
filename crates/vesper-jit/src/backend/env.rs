//! Execution environment shared between emitted code and its helpers.
//!
//! Emitted code receives a [`JitEnv`] pointer in its first argument and
//! keeps it in a callee-saved register for the whole block. The leading
//! fields are addressed by constant offset from that pointer (asserted by
//! the layout tests below); the trailing fields are Rust-only state the
//! helpers use.
//!
//! Memory helpers keep a one-region fast window: a raw host pointer into
//! the backing of the last region hit, valid while the mapping generation
//! holds and kept alive by an `Arc` to the backing so a racing unmap can at
//! worst serve stale-but-mapped bytes, never freed ones. Only plain
//! read-write data regions are cached; anything executable always takes the
//! checked slow path so stores into code pages bump their page versions.

use std::sync::Arc;

use vesper_cpu_core::{CpuState, PendingException};
use vesper_mem::{AddressSpace, Backing, MemoryError, Perm, RegionInfo};
use vesper_types::{Cond, Flag, FlagSet, Width};

use crate::interp::add_with_carry;

/// Cached direct-access window into one mapped region. Persisted across
/// blocks by the dispatcher.
pub struct FastWindow {
    pub base: u64,
    pub len: u64,
    pub host: *mut u8,
    pub gen: u64,
    /// Keeps the region's storage alive independently of the range table.
    pub backing: Arc<Backing>,
}

// The raw pointer is only dereferenced while `backing` is held.
unsafe impl Send for FastWindow {}

/// `#[repr(C)]` block execution state. Field order is ABI: emitted code
/// addresses the leading fields by the `*_OFFSET` constants.
#[repr(C)]
pub struct JitEnv<'a> {
    pub cpu: *mut CpuState,
    /// Cleared by a helper that faulted; emitted code tests it after every
    /// memory helper call.
    pub helper_ok: u64,
    /// Guest pc of the faulting instruction, set together with `helper_ok`.
    pub fault_pc: u64,
    /// 0 = jump, 1 = exchange, 2 = trap/fault pending on the context.
    pub exit_kind: u64,
    // Rust-only state below; not addressed by emitted code.
    pub space: &'a AddressSpace,
    pub window: Option<FastWindow>,
}

pub const ENV_HELPER_OK_OFFSET: usize = 8;
pub const ENV_FAULT_PC_OFFSET: usize = 16;
pub const ENV_EXIT_KIND_OFFSET: usize = 24;

pub const EXIT_JUMP: u64 = 0;
pub const EXIT_EXCHANGE: u64 = 1;
pub const EXIT_TRAP: u64 = 2;

impl<'a> JitEnv<'a> {
    pub fn new(cpu: &'a mut CpuState, space: &'a AddressSpace, window: Option<FastWindow>) -> Self {
        JitEnv {
            cpu,
            helper_ok: 1,
            fault_pc: 0,
            exit_kind: EXIT_JUMP,
            space,
            window,
        }
    }
}

fn width_from_log2(size_log2: u64) -> Width {
    match size_log2 {
        0 => Width::W8,
        1 => Width::W16,
        2 => Width::W32,
        _ => Width::W64,
    }
}

/// Whether a region qualifies for the fast window: plain data, never code,
/// and alignment checking off (the window does raw unaligned access).
fn window_candidate(space: &AddressSpace, info: &RegionInfo) -> bool {
    info.perm.contains(Perm::R | Perm::W) && !info.perm.contains(Perm::X) && !space.strict_align()
}

fn window_hit(env: &JitEnv<'_>, addr: u64, bytes: u64) -> Option<*mut u8> {
    let w = env.window.as_ref()?;
    if w.gen != env.space.mapping_generation() {
        return None;
    }
    if addr < w.base || addr.checked_add(bytes)? > w.base + w.len {
        return None;
    }
    // SAFETY bound: offset stays inside the region checked above.
    Some(unsafe { w.host.add((addr - w.base) as usize) })
}

fn refill_window(env: &mut JitEnv<'_>, addr: u64) {
    let gen = env.space.mapping_generation();
    let Some((info, backing)) = env.space.region_view(addr) else {
        return;
    };
    if !window_candidate(env.space, &info) {
        return;
    }
    env.window = Some(FastWindow {
        base: info.base,
        len: info.len,
        host: info.host_base,
        gen,
        backing,
    });
}

fn record_fault(env: &mut JitEnv<'_>, pc: u64, error: MemoryError) {
    let MemoryError::Fault { addr, kind } = error;
    // SAFETY: `cpu` outlives the env (constructed from a live borrow).
    unsafe {
        (*env.cpu).set_pending(PendingException::MemoryFault { addr, kind });
    }
    env.helper_ok = 0;
    env.fault_pc = pc;
}

/// Memory load helper. `pred` of zero suppresses the access and yields 0.
///
/// # Safety
/// `env` must point to a live [`JitEnv`]; called only from emitted code.
pub unsafe extern "C" fn vesper_jit_load(
    env: *mut JitEnv<'_>,
    addr: u64,
    size_log2: u64,
    pred: u64,
    pc: u64,
) -> u64 {
    let env = &mut *env;
    if pred == 0 {
        return 0;
    }
    let width = width_from_log2(size_log2);
    if let Some(host) = window_hit(env, addr, width.bytes()) {
        return match width {
            Width::W8 => *host as u64,
            Width::W16 => (host as *const u16).read_unaligned() as u64,
            Width::W32 => (host as *const u32).read_unaligned() as u64,
            Width::W64 => (host as *const u64).read_unaligned(),
        };
    }
    match env.space.read(addr, width) {
        Ok(v) => {
            refill_window(env, addr);
            v
        }
        Err(e) => {
            record_fault(env, pc, e);
            0
        }
    }
}

/// Memory store helper. `pred` of zero suppresses the access.
///
/// # Safety
/// `env` must point to a live [`JitEnv`]; called only from emitted code.
pub unsafe extern "C" fn vesper_jit_store(
    env: *mut JitEnv<'_>,
    addr: u64,
    value: u64,
    size_log2: u64,
    pred: u64,
    pc: u64,
) {
    let env = &mut *env;
    if pred == 0 {
        return;
    }
    let width = width_from_log2(size_log2);
    if let Some(host) = window_hit(env, addr, width.bytes()) {
        match width {
            Width::W8 => *host = value as u8,
            Width::W16 => (host as *mut u16).write_unaligned(value as u16),
            Width::W32 => (host as *mut u32).write_unaligned(value as u32),
            Width::W64 => (host as *mut u64).write_unaligned(value),
        }
        return;
    }
    match env.space.write(addr, width, value) {
        Ok(()) => refill_window(env, addr),
        Err(e) => record_fault(env, pc, e),
    }
}

// Control word shared by the flag helpers.
pub const ADC_CARRY_ZERO: u64 = 0;
pub const ADC_CARRY_ONE: u64 = 1;
pub const ADC_CARRY_FLAG: u64 = 2;
pub const FLAGS_MASK_SHIFT: u64 = 4;
pub const FLAGS_WIDTH64: u64 = 1 << 8;
pub const FLAGS_HAS_PRED: u64 = 1 << 9;

fn unpack_flags(ctrl: u64) -> (FlagSet, Width) {
    let mask = FlagSet::from_bits_truncate(((ctrl >> FLAGS_MASK_SHIFT) & 0xf) as u8);
    let width = if ctrl & FLAGS_WIDTH64 != 0 {
        Width::W64
    } else {
        Width::W32
    };
    (mask, width)
}

fn pred_allows(ctrl: u64, pred: u64) -> bool {
    ctrl & FLAGS_HAS_PRED == 0 || pred != 0
}

fn set_nzcv(cpu: &mut CpuState, mask: FlagSet, width: Width, res: u64, c: bool, v: bool) {
    if mask.contains(FlagSet::N) {
        cpu.set_flag(Flag::N, res >> (width.bits() - 1) & 1 != 0);
    }
    if mask.contains(FlagSet::Z) {
        cpu.set_flag(Flag::Z, res == 0);
    }
    if mask.contains(FlagSet::C) {
        cpu.set_flag(Flag::C, c);
    }
    if mask.contains(FlagSet::V) {
        cpu.set_flag(Flag::V, v);
    }
}

/// Full-adder helper: result in the return value, flags written per `ctrl`.
///
/// # Safety
/// `env` must point to a live [`JitEnv`]; called only from emitted code.
pub unsafe extern "C" fn vesper_jit_adc(
    env: *mut JitEnv<'_>,
    lhs: u64,
    rhs: u64,
    ctrl: u64,
    pred: u64,
) -> u64 {
    let env = &mut *env;
    let cpu = &mut *env.cpu;
    let (mask, width) = unpack_flags(ctrl);
    let carry = match ctrl & 0x3 {
        ADC_CARRY_ZERO => false,
        ADC_CARRY_ONE => true,
        _ => cpu.flag(Flag::C),
    };
    let (res, c, v) = add_with_carry(width, lhs, rhs, carry);
    if !mask.is_empty() && pred_allows(ctrl, pred) {
        set_nzcv(cpu, mask, width, res, c, v);
    }
    res
}

/// N/Z-from-value helper (logical flag rule; C/V cleared when masked in).
///
/// # Safety
/// `env` must point to a live [`JitEnv`]; called only from emitted code.
pub unsafe extern "C" fn vesper_jit_setnz(env: *mut JitEnv<'_>, value: u64, ctrl: u64, pred: u64) {
    let env = &mut *env;
    let cpu = &mut *env.cpu;
    let (mask, width) = unpack_flags(ctrl);
    if pred_allows(ctrl, pred) {
        set_nzcv(cpu, mask, width, value & width.mask(), false, false);
    }
}

/// Single-flag write helper. `flag_bits` is the [`FlagSet`] bit of the flag.
///
/// # Safety
/// `env` must point to a live [`JitEnv`]; called only from emitted code.
pub unsafe extern "C" fn vesper_jit_write_flag(
    env: *mut JitEnv<'_>,
    flag_bits: u64,
    value: u64,
    ctrl: u64,
    pred: u64,
) {
    let env = &mut *env;
    let cpu = &mut *env.cpu;
    if !pred_allows(ctrl, pred) {
        return;
    }
    let flag = match flag_bits as u8 {
        b if b == FlagSet::N.bits() => Flag::N,
        b if b == FlagSet::Z.bits() => Flag::Z,
        b if b == FlagSet::C.bits() => Flag::C,
        _ => Flag::V,
    };
    cpu.set_flag(flag, value != 0);
}

/// Condition-code evaluation helper: 1 when the condition holds.
///
/// # Safety
/// `env` must point to a live [`JitEnv`]; called only from emitted code.
pub unsafe extern "C" fn vesper_jit_cond(env: *mut JitEnv<'_>, cond_bits: u64) -> u64 {
    let env = &mut *env;
    let cpu = &*env.cpu;
    Cond::from_bits(cond_bits as u32).eval(
        cpu.flag(Flag::N),
        cpu.flag(Flag::Z),
        cpu.flag(Flag::C),
        cpu.flag(Flag::V),
    ) as u64
}

// Trap tags passed to `vesper_jit_raise`.
pub const RAISE_SYSCALL: u64 = 0;
pub const RAISE_BREAKPOINT: u64 = 1;
pub const RAISE_UNDEFINED: u64 = 2;

/// Record a trap on the context; emitted code then exits with
/// [`EXIT_TRAP`].
///
/// # Safety
/// `env` must point to a live [`JitEnv`]; called only from emitted code.
pub unsafe extern "C" fn vesper_jit_raise(env: *mut JitEnv<'_>, tag: u64, arg: u64) {
    let env = &mut *env;
    let cpu = &mut *env.cpu;
    let pending = match tag {
        RAISE_SYSCALL => PendingException::Syscall { imm: arg as u32 },
        RAISE_BREAKPOINT => PendingException::Breakpoint { imm: arg as u16 },
        _ => PendingException::Undefined { pc: arg },
    };
    cpu.set_pending(pending);
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoffset::offset_of;
    use vesper_types::IsaMode;

    #[test]
    fn env_layout_matches_emitted_offsets() {
        assert_eq!(offset_of!(JitEnv<'static>, cpu), 0);
        assert_eq!(offset_of!(JitEnv<'static>, helper_ok), ENV_HELPER_OK_OFFSET);
        assert_eq!(offset_of!(JitEnv<'static>, fault_pc), ENV_FAULT_PC_OFFSET);
        assert_eq!(offset_of!(JitEnv<'static>, exit_kind), ENV_EXIT_KIND_OFFSET);
    }

    #[test]
    fn load_faults_record_pending_and_clear_ok() {
        let space = AddressSpace::new();
        let mut cpu = CpuState::new(0, IsaMode::A64);
        let mut env = JitEnv::new(&mut cpu, &space, None);
        let v = unsafe { vesper_jit_load(&mut env, 0x8000, 3, 1, 0x1234) };
        assert_eq!(v, 0);
        assert_eq!(env.helper_ok, 0);
        assert_eq!(env.fault_pc, 0x1234);
        assert!(matches!(
            cpu.pending(),
            Some(PendingException::MemoryFault { addr: 0x8000, .. })
        ));
    }

    #[test]
    fn store_through_window_lands_in_backing() {
        let space = AddressSpace::new();
        space.map(0x1000, 0x1000, Perm::RW).unwrap();
        let mut cpu = CpuState::new(0, IsaMode::A64);
        let mut env = JitEnv::new(&mut cpu, &space, None);
        unsafe {
            // First store misses and fills the window.
            vesper_jit_store(&mut env, 0x1000, 0x11, 3, 1, 0);
            assert!(env.window.is_some());
            // Second store takes the window path.
            vesper_jit_store(&mut env, 0x1008, 0x22, 3, 1, 0);
        }
        assert_eq!(space.read(0x1000, Width::W64).unwrap(), 0x11);
        assert_eq!(space.read(0x1008, Width::W64).unwrap(), 0x22);
    }

    #[test]
    fn executable_regions_never_enter_the_window() {
        let space = AddressSpace::new();
        space.map(0x1000, 0x1000, Perm::RWX).unwrap();
        let mut cpu = CpuState::new(0, IsaMode::A64);
        let mut env = JitEnv::new(&mut cpu, &space, None);
        unsafe {
            vesper_jit_store(&mut env, 0x1000, 0x33, 3, 1, 0);
        }
        assert!(env.window.is_none());
        // Slow path bumped the page's code version.
        assert!(space.code_versions().version(0x1000 >> 12) > 0);
    }

    #[test]
    fn remap_invalidates_the_window() {
        let space = AddressSpace::new();
        space.map(0x1000, 0x1000, Perm::RW).unwrap();
        let mut cpu = CpuState::new(0, IsaMode::A64);
        let mut env = JitEnv::new(&mut cpu, &space, None);
        unsafe {
            vesper_jit_store(&mut env, 0x1000, 0x44, 3, 1, 0);
        }
        assert!(env.window.is_some());
        space.unmap(0x1000, 0x1000).unwrap();
        assert!(window_hit(&env, 0x1000, 8).is_none());
    }

    #[test]
    fn predicate_zero_suppresses_access() {
        let space = AddressSpace::new();
        let mut cpu = CpuState::new(0, IsaMode::A64);
        let mut env = JitEnv::new(&mut cpu, &space, None);
        // Unmapped address, but suppressed: no fault.
        let v = unsafe { vesper_jit_load(&mut env, 0x8000, 3, 0, 0) };
        assert_eq!(v, 0);
        assert_eq!(env.helper_ok, 1);
    }

    #[test]
    fn adc_helper_writes_masked_flags() {
        let space = AddressSpace::new();
        let mut cpu = CpuState::new(0, IsaMode::A64);
        let mut env = JitEnv::new(&mut cpu, &space, None);
        let ctrl =
            ADC_CARRY_ONE | ((FlagSet::NZCV.bits() as u64) << FLAGS_MASK_SHIFT) | FLAGS_WIDTH64;
        // 5 - 5 via complement: result 0, Z and C set.
        let res = unsafe { vesper_jit_adc(&mut env, 5, !5u64, ctrl, 0) };
        assert_eq!(res, 0);
        assert!(cpu.flag(Flag::Z));
        assert!(cpu.flag(Flag::C));
        assert!(!cpu.flag(Flag::N));
    }
}
