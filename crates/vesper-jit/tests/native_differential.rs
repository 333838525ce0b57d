//! Native backend differential tests: the same program run through the
//! compiled path and the interpreter must agree on all architectural state.
#![cfg(all(unix, target_arch = "x86_64"))]

use std::sync::Arc;

use vesper_cpu_core::{CpuState, ExitReason};
use vesper_jit::{TranslationCache, Vcpu};
use vesper_mem::{AddressSpace, Perm};
use vesper_types::{Gpr, IsaMode, Width};

fn run(
    code: &[u32],
    mode: IsaMode,
    native: bool,
    init: impl Fn(&mut CpuState),
) -> (CpuState, ExitReason) {
    let space = Arc::new(AddressSpace::new());
    space.map(0x1000, 0x2000, Perm::RWX).unwrap();
    let step = if mode == IsaMode::T16 { 2 } else { 4 };
    for (i, word) in code.iter().enumerate() {
        let width = if mode == IsaMode::T16 { Width::W16 } else { Width::W32 };
        space
            .write(0x1000 + i as u64 * step, width, *word as u64)
            .unwrap();
    }
    let mut vcpu = Vcpu::new(space, Arc::new(TranslationCache::new()), 0x1000, mode);
    vcpu.native_enabled = native;
    init(vcpu.cpu_mut());
    let exit = vcpu.run();
    (vcpu.cpu().clone(), exit)
}

fn differential(code: &[u32], mode: IsaMode, init: impl Fn(&mut CpuState) + Copy) {
    let (native, exit_n) = run(code, mode, true, init);
    let (interp, exit_i) = run(code, mode, false, init);
    assert_eq!(exit_n, exit_i);
    assert_eq!(native.gpr, interp.gpr);
    assert_eq!(native.sp, interp.sp);
    assert_eq!(native.pc, interp.pc);
    assert_eq!(native.pstate, interp.pstate);
}

#[test]
fn flag_setting_loop() {
    // MOVZ X0, #25
    // loop: SUBS X0, X0, #1 ; B.NE loop
    // SVC #0
    differential(
        &[0xd280_0320, 0xf100_0400, 0x54ff_ffe1, 0xd400_0001],
        IsaMode::A64,
        |_| {},
    );
}

#[test]
fn loads_stores_and_selects() {
    // STR X0, [X1, #8] ; LDR X2, [X1, #8] ; SUBS XZR, X2, X0
    // CSEL X3, X0, X2, EQ ; SVC #0
    differential(
        &[
            0xf900_0420,
            0xf940_0422,
            0xeb00_005f,
            0x9a82_0003,
            0xd400_0001,
        ],
        IsaMode::A64,
        |cpu| {
            cpu.set_x(Gpr::new(0).unwrap(), 0x0123_4567_89ab_cdef);
            cpu.set_x(Gpr::new(1).unwrap(), 0x2100);
        },
    );
}

#[test]
fn wide_moves_and_logic() {
    // MOVZ X0, #0xBEEF, LSL #16 ; MOVK X0, #0xDEAD ; ORR X1, X0, X0, LSL #4
    // ANDS X2, X1, X0 ; SVC #0
    differential(
        &[
            0xd2b7_dde0,
            0xf29b_d5a0,
            0xaa00_1001,
            0xea00_0022,
            0xd400_0001,
        ],
        IsaMode::A64,
        |_| {},
    );
}

#[test]
fn compact_mode_counter() {
    // LDR r0, [r1, #8] ; ADDS r0, #1 ; STR r0, [r1, #8] ; SVC #0
    differential(&[0x6888, 0x3001, 0x6088, 0xdf00], IsaMode::T16, |cpu| {
        cpu.set_x(Gpr::new(1).unwrap(), 0x2000);
    });
}

#[test]
fn faults_agree_between_paths() {
    // LDR X0, [X1] with X1 unmapped.
    let code = [0xf940_0020, 0xd400_0001];
    let init = |cpu: &mut CpuState| cpu.set_x(Gpr::new(1).unwrap(), 0x9_0000);
    let (native, exit_n) = run(&code, IsaMode::A64, true, init);
    let (interp, exit_i) = run(&code, IsaMode::A64, false, init);
    assert_eq!(exit_n, exit_i);
    assert!(matches!(exit_n, ExitReason::MemoryFault { addr: 0x9_0000, .. }));
    // Both stop with pc on the faulting instruction.
    assert_eq!(native.pc, 0x1000);
    assert_eq!(interp.pc, 0x1000);
}
