//! Optimized and unoptimized translations of the same program must leave
//! identical architectural state. Both sides run on the interpreter so the
//! comparison isolates the IR passes.

use std::sync::Arc;

use proptest::prelude::*;
use vesper_cpu_core::{CpuState, ExitReason};
use vesper_jit::{OptConfig, TranslationCache, Vcpu};
use vesper_mem::{AddressSpace, Perm};
use vesper_types::{Gpr, IsaMode, Width};

fn run_program(code: &[u32], opt: OptConfig, init: impl Fn(&mut CpuState)) -> CpuState {
    let space = Arc::new(AddressSpace::new());
    space.map(0x1000, 0x2000, Perm::RWX).unwrap();
    for (i, word) in code.iter().enumerate() {
        space
            .write(0x1000 + i as u64 * 4, Width::W32, *word as u64)
            .unwrap();
    }
    let mut vcpu = Vcpu::new(space, Arc::new(TranslationCache::new()), 0x1000, IsaMode::A64);
    vcpu.native_enabled = false;
    vcpu.opt = opt;
    init(vcpu.cpu_mut());
    assert_eq!(vcpu.run(), ExitReason::SystemCall { imm: 0 });
    vcpu.cpu().clone()
}

fn assert_equivalent(code: &[u32], init: impl Fn(&mut CpuState) + Copy) {
    let optimized = run_program(code, OptConfig::default(), init);
    let plain = run_program(code, OptConfig::none(), init);
    assert_eq!(optimized.gpr, plain.gpr);
    assert_eq!(optimized.sp, plain.sp);
    assert_eq!(optimized.pc, plain.pc);
    assert_eq!(optimized.pstate, plain.pstate);
}

#[test]
fn countdown_loop_with_flags() {
    // MOVZ X0, #10
    // loop: SUBS X0, X0, #1 ; B.NE loop
    // SVC #0
    assert_equivalent(
        &[0xd280_0140, 0xf100_0400, 0x54ff_ffe1, 0xd400_0001],
        |_| {},
    );
}

#[test]
fn memory_round_trip_survives_optimization() {
    // STR X0, [X1, #16] ; LDR X2, [X1, #16] ; ADDS X3, X2, #0 ; SVC #0
    assert_equivalent(
        &[0xf900_0820, 0xf940_0822, 0xb100_0043, 0xd400_0001],
        |cpu| {
            cpu.set_x(Gpr::new(0).unwrap(), 0xdead_beef_0bad_cafe);
            cpu.set_x(Gpr::new(1).unwrap(), 0x2000);
        },
    );
}

#[test]
fn constant_chain_folds_to_same_state() {
    // MOVZ X0, #6 ; MOVZ X1, #7 ; MUL X2, X0, X1 ; ADDS X3, X2, #58 ; SVC #0
    assert_equivalent(
        &[0xd280_00c0, 0xd280_00e1, 0x9b01_7c02, 0xb100_e843, 0xd400_0001],
        |_| {},
    );
}

#[test]
fn conditional_select_depends_on_live_flags() {
    // SUBS XZR, X0, X1 ; CSEL X2, X0, X1, HI ; SVC #0
    let code = [0xeb01_001f, 0x9a81_8002, 0xd400_0001];
    assert_equivalent(&code, |cpu| {
        cpu.set_x(Gpr::new(0).unwrap(), 5);
        cpu.set_x(Gpr::new(1).unwrap(), 9);
    });
    assert_equivalent(&code, |cpu| {
        cpu.set_x(Gpr::new(0).unwrap(), 9);
        cpu.set_x(Gpr::new(1).unwrap(), 5);
    });
}

proptest! {
    /// ADDS/SUBS immediate over arbitrary inputs: the dead-flag and
    /// constant-fold passes must never change results or NZCV.
    #[test]
    fn add_sub_immediate_equivalence(
        lhs in any::<u64>(),
        imm in 0u32..4096,
        sub in any::<bool>(),
    ) {
        let op = if sub { 0xf100_0000u32 } else { 0xb100_0000 };
        // op X2, X0, #imm ; SVC #0
        let code = [op | (imm << 10) | (0 << 5) | 2, 0xd400_0001];
        let init = move |cpu: &mut CpuState| cpu.set_x(Gpr::new(0).unwrap(), lhs);
        let optimized = run_program(&code, OptConfig::default(), init);
        let plain = run_program(&code, OptConfig::none(), init);
        prop_assert_eq!(optimized.gpr, plain.gpr);
        prop_assert_eq!(optimized.pstate, plain.pstate);
    }
}
