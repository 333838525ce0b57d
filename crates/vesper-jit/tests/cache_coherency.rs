//! Self-modifying and self-adjacent code scenarios against the shared
//! translation cache.

use std::sync::Arc;

use vesper_cpu_core::ExitReason;
use vesper_jit::{TranslationCache, Vcpu};
use vesper_mem::{AddressSpace, Perm};
use vesper_types::{Gpr, IsaMode, Width};

fn setup(mode: IsaMode) -> (Arc<AddressSpace>, Arc<TranslationCache>, Vcpu) {
    let space = Arc::new(AddressSpace::new());
    space.map(0x1000, 0x1000, Perm::RWX).unwrap();
    let cache = Arc::new(TranslationCache::new());
    let vcpu = Vcpu::new(Arc::clone(&space), Arc::clone(&cache), 0x1000, mode);
    (space, cache, vcpu)
}

/// A compact-mode counter that keeps its data word on the same page as its
/// code. Every run stores next to the code, which bumps the page version,
/// but the translation must survive by hash revalidation: one translation,
/// observed counter values 1 then 2.
#[test]
fn data_write_beside_code_does_not_retranslate() {
    let (space, cache, mut vcpu) = setup(IsaMode::T16);
    // LDR r0, [r1, #8] ; ADDS r0, #1 ; STR r0, [r1, #8] ; SVC #0
    for (i, half) in [0x6888u16, 0x3001, 0x6088, 0xdf00].iter().enumerate() {
        space
            .write(0x1000 + i as u64 * 2, Width::W16, *half as u64)
            .unwrap();
    }
    let r0 = Gpr::new(0).unwrap();
    let r1 = Gpr::new(1).unwrap();
    vcpu.cpu_mut().set_x(r1, 0x1000);

    assert_eq!(vcpu.run(), ExitReason::SystemCall { imm: 0 });
    assert_eq!(vcpu.cpu().x(r0), 1);
    assert_eq!(space.read(0x1008, Width::W32).unwrap(), 1);

    vcpu.cpu_mut().pc = 0x1000;
    assert_eq!(vcpu.run(), ExitReason::SystemCall { imm: 0 });
    assert_eq!(vcpu.cpu().x(r0), 2);

    assert_eq!(cache.translations(), 1);
}

/// Overwriting translated code must retire the old translation and execute
/// the new semantics on the next entry.
#[test]
fn overwritten_code_executes_new_semantics() {
    let (space, cache, mut vcpu) = setup(IsaMode::A64);
    // MOVZ X0, #1 ; SVC #0
    space.write(0x1000, Width::W32, 0xd280_0020).unwrap();
    space.write(0x1004, Width::W32, 0xd400_0001).unwrap();
    let x0 = Gpr::new(0).unwrap();

    assert_eq!(vcpu.run(), ExitReason::SystemCall { imm: 0 });
    assert_eq!(vcpu.cpu().x(x0), 1);

    // MOVZ X0, #2
    space.write(0x1000, Width::W32, 0xd280_0040).unwrap();
    vcpu.cpu_mut().pc = 0x1000;
    assert_eq!(vcpu.run(), ExitReason::SystemCall { imm: 0 });
    assert_eq!(vcpu.cpu().x(x0), 2);

    assert_eq!(cache.translations(), 2);
}

/// Unmapping the code region retires its translations; remapping with new
/// code translates afresh.
#[test]
fn remap_retires_old_translations() {
    let (space, cache, mut vcpu) = setup(IsaMode::A64);
    space.write(0x1000, Width::W32, 0xd280_0020).unwrap();
    space.write(0x1004, Width::W32, 0xd400_0001).unwrap();
    assert_eq!(vcpu.run(), ExitReason::SystemCall { imm: 0 });
    assert_eq!(cache.translations(), 1);

    space.unmap(0x1000, 0x1000).unwrap();
    space.map(0x1000, 0x1000, Perm::RWX).unwrap();
    space.write(0x1000, Width::W32, 0xd280_0060).unwrap();
    space.write(0x1004, Width::W32, 0xd400_0001).unwrap();

    vcpu.cpu_mut().pc = 0x1000;
    assert_eq!(vcpu.run(), ExitReason::SystemCall { imm: 0 });
    assert_eq!(vcpu.cpu().x(Gpr::new(0).unwrap()), 3);
    assert_eq!(cache.translations(), 2);
}
