//! Model-based check of the mapping invariants: after any sequence of
//! map/unmap/reprotect calls, accesses inside mapped, correctly-permissioned
//! ranges succeed and everything else faults — and host memory is never
//! corrupted (the shadow model and the real space agree byte for byte).

use proptest::prelude::*;
use vesper_mem::{AccessKind, AddressSpace, FaultKind, MemoryError, Perm, PAGE_SIZE};
use vesper_types::Width;

const PAGES: u64 = 8;
const BASE: u64 = 0x10_0000;

#[derive(Debug, Clone)]
enum Op {
    Map { page: u64, pages: u64, perm: u8 },
    Unmap { page: u64, pages: u64 },
    Reprotect { page: u64, pages: u64, perm: u8 },
    Write { page: u64, offset: u64, value: u8 },
}

fn perm_from(bits: u8) -> Perm {
    Perm::from_bits_truncate(bits & 0b111)
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..PAGES, 1..=2u64, any::<u8>()).prop_map(|(page, pages, perm)| Op::Map {
            page,
            pages,
            perm
        }),
        (0..PAGES, 1..=2u64).prop_map(|(page, pages)| Op::Unmap { page, pages }),
        (0..PAGES, 1..=2u64, any::<u8>()).prop_map(|(page, pages, perm)| Op::Reprotect {
            page,
            pages,
            perm
        }),
        (0..PAGES, 0..PAGE_SIZE, any::<u8>()).prop_map(|(page, offset, value)| Op::Write {
            page,
            offset,
            value
        }),
    ]
}

/// Shadow model: per-page permission (None = unmapped) and per-byte content.
struct Model {
    perms: Vec<Option<Perm>>,
    bytes: Vec<u8>,
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn space_and_model_agree(ops in proptest::collection::vec(op_strategy(), 1..40)) {
        let space = AddressSpace::new();
        let mut model = Model {
            perms: vec![None; PAGES as usize],
            bytes: vec![0u8; (PAGES * PAGE_SIZE) as usize],
        };

        for op in &ops {
            match *op {
                Op::Map { page, pages, perm } => {
                    let pages = pages.min(PAGES - page);
                    let perm = perm_from(perm);
                    let res = space.map(BASE + page * PAGE_SIZE, pages * PAGE_SIZE, perm);
                    let overlaps = model.perms[page as usize..(page + pages) as usize]
                        .iter()
                        .any(Option::is_some);
                    prop_assert_eq!(res.is_err(), overlaps);
                    if res.is_ok() {
                        for p in page..page + pages {
                            model.perms[p as usize] = Some(perm);
                        }
                        // Fresh zeroed backing.
                        let start = (page * PAGE_SIZE) as usize;
                        let end = ((page + pages) * PAGE_SIZE) as usize;
                        model.bytes[start..end].fill(0);
                    }
                }
                Op::Unmap { page, pages } => {
                    let pages = pages.min(PAGES - page);
                    let res = space.unmap(BASE + page * PAGE_SIZE, pages * PAGE_SIZE);
                    let any_mapped = model.perms[page as usize..(page + pages) as usize]
                        .iter()
                        .any(Option::is_some);
                    prop_assert_eq!(res.is_ok(), any_mapped);
                    if res.is_ok() {
                        for p in page..page + pages {
                            model.perms[p as usize] = None;
                        }
                    }
                }
                Op::Reprotect { page, pages, perm } => {
                    let pages = pages.min(PAGES - page);
                    let perm = perm_from(perm);
                    let res = space.reprotect(BASE + page * PAGE_SIZE, pages * PAGE_SIZE, perm);
                    let fully_mapped = model.perms[page as usize..(page + pages) as usize]
                        .iter()
                        .all(Option::is_some);
                    prop_assert_eq!(res.is_ok(), fully_mapped);
                    if res.is_ok() {
                        for p in page..page + pages {
                            model.perms[p as usize] = Some(perm);
                        }
                    }
                }
                Op::Write { page, offset, value } => {
                    let addr = BASE + page * PAGE_SIZE + offset;
                    let res = space.write(addr, Width::W8, value as u64);
                    match model.perms[page as usize] {
                        Some(p) if p.contains(Perm::W) => {
                            prop_assert!(res.is_ok());
                            model.bytes[(page * PAGE_SIZE + offset) as usize] = value;
                        }
                        Some(_) => prop_assert_eq!(
                            res,
                            Err(MemoryError::permission(addr, AccessKind::Write))
                        ),
                        None => prop_assert_eq!(res, Err(MemoryError::unmapped(addr))),
                    }
                }
            }
        }

        // Every readable byte matches the model; every other byte faults.
        for page in 0..PAGES {
            let addr = BASE + page * PAGE_SIZE;
            match model.perms[page as usize] {
                Some(p) if p.contains(Perm::R) => {
                    let mut buf = vec![0u8; PAGE_SIZE as usize];
                    space.read_bytes(addr, &mut buf).unwrap();
                    let start = (page * PAGE_SIZE) as usize;
                    prop_assert_eq!(&buf[..], &model.bytes[start..start + PAGE_SIZE as usize]);
                }
                Some(_) => {
                    prop_assert!(
                        matches!(
                            space.read(addr, Width::W8),
                            Err(MemoryError::Fault {
                                kind: FaultKind::Permission(AccessKind::Read),
                                ..
                            })
                        ),
                        "expected read permission fault at {:#x}",
                        addr
                    );
                }
                None => {
                    prop_assert_eq!(space.read(addr, Width::W8), Err(MemoryError::unmapped(addr)));
                }
            }
        }
    }
}
