//! Typed store/load inverse over every width and signedness, on cached
//! and uncached normal pages.

mod helpers;

use ember_cpu::truncate;
use ember_mmu::{MemType, PageAttrs, PagePerms};
use helpers::{fixture, map_identity, PAGE_SIZE};

#[test]
fn store_then_load_returns_the_truncated_value_cached() {
    let mut f = fixture();
    let va = map_identity(&mut f, 0x10, MemType::Normal);

    let patterns = [0u64, 0x80, 0xDEAD_BEEF, 0xFFFF_FFFF_FFFF_FFFF, 0x0123_4567_89AB_CDEF];
    let mut offset = 0u64;
    for size in [1usize, 2, 4, 8] {
        for signed in [false, true] {
            for value in patterns {
                let addr = va + offset;
                f.cpu.store(addr, size, value).unwrap();
                let got = f.cpu.load(addr, size, signed).unwrap();
                assert_eq!(
                    got,
                    truncate(value, size, signed),
                    "size {size} signed {signed} value {value:#x}"
                );
                offset += size as u64;
            }
        }
    }
}

#[test]
fn store_then_load_round_trips_uncached_too() {
    let mut f = fixture();
    f.cpu
        .map_page(
            0x20,
            Some(0x20),
            PageAttrs {
                perms: PagePerms::WRITE,
                memtype: MemType::Normal,
                cached: Some(false),
            },
            None,
        )
        .unwrap();
    let va = 0x20 * PAGE_SIZE;

    f.cpu.store(va, 4, 0xCAFE_F00D).unwrap();
    assert_eq!(f.cpu.load(va, 4, false).unwrap(), 0xCAFE_F00D);
    // Uncached stores are immediately visible in DRAM, little-endian.
    assert_eq!(
        f.dram.borrow_mut().read_bytes(va, 4).unwrap(),
        vec![0x0D, 0xF0, 0xFE, 0xCA]
    );
}

#[test]
fn loads_respect_signedness_across_the_bus_and_cache() {
    let mut f = fixture();
    let va = map_identity(&mut f, 0x30, MemType::Normal);

    f.cpu.store(va, 1, 0x80).unwrap();
    assert_eq!(f.cpu.load(va, 1, true).unwrap(), 0xFFFF_FFFF_FFFF_FF80);
    assert_eq!(f.cpu.load(va, 1, false).unwrap(), 0x80);
}

#[test]
fn stores_mark_the_pte_dirty() {
    let mut f = fixture();
    let va = map_identity(&mut f, 0x40, MemType::Normal);
    assert!(!f.cpu.pte(0x40).unwrap().dirty);
    f.cpu.store(va, 4, 1).unwrap();
    assert!(f.cpu.pte(0x40).unwrap().dirty);
}

#[test]
fn permission_bits_gate_stores_and_fetches() {
    let mut f = fixture();
    f.cpu
        .map_page(
            0x50,
            Some(0x50),
            PageAttrs {
                perms: PagePerms::empty(),
                memtype: MemType::Normal,
                cached: None,
            },
            None,
        )
        .unwrap();
    let va = 0x50 * PAGE_SIZE;

    assert!(f.cpu.load(va, 4, false).is_ok());
    assert!(f.cpu.store(va, 4, 1).is_err());
    assert!(f.cpu.fetch(va, 4).is_err());
}
