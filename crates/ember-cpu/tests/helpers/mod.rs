#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use ember_cache::{CacheConfig, CacheController};
use ember_cpu::{Cpu, Target};
use ember_mem::{Bus, Dram};
use ember_mmu::{MemType, Mmu, MmuConfig, PageAttrs, PagePerms};

pub const RAM_SIZE: u64 = 1 << 20;
pub const PAGE_SIZE: u64 = 4096;

pub struct Fixture {
    pub cpu: Cpu,
    pub bus: Rc<RefCell<Bus>>,
    pub dram: Rc<RefCell<Dram>>,
    pub cache: Rc<RefCell<CacheController>>,
}

/// One CPU over one DRAM mapped flat at physical zero.
pub fn fixture() -> Fixture {
    let dram = Rc::new(RefCell::new(Dram::new(RAM_SIZE, 0x00)));
    let bus = Rc::new(RefCell::new(Bus::new()));
    bus.borrow_mut()
        .map_ram("ram", 0, RAM_SIZE, dram.clone(), 0)
        .unwrap();
    let cache = Rc::new(RefCell::new(
        CacheController::new(CacheConfig::default(), bus.clone()).unwrap(),
    ));
    let mmu = Mmu::new(MmuConfig::default()).unwrap();
    let cpu = Cpu::new(Target::default(), bus.clone(), mmu, cache.clone());
    Fixture {
        cpu,
        bus,
        dram,
        cache,
    }
}

/// Identity-maps one page (`vpn == frame`) with the given memory type and
/// full permissions, returning the page's base virtual address.
pub fn map_identity(f: &mut Fixture, vpn: u64, memtype: MemType) -> u64 {
    f.cpu
        .map_page(
            vpn,
            Some(vpn),
            PageAttrs {
                perms: PagePerms::WRITE | PagePerms::EXEC,
                memtype,
                cached: None,
            },
            None,
        )
        .unwrap();
    vpn * PAGE_SIZE
}
