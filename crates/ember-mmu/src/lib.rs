//! Paged virtual addressing: per-ASID page tables, a tick-LRU TLB, memory
//! type attributes, and a bounded physical frame pool.

use std::collections::{BTreeSet, HashMap, HashSet};

use bitflags::bitflags;
use ember_types::{AccessKind, Asid, Error, PhysAddr, Result, VirtAddr};

bitflags! {
    /// Page permission bits. Present pages are always readable; write and
    /// execute are granted explicitly. USER marks guest user-mode pages.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PagePerms: u8 {
        const WRITE = 1 << 0;
        const EXEC = 1 << 1;
        const USER = 1 << 2;
    }
}

/// Memory type attribute of a page. Device and write-combining pages are
/// uncached unless the mapper explicitly overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemType {
    #[default]
    Normal,
    Device,
    Wc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte {
    pub frame: u64,
    pub present: bool,
    pub perms: PagePerms,
    pub cached: bool,
    pub memtype: MemType,
    pub dirty: bool,
    pub accessed: bool,
}

/// Attributes supplied to `map_page` / `set_page_attributes`. `cached`
/// left as `None` resolves to true for normal memory and false for device
/// and write-combining memory.
#[derive(Debug, Clone, Copy)]
pub struct PageAttrs {
    pub perms: PagePerms,
    pub memtype: MemType,
    pub cached: Option<bool>,
}

impl Default for PageAttrs {
    fn default() -> Self {
        Self {
            perms: PagePerms::WRITE,
            memtype: MemType::Normal,
            cached: None,
        }
    }
}

impl PageAttrs {
    fn resolve_cached(&self) -> bool {
        match self.cached {
            Some(explicit) => explicit,
            None => matches!(self.memtype, MemType::Normal),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MmuConfig {
    /// Power of two; default 4096.
    pub page_size: u64,
    /// TLB capacity; least-recently-used entry is evicted when full.
    pub tlb_entries: usize,
    /// Upper bound of the auto-allocation frame pool.
    pub max_frames: u64,
    /// First frame number handed out by the pool. Lets the wiring layer
    /// point auto-allocated pages at the base of guest RAM.
    pub frame_pool_base: u64,
}

impl Default for MmuConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            tlb_entries: 64,
            max_frames: 16384,
            frame_pool_base: 0,
        }
    }
}

impl MmuConfig {
    fn validate(&self) -> Result<()> {
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(Error::BadConfig(format!(
                "page size {:#x} is not a power of two",
                self.page_size
            )));
        }
        if self.tlb_entries == 0 {
            return Err(Error::BadConfig("TLB needs at least one entry".into()));
        }
        if self.max_frames == 0 {
            return Err(Error::BadConfig("frame pool needs at least one frame".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MmuStats {
    pub tlb_hits: u64,
    pub tlb_misses: u64,
    pub page_faults: u64,
}

#[derive(Debug, Clone, Copy)]
struct TlbEntry {
    frame: u64,
    tick: u64,
}

#[derive(Debug)]
pub struct Mmu {
    config: MmuConfig,
    page_shift: u32,
    asid: Asid,
    tables: HashMap<Asid, HashMap<u64, Pte>>,
    tlb: HashMap<(Asid, u64), TlbEntry>,
    tick: u64,
    /// Frames handed out by the pool, so unmap can return them.
    pool_allocated: HashSet<u64>,
    pool_free: BTreeSet<u64>,
    pool_next: u64,
    stats: MmuStats,
}

impl Mmu {
    pub fn new(config: MmuConfig) -> Result<Self> {
        config.validate()?;
        let page_shift = config.page_size.trailing_zeros();
        let pool_next = config.frame_pool_base;
        let mut tables = HashMap::new();
        tables.insert(0, HashMap::new());
        Ok(Self {
            config,
            page_shift,
            asid: 0,
            tables,
            tlb: HashMap::new(),
            tick: 0,
            pool_allocated: HashSet::new(),
            pool_free: BTreeSet::new(),
            pool_next,
            stats: MmuStats::default(),
        })
    }

    pub fn config(&self) -> &MmuConfig {
        &self.config
    }

    pub fn page_size(&self) -> u64 {
        self.config.page_size
    }

    pub fn page_shift(&self) -> u32 {
        self.page_shift
    }

    pub fn stats(&self) -> MmuStats {
        self.stats
    }

    pub fn current_asid(&self) -> Asid {
        self.asid
    }

    /// Switches the active address space, creating its table on first use.
    pub fn set_asid(&mut self, asid: Asid) {
        self.asid = asid;
        self.tables.entry(asid).or_default();
    }

    pub fn vpn_of(&self, va: VirtAddr) -> u64 {
        va >> self.page_shift
    }

    fn alloc_frame(&mut self) -> Result<u64> {
        if let Some(frame) = self.pool_free.pop_first() {
            self.pool_allocated.insert(frame);
            return Ok(frame);
        }
        if self.pool_next - self.config.frame_pool_base >= self.config.max_frames {
            return Err(Error::OutOfFrames);
        }
        let frame = self.pool_next;
        self.pool_next += 1;
        self.pool_allocated.insert(frame);
        Ok(frame)
    }

    /// Maps `vpn` to a frame, drawing one from the pool when `frame` is
    /// `None`. Remapping an existing page invalidates its TLB entry.
    /// Returns the frame number used.
    pub fn map_page(
        &mut self,
        vpn: u64,
        frame: Option<u64>,
        attrs: PageAttrs,
        asid: Option<Asid>,
    ) -> Result<u64> {
        let asid = asid.unwrap_or(self.asid);
        let frame = match frame {
            Some(f) => f,
            None => self.alloc_frame()?,
        };
        let pte = Pte {
            frame,
            present: true,
            perms: attrs.perms,
            cached: attrs.resolve_cached(),
            memtype: attrs.memtype,
            dirty: false,
            accessed: false,
        };
        self.tables.entry(asid).or_default().insert(vpn, pte);
        self.tlb.remove(&(asid, vpn));
        Ok(frame)
    }

    /// Removes the mapping, invalidates its TLB entry, and returns a
    /// pool-allocated frame to the pool.
    pub fn unmap_page(&mut self, vpn: u64, asid: Option<Asid>) -> Result<()> {
        let asid = asid.unwrap_or(self.asid);
        let pte = self
            .tables
            .get_mut(&asid)
            .and_then(|t| t.remove(&vpn))
            .ok_or(Error::PageFault {
                asid,
                vaddr: vpn << self.page_shift,
            })?;
        self.tlb.remove(&(asid, vpn));
        if self.pool_allocated.remove(&pte.frame) {
            self.pool_free.insert(pte.frame);
        }
        Ok(())
    }

    /// Replaces the attribute bits of an existing mapping and flushes its
    /// TLB entry. The frame and dirty/accessed state are preserved.
    pub fn set_page_attributes(
        &mut self,
        vpn: u64,
        attrs: PageAttrs,
        asid: Option<Asid>,
    ) -> Result<()> {
        let asid = asid.unwrap_or(self.asid);
        let page_shift = self.page_shift;
        let pte = self
            .tables
            .get_mut(&asid)
            .and_then(|t| t.get_mut(&vpn))
            .ok_or(Error::PageFault {
                asid,
                vaddr: vpn << page_shift,
            })?;
        pte.perms = attrs.perms;
        pte.memtype = attrs.memtype;
        pte.cached = attrs.resolve_cached();
        self.tlb.remove(&(asid, vpn));
        Ok(())
    }

    /// Translates a virtual address in the current ASID.
    ///
    /// TLB hits refresh the entry's tick. Misses walk the page table,
    /// fault on absent or non-present entries, install into the TLB
    /// (evicting the least-recently-used entry when full), and mark the
    /// PTE accessed.
    pub fn translate(&mut self, va: VirtAddr) -> Result<(PhysAddr, Pte)> {
        let vpn = self.vpn_of(va);
        let offset = va & (self.config.page_size - 1);
        let asid = self.asid;
        self.tick += 1;

        if let Some(entry) = self.tlb.get_mut(&(asid, vpn)) {
            // Map/unmap/attribute changes invalidate TLB entries, so a
            // resident entry always has a backing PTE.
            if let Some(pte) = self.tables.get(&asid).and_then(|t| t.get(&vpn)).copied() {
                entry.tick = self.tick;
                let frame = entry.frame;
                self.stats.tlb_hits += 1;
                return Ok(((frame << self.page_shift) | offset, pte));
            }
        }

        self.stats.tlb_misses += 1;
        let page_shift = self.page_shift;
        let Some(pte) = self
            .tables
            .get_mut(&asid)
            .and_then(|t| t.get_mut(&vpn))
            .filter(|pte| pte.present)
        else {
            self.stats.page_faults += 1;
            return Err(Error::PageFault { asid, vaddr: va });
        };
        pte.accessed = true;
        let pte = *pte;

        if self.tlb.len() >= self.config.tlb_entries {
            if let Some((&victim, _)) = self.tlb.iter().min_by_key(|(_, e)| e.tick) {
                self.tlb.remove(&victim);
            }
        }
        self.tlb.insert(
            (asid, vpn),
            TlbEntry {
                frame: pte.frame,
                tick: self.tick,
            },
        );

        Ok(((pte.frame << page_shift) | offset, pte))
    }

    /// Translates and enforces the permission bits for `kind`.
    pub fn check_access(&mut self, va: VirtAddr, kind: AccessKind) -> Result<(PhysAddr, Pte)> {
        let (pa, pte) = self.translate(va)?;
        let allowed = match kind {
            AccessKind::Read => true,
            AccessKind::Write => pte.perms.contains(PagePerms::WRITE),
            AccessKind::Execute => pte.perms.contains(PagePerms::EXEC),
        };
        if allowed {
            Ok((pa, pte))
        } else {
            Err(Error::PermissionDenied { vaddr: va, access: kind })
        }
    }

    /// Marks the PTE backing `va` dirty (the CPU calls this on stores).
    pub fn mark_dirty(&mut self, va: VirtAddr) {
        let vpn = self.vpn_of(va);
        if let Some(pte) = self.tables.get_mut(&self.asid).and_then(|t| t.get_mut(&vpn)) {
            pte.dirty = true;
        }
    }

    /// Drops all TLB entries for `asid`, or the whole TLB when `None`.
    pub fn flush_tlb(&mut self, asid: Option<Asid>) {
        match asid {
            Some(asid) => self.tlb.retain(|(a, _), _| *a != asid),
            None => self.tlb.clear(),
        }
    }

    pub fn flush_tlb_entry(&mut self, vpn: u64, asid: Option<Asid>) {
        let asid = asid.unwrap_or(self.asid);
        self.tlb.remove(&(asid, vpn));
    }

    /// Read-only view of a PTE, bypassing the TLB and stats.
    pub fn pte(&self, vpn: u64, asid: Option<Asid>) -> Option<Pte> {
        let asid = asid.unwrap_or(self.asid);
        self.tables.get(&asid).and_then(|t| t.get(&vpn)).copied()
    }
}
