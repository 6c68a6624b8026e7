use std::collections::BTreeMap;

use ember_mem::Bus;
use ember_types::{Error, PhysAddr, Result};
use tracing::debug;

/// Boot-time page allocator over the RAM regions of a bus.
///
/// Free space is tracked as page-aligned spans carved from every RAM
/// region at construction; allocation is first-fit, and freed spans are
/// coalesced with their neighbors. The allocation map remembers what was
/// handed out so mismatched or repeated frees are rejected.
pub struct BootAllocator {
    page_size: u64,
    /// base -> page count, disjoint and sorted.
    free: BTreeMap<PhysAddr, u64>,
    /// base -> page count of live allocations.
    allocated: BTreeMap<PhysAddr, u64>,
    total_pages: u64,
}

impl BootAllocator {
    pub fn new(bus: &Bus, page_size: u64) -> Result<Self> {
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(Error::BadConfig(format!(
                "page size {page_size:#x} is not a power of two"
            )));
        }
        let mut free = BTreeMap::new();
        let mut total_pages = 0;
        for region in bus.regions().iter().filter(|r| r.is_ram()) {
            let start = region.base.next_multiple_of(page_size);
            let end = (region.base + region.size) & !(page_size - 1);
            if end > start {
                let pages = (end - start) / page_size;
                free.insert(start, pages);
                total_pages += pages;
            }
        }
        Ok(Self {
            page_size,
            free,
            allocated: BTreeMap::new(),
            total_pages,
        })
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn total_pages(&self) -> u64 {
        self.total_pages
    }

    pub fn allocated_pages(&self) -> u64 {
        self.allocated.values().sum()
    }

    pub fn free_pages_remaining(&self) -> u64 {
        self.free.values().sum()
    }

    /// First-fit allocation of `pages` contiguous pages.
    pub fn allocate_pages(&mut self, pages: u64) -> Result<PhysAddr> {
        if pages == 0 {
            return Err(Error::BadConfig("cannot allocate zero pages".into()));
        }
        let Some((&base, &span)) = self.free.iter().find(|(_, &span)| span >= pages) else {
            return Err(Error::OutOfMemory);
        };
        self.free.remove(&base);
        if span > pages {
            self.free
                .insert(base + pages * self.page_size, span - pages);
        }
        self.allocated.insert(base, pages);
        debug!(base = format_args!("{base:#x}"), pages, "boot alloc");
        Ok(base)
    }

    /// Returns an allocation. The `(base, pages)` pair must match the
    /// original allocation exactly.
    pub fn free_pages(&mut self, base: PhysAddr, pages: u64) -> Result<()> {
        match self.allocated.get(&base) {
            Some(&span) if span == pages => {
                self.allocated.remove(&base);
            }
            Some(&span) => {
                return Err(Error::Device {
                    device: "boot-alloc".into(),
                    reason: format!(
                        "free of {pages} pages at {base:#x}, but {span} were allocated"
                    ),
                });
            }
            None => {
                return Err(Error::Device {
                    device: "boot-alloc".into(),
                    reason: format!("free of unallocated span at {base:#x}"),
                });
            }
        }
        self.insert_free(base, pages);
        Ok(())
    }

    fn insert_free(&mut self, base: PhysAddr, pages: u64) {
        let mut base = base;
        let mut pages = pages;
        // Merge with the span ending exactly at `base`.
        if let Some((&prev_base, &prev_pages)) = self.free.range(..base).next_back() {
            if prev_base + prev_pages * self.page_size == base {
                self.free.remove(&prev_base);
                base = prev_base;
                pages += prev_pages;
            }
        }
        // Merge with the span starting right after the freed one.
        let end = base + pages * self.page_size;
        if let Some(&next_pages) = self.free.get(&end) {
            self.free.remove(&end);
            pages += next_pages;
        }
        self.free.insert(base, pages);
    }
}
