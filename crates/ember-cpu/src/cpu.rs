use std::cell::RefCell;
use std::rc::Rc;

use ember_cache::{CacheController, CacheLevel};
use ember_interrupts::{Clint, Plic, PlicLayout};
use ember_mem::Bus;
use ember_mmu::{MemType, Mmu, PageAttrs, Pte};
use ember_types::{AccessKind, Asid, Error, PhysAddr, Result, VirtAddr};
use tracing::{debug, trace};

use crate::csr::{CsrFile, InterruptBits};
use crate::target::Target;
use crate::wc::WriteCombiningBuffer;

/// Next-line prefetch behavior for cached normal accesses.
#[derive(Debug, Clone, Copy)]
pub struct PrefetchPolicy {
    pub enable: bool,
    /// Level the prefetched line is installed at.
    pub to: CacheLevel,
}

impl Default for PrefetchPolicy {
    fn default() -> Self {
        Self {
            enable: true,
            to: CacheLevel::L2,
        }
    }
}

struct PlicAttachment {
    dev: Rc<RefCell<Plic>>,
    base: PhysAddr,
    layout: PlicLayout,
    ctx: u32,
}

struct ClintAttachment {
    dev: Rc<RefCell<Clint>>,
    hart: usize,
}

/// CPU front-end over the memory system.
///
/// Owns the MMU, CSR block, and write-combining buffer; shares the bus
/// and the cache controller (whose L1I/L1D sides serve fetches and data
/// accesses) with the rest of the machine.
pub struct Cpu {
    target: Target,
    bus: Rc<RefCell<Bus>>,
    mmu: Mmu,
    cache: Rc<RefCell<CacheController>>,
    prefetch: PrefetchPolicy,
    wc: WriteCombiningBuffer,
    plic: Option<PlicAttachment>,
    clint: Option<ClintAttachment>,
    csr: CsrFile,
}

impl Cpu {
    pub fn new(
        target: Target,
        bus: Rc<RefCell<Bus>>,
        mmu: Mmu,
        cache: Rc<RefCell<CacheController>>,
    ) -> Self {
        let line_size = cache.borrow().line_size(CacheLevel::L1d);
        Self {
            target,
            bus,
            mmu,
            cache,
            prefetch: PrefetchPolicy::default(),
            wc: WriteCombiningBuffer::new(line_size),
            plic: None,
            clint: None,
            csr: CsrFile::default(),
        }
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn mmu(&self) -> &Mmu {
        &self.mmu
    }

    pub fn mmu_mut(&mut self) -> &mut Mmu {
        &mut self.mmu
    }

    pub fn csr(&self) -> &CsrFile {
        &self.csr
    }

    pub fn csr_mut(&mut self) -> &mut CsrFile {
        &mut self.csr
    }

    pub fn set_prefetch_policy(&mut self, policy: PrefetchPolicy) {
        self.prefetch = policy;
    }

    /// Pending write-combining run, for inspection.
    pub fn wc_pending(&self) -> Option<(PhysAddr, &[u8])> {
        self.wc.pending()
    }

    // ---- Address-space management (forwarded to the MMU) ----

    pub fn set_asid(&mut self, asid: Asid) {
        self.mmu.set_asid(asid);
    }

    pub fn map_page(
        &mut self,
        vpn: u64,
        frame: Option<u64>,
        attrs: PageAttrs,
        asid: Option<Asid>,
    ) -> Result<u64> {
        self.mmu.map_page(vpn, frame, attrs, asid)
    }

    pub fn unmap_page(&mut self, vpn: u64, asid: Option<Asid>) -> Result<()> {
        self.mmu.unmap_page(vpn, asid)
    }

    pub fn set_page_attributes(
        &mut self,
        vpn: u64,
        attrs: PageAttrs,
        asid: Option<Asid>,
    ) -> Result<()> {
        self.mmu.set_page_attributes(vpn, attrs, asid)
    }

    pub fn flush_tlb(&mut self, asid: Option<Asid>) {
        self.mmu.flush_tlb(asid);
    }

    // ---- Cache maintenance ----

    pub fn flush_icache(&mut self) -> Result<()> {
        self.cache.borrow_mut().flush_all(CacheLevel::L1i)
    }

    pub fn flush_dcache(&mut self) -> Result<()> {
        self.cache.borrow_mut().flush_all(CacheLevel::L1d)
    }

    pub fn flush_l2(&mut self) -> Result<()> {
        self.cache.borrow_mut().flush_all(CacheLevel::L2)
    }

    pub fn flush_l3(&mut self) -> Result<()> {
        self.cache.borrow_mut().flush_all(CacheLevel::L3)
    }

    /// Explicit data-side prefetch of the line covering `va`.
    pub fn prefetch_data(&mut self, va: VirtAddr) -> Result<()> {
        let (pa, _) = self.mmu.check_access(va, AccessKind::Read)?;
        self.cache.borrow_mut().prefetch_line(self.prefetch.to, pa)
    }

    /// Explicit instruction-side prefetch of the line covering `va`.
    pub fn prefetch_inst(&mut self, va: VirtAddr) -> Result<()> {
        let (pa, _) = self.mmu.check_access(va, AccessKind::Execute)?;
        self.cache.borrow_mut().prefetch_line(self.prefetch.to, pa)
    }

    /// Drains the write-combining buffer to the bus. The only ordering
    /// primitive offered to guest code.
    pub fn memory_barrier(&mut self) -> Result<()> {
        if let Some((base, bytes)) = self.wc.take() {
            trace!(base = format_args!("{base:#x}"), len = bytes.len(), "wc flush");
            self.bus.borrow().write_bytes(base, &bytes)?;
        }
        Ok(())
    }

    // ---- Typed accesses ----

    /// Instruction fetch: requires execute permission; normal cached pages
    /// go through the instruction cache with next-line prefetch.
    pub fn fetch(&mut self, va: VirtAddr, size: usize) -> Result<u64> {
        Target::check_size(size)?;
        let (pa, pte) = self.mmu.check_access(va, AccessKind::Execute)?;
        let bytes = if pte.memtype == MemType::Normal && pte.cached {
            let bytes = self
                .cache
                .borrow_mut()
                .read_bytes(pa, size, CacheLevel::L1i)?;
            self.prefetch_next_line(pa, CacheLevel::L1i);
            bytes
        } else {
            self.bus.borrow().read_bytes(pa, size)?
        };
        Ok(self.target.unpack(&bytes, false))
    }

    /// Data load, unpacked per target endianness and `signed`.
    pub fn load(&mut self, va: VirtAddr, size: usize, signed: bool) -> Result<u64> {
        Target::check_size(size)?;
        let (pa, pte) = self.mmu.check_access(va, AccessKind::Read)?;
        let bytes = if pte.memtype == MemType::Normal && pte.cached {
            let bytes = self
                .cache
                .borrow_mut()
                .read_bytes(pa, size, CacheLevel::L1d)?;
            self.prefetch_next_line(pa, CacheLevel::L1d);
            bytes
        } else {
            self.bus.borrow().read_bytes(pa, size)?
        };
        Ok(self.target.unpack(&bytes, signed))
    }

    /// Data store. Requires write permission, packs per target
    /// endianness, and routes by the page's memory type: device stores
    /// are barriered and go straight to the bus, write-combining stores
    /// post into the WC buffer, normal stores allocate through the cache
    /// (or hit the bus when uncached) and mark the PTE dirty.
    pub fn store(&mut self, va: VirtAddr, size: usize, value: u64) -> Result<()> {
        Target::check_size(size)?;
        let (pa, pte) = self.mmu.check_access(va, AccessKind::Write)?;
        let bytes = self.target.pack(value, size);
        match pte.memtype {
            MemType::Device => {
                // Device stores must observe every earlier posted write.
                self.memory_barrier()?;
                self.bus.borrow().write_bytes(pa, &bytes)?;
            }
            MemType::Wc => {
                if let Some((base, run)) = self.wc.push(pa, &bytes) {
                    self.bus.borrow().write_bytes(base, &run)?;
                }
            }
            MemType::Normal => {
                if pte.cached {
                    self.cache
                        .borrow_mut()
                        .write_bytes(pa, &bytes, CacheLevel::L1d)?;
                    self.prefetch_next_line(pa, CacheLevel::L1d);
                } else {
                    self.bus.borrow().write_bytes(pa, &bytes)?;
                }
                self.mmu.mark_dirty(va);
            }
        }
        Ok(())
    }

    /// Next-line prefetch hint after a cached access. Suppressed at page
    /// boundaries; a failed hint is dropped, not surfaced.
    fn prefetch_next_line(&mut self, pa: PhysAddr, side: CacheLevel) {
        if !self.prefetch.enable {
            return;
        }
        let mut cache = self.cache.borrow_mut();
        let line_size = cache.line_size(side);
        let next_pa = cache.block_address_for_level(side, pa) + line_size;
        let page_size = self.mmu.page_size();
        if next_pa / page_size != pa / page_size {
            return;
        }
        if cache.prefetch_line(self.prefetch.to, next_pa).is_err() {
            trace!(next_pa = format_args!("{next_pa:#x}"), "prefetch hint dropped");
        }
    }

    // ---- Interrupt plumbing ----

    /// Attaches a PLIC context to this CPU. The controller's base and
    /// layout are taken from its configuration; CLAIM/COMPLETE accesses
    /// in `poll_interrupts` go through the bus like guest code.
    pub fn attach_plic(&mut self, dev: Rc<RefCell<Plic>>, ctx: u32) {
        let (base, layout) = {
            let plic = dev.borrow();
            (plic.config().base, plic.config().layout)
        };
        self.plic = Some(PlicAttachment {
            dev,
            base,
            layout,
            ctx,
        });
    }

    pub fn attach_clint(&mut self, dev: Rc<RefCell<Clint>>, hart: usize) {
        self.clint = Some(ClintAttachment { dev, hart });
    }

    /// Refreshes mip from the attached CLINT hart and PLIC context.
    pub fn sample_irqs(&mut self) {
        if let Some(clint) = &self.clint {
            let levels = clint.dev.borrow().get_irq_levels(clint.hart);
            self.csr.mip.set(InterruptBits::MSI, levels.msip);
            self.csr.mip.set(InterruptBits::MTI, levels.mtip);
        }
        if let Some(plic) = &self.plic {
            let high = plic.dev.borrow().get_context_irq(plic.ctx);
            self.csr.mip.set(InterruptBits::MEI, high);
        }
    }

    /// Samples interrupt inputs and enters the trap for the
    /// highest-priority deliverable one, returning its cause.
    pub fn maybe_take_interrupt(&mut self) -> Option<u64> {
        self.sample_irqs();
        let cause = self.csr.should_take_interrupt()?;
        debug!(cause, "taking interrupt");
        self.csr.trap_enter(cause, true);
        Some(cause)
    }

    /// Return-from-trap (mret semantics).
    pub fn complete_trap(&mut self) {
        self.csr.mret();
    }

    /// Claims the context's highest-priority source through the PLIC's
    /// CLAIM register, runs `handler` on a non-zero id (handler errors
    /// are swallowed; a faulty ISR must not take the simulator down),
    /// acknowledges via COMPLETE, and returns the id.
    pub fn poll_interrupts(
        &mut self,
        ctx: u32,
        handler: Option<&mut dyn FnMut(u32) -> Result<()>>,
    ) -> Result<u32> {
        let Some(plic) = &self.plic else {
            return Err(Error::Device {
                device: "cpu".into(),
                reason: "no PLIC attached".into(),
            });
        };
        let claim_addr =
            plic.base + plic.layout.ctx_base() + u64::from(ctx) * plic.layout.ctx_stride() + 12;

        let raw = self.bus.borrow().read_bytes(claim_addr, 4)?;
        let id = u32::from_le_bytes(raw.try_into().expect("4-byte read"));
        if id == 0 {
            return Ok(0);
        }
        if let Some(handler) = handler {
            if let Err(e) = handler(id) {
                debug!(source = id, error = %e, "interrupt handler failed");
            }
        }
        self.bus
            .borrow()
            .write_bytes(claim_addr, &id.to_le_bytes())?;
        Ok(id)
    }

    /// The attached PLIC handle, if any.
    pub fn plic(&self) -> Option<Rc<RefCell<Plic>>> {
        self.plic.as_ref().map(|p| p.dev.clone())
    }

    /// The attached CLINT handle, if any.
    pub fn clint(&self) -> Option<Rc<RefCell<Clint>>> {
        self.clint.as_ref().map(|c| c.dev.clone())
    }

    /// PTE snapshot for diagnostics and tests.
    pub fn pte(&self, vpn: u64) -> Option<Pte> {
        self.mmu.pte(vpn, None)
    }
}
