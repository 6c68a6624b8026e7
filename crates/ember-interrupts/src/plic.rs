use std::cell::RefCell;
use std::rc::{Rc, Weak};

use ember_mem::{Device, DeviceCaps};
use ember_types::{Error, PhysAddr, Result};
use tracing::debug;

/// Register layout flavor. Both put source priorities first; they differ
/// in where the pending words and the per-context blocks live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlicLayout {
    /// Dense layout for small systems: pending at 0x100, contexts at
    /// 0x180 with a 0x20 stride.
    Compact,
    /// SiFive-style layout: pending at 0x1000, contexts at 0x2000 with a
    /// 0x1000 stride.
    Canonical,
}

impl PlicLayout {
    pub fn pending_base(self) -> u64 {
        match self {
            PlicLayout::Compact => 0x100,
            PlicLayout::Canonical => 0x1000,
        }
    }

    pub fn ctx_base(self) -> u64 {
        match self {
            PlicLayout::Compact => 0x180,
            PlicLayout::Canonical => 0x2000,
        }
    }

    pub fn ctx_stride(self) -> u64 {
        match self {
            PlicLayout::Compact => 0x20,
            PlicLayout::Canonical => 0x1000,
        }
    }
}

/// Line-tracking mode. `Level` mirrors the input lines into the pending
/// bits; `Latched` remembers a rising edge until it is claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlicMode {
    Level,
    Latched,
}

#[derive(Debug, Clone)]
pub struct PlicConfig {
    /// Interrupt sources 1..=sources. At most 64.
    pub sources: u32,
    /// Claim/complete contexts 0..contexts. At most 8.
    pub contexts: u32,
    pub layout: PlicLayout,
    pub mode: PlicMode,
    /// Physical base of the MMIO region.
    pub base: PhysAddr,
}

impl Default for PlicConfig {
    fn default() -> Self {
        Self {
            sources: 32,
            contexts: 1,
            layout: PlicLayout::Compact,
            mode: PlicMode::Level,
            base: 0x0C00_0000,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Context {
    enable: u64,
    threshold: u32,
}

/// PLIC-style external interrupt controller.
///
/// Source ids are 1-based; bit `id - 1` of the 64-bit bitmaps tracks
/// source `id`. Claim returns the pending enabled source with the highest
/// priority above the context threshold, lowest id winning ties.
pub struct Plic {
    config: PlicConfig,
    /// Indexed by source id; slot 0 is unused.
    priority: Vec<u32>,
    line_high: Vec<bool>,
    pending: u64,
    contexts: Vec<Context>,
}

impl Plic {
    pub fn new(config: PlicConfig) -> Result<Self> {
        if config.sources == 0 || config.sources > 64 {
            return Err(Error::BadConfig(format!(
                "PLIC sources must be 1..=64, got {}",
                config.sources
            )));
        }
        if config.contexts == 0 || config.contexts > 8 {
            return Err(Error::BadConfig(format!(
                "PLIC contexts must be 1..=8, got {}",
                config.contexts
            )));
        }
        let sources = config.sources as usize;
        let contexts = config.contexts as usize;
        Ok(Self {
            config,
            priority: vec![0; sources + 1],
            line_high: vec![false; sources + 1],
            pending: 0,
            contexts: vec![Context::default(); contexts],
        })
    }

    pub fn config(&self) -> &PlicConfig {
        &self.config
    }

    fn bit(id: u32) -> u64 {
        1u64 << (id - 1)
    }

    fn valid_source(&self, id: u32) -> bool {
        id >= 1 && id <= self.config.sources
    }

    /// Drives a source line high. Level mode mirrors the line into the
    /// pending bit; latched mode records the rising edge.
    pub fn raise(&mut self, id: u32) {
        if !self.valid_source(id) {
            return;
        }
        match self.config.mode {
            PlicMode::Level => {
                self.line_high[id as usize] = true;
                self.pending |= Self::bit(id);
            }
            PlicMode::Latched => {
                if !self.line_high[id as usize] {
                    self.pending |= Self::bit(id);
                }
                self.line_high[id as usize] = true;
            }
        }
        debug!(source = id, "plic line raised");
    }

    /// Drives a source line low. Latched mode keeps the pending bit until
    /// claim/complete resolve it.
    pub fn lower(&mut self, id: u32) {
        if !self.valid_source(id) {
            return;
        }
        self.line_high[id as usize] = false;
        if self.config.mode == PlicMode::Level {
            self.pending &= !Self::bit(id);
        }
    }

    pub fn set_priority(&mut self, id: u32, priority: u32) {
        if self.valid_source(id) {
            self.priority[id as usize] = priority;
        }
    }

    pub fn set_enabled(&mut self, ctx: u32, id: u32, enabled: bool) {
        if !self.valid_source(id) {
            return;
        }
        if let Some(c) = self.contexts.get_mut(ctx as usize) {
            if enabled {
                c.enable |= Self::bit(id);
            } else {
                c.enable &= !Self::bit(id);
            }
        }
    }

    pub fn set_threshold(&mut self, ctx: u32, threshold: u32) {
        if let Some(c) = self.contexts.get_mut(ctx as usize) {
            c.threshold = threshold;
        }
    }

    /// Highest-priority claimable source for `ctx`, or `None`. Pure
    /// search; does not change any state.
    fn best_source(&self, ctx: u32) -> Option<u32> {
        let c = self.contexts.get(ctx as usize)?;
        let mut best: Option<(u32, u32)> = None;
        for id in 1..=self.config.sources {
            let bit = Self::bit(id);
            if self.pending & c.enable & bit == 0 {
                continue;
            }
            let prio = self.priority[id as usize];
            if prio == 0 || prio <= c.threshold {
                continue;
            }
            // Strictly-greater keeps the lowest id on priority ties.
            if best.map(|(_, p)| prio > p).unwrap_or(true) {
                best = Some((id, prio));
            }
        }
        best.map(|(id, _)| id)
    }

    /// Claims the best pending source for `ctx`; 0 when none qualifies.
    /// In latched mode the claimed source's pending bit is cleared.
    pub fn claim(&mut self, ctx: u32) -> u32 {
        let Some(id) = self.best_source(ctx) else {
            return 0;
        };
        if self.config.mode == PlicMode::Latched {
            self.pending &= !Self::bit(id);
        }
        debug!(source = id, ctx, "plic claim");
        id
    }

    /// Acknowledges a claimed source. In latched mode the source becomes
    /// pending again iff its line is still high; in level mode the pending
    /// bit tracks the line already.
    pub fn complete(&mut self, _ctx: u32, id: u32) {
        if !self.valid_source(id) {
            return;
        }
        if self.config.mode == PlicMode::Latched && self.line_high[id as usize] {
            self.pending |= Self::bit(id);
        }
    }

    /// Level of the aggregated interrupt line for `ctx`: high iff a claim
    /// would return a non-zero id.
    pub fn get_context_irq(&self, ctx: u32) -> bool {
        self.best_source(ctx).is_some()
    }

    pub fn pending_bitmap(&self) -> u64 {
        self.pending
    }

    /// Total size of the register region under the configured layout.
    pub fn region_size(&self) -> u64 {
        self.config.layout.ctx_base()
            + self.config.layout.ctx_stride() * u64::from(self.config.contexts)
    }

    fn read_reg(&mut self, off: u64) -> u32 {
        let layout = self.config.layout;
        if off < layout.pending_base() {
            let id = (off / 4) + 1;
            if self.valid_source(id as u32) {
                return self.priority[id as usize];
            }
            return 0;
        }
        if off == layout.pending_base() {
            return self.pending as u32;
        }
        if off == layout.pending_base() + 4 {
            return (self.pending >> 32) as u32;
        }
        if off >= layout.ctx_base() {
            let ctx = (off - layout.ctx_base()) / layout.ctx_stride();
            let reg = (off - layout.ctx_base()) % layout.ctx_stride();
            if ctx >= u64::from(self.config.contexts) {
                return 0;
            }
            let ctx = ctx as u32;
            return match reg {
                0 => self.contexts[ctx as usize].enable as u32,
                4 => (self.contexts[ctx as usize].enable >> 32) as u32,
                8 => self.contexts[ctx as usize].threshold,
                12 => self.claim(ctx),
                _ => 0,
            };
        }
        0
    }

    fn write_reg(&mut self, off: u64, value: u32) {
        let layout = self.config.layout;
        if off < layout.pending_base() {
            let id = (off / 4) + 1;
            self.set_priority(id as u32, value);
            return;
        }
        // Pending words are read-only; writes are dropped.
        if off >= layout.ctx_base() {
            let ctx = (off - layout.ctx_base()) / layout.ctx_stride();
            let reg = (off - layout.ctx_base()) % layout.ctx_stride();
            if ctx >= u64::from(self.config.contexts) {
                return;
            }
            let ctx_idx = ctx as usize;
            match reg {
                0 => {
                    let hi = self.contexts[ctx_idx].enable & !0xFFFF_FFFF;
                    self.contexts[ctx_idx].enable = hi | u64::from(value);
                }
                4 => {
                    let lo = self.contexts[ctx_idx].enable & 0xFFFF_FFFF;
                    self.contexts[ctx_idx].enable = lo | (u64::from(value) << 32);
                }
                8 => self.contexts[ctx_idx].threshold = value,
                12 => self.complete(ctx as u32, value),
                _ => {}
            }
        }
    }
}

impl Device for Plic {
    fn region(&self) -> (PhysAddr, u64) {
        (self.config.base, self.region_size())
    }

    fn caps(&self) -> DeviceCaps {
        DeviceCaps::aligned(4, &[4])
    }

    fn read(&mut self, offset: u64, count: usize) -> Result<Vec<u8>> {
        if count != 4 || offset % 4 != 0 {
            return Err(Error::Device {
                device: "plic".into(),
                reason: format!("unsupported access: {count} bytes at {offset:#x}"),
            });
        }
        Ok(self.read_reg(offset).to_le_bytes().to_vec())
    }

    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        if bytes.len() != 4 || offset % 4 != 0 {
            return Err(Error::Device {
                device: "plic".into(),
                reason: format!("unsupported access: {} bytes at {offset:#x}", bytes.len()),
            });
        }
        let value = u32::from_le_bytes(bytes.try_into().expect("length checked"));
        self.write_reg(offset, value);
        Ok(())
    }
}

/// Interrupt sink handed to a device: a weak reference to the controller
/// plus the source id the device drives. Raising or lowering after the
/// controller is gone is a no-op, so sinks never keep it alive.
#[derive(Clone)]
pub struct IrqLine {
    plic: Weak<RefCell<Plic>>,
    source: u32,
}

impl IrqLine {
    pub fn new(plic: &Rc<RefCell<Plic>>, source: u32) -> Self {
        Self {
            plic: Rc::downgrade(plic),
            source,
        }
    }

    pub fn source(&self) -> u32 {
        self.source
    }

    pub fn raise(&self) {
        if let Some(plic) = self.plic.upgrade() {
            plic.borrow_mut().raise(self.source);
        }
    }

    pub fn lower(&self) {
        if let Some(plic) = self.plic.upgrade() {
            plic.borrow_mut().lower(self.source);
        }
    }

    pub fn set_level(&self, high: bool) {
        if high {
            self.raise();
        } else {
            self.lower();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plic(mode: PlicMode) -> Plic {
        Plic::new(PlicConfig {
            sources: 8,
            contexts: 2,
            mode,
            ..Default::default()
        })
        .unwrap()
    }

    fn enable_all(p: &mut Plic, ctx: u32) {
        for id in 1..=8 {
            p.set_enabled(ctx, id, true);
        }
        p.set_threshold(ctx, 0);
    }

    #[test]
    fn claim_orders_by_priority_then_lowest_id() {
        let mut p = plic(PlicMode::Level);
        enable_all(&mut p, 0);
        p.set_priority(1, 1);
        p.set_priority(2, 2);
        p.set_priority(3, 3);
        p.set_priority(4, 2);

        p.raise(2);
        p.raise(3);
        p.raise(4);

        assert_eq!(p.claim(0), 3);
        p.complete(0, 3);
        p.lower(3);

        // Sources 2 and 4 tie at priority 2; the lower id wins.
        assert_eq!(p.claim(0), 2);
    }

    #[test]
    fn threshold_masks_low_priority_sources() {
        let mut p = plic(PlicMode::Level);
        enable_all(&mut p, 0);
        p.set_priority(1, 2);
        p.set_threshold(0, 2);
        p.raise(1);

        // priority <= threshold never claims.
        assert_eq!(p.claim(0), 0);
        assert!(!p.get_context_irq(0));

        p.set_threshold(0, 1);
        assert!(p.get_context_irq(0));
        assert_eq!(p.claim(0), 1);
    }

    #[test]
    fn zero_priority_sources_never_claim() {
        let mut p = plic(PlicMode::Level);
        enable_all(&mut p, 0);
        p.raise(5);
        assert_eq!(p.claim(0), 0);
    }

    #[test]
    fn contexts_have_independent_enables() {
        let mut p = plic(PlicMode::Level);
        enable_all(&mut p, 0);
        p.set_priority(6, 1);
        p.raise(6);

        assert_eq!(p.claim(1), 0); // ctx 1 never enabled the source
        assert_eq!(p.claim(0), 6);
    }

    #[test]
    fn level_mode_pending_tracks_the_line() {
        let mut p = plic(PlicMode::Level);
        enable_all(&mut p, 0);
        p.set_priority(1, 1);

        p.raise(1);
        assert_eq!(p.claim(0), 1);
        // Claim does not clear pending in level mode; the line does.
        assert_eq!(p.claim(0), 1);
        p.lower(1);
        assert_eq!(p.claim(0), 0);
    }

    #[test]
    fn latched_mode_holds_edge_until_complete() {
        let mut p = plic(PlicMode::Latched);
        enable_all(&mut p, 0);
        p.set_priority(1, 1);

        p.raise(1);
        p.lower(1); // pulse: pending must survive the falling edge
        assert_eq!(p.claim(0), 1);
        // Claim consumed the latch.
        assert_eq!(p.claim(0), 0);
        p.complete(0, 1);
        // Line is low at complete time, so nothing re-pends.
        assert_eq!(p.claim(0), 0);

        // A raise held high across complete re-pends immediately.
        p.raise(1);
        assert_eq!(p.claim(0), 1);
        p.complete(0, 1);
        assert_eq!(p.claim(0), 1);
    }

    #[test]
    fn latched_mode_ignores_repeated_high_levels() {
        let mut p = plic(PlicMode::Latched);
        enable_all(&mut p, 0);
        p.set_priority(1, 1);

        p.raise(1);
        assert_eq!(p.claim(0), 1);
        // Still high; a second raise without a falling edge is not a new
        // event.
        p.raise(1);
        assert_eq!(p.claim(0), 0);
    }

    #[test]
    fn mmio_register_map_matches_both_layouts() {
        for (layout, pend, ctx_base, stride) in [
            (PlicLayout::Compact, 0x100u64, 0x180u64, 0x20u64),
            (PlicLayout::Canonical, 0x1000, 0x2000, 0x1000),
        ] {
            let mut p = Plic::new(PlicConfig {
                sources: 40,
                contexts: 2,
                layout,
                mode: PlicMode::Level,
                base: 0,
            })
            .unwrap();

            // Priority of source 3 lives at 4 * (3 - 1).
            p.write(8, &5u32.to_le_bytes()).unwrap();
            assert_eq!(p.read(8, 4).unwrap(), 5u32.to_le_bytes());

            // Source 35 pends in the high word.
            p.raise(35);
            p.raise(2);
            assert_eq!(p.read(pend, 4).unwrap(), (1u32 << 1).to_le_bytes());
            assert_eq!(p.read(pend + 4, 4).unwrap(), (1u32 << 2).to_le_bytes());

            // Context 1 enable/threshold/claim block.
            let c1 = ctx_base + stride;
            p.write(c1, &(1u32 << 2).to_le_bytes()).unwrap(); // enable source 3
            p.write(c1 + 8, &0u32.to_le_bytes()).unwrap();
            p.raise(3);
            assert_eq!(p.read(c1 + 12, 4).unwrap(), 3u32.to_le_bytes());
        }
    }

    #[test]
    fn irq_line_survives_a_dropped_controller() {
        let plic = Rc::new(RefCell::new(
            Plic::new(PlicConfig::default()).unwrap(),
        ));
        let line = IrqLine::new(&plic, 1);
        drop(plic);
        // Must not panic.
        line.raise();
        line.lower();
    }
}
