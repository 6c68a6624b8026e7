use ember_mem::{Device, DeviceCaps};
use ember_types::{Error, PhysAddr, Result};

/// Fixed register region size: MSIP words, MTIMECMP array, MTIME.
pub const CLINT_REGION_SIZE: u64 = 0xC000;

const MSIP_BASE: u64 = 0x0000;
const MTIMECMP_BASE: u64 = 0x4000;
const MTIME_OFFSET: u64 = 0xBFF8;

/// Interrupt levels a hart samples from the CLINT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqLevels {
    pub msip: bool,
    pub mtip: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct Hart {
    msip: bool,
    mtimecmp: u64,
}

/// Core-local interruptor: per-hart software interrupt bits and timer
/// compare registers against a shared `mtime` counter.
pub struct Clint {
    base: PhysAddr,
    harts: Vec<Hart>,
    mtime: u64,
    /// `mtime` increment per `advance` step.
    tick: u64,
}

impl Clint {
    pub fn new(base: PhysAddr, harts: usize, tick: u64) -> Result<Self> {
        if harts == 0 {
            return Err(Error::BadConfig("CLINT needs at least one hart".into()));
        }
        if tick == 0 {
            return Err(Error::BadConfig("CLINT tick must be non-zero".into()));
        }
        Ok(Self {
            base,
            harts: vec![Hart::default(); harts],
            mtime: 0,
            tick,
        })
    }

    pub fn mtime(&self) -> u64 {
        self.mtime
    }

    pub fn set_msip(&mut self, hart: usize, value: bool) {
        if let Some(h) = self.harts.get_mut(hart) {
            h.msip = value;
        }
    }

    pub fn set_mtimecmp(&mut self, hart: usize, value: u64) {
        if let Some(h) = self.harts.get_mut(hart) {
            h.mtimecmp = value;
        }
    }

    /// Advances `mtime` by `tick * steps`.
    pub fn advance(&mut self, steps: u64) {
        self.mtime = self.mtime.wrapping_add(self.tick.wrapping_mul(steps));
    }

    /// Current interrupt levels for a hart. A zero `mtimecmp` disarms the
    /// timer interrupt.
    pub fn get_irq_levels(&self, hart: usize) -> IrqLevels {
        let h = self.harts.get(hart).copied().unwrap_or_default();
        IrqLevels {
            msip: h.msip,
            mtip: h.mtimecmp != 0 && self.mtime >= h.mtimecmp,
        }
    }

    /// Byte-granular register file view; gaps read as zero.
    fn peek_byte(&self, off: u64) -> u8 {
        if off < MTIMECMP_BASE {
            let hart = (off / 4) as usize;
            let byte = off % 4;
            if byte == 0 {
                if let Some(h) = self.harts.get(hart) {
                    return h.msip as u8;
                }
            }
            return 0;
        }
        if (MTIMECMP_BASE..MTIMECMP_BASE + 8 * self.harts.len() as u64).contains(&off) {
            let rel = off - MTIMECMP_BASE;
            let hart = (rel / 8) as usize;
            let byte = rel % 8;
            return (self.harts[hart].mtimecmp >> (8 * byte)) as u8;
        }
        if (MTIME_OFFSET..MTIME_OFFSET + 8).contains(&off) {
            let byte = off - MTIME_OFFSET;
            return (self.mtime >> (8 * byte)) as u8;
        }
        0
    }

    fn poke_byte(&mut self, off: u64, value: u8) {
        if off < MTIMECMP_BASE {
            let hart = (off / 4) as usize;
            let byte = off % 4;
            if byte == 0 {
                if let Some(h) = self.harts.get_mut(hart) {
                    h.msip = value & 1 != 0;
                }
            }
            return;
        }
        if (MTIMECMP_BASE..MTIMECMP_BASE + 8 * self.harts.len() as u64).contains(&off) {
            let rel = off - MTIMECMP_BASE;
            let hart = (rel / 8) as usize;
            let shift = 8 * (rel % 8);
            let cmp = &mut self.harts[hart].mtimecmp;
            *cmp = (*cmp & !(0xFFu64 << shift)) | (u64::from(value) << shift);
            return;
        }
        if (MTIME_OFFSET..MTIME_OFFSET + 8).contains(&off) {
            let shift = 8 * (off - MTIME_OFFSET);
            self.mtime = (self.mtime & !(0xFFu64 << shift)) | (u64::from(value) << shift);
        }
        // Writes into reserved gaps are dropped.
    }
}

impl Device for Clint {
    fn region(&self) -> (PhysAddr, u64) {
        (self.base, CLINT_REGION_SIZE)
    }

    fn caps(&self) -> DeviceCaps {
        DeviceCaps::aligned(4, &[4, 8])
    }

    fn read(&mut self, offset: u64, count: usize) -> Result<Vec<u8>> {
        Ok((0..count as u64).map(|i| self.peek_byte(offset + i)).collect())
    }

    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        for (i, b) in bytes.iter().enumerate() {
            self.poke_byte(offset + i as u64, *b);
        }
        Ok(())
    }
}
