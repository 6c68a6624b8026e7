use std::cell::RefCell;
use std::rc::Weak;

use bitflags::bitflags;
use ember_interrupts::IrqLine;
use ember_mem::{Bus, Device, DeviceCaps};
use ember_types::{Error, PhysAddr, Result};
use tracing::{debug, warn};

pub const DMA_REGION_SIZE: u64 = 32;

const REG_SRC_LO: u64 = 0x00;
const REG_SRC_HI: u64 = 0x04;
const REG_DST_LO: u64 = 0x08;
const REG_DST_HI: u64 = 0x0C;
const REG_LEN: u64 = 0x10;
const REG_CTRL: u64 = 0x14;
const REG_STATUS: u64 = 0x18;

/// Largest single bus transfer the engine issues.
const CHUNK: usize = 256;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DmaCtrl: u32 {
        const START = 1 << 0;
        const IRQ_EN = 1 << 1;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DmaStatus: u32 {
        const BUSY = 1 << 0;
        const DONE = 1 << 1;
        const ERR = 1 << 2;
    }
}

/// Bus-master copy engine.
///
/// Writing START performs the whole transfer synchronously on the
/// caller's thread in chunks of at most 256 bytes. With `ram_only` set,
/// both ranges must be covered entirely by RAM regions before the first
/// byte moves; a violation sets ERR and leaves the destination untouched.
/// Bus faults mid-transfer also set ERR. DONE and ERR are
/// write-1-to-clear.
pub struct DmaEngine {
    base: PhysAddr,
    src: u64,
    dst: u64,
    len: u32,
    irq_en: bool,
    status: DmaStatus,
    bus: Weak<RefCell<Bus>>,
    ram_only: bool,
    irq: Option<IrqLine>,
}

impl DmaEngine {
    pub fn new(base: PhysAddr, bus: Weak<RefCell<Bus>>, ram_only: bool) -> Self {
        Self {
            base,
            src: 0,
            dst: 0,
            len: 0,
            irq_en: false,
            status: DmaStatus::empty(),
            bus,
            ram_only,
            irq: None,
        }
    }

    pub fn set_irq(&mut self, irq: IrqLine) {
        self.irq = Some(irq);
    }

    pub fn status(&self) -> DmaStatus {
        self.status
    }

    fn update_irq(&self) {
        if let Some(irq) = &self.irq {
            irq.set_level(self.irq_en && self.status.contains(DmaStatus::DONE));
        }
    }

    fn fail(&mut self, reason: &str) {
        warn!(reason, "dma transfer error");
        self.status.remove(DmaStatus::BUSY);
        self.status.insert(DmaStatus::ERR);
    }

    /// Runs the programmed transfer to completion.
    fn kick(&mut self) {
        self.status = DmaStatus::BUSY;
        let len = u64::from(self.len);
        debug!(src = format_args!("{:#x}", self.src), dst = format_args!("{:#x}", self.dst), len, "dma start");

        let Some(bus) = self.bus.upgrade() else {
            self.fail("bus is gone");
            return;
        };
        let bus = bus.borrow();

        if self.ram_only && !(bus.range_is_ram(self.src, len) && bus.range_is_ram(self.dst, len)) {
            self.fail("range check: transfer touches non-RAM");
            return;
        }

        let mut moved = 0u64;
        while moved < len {
            let chunk = ((len - moved) as usize).min(CHUNK);
            let bytes = match bus.read_bytes(self.src + moved, chunk) {
                Ok(b) => b,
                Err(_) => {
                    drop(bus);
                    self.fail("source read fault");
                    return;
                }
            };
            if bus.write_bytes(self.dst + moved, &bytes).is_err() {
                drop(bus);
                self.fail("destination write fault");
                return;
            }
            moved += chunk as u64;
        }
        drop(bus);

        self.status = DmaStatus::DONE;
        self.update_irq();
    }

    fn read_reg(&self, offset: u64) -> u32 {
        match offset {
            REG_SRC_LO => self.src as u32,
            REG_SRC_HI => (self.src >> 32) as u32,
            REG_DST_LO => self.dst as u32,
            REG_DST_HI => (self.dst >> 32) as u32,
            REG_LEN => self.len,
            REG_CTRL => {
                if self.irq_en {
                    DmaCtrl::IRQ_EN.bits()
                } else {
                    0
                }
            }
            REG_STATUS => self.status.bits(),
            _ => 0,
        }
    }

    fn write_reg(&mut self, offset: u64, value: u32) {
        match offset {
            REG_SRC_LO => self.src = (self.src & !0xFFFF_FFFF) | u64::from(value),
            REG_SRC_HI => self.src = (self.src & 0xFFFF_FFFF) | (u64::from(value) << 32),
            REG_DST_LO => self.dst = (self.dst & !0xFFFF_FFFF) | u64::from(value),
            REG_DST_HI => self.dst = (self.dst & 0xFFFF_FFFF) | (u64::from(value) << 32),
            REG_LEN => self.len = value,
            REG_CTRL => {
                let ctrl = DmaCtrl::from_bits_truncate(value);
                self.irq_en = ctrl.contains(DmaCtrl::IRQ_EN);
                if ctrl.contains(DmaCtrl::START) {
                    self.kick();
                }
                self.update_irq();
            }
            REG_STATUS => {
                // Write-1-to-clear for the completion bits.
                let clear = DmaStatus::from_bits_truncate(value)
                    & (DmaStatus::DONE | DmaStatus::ERR);
                self.status.remove(clear);
                self.update_irq();
            }
            _ => {}
        }
    }
}

impl Device for DmaEngine {
    fn region(&self) -> (PhysAddr, u64) {
        (self.base, DMA_REGION_SIZE)
    }

    fn caps(&self) -> DeviceCaps {
        DeviceCaps::aligned(4, &[4])
    }

    fn read(&mut self, offset: u64, count: usize) -> Result<Vec<u8>> {
        if count != 4 || offset % 4 != 0 {
            return Err(Error::MmioConstraint {
                device: "dma".into(),
                reason: format!("{count}-byte read at offset {offset:#x}"),
            });
        }
        Ok(self.read_reg(offset).to_le_bytes().to_vec())
    }

    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        if bytes.len() != 4 || offset % 4 != 0 {
            return Err(Error::MmioConstraint {
                device: "dma".into(),
                reason: format!("{}-byte write at offset {offset:#x}", bytes.len()),
            });
        }
        let value = u32::from_le_bytes(bytes.try_into().expect("length checked"));
        self.write_reg(offset, value);
        Ok(())
    }
}
