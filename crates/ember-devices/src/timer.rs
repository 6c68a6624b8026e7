use bitflags::bitflags;
use ember_interrupts::IrqLine;
use ember_mem::{Device, DeviceCaps};
use ember_types::{Error, PhysAddr, Result};

pub const TIMER_REGION_SIZE: u64 = 32;

const REG_CNT_LO: u64 = 0x00;
const REG_CNT_HI: u64 = 0x04;
const REG_CMP_LO: u64 = 0x08;
const REG_CMP_HI: u64 = 0x0C;
const REG_CTRL: u64 = 0x10;
const REG_STATUS: u64 = 0x14;
const REG_TICK: u64 = 0x18;

const STATUS_PENDING: u32 = 1 << 0;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TimerCtrl: u32 {
        const ENABLE = 1 << 0;
        const IRQ_EN = 1 << 1;
        const AUTO_RELOAD = 1 << 2;
    }
}

/// Up-counting compare timer.
///
/// While enabled, `advance` adds `tick` to the counter per step; when the
/// counter reaches a non-zero compare value the pending bit latches (and
/// the counter rewinds to zero under auto-reload). STATUS.pending is
/// write-1-to-clear. The IRQ sink follows `pending && IRQ_EN`.
pub struct SysTimer {
    base: PhysAddr,
    counter: u64,
    compare: u64,
    ctrl: TimerCtrl,
    pending: bool,
    tick: u64,
    irq: Option<IrqLine>,
}

impl SysTimer {
    pub fn new(base: PhysAddr) -> Self {
        Self {
            base,
            counter: 0,
            compare: 0,
            ctrl: TimerCtrl::empty(),
            pending: false,
            tick: 1,
            irq: None,
        }
    }

    pub fn set_irq(&mut self, irq: IrqLine) {
        self.irq = Some(irq);
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn pending(&self) -> bool {
        self.pending
    }

    fn update_irq(&self) {
        if let Some(irq) = &self.irq {
            irq.set_level(self.pending && self.ctrl.contains(TimerCtrl::IRQ_EN));
        }
    }

    /// Steps the timer `n` times.
    pub fn advance(&mut self, n: u64) {
        if !self.ctrl.contains(TimerCtrl::ENABLE) {
            return;
        }
        for _ in 0..n {
            self.counter = self.counter.wrapping_add(self.tick);
            if self.compare != 0 && self.counter >= self.compare {
                self.pending = true;
                if self.ctrl.contains(TimerCtrl::AUTO_RELOAD) {
                    self.counter = 0;
                }
            }
        }
        self.update_irq();
    }

    fn read_reg(&self, offset: u64) -> u32 {
        match offset {
            REG_CNT_LO => self.counter as u32,
            REG_CNT_HI => (self.counter >> 32) as u32,
            REG_CMP_LO => self.compare as u32,
            REG_CMP_HI => (self.compare >> 32) as u32,
            REG_CTRL => self.ctrl.bits(),
            REG_STATUS => {
                if self.pending {
                    STATUS_PENDING
                } else {
                    0
                }
            }
            REG_TICK => self.tick as u32,
            _ => 0,
        }
    }

    fn write_reg(&mut self, offset: u64, value: u32) {
        match offset {
            REG_CNT_LO => {
                self.counter = (self.counter & !0xFFFF_FFFF) | u64::from(value);
            }
            REG_CNT_HI => {
                self.counter = (self.counter & 0xFFFF_FFFF) | (u64::from(value) << 32);
            }
            REG_CMP_LO => {
                self.compare = (self.compare & !0xFFFF_FFFF) | u64::from(value);
            }
            REG_CMP_HI => {
                self.compare = (self.compare & 0xFFFF_FFFF) | (u64::from(value) << 32);
            }
            REG_CTRL => {
                self.ctrl = TimerCtrl::from_bits_truncate(value);
                self.update_irq();
            }
            REG_STATUS => {
                if value & STATUS_PENDING != 0 {
                    self.pending = false;
                    self.update_irq();
                }
            }
            REG_TICK => {
                if value != 0 {
                    self.tick = u64::from(value);
                }
            }
            _ => {}
        }
    }
}

impl Device for SysTimer {
    fn region(&self) -> (PhysAddr, u64) {
        (self.base, TIMER_REGION_SIZE)
    }

    fn caps(&self) -> DeviceCaps {
        DeviceCaps::aligned(4, &[4])
    }

    fn read(&mut self, offset: u64, count: usize) -> Result<Vec<u8>> {
        if count != 4 || offset % 4 != 0 {
            return Err(Error::MmioConstraint {
                device: "timer".into(),
                reason: format!("{count}-byte read at offset {offset:#x}"),
            });
        }
        Ok(self.read_reg(offset).to_le_bytes().to_vec())
    }

    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        if bytes.len() != 4 || offset % 4 != 0 {
            return Err(Error::MmioConstraint {
                device: "timer".into(),
                reason: format!("{}-byte write at offset {offset:#x}", bytes.len()),
            });
        }
        let value = u32::from_le_bytes(bytes.try_into().expect("length checked"));
        self.write_reg(offset, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_interrupts::{Plic, PlicConfig};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn write_u32(t: &mut SysTimer, off: u64, v: u32) {
        t.write(off, &v.to_le_bytes()).unwrap();
    }

    fn read_u32(t: &mut SysTimer, off: u64) -> u32 {
        u32::from_le_bytes(t.read(off, 4).unwrap().try_into().unwrap())
    }

    #[test]
    fn disabled_timer_does_not_count() {
        let mut t = SysTimer::new(0);
        t.advance(100);
        assert_eq!(t.counter(), 0);
    }

    #[test]
    fn pending_latches_when_counter_reaches_compare() {
        let mut t = SysTimer::new(0);
        write_u32(&mut t, REG_CMP_LO, 10);
        write_u32(&mut t, REG_CTRL, TimerCtrl::ENABLE.bits());

        t.advance(9);
        assert!(!t.pending());
        t.advance(1);
        assert!(t.pending());
        assert_eq!(read_u32(&mut t, REG_STATUS), STATUS_PENDING);
        // Without auto-reload the counter keeps running.
        assert_eq!(t.counter(), 10);

        // Write-1-to-clear.
        write_u32(&mut t, REG_STATUS, STATUS_PENDING);
        assert!(!t.pending());
        // Writing zero clears nothing.
        t.advance(1);
        write_u32(&mut t, REG_STATUS, 0);
        assert!(t.pending());
    }

    #[test]
    fn auto_reload_rewinds_the_counter() {
        let mut t = SysTimer::new(0);
        write_u32(&mut t, REG_CMP_LO, 4);
        write_u32(
            &mut t,
            REG_CTRL,
            (TimerCtrl::ENABLE | TimerCtrl::AUTO_RELOAD).bits(),
        );

        t.advance(4);
        assert!(t.pending());
        assert_eq!(t.counter(), 0);
        t.advance(3);
        assert_eq!(t.counter(), 3);
    }

    #[test]
    fn tick_scales_each_step() {
        let mut t = SysTimer::new(0);
        write_u32(&mut t, REG_TICK, 8);
        write_u32(&mut t, REG_CTRL, TimerCtrl::ENABLE.bits());
        t.advance(3);
        assert_eq!(t.counter(), 24);
        assert_eq!(read_u32(&mut t, REG_CNT_LO), 24);
    }

    #[test]
    fn sixty_four_bit_compare_uses_both_halves() {
        let mut t = SysTimer::new(0);
        write_u32(&mut t, REG_CMP_LO, 0x0000_0001);
        write_u32(&mut t, REG_CMP_HI, 0x0000_0001);
        write_u32(&mut t, REG_CTRL, TimerCtrl::ENABLE.bits());
        write_u32(&mut t, REG_CNT_HI, 1);

        t.advance(1);
        assert!(t.pending());
    }

    #[test]
    fn irq_line_follows_pending_and_enable() {
        let plic = Rc::new(RefCell::new(
            Plic::new(PlicConfig::default()).unwrap(),
        ));
        let mut t = SysTimer::new(0);
        t.set_irq(IrqLine::new(&plic, 2));

        write_u32(&mut t, REG_CMP_LO, 2);
        write_u32(&mut t, REG_CTRL, (TimerCtrl::ENABLE | TimerCtrl::IRQ_EN).bits());
        t.advance(2);
        assert_eq!(plic.borrow().pending_bitmap(), 1 << 1);

        // Clearing pending drops the line.
        write_u32(&mut t, REG_STATUS, STATUS_PENDING);
        assert_eq!(plic.borrow().pending_bitmap(), 0);
    }
}
