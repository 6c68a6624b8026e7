use std::collections::VecDeque;

use ember_interrupts::IrqLine;
use ember_mem::{Device, DeviceCaps};
use ember_types::{Error, PhysAddr, Result};
use tracing::trace;

pub const UART_REGION_SIZE: u64 = 16;

const REG_DATA: u64 = 0x00;
const REG_STATUS: u64 = 0x04;
const REG_CTRL: u64 = 0x08;

const STATUS_TX_READY: u32 = 1 << 0;
const STATUS_RX_NONEMPTY: u32 = 1 << 1;
const CTRL_RX_IRQ_EN: u32 = 1 << 0;

/// Byte-oriented serial port.
///
/// DATA reads pull one byte from the RX FIFO (0 when empty); DATA writes
/// hand the byte to the transmit callback. The IRQ sink is held high
/// while RX interrupts are enabled and the FIFO is non-empty.
pub struct Uart {
    base: PhysAddr,
    rx: VecDeque<u8>,
    tx: Option<Box<dyn FnMut(u8)>>,
    ctrl: u32,
    irq: Option<IrqLine>,
}

impl Uart {
    pub fn new(base: PhysAddr) -> Self {
        Self {
            base,
            rx: VecDeque::new(),
            tx: None,
            ctrl: 0,
            irq: None,
        }
    }

    /// Installs the transmit sink. Without one, transmitted bytes are
    /// dropped.
    pub fn set_tx<F: FnMut(u8) + 'static>(&mut self, tx: F) {
        self.tx = Some(Box::new(tx));
    }

    pub fn set_irq(&mut self, irq: IrqLine) {
        self.irq = Some(irq);
    }

    /// Host-side injection of received bytes.
    pub fn push_rx(&mut self, byte: u8) {
        self.rx.push_back(byte);
        self.update_irq();
    }

    pub fn rx_len(&self) -> usize {
        self.rx.len()
    }

    fn rx_irq_enabled(&self) -> bool {
        self.ctrl & CTRL_RX_IRQ_EN != 0
    }

    fn update_irq(&self) {
        if let Some(irq) = &self.irq {
            irq.set_level(self.rx_irq_enabled() && !self.rx.is_empty());
        }
    }

    fn status(&self) -> u32 {
        let mut s = STATUS_TX_READY;
        if !self.rx.is_empty() {
            s |= STATUS_RX_NONEMPTY;
        }
        s
    }
}

impl Device for Uart {
    fn region(&self) -> (PhysAddr, u64) {
        (self.base, UART_REGION_SIZE)
    }

    fn caps(&self) -> DeviceCaps {
        DeviceCaps::aligned(1, &[1, 4])
    }

    fn read(&mut self, offset: u64, count: usize) -> Result<Vec<u8>> {
        match (offset, count) {
            (REG_DATA, 1) => {
                let byte = self.rx.pop_front().unwrap_or(0);
                self.update_irq();
                Ok(vec![byte])
            }
            (REG_STATUS, 4) => Ok(self.status().to_le_bytes().to_vec()),
            (REG_CTRL, 4) => Ok(self.ctrl.to_le_bytes().to_vec()),
            _ => Err(Error::MmioConstraint {
                device: "uart".into(),
                reason: format!("{count}-byte read at offset {offset:#x}"),
            }),
        }
    }

    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        match (offset, bytes.len()) {
            (REG_DATA, 1) => {
                trace!(byte = bytes[0], "uart tx");
                if let Some(tx) = &mut self.tx {
                    tx(bytes[0]);
                }
                Ok(())
            }
            (REG_CTRL, 4) => {
                self.ctrl = u32::from_le_bytes(bytes.try_into().expect("length checked"));
                self.update_irq();
                Ok(())
            }
            // STATUS is read-only.
            _ => Err(Error::MmioConstraint {
                device: "uart".into(),
                reason: format!("{}-byte write at offset {offset:#x}", bytes.len()),
            }),
        }
    }
}
