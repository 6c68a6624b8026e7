//! Representative peripherals: UART, system timer, DMA engine, and ROM.
//! Each implements the bus `Device` contract and drives an optional
//! `IrqLine` sink.

mod dma;
mod rom;
mod timer;
mod uart;

pub use dma::{DmaCtrl, DmaEngine, DmaStatus, DMA_REGION_SIZE};
pub use rom::Rom;
pub use timer::{SysTimer, TimerCtrl, TIMER_REGION_SIZE};
pub use uart::{Uart, UART_REGION_SIZE};
