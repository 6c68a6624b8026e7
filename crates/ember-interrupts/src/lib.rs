//! Interrupt controllers: a PLIC-style external controller with priority,
//! per-context enables and thresholds, and claim/complete delivery; a
//! RISC-V-style CLINT with per-hart software and timer interrupts; and the
//! `IrqLine` sink devices use to drive controller inputs.

mod clint;
mod plic;

pub use clint::{Clint, IrqLevels, CLINT_REGION_SIZE};
pub use plic::{IrqLine, Plic, PlicConfig, PlicLayout, PlicMode};
