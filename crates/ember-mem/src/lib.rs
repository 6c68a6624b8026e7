//! Physical memory fabric: sparse byte-addressable DRAM and the system bus
//! that routes physical addresses to RAM or memory-mapped devices.

mod bus;
mod dram;

pub use bus::{Bus, BusRegion, BusStats, Device, DeviceCaps, RegionKind};
pub use dram::Dram;
