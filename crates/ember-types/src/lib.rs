//! Shared primitives for the ember simulator: address aliases, the error
//! type every subsystem reports through, and the cache level / access kind
//! tags that show up in error payloads.

use thiserror::Error;

/// Physical address on the simulated fabric.
pub type PhysAddr = u64;
/// Virtual address as seen by guest code.
pub type VirtAddr = u64;
/// Address-space identifier tagging page tables and TLB entries.
pub type Asid = u16;

/// Which cache level an operation targeted. Used for routing and for
/// tagging bus errors that surface through the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheLevel {
    L1d,
    L1i,
    L2,
    L3,
}

impl core::fmt::Display for CacheLevel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            CacheLevel::L1d => "l1d",
            CacheLevel::L1i => "l1i",
            CacheLevel::L2 => "l2",
            CacheLevel::L3 => "l3",
        };
        f.write_str(s)
    }
}

/// Kind of guest access, for permission checks and error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

impl core::fmt::Display for AccessKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            AccessKind::Read => "read",
            AccessKind::Write => "write",
            AccessKind::Execute => "execute",
        };
        f.write_str(s)
    }
}

/// Simulator-wide error type.
///
/// Errors are raised synchronously at the point of violation and are never
/// retried by the core. Statistics counters incremented before a failure
/// stay incremented.
#[derive(Debug, Error)]
pub enum Error {
    /// DRAM or bus transfer escaping the backing region.
    #[error("access violation: {len} bytes at {addr:#x} (region size {size:#x})")]
    AccessViolation { addr: PhysAddr, len: usize, size: u64 },

    /// Bus address with no covering region.
    #[error("unmapped physical address {addr:#x}")]
    Unmapped { addr: PhysAddr },

    /// Attempt to register a region intersecting an existing one.
    #[error("region {name:?} at {base:#x}+{size:#x} overlaps an existing region")]
    Overlap { name: String, base: PhysAddr, size: u64 },

    /// Strict-mode MMIO access violating a device's declared caps.
    #[error("mmio constraint on {device:?}: {reason}")]
    MmioConstraint { device: String, reason: String },

    /// Translation of a virtual address with no present PTE.
    #[error("page fault: asid {asid} va {vaddr:#x}")]
    PageFault { asid: Asid, vaddr: VirtAddr },

    /// Access denied by PTE permission bits.
    #[error("permission denied: {access} at va {vaddr:#x}")]
    PermissionDenied { vaddr: VirtAddr, access: AccessKind },

    /// The MMU frame pool is exhausted.
    #[error("out of physical frames")]
    OutOfFrames,

    /// The boot allocator is exhausted.
    #[error("out of memory")]
    OutOfMemory,

    /// Write to a read-only target (strict ROM, READ_ONLY variable).
    #[error("read-only: {what}")]
    ReadOnly { what: String },

    /// Invalid construction-time configuration.
    #[error("bad config: {0}")]
    BadConfig(String),

    /// Device-specific failure.
    #[error("device {device:?}: {reason}")]
    Device { device: String, reason: String },

    /// A bus error observed during a cache fill, writeback, or prefetch,
    /// tagged with the level and block address that triggered it.
    #[error("cache {level} at block {block:#x}: {source}")]
    Cache {
        level: CacheLevel,
        block: PhysAddr,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wraps a bus-level error with the cache level and block address that
    /// was being filled or written back when it occurred.
    pub fn in_cache(self, level: CacheLevel, block: PhysAddr) -> Self {
        Error::Cache {
            level,
            block,
            source: Box::new(self),
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
