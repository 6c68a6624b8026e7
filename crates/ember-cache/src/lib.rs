//! Multi-level inclusive write-back cache controller.
//!
//! Four levels (L1D, L1I, L2, L3) sit between the CPU front-end and the
//! system bus. Lines are addressed by `(level, set, way)` indices rather
//! than references, so the recursive eviction drain (L3 evicts, the L2
//! child drains its L1s, merged bytes go to memory) needs no re-entrant
//! borrows. Parents track which children hold a block via presence bits;
//! victim choice prefers lines no child is using.

mod controller;

pub use controller::{CacheController, CacheLevelConfig, CacheConfig, LevelStats};
pub use ember_types::CacheLevel;
