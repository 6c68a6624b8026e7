use ember_types::PhysAddr;

/// Write-combining buffer: physically-contiguous stores to one cache line
/// coalesce into a single pending burst.
///
/// The buffer holds at most one run. A store that is not the immediate
/// continuation of the run, or that starts on a different line, evicts
/// the run (the caller writes it to the bus) and seeds a new one.
pub struct WriteCombiningBuffer {
    base: Option<PhysAddr>,
    bytes: Vec<u8>,
    line_size: u64,
}

impl WriteCombiningBuffer {
    pub fn new(line_size: u64) -> Self {
        Self {
            base: None,
            bytes: Vec::new(),
            line_size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_none()
    }

    /// Pending run as `(base, bytes)`, without draining it.
    pub fn pending(&self) -> Option<(PhysAddr, &[u8])> {
        self.base.map(|base| (base, self.bytes.as_slice()))
    }

    /// Posts a store. Returns the evicted run the caller must flush to
    /// the bus before the new bytes are considered posted, if any.
    pub fn push(&mut self, pa: PhysAddr, data: &[u8]) -> Option<(PhysAddr, Vec<u8>)> {
        let Some(base) = self.base else {
            self.base = Some(pa);
            self.bytes.extend_from_slice(data);
            return None;
        };

        let contiguous = pa == base + self.bytes.len() as u64;
        let same_line = pa / self.line_size == base / self.line_size;
        if contiguous && same_line {
            self.bytes.extend_from_slice(data);
            return None;
        }

        let evicted = (base, std::mem::take(&mut self.bytes));
        self.base = Some(pa);
        self.bytes.extend_from_slice(data);
        Some(evicted)
    }

    /// Drains the pending run for a memory barrier.
    pub fn take(&mut self) -> Option<(PhysAddr, Vec<u8>)> {
        let base = self.base.take()?;
        Some((base, std::mem::take(&mut self.bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_stores_coalesce() {
        let mut wc = WriteCombiningBuffer::new(64);
        for i in 0..4u64 {
            assert!(wc.push(0x100 + i, &[i as u8]).is_none());
        }
        let (base, bytes) = wc.pending().unwrap();
        assert_eq!(base, 0x100);
        assert_eq!(bytes, &[0, 1, 2, 3]);
    }

    #[test]
    fn non_contiguous_store_evicts_the_run() {
        let mut wc = WriteCombiningBuffer::new(64);
        for i in 0..4u64 {
            wc.push(0x100 + i, &[0xA0 + i as u8]);
        }
        let evicted = wc.push(0x100 + 100, &[0xEE]).unwrap();
        assert_eq!(evicted, (0x100, vec![0xA0, 0xA1, 0xA2, 0xA3]));
        let (base, bytes) = wc.pending().unwrap();
        assert_eq!(base, 0x164);
        assert_eq!(bytes, &[0xEE]);
    }

    #[test]
    fn crossing_the_line_boundary_evicts() {
        let mut wc = WriteCombiningBuffer::new(64);
        wc.push(0x3F, &[1]);
        // 0x40 is contiguous but on the next line.
        let evicted = wc.push(0x40, &[2]).unwrap();
        assert_eq!(evicted, (0x3F, vec![1]));
    }

    #[test]
    fn take_drains_and_resets() {
        let mut wc = WriteCombiningBuffer::new(64);
        assert!(wc.take().is_none());
        wc.push(0x10, &[9, 8]);
        assert_eq!(wc.take(), Some((0x10, vec![9, 8])));
        assert!(wc.is_empty());
        assert!(wc.take().is_none());
    }
}
