use ember_mem::{Device, DeviceCaps};
use ember_types::{Error, PhysAddr, Result};

/// Read-only memory backed by a fixed image. Reads past the image but
/// inside the region return zeros. Strict ROMs error on writes;
/// non-strict ones silently drop them.
pub struct Rom {
    base: PhysAddr,
    image: Vec<u8>,
    strict: bool,
}

impl Rom {
    pub fn new(base: PhysAddr, image: Vec<u8>, strict: bool) -> Self {
        Self {
            base,
            image,
            strict,
        }
    }
}

impl Device for Rom {
    fn region(&self) -> (PhysAddr, u64) {
        (self.base, self.image.len() as u64)
    }

    fn caps(&self) -> DeviceCaps {
        DeviceCaps::any()
    }

    fn read(&mut self, offset: u64, count: usize) -> Result<Vec<u8>> {
        let off = offset as usize;
        let mut out = vec![0u8; count];
        if off < self.image.len() {
            let take = count.min(self.image.len() - off);
            out[..take].copy_from_slice(&self.image[off..off + take]);
        }
        Ok(out)
    }

    fn write(&mut self, _offset: u64, _bytes: &[u8]) -> Result<()> {
        if self.strict {
            Err(Error::ReadOnly { what: "rom".into() })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_return_image_bytes() {
        let mut rom = Rom::new(0x1000, vec![0xCC, 0xDD, 0x00, 0x00], true);
        assert_eq!(rom.region(), (0x1000, 4));
        assert_eq!(rom.read(0, 2).unwrap(), vec![0xCC, 0xDD]);
    }

    #[test]
    fn strict_rom_rejects_writes() {
        let mut rom = Rom::new(0, vec![0; 8], true);
        assert!(matches!(
            rom.write(0, &[1]),
            Err(Error::ReadOnly { .. })
        ));
    }

    #[test]
    fn relaxed_rom_drops_writes() {
        let mut rom = Rom::new(0, vec![7; 8], false);
        rom.write(0, &[1]).unwrap();
        assert_eq!(rom.read(0, 1).unwrap(), vec![7]);
    }
}
