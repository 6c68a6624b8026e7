use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use bitflags::bitflags;
use ember_types::{Error, Result};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VarAttrs: u32 {
        /// Persisted by `save`; volatile variables are not written out.
        const NON_VOLATILE = 1 << 0;
        /// Rejects later `set` and `delete`.
        const READ_ONLY = 1 << 1;
    }
}

#[derive(Debug, Clone)]
struct Variable {
    attrs: VarAttrs,
    data: Vec<u8>,
}

/// Runtime variable store keyed by `(guid, name)`.
///
/// The persistence format is line-oriented: `hex(attr)` TAB `guid` TAB
/// `name` TAB `hex(bytes)`, one variable per line. Only non-volatile
/// variables are written; `load` accepts the same format back.
#[derive(Default)]
pub struct VarStore {
    vars: BTreeMap<(String, String), Variable>,
}

impl VarStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Creates or replaces a variable. Replacing a READ_ONLY variable
    /// fails.
    pub fn set(&mut self, guid: &str, name: &str, attrs: VarAttrs, data: &[u8]) -> Result<()> {
        let key = (guid.to_string(), name.to_string());
        if let Some(existing) = self.vars.get(&key) {
            if existing.attrs.contains(VarAttrs::READ_ONLY) {
                return Err(Error::ReadOnly {
                    what: format!("variable {guid}/{name}"),
                });
            }
        }
        self.vars.insert(
            key,
            Variable {
                attrs,
                data: data.to_vec(),
            },
        );
        Ok(())
    }

    pub fn get(&self, guid: &str, name: &str) -> Option<(VarAttrs, &[u8])> {
        self.vars
            .get(&(guid.to_string(), name.to_string()))
            .map(|v| (v.attrs, v.data.as_slice()))
    }

    pub fn delete(&mut self, guid: &str, name: &str) -> Result<()> {
        let key = (guid.to_string(), name.to_string());
        match self.vars.get(&key) {
            Some(v) if v.attrs.contains(VarAttrs::READ_ONLY) => Err(Error::ReadOnly {
                what: format!("variable {guid}/{name}"),
            }),
            Some(_) => {
                self.vars.remove(&key);
                Ok(())
            }
            None => Err(Error::Device {
                device: "varstore".into(),
                reason: format!("no such variable {guid}/{name}"),
            }),
        }
    }

    /// Keys in `(guid, name)` order.
    pub fn list(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.keys().map(|(g, n)| (g.as_str(), n.as_str()))
    }

    /// Writes non-volatile variables, one record per line.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut out = String::new();
        for ((guid, name), var) in &self.vars {
            if !var.attrs.contains(VarAttrs::NON_VOLATILE) {
                continue;
            }
            out.push_str(&format!(
                "{:x}\t{}\t{}\t{}\n",
                var.attrs.bits(),
                guid,
                name,
                hex_encode(&var.data)
            ));
        }
        fs::write(path, out).map_err(|e| store_error(format!("write {path:?}: {e}")))
    }

    /// Loads records produced by `save`, replacing matching keys.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        let text =
            fs::read_to_string(path).map_err(|e| store_error(format!("read {path:?}: {e}")))?;
        for (lineno, line) in text.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            let mut fields = line.splitn(4, '\t');
            let (Some(attr), Some(guid), Some(name), Some(data)) = (
                fields.next(),
                fields.next(),
                fields.next(),
                fields.next(),
            ) else {
                return Err(store_error(format!("line {}: malformed record", lineno + 1)));
            };
            let attrs = u32::from_str_radix(attr, 16)
                .map_err(|_| store_error(format!("line {}: bad attributes", lineno + 1)))?;
            let data = hex_decode(data)
                .ok_or_else(|| store_error(format!("line {}: bad hex payload", lineno + 1)))?;
            self.vars.insert(
                (guid.to_string(), name.to_string()),
                Variable {
                    attrs: VarAttrs::from_bits_truncate(attrs),
                    data,
                },
            );
        }
        Ok(())
    }
}

fn store_error(reason: String) -> Error {
    Error::Device {
        device: "varstore".into(),
        reason,
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUID: &str = "8be4df61-93ca-11d2-aa0d-00e098032b8c";

    #[test]
    fn set_get_delete_round_trip() {
        let mut store = VarStore::new();
        store
            .set(GUID, "BootOrder", VarAttrs::NON_VOLATILE, &[0, 1])
            .unwrap();
        let (attrs, data) = store.get(GUID, "BootOrder").unwrap();
        assert_eq!(attrs, VarAttrs::NON_VOLATILE);
        assert_eq!(data, &[0, 1]);

        store.delete(GUID, "BootOrder").unwrap();
        assert!(store.get(GUID, "BootOrder").is_none());
        assert!(store.delete(GUID, "BootOrder").is_err());
    }

    #[test]
    fn read_only_variables_refuse_updates() {
        let mut store = VarStore::new();
        store
            .set(GUID, "PlatformLang", VarAttrs::READ_ONLY, b"en")
            .unwrap();
        assert!(matches!(
            store.set(GUID, "PlatformLang", VarAttrs::empty(), b"de"),
            Err(Error::ReadOnly { .. })
        ));
        assert!(matches!(
            store.delete(GUID, "PlatformLang"),
            Err(Error::ReadOnly { .. })
        ));
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[test]
    fn save_persists_only_non_volatile_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vars.tsv");

        let mut store = VarStore::new();
        store
            .set(GUID, "Timeout", VarAttrs::NON_VOLATILE, &[5])
            .unwrap();
        store.set(GUID, "Scratch", VarAttrs::empty(), &[9]).unwrap();
        store.save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, format!("1\t{GUID}\tTimeout\t05\n"));

        let mut restored = VarStore::new();
        restored.load(&path).unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(
            restored.get(GUID, "Timeout").unwrap(),
            (VarAttrs::NON_VOLATILE, &[5u8][..])
        );
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[test]
    fn load_rejects_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vars.tsv");
        std::fs::write(&path, "1\tonly-two-fields\n").unwrap();

        let mut store = VarStore::new();
        assert!(store.load(&path).is_err());

        std::fs::write(&path, format!("1\t{GUID}\tX\tzz\n")).unwrap();
        assert!(store.load(&path).is_err());
    }

    #[test]
    fn hex_codec_round_trips() {
        let data = vec![0x00, 0xFF, 0x5A];
        assert_eq!(hex_encode(&data), "00ff5a");
        assert_eq!(hex_decode("00ff5a").unwrap(), data);
        assert!(hex_decode("0f0").is_none());
        assert!(hex_decode("zz").is_none());
    }
}
