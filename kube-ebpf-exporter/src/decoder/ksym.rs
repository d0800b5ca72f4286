use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::{bail, Result};

/// Kernel symbol lookups against `/proc/kallsyms`.
///
/// The symbol table is read once, on the first lookup. Unknown addresses
/// render as hex and are not remembered.
#[derive(Debug)]
pub struct Ksyms {
    path: PathBuf,
    symbols: OnceLock<HashMap<u64, String>>,
}

impl Ksyms {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            symbols: OnceLock::new(),
        }
    }

    /// Decode a host-order 8-byte address into its symbol name.
    pub fn decode(&self, input: &[u8]) -> Result<String> {
        let Ok(bytes) = <[u8; 8]>::try_from(input) else {
            bail!("kernel address must be 8 bytes, got {}", input.len());
        };
        Ok(self.resolve(u64::from_ne_bytes(bytes)))
    }

    /// Symbol at exactly `addr`, or the address in hex when there is none.
    pub fn resolve(&self, addr: u64) -> String {
        let symbols = self.symbols.get_or_init(|| self.load());
        match symbols.get(&addr) {
            Some(name) => name.clone(),
            None => format!("0x{addr:x}"),
        }
    }

    fn load(&self) -> HashMap<u64, String> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                log::warn!("reading {}: {e}, kernel symbols render as hex", self.path.display());
                return HashMap::new();
            }
        };
        let mut symbols = HashMap::new();
        for line in content.lines() {
            let mut fields = line.split_whitespace();
            let (Some(addr), Some(name)) = (fields.next(), fields.nth(1)) else {
                continue;
            };
            let Ok(addr) = u64::from_str_radix(addr, 16) else {
                continue;
            };
            // Aliases share an address; the first listed name wins.
            symbols.entry(addr).or_insert_with(|| name.to_string());
        }
        log::debug!("loaded {} kernel symbols from {}", symbols.len(), self.path.display());
        symbols
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_addresses_and_falls_back_to_hex() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kallsyms");
        fs::write(
            &path,
            concat!(
                "ffffffff81000000 T _stext\n",
                "ffffffff810a1b20 T vfs_read\n",
                "ffffffff810a1b20 t vfs_read_alias\n",
            ),
        )
        .unwrap();
        let ksyms = Ksyms::new(&path);

        let addr = 0xffffffff810a1b20u64;
        assert_eq!(ksyms.decode(&addr.to_ne_bytes()).unwrap(), "vfs_read");
        assert_eq!(ksyms.resolve(0x1234), "0x1234");
        assert!(ksyms.decode(&[0; 4]).is_err());
    }

    #[test]
    fn symbol_table_is_read_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kallsyms");
        fs::write(&path, "ffffffff81000000 T _stext\nffffffff810a1b20 T vfs_read\n").unwrap();
        let ksyms = Ksyms::new(&path);

        assert_eq!(ksyms.resolve(0xdead), "0xdead");
        fs::remove_file(&path).unwrap();
        // Never looked up before, yet answered from the table loaded above.
        assert_eq!(ksyms.resolve(0xffffffff81000000), "_stext");
        assert_eq!(ksyms.resolve(0xffffffff810a1b20), "vfs_read");
    }

    #[test]
    fn missing_symbol_file_renders_hex() {
        let dir = tempfile::tempdir().unwrap();
        let ksyms = Ksyms::new(dir.path().join("kallsyms"));
        assert_eq!(ksyms.resolve(0xffffffff81000000), "0xffffffff81000000");
    }
}
