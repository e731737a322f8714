//! Address-to-symbol lookup for loaded images.
//!
//! `dladdr` identifies the image and its load base; the image's own symbol
//! table, parsed from disk with `object`, supplies names for the local
//! (non-exported) functions that `dladdr` cannot see.

use crate::types::SymbolInfo;

#[cfg(unix)]
mod symtab {
    use std::collections::HashMap;
    use std::ffi::CStr;
    use std::sync::{Arc, Mutex, OnceLock};

    use log::debug;
    use object::{Object, ObjectSegment, ObjectSymbol, SymbolKind};

    use crate::types::SymbolInfo;

    /// Function symbols of one image, sorted by link-time address.
    pub(super) struct ImageSymbols {
        /// Link-time address of the first mapped byte.
        image_base: u64,
        symbols: Vec<(u64, u64, String)>,
    }

    impl ImageSymbols {
        pub(super) fn parse(data: &[u8]) -> Option<Self> {
            let obj = match object::File::parse(data) {
                Ok(f) => f,
                Err(e) => {
                    debug!("cannot parse image: {}", e);
                    return None;
                }
            };

            let image_base = obj
                .segments()
                .filter(|seg| seg.file_range().1 > 0)
                .map(|seg| seg.address())
                .min()
                .unwrap_or(0);

            let mut symbols = obj
                .symbols()
                .chain(obj.dynamic_symbols())
                .filter(|sym| sym.kind() == SymbolKind::Text && sym.address() != 0)
                .filter_map(|sym| {
                    let name = sym.name().ok().filter(|n| !n.is_empty())?;
                    let name = if obj.format() == object::BinaryFormat::MachO {
                        name.strip_prefix('_').unwrap_or(name)
                    } else {
                        name
                    };
                    Some((sym.address(), sym.size(), name.to_string()))
                })
                .collect::<Vec<_>>();
            symbols.sort_by_key(|(addr, _, _)| *addr);
            symbols.dedup_by_key(|(addr, _, _)| *addr);

            Some(Self { image_base, symbols })
        }

        /// Symbol covering the link-time address `addr`, with the offset into it.
        pub(super) fn lookup(&self, addr: u64) -> Option<(&str, u64)> {
            let idx = self.symbols.partition_point(|(a, _, _)| *a <= addr);
            let (start, size, name) = self.symbols.get(idx.checked_sub(1)?)?;
            let offset = addr - start;
            // Mach-O symbols carry no size; trust the next symbol boundary there.
            if *size != 0 && offset >= *size {
                return None;
            }
            Some((name.as_str(), offset))
        }
    }

    type Cache = Mutex<HashMap<String, Option<Arc<ImageSymbols>>>>;

    fn cache() -> &'static Cache {
        static CACHE: OnceLock<Cache> = OnceLock::new();
        CACHE.get_or_init(|| Mutex::new(HashMap::new()))
    }

    fn load(path: &str) -> Option<Arc<ImageSymbols>> {
        let mut cache = cache().lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = cache.get(path) {
            return entry.clone();
        }
        let data = std::fs::read(path)
            .or_else(|e| {
                debug!("cannot read {}: {}; trying current_exe", path, e);
                std::env::current_exe().and_then(std::fs::read)
            })
            .ok();
        let parsed = data.and_then(|d| ImageSymbols::parse(&d)).map(Arc::new);
        if let Some(syms) = &parsed {
            debug!("loaded {} function symbols from {}", syms.symbols.len(), path);
        }
        cache.insert(path.to_string(), parsed.clone());
        parsed
    }

    fn basename(path: &str) -> &str {
        path.rsplit('/').next().unwrap_or(path)
    }

    pub(super) fn resolve(address: usize) -> Option<SymbolInfo> {
        let mut info: libc::Dl_info = unsafe { core::mem::zeroed() };
        if unsafe { libc::dladdr(address as *const libc::c_void, &mut info) } == 0 || info.dli_fname.is_null() {
            return None;
        }
        let path = unsafe { CStr::from_ptr(info.dli_fname) }.to_string_lossy().into_owned();
        let module = basename(&path).to_string();

        if !info.dli_sname.is_null() && !info.dli_saddr.is_null() && info.dli_saddr as usize <= address {
            let name = unsafe { CStr::from_ptr(info.dli_sname) }.to_string_lossy().into_owned();
            return Some(SymbolInfo {
                name,
                module,
                offset: address - info.dli_saddr as usize,
            });
        }

        let symbols = load(&path)?;
        let link_addr = (address - info.dli_fbase as usize) as u64 + symbols.image_base;
        let (name, offset) = symbols.lookup(link_addr)?;
        Some(SymbolInfo {
            name: name.to_string(),
            module,
            offset: offset as usize,
        })
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn lookup_respects_symbol_bounds() {
            let syms = ImageSymbols {
                image_base: 0,
                symbols: vec![(0x100, 0x20, "first".into()), (0x200, 0, "second".into())],
            };
            assert_eq!(syms.lookup(0x100), Some(("first", 0)));
            assert_eq!(syms.lookup(0x11f), Some(("first", 0x1f)));
            assert_eq!(syms.lookup(0x120), None);
            assert_eq!(syms.lookup(0x280), Some(("second", 0x80)));
            assert_eq!(syms.lookup(0x50), None);
        }

        #[test]
        fn basename_strips_directories() {
            assert_eq!(basename("/usr/lib/libc.so.6"), "libc.so.6");
            assert_eq!(basename("plain"), "plain");
        }
    }
}

/// Name the function containing `address`, if any image claims it.
pub fn resolve_symbol(address: usize) -> Option<SymbolInfo> {
    #[cfg(unix)]
    {
        symtab::resolve(address)
    }
    #[cfg(not(unix))]
    {
        let _ = address;
        None
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[inline(never)]
    fn lookup_target_function(x: u32) -> u32 {
        std::hint::black_box(x) ^ 0x5a5a
    }

    #[test]
    fn resolves_local_function_by_name() {
        let addr = crate::arch::strip_code_ptr(lookup_target_function as fn(u32) -> u32 as usize);
        let info = resolve_symbol(addr).expect("symbol");
        assert!(info.name.contains("lookup_target_function"), "got {}", info.name);
        assert_eq!(info.offset, 0);
        assert!(!info.module.is_empty());
    }

    #[test]
    fn resolves_libc_export() {
        let addr = libc::getpid as usize;
        let info = resolve_symbol(addr).expect("symbol");
        assert!(info.name.contains("getpid"), "got {}", info.name);
    }

    #[test]
    fn heap_address_has_no_symbol() {
        let boxed = Box::new([0u8; 64]);
        assert!(resolve_symbol(boxed.as_ptr() as usize).is_none());
    }
}
