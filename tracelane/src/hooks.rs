//! # Hook registry
//!
//! In-process mapping from `(module path, symbol)` to the stable 64-bit
//! function identifier carried in every event:
//! `function_id = (module_id << 32) | symbol_index`.
//!
//! `module_id` is FNV-1a-32 over the lowercased module path (zero rewritten
//! to a fixed sentinel); `symbol_index` is a 1-based dense counter per
//! module in registration order. The mapping is stable for a session and
//! exported verbatim into the manifest.
//!
//! Registration happens at hook-install time, never on the event hot path,
//! so a mutex-guarded map is fine here.
//!
//! Two module paths hashing to the same `module_id` share one symbol-index
//! namespace; ids stay unique per (module, symbol) but the manifest will
//! list both paths under the same `module_id`. Collision-freedom is not a
//! correctness property of the pipeline.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Mutex;

use tracelane_common::make_function_id;

use crate::writer::{ManifestModule, ManifestSymbol};

/// Sentinel replacing a zero FNV hash so module id 0 stays unused.
const MODULE_ID_SENTINEL: u32 = 0x9e37_79b9;

/// FNV-1a 32-bit over lowercased ASCII.
#[must_use]
pub fn fnv1a32_ci(input: &str) -> u32 {
    const FNV_OFFSET: u32 = 2_166_136_261;
    const FNV_PRIME: u32 = 16_777_619;
    let mut hash = FNV_OFFSET;
    for byte in input.bytes() {
        let byte = byte.to_ascii_lowercase();
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    if hash == 0 {
        MODULE_ID_SENTINEL
    } else {
        hash
    }
}

#[derive(Debug, Default)]
struct ModuleRecord {
    module_id: u32,
    next_index: u32,
    name_to_index: HashMap<String, u32>,
    base_address: u64,
    size: u64,
    uuid: Option<[u8; 16]>,
}

/// Process-wide symbol table for the session.
#[derive(Debug, Default)]
pub struct HookRegistry {
    modules: Mutex<HashMap<String, ModuleRecord>>,
}

impl HookRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or look up) a symbol, returning its function identifier.
    pub fn register_symbol(&self, module_path: &str, symbol: &str) -> u64 {
        let mut modules = self.modules.lock().expect("hook registry poisoned");
        let record = modules.entry(module_path.to_string()).or_default();
        if record.module_id == 0 {
            record.module_id = fnv1a32_ci(module_path);
            record.next_index = 1;
        }
        if let Some(&index) = record.name_to_index.get(symbol) {
            return make_function_id(record.module_id, index);
        }
        let index = record.next_index;
        record.next_index += 1;
        record.name_to_index.insert(symbol.to_string(), index);
        make_function_id(record.module_id, index)
    }

    /// Look up an already registered symbol.
    #[must_use]
    pub fn function_id(&self, module_path: &str, symbol: &str) -> Option<u64> {
        let modules = self.modules.lock().expect("hook registry poisoned");
        let record = modules.get(module_path)?;
        let index = record.name_to_index.get(symbol)?;
        Some(make_function_id(record.module_id, *index))
    }

    #[must_use]
    pub fn module_id(&self, module_path: &str) -> Option<u32> {
        let modules = self.modules.lock().expect("hook registry poisoned");
        modules.get(module_path).map(|r| r.module_id)
    }

    #[must_use]
    pub fn symbol_count(&self, module_path: &str) -> u32 {
        let modules = self.modules.lock().expect("hook registry poisoned");
        modules
            .get(module_path)
            .map_or(0, |r| r.name_to_index.len() as u32)
    }

    /// Attach load metadata to a module (created if unseen).
    pub fn set_module_metadata(
        &self,
        module_path: &str,
        base_address: u64,
        size: u64,
        uuid: Option<[u8; 16]>,
    ) {
        let mut modules = self.modules.lock().expect("hook registry poisoned");
        let record = modules.entry(module_path.to_string()).or_default();
        if record.module_id == 0 {
            record.module_id = fnv1a32_ci(module_path);
            record.next_index = 1;
        }
        record.base_address = base_address;
        record.size = size;
        record.uuid = uuid;
    }

    /// Export the table for the session manifest. Modules sort by path,
    /// symbols by (module_id, symbol_index), so the output is stable.
    #[must_use]
    pub fn export(&self) -> (Vec<ManifestModule>, Vec<ManifestSymbol>) {
        let modules = self.modules.lock().expect("hook registry poisoned");

        let mut module_entries = Vec::with_capacity(modules.len());
        let mut symbol_entries = Vec::new();
        for (path, record) in modules.iter() {
            module_entries.push(ManifestModule {
                module_id: record.module_id,
                path: path.clone(),
                base_address: record.base_address,
                size: record.size,
                uuid: record.uuid.map(format_uuid),
            });
            for (name, &index) in &record.name_to_index {
                symbol_entries.push(ManifestSymbol {
                    function_id: make_function_id(record.module_id, index),
                    module_id: record.module_id,
                    symbol_index: index,
                    name: name.clone(),
                });
            }
        }
        module_entries.sort_by(|a, b| a.path.cmp(&b.path));
        symbol_entries.sort_by_key(|s| (s.module_id, s.symbol_index));
        (module_entries, symbol_entries)
    }
}

/// `550E8400-E29B-41D4-A716-446655440000` style formatting.
fn format_uuid(uuid: [u8; 16]) -> String {
    let mut out = String::with_capacity(36);
    for (i, byte) in uuid.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        let _ = write!(out, "{byte:02X}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracelane_common::split_function_id;

    #[test]
    fn fnv_is_case_insensitive_and_nonzero() {
        assert_eq!(fnv1a32_ci("/usr/lib/LIBC.SO"), fnv1a32_ci("/usr/lib/libc.so"));
        assert_ne!(fnv1a32_ci("a"), 0);
    }

    #[test]
    fn symbol_indices_are_dense_and_one_based() {
        let registry = HookRegistry::new();
        let a = registry.register_symbol("/lib/libm.so", "sin");
        let b = registry.register_symbol("/lib/libm.so", "cos");
        let (module_a, index_a) = split_function_id(a);
        let (module_b, index_b) = split_function_id(b);
        assert_eq!(module_a, module_b);
        assert_eq!(index_a, 1);
        assert_eq!(index_b, 2);
        assert_eq!(registry.symbol_count("/lib/libm.so"), 2);
    }

    #[test]
    fn re_registration_is_idempotent() {
        let registry = HookRegistry::new();
        let first = registry.register_symbol("/bin/app", "main");
        let second = registry.register_symbol("/bin/app", "main");
        assert_eq!(first, second);
        assert_eq!(registry.function_id("/bin/app", "main"), Some(first));
        assert_eq!(registry.function_id("/bin/app", "absent"), None);
    }

    #[test]
    fn module_id_matches_hash_of_lowercased_path() {
        let registry = HookRegistry::new();
        registry.register_symbol("/Lib/Thing.dylib", "f");
        assert_eq!(
            registry.module_id("/Lib/Thing.dylib"),
            Some(fnv1a32_ci("/lib/thing.dylib"))
        );
    }

    #[test]
    fn export_is_sorted_and_carries_metadata() {
        let registry = HookRegistry::new();
        registry.register_symbol("/b.so", "two");
        registry.register_symbol("/a.so", "one");
        registry.set_module_metadata("/a.so", 0x1000, 0x2000, Some([0x55; 16]));

        let (modules, symbols) = registry.export();
        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0].path, "/a.so");
        assert_eq!(modules[0].base_address, 0x1000);
        assert_eq!(
            modules[0].uuid.as_deref(),
            Some("55555555-5555-5555-5555-555555555555")
        );
        assert_eq!(symbols.len(), 2);
        assert_eq!(symbols[0].symbol_index, 1);
    }
}
