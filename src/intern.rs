//! Process-wide symbol interning.
//!
//! Every symbol name maps to exactly one [`Symbol`], created as an
//! undefined placeholder on first lookup. The table is sharded so that
//! files can intern concurrently; ownership fields of each symbol are
//! guarded by a per-symbol mutex, and the feature-request bits
//! (`NEEDS_*`) are atomic so the relocation scan can set them from any
//! thread.

use crate::input::section::SubsecRef;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;

pub const NEEDS_GOT: u8 = 1 << 0;
pub const NEEDS_STUB: u8 = 1 << 1;
pub const NEEDS_THREAD_PTR: u8 = 1 << 2;
pub const NEEDS_RANGE_EXTN_THUNK: u8 = 1 << 3;

/// Which input file a symbol definition lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileId {
    /// still undefined
    None,
    Obj(u32),
    Dylib(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Scope {
    /// input file scope
    Local,
    /// output file scope (non-exported)
    PrivateExtern,
    /// global scope (exported)
    Extern,
}

/// The ownership fields of a symbol, mutated under the symbol's mutex
/// while resolution races are possible.
#[derive(Debug, Clone, Copy)]
pub struct SymbolDef {
    pub file: FileId,
    /// the defining subsection; absolute symbols have none
    pub subsec: Option<SubsecRef>,
    /// offset within `subsec`, or the absolute value
    pub value: u64,
    pub scope: Scope,
    pub is_imported: bool,
    pub is_common: bool,
    pub is_weak: bool,
    pub no_dead_strip: bool,
    pub referenced_dynamically: bool,
}

impl Default for SymbolDef {
    fn default() -> SymbolDef {
        SymbolDef {
            file: FileId::None,
            subsec: None,
            value: 0,
            scope: Scope::Local,
            is_imported: false,
            is_common: false,
            is_weak: false,
            no_dead_strip: false,
            referenced_dynamically: false,
        }
    }
}

#[derive(Debug)]
pub struct Symbol {
    pub name: Arc<str>,
    def: Mutex<SymbolDef>,
    pub flags: AtomicU8,
    /// index into the stubs section, -1 if none
    pub stub_idx: AtomicI32,
    /// index into the GOT, -1 if none
    pub got_idx: AtomicI32,
    /// index into the thread-pointer section, -1 if none
    pub tlv_idx: AtomicI32,
    /// which range-extension thunk serves this symbol, -1 if none
    pub thunk_idx: AtomicI32,
    /// slot within that thunk
    pub thunk_sym_idx: AtomicI32,
}

impl Symbol {
    pub fn new(name: Arc<str>) -> Symbol {
        Symbol {
            name,
            def: Mutex::new(SymbolDef::default()),
            flags: AtomicU8::new(0),
            stub_idx: AtomicI32::new(-1),
            got_idx: AtomicI32::new(-1),
            tlv_idx: AtomicI32::new(-1),
            thunk_idx: AtomicI32::new(-1),
            thunk_sym_idx: AtomicI32::new(-1),
        }
    }

    /// A file-scope symbol record that does not participate in interning.
    pub fn local(name: &str) -> Arc<Symbol> {
        Arc::new(Symbol::new(Arc::from(name)))
    }

    /// Snapshot of the ownership fields.
    pub fn def(&self) -> SymbolDef {
        *self.def.lock()
    }

    /// Runs `f` with the symbol's mutex held.
    pub fn update<R>(&self, f: impl FnOnce(&mut SymbolDef) -> R) -> R {
        f(&mut self.def.lock())
    }

    pub fn set_flags(&self, bits: u8) {
        self.flags.fetch_or(bits, Ordering::Relaxed);
    }

    pub fn has_flag(&self, bit: u8) -> bool {
        self.flags.load(Ordering::Relaxed) & bit != 0
    }

    pub fn stub_idx(&self) -> i32 {
        self.stub_idx.load(Ordering::Relaxed)
    }

    pub fn got_idx(&self) -> i32 {
        self.got_idx.load(Ordering::Relaxed)
    }

    pub fn tlv_idx(&self) -> i32 {
        self.tlv_idx.load(Ordering::Relaxed)
    }

    pub fn is_undefined(&self) -> bool {
        self.def().file == FileId::None
    }
}

const SHARDS: usize = 16;

/// The process-wide name-to-symbol map. Interned strings never move;
/// symbols are handed out as `Arc` so references stay valid while files
/// come and go.
pub struct SymbolTable {
    shards: Vec<Mutex<HashMap<Arc<str>, Arc<Symbol>>>>,
}

impl Default for SymbolTable {
    fn default() -> SymbolTable {
        SymbolTable::new()
    }
}

impl SymbolTable {
    pub fn new() -> SymbolTable {
        SymbolTable {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, name: &str) -> &Mutex<HashMap<Arc<str>, Arc<Symbol>>> {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    /// Returns the unique symbol for `name`, creating an undefined
    /// placeholder on first lookup.
    pub fn get(&self, name: &str) -> Arc<Symbol> {
        let mut shard = self.shard(name).lock();
        if let Some(sym) = shard.get(name) {
            return Arc::clone(sym);
        }
        let name: Arc<str> = Arc::from(name);
        let sym = Arc::new(Symbol::new(Arc::clone(&name)));
        shard.insert(name, Arc::clone(&sym));
        sym
    }

    /// Looks a name up without creating a placeholder.
    pub fn lookup(&self, name: &str) -> Option<Arc<Symbol>> {
        self.shard(name).lock().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_unique() {
        let table = SymbolTable::new();
        let a = table.get("_main");
        let b = table.get("_main");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.is_undefined());
        assert!(table.lookup("_other").is_none());
    }

    #[test]
    fn flags_accumulate() {
        let sym = Symbol::local("_x");
        sym.set_flags(NEEDS_GOT);
        sym.set_flags(NEEDS_STUB);
        assert!(sym.has_flag(NEEDS_GOT));
        assert!(sym.has_flag(NEEDS_STUB));
        assert!(!sym.has_flag(NEEDS_THREAD_PTR));
    }
}
