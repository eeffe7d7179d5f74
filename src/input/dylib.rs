//! Dynamic library stubs: the linker never maps a dylib's code, only its
//! identity and exported-name sets, taken either from a real `.dylib`
//! binary or from a `.tbd` text stub.

use crate::error::{Error, Result};
use crate::input::MappedFile;
use crate::intern::{Symbol, SymbolTable};
use crate::mach::constants::EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION;
use crate::mach::header::{MachHeader64, MH_DYLIB, MH_DYLIB_STUB, MH_MAGIC_64};
use crate::mach::load_command::*;
use crate::tbd::TextDylib;
use crate::util::read_uleb;
use scroll::Pread;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Debug)]
pub struct DylibFile {
    pub filename: String,
    pub file_idx: u32,
    pub priority: i64,
    pub install_name: String,
    /// load-command ordinal as dyld sees it; assigned at output time
    pub dylib_idx: i64,
    /// still part of the output after unused-dylib stripping
    pub is_alive: AtomicBool,
    /// some referenced symbol resolved into this dylib and is used
    pub is_needed: AtomicBool,
    pub is_reexported: bool,
    pub is_weak: bool,
    /// `-needed-l` / `-needed_framework` pin the load command
    pub is_forced_needed: bool,
    pub reexported_libs: Vec<String>,
    /// exported names with their weak-definition flag
    pub exports: Vec<(String, bool)>,
    /// interned counterparts of `exports`, same order
    pub syms: Vec<Arc<Symbol>>,
}

impl DylibFile {
    fn empty(filename: String, file_idx: u32, priority: i64) -> DylibFile {
        DylibFile {
            filename,
            file_idx,
            priority,
            install_name: String::new(),
            dylib_idx: 0,
            is_alive: AtomicBool::new(true),
            is_needed: AtomicBool::new(false),
            is_reexported: false,
            is_weak: false,
            is_forced_needed: false,
            reexported_libs: Vec::new(),
            exports: Vec::new(),
            syms: Vec::new(),
        }
    }

    /// Builds a stub from a compiled dylib by walking its export trie.
    pub fn from_binary(mf: &MappedFile, file_idx: u32, priority: i64) -> Result<DylibFile> {
        let data = mf.data();
        let hdr: MachHeader64 = data.pread_with(0, scroll::LE)?;
        if hdr.magic != MH_MAGIC_64 {
            return Err(Error::BadMagic(hdr.magic as u64));
        }
        if hdr.filetype != MH_DYLIB && hdr.filetype != MH_DYLIB_STUB {
            return Err(Error::Malformed(format!(
                "{}: not a dylib",
                mf.name
            )));
        }

        let mut dylib = DylibFile::empty(mf.name.clone(), file_idx, priority);
        let mut trie: Option<(usize, usize)> = None;

        let mut off = crate::mach::header::SIZEOF_MACH_HEADER_64;
        for _ in 0..hdr.ncmds {
            let lc: LoadCommandHeader = data.pread_with(off, scroll::LE)?;
            match lc.cmd {
                LC_ID_DYLIB => {
                    let cmd: DylibCommand = data.pread_with(off, scroll::LE)?;
                    dylib.install_name = data.pread::<&str>(off + cmd.dylib.name as usize)?.to_string();
                }
                LC_REEXPORT_DYLIB => {
                    let cmd: DylibCommand = data.pread_with(off, scroll::LE)?;
                    let name: &str = data.pread(off + cmd.dylib.name as usize)?;
                    dylib.reexported_libs.push(name.to_string());
                }
                LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                    let cmd: DyldInfoCommand = data.pread_with(off, scroll::LE)?;
                    if cmd.export_size > 0 {
                        trie = Some((cmd.export_off as usize, cmd.export_size as usize));
                    }
                }
                LC_DYLD_EXPORTS_TRIE => {
                    let cmd: LinkeditDataCommand = data.pread_with(off, scroll::LE)?;
                    if cmd.datasize > 0 {
                        trie = Some((cmd.dataoff as usize, cmd.datasize as usize));
                    }
                }
                _ => {}
            }
            off += lc.cmdsize as usize;
        }

        if let Some((trie_off, trie_size)) = trie {
            let trie_data = data.get(trie_off..trie_off + trie_size).ok_or_else(|| {
                Error::Malformed(format!("{}: export trie out of bounds", mf.name))
            })?;
            let mut exports = Vec::new();
            read_trie(trie_data, 0, String::new(), &mut exports)
                .ok_or_else(|| Error::Malformed(format!("{}: bad export trie", mf.name)))?;
            for (name, flags) in exports {
                dylib
                    .exports
                    .push((name, flags & EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION != 0));
            }
        }

        if dylib.install_name.is_empty() {
            dylib.install_name = mf.name.clone();
        }
        Ok(dylib)
    }

    /// Builds a stub from a parsed `.tbd` document.
    pub fn from_tbd(tbd: TextDylib, filename: String, file_idx: u32, priority: i64) -> DylibFile {
        let mut dylib = DylibFile::empty(filename, file_idx, priority);
        dylib.install_name = tbd.install_name;
        dylib.reexported_libs = tbd.reexported_libs;
        for name in tbd.exports {
            dylib.exports.push((name, false));
        }
        for name in tbd.weak_exports {
            dylib.exports.push((name, true));
        }
        dylib
    }

    /// Interns every exported name so resolution can claim them.
    pub fn intern_exports(&mut self, symtab: &SymbolTable) {
        self.syms = self
            .exports
            .iter()
            .map(|(name, _)| symtab.get(name))
            .collect();
    }

    pub fn alive(&self) -> bool {
        self.is_alive.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn needed(&self) -> bool {
        self.is_needed.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn set_needed(&self) {
        self.is_needed.store(true, std::sync::atomic::Ordering::Relaxed);
    }
}

/// Depth-first walk of a serialized export trie, collecting
/// `(name, flags)` leaves. Returns None on malformed input.
fn read_trie(data: &[u8], pos: usize, prefix: String, out: &mut Vec<(String, u32)>) -> Option<()> {
    let mut p = pos;
    let info_size = read_uleb(data, &mut p)? as usize;
    if info_size > 0 {
        let mut q = p;
        let flags = read_uleb(data, &mut q)?;
        out.push((prefix.clone(), flags as u32));
    }
    p += info_size;

    let nedges = *data.get(p)?;
    p += 1;
    for _ in 0..nedges {
        let label_end = data[p..].iter().position(|&b| b == 0)? + p;
        let label = core::str::from_utf8(&data[p..label_end]).ok()?;
        p = label_end + 1;
        let child = read_uleb(data, &mut p)? as usize;
        read_trie(data, child, format!("{}{}", prefix, label), out)?;
    }
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::encode_uleb;

    // hand-assembled trie exporting "_a" (regular) and "_ab" (weak)
    fn tiny_trie() -> Vec<u8> {
        let mut buf = Vec::new();
        // node 0: no payload, one edge "_a" -> node at `a_off`
        buf.push(0); // info size
        buf.push(1); // edge count
        buf.extend(b"_a\0");
        let fixup_a = buf.len();
        buf.push(0); // child offset patched below

        let a_off = buf.len();
        // node _a: leaf (flags 0, addr 0x10), one edge "b"
        buf.push(2);
        encode_uleb(&mut buf, 0);
        encode_uleb(&mut buf, 0x10);
        buf.push(1);
        buf.extend(b"b\0");
        let fixup_b = buf.len();
        buf.push(0);

        let b_off = buf.len();
        // node _ab: weak leaf, no edges
        buf.push(2);
        encode_uleb(&mut buf, EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION as u64);
        encode_uleb(&mut buf, 0x20);
        buf.push(0);

        buf[fixup_a] = a_off as u8;
        buf[fixup_b] = b_off as u8;
        buf
    }

    #[test]
    fn trie_walk() {
        let trie = tiny_trie();
        let mut out = Vec::new();
        read_trie(&trie, 0, String::new(), &mut out).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].0, "_a");
        assert_eq!(out[0].1, 0);
        assert_eq!(out[1].0, "_ab");
        assert_eq!(out[1].1, EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION);
    }
}
