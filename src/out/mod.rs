//! Everything that occupies the output file: regular output sections fed
//! by input subsections, and the synthetic chunks the linker fabricates
//! (header, stubs, dyld metadata, tables, signature).
//!
//! Each chunk knows how to compute its size and how to copy its bytes
//! into its assigned slice of the output; the layout pass drives both
//! through [`ChunkId`].

use crate::error::{Error, Result};
use crate::input::section::SubsecRef;
use crate::intern::Symbol;
use crate::mach::constants::*;
use crate::mach::load_command::{DataInCodeEntry, Section64, SegmentCommand64};
use crate::mach::symbols::Nlist64;
use crate::util::pack_name;
use parking_lot::{RwLock, RwLockReadGuard};
use std::sync::Arc;

pub mod code_sig;
pub mod data_in_code;
pub mod dyld_info;
pub mod function_starts;
pub mod header;
pub mod section;
pub mod stubs;
pub mod symtab;
pub mod unwind;

/// Identifies a chunk in dispatch tables and segment member lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkId {
    MachHeader,
    Osec(u32),
    Stubs,
    StubHelper,
    UnwindInfo,
    Got,
    LazySymbolPtr,
    ThreadPtrs,
    Rebase,
    Bind,
    LazyBind,
    Export,
    FunctionStarts,
    DataInCode,
    Symtab,
    Strtab,
    CodeSignature,
}

/// The section header every chunk carries, plus linker-side bookkeeping.
/// Hidden chunks occupy the file but are not advertised as sections in
/// their segment's load command.
#[derive(Debug, Clone)]
pub struct ChunkHdr {
    pub sect: Section64,
    pub is_hidden: bool,
    /// 1-based ordinal over all non-hidden sections, for nlist n_sect
    pub sect_idx: u32,
}

impl ChunkHdr {
    pub fn new(segname: &str, sectname: &str, is_hidden: bool) -> ChunkHdr {
        ChunkHdr {
            sect: Section64 {
                sectname: pack_name(sectname),
                segname: pack_name(segname),
                ..Default::default()
            },
            is_hidden,
            sect_idx: 0,
        }
    }

    pub fn segname(&self) -> &str {
        self.sect.segname()
    }

    pub fn sectname(&self) -> &str {
        self.sect.sectname()
    }
}

/// A `__LINKEDIT` blob with no internal structure beyond its bytes.
#[derive(Debug)]
pub struct BlobSection {
    pub hdr: ChunkHdr,
    pub contents: Vec<u8>,
}

impl BlobSection {
    pub fn new(segname: &str, sectname: &str, p2align: u32) -> BlobSection {
        let mut hdr = ChunkHdr::new(segname, sectname, true);
        hdr.sect.align = p2align;
        BlobSection {
            hdr,
            contents: Vec::new(),
        }
    }

    pub fn set_contents(&mut self, contents: Vec<u8>) {
        self.hdr.sect.size = contents.len() as u64;
        self.contents = contents;
    }
}

/// The symbol table chunk; its string bytes live in the separate
/// `__string_table` blob.
#[derive(Debug, Default)]
pub struct SymtabSection {
    pub hdr: ChunkHdr,
    pub nlists: Vec<Nlist64>,
    pub num_locals: u64,
    pub num_globals: u64,
    pub num_undefs: u64,
}

impl SymtabSection {
    pub fn new() -> SymtabSection {
        let mut hdr = ChunkHdr::new(SEG_LINKEDIT, "__symbol_table", true);
        hdr.sect.align = 3;
        SymtabSection {
            hdr,
            nlists: Vec::new(),
            num_locals: 0,
            num_globals: 0,
            num_undefs: 0,
        }
    }
}

impl Default for ChunkHdr {
    fn default() -> ChunkHdr {
        ChunkHdr::new("", "", true)
    }
}

#[derive(Debug)]
pub struct DataInCodeSection {
    pub hdr: ChunkHdr,
    pub entries: Vec<DataInCodeEntry>,
}

impl DataInCodeSection {
    pub fn new() -> DataInCodeSection {
        let mut hdr = ChunkHdr::new(SEG_LINKEDIT, "__data_in_code", true);
        hdr.sect.align = 3;
        DataInCodeSection {
            hdr,
            entries: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct UnwindInfoSection {
    pub hdr: ChunkHdr,
    pub contents: Vec<u8>,
}

impl UnwindInfoSection {
    pub fn new() -> UnwindInfoSection {
        let mut hdr = ChunkHdr::new(SEG_TEXT, "__unwind_info", false);
        hdr.sect.align = 2;
        UnwindInfoSection {
            hdr,
            contents: Vec::new(),
        }
    }
}

/// A range-extension thunk table appended after a window of an
/// executable output section. Entries are `adrp x16; add x16; br x16`.
#[derive(Debug)]
pub struct Thunk {
    /// offset of the table within the owning output section
    pub offset: u64,
    pub syms: Vec<Arc<Symbol>>,
}

pub const THUNK_ENTRY_SIZE: u64 = 12;

impl Thunk {
    pub fn size(&self) -> u64 {
        self.syms.len() as u64 * THUNK_ENTRY_SIZE
    }

    pub fn entry_addr(&self, osec_addr: u64, idx: i32) -> u64 {
        osec_addr + self.offset + idx as u64 * THUNK_ENTRY_SIZE
    }
}

/// A regular output section: an ordered list of input subsections, plus
/// thunk tables on ARM64.
#[derive(Debug)]
pub struct OutputSection {
    pub hdr: ChunkHdr,
    pub members: Vec<SubsecRef>,
    pub thunks: Vec<Thunk>,
}

impl OutputSection {
    pub fn new(segname: &str, sectname: &str) -> OutputSection {
        OutputSection {
            hdr: ChunkHdr::new(segname, sectname, false),
            members: Vec::new(),
            thunks: Vec::new(),
        }
    }
}

// Synthetic chunks own these names; an input section that claims one is
// rejected rather than silently merged.
const RESERVED_NAMES: &[(&str, &str)] = &[
    (SEG_TEXT, "__mach_header"),
    (SEG_TEXT, "__stubs"),
    (SEG_TEXT, "__stub_helper"),
    (SEG_TEXT, "__unwind_info"),
    (SEG_DATA_CONST, "__got"),
    (SEG_DATA, "__la_symbol_ptr"),
    (SEG_DATA, "__thread_ptrs"),
];

/// The registry of regular output sections, concurrently extendable
/// while input files are parsed in parallel.
#[derive(Debug, Default)]
pub struct OsecSet {
    inner: RwLock<Vec<OutputSection>>,
}

impl OsecSet {
    pub fn new() -> OsecSet {
        OsecSet::default()
    }

    /// Finds or creates the output section named `(segname, sectname)`.
    pub fn get_or_create(&self, segname: &str, sectname: &str) -> Result<u32> {
        {
            let osecs = self.inner.read();
            if let Some(idx) = find(&osecs, segname, sectname) {
                return Ok(idx);
            }
        }
        let mut osecs = self.inner.write();
        if let Some(idx) = find(&osecs, segname, sectname) {
            return Ok(idx);
        }
        if RESERVED_NAMES.contains(&(segname, sectname)) {
            return Err(Error::Malformed(format!(
                "reserved section name is used: {},{}",
                segname, sectname
            )));
        }
        osecs.push(OutputSection::new(segname, sectname));
        Ok(osecs.len() as u32 - 1)
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<OutputSection>> {
        self.inner.read()
    }

    pub fn get_mut(&mut self) -> &mut Vec<OutputSection> {
        self.inner.get_mut()
    }
}

fn find(osecs: &[OutputSection], segname: &str, sectname: &str) -> Option<u32> {
    osecs
        .iter()
        .position(|o| o.hdr.segname() == segname && o.hdr.sectname() == sectname)
        .map(|i| i as u32)
}

/// A contiguous range of the address space with uniform protection.
#[derive(Debug)]
pub struct OutputSegment {
    pub cmd: SegmentCommand64,
    /// ordinal as the load command list (and dyld opcodes) see it
    pub seg_idx: u8,
    pub chunks: Vec<ChunkId>,
}

impl OutputSegment {
    pub fn new(name: &str) -> OutputSegment {
        use crate::mach::load_command::LC_SEGMENT_64;
        let mut cmd = SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            segname: pack_name(name),
            ..Default::default()
        };
        let prot = match name {
            SEG_PAGEZERO => 0,
            SEG_TEXT => VM_PROT_READ | VM_PROT_EXECUTE,
            SEG_LINKEDIT => VM_PROT_READ,
            _ => VM_PROT_READ | VM_PROT_WRITE,
        };
        cmd.maxprot = prot;
        cmd.initprot = prot;
        if name == SEG_DATA_CONST {
            cmd.flags = SG_READ_ONLY;
        }
        OutputSegment {
            cmd,
            seg_idx: 0,
            chunks: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn osec_registry_dedups() {
        let set = OsecSet::new();
        let a = set.get_or_create(SEG_TEXT, SECT_TEXT).unwrap();
        let b = set.get_or_create(SEG_TEXT, SECT_TEXT).unwrap();
        let c = set.get_or_create(SEG_DATA, SECT_DATA).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(set.get_or_create(SEG_TEXT, "__stubs").is_err());
    }

    #[test]
    fn segment_protections() {
        assert_eq!(OutputSegment::new(SEG_TEXT).cmd.initprot, VM_PROT_READ | VM_PROT_EXECUTE);
        assert_eq!(OutputSegment::new(SEG_PAGEZERO).cmd.initprot, 0);
        assert_eq!(OutputSegment::new(SEG_DATA_CONST).cmd.flags, SG_READ_ONLY);
        assert_eq!(
            OutputSegment::new(SEG_DATA).cmd.initprot,
            VM_PROT_READ | VM_PROT_WRITE
        );
    }
}
