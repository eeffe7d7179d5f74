//! Relocatable Mach-O object files: parsing, subsection splitting,
//! compact-unwind extraction.

use crate::arch::Arch;
use crate::error::{Error, Result};
use crate::input::section::{InputSection, Subsection, SubsecRef};
use crate::input::MappedFile;
use crate::intern::{FileId, Scope, Symbol, SymbolTable};
use crate::mach::constants::*;
use crate::mach::header::{MachHeader64, MH_MAGIC_64, MH_SUBSECTIONS_VIA_SYMBOLS};
use crate::mach::load_command::*;
use crate::mach::symbols::*;
use crate::out::OsecSet;
use scroll::Pread;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// One `__LD,__compact_unwind` entry, resolved to linker objects.
#[derive(Debug, Clone)]
pub struct UnwindRecord {
    /// the function's subsection, within the owning object
    pub subsec: u32,
    /// offset of the function within that subsection
    pub offset: u32,
    pub code_len: u32,
    pub encoding: u32,
    pub personality: Option<Arc<Symbol>>,
    /// subsection holding the language-specific data area, if any
    pub lsda: Option<u32>,
    pub lsda_offset: u32,
}

#[derive(Debug)]
pub struct ObjectFile {
    pub mf: MappedFile,
    /// empty unless this member came out of an archive
    pub archive_name: String,
    pub file_idx: u32,
    pub priority: i64,
    pub is_alive: AtomicBool,
    /// entries are None for skipped (debug, compact-unwind) sections so
    /// that section ordinals keep lining up with relocations
    pub sections: Vec<Option<InputSection>>,
    pub subsections: Vec<Subsection>,
    pub nlists: Vec<Nlist64>,
    /// one per nlist; None for stabs
    pub syms: Vec<Option<Arc<Symbol>>>,
    /// the subsection a defined symbol falls into
    pub sym_to_subsec: Vec<Option<u32>>,
    pub unwind_records: Vec<UnwindRecord>,
    pub data_in_code: Vec<DataInCodeEntry>,
    pub has_subsections: bool,
    /// LLVM bitcode member waiting for the LTO plugin
    pub is_lto: bool,
    unwind_sec: Option<Section64>,
}

impl ObjectFile {
    pub fn new(
        mf: MappedFile,
        archive_name: String,
        file_idx: u32,
        priority: i64,
        alive: bool,
    ) -> ObjectFile {
        ObjectFile {
            mf,
            archive_name,
            file_idx,
            priority,
            is_alive: AtomicBool::new(alive),
            sections: Vec::new(),
            subsections: Vec::new(),
            nlists: Vec::new(),
            syms: Vec::new(),
            sym_to_subsec: Vec::new(),
            unwind_records: Vec::new(),
            data_in_code: Vec::new(),
            has_subsections: false,
            is_lto: false,
            unwind_sec: None,
        }
    }

    pub fn data(&self) -> &[u8] {
        self.mf.data()
    }

    pub fn display_name(&self) -> String {
        if self.archive_name.is_empty() {
            self.mf.name.clone()
        } else {
            format!("{}({})", self.archive_name, self.mf.name)
        }
    }

    pub fn alive(&self) -> bool {
        self.is_alive.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn set_alive(&self) {
        self.is_alive.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    /// Binary-searches the subsection covering an input address.
    pub fn find_subsection(&self, addr: u64) -> Option<u32> {
        let idx = self
            .subsections
            .partition_point(|subsec| subsec.input_addr as u64 <= addr);
        if idx == 0 {
            None
        } else {
            Some(idx as u32 - 1)
        }
    }

    pub fn parse<A: Arch>(&mut self, osecs: &OsecSet, symtab: &SymbolTable) -> Result<()> {
        let data = self.data();
        let hdr: MachHeader64 = data.pread_with(0, scroll::LE)?;
        if hdr.magic != MH_MAGIC_64 {
            return Err(Error::BadMagic(hdr.magic as u64));
        }
        if hdr.cputype != A::CPU_TYPE {
            return Err(Error::Malformed(format!(
                "{}: incompatible architecture (expected {})",
                self.display_name(),
                A::NAME
            )));
        }
        let has_subsections = hdr.flags & MH_SUBSECTIONS_VIA_SYMBOLS != 0;

        let mut raw_sections: Vec<Section64> = Vec::new();
        let mut symtab_cmd: Option<SymtabCommand> = None;
        let mut dice_cmd: Option<LinkeditDataCommand> = None;

        let mut off = crate::mach::header::SIZEOF_MACH_HEADER_64;
        for _ in 0..hdr.ncmds {
            let lc: LoadCommandHeader = data.pread_with(off, scroll::LE)?;
            if lc.cmdsize < SIZEOF_LOAD_COMMAND as u32 {
                return Err(Error::Malformed(format!(
                    "{}: truncated load command at {:#x}",
                    self.display_name(),
                    off
                )));
            }
            match lc.cmd {
                LC_SEGMENT_64 => {
                    let seg: SegmentCommand64 = data.pread_with(off, scroll::LE)?;
                    let mut sect_off = off + SIZEOF_SEGMENT_COMMAND_64;
                    for _ in 0..seg.nsects {
                        raw_sections.push(data.pread_with(sect_off, scroll::LE)?);
                        sect_off += SIZEOF_SECTION_64;
                    }
                }
                LC_SYMTAB => symtab_cmd = Some(data.pread_with(off, scroll::LE)?),
                LC_DATA_IN_CODE => dice_cmd = Some(data.pread_with(off, scroll::LE)?),
                LC_DYSYMTAB | LC_BUILD_VERSION | LC_VERSION_MIN_MACOSX | LC_VERSION_MIN_IPHONEOS
                | LC_VERSION_MIN_TVOS | LC_VERSION_MIN_WATCHOS | LC_SOURCE_VERSION
                | LC_LINKER_OPTION | LC_LINKER_OPTIMIZATION_HINT => {
                    log::trace!("{}: skipping {}", self.display_name(), cmd_to_str(lc.cmd));
                }
                cmd => {
                    return Err(Error::Malformed(format!(
                        "{}: unknown load command: {:#x}",
                        self.display_name(),
                        cmd
                    )));
                }
            }
            off += lc.cmdsize as usize;
        }
        self.has_subsections = has_subsections;

        self.init_sections(osecs, &raw_sections)?;
        if let Some(cmd) = symtab_cmd {
            self.init_symbols(symtab, &cmd)?;
        }
        self.split_subsections()?;
        self.assign_syms_to_subsections();
        self.parse_relocations::<A>()?;
        self.parse_compact_unwind()?;

        if let Some(cmd) = dice_cmd {
            let n = cmd.datasize as usize / SIZEOF_DATA_IN_CODE_ENTRY;
            let entries = crate::mach::pod_slice_at::<DataInCodeEntry>(
                self.data(),
                cmd.dataoff as usize,
                n,
            )
            .ok_or_else(|| {
                Error::Malformed(format!(
                    "{}: data-in-code out of bounds",
                    self.display_name()
                ))
            })?
            .into_owned();
            self.data_in_code = entries;
        }
        Ok(())
    }

    fn init_sections(&mut self, osecs: &OsecSet, raw: &[Section64]) -> Result<()> {
        for (i, hdr) in raw.iter().enumerate() {
            let secidx = i as u32 + 1;
            let segname = hdr.segname();
            let sectname = hdr.sectname();

            if segname == "__LD" && sectname == "__compact_unwind" {
                self.unwind_sec = Some(*hdr);
                self.sections.push(None);
                continue;
            }
            // debug info is left for dsymutil; the linker never copies it
            if segname == "__DWARF" || hdr.attrs() & S_ATTR_DEBUG != 0 || sectname == "__eh_frame" {
                self.sections.push(None);
                continue;
            }

            let (out_seg, out_sect) = route_section(segname, sectname);
            let osec = osecs.get_or_create(out_seg, out_sect)?;
            let contents = if hdr.is_zerofill() {
                0..0
            } else {
                let start = hdr.offset as usize;
                let end = start + hdr.size as usize;
                if end > self.data().len() {
                    return Err(Error::Malformed(format!(
                        "{}:{:#x}: section contents out of bounds",
                        self.display_name(),
                        hdr.offset
                    )));
                }
                start..end
            };
            self.sections.push(Some(InputSection {
                hdr: *hdr,
                secidx,
                osec,
                contents,
                rels: Vec::new(),
            }));
        }
        Ok(())
    }

    fn init_symbols(&mut self, symtab: &SymbolTable, cmd: &SymtabCommand) -> Result<()> {
        let data = self.data();
        let mut nlists = Vec::with_capacity(cmd.nsyms as usize);
        let mut off = cmd.symoff as usize;
        for _ in 0..cmd.nsyms {
            let nlist: Nlist64 = data.pread_with(off, scroll::LE)?;
            off += SIZEOF_NLIST_64;
            nlists.push(nlist);
        }

        let mut syms = Vec::with_capacity(nlists.len());
        for nlist in &nlists {
            if nlist.is_stab() {
                syms.push(None);
                continue;
            }
            let name: &str = data
                .pread(cmd.stroff as usize + nlist.n_strx as usize)
                .map_err(|_| {
                    Error::Malformed(format!("{}: bad string table index", self.mf.name))
                })?;
            let sym = if nlist.is_extern() {
                symtab.get(name)
            } else {
                Symbol::local(name)
            };
            syms.push(Some(sym));
        }
        self.nlists = nlists;
        self.syms = syms;
        Ok(())
    }

    /// Splits each input section at the addresses of its externally
    /// addressable symbols, or keeps it whole when the object was not
    /// built with `-subsections-via-symbols` set. C-string sections are
    /// split per literal instead, so identical strings can coalesce.
    fn split_subsections(&mut self) -> Result<()> {
        for si in 0..self.sections.len() {
            let (hdr, contents_range) = match &self.sections[si] {
                Some(isec) => (isec.hdr, isec.contents.clone()),
                None => continue,
            };

            if hdr.sect_type() == S_CSTRING_LITERALS {
                let mut literals: Vec<(usize, usize)> = Vec::new();
                {
                    let contents = &self.data()[contents_range];
                    let mut start = 0usize;
                    while start < contents.len() {
                        let nul = contents[start..]
                            .iter()
                            .position(|&b| b == 0)
                            .map(|p| start + p)
                            .unwrap_or(contents.len() - 1);
                        literals.push((start, nul + 1 - start));
                        start = nul + 1;
                    }
                }
                for (start, size) in literals {
                    let mut subsec = Subsection::new(
                        si as u32,
                        start as u32,
                        size as u32,
                        (hdr.addr as usize + start) as u32,
                        subsec_p2align(&hdr, hdr.addr + start as u64),
                    );
                    subsec.is_cstring = true;
                    self.subsections.push(subsec);
                }
                continue;
            }

            let mut starts: Vec<u64> = vec![hdr.addr];
            if self.has_subsections {
                for nlist in &self.nlists {
                    if nlist.n_type_bits() == N_SECT
                        && nlist.n_sect as u32 == si as u32 + 1
                        && nlist.is_extern()
                        && !nlist.is_alt_entry()
                        && nlist.n_value > hdr.addr
                        && nlist.n_value < hdr.addr + hdr.size
                    {
                        starts.push(nlist.n_value);
                    }
                }
                starts.sort_unstable();
                starts.dedup();
            }

            for (i, &start) in starts.iter().enumerate() {
                let end = starts.get(i + 1).copied().unwrap_or(hdr.addr + hdr.size);
                self.subsections.push(Subsection::new(
                    si as u32,
                    (start - hdr.addr) as u32,
                    (end - start) as u32,
                    start as u32,
                    subsec_p2align(&hdr, start),
                ));
            }
        }
        Ok(())
    }

    fn assign_syms_to_subsections(&mut self) {
        self.sym_to_subsec = vec![None; self.nlists.len()];
        for i in 0..self.nlists.len() {
            let nlist = self.nlists[i];
            if nlist.is_stab() || nlist.n_type_bits() != N_SECT {
                continue;
            }
            let subsec = match self.find_subsection(nlist.n_value) {
                Some(subsec) => subsec,
                None => continue,
            };
            self.sym_to_subsec[i] = Some(subsec);

            // file-scope symbols are not interned, so nobody else will
            // claim them; attach their definitions right away
            if !nlist.is_extern() {
                if let Some(sym) = &self.syms[i] {
                    let value = nlist.n_value - self.subsections[subsec as usize].input_addr as u64;
                    let file = FileId::Obj(self.file_idx);
                    sym.update(|def| {
                        def.file = file;
                        def.subsec = Some(SubsecRef {
                            file: self.file_idx,
                            idx: subsec,
                        });
                        def.value = value;
                        def.scope = Scope::Local;
                        def.is_weak = nlist.is_weak_def();
                        def.no_dead_strip = nlist.no_dead_strip();
                        def.referenced_dynamically = nlist.referenced_dynamically();
                    });
                }
            }
        }
    }

    fn parse_relocations<A: Arch>(&mut self) -> Result<()> {
        for si in 0..self.sections.len() {
            let hdr = match &self.sections[si] {
                Some(isec) if isec.hdr.nreloc > 0 => isec.hdr,
                _ => continue,
            };
            let mut rels = A::parse_relocations(self, &hdr)?;
            rels.sort_by_key(|r| r.offset);

            let lo = self
                .subsections
                .partition_point(|subsec| (subsec.isec as usize) < si);
            let hi = self
                .subsections
                .partition_point(|subsec| subsec.isec as usize <= si);
            let mut refs: Vec<&mut Subsection> =
                self.subsections[lo..hi].iter_mut().collect();
            crate::input::section::partition_relocations(&mut rels, &mut refs);

            self.sections[si].as_mut().unwrap().rels = rels;
        }
        Ok(())
    }

    /// `__LD,__compact_unwind` holds 32-byte records; their relocations
    /// identify the function, the personality routine and the LSDA.
    fn parse_compact_unwind(&mut self) -> Result<()> {
        let hdr = match self.unwind_sec {
            Some(hdr) => hdr,
            None => return Ok(()),
        };
        let nrec = (hdr.size / 32) as usize;
        let data = self.data();

        struct Raw {
            subsec: Option<u32>,
            offset: u32,
            code_len: u32,
            encoding: u32,
            personality: Option<Arc<Symbol>>,
            lsda: Option<u32>,
            lsda_offset: u32,
        }
        let mut raw: Vec<Raw> = Vec::with_capacity(nrec);
        for i in 0..nrec {
            let base = hdr.offset as usize + i * 32;
            raw.push(Raw {
                subsec: None,
                offset: 0,
                code_len: data.pread_with(base + 8, scroll::LE)?,
                encoding: data.pread_with(base + 12, scroll::LE)?,
                personality: None,
                lsda: None,
                lsda_offset: 0,
            });
        }

        let nreloc = hdr.nreloc as usize;
        let relocs = crate::mach::pod_slice_at::<crate::mach::relocation::RelocationInfo>(
            data,
            hdr.reloff as usize,
            nreloc,
        )
        .ok_or_else(|| {
            Error::Malformed(format!(
                "{}: compact-unwind relocations out of bounds",
                self.display_name()
            ))
        })?;

        for r in relocs.iter() {
            let idx = r.r_address as usize / 32;
            if idx >= raw.len() {
                continue;
            }
            let field = r.r_address as usize % 32;
            match field {
                0 => {
                    let (subsec, offset) = self.resolve_unwind_target(r, &hdr)?;
                    raw[idx].subsec = Some(subsec);
                    raw[idx].offset = offset;
                }
                16 => {
                    if !r.r_extern() {
                        return Err(Error::Malformed(format!(
                            "{}: section-relative personality is not supported",
                            self.display_name()
                        )));
                    }
                    raw[idx].personality = self
                        .syms
                        .get(r.r_symbolnum() as usize)
                        .and_then(|s| s.clone());
                }
                24 => {
                    let (subsec, offset) = self.resolve_unwind_target(r, &hdr)?;
                    raw[idx].lsda = Some(subsec);
                    raw[idx].lsda_offset = offset;
                }
                _ => {}
            }
        }

        let mut records: Vec<UnwindRecord> = raw
            .into_iter()
            .map(|r| {
                let subsec = r.subsec.ok_or_else(|| {
                    Error::Malformed(format!(
                        "{}: unwind record with no function",
                        self.display_name()
                    ))
                })?;
                Ok(UnwindRecord {
                    subsec,
                    offset: r.offset,
                    code_len: r.code_len,
                    encoding: r.encoding,
                    personality: r.personality,
                    lsda: r.lsda,
                    lsda_offset: r.lsda_offset,
                })
            })
            .collect::<Result<_>>()?;
        records.sort_by_key(|r| (r.subsec, r.offset));

        // hand each subsection its range of records
        let mut i = 0;
        while i < records.len() {
            let subsec = records[i].subsec;
            let mut j = i + 1;
            while j < records.len() && records[j].subsec == subsec {
                j += 1;
            }
            self.subsections[subsec as usize].unwind_offset = i as u32;
            self.subsections[subsec as usize].nunwind = (j - i) as u32;
            i = j;
        }
        self.unwind_records = records;
        Ok(())
    }

    fn resolve_unwind_target(
        &self,
        r: &crate::mach::relocation::RelocationInfo,
        hdr: &Section64,
    ) -> Result<(u32, u32)> {
        if r.r_extern() {
            let idx = r.r_symbolnum() as usize;
            let subsec = self.sym_to_subsec.get(idx).copied().flatten().ok_or_else(|| {
                Error::Malformed(format!(
                    "{}: unwind relocation against an undefined symbol",
                    self.display_name()
                ))
            })?;
            // the stored value is an addend on top of the symbol
            let addend: u64 = self
                .data()
                .pread_with(hdr.offset as usize + r.r_address as usize, scroll::LE)?;
            let offset = self.nlists[idx].n_value + addend
                - self.subsections[subsec as usize].input_addr as u64;
            Ok((subsec, offset as u32))
        } else {
            let addr: u64 = self
                .data()
                .pread_with(hdr.offset as usize + r.r_address as usize, scroll::LE)?;
            let subsec = self.find_subsection(addr).ok_or_else(|| {
                Error::Malformed(format!(
                    "{}: bad compact-unwind relocation",
                    self.display_name()
                ))
            })?;
            let offset = addr - self.subsections[subsec as usize].input_addr as u64;
            Ok((subsec, offset as u32))
        }
    }

    /// Appends a synthetic zero-filled `__common` subsection of `size`
    /// bytes and returns its index.
    pub fn add_common_subsection(&mut self, osec: u32, size: u64, p2align: u8) -> u32 {
        let si = match self
            .sections
            .iter()
            .position(|s| s.as_ref().map_or(false, |s| s.osec == osec && s.hdr.sect_type() == S_ZEROFILL && s.hdr.sectname() == SECT_COMMON))
        {
            Some(si) => si,
            None => {
                let hdr = Section64 {
                    sectname: crate::util::pack_name(SECT_COMMON),
                    segname: crate::util::pack_name(SEG_DATA),
                    flags: S_ZEROFILL,
                    ..Default::default()
                };
                self.sections.push(Some(InputSection {
                    hdr,
                    secidx: self.sections.len() as u32 + 1,
                    osec,
                    contents: 0..0,
                    rels: Vec::new(),
                }));
                self.sections.len() - 1
            }
        };
        let subsec = Subsection::new(si as u32, 0, size as u32, 0, p2align);
        self.subsections.push(subsec);
        self.subsections.len() as u32 - 1
    }

    /// True if the member implements an Objective-C class or category;
    /// `-ObjC` force-loads such archive members.
    pub fn is_objc_object(&self) -> bool {
        for isec in self.sections.iter().flatten() {
            if isec.hdr.sectname().starts_with("__objc_") {
                return true;
            }
        }
        for (i, sym) in self.syms.iter().enumerate() {
            if let Some(sym) = sym {
                if self.nlists[i].n_type_bits() == N_SECT
                    && sym.name.starts_with("_OBJC_CLASS_$_")
                {
                    return true;
                }
            }
        }
        false
    }
}

/// Sections are routed to output sections by name; a few inputs are
/// renamed on the way so that immutable-after-fixup data lands in
/// `__DATA_CONST` and static initializers join `__text`.
pub fn route_section<'a>(segname: &'a str, sectname: &'a str) -> (&'a str, &'a str) {
    const DATA_CONST_SECTIONS: &[&str] = &[
        "__got",
        "__auth_got",
        "__auth_ptr",
        "__nl_symbol_ptr",
        "__const",
        "__cfstring",
        "__mod_init_func",
        "__mod_term_func",
        "__objc_classlist",
        "__objc_nlclslist",
        "__objc_catlist",
        "__objc_nlcatlist",
        "__objc_protolist",
    ];
    if segname == SEG_DATA && DATA_CONST_SECTIONS.contains(&sectname) {
        (SEG_DATA_CONST, sectname)
    } else if segname == SEG_TEXT && sectname == "__StaticInit" {
        (SEG_TEXT, SECT_TEXT)
    } else {
        (segname, sectname)
    }
}

fn subsec_p2align(hdr: &Section64, addr: u64) -> u8 {
    if addr == hdr.addr || addr == 0 {
        hdr.align as u8
    } else {
        (hdr.align as u8).min(addr.trailing_zeros() as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_routing() {
        assert_eq!(route_section("__DATA", "__got"), ("__DATA_CONST", "__got"));
        assert_eq!(
            route_section("__DATA", "__mod_init_func"),
            ("__DATA_CONST", "__mod_init_func")
        );
        assert_eq!(route_section("__TEXT", "__StaticInit"), ("__TEXT", "__text"));
        assert_eq!(route_section("__DATA", "__data"), ("__DATA", "__data"));
        assert_eq!(route_section("__TEXT", "__cstring"), ("__TEXT", "__cstring"));
    }

    #[test]
    fn find_subsection_picks_covering_entry() {
        let mf = MappedFile::from_vec("test.o".into(), Vec::new());
        let mut obj = ObjectFile::new(mf, String::new(), 0, 0, true);
        obj.subsections.push(Subsection::new(0, 0, 0x10, 0x100, 2));
        obj.subsections.push(Subsection::new(0, 0x10, 0x10, 0x110, 2));
        assert_eq!(obj.find_subsection(0x100), Some(0));
        assert_eq!(obj.find_subsection(0x10f), Some(0));
        assert_eq!(obj.find_subsection(0x110), Some(1));
        assert_eq!(obj.find_subsection(0xff), None);
    }
}
