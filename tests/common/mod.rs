//! Shared helpers: an in-memory Mach-O object builder to synthesize
//! linker inputs, and readers to inspect the linked image.

#![allow(dead_code)]

use machld::mach::header::*;
use machld::mach::load_command::*;
use machld::mach::symbols::*;
use machld::opt::LinkOptions;
use machld::util::align_to_usize;
use scroll::{Pread, Pwrite};

pub struct SectionSpec {
    pub segname: &'static str,
    pub sectname: &'static str,
    pub flags: u32,
    pub align: u32,
    pub data: Vec<u8>,
    /// (offset, packed r_info)
    pub relocs: Vec<(u32, u32)>,
}

impl SectionSpec {
    pub fn text(data: Vec<u8>) -> SectionSpec {
        SectionSpec {
            segname: "__TEXT",
            sectname: "__text",
            flags: machld::mach::constants::S_ATTR_PURE_INSTRUCTIONS
                | machld::mach::constants::S_ATTR_SOME_INSTRUCTIONS,
            align: 2,
            data,
            relocs: Vec::new(),
        }
    }

    pub fn data(data: Vec<u8>) -> SectionSpec {
        SectionSpec {
            segname: "__DATA",
            sectname: "__data",
            flags: 0,
            align: 3,
            data,
            relocs: Vec::new(),
        }
    }
}

pub struct SymSpec {
    pub name: String,
    /// 1-based section ordinal, 0 for undefined
    pub sect: u8,
    /// offset within that section
    pub offset: u64,
    pub n_type: u8,
    pub n_desc: u16,
}

impl SymSpec {
    pub fn global(name: &str, sect: u8, offset: u64) -> SymSpec {
        SymSpec {
            name: name.to_string(),
            sect,
            offset,
            n_type: N_SECT | N_EXT,
            n_desc: 0,
        }
    }

    pub fn undef(name: &str) -> SymSpec {
        SymSpec {
            name: name.to_string(),
            sect: 0,
            offset: 0,
            n_type: N_UNDF | N_EXT,
            n_desc: 0,
        }
    }
}

/// Packs the bitfields of a relocation entry.
pub fn r_info(symbolnum: u32, pcrel: bool, length: u8, is_extern: bool, ty: u8) -> u32 {
    symbolnum
        | (pcrel as u32) << 24
        | (length as u32) << 25
        | (is_extern as u32) << 27
        | (ty as u32) << 28
}

pub struct ObjBuilder {
    pub cputype: u32,
    pub sections: Vec<SectionSpec>,
    pub syms: Vec<SymSpec>,
    pub subsections_via_symbols: bool,
}

impl ObjBuilder {
    pub fn arm64() -> ObjBuilder {
        ObjBuilder {
            cputype: machld::mach::cputype::CPU_TYPE_ARM64,
            sections: Vec::new(),
            syms: Vec::new(),
            subsections_via_symbols: true,
        }
    }

    pub fn x86_64() -> ObjBuilder {
        ObjBuilder {
            cputype: machld::mach::cputype::CPU_TYPE_X86_64,
            sections: Vec::new(),
            syms: Vec::new(),
            subsections_via_symbols: true,
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let nsects = self.sections.len();
        let seg_cmdsize = SIZEOF_SEGMENT_COMMAND_64 + nsects * SIZEOF_SECTION_64;
        let cmds_size = seg_cmdsize + SIZEOF_SYMTAB_COMMAND;
        let contents_base = SIZEOF_MACH_HEADER_64 + cmds_size;

        // place section contents, then relocations, then the symbol and
        // string tables
        let mut offset = contents_base;
        let mut addr = 0u64;
        let mut placed: Vec<(usize, u64)> = Vec::new(); // (file offset, vmaddr)
        for sec in &self.sections {
            offset = align_to_usize(offset, 1 << sec.align);
            addr = machld::util::align_to(addr, 1 << sec.align);
            placed.push((offset, addr));
            offset += sec.data.len();
            addr += sec.data.len() as u64;
        }

        let mut reloff_of: Vec<usize> = Vec::new();
        offset = align_to_usize(offset, 8);
        for sec in &self.sections {
            reloff_of.push(offset);
            offset += sec.relocs.len() * 8;
        }

        let symoff = align_to_usize(offset, 8);
        let nsyms = self.syms.len();
        let stroff = symoff + nsyms * SIZEOF_NLIST_64;
        let mut strtab: Vec<u8> = vec![0];
        let mut stroffs: Vec<u32> = Vec::new();
        for sym in &self.syms {
            stroffs.push(strtab.len() as u32);
            strtab.extend_from_slice(sym.name.as_bytes());
            strtab.push(0);
        }
        let total = stroff + strtab.len();

        let mut buf = vec![0u8; total];
        let hdr = MachHeader64 {
            magic: MH_MAGIC_64,
            cputype: self.cputype,
            cpusubtype: 0,
            filetype: MH_OBJECT,
            ncmds: 2,
            sizeofcmds: cmds_size as u32,
            flags: if self.subsections_via_symbols {
                MH_SUBSECTIONS_VIA_SYMBOLS
            } else {
                0
            },
            reserved: 0,
        };
        buf.pwrite_with(hdr, 0, scroll::LE).unwrap();

        let seg = SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: seg_cmdsize as u32,
            segname: machld::util::pack_name(""),
            vmaddr: 0,
            vmsize: addr,
            fileoff: contents_base as u64,
            filesize: (offset - contents_base) as u64,
            maxprot: 7,
            initprot: 7,
            nsects: nsects as u32,
            flags: 0,
        };
        buf.pwrite_with(seg, SIZEOF_MACH_HEADER_64, scroll::LE).unwrap();

        for (i, sec) in self.sections.iter().enumerate() {
            let sect = Section64 {
                sectname: machld::util::pack_name(sec.sectname),
                segname: machld::util::pack_name(sec.segname),
                addr: placed[i].1,
                size: sec.data.len() as u64,
                offset: placed[i].0 as u32,
                align: sec.align,
                reloff: if sec.relocs.is_empty() {
                    0
                } else {
                    reloff_of[i] as u32
                },
                nreloc: sec.relocs.len() as u32,
                flags: sec.flags,
                reserved1: 0,
                reserved2: 0,
                reserved3: 0,
            };
            buf.pwrite_with(
                sect,
                SIZEOF_MACH_HEADER_64 + SIZEOF_SEGMENT_COMMAND_64 + i * SIZEOF_SECTION_64,
                scroll::LE,
            )
            .unwrap();
        }

        let symtab = SymtabCommand {
            cmd: LC_SYMTAB,
            cmdsize: SIZEOF_SYMTAB_COMMAND as u32,
            symoff: symoff as u32,
            nsyms: nsyms as u32,
            stroff: stroff as u32,
            strsize: strtab.len() as u32,
        };
        buf.pwrite_with(symtab, SIZEOF_MACH_HEADER_64 + seg_cmdsize, scroll::LE)
            .unwrap();

        for (i, sec) in self.sections.iter().enumerate() {
            buf[placed[i].0..placed[i].0 + sec.data.len()].copy_from_slice(&sec.data);
            for (k, (roff, rinfo)) in sec.relocs.iter().enumerate() {
                buf.pwrite_with(*roff as i32, reloff_of[i] + k * 8, scroll::LE)
                    .unwrap();
                buf.pwrite_with(*rinfo, reloff_of[i] + k * 8 + 4, scroll::LE)
                    .unwrap();
            }
        }

        for (i, sym) in self.syms.iter().enumerate() {
            let n_value = if sym.sect == 0 {
                0
            } else {
                placed[sym.sect as usize - 1].1 + sym.offset
            };
            let nlist = Nlist64 {
                n_strx: stroffs[i],
                n_type: sym.n_type,
                n_sect: sym.sect,
                n_desc: sym.n_desc,
                n_value,
            };
            buf.pwrite_with(nlist, symoff + i * SIZEOF_NLIST_64, scroll::LE)
                .unwrap();
        }
        buf[stroff..stroff + strtab.len()].copy_from_slice(&strtab);
        buf
    }
}

/// A minimal libSystem text stub for the given architecture.
pub fn libsystem_tbd(arch: &str, symbols: &[&str], weak_symbols: &[&str]) -> String {
    let quote = |list: &[&str]| {
        list.iter()
            .map(|s| format!("'{}'", s))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let mut tbd = format!(
        "--- !tapi-tbd\n\
         tbd-version: 4\n\
         targets: [ {arch}-macos ]\n\
         install-name: '/usr/lib/libSystem.B.dylib'\n\
         exports:\n\
         \x20\x20- targets: [ {arch}-macos ]\n\
         \x20\x20\x20\x20symbols: [ 'dyld_stub_binder'{}{} ]\n",
        if symbols.is_empty() { "" } else { ", " },
        quote(symbols),
    );
    if !weak_symbols.is_empty() {
        tbd.push_str(&format!(
            "\x20\x20\x20\x20weak-symbols: [ {} ]\n",
            quote(weak_symbols)
        ));
    }
    tbd.push_str("...\n");
    tbd
}

pub fn base_opts(output: &str, executable: bool) -> LinkOptions {
    let mut opts = LinkOptions::default();
    opts.output = output.to_string();
    opts.pagezero_size = if executable { 0x1_0000_0000 } else { 0 };
    opts.adhoc_codesign = false;
    opts
}

//
// Readers over the linked image
//

pub struct Image {
    pub bytes: Vec<u8>,
}

impl Image {
    pub fn read(path: &std::path::Path) -> Image {
        Image {
            bytes: std::fs::read(path).unwrap(),
        }
    }

    pub fn header(&self) -> MachHeader64 {
        self.bytes.pread_with(0, scroll::LE).unwrap()
    }

    /// (cmd, file offset) of every load command.
    pub fn load_commands(&self) -> Vec<(u32, usize)> {
        let hdr = self.header();
        let mut vec = Vec::new();
        let mut off = SIZEOF_MACH_HEADER_64;
        for _ in 0..hdr.ncmds {
            let lc: LoadCommandHeader = self.bytes.pread_with(off, scroll::LE).unwrap();
            vec.push((lc.cmd, off));
            off += lc.cmdsize as usize;
        }
        vec
    }

    pub fn find_command(&self, cmd: u32) -> Option<usize> {
        self.load_commands()
            .into_iter()
            .find(|(c, _)| *c == cmd)
            .map(|(_, off)| off)
    }

    pub fn segments(&self) -> Vec<(SegmentCommand64, Vec<Section64>)> {
        let mut vec = Vec::new();
        for (cmd, off) in self.load_commands() {
            if cmd != LC_SEGMENT_64 {
                continue;
            }
            let seg: SegmentCommand64 = self.bytes.pread_with(off, scroll::LE).unwrap();
            let mut sections = Vec::new();
            for i in 0..seg.nsects as usize {
                sections.push(
                    self.bytes
                        .pread_with(
                            off + SIZEOF_SEGMENT_COMMAND_64 + i * SIZEOF_SECTION_64,
                            scroll::LE,
                        )
                        .unwrap(),
                );
            }
            vec.push((seg, sections));
        }
        vec
    }

    pub fn find_section(&self, segname: &str, sectname: &str) -> Option<Section64> {
        for (seg, sections) in self.segments() {
            if seg.name() != segname {
                continue;
            }
            for sect in sections {
                if sect.sectname() == sectname {
                    return Some(sect);
                }
            }
        }
        None
    }

    pub fn dyld_info(&self) -> DyldInfoCommand {
        let off = self.find_command(LC_DYLD_INFO_ONLY).expect("no dyld info");
        self.bytes.pread_with(off, scroll::LE).unwrap()
    }

    pub fn symtab(&self) -> (SymtabCommand, DysymtabCommand) {
        let sym_off = self.find_command(LC_SYMTAB).expect("no symtab");
        let dysym_off = self.find_command(LC_DYSYMTAB).expect("no dysymtab");
        (
            self.bytes.pread_with(sym_off, scroll::LE).unwrap(),
            self.bytes.pread_with(dysym_off, scroll::LE).unwrap(),
        )
    }

    /// Every (name, nlist) in symbol-table order.
    pub fn symbols(&self) -> Vec<(String, Nlist64)> {
        let (symtab, _) = self.symtab();
        let mut vec = Vec::new();
        for i in 0..symtab.nsyms as usize {
            let nlist: Nlist64 = self
                .bytes
                .pread_with(symtab.symoff as usize + i * SIZEOF_NLIST_64, scroll::LE)
                .unwrap();
            let name: &str = self
                .bytes
                .pread(symtab.stroff as usize + nlist.n_strx as usize)
                .unwrap();
            vec.push((name.to_string(), nlist));
        }
        vec
    }

    pub fn dylib_names(&self) -> Vec<String> {
        let mut vec = Vec::new();
        for (cmd, off) in self.load_commands() {
            if cmd == LC_LOAD_DYLIB || cmd == LC_LOAD_WEAK_DYLIB || cmd == LC_REEXPORT_DYLIB {
                let dylib: DylibCommand = self.bytes.pread_with(off, scroll::LE).unwrap();
                let name: &str = self
                    .bytes
                    .pread(off + dylib.dylib.name as usize)
                    .unwrap();
                vec.push(name.to_string());
            }
        }
        vec
    }
}

/// A model interpreter for rebase opcode streams: returns the
/// (segment, offset) pairs dyld would slide.
pub fn interpret_rebase(stream: &[u8]) -> Vec<(u8, u64)> {
    use machld::mach::constants::*;
    let mut out = Vec::new();
    let mut seg = 0u8;
    let mut offset = 0u64;
    let mut pos = 0usize;
    while pos < stream.len() {
        let byte = stream[pos];
        pos += 1;
        let imm = byte & REBASE_IMMEDIATE_MASK;
        match byte & REBASE_OPCODE_MASK {
            REBASE_OPCODE_DONE => break,
            REBASE_OPCODE_SET_TYPE_IMM => assert_eq!(imm, REBASE_TYPE_POINTER),
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                seg = imm;
                offset = machld::util::read_uleb(stream, &mut pos).unwrap();
            }
            REBASE_OPCODE_ADD_ADDR_ULEB => {
                offset += machld::util::read_uleb(stream, &mut pos).unwrap();
            }
            REBASE_OPCODE_ADD_ADDR_IMM_SCALED => offset += imm as u64 * 8,
            REBASE_OPCODE_DO_REBASE_IMM_TIMES => {
                for _ in 0..imm {
                    out.push((seg, offset));
                    offset += 8;
                }
            }
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES => {
                let times = machld::util::read_uleb(stream, &mut pos).unwrap();
                for _ in 0..times {
                    out.push((seg, offset));
                    offset += 8;
                }
            }
            other => panic!("unexpected rebase opcode {:#x}", other),
        }
    }
    out
}

/// Walks a serialized export trie for `name`; returns the leaf's
/// (flags, address) if present.
pub fn walk_export_trie(trie: &[u8], name: &str) -> Option<(u64, u64)> {
    let mut pos = 0usize;
    let mut remaining = name.as_bytes();
    loop {
        let mut p = pos;
        let info_size = machld::util::read_uleb(trie, &mut p)? as usize;
        if remaining.is_empty() {
            if info_size == 0 {
                return None;
            }
            let flags = machld::util::read_uleb(trie, &mut p)?;
            let addr = machld::util::read_uleb(trie, &mut p)?;
            return Some((flags, addr));
        }
        // skip the payload to the edge list
        let mut q = pos;
        machld::util::read_uleb(trie, &mut q)?;
        let mut edges = q + info_size;
        let nedges = *trie.get(edges)?;
        edges += 1;

        let mut matched = false;
        for _ in 0..nedges {
            let label_end = trie[edges..].iter().position(|&b| b == 0)? + edges;
            let label = &trie[edges..label_end];
            let mut r = label_end + 1;
            let child = machld::util::read_uleb(trie, &mut r)?;
            if remaining.starts_with(label) {
                remaining = &remaining[label.len()..];
                pos = child as usize;
                matched = true;
                break;
            }
            edges = r;
        }
        if !matched {
            return None;
        }
    }
}
