//! The linking context: configuration, input files, the symbol table and
//! every output chunk. One context exists per link and is threaded
//! through all passes.

use crate::arch::Arch;
use crate::error::{Diags, Result};
use crate::input::section::{Subsection, SubsecRef};
use crate::input::{DylibFile, ObjectFile};
use crate::intern::{FileId, Symbol, SymbolTable};
use crate::mach::constants::*;
use crate::opt::LinkOptions;
use crate::out::stubs::{GotSection, StubsSection, ThreadPtrsSection};
use crate::out::{
    BlobSection, ChunkHdr, DataInCodeSection, OsecSet, OutputSegment, SymtabSection,
    UnwindInfoSection,
};
use std::marker::PhantomData;
use std::sync::Arc;

pub struct Context<A: Arch> {
    pub arg: LinkOptions,
    /// MH_EXECUTE, MH_DYLIB or MH_BUNDLE
    pub output_type: u32,
    pub diags: Diags,
    pub symtab: SymbolTable,

    pub objs: Vec<ObjectFile>,
    pub dylibs: Vec<DylibFile>,

    pub osecs: OsecSet,
    pub segments: Vec<OutputSegment>,

    pub mach_hdr: ChunkHdr,
    pub stubs: StubsSection,
    pub stub_helper: ChunkHdr,
    pub unwind_info: UnwindInfoSection,
    pub got: GotSection,
    pub lazy_symbol_ptr: ChunkHdr,
    pub thread_ptrs: ThreadPtrsSection,
    pub rebase: BlobSection,
    pub bind: BlobSection,
    pub lazy_bind: BlobSection,
    pub export_: BlobSection,
    pub function_starts: BlobSection,
    pub data_in_code: DataInCodeSection,
    pub symtab_sec: SymtabSection,
    pub strtab: BlobSection,
    pub code_sig: Option<ChunkHdr>,

    /// ids of the always-present output sections
    pub text_osec: u32,
    pub data_osec: u32,
    pub bss_osec: u32,
    pub common_osec: u32,

    /// address of the first thread-local template section
    pub tls_begin: u64,
    pub uuid: [u8; 16],
    pub entry_sym: Option<Arc<Symbol>>,

    pub arch: PhantomData<A>,
}

impl<A: Arch> Context<A> {
    pub fn new(arg: LinkOptions, output_type: u32) -> Context<A> {
        let osecs = OsecSet::new();
        let text_osec = osecs.get_or_create(SEG_TEXT, SECT_TEXT).unwrap();
        let data_osec = osecs.get_or_create(SEG_DATA, SECT_DATA).unwrap();
        let bss_osec = osecs.get_or_create(SEG_DATA, SECT_BSS).unwrap();
        let common_osec = osecs.get_or_create(SEG_DATA, SECT_COMMON).unwrap();

        let mut ctx = Context {
            arg,
            output_type,
            diags: Diags::new(),
            symtab: SymbolTable::new(),
            objs: Vec::new(),
            dylibs: Vec::new(),
            osecs,
            segments: Vec::new(),
            mach_hdr: ChunkHdr::new(SEG_TEXT, "__mach_header", true),
            stubs: StubsSection::new(A::STUB_SIZE),
            stub_helper: {
                let mut hdr = ChunkHdr::new(SEG_TEXT, "__stub_helper", false);
                hdr.sect.align = 4;
                hdr.sect.flags = S_ATTR_SOME_INSTRUCTIONS | S_ATTR_PURE_INSTRUCTIONS;
                hdr
            },
            unwind_info: UnwindInfoSection::new(),
            got: GotSection::new(),
            lazy_symbol_ptr: {
                let mut hdr = ChunkHdr::new(SEG_DATA, "__la_symbol_ptr", false);
                hdr.sect.align = 3;
                hdr.sect.flags = S_LAZY_SYMBOL_POINTERS;
                hdr
            },
            thread_ptrs: ThreadPtrsSection::new(),
            rebase: BlobSection::new(SEG_LINKEDIT, "__rebase", 3),
            bind: BlobSection::new(SEG_LINKEDIT, "__binding", 3),
            lazy_bind: BlobSection::new(SEG_LINKEDIT, "__lazy_binding", 3),
            export_: BlobSection::new(SEG_LINKEDIT, "__export", 3),
            function_starts: BlobSection::new(SEG_LINKEDIT, "__func_starts", 3),
            data_in_code: DataInCodeSection::new(),
            symtab_sec: SymtabSection::new(),
            strtab: BlobSection::new(SEG_LINKEDIT, "__string_table", 3),
            code_sig: None,
            text_osec,
            data_osec,
            bss_osec,
            common_osec,
            tls_begin: 0,
            uuid: [0; 16],
            entry_sym: None,
            arch: PhantomData,
        };

        {
            let osecs = ctx.osecs.get_mut();
            osecs[bss_osec as usize].hdr.sect.flags = S_ZEROFILL;
            osecs[common_osec as usize].hdr.sect.flags = S_ZEROFILL;
        }
        if ctx.arg.adhoc_codesign {
            let mut hdr = ChunkHdr::new(SEG_LINKEDIT, "__code_signature", true);
            hdr.sect.align = 4;
            ctx.code_sig = Some(hdr);
        }
        ctx
    }

    pub fn checkpoint(&self) -> Result<()> {
        self.diags.checkpoint()
    }

    pub fn subsec(&self, r: SubsecRef) -> &Subsection {
        &self.objs[r.file as usize].subsections[r.idx as usize]
    }

    /// Follows literal coalescing to the surviving subsection.
    pub fn subsec_canonical(&self, r: SubsecRef) -> SubsecRef {
        let subsec = self.subsec(r);
        if subsec.is_coalesced {
            subsec.replacer.unwrap_or(r)
        } else {
            r
        }
    }

    /// The output section a subsection was routed into.
    pub fn subsec_osec(&self, r: SubsecRef) -> u32 {
        let subsec = self.subsec(r);
        let obj = &self.objs[r.file as usize];
        obj.sections[subsec.isec as usize].as_ref().unwrap().osec
    }

    /// The output virtual address of a subsection.
    pub fn subsec_addr(&self, r: SubsecRef) -> u64 {
        let r = self.subsec_canonical(r);
        let subsec = self.subsec(r);
        debug_assert!(subsec.is_alive());
        let osec = self.subsec_osec(r);
        self.osecs.read()[osec as usize].hdr.sect.addr + subsec.output_offset as u64
    }

    /// The section type of the input section a subsection came from.
    pub fn subsec_input_type(&self, r: SubsecRef) -> u32 {
        let subsec = self.subsec(r);
        let obj = &self.objs[r.file as usize];
        obj.sections[subsec.isec as usize]
            .as_ref()
            .unwrap()
            .hdr
            .sect_type()
    }

    /// The output address of a symbol: its subsection plus offset, its
    /// stub for subsection-less imports, or its absolute value.
    pub fn sym_addr(&self, sym: &Symbol) -> u64 {
        let def = sym.def();
        if let Some(subsec) = def.subsec {
            return self.subsec_addr(subsec) + def.value;
        }
        let stub_idx = sym.stub_idx();
        if stub_idx != -1 {
            return self.stubs.hdr.sect.addr + stub_idx as u64 * A::STUB_SIZE;
        }
        def.value
    }

    pub fn sym_got_addr(&self, sym: &Symbol) -> u64 {
        let idx = sym.got_idx();
        debug_assert!(idx != -1);
        self.got.hdr.sect.addr + idx as u64 * 8
    }

    pub fn sym_tlv_addr(&self, sym: &Symbol) -> u64 {
        let idx = sym.tlv_idx();
        debug_assert!(idx != -1);
        self.thread_ptrs.hdr.sect.addr + idx as u64 * 8
    }

    /// Insertion order of the owning file; the first component of the
    /// deterministic symbol ordering.
    pub fn file_priority(&self, file: FileId) -> i64 {
        match file {
            FileId::None => i64::MAX,
            FileId::Obj(i) => self.objs[i as usize].priority,
            FileId::Dylib(i) => self.dylibs[i as usize].priority,
        }
    }

    /// Display name of a file for diagnostics.
    pub fn file_name(&self, file: FileId) -> String {
        match file {
            FileId::None => "<undefined>".to_string(),
            FileId::Obj(i) => self.objs[i as usize].display_name(),
            FileId::Dylib(i) => self.dylibs[i as usize].filename.clone(),
        }
    }
}
