//! Output layout: composing segments from chunks, assigning file
//! offsets and virtual addresses, and driving the final byte copy.

use crate::arch::Arch;
use crate::ctx::Context;
use crate::input::section::SubsecRef;
use crate::mach::constants::*;
use crate::mach::load_command::Section64;
use crate::out::{self, ChunkHdr, ChunkId, OutputSegment};
use crate::util::align_to;
use crate::COMMON_PAGE_SIZE;
use std::collections::HashMap;

/// A copy of the chunk's section header, whoever owns it.
pub fn chunk_sect<A: Arch>(ctx: &Context<A>, id: ChunkId) -> Section64 {
    match id {
        ChunkId::Osec(i) => ctx.osecs.read()[i as usize].hdr.sect,
        _ => chunk_hdr(ctx, id).sect,
    }
}

fn chunk_hdr<A: Arch>(ctx: &Context<A>, id: ChunkId) -> &ChunkHdr {
    match id {
        ChunkId::MachHeader => &ctx.mach_hdr,
        ChunkId::Stubs => &ctx.stubs.hdr,
        ChunkId::StubHelper => &ctx.stub_helper,
        ChunkId::UnwindInfo => &ctx.unwind_info.hdr,
        ChunkId::Got => &ctx.got.hdr,
        ChunkId::LazySymbolPtr => &ctx.lazy_symbol_ptr,
        ChunkId::ThreadPtrs => &ctx.thread_ptrs.hdr,
        ChunkId::Rebase => &ctx.rebase.hdr,
        ChunkId::Bind => &ctx.bind.hdr,
        ChunkId::LazyBind => &ctx.lazy_bind.hdr,
        ChunkId::Export => &ctx.export_.hdr,
        ChunkId::FunctionStarts => &ctx.function_starts.hdr,
        ChunkId::DataInCode => &ctx.data_in_code.hdr,
        ChunkId::Symtab => &ctx.symtab_sec.hdr,
        ChunkId::Strtab => &ctx.strtab.hdr,
        ChunkId::CodeSignature => ctx.code_sig.as_ref().unwrap(),
        ChunkId::Osec(_) => unreachable!(),
    }
}

pub fn with_chunk_hdr_mut<A: Arch>(
    ctx: &mut Context<A>,
    id: ChunkId,
    f: impl FnOnce(&mut ChunkHdr),
) {
    match id {
        ChunkId::MachHeader => f(&mut ctx.mach_hdr),
        ChunkId::Osec(i) => f(&mut ctx.osecs.get_mut()[i as usize].hdr),
        ChunkId::Stubs => f(&mut ctx.stubs.hdr),
        ChunkId::StubHelper => f(&mut ctx.stub_helper),
        ChunkId::UnwindInfo => f(&mut ctx.unwind_info.hdr),
        ChunkId::Got => f(&mut ctx.got.hdr),
        ChunkId::LazySymbolPtr => f(&mut ctx.lazy_symbol_ptr),
        ChunkId::ThreadPtrs => f(&mut ctx.thread_ptrs.hdr),
        ChunkId::Rebase => f(&mut ctx.rebase.hdr),
        ChunkId::Bind => f(&mut ctx.bind.hdr),
        ChunkId::LazyBind => f(&mut ctx.lazy_bind.hdr),
        ChunkId::Export => f(&mut ctx.export_.hdr),
        ChunkId::FunctionStarts => f(&mut ctx.function_starts.hdr),
        ChunkId::DataInCode => f(&mut ctx.data_in_code.hdr),
        ChunkId::Symtab => f(&mut ctx.symtab_sec.hdr),
        ChunkId::Strtab => f(&mut ctx.strtab.hdr),
        ChunkId::CodeSignature => f(ctx.code_sig.as_mut().unwrap()),
    }
}

pub fn chunk_is_hidden<A: Arch>(ctx: &Context<A>, id: ChunkId) -> bool {
    match id {
        ChunkId::Osec(_) => false,
        _ => chunk_hdr(ctx, id).is_hidden,
    }
}

/// Identical C-string literals collapse to one copy; the survivors are
/// picked in file-priority order and the losers point at them.
pub fn coalesce_cstrings<A: Arch>(ctx: &mut Context<A>) {
    if !ctx.arg.deduplicate {
        return;
    }

    let mut winners: HashMap<Vec<u8>, SubsecRef> = HashMap::new();
    let mut losers: Vec<(SubsecRef, SubsecRef)> = Vec::new();

    for obj in &ctx.objs {
        if !obj.alive() {
            continue;
        }
        for (idx, subsec) in obj.subsections.iter().enumerate() {
            if !subsec.is_cstring || !subsec.is_alive() {
                continue;
            }
            let isec = obj.sections[subsec.isec as usize].as_ref().unwrap();
            let lo = isec.contents.start + subsec.input_offset as usize;
            let content = obj.data()[lo..lo + subsec.input_size as usize].to_vec();
            let this = SubsecRef {
                file: obj.file_idx,
                idx: idx as u32,
            };
            match winners.get(&content) {
                Some(winner) => losers.push((this, *winner)),
                None => {
                    winners.insert(content, this);
                }
            }
        }
    }

    for (loser, winner) in losers {
        let subsec = &mut ctx.objs[loser.file as usize].subsections[loser.idx as usize];
        subsec.is_coalesced = true;
        subsec.replacer = Some(winner);
    }
}

fn segment_rank(name: &str) -> u32 {
    match name {
        SEG_TEXT => 0,
        SEG_DATA_CONST => 1,
        SEG_DATA => 2,
        SEG_LINKEDIT => u32::MAX,
        _ => 3,
    }
}

/// Groups subsections into output sections, decides which synthetic
/// chunks exist, and lays chunks into segments in their fixed order.
pub fn create_synthetic_chunks<A: Arch>(ctx: &mut Context<A>) {
    // hand every live subsection to its output section
    let mut claims: Vec<SubsecRef> = Vec::new();
    for obj in &ctx.objs {
        if !obj.alive() {
            continue;
        }
        for (idx, subsec) in obj.subsections.iter().enumerate() {
            if subsec.is_alive() && !subsec.is_coalesced {
                claims.push(SubsecRef {
                    file: obj.file_idx,
                    idx: idx as u32,
                });
            }
        }
    }
    for r in claims {
        out::section::add_subsec(ctx, r);
    }

    let has_stubs = !ctx.stubs.syms.is_empty();
    let has_unwind = ctx.objs.iter().any(|obj| {
        obj.alive()
            && obj
                .subsections
                .iter()
                .any(|s| s.is_alive() && s.nunwind > 0)
    });

    let osec_ids: Vec<(u32, String, bool, bool)> = {
        let osecs = ctx.osecs.read();
        osecs
            .iter()
            .enumerate()
            .map(|(i, osec)| {
                (
                    i as u32,
                    osec.hdr.segname().to_string(),
                    !osec.members.is_empty(),
                    osec.hdr.sect.is_zerofill(),
                )
            })
            .collect()
    };

    let include_osec = |id: u32, populated: bool| -> bool {
        populated || (id == ctx.data_osec && has_stubs)
    };

    let mut text_seg = OutputSegment::new(SEG_TEXT);
    text_seg.chunks.push(ChunkId::MachHeader);
    if osec_ids[ctx.text_osec as usize].2 {
        text_seg.chunks.push(ChunkId::Osec(ctx.text_osec));
    }
    if has_stubs {
        text_seg.chunks.push(ChunkId::Stubs);
        text_seg.chunks.push(ChunkId::StubHelper);
    }
    for (id, seg, populated, _) in &osec_ids {
        if seg.as_str() == SEG_TEXT && *id != ctx.text_osec && *populated {
            text_seg.chunks.push(ChunkId::Osec(*id));
        }
    }
    if has_unwind {
        text_seg.chunks.push(ChunkId::UnwindInfo);
    }

    let mut data_const_seg = OutputSegment::new(SEG_DATA_CONST);
    if !ctx.got.syms.is_empty() {
        data_const_seg.chunks.push(ChunkId::Got);
    }
    for (id, seg, populated, _) in &osec_ids {
        if seg.as_str() == SEG_DATA_CONST && *populated {
            data_const_seg.chunks.push(ChunkId::Osec(*id));
        }
    }

    let mut data_seg = OutputSegment::new(SEG_DATA);
    if has_stubs {
        data_seg.chunks.push(ChunkId::LazySymbolPtr);
    }
    if !ctx.thread_ptrs.syms.is_empty() {
        data_seg.chunks.push(ChunkId::ThreadPtrs);
    }
    // zero-fill sections follow everything with file contents
    for (id, seg, populated, zerofill) in &osec_ids {
        if seg.as_str() == SEG_DATA && !zerofill && include_osec(*id, *populated) {
            data_seg.chunks.push(ChunkId::Osec(*id));
        }
    }
    for (id, seg, populated, zerofill) in &osec_ids {
        if seg.as_str() == SEG_DATA && *zerofill && *populated {
            data_seg.chunks.push(ChunkId::Osec(*id));
        }
    }

    // input files may bring segments of their own
    let mut extra_segs: Vec<OutputSegment> = Vec::new();
    for (id, seg, populated, _) in &osec_ids {
        if !*populated
            || matches!(seg.as_str(), SEG_TEXT | SEG_DATA_CONST | SEG_DATA | SEG_LINKEDIT)
        {
            continue;
        }
        let seg_entry = match extra_segs.iter_mut().position(|s| s.cmd.name() == seg.as_str()) {
            Some(pos) => &mut extra_segs[pos],
            None => {
                extra_segs.push(OutputSegment::new(seg));
                extra_segs.last_mut().unwrap()
            }
        };
        seg_entry.chunks.push(ChunkId::Osec(*id));
    }
    // keep zero-fill members behind the mapped ones within each segment
    for seg in &mut extra_segs {
        seg.chunks.sort_by_key(|id| match id {
            ChunkId::Osec(i) => osec_ids[*i as usize].3,
            _ => false,
        });
    }

    let mut linkedit_seg = OutputSegment::new(SEG_LINKEDIT);
    linkedit_seg.chunks.extend([
        ChunkId::Rebase,
        ChunkId::Bind,
        ChunkId::LazyBind,
        ChunkId::Export,
    ]);
    if ctx.arg.function_starts {
        linkedit_seg.chunks.push(ChunkId::FunctionStarts);
    }
    linkedit_seg.chunks.push(ChunkId::DataInCode);
    linkedit_seg.chunks.push(ChunkId::Symtab);
    linkedit_seg.chunks.push(ChunkId::Strtab);
    if ctx.code_sig.is_some() {
        linkedit_seg.chunks.push(ChunkId::CodeSignature);
    }

    let mut segments = vec![text_seg, data_const_seg, data_seg];
    extra_segs.sort_by_key(|seg| segment_rank(seg.cmd.name()));
    segments.extend(extra_segs);
    segments.push(linkedit_seg);
    // drop interior segments with nothing in them
    segments.retain(|seg| !seg.chunks.is_empty());

    // dyld opcodes index segments as the load commands list them, where
    // __PAGEZERO occupies slot zero
    let seg_base = if ctx.arg.pagezero_size > 0 { 1u8 } else { 0 };
    for (i, seg) in segments.iter_mut().enumerate() {
        seg.seg_idx = seg_base + i as u8;
    }

    // 1-based section ordinals over the advertised sections
    let mut sect_idx = 1u32;
    let ids: Vec<ChunkId> = segments.iter().flat_map(|s| s.chunks.clone()).collect();
    ctx.segments = segments;
    for id in ids {
        if !chunk_is_hidden(ctx, id) {
            with_chunk_hdr_mut(ctx, id, |hdr| hdr.sect_idx = sect_idx);
            sect_idx += 1;
        }
    }
}

fn chunk_alignment(sect: &Section64) -> u64 {
    match sect.sect_type() {
        // thread-local storage is laid out on 16-byte boundaries no
        // matter what the inputs declared
        S_THREAD_LOCAL_REGULAR | S_THREAD_LOCAL_ZEROFILL | S_THREAD_LOCAL_VARIABLES => 16,
        _ => 1 << sect.align,
    }
}

fn compute_chunk_size<A: Arch>(ctx: &mut Context<A>, id: ChunkId) {
    match id {
        ChunkId::MachHeader => out::header::compute_size(ctx),
        ChunkId::Osec(i) => out::section::compute_size(ctx, i),
        ChunkId::UnwindInfo => {
            // the GOT has no address yet, but slot choice and record
            // count (hence the size) do not depend on it; the contents
            // are regenerated with real addresses at copy time
            ctx.unwind_info.hdr.sect.size = out::unwind::build_unwind_info(&*ctx).len() as u64;
        }
        // stubs, pointer tables and LINKEDIT blobs were sized when they
        // were filled
        _ => {}
    }
}

fn set_offset_regular<A: Arch>(ctx: &mut Context<A>, seg_idx: usize, fileoff: u64, vmaddr: u64) {
    let chunks = ctx.segments[seg_idx].chunks.clone();
    let mut fileoff_cur = fileoff;
    let mut vmaddr_cur = vmaddr;

    let mut i = 0;
    while i < chunks.len() {
        let id = chunks[i];
        let sect = chunk_sect(ctx, id);
        if sect.is_zerofill() {
            break;
        }
        let align = chunk_alignment(&sect);
        fileoff_cur = align_to(fileoff_cur, align);
        vmaddr_cur = align_to(vmaddr_cur, align);
        with_chunk_hdr_mut(ctx, id, |hdr| {
            hdr.sect.offset = fileoff_cur as u32;
            hdr.sect.addr = vmaddr_cur;
        });
        compute_chunk_size(ctx, id);
        let size = chunk_sect(ctx, id).size;
        fileoff_cur += size;
        vmaddr_cur += size;
        i += 1;
    }

    while i < chunks.len() {
        let id = chunks[i];
        let sect = chunk_sect(ctx, id);
        debug_assert!(sect.is_zerofill());
        let align = chunk_alignment(&sect);
        vmaddr_cur = align_to(vmaddr_cur, align);
        with_chunk_hdr_mut(ctx, id, |hdr| {
            hdr.sect.offset = 0;
            hdr.sect.addr = vmaddr_cur;
        });
        compute_chunk_size(ctx, id);
        vmaddr_cur += chunk_sect(ctx, id).size;
        i += 1;
    }

    let seg = &mut ctx.segments[seg_idx];
    seg.cmd.fileoff = fileoff;
    seg.cmd.vmaddr = vmaddr;
    seg.cmd.vmsize = align_to(vmaddr_cur - vmaddr, COMMON_PAGE_SIZE);
    seg.cmd.filesize = align_to(fileoff_cur - fileoff, COMMON_PAGE_SIZE);
}

fn set_offset_linkedit<A: Arch>(ctx: &mut Context<A>, seg_idx: usize, fileoff: u64, vmaddr: u64) {
    // sizes first: everything except the string table (built together
    // with the symbol table) and the signature (which needs its own
    // offset) can be computed in parallel
    let (((rebase, bind), (lazy_bind, export)), ((function_starts, dice), symtab)) = {
        let ctx = &*ctx;
        rayon::join(
            || {
                rayon::join(
                    || {
                        rayon::join(
                            || out::dyld_info::build_rebase::<A>(ctx),
                            || out::dyld_info::build_bind::<A>(ctx),
                        )
                    },
                    || {
                        rayon::join(
                            || out::dyld_info::build_lazy_bind::<A>(ctx),
                            || out::dyld_info::build_export::<A>(ctx),
                        )
                    },
                )
            },
            || {
                rayon::join(
                    || {
                        rayon::join(
                            || out::function_starts::build_function_starts::<A>(ctx),
                            || out::data_in_code::build_data_in_code::<A>(ctx),
                        )
                    },
                    || out::symtab::build_symtab::<A>(ctx),
                )
            },
        )
    };

    ctx.rebase.set_contents(rebase);
    ctx.bind.set_contents(bind);
    let (lazy_contents, bind_offsets) = lazy_bind;
    ctx.lazy_bind.set_contents(lazy_contents);
    ctx.stubs.bind_offsets = bind_offsets;
    ctx.export_.set_contents(export);
    ctx.function_starts.set_contents(function_starts);
    ctx.data_in_code.hdr.sect.size =
        (dice.len() * crate::mach::load_command::SIZEOF_DATA_IN_CODE_ENTRY) as u64;
    ctx.data_in_code.entries = dice;
    ctx.symtab_sec.hdr.sect.size =
        (symtab.nlists.len() * crate::mach::symbols::SIZEOF_NLIST_64) as u64;
    ctx.symtab_sec.num_locals = symtab.num_locals;
    ctx.symtab_sec.num_globals = symtab.num_globals;
    ctx.symtab_sec.num_undefs = symtab.num_undefs;
    ctx.symtab_sec.nlists = symtab.nlists;
    ctx.strtab.set_contents(symtab.strtab);

    let chunks = ctx.segments[seg_idx].chunks.clone();
    let mut fileoff_cur = fileoff;
    let mut vmaddr_cur = vmaddr;
    for id in chunks {
        let align = 1u64 << chunk_sect(ctx, id).align;
        fileoff_cur = align_to(fileoff_cur, align);
        vmaddr_cur = align_to(vmaddr_cur, align);
        with_chunk_hdr_mut(ctx, id, |hdr| {
            hdr.sect.offset = fileoff_cur as u32;
            hdr.sect.addr = vmaddr_cur;
        });
        if id == ChunkId::CodeSignature {
            out::code_sig::compute_size::<A>(ctx);
        }
        let size = chunk_sect(ctx, id).size;
        fileoff_cur += size;
        vmaddr_cur += size;
    }

    let seg = &mut ctx.segments[seg_idx];
    seg.cmd.fileoff = fileoff;
    seg.cmd.vmaddr = vmaddr;
    seg.cmd.vmsize = align_to(vmaddr_cur - vmaddr, COMMON_PAGE_SIZE);
    seg.cmd.filesize = fileoff_cur - fileoff;
}

/// Assigns file offsets and addresses to everything; returns the output
/// file size.
pub fn assign_offsets<A: Arch>(ctx: &mut Context<A>) -> u64 {
    let mut fileoff = 0;
    let mut vmaddr = ctx.arg.pagezero_size;
    for i in 0..ctx.segments.len() {
        if ctx.segments[i].cmd.name() == SEG_LINKEDIT {
            // the symbol table and export trie about to be built bake in
            // the addresses of the linker-provided symbols
            crate::resolve::fix_synthetic_symbols(&*ctx);
            set_offset_linkedit(ctx, i, fileoff, vmaddr);
        } else {
            set_offset_regular(ctx, i, fileoff, vmaddr);
        }
        fileoff += ctx.segments[i].cmd.filesize;
        vmaddr += ctx.segments[i].cmd.vmsize;
    }

    // thread-local addresses are relative to the first TLS template
    ctx.tls_begin = 0;
    'outer: for seg in &ctx.segments {
        for &id in &seg.chunks {
            let sect = chunk_sect(ctx, id);
            if matches!(
                sect.sect_type(),
                S_THREAD_LOCAL_REGULAR | S_THREAD_LOCAL_ZEROFILL
            ) {
                ctx.tls_begin = sect.addr;
                break 'outer;
            }
        }
    }

    fileoff
}

fn copy_chunk<A: Arch>(ctx: &Context<A>, id: ChunkId, buf: &mut [u8]) {
    match id {
        ChunkId::MachHeader => out::header::copy_mach_header(ctx, buf),
        ChunkId::Osec(i) => out::section::copy_buf(ctx, i, buf),
        ChunkId::Stubs => A::write_stubs(ctx, buf),
        ChunkId::StubHelper => A::write_stub_helper(ctx, buf),
        ChunkId::UnwindInfo => {
            let contents = out::unwind::build_unwind_info(ctx);
            buf[..contents.len()].copy_from_slice(&contents);
        }
        ChunkId::Got => out::stubs::copy_got(ctx, buf),
        ChunkId::LazySymbolPtr => out::stubs::copy_lazy_symbol_ptr(ctx, buf),
        ChunkId::ThreadPtrs => out::stubs::copy_thread_ptrs(ctx, buf),
        ChunkId::Rebase => buf[..ctx.rebase.contents.len()].copy_from_slice(&ctx.rebase.contents),
        ChunkId::Bind => buf[..ctx.bind.contents.len()].copy_from_slice(&ctx.bind.contents),
        ChunkId::LazyBind => {
            buf[..ctx.lazy_bind.contents.len()].copy_from_slice(&ctx.lazy_bind.contents)
        }
        ChunkId::Export => buf[..ctx.export_.contents.len()].copy_from_slice(&ctx.export_.contents),
        ChunkId::FunctionStarts => {
            buf[..ctx.function_starts.contents.len()]
                .copy_from_slice(&ctx.function_starts.contents)
        }
        ChunkId::DataInCode => {
            use scroll::Pwrite;
            for (i, ent) in ctx.data_in_code.entries.iter().enumerate() {
                buf.pwrite_with(
                    *ent,
                    i * crate::mach::load_command::SIZEOF_DATA_IN_CODE_ENTRY,
                    scroll::LE,
                )
                .unwrap();
            }
        }
        ChunkId::Symtab => out::symtab::copy_buf(ctx, buf),
        ChunkId::Strtab => buf[..ctx.strtab.contents.len()].copy_from_slice(&ctx.strtab.contents),
        // written after everything else, over the finished image
        ChunkId::CodeSignature => {}
    }
}

/// Writes every chunk into its slice of the output buffer.
pub fn copy_output<A: Arch>(ctx: &Context<A>, buf: &mut [u8]) {
    for seg in &ctx.segments {
        for &id in &seg.chunks {
            let sect = chunk_sect(ctx, id);
            if sect.is_zerofill() || id == ChunkId::CodeSignature {
                continue;
            }
            let start = sect.offset as usize;
            let end = start + sect.size as usize;
            copy_chunk(ctx, id, &mut buf[start..end]);
        }
    }
}
