//! The `__unwind_info` compressor.
//!
//! Live compact-unwind records are sorted by function address, given one
//! of at most three personality slots, split into pages whose members
//! fit a 24-bit offset from the page base, and written out as the
//! two-level page table the OS unwinder walks.

use crate::arch::Arch;
use crate::ctx::Context;
use crate::input::section::SubsecRef;
use crate::mach::constants::*;
use crate::out::ChunkId;
use scroll::Pwrite;
use std::collections::HashMap;

const SIZEOF_SECTION_HEADER: usize = 28;
const SIZEOF_FIRST_LEVEL_PAGE: usize = 12;
const SIZEOF_SECOND_LEVEL_PAGE: usize = 12;
const SIZEOF_LSDA_ENTRY: usize = 8;
/// a second-level page addresses functions within 24 bits of its base
const PAGE_SPAN: u64 = 1 << 24;
const MAX_PAGE_RECORDS: usize = 4096;

struct Rec {
    func_addr: u64,
    /// one past the end of the function's subsection, for the terminator
    subsec_end: u64,
    encoding: u32,
    lsda_addr: Option<u64>,
}

/// Collects the live records with addresses resolved, assigning each
/// distinct personality one of the three encoding slots on the way.
fn collect_records<A: Arch>(ctx: &Context<A>) -> (Vec<Rec>, Vec<u64>) {
    let mut personalities: Vec<u64> = Vec::new();
    let mut records = Vec::new();

    for seg in &ctx.segments {
        for id in &seg.chunks {
            let osec_idx = match id {
                ChunkId::Osec(i) => *i,
                _ => continue,
            };
            let members = {
                let osecs = ctx.osecs.read();
                osecs[osec_idx as usize].members.clone()
            };
            for m in members {
                let subsec = ctx.subsec(m);
                let obj = &ctx.objs[m.file as usize];
                for rec in &obj.unwind_records[subsec.unwind_range()] {
                    let func_subsec = SubsecRef {
                        file: m.file,
                        idx: rec.subsec,
                    };
                    let base = ctx.subsec_addr(func_subsec);
                    let mut encoding = rec.encoding;

                    if let Some(personality) = &rec.personality {
                        let addr = ctx.sym_got_addr(personality);
                        let slot = match personalities.iter().position(|&p| p == addr) {
                            Some(slot) => slot,
                            None => {
                                if personalities.len() == 3 {
                                    ctx.diags
                                        .error("too many personality functions".to_string());
                                    continue;
                                }
                                personalities.push(addr);
                                personalities.len() - 1
                            }
                        };
                        encoding |= ((slot as u32 + 1)
                            << UNWIND_PERSONALITY_MASK.trailing_zeros())
                            & UNWIND_PERSONALITY_MASK;
                    }

                    let lsda_addr = rec.lsda.map(|lsda| {
                        ctx.subsec_addr(SubsecRef {
                            file: m.file,
                            idx: lsda,
                        }) + rec.lsda_offset as u64
                    });
                    records.push(Rec {
                        func_addr: base + rec.offset as u64,
                        subsec_end: base + ctx.subsec(func_subsec).input_size as u64,
                        encoding,
                        lsda_addr,
                    });
                }
            }
        }
    }
    (records, personalities)
}

pub fn build_unwind_info<A: Arch>(ctx: &Context<A>) -> Vec<u8> {
    let (mut records, personalities) = collect_records(ctx);
    if records.is_empty() {
        return Vec::new();
    }
    records.sort_by_key(|rec| rec.func_addr);

    // partition into pages
    let mut pages: Vec<std::ops::Range<usize>> = Vec::new();
    let mut i = 0;
    while i < records.len() {
        let end_addr = records[i].func_addr + PAGE_SPAN;
        let mut j = i + 1;
        while j < records.len() && j - i < MAX_PAGE_RECORDS && records[j].func_addr < end_addr {
            j += 1;
        }
        pages.push(i..j);
        i = j;
    }

    let num_lsda = records.iter().filter(|rec| rec.lsda_addr.is_some()).count();

    // per-page encoding palettes
    let mut palettes: Vec<Vec<u32>> = Vec::with_capacity(pages.len());
    for page in &pages {
        let mut palette = Vec::new();
        let mut seen: HashMap<u32, u32> = HashMap::new();
        for rec in &records[page.clone()] {
            if !seen.contains_key(&rec.encoding) {
                seen.insert(rec.encoding, palette.len() as u32);
                palette.push(rec.encoding);
            }
        }
        palettes.push(palette);
    }

    // precompute the layout
    let personalities_off = SIZEOF_SECTION_HEADER;
    let page1_off = personalities_off + personalities.len() * 4;
    let lsda_off = page1_off + (pages.len() + 1) * SIZEOF_FIRST_LEVEL_PAGE;
    let mut page2_off = lsda_off + num_lsda * SIZEOF_LSDA_ENTRY;
    let mut page2_offs = Vec::with_capacity(pages.len());
    for (page, palette) in pages.iter().zip(&palettes) {
        page2_offs.push(page2_off);
        page2_off += SIZEOF_SECOND_LEVEL_PAGE + page.len() * 4 + palette.len() * 4;
    }
    let total = page2_off;

    let mut buf = vec![0u8; total];

    // section header
    buf.pwrite_with(UNWIND_SECTION_VERSION, 0, scroll::LE).unwrap();
    buf.pwrite_with(SIZEOF_SECTION_HEADER as u32, 4, scroll::LE).unwrap(); // encoding table offset
    buf.pwrite_with(0u32, 8, scroll::LE).unwrap(); // no global encodings
    buf.pwrite_with(personalities_off as u32, 12, scroll::LE).unwrap();
    buf.pwrite_with(personalities.len() as u32, 16, scroll::LE).unwrap();
    buf.pwrite_with(page1_off as u32, 20, scroll::LE).unwrap();
    buf.pwrite_with(pages.len() as u32 + 1, 24, scroll::LE).unwrap();

    for (i, addr) in personalities.iter().enumerate() {
        // wrapping: the GOT has no address during the sizing pass; the
        // copy pass regenerates this with the real one
        buf.pwrite_with(
            addr.wrapping_sub(ctx.arg.pagezero_size) as u32,
            personalities_off + i * 4,
            scroll::LE,
        )
        .unwrap();
    }

    // first-level entries, LSDA table and second-level pages
    let mut lsda_cursor = lsda_off;
    for (pi, (page, palette)) in pages.iter().zip(&palettes).enumerate() {
        let p1 = page1_off + pi * SIZEOF_FIRST_LEVEL_PAGE;
        let page_base = records[page.start].func_addr;
        buf.pwrite_with(
            (page_base - ctx.arg.pagezero_size) as u32,
            p1,
            scroll::LE,
        )
        .unwrap();
        buf.pwrite_with(page2_offs[pi] as u32, p1 + 4, scroll::LE).unwrap();
        buf.pwrite_with(lsda_cursor as u32, p1 + 8, scroll::LE).unwrap();

        for rec in &records[page.clone()] {
            if let Some(lsda_addr) = rec.lsda_addr {
                buf.pwrite_with(
                    (rec.func_addr - ctx.arg.pagezero_size) as u32,
                    lsda_cursor,
                    scroll::LE,
                )
                .unwrap();
                buf.pwrite_with(
                    (lsda_addr - ctx.arg.pagezero_size) as u32,
                    lsda_cursor + 4,
                    scroll::LE,
                )
                .unwrap();
                lsda_cursor += SIZEOF_LSDA_ENTRY;
            }
        }

        // second-level compressed page
        let p2 = page2_offs[pi];
        let entries_off = SIZEOF_SECOND_LEVEL_PAGE;
        let encodings_off = entries_off + page.len() * 4;
        buf.pwrite_with(UNWIND_SECOND_LEVEL_COMPRESSED, p2, scroll::LE).unwrap();
        buf.pwrite_with(entries_off as u16, p2 + 4, scroll::LE).unwrap();
        buf.pwrite_with(page.len() as u16, p2 + 6, scroll::LE).unwrap();
        buf.pwrite_with(encodings_off as u16, p2 + 8, scroll::LE).unwrap();
        buf.pwrite_with(palette.len() as u16, p2 + 10, scroll::LE).unwrap();

        let index_of: HashMap<u32, u32> = palette
            .iter()
            .enumerate()
            .map(|(i, &enc)| (enc, i as u32))
            .collect();
        for (k, rec) in records[page.clone()].iter().enumerate() {
            let word = ((rec.func_addr - page_base) as u32 & 0x00ff_ffff)
                | (index_of[&rec.encoding] << 24);
            buf.pwrite_with(word, p2 + entries_off + k * 4, scroll::LE).unwrap();
        }
        for (k, &enc) in palette.iter().enumerate() {
            buf.pwrite_with(enc, p2 + encodings_off + k * 4, scroll::LE).unwrap();
        }
    }

    // the terminating first-level entry: one past the last function
    let p1 = page1_off + pages.len() * SIZEOF_FIRST_LEVEL_PAGE;
    let last = &records[records.len() - 1];
    buf.pwrite_with(
        (last.subsec_end + 1 - ctx.arg.pagezero_size) as u32,
        p1,
        scroll::LE,
    )
    .unwrap();
    buf.pwrite_with(0u32, p1 + 4, scroll::LE).unwrap();
    buf.pwrite_with(lsda_cursor as u32, p1 + 8, scroll::LE).unwrap();

    buf
}
