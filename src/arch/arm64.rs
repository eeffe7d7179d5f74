//! ARM64 relocation handling, stub code and range-extension thunks.

use crate::arch::{Arch, RelocClass};
use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::input::object::ObjectFile;
use crate::input::section::{RelocTarget, Relocation, SubsecRef};
use crate::mach::constants::*;
use crate::mach::relocation::*;
use crate::out::{Thunk, THUNK_ENTRY_SIZE};
use crate::util::{align_to, bits, sign_extend};
use scroll::{Pread, Pwrite};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct Arm64;

/// A `bl` reaches this far in either direction.
const BRANCH_REACH: u64 = 1 << 27;
/// Executable sections larger than a window get a thunk table per window.
const THUNK_WINDOW: u64 = 1 << 26;

fn page(val: u64) -> u64 {
    val & !0xfff
}

/// Scatters a page delta into the immediate fields of an ADRP: bits
/// [12..13] of the delta land in [29..30], bits [14..32] in [5..23].
fn encode_page(val: u64) -> u32 {
    ((bits(val, 13, 12) << 29) | (bits(val, 32, 14) << 5)) as u32
}

fn or32(buf: &mut [u8], offset: usize, mask: u32) {
    let insn: u32 = buf.pread_with(offset, scroll::LE).unwrap();
    buf.pwrite_with(insn | mask, offset, scroll::LE).unwrap();
}

fn target_addr(ctx: &Context<Arm64>, rel: &Relocation) -> u64 {
    match &rel.target {
        RelocTarget::Sym(sym) => ctx.sym_addr(sym),
        RelocTarget::Subsec(subsec) => ctx.subsec_addr(*subsec),
    }
}

impl Arch for Arm64 {
    const NAME: &'static str = "arm64";
    const CPU_TYPE: u32 = cputype::CPU_TYPE_ARM64;
    const CPU_SUBTYPE: u32 = cputype::CPU_SUBTYPE_ARM64_ALL;
    const PAGE_SIZE: u64 = 0x4000;
    const STUB_SIZE: u64 = 12;
    const STUB_HELPER_HDR_SIZE: u64 = 24;
    const STUB_HELPER_ENTRY_SIZE: u64 = 12;
    const ABS_REL: u8 = ARM64_RELOC_UNSIGNED;

    fn reloc_name(ty: u8) -> &'static str {
        arm64_reloc_to_str(ty)
    }

    fn reloc_class(ty: u8) -> RelocClass {
        match ty {
            ARM64_RELOC_UNSIGNED => RelocClass::Abs,
            ARM64_RELOC_GOT_LOAD_PAGE21 | ARM64_RELOC_GOT_LOAD_PAGEOFF12
            | ARM64_RELOC_POINTER_TO_GOT => RelocClass::Got,
            ARM64_RELOC_TLVP_LOAD_PAGE21 | ARM64_RELOC_TLVP_LOAD_PAGEOFF12 => RelocClass::Tlv,
            ARM64_RELOC_BRANCH26 => RelocClass::Branch,
            _ => RelocClass::Other,
        }
    }

    fn parse_relocations(obj: &ObjectFile, hdr: &crate::mach::load_command::Section64) -> Result<Vec<Relocation>> {
        let data = obj.data();
        let nreloc = hdr.nreloc as usize;
        let raw = crate::mach::pod_slice_at::<RelocationInfo>(data, hdr.reloff as usize, nreloc)
            .ok_or_else(|| {
                Error::Malformed(format!("{}: relocations out of bounds", obj.display_name()))
            })?;

        let mut vec: Vec<Relocation> = Vec::with_capacity(nreloc);
        let mut i = 0;
        while i < nreloc {
            let mut addend: i64 = 0;
            match raw[i].r_type() {
                ARM64_RELOC_UNSIGNED | ARM64_RELOC_SUBTRACTOR => {
                    let off = hdr.offset as usize + raw[i].r_address as usize;
                    addend = match raw[i].r_length() {
                        2 => data.pread_with::<i32>(off, scroll::LE)? as i64,
                        3 => data.pread_with::<i64>(off, scroll::LE)?,
                        _ => {
                            return Err(Error::Malformed(format!(
                                "{}: bad relocation size at {:#x}",
                                obj.display_name(),
                                raw[i].r_address
                            )))
                        }
                    };
                }
                ARM64_RELOC_ADDEND => {
                    addend = sign_extend(raw[i].r_symbolnum() as u64, 24);
                    i += 1;
                    if i == nreloc {
                        return Err(Error::Malformed(format!(
                            "{}: dangling ARM64_RELOC_ADDEND",
                            obj.display_name()
                        )));
                    }
                }
                _ => {}
            }

            let r = &raw[i];
            let is_subtracted = vec
                .last()
                .map_or(false, |prev: &Relocation| prev.ty == ARM64_RELOC_SUBTRACTOR)
                && r.r_type() == ARM64_RELOC_UNSIGNED;

            let target;
            let final_addend;
            if r.r_extern() {
                let sym = obj
                    .syms
                    .get(r.r_symbolnum() as usize)
                    .and_then(|s| s.clone())
                    .ok_or_else(|| {
                        Error::Malformed(format!(
                            "{}: bad symbol index in relocation at {:#x}",
                            obj.display_name(),
                            r.r_address
                        ))
                    })?;
                target = RelocTarget::Sym(sym);
                final_addend = addend;
            } else {
                let addr = if r.r_pcrel() {
                    (hdr.addr as i64 + r.r_address as i64 + addend) as u64
                } else {
                    addend as u64
                };
                let idx = obj.find_subsection(addr).ok_or_else(|| {
                    Error::Malformed(format!(
                        "{}: bad relocation at {:#x}",
                        obj.display_name(),
                        r.r_address
                    ))
                })?;
                final_addend = addr as i64 - obj.subsections[idx as usize].input_addr as i64;
                target = RelocTarget::Subsec(SubsecRef {
                    file: obj.file_idx,
                    idx,
                });
            }

            let mut rel = Relocation::new(
                r.r_address as u32,
                r.r_type(),
                r.r_length(),
                r.r_pcrel(),
                target,
            );
            rel.addend = final_addend;
            rel.is_subtracted = is_subtracted;
            vec.push(rel);
            i += 1;
        }
        Ok(vec)
    }

    fn apply_relocations(
        ctx: &Context<Arm64>,
        obj: &ObjectFile,
        rels: &[Relocation],
        subsec_addr: u64,
        isec_type: u32,
        osec: u32,
        buf: &mut [u8],
    ) {
        let mut i = 0;
        while i < rels.len() {
            let r = &rels[i];
            let off = r.offset as usize;

            if let Some(sym) = r.sym() {
                if sym.is_undefined() {
                    ctx.diags.error(format!(
                        "undefined symbol: {}: {}",
                        obj.display_name(),
                        sym.name
                    ));
                    i += 1;
                    continue;
                }
            }

            let mut val = r.addend as u64;
            match r.ty {
                ARM64_RELOC_UNSIGNED | ARM64_RELOC_BRANCH26 | ARM64_RELOC_PAGE21
                | ARM64_RELOC_PAGEOFF12 => {
                    val = val.wrapping_add(target_addr(ctx, r));
                }
                ARM64_RELOC_SUBTRACTOR => {
                    let s = &rels[i + 1];
                    debug_assert_eq!(s.ty, ARM64_RELOC_UNSIGNED);
                    let val1 = target_addr(ctx, r);
                    let val2 = target_addr(ctx, s);
                    val = val.wrapping_add(val2.wrapping_sub(val1));
                    i += 1;
                }
                ARM64_RELOC_GOT_LOAD_PAGE21 | ARM64_RELOC_GOT_LOAD_PAGEOFF12
                | ARM64_RELOC_POINTER_TO_GOT => {
                    val = val.wrapping_add(ctx.sym_got_addr(r.sym().unwrap()));
                }
                ARM64_RELOC_TLVP_LOAD_PAGE21 | ARM64_RELOC_TLVP_LOAD_PAGEOFF12 => {
                    val = val.wrapping_add(ctx.sym_tlv_addr(r.sym().unwrap()));
                }
                _ => {
                    ctx.diags.error(format!(
                        "{}: unknown relocation: {}",
                        obj.display_name(),
                        Self::reloc_name(r.ty)
                    ));
                    i += 1;
                    continue;
                }
            }

            // A thread-local address is an offset from the start of the
            // first thread-local section.
            if isec_type == S_THREAD_LOCAL_VARIABLES {
                val = val.wrapping_sub(ctx.tls_begin);
            }

            let pc = subsec_addr + r.offset as u64;
            match r.ty {
                ARM64_RELOC_UNSIGNED | ARM64_RELOC_SUBTRACTOR | ARM64_RELOC_POINTER_TO_GOT => {
                    if r.is_pcrel {
                        val = val.wrapping_sub(pc);
                    }
                    if r.p2size == 2 {
                        buf.pwrite_with(val as u32, off, scroll::LE).unwrap();
                    } else {
                        buf.pwrite_with(val, off, scroll::LE).unwrap();
                    }
                }
                ARM64_RELOC_BRANCH26 => {
                    if r.thunk_idx >= 0 {
                        let osecs = ctx.osecs.read();
                        let osec = &osecs[osec as usize];
                        val = (r.addend as u64).wrapping_add(
                            osec.thunks[r.thunk_idx as usize]
                                .entry_addr(osec.hdr.sect.addr, r.thunk_sym_idx),
                        );
                    }
                    val = val.wrapping_sub(pc);
                    if (val as i64).unsigned_abs() >= BRANCH_REACH {
                        ctx.diags.error(format!(
                            "{}: branch target out of range",
                            obj.display_name()
                        ));
                    }
                    or32(buf, off, bits(val, 27, 2) as u32);
                }
                ARM64_RELOC_PAGE21 | ARM64_RELOC_GOT_LOAD_PAGE21 | ARM64_RELOC_TLVP_LOAD_PAGE21 => {
                    debug_assert!(r.is_pcrel);
                    or32(buf, off, encode_page(page(val).wrapping_sub(page(pc))));
                }
                ARM64_RELOC_PAGEOFF12 | ARM64_RELOC_GOT_LOAD_PAGEOFF12
                | ARM64_RELOC_TLVP_LOAD_PAGEOFF12 => {
                    debug_assert!(!r.is_pcrel);
                    let insn: u32 = buf.pread_with(off, scroll::LE).unwrap();
                    let mut scale = 0;
                    if insn & 0x3b00_0000 == 0x3900_0000 {
                        // load/store: the operand size lives in the opcode
                        scale = insn >> 30;
                        if scale == 0 && insn & 0x0480_0000 == 0x0480_0000 {
                            scale = 4;
                        }
                    }
                    or32(buf, off, (bits(val, 11, scale) << 10) as u32);
                }
                _ => unreachable!(),
            }
            i += 1;
        }
    }

    fn write_stubs(ctx: &Context<Arm64>, buf: &mut [u8]) {
        // adrp x16, ptr@PAGE; ldr x16, [x16, ptr@PAGEOFF]; br x16
        const INSN: [u32; 3] = [0x9000_0010, 0xf940_0210, 0xd61f_0200];
        for i in 0..ctx.stubs.syms.len() {
            let la_addr = ctx.lazy_symbol_ptr.sect.addr + 8 * i as u64;
            let this_addr = ctx.stubs.hdr.sect.addr + Self::STUB_SIZE * i as u64;
            let mut words = INSN;
            words[0] |= encode_page(page(la_addr).wrapping_sub(page(this_addr)));
            words[1] |= (bits(la_addr, 11, 3) << 10) as u32;
            for (j, word) in words.iter().enumerate() {
                buf.pwrite_with(*word, i * 12 + j * 4, scroll::LE).unwrap();
            }
        }
    }

    fn write_stub_helper(ctx: &Context<Arm64>, buf: &mut [u8]) {
        let this_addr = ctx.stub_helper.sect.addr;

        // adrp x17, __dyld_private@PAGE
        // add  x17, x17, __dyld_private@PAGEOFF
        // stp  x16, x17, [sp, #-16]!
        // adrp x16, dyld_stub_binder@GOT@PAGE
        // ldr  x16, [x16, dyld_stub_binder@GOT@PAGEOFF]
        // br   x16
        let mut hdr: [u32; 6] = [
            0x9000_0011,
            0x9100_0231,
            0xa9bf_47f0,
            0x9000_0010,
            0xf940_0210,
            0xd61f_0200,
        ];

        let dyld_private = ctx.sym_addr(&ctx.symtab.get("__dyld_private"));
        hdr[0] |= encode_page(page(dyld_private).wrapping_sub(page(this_addr)));
        hdr[1] |= (bits(dyld_private, 11, 0) << 10) as u32;

        let stub_binder = ctx.sym_got_addr(&ctx.symtab.get("dyld_stub_binder"));
        hdr[3] |= encode_page(page(stub_binder).wrapping_sub(page(this_addr + 12)));
        hdr[4] |= (bits(stub_binder, 11, 3) << 10) as u32;

        for (j, word) in hdr.iter().enumerate() {
            buf.pwrite_with(*word, j * 4, scroll::LE).unwrap();
        }

        for i in 0..ctx.stubs.syms.len() {
            // ldr w16, <idx>; b <header>; .long <lazy bind offset>
            let entry_off = 24 + i * 12;
            let b_addr = this_addr + entry_off as u64 + 4;
            let disp = this_addr.wrapping_sub(b_addr);
            let words: [u32; 3] = [
                0x1800_0050,
                0x1400_0000 | bits(disp, 27, 2) as u32,
                ctx.stubs.bind_offsets[i],
            ];
            for (j, word) in words.iter().enumerate() {
                buf.pwrite_with(*word, entry_off + j * 4, scroll::LE).unwrap();
            }
        }
    }

    fn compute_osec_size(ctx: &mut Context<Arm64>, osec: u32) -> bool {
        let attrs = {
            let osecs = ctx.osecs.read();
            osecs[osec as usize].hdr.sect.flags
        };
        if attrs & (S_ATTR_SOME_INSTRUCTIONS | S_ATTR_PURE_INSTRUCTIONS) == 0 {
            return false;
        }
        create_range_extension_thunks(ctx, osec);
        true
    }

    fn write_thunks(ctx: &Context<Arm64>, osec: u32, buf: &mut [u8]) {
        let osecs = ctx.osecs.read();
        let osec = &osecs[osec as usize];
        for thunk in &osec.thunks {
            for (i, sym) in thunk.syms.iter().enumerate() {
                let entry_off = thunk.offset as usize + i * THUNK_ENTRY_SIZE as usize;
                let entry_addr = osec.hdr.sect.addr + entry_off as u64;
                let target = ctx.sym_addr(sym);
                // adrp x16, target@PAGE; add x16, x16, target@PAGEOFF; br x16
                let words: [u32; 3] = [
                    0x9000_0010 | encode_page(page(target).wrapping_sub(page(entry_addr))),
                    0x9100_0210 | (bits(target, 11, 0) << 10) as u32,
                    0xd61f_0200,
                ];
                for (j, word) in words.iter().enumerate() {
                    buf.pwrite_with(*word, entry_off + j * 4, scroll::LE).unwrap();
                }
            }
        }
    }
}

/// Lays out an executable section, slicing it into windows and inserting
/// a thunk table at each window boundary once the section grows past the
/// direct reach of `bl`.
///
/// Every branch can reach the thunk table of its own window, and the
/// table's `adrp`/`add`/`br` sequence reaches anywhere, so only branches
/// whose final displacement is provably small keep their direct target.
fn create_range_extension_thunks(ctx: &mut Context<Arm64>, osec_id: u32) {
    let members: Vec<SubsecRef> = {
        let osecs = ctx.osecs.read();
        osecs[osec_id as usize].members.clone()
    };

    // A section comfortably inside the branch reach needs no thunks.
    let mut naive = 0u64;
    for m in &members {
        let subsec = ctx.subsec(*m);
        naive = align_to(naive, 1 << subsec.p2align) + subsec.input_size as u64;
    }
    if naive < BRANCH_REACH - (1 << 20) {
        let mut offset = 0u64;
        for m in &members {
            let subsec = &mut ctx.objs[m.file as usize].subsections[m.idx as usize];
            offset = align_to(offset, 1 << subsec.p2align);
            subsec.output_offset = offset as u32;
            offset += subsec.input_size as u64;
        }
        let osecs = ctx.osecs.get_mut();
        osecs[osec_id as usize].thunks.clear();
        osecs[osec_id as usize].hdr.sect.size = offset;
        return;
    }

    let mut thunks: Vec<Thunk> = Vec::new();
    let mut offset = 0u64;
    let mut window_start = 0u64;
    let mut window: Vec<SubsecRef> = Vec::new();

    let mut flush = |ctx: &mut Context<Arm64>,
                     window: &mut Vec<SubsecRef>,
                     thunks: &mut Vec<Thunk>,
                     offset: &mut u64| {
        let thunk_idx = thunks.len() as i32;
        let mut slots: HashMap<usize, i32> = HashMap::new();
        let mut syms: Vec<Arc<crate::intern::Symbol>> = Vec::new();

        // Decide reachability with shared borrows, then mark the
        // relocations through indices.
        let mut marks: Vec<(SubsecRef, usize, i32)> = Vec::new();
        for m in window.iter() {
            let subsec = ctx.subsec(*m);
            let site_base = subsec.output_offset as u64;
            let rel_range = subsec.rel_range();
            let isec = subsec.isec;
            let obj = &ctx.objs[m.file as usize];
            let rels = &obj.sections[isec as usize].as_ref().unwrap().rels;
            for rel_idx in rel_range {
                let r = &rels[rel_idx];
                if r.ty != ARM64_RELOC_BRANCH26 {
                    continue;
                }
                let sym = match r.sym() {
                    Some(sym) => sym,
                    None => continue,
                };
                let def = sym.def();
                if let Some(target) = def.subsec {
                    let target = ctx.subsec_canonical(target);
                    if ctx.subsec_osec(target) == osec_id {
                        let target_off = ctx.subsec(target).output_offset;
                        if target_off != u32::MAX {
                            let dist = (site_base + r.offset as u64)
                                .abs_diff(target_off as u64 + def.value);
                            if dist < BRANCH_REACH - THUNK_WINDOW {
                                continue;
                            }
                        }
                    }
                }
                let key = Arc::as_ptr(sym) as usize;
                let slot = *slots.entry(key).or_insert_with(|| {
                    syms.push(Arc::clone(sym));
                    syms.len() as i32 - 1
                });
                sym.set_flags(crate::intern::NEEDS_RANGE_EXTN_THUNK);
                sym.thunk_idx.store(thunk_idx, Ordering::Relaxed);
                sym.thunk_sym_idx.store(slot, Ordering::Relaxed);
                marks.push((*m, rel_idx, slot));
            }
        }

        for (m, rel_idx, slot) in marks {
            let isec = ctx.objs[m.file as usize].subsections[m.idx as usize].isec;
            let rels = &mut ctx.objs[m.file as usize].sections[isec as usize]
                .as_mut()
                .unwrap()
                .rels;
            rels[rel_idx].thunk_idx = thunk_idx;
            rels[rel_idx].thunk_sym_idx = slot;
        }

        let thunk = Thunk {
            offset: align_to(*offset, 4),
            syms,
        };
        *offset = thunk.offset + thunk.size();
        thunks.push(thunk);
        window.clear();
    };

    for m in &members {
        let (p2align, size) = {
            let subsec = ctx.subsec(*m);
            (subsec.p2align, subsec.input_size as u64)
        };
        offset = align_to(offset, 1 << p2align);
        if offset + size - window_start > THUNK_WINDOW {
            flush(ctx, &mut window, &mut thunks, &mut offset);
            window_start = offset;
        }
        let subsec = &mut ctx.objs[m.file as usize].subsections[m.idx as usize];
        subsec.output_offset = offset as u32;
        offset += size;
        window.push(*m);
    }
    if !window.is_empty() {
        flush(ctx, &mut window, &mut thunks, &mut offset);
    }

    let osecs = ctx.osecs.get_mut();
    osecs[osec_id as usize].thunks = thunks;
    osecs[osec_id as usize].hdr.sect.size = offset;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_math() {
        assert_eq!(page(0x100003f94), 0x100003000);
        // a delta of exactly one page sets the low immediate bit pair
        assert_eq!(encode_page(0x1000), 1 << 29);
        assert_eq!(encode_page(0x4000), 1 << 5);
    }

    #[test]
    fn adrp_encoding_distributes_bits() {
        // delta with bits in both fields
        let delta = 0x5000u64;
        let enc = encode_page(delta);
        assert_eq!(enc & 0x6000_0000, 1 << 29);
        assert_eq!((enc >> 5) & 0x7ffff, 1);
    }
}
