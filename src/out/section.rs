//! Layout and byte copying for regular output sections.

use crate::arch::Arch;
use crate::ctx::Context;
use crate::input::section::SubsecRef;
use crate::util::align_to;
use rayon::prelude::*;

/// Adds a live subsection to its output section, folding its alignment,
/// attributes and type into the aggregate header.
pub fn add_subsec<A: Arch>(ctx: &mut Context<A>, r: SubsecRef) {
    let (osec_id, attr, ty, p2align) = {
        let subsec = ctx.subsec(r);
        debug_assert!(subsec.is_alive() && !subsec.is_coalesced);
        let obj = &ctx.objs[r.file as usize];
        let isec = obj.sections[subsec.isec as usize].as_ref().unwrap();
        (isec.osec, isec.hdr.attrs(), isec.hdr.sect_type(), subsec.p2align)
    };
    {
        let subsec = &mut ctx.objs[r.file as usize].subsections[r.idx as usize];
        debug_assert!(!subsec.added_to_osec);
        subsec.added_to_osec = true;
    }
    let osec = &mut ctx.osecs.get_mut()[osec_id as usize];
    osec.members.push(r);
    osec.hdr.sect.align = osec.hdr.sect.align.max(p2align as u32);
    osec.hdr.sect.flags |= attr;
    osec.hdr.sect.flags = (osec.hdr.sect.flags & !crate::mach::constants::SECTION_TYPE) | ty;
}

/// Assigns member offsets sequentially. ARM64 takes over for executable
/// sections, where thunk tables may have to be interleaved.
pub fn compute_size<A: Arch>(ctx: &mut Context<A>, osec_id: u32) {
    if A::compute_osec_size(ctx, osec_id) {
        return;
    }

    let members: Vec<SubsecRef> = {
        let osecs = ctx.osecs.read();
        osecs[osec_id as usize].members.clone()
    };

    let mut offset: u64 = 0;
    if osec_id == ctx.data_osec {
        // dyld scribbles over one reserved word at the head of __data;
        // __dyld_private names it
        offset = 8;
    }

    for m in &members {
        let subsec = &mut ctx.objs[m.file as usize].subsections[m.idx as usize];
        offset = align_to(offset, 1 << subsec.p2align);
        subsec.output_offset = offset as u32;
        offset += subsec.input_size as u64;
    }

    ctx.osecs.get_mut()[osec_id as usize].hdr.sect.size = offset;
}

/// Copies member bytes and applies their relocations, each member into
/// its own disjoint slice of the section's buffer.
pub fn copy_buf<A: Arch>(ctx: &Context<A>, osec_id: u32, buf: &mut [u8]) {
    A::write_thunks(ctx, osec_id, buf);

    let members: Vec<SubsecRef> = {
        let osecs = ctx.osecs.read();
        osecs[osec_id as usize].members.clone()
    };

    let mut jobs: Vec<(SubsecRef, &mut [u8])> = Vec::with_capacity(members.len());
    let mut rest = buf;
    let mut base = 0u64;
    for m in members {
        let subsec = ctx.subsec(m);
        let start = subsec.output_offset as u64;
        let size = subsec.input_size as u64;
        let (_, tail) = rest.split_at_mut((start - base) as usize);
        let (slice, tail) = tail.split_at_mut(size as usize);
        rest = tail;
        base = start + size;
        jobs.push((m, slice));
    }

    jobs.into_par_iter().for_each(|(m, slice)| {
        let subsec = ctx.subsec(m);
        let obj = &ctx.objs[m.file as usize];
        let isec = obj.sections[subsec.isec as usize].as_ref().unwrap();
        if !isec.contents.is_empty() {
            let lo = isec.contents.start + subsec.input_offset as usize;
            slice.copy_from_slice(&obj.data()[lo..lo + subsec.input_size as usize]);
        }
        A::apply_relocations(
            ctx,
            obj,
            &isec.rels[subsec.rel_range()],
            ctx.subsec_addr(m),
            isec.hdr.sect_type(),
            osec_id,
            slice,
        );
    });
}
