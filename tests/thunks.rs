//! Range-extension thunks: an executable section larger than the direct
//! reach of `bl` gets windowed thunk tables, and far branches are routed
//! through them.

mod common;

use common::*;
use machld::arch::Arm64;
use machld::ctx::Context;
use machld::input::section::{RelocTarget, Relocation, SubsecRef, Subsection};
use machld::input::{InputSection, MappedFile, ObjectFile};
use machld::intern::{FileId, Scope, NEEDS_RANGE_EXTN_THUNK};
use machld::mach::constants::*;
use machld::mach::header::MH_EXECUTE;
use machld::mach::load_command::Section64;
use machld::mach::relocation::ARM64_RELOC_BRANCH26;
use machld::out;
use machld::util::pack_name;

const CHUNK: u32 = 0x300_0000; // 48 MiB of code per subsection

#[test]
fn far_branches_get_thunks() {
    let opts = base_opts("unused", true);
    let mut ctx = Context::<Arm64>::new(opts, MH_EXECUTE);

    let far = ctx.symtab.get("_far");
    far.update(|def| {
        def.file = FileId::Obj(0);
        def.subsec = Some(SubsecRef { file: 0, idx: 2 });
        def.value = 0;
        def.scope = Scope::Extern;
    });

    let mut obj = ObjectFile::new(
        MappedFile::from_vec("big.o".to_string(), Vec::new()),
        String::new(),
        0,
        0,
        true,
    );
    let hdr = Section64 {
        sectname: pack_name("__text"),
        segname: pack_name("__TEXT"),
        addr: 0,
        size: 3 * CHUNK as u64,
        align: 2,
        flags: S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
        ..Default::default()
    };
    // a single bl at the very start of the section, aimed at a symbol
    // 96 MiB later
    let mut rel = Relocation::new(0, ARM64_RELOC_BRANCH26, 2, true, RelocTarget::Sym(far.clone()));
    rel.addend = 0;
    obj.sections.push(Some(InputSection {
        hdr,
        secidx: 1,
        osec: ctx.text_osec,
        contents: 0..0,
        rels: vec![rel],
    }));
    for i in 0..3u32 {
        let mut subsec = Subsection::new(0, i * CHUNK, CHUNK, i * CHUNK, 2);
        if i == 0 {
            subsec.rel_offset = 0;
            subsec.nrels = 1;
        }
        obj.subsections.push(subsec);
    }
    ctx.objs.push(obj);

    let text_osec = ctx.text_osec;
    for idx in 0..3 {
        out::section::add_subsec(&mut ctx, SubsecRef { file: 0, idx });
    }
    out::section::compute_size::<Arm64>(&mut ctx, text_osec);

    let osecs = ctx.osecs.read();
    let text = &osecs[text_osec as usize];
    assert!(
        !text.thunks.is_empty(),
        "a 144 MiB text section must grow thunk tables"
    );
    assert!(text.hdr.sect.size >= 3 * CHUNK as u64);

    // the branch was rerouted through the first window's table
    let rel = &ctx.objs[0].sections[0].as_ref().unwrap().rels[0];
    assert_eq!(rel.thunk_idx, 0);
    assert_eq!(rel.thunk_sym_idx, 0);
    let thunk = &text.thunks[0];
    assert_eq!(thunk.syms.len(), 1);
    assert!(far.has_flag(NEEDS_RANGE_EXTN_THUNK));

    // the table is within direct reach of the branch site, and every
    // placed subsection kept its place
    let site = ctx.objs[0].subsections[0].output_offset as u64;
    let entry = thunk.offset;
    assert!(entry.abs_diff(site) < 1 << 27);
    for (i, subsec) in ctx.objs[0].subsections.iter().enumerate() {
        assert_ne!(subsec.output_offset, u32::MAX, "subsection {} unplaced", i);
    }

    // near branches in a small section stay direct: recompute with a
    // section that fits
    drop(osecs);
    let mut small = Context::<Arm64>::new(base_opts("unused", true), MH_EXECUTE);
    let near = small.symtab.get("_near");
    near.update(|def| {
        def.file = FileId::Obj(0);
        def.subsec = Some(SubsecRef { file: 0, idx: 1 });
        def.scope = Scope::Extern;
    });
    let mut obj = ObjectFile::new(
        MappedFile::from_vec("small.o".to_string(), Vec::new()),
        String::new(),
        0,
        0,
        true,
    );
    let hdr = Section64 {
        sectname: pack_name("__text"),
        segname: pack_name("__TEXT"),
        size: 0x2000,
        align: 2,
        flags: S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
        ..Default::default()
    };
    let mut rel = Relocation::new(0, ARM64_RELOC_BRANCH26, 2, true, RelocTarget::Sym(near));
    rel.addend = 0;
    obj.sections.push(Some(InputSection {
        hdr,
        secidx: 1,
        osec: small.text_osec,
        contents: 0..0,
        rels: vec![rel],
    }));
    let mut first = Subsection::new(0, 0, 0x1000, 0, 2);
    first.rel_offset = 0;
    first.nrels = 1;
    obj.subsections.push(first);
    obj.subsections.push(Subsection::new(0, 0x1000, 0x1000, 0x1000, 2));
    small.objs.push(obj);
    let small_text = small.text_osec;
    for idx in 0..2 {
        out::section::add_subsec(&mut small, SubsecRef { file: 0, idx });
    }
    out::section::compute_size::<Arm64>(&mut small, small_text);

    let osecs = small.osecs.read();
    assert!(osecs[small_text as usize].thunks.is_empty());
    assert_eq!(
        small.objs[0].sections[0].as_ref().unwrap().rels[0].thunk_idx,
        -1
    );
}
