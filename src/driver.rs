//! The link pipeline: read inputs, resolve, scan, strip, lay out, copy,
//! sign. Each pass is bulk-parallel internally and ends at a barrier;
//! semantic errors accumulate and abort at the next checkpoint.

use crate::arch::{Arch, RelocClass};
use crate::cmdline::{find_framework, find_library, InputSpec};
use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::input::section::Relocation;
use crate::input::{file_kind, DylibFile, FileKind, MappedFile, ObjectFile};
use crate::intern::{FileId, NEEDS_GOT, NEEDS_STUB, NEEDS_THREAD_PTR};
use crate::mach::header::MH_EXECUTE;
use crate::opt::LinkOptions;
use crate::out::stubs::{add_got, add_stub, add_thread_ptr};
use rayon::prelude::*;
use std::sync::Arc;

pub fn link<A: Arch>(opts: LinkOptions, output_type: u32, inputs: &[InputSpec]) -> Result<()> {
    let mut ctx = Context::<A>::new(opts, output_type);

    crate::resolve::add_synthetic_symbols(&mut ctx);
    read_files(&mut ctx, inputs)?;
    crate::lto::do_lto(&mut ctx)?;
    parse_files(&mut ctx)?;

    crate::resolve::resolve_symbols(&mut ctx)?;

    if ctx.output_type == MH_EXECUTE {
        let entry = ctx.symtab.get(&ctx.arg.entry);
        if entry.is_undefined() {
            ctx.diags
                .error(format!("undefined entry point symbol: {}", ctx.arg.entry));
        }
        ctx.entry_sym = Some(entry);
    }
    ctx.checkpoint()?;

    if ctx.arg.dead_strip {
        crate::dead_strip::dead_strip(&mut ctx);
    }
    crate::layout::coalesce_cstrings(&mut ctx);

    scan_relocations(&mut ctx);
    ctx.checkpoint()?;
    assign_import_indices(&mut ctx);
    ctx.checkpoint()?;
    assign_dylib_ordinals(&mut ctx);

    crate::layout::create_synthetic_chunks(&mut ctx);
    let filesize = crate::layout::assign_offsets(&mut ctx);

    let mut output = crate::output_file::OutputFile::open(&ctx.arg.output, filesize, 0o777)?;
    crate::layout::copy_output(&ctx, output.buf_mut());
    ctx.checkpoint()?;

    crate::out::code_sig::write_signature(&mut ctx, output.buf_mut());
    crate::out::code_sig::invalidate(output.buf_mut());
    output.close()?;

    if !ctx.arg.map.is_empty() {
        crate::mapfile::print_map(&ctx)?;
    }
    Ok(())
}

fn read_files<A: Arch>(ctx: &mut Context<A>, inputs: &[InputSpec]) -> Result<()> {
    let mut priority: i64 = 1;
    for spec in inputs {
        let (path, forced_needed) = match spec {
            InputSpec::File(path) => (path.clone(), false),
            InputSpec::Lib { name, needed } => (
                find_library(&ctx.arg, name).ok_or_else(|| {
                    Error::Malformed(format!("library not found: -l{}", name))
                })?,
                *needed,
            ),
            InputSpec::Framework { name, needed } => (
                find_framework(&ctx.arg, name).ok_or_else(|| {
                    Error::Malformed(format!("framework not found: {}", name))
                })?,
                *needed,
            ),
        };
        read_file(ctx, &path, forced_needed, &mut priority)?;
    }
    Ok(())
}

fn read_file<A: Arch>(
    ctx: &mut Context<A>,
    path: &str,
    forced_needed: bool,
    priority: &mut i64,
) -> Result<()> {
    let mf = MappedFile::open(path)?;
    if ctx.arg.trace {
        log::info!("{}", path);
    }

    match file_kind(mf.data()) {
        FileKind::Object => {
            let idx = ctx.objs.len() as u32;
            ctx.objs
                .push(ObjectFile::new(mf, String::new(), idx, *priority, true));
            *priority += 1;
        }
        FileKind::LlvmBitcode => {
            let idx = ctx.objs.len() as u32;
            let mut obj = ObjectFile::new(mf, String::new(), idx, *priority, true);
            obj.is_lto = true;
            ctx.objs.push(obj);
            *priority += 1;
        }
        FileKind::Dylib => {
            let idx = ctx.dylibs.len() as u32;
            let mut dylib = DylibFile::from_binary(&mf, idx, *priority)?;
            dylib.is_forced_needed = forced_needed;
            ctx.dylibs.push(dylib);
            *priority += 1;
        }
        FileKind::Tbd => {
            let contents = std::str::from_utf8(mf.data())
                .map_err(|_| Error::Malformed(format!("{}: not valid UTF-8", path)))?;
            let tbd = crate::tbd::parse_tbd(contents, path, A::NAME, &ctx.arg)?;
            let idx = ctx.dylibs.len() as u32;
            let mut dylib = DylibFile::from_tbd(tbd, path.to_string(), idx, *priority);
            dylib.is_forced_needed = forced_needed;
            ctx.dylibs.push(dylib);
            *priority += 1;
        }
        FileKind::Archive => {
            for member in crate::input::archive::members(&mf)? {
                let member_mf = mf.slice(member.name.clone(), member.range);
                match file_kind(member_mf.data()) {
                    FileKind::Object => {
                        let idx = ctx.objs.len() as u32;
                        ctx.objs.push(ObjectFile::new(
                            member_mf,
                            path.to_string(),
                            idx,
                            *priority,
                            false,
                        ));
                        *priority += 1;
                    }
                    FileKind::LlvmBitcode => {
                        let idx = ctx.objs.len() as u32;
                        let mut obj = ObjectFile::new(
                            member_mf,
                            path.to_string(),
                            idx,
                            *priority,
                            false,
                        );
                        obj.is_lto = true;
                        ctx.objs.push(obj);
                        *priority += 1;
                    }
                    _ => {
                        log::trace!("{}({}): skipping non-object member", path, member.name);
                    }
                }
            }
        }
        FileKind::Unknown => {
            return Err(Error::Malformed(format!("{}: unknown file type", path)));
        }
    }
    Ok(())
}

fn parse_files<A: Arch>(ctx: &mut Context<A>) -> Result<()> {
    let Context {
        objs,
        dylibs,
        osecs,
        symtab,
        ..
    } = ctx;

    objs.par_iter_mut().try_for_each(|obj| {
        if obj.is_lto || obj.data().is_empty() {
            return Ok(());
        }
        obj.parse::<A>(osecs, symtab)
    })?;

    for dylib in dylibs.iter_mut() {
        dylib.intern_exports(symtab);
    }
    Ok(())
}

fn scan_reloc<A: Arch>(
    rel: &mut Relocation,
    dylibs: &[DylibFile],
    diags: &crate::error::Diags,
    location: &str,
) {
    let sym = match rel.sym() {
        Some(sym) => Arc::clone(sym),
        None => return,
    };
    let def = sym.def();

    if def.is_imported {
        if let FileId::Dylib(i) = def.file {
            dylibs[i as usize].set_needed();
        }
    }

    match A::reloc_class(rel.ty) {
        RelocClass::Abs if !rel.is_subtracted => {
            if def.is_imported {
                if rel.p2size != 3 {
                    diags.error(format!(
                        "{}: {} relocation at offset {:#x} against symbol `{}' can not be used",
                        location,
                        A::reloc_name(rel.ty),
                        rel.offset,
                        sym.name
                    ));
                } else {
                    rel.needs_dynrel = true;
                }
            }
        }
        RelocClass::Got => sym.set_flags(NEEDS_GOT),
        RelocClass::Tlv => sym.set_flags(NEEDS_THREAD_PTR),
        _ => {}
    }

    if def.is_imported {
        sym.set_flags(NEEDS_STUB);
    }
}

/// Walks every live subsection's relocations, marking needed dylibs and
/// requesting GOT/stub/thread-pointer slots. Unwind personalities are
/// reached through the GOT too.
fn scan_relocations<A: Arch>(ctx: &mut Context<A>) {
    let Context {
        objs,
        dylibs,
        diags,
        ..
    } = ctx;

    objs.par_iter_mut().for_each(|obj| {
        if !obj.alive() {
            return;
        }
        let location = obj.display_name();

        let ranges: Vec<(usize, std::ops::Range<usize>)> = obj
            .subsections
            .iter()
            .filter(|subsec| subsec.is_alive() && subsec.nrels > 0)
            .map(|subsec| (subsec.isec as usize, subsec.rel_range()))
            .collect();
        for (si, range) in ranges {
            let isec = obj.sections[si].as_mut().unwrap();
            for rel in &mut isec.rels[range] {
                scan_reloc::<A>(rel, dylibs, diags, &location);
            }
        }

        for subsec in &obj.subsections {
            if !subsec.is_alive() {
                continue;
            }
            for rec in &obj.unwind_records[subsec.unwind_range()] {
                if let Some(personality) = &rec.personality {
                    personality.set_flags(NEEDS_GOT);
                    if let FileId::Dylib(i) = personality.def().file {
                        dylibs[i as usize].set_needed();
                    }
                }
            }
        }
    });
}

/// Serially assigns the dense stub/GOT/thread-pointer indices in file
/// priority order; the assignment order is the output order.
fn assign_import_indices<A: Arch>(ctx: &mut Context<A>) {
    let mut order: Vec<Arc<crate::intern::Symbol>> = Vec::new();
    for obj in &ctx.objs {
        if !obj.alive() {
            continue;
        }
        for sym in obj.syms.iter().flatten() {
            if sym.def().file == FileId::Obj(obj.file_idx) && sym.flags.load(std::sync::atomic::Ordering::Relaxed) != 0 {
                order.push(Arc::clone(sym));
            }
        }
    }
    for dylib in &ctx.dylibs {
        for sym in &dylib.syms {
            if sym.def().file == FileId::Dylib(dylib.file_idx)
                && sym.flags.load(std::sync::atomic::Ordering::Relaxed) != 0
            {
                order.push(Arc::clone(sym));
            }
        }
    }

    for sym in order {
        if sym.has_flag(NEEDS_STUB) && sym.stub_idx() == -1 {
            add_stub(ctx, Arc::clone(&sym));
        }
        if sym.has_flag(NEEDS_GOT) && sym.got_idx() == -1 {
            add_got(ctx, Arc::clone(&sym));
        }
        if sym.has_flag(NEEDS_THREAD_PTR) && sym.tlv_idx() == -1 {
            add_thread_ptr(ctx, Arc::clone(&sym));
        }
    }

    // lazy binding bottoms out in dyld_stub_binder, reached through the
    // GOT from the stub helper
    if !ctx.stubs.syms.is_empty() {
        let binder = ctx.symtab.get("dyld_stub_binder");
        if binder.is_undefined() {
            ctx.diags
                .error("undefined symbol: dyld_stub_binder".to_string());
        } else if binder.got_idx() == -1 {
            add_got(ctx, binder);
        }
    }
}

/// Gives each surviving dylib its load-command ordinal. With
/// `-dead_strip_dylibs`, a dylib survives only if something used it, it
/// is re-exported, or the command line pinned it.
fn assign_dylib_ordinals<A: Arch>(ctx: &mut Context<A>) {
    let dead_strip_dylibs = ctx.arg.dead_strip_dylibs;
    let mut idx = 1;
    for dylib in ctx.dylibs.iter_mut() {
        let keep = !dead_strip_dylibs
            || dylib.needed()
            || dylib.is_reexported
            || dylib.is_forced_needed;
        dylib
            .is_alive
            .store(keep, std::sync::atomic::Ordering::Relaxed);
        if keep {
            dylib.dylib_idx = idx;
            idx += 1;
        }
    }
}
