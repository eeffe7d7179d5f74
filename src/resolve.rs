//! Symbol resolution: every file offers its definitions to the interned
//! symbols, the best candidate wins, and archives contribute members
//! only when they resolve an undefined reference.
//!
//! Resolution runs twice. A parallel discovery round lets archive
//! members claim symbols so the activation fixpoint can find them; once
//! the set of alive files has converged, claims are wiped and a final
//! round over alive files rebuilds the deterministic end state.

use crate::arch::Arch;
use crate::ctx::Context;
use crate::error::Result;
use crate::input::section::SubsecRef;
use crate::input::{MappedFile, ObjectFile};
use crate::intern::{FileId, Scope, Symbol, SymbolDef};
use crate::mach::header::{MH_BUNDLE, MH_DYLIB, MH_EXECUTE};
use crate::mach::symbols::{N_ABS, N_SECT};
use rayon::prelude::*;
use std::sync::Arc;

/// Precedence of a definition; lower wins, ties break on file priority.
/// Definitions in not-yet-loaded archive members rank below the same
/// kind from a loaded file, so a member is only pulled in when nothing
/// better exists.
fn rank_parts(alive: bool, is_dylib: bool, is_common: bool, is_weak: bool) -> u32 {
    let base = if is_dylib {
        if is_weak {
            7
        } else {
            6
        }
    } else if is_common {
        4
    } else if is_weak {
        2
    } else {
        0
    };
    base + if alive || is_dylib { 0 } else { 1 }
}

fn rank_of<A: Arch>(ctx: &Context<A>, def: &SymbolDef) -> u32 {
    match def.file {
        FileId::None => u32::MAX,
        FileId::Obj(i) => rank_parts(
            ctx.objs[i as usize].alive(),
            false,
            def.is_common,
            def.is_weak,
        ),
        FileId::Dylib(_) => rank_parts(true, true, false, def.is_weak),
    }
}

fn try_claim<A: Arch>(ctx: &Context<A>, sym: &Symbol, cand: SymbolDef, cand_rank: u32) {
    let cand_key = (cand_rank, ctx.file_priority(cand.file));
    sym.update(|def| {
        let cur_key = (rank_of(ctx, def), ctx.file_priority(def.file));
        if cand_key < cur_key {
            *def = cand;
        }
    });
}

fn resolve_object<A: Arch>(ctx: &Context<A>, obj_idx: usize) {
    let obj = &ctx.objs[obj_idx];
    let alive = obj.alive();
    for (i, nlist) in obj.nlists.iter().enumerate() {
        if nlist.is_stab() || !nlist.is_extern() {
            continue;
        }
        let sym = match &obj.syms[i] {
            Some(sym) => sym,
            None => continue,
        };

        let scope = if nlist.is_private_extern() {
            Scope::PrivateExtern
        } else {
            Scope::Extern
        };

        if nlist.is_common() {
            let cand = SymbolDef {
                file: FileId::Obj(obj.file_idx),
                subsec: None,
                value: nlist.n_value,
                scope,
                is_imported: false,
                is_common: true,
                is_weak: false,
                no_dead_strip: nlist.no_dead_strip(),
                referenced_dynamically: nlist.referenced_dynamically(),
            };
            try_claim(ctx, sym, cand, rank_parts(alive, false, true, false));
            continue;
        }

        let (subsec, value) = match nlist.n_type_bits() {
            N_SECT => {
                let subsec = match obj.sym_to_subsec[i] {
                    Some(subsec) => subsec,
                    None => continue,
                };
                let base = obj.subsections[subsec as usize].input_addr as u64;
                (
                    Some(SubsecRef {
                        file: obj.file_idx,
                        idx: subsec,
                    }),
                    nlist.n_value - base,
                )
            }
            N_ABS => (None, nlist.n_value),
            _ => continue,
        };

        let cand = SymbolDef {
            file: FileId::Obj(obj.file_idx),
            subsec,
            value,
            scope,
            is_imported: false,
            is_common: false,
            is_weak: nlist.is_weak_def(),
            no_dead_strip: nlist.no_dead_strip(),
            referenced_dynamically: nlist.referenced_dynamically(),
        };
        try_claim(
            ctx,
            sym,
            cand,
            rank_parts(alive, false, false, nlist.is_weak_def()),
        );
    }
}

fn resolve_dylib<A: Arch>(ctx: &Context<A>, dylib_idx: usize) {
    let dylib = &ctx.dylibs[dylib_idx];
    for (i, sym) in dylib.syms.iter().enumerate() {
        let weak = dylib.exports[i].1;
        let cand = SymbolDef {
            file: FileId::Dylib(dylib.file_idx),
            subsec: None,
            value: 0,
            scope: Scope::Local,
            is_imported: true,
            is_common: false,
            is_weak: weak,
            no_dead_strip: false,
            referenced_dynamically: false,
        };
        try_claim(ctx, sym, cand, rank_parts(true, true, false, weak));
    }
}

/// Defines the handful of symbols the linker itself provides. They live
/// in a synthetic object at priority 0; their values are filled in after
/// layout, once the segment addresses exist.
pub fn add_synthetic_symbols<A: Arch>(ctx: &mut Context<A>) {
    debug_assert!(ctx.objs.is_empty());
    let mut obj = ObjectFile::new(
        MappedFile::from_vec("<internal>".to_string(), Vec::new()),
        String::new(),
        0,
        0,
        true,
    );

    let mut add = |name: &str, scope: Scope, referenced_dynamically: bool| {
        let sym = ctx.symtab.get(name);
        sym.update(|def| {
            def.file = FileId::Obj(0);
            def.subsec = None;
            def.value = 0;
            def.scope = scope;
            def.no_dead_strip = true;
            def.referenced_dynamically = referenced_dynamically;
        });
        obj.syms.push(Some(sym));
    };

    match ctx.output_type {
        MH_EXECUTE => add("__mh_execute_header", Scope::Extern, true),
        MH_DYLIB => add("__mh_dylib_header", Scope::PrivateExtern, false),
        MH_BUNDLE => add("__mh_bundle_header", Scope::PrivateExtern, false),
        _ => {}
    }
    add("___dso_handle", Scope::PrivateExtern, false);
    add("__dyld_private", Scope::Local, false);

    ctx.objs.push(obj);
}

/// After layout the synthetic symbols get their real addresses: the
/// Mach header for the `__mh_*` markers, the reserved word at the head
/// of `__data` for `__dyld_private`.
pub fn fix_synthetic_symbols<A: Arch>(ctx: &Context<A>) {
    let header_addr = ctx.arg.pagezero_size;
    let data_addr = {
        let osecs = ctx.osecs.read();
        osecs[ctx.data_osec as usize].hdr.sect.addr
    };
    for name in ["__mh_execute_header", "__mh_dylib_header", "__mh_bundle_header", "___dso_handle"] {
        if let Some(sym) = ctx.symtab.lookup(name) {
            sym.update(|def| {
                if def.file == FileId::Obj(0) {
                    def.value = header_addr;
                }
            });
        }
    }
    if let Some(sym) = ctx.symtab.lookup("__dyld_private") {
        sym.update(|def| {
            if def.file == FileId::Obj(0) {
                def.value = data_addr;
            }
        });
    }
}

/// Walks undefined references of alive objects and wakes the archive
/// members that define them, to a fixed point.
fn mark_live_objects<A: Arch>(ctx: &Context<A>) {
    let mut queue: Vec<usize> = (0..ctx.objs.len())
        .filter(|&i| ctx.objs[i].alive())
        .collect();

    while let Some(i) = queue.pop() {
        let obj = &ctx.objs[i];
        for (j, nlist) in obj.nlists.iter().enumerate() {
            if nlist.is_stab() || !nlist.is_extern() || !nlist.is_undefined() {
                continue;
            }
            // a weak reference is content to stay unresolved
            if nlist.is_weak_ref() {
                continue;
            }
            let sym = match &obj.syms[j] {
                Some(sym) => sym,
                None => continue,
            };
            if let FileId::Obj(owner) = sym.def().file {
                let owner = owner as usize;
                if !ctx.objs[owner].alive() {
                    ctx.objs[owner].set_alive();
                    if ctx.arg.trace {
                        log::info!("loading {}", ctx.objs[owner].display_name());
                    }
                    queue.push(owner);
                }
            }
        }
    }
}

pub fn resolve_symbols<A: Arch>(ctx: &mut Context<A>) -> Result<()> {
    // discovery round: everything, in parallel
    {
        let ctx = &*ctx;
        (0..ctx.objs.len())
            .into_par_iter()
            .for_each(|i| resolve_object(ctx, i));
        (0..ctx.dylibs.len())
            .into_par_iter()
            .for_each(|i| resolve_dylib(ctx, i));
    }

    // -ObjC wakes any member that implements a class or category
    if ctx.arg.objc {
        for obj in &ctx.objs {
            if !obj.alive() && !obj.archive_name.is_empty() && obj.is_objc_object() {
                obj.set_alive();
            }
        }
    }

    mark_live_objects(&*ctx);

    // wipe the discovery claims of interned symbols; the synthetic
    // object keeps its own
    for obj in ctx.objs.iter().skip(1) {
        for (i, sym) in obj.syms.iter().enumerate() {
            if let Some(sym) = sym {
                if obj.nlists[i].is_extern() {
                    sym.update(|def| *def = SymbolDef::default());
                }
            }
        }
    }
    for dylib in &ctx.dylibs {
        for sym in &dylib.syms {
            sym.update(|def| *def = SymbolDef::default());
        }
    }

    // the deterministic final round, over survivors only
    {
        let ctx = &*ctx;
        for i in 1..ctx.objs.len() {
            if ctx.objs[i].alive() {
                resolve_object(ctx, i);
            }
        }
        for i in 0..ctx.dylibs.len() {
            resolve_dylib(ctx, i);
        }
    }

    convert_common_symbols(ctx);
    check_duplicate_symbols(&*ctx);
    ctx.checkpoint()
}

/// Surviving common symbols become zero-filled subsections in a
/// synthetic `__DATA,__common` section of their owning object.
fn convert_common_symbols<A: Arch>(ctx: &mut Context<A>) {
    let common_osec = ctx.common_osec;
    for oi in 0..ctx.objs.len() {
        if !ctx.objs[oi].alive() {
            continue;
        }
        let file_idx = ctx.objs[oi].file_idx;
        for i in 0..ctx.objs[oi].nlists.len() {
            let nlist = ctx.objs[oi].nlists[i];
            if !nlist.is_common() {
                continue;
            }
            let sym = match ctx.objs[oi].syms[i].clone() {
                Some(sym) => sym,
                None => continue,
            };
            let def = sym.def();
            if def.file != FileId::Obj(file_idx) || !def.is_common {
                continue;
            }
            let size = def.value;
            let p2align = if nlist.common_p2align() != 0 {
                nlist.common_p2align()
            } else {
                (64 - size.leading_zeros() as u8).min(4)
            };
            let subsec = ctx.objs[oi].add_common_subsection(common_osec, size, p2align);
            sym.update(|d| {
                d.subsec = Some(SubsecRef {
                    file: file_idx,
                    idx: subsec,
                });
                d.value = 0;
                d.is_common = false;
            });
        }
    }
}

fn check_duplicate_symbols<A: Arch>(ctx: &Context<A>) {
    for obj in &ctx.objs {
        if !obj.alive() || obj.file_idx == 0 {
            continue;
        }
        for (i, nlist) in obj.nlists.iter().enumerate() {
            if nlist.is_stab()
                || !nlist.is_extern()
                || nlist.is_weak_def()
                || nlist.is_common()
                || nlist.n_type_bits() != N_SECT
                || obj.sym_to_subsec[i].is_none()
            {
                continue;
            }
            let sym: &Arc<Symbol> = match &obj.syms[i] {
                Some(sym) => sym,
                None => continue,
            };
            let owner = sym.def();
            if owner.file == FileId::Obj(obj.file_idx) || owner.is_weak || owner.is_common {
                continue;
            }
            if let FileId::Obj(_) = owner.file {
                ctx.diags.error(format!(
                    "duplicate symbol: {}: {}: {}",
                    ctx.file_name(owner.file),
                    obj.display_name(),
                    sym.name
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_ordering() {
        // strong beats weak beats common beats dylib beats nothing
        let strong = rank_parts(true, false, false, false);
        let weak = rank_parts(true, false, false, true);
        let common = rank_parts(true, false, true, false);
        let dylib = rank_parts(true, true, false, false);
        let dylib_weak = rank_parts(true, true, false, true);
        assert!(strong < weak && weak < common && common < dylib && dylib < dylib_weak);
        // a definition in an unloaded archive member loses to the same
        // kind in a loaded object
        assert!(rank_parts(true, false, false, false) < rank_parts(false, false, false, false));
        assert!(rank_parts(false, false, false, false) < rank_parts(true, false, false, true));
    }
}
