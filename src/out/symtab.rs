//! The output symbol and string tables.
//!
//! Output symbols fall into three contiguous groups - locals, defined
//! externs, undefineds - sorted stably by address within each group;
//! `LC_DYSYMTAB` advertises the group boundaries.

use crate::arch::Arch;
use crate::ctx::Context;
use crate::intern::{FileId, Scope};
use crate::mach::symbols::*;
use crate::util::align_to_usize;

pub struct SymtabArtifact {
    pub nlists: Vec<Nlist64>,
    pub strtab: Vec<u8>,
    pub num_locals: u64,
    pub num_globals: u64,
    pub num_undefs: u64,
}

fn rank(nlist: &Nlist64) -> u8 {
    if nlist.n_type_bits() == N_UNDF && nlist.n_type & N_EXT != 0 {
        2
    } else if nlist.n_type & N_EXT != 0 {
        1
    } else {
        0
    }
}

pub fn build_symtab<A: Arch>(ctx: &Context<A>) -> SymtabArtifact {
    let mut strtab: Vec<u8> = vec![0];
    let mut entries: Vec<Nlist64> = Vec::new();

    let mut add_name = |strtab: &mut Vec<u8>, name: &str| -> u32 {
        let off = strtab.len() as u32;
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
        off
    };

    // one N_AST stab per -add_ast_path, ahead of everything
    for path in &ctx.arg.add_ast_path {
        entries.push(Nlist64 {
            n_strx: add_name(&mut strtab, path),
            n_type: N_AST,
            n_sect: NO_SECT,
            n_desc: 0,
            n_value: 0,
        });
    }

    let (text_sect_idx, data_sect_idx) = {
        let osecs = ctx.osecs.read();
        (
            osecs[ctx.text_osec as usize].hdr.sect_idx as u8,
            osecs[ctx.data_osec as usize].hdr.sect_idx as u8,
        )
    };

    for obj in &ctx.objs {
        if !obj.alive() {
            continue;
        }
        for sym in obj.syms.iter().flatten() {
            let def = sym.def();
            if def.file != FileId::Obj(obj.file_idx) {
                continue;
            }
            if let Some(subsec) = def.subsec {
                if !ctx.subsec(subsec).is_alive() {
                    continue;
                }
            }

            let is_extern = def.scope == Scope::Extern;
            let (n_type, n_sect) = match def.subsec {
                Some(subsec) => {
                    let osec = ctx.subsec_osec(subsec);
                    let sect_idx = ctx.osecs.read()[osec as usize].hdr.sect_idx as u8;
                    (N_SECT, sect_idx)
                }
                // the linker-provided markers live at well-known spots
                None if sym.name.as_ref() == "__mh_execute_header" => (N_SECT, text_sect_idx),
                None if matches!(
                    sym.name.as_ref(),
                    "__dyld_private" | "__mh_dylib_header" | "__mh_bundle_header" | "___dso_handle"
                ) =>
                {
                    (N_SECT, data_sect_idx)
                }
                None => (N_ABS, NO_SECT),
            };

            let mut n_desc = 0u16;
            if def.referenced_dynamically {
                n_desc |= REFERENCED_DYNAMICALLY;
            }

            entries.push(Nlist64 {
                n_strx: add_name(&mut strtab, &sym.name),
                n_type: n_type | if is_extern { N_EXT } else { 0 },
                n_sect,
                n_desc,
                n_value: ctx.sym_addr(sym),
            });
        }
    }

    for dylib in &ctx.dylibs {
        if !dylib.alive() {
            continue;
        }
        for sym in &dylib.syms {
            let def = sym.def();
            if def.file != FileId::Dylib(dylib.file_idx) {
                continue;
            }
            if sym.stub_idx() == -1 && sym.got_idx() == -1 {
                continue;
            }
            entries.push(Nlist64 {
                n_strx: add_name(&mut strtab, &sym.name),
                n_type: N_UNDF | N_EXT,
                n_sect: NO_SECT,
                n_desc: (dylib.dylib_idx as u16) << 8,
                n_value: 0,
            });
        }
    }

    entries.sort_by_key(|nlist| (rank(nlist), nlist.n_value));

    let num_locals = entries.iter().filter(|n| rank(n) == 0).count() as u64;
    let num_globals = entries.iter().filter(|n| rank(n) == 1).count() as u64;
    let num_undefs = entries.iter().filter(|n| rank(n) == 2).count() as u64;

    strtab.resize(align_to_usize(strtab.len(), 8), 0);

    SymtabArtifact {
        nlists: entries,
        strtab,
        num_locals,
        num_globals,
        num_undefs,
    }
}

/// Serializes the sorted nlists into the symtab chunk's slice.
pub fn copy_buf<A: Arch>(ctx: &Context<A>, buf: &mut [u8]) {
    use scroll::Pwrite;
    for (i, nlist) in ctx.symtab_sec.nlists.iter().enumerate() {
        buf.pwrite_with(*nlist, i * SIZEOF_NLIST_64, scroll::LE).unwrap();
    }
}
