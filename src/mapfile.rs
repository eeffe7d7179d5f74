//! `-map <file>`: a human-readable account of where every input file,
//! section and symbol landed.

use crate::arch::Arch;
use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::intern::FileId;
use crate::layout::{chunk_is_hidden, chunk_sect};
use std::fs::File;
use std::io::{BufWriter, Write};

struct MapSym {
    addr: u64,
    file_idx: usize,
    name: String,
}

pub fn print_map<A: Arch>(ctx: &Context<A>) -> Result<()> {
    let file = File::create(&ctx.arg.map)
        .map_err(|e| Error::Malformed(format!("cannot open {}: {}", ctx.arg.map, e)))?;
    let mut out = BufWriter::new(file);

    writeln!(out, "# Path: {}", ctx.arg.output)?;
    writeln!(out, "# Arch: {}", A::NAME)?;
    writeln!(out, "# Object files:")?;

    let mut syms: Vec<MapSym> = Vec::new();
    for (i, obj) in ctx.objs.iter().enumerate() {
        if !obj.alive() {
            continue;
        }
        writeln!(out, "[{:>3}] {}", i, obj.display_name())?;
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
            syms.push(MapSym {
                addr: ctx.sym_addr(sym),
                file_idx: i,
                name: sym.name.to_string(),
            });
        }
    }
    syms.sort_by_key(|sym| sym.addr);

    writeln!(out, "# Sections:")?;
    writeln!(out, "# Address       Size            Segment Section")?;
    for seg in &ctx.segments {
        for &id in &seg.chunks {
            if chunk_is_hidden(ctx, id) {
                continue;
            }
            let sect = chunk_sect(ctx, id);
            writeln!(
                out,
                "0x{:08X}     0x{:08X}      {:<7} {}",
                sect.addr,
                sect.size,
                seg.cmd.name(),
                sect.sectname()
            )?;
        }
    }

    writeln!(out, "# Symbols:")?;
    writeln!(out, "# Address       Size            File  Name")?;
    for sym in &syms {
        writeln!(
            out,
            "0x{:08X}     0x{:08X}      [{:>3}] {}",
            sym.addr, 0, sym.file_idx, sym.name
        )?;
    }
    Ok(())
}
