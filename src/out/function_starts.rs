//! `LC_FUNCTION_STARTS`: the sorted addresses of every function entry in
//! `__text`, delta-encoded as ULEB128. Advisory, but dtrace and friends
//! expect it.

use crate::arch::Arch;
use crate::ctx::Context;
use crate::intern::FileId;
use crate::util::encode_uleb;
use rayon::prelude::*;

pub fn build_function_starts<A: Arch>(ctx: &Context<A>) -> Vec<u8> {
    let mut addrs: Vec<u64> = ctx
        .objs
        .par_iter()
        .map(|obj| {
            let mut vec = Vec::new();
            if !obj.alive() {
                return vec;
            }
            for sym in obj.syms.iter().flatten() {
                let def = sym.def();
                if def.file != FileId::Obj(obj.file_idx) {
                    continue;
                }
                if let Some(subsec) = def.subsec {
                    if ctx.subsec(subsec).is_alive() && ctx.subsec_osec(subsec) == ctx.text_osec {
                        vec.push(ctx.sym_addr(sym));
                    }
                }
            }
            vec
        })
        .flatten()
        .collect();
    addrs.par_sort_unstable();
    addrs.dedup();

    let mut contents = Vec::with_capacity(addrs.len() * 5);
    let mut last = ctx.arg.pagezero_size;
    for addr in addrs {
        encode_uleb(&mut contents, addr - last);
        last = addr;
    }
    contents
}
