//! Dead-code stripping: a mark-and-sweep over subsections.

use crate::arch::Arch;
use crate::ctx::Context;
use crate::input::section::SubsecRef;
use crate::intern::FileId;
use crate::mach::constants::{S_ATTR_LIVE_SUPPORT, S_ATTR_NO_DEAD_STRIP};
use crate::mach::header::{MH_BUNDLE, MH_DYLIB};

fn collect_root_set<A: Arch>(ctx: &Context<A>) -> Vec<SubsecRef> {
    let mut rootset = Vec::new();

    if let Some(entry) = &ctx.entry_sym {
        if let Some(subsec) = entry.def().subsec {
            rootset.push(subsec);
        }
    }

    let export_everything =
        ctx.output_type == MH_DYLIB || ctx.output_type == MH_BUNDLE;

    for obj in &ctx.objs {
        if !obj.alive() {
            continue;
        }
        for sym in obj.syms.iter().flatten() {
            let def = sym.def();
            if def.file != FileId::Obj(obj.file_idx) {
                continue;
            }
            let rooted = def.no_dead_strip
                || def.referenced_dynamically
                || (export_everything && def.scope == crate::intern::Scope::Extern);
            if rooted {
                if let Some(subsec) = def.subsec {
                    rootset.push(subsec);
                }
            }
        }
        for (idx, subsec) in obj.subsections.iter().enumerate() {
            let isec = match &obj.sections[subsec.isec as usize] {
                Some(isec) => isec,
                None => continue,
            };
            if isec.hdr.attrs() & S_ATTR_NO_DEAD_STRIP != 0 {
                rootset.push(SubsecRef {
                    file: obj.file_idx,
                    idx: idx as u32,
                });
            }
        }
    }
    rootset
}

/// Iterative DFS; each subsection is claimed exactly once via
/// compare-and-swap on its liveness bit.
fn mark<A: Arch>(ctx: &Context<A>, rootset: Vec<SubsecRef>) {
    let mut stack = rootset;
    while let Some(r) = stack.pop() {
        let subsec = ctx.subsec(r);
        if !subsec.claim() {
            continue;
        }

        let obj = &ctx.objs[r.file as usize];
        let isec = obj.sections[subsec.isec as usize].as_ref().unwrap();
        for rel in &isec.rels[subsec.rel_range()] {
            match rel.sym() {
                Some(sym) => {
                    if let Some(target) = sym.def().subsec {
                        stack.push(target);
                    }
                }
                None => stack.push(rel.target_subsec().unwrap()),
            }
        }

        for rec in &obj.unwind_records[subsec.unwind_range()] {
            stack.push(SubsecRef {
                file: r.file,
                idx: rec.subsec,
            });
            if let Some(lsda) = rec.lsda {
                stack.push(SubsecRef {
                    file: r.file,
                    idx: lsda,
                });
            }
            if let Some(personality) = &rec.personality {
                if let Some(target) = personality.def().subsec {
                    stack.push(target);
                }
            }
        }
    }
}

/// True if any relocation in the subsection points at something already
/// live; references to imports and absolute symbols count.
fn refers_live_subsection<A: Arch>(ctx: &Context<A>, r: SubsecRef) -> bool {
    let subsec = ctx.subsec(r);
    let obj = &ctx.objs[r.file as usize];
    let isec = obj.sections[subsec.isec as usize].as_ref().unwrap();
    for rel in &isec.rels[subsec.rel_range()] {
        let live = match rel.sym() {
            Some(sym) => match sym.def().subsec {
                Some(target) => ctx.subsec(target).is_alive(),
                None => true,
            },
            None => ctx.subsec(rel.target_subsec().unwrap()).is_alive(),
        };
        if live {
            return true;
        }
    }
    false
}

pub fn dead_strip<A: Arch>(ctx: &mut Context<A>) {
    for obj in &ctx.objs {
        if obj.alive() {
            for subsec in &obj.subsections {
                subsec.set_alive(false);
            }
        }
    }

    let rootset = collect_root_set(&*ctx);
    mark(&*ctx, rootset);

    // subsections with live-support semantics come alive only when they
    // point at something live, which can cascade
    loop {
        let mut repeat = false;
        for obj in &ctx.objs {
            if !obj.alive() {
                continue;
            }
            for (idx, subsec) in obj.subsections.iter().enumerate() {
                if subsec.is_alive() {
                    continue;
                }
                let isec = match &obj.sections[subsec.isec as usize] {
                    Some(isec) => isec,
                    None => continue,
                };
                if isec.hdr.attrs() & S_ATTR_LIVE_SUPPORT == 0 {
                    continue;
                }
                let r = SubsecRef {
                    file: obj.file_idx,
                    idx: idx as u32,
                };
                if refers_live_subsection(&*ctx, r) {
                    mark(&*ctx, vec![r]);
                    repeat = true;
                }
            }
        }
        if !repeat {
            break;
        }
    }

    sweep(ctx);
}

/// Clears symbol slots that pointed into dead subsections. The dead
/// subsections themselves stay in their vectors (references by index
/// must not shift) and are skipped by every later pass.
fn sweep<A: Arch>(ctx: &mut Context<A>) {
    for obj in &mut ctx.objs {
        if !obj.alive() {
            continue;
        }
        let file_idx = obj.file_idx;
        for slot in &mut obj.syms {
            let clear = match slot {
                Some(sym) => {
                    let def = sym.def();
                    def.file == FileId::Obj(file_idx)
                        && match def.subsec {
                            Some(subsec) => {
                                !ctx_subsec_alive(&obj.subsections, subsec, file_idx)
                            }
                            None => false,
                        }
                }
                None => false,
            };
            if clear {
                *slot = None;
            }
        }
    }
}

fn ctx_subsec_alive(
    subsections: &[crate::input::section::Subsection],
    r: SubsecRef,
    this_file: u32,
) -> bool {
    // a symbol's defining subsection always lives in its own object
    debug_assert_eq!(r.file, this_file);
    subsections[r.idx as usize].is_alive()
}
