//! x86-64 relocation handling and stub code.

use crate::arch::{Arch, RelocClass};
use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::input::object::ObjectFile;
use crate::input::section::{RelocTarget, Relocation, SubsecRef};
use crate::mach::constants::*;
use crate::mach::relocation::*;
use scroll::{Pread, Pwrite};

#[derive(Debug, Clone, Copy)]
pub struct X8664;

/// The displacement the instruction itself adds before the addend, for
/// the SIGNED_{1,2,4} variants.
fn builtin_addend(ty: u8) -> i64 {
    match ty {
        X86_64_RELOC_SIGNED_1 => 1,
        X86_64_RELOC_SIGNED_2 => 2,
        X86_64_RELOC_SIGNED_4 => 4,
        _ => 0,
    }
}

fn read_addend(data: &[u8], off: usize, r: &RelocationInfo) -> Result<i64> {
    let stored = match r.r_length() {
        2 => data.pread_with::<i32>(off, scroll::LE)? as i64,
        3 => data.pread_with::<i64>(off, scroll::LE)?,
        _ => {
            return Err(Error::Malformed(format!(
                "bad relocation size at {:#x}",
                r.r_address
            )))
        }
    };
    Ok(stored + builtin_addend(r.r_type()))
}

fn target_addr(ctx: &Context<X8664>, rel: &Relocation) -> u64 {
    match &rel.target {
        RelocTarget::Sym(sym) => ctx.sym_addr(sym),
        RelocTarget::Subsec(subsec) => ctx.subsec_addr(*subsec),
    }
}

impl Arch for X8664 {
    const NAME: &'static str = "x86_64";
    const CPU_TYPE: u32 = cputype::CPU_TYPE_X86_64;
    const CPU_SUBTYPE: u32 = cputype::CPU_SUBTYPE_X86_64_ALL;
    const PAGE_SIZE: u64 = 0x1000;
    const STUB_SIZE: u64 = 6;
    const STUB_HELPER_HDR_SIZE: u64 = 16;
    const STUB_HELPER_ENTRY_SIZE: u64 = 10;
    const ABS_REL: u8 = X86_64_RELOC_UNSIGNED;

    fn reloc_name(ty: u8) -> &'static str {
        x86_64_reloc_to_str(ty)
    }

    fn reloc_class(ty: u8) -> RelocClass {
        match ty {
            X86_64_RELOC_UNSIGNED | X86_64_RELOC_SUBTRACTOR => RelocClass::Abs,
            X86_64_RELOC_GOT | X86_64_RELOC_GOT_LOAD => RelocClass::Got,
            X86_64_RELOC_TLV => RelocClass::Tlv,
            X86_64_RELOC_BRANCH => RelocClass::Branch,
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
        for (i, r) in raw.iter().enumerate() {
            if r.r_address < 0 {
                return Err(Error::Malformed(format!(
                    "{}: scattered relocations are not supported",
                    obj.display_name()
                )));
            }
            let addend = read_addend(data, hdr.offset as usize + r.r_address as usize, r)?;

            let is_subtracted = i > 0 && raw[i - 1].r_type() == X86_64_RELOC_SUBTRACTOR;
            // the pair itself is applied as a unit; neither half keeps
            // the instruction-relative flag
            let is_pcrel =
                !is_subtracted && r.r_type() != X86_64_RELOC_SUBTRACTOR && r.r_pcrel();

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
                    (hdr.addr as i64 + r.r_address as i64 + addend + 4) as u64
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
                is_pcrel,
                target,
            );
            rel.addend = final_addend;
            rel.is_subtracted = is_subtracted;
            vec.push(rel);
        }
        Ok(vec)
    }

    fn apply_relocations(
        ctx: &Context<X8664>,
        obj: &ObjectFile,
        rels: &[Relocation],
        subsec_addr: u64,
        isec_type: u32,
        _osec: u32,
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
                X86_64_RELOC_UNSIGNED | X86_64_RELOC_SIGNED | X86_64_RELOC_BRANCH
                | X86_64_RELOC_SIGNED_1 | X86_64_RELOC_SIGNED_2 | X86_64_RELOC_SIGNED_4 => {
                    val = val.wrapping_add(target_addr(ctx, r));
                }
                X86_64_RELOC_SUBTRACTOR => {
                    let s = &rels[i + 1];
                    debug_assert_eq!(s.ty, X86_64_RELOC_UNSIGNED);
                    debug_assert_eq!(r.p2size, s.p2size);
                    let val1 = target_addr(ctx, r);
                    let val2 = target_addr(ctx, s);
                    val = val.wrapping_add(val2.wrapping_sub(val1));
                    i += 1;
                }
                X86_64_RELOC_GOT | X86_64_RELOC_GOT_LOAD => {
                    val = val.wrapping_add(ctx.sym_got_addr(r.sym().unwrap()));
                }
                X86_64_RELOC_TLV => {
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

            if isec_type == S_THREAD_LOCAL_VARIABLES {
                // thread-local addresses are offsets from the first
                // thread-local section
                val = val.wrapping_sub(ctx.tls_begin);
            } else if r.is_pcrel {
                val = val
                    .wrapping_sub(subsec_addr + r.offset as u64 + 4 + builtin_addend(r.ty) as u64);
            }

            if r.p2size == 2 {
                buf.pwrite_with(val as u32, off, scroll::LE).unwrap();
            } else {
                buf.pwrite_with(val, off, scroll::LE).unwrap();
            }
            i += 1;
        }
    }

    fn write_stubs(ctx: &Context<X8664>, buf: &mut [u8]) {
        // ff 25 <rel32>: jmp *ptr(%rip), through the lazy symbol pointer
        for i in 0..ctx.stubs.syms.len() {
            let off = i * 6;
            buf[off] = 0xff;
            buf[off + 1] = 0x25;
            let disp = (ctx.lazy_symbol_ptr.sect.addr + 8 * i as u64)
                .wrapping_sub(ctx.stubs.hdr.sect.addr + off as u64 + 6);
            buf.pwrite_with(disp as u32, off + 2, scroll::LE).unwrap();
        }
    }

    fn write_stub_helper(ctx: &Context<X8664>, buf: &mut [u8]) {
        const HDR: [u8; 16] = [
            0x4c, 0x8d, 0x1d, 0, 0, 0, 0, // lea __dyld_private(%rip), %r11
            0x41, 0x53, // push %r11
            0xff, 0x25, 0, 0, 0, 0, // jmp *dyld_stub_binder@GOT(%rip)
            0x90, // nop
        ];
        buf[..16].copy_from_slice(&HDR);

        let this_addr = ctx.stub_helper.sect.addr;
        let dyld_private = ctx.sym_addr(&ctx.symtab.get("__dyld_private"));
        buf.pwrite_with(
            dyld_private.wrapping_sub(this_addr + 7) as u32,
            3,
            scroll::LE,
        )
        .unwrap();
        let stub_binder = ctx.sym_got_addr(&ctx.symtab.get("dyld_stub_binder"));
        buf.pwrite_with(
            stub_binder.wrapping_sub(this_addr + 15) as u32,
            11,
            scroll::LE,
        )
        .unwrap();

        for i in 0..ctx.stubs.syms.len() {
            // push <lazy bind offset>; jmp <header>
            let off = 16 + i * 10;
            buf[off] = 0x68;
            buf.pwrite_with(ctx.stubs.bind_offsets[i], off + 1, scroll::LE)
                .unwrap();
            buf[off + 5] = 0xe9;
            let disp = 0u64.wrapping_sub(off as u64 + 10);
            buf.pwrite_with(disp as u32, off + 6, scroll::LE).unwrap();
        }
    }
}
