//! The Mach header chunk and its load commands.
//!
//! Load commands are rebuilt from the context on every call; sizing runs
//! before offsets exist and copying after, so only the final write sees
//! real values.

use crate::arch::Arch;
use crate::ctx::Context;
use crate::mach::constants::*;
use crate::mach::header::*;
use crate::mach::load_command::*;
use crate::out::ChunkId;
use crate::util::{align_to_usize, pack_name};
use scroll::{ctx::SizeWith, Pwrite};

fn cmd_with_string<T: Copy + SizeWith<scroll::Endian> + scroll::ctx::TryIntoCtx<scroll::Endian, Error = scroll::Error>>(
    mut fixup: impl FnMut(u32) -> T,
    string: &str,
) -> Vec<u8> {
    let head = T::size_with(&scroll::LE);
    let size = align_to_usize(head + string.len() + 1, 8);
    let mut buf = vec![0u8; size];
    let cmd = fixup(size as u32);
    buf.pwrite_with(cmd, 0, scroll::LE).unwrap();
    buf[head..head + string.len()].copy_from_slice(string.as_bytes());
    buf
}

pub fn build_load_commands<A: Arch>(ctx: &Context<A>) -> Vec<Vec<u8>> {
    let mut vec: Vec<Vec<u8>> = Vec::new();

    if ctx.arg.pagezero_size > 0 {
        let cmd = SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: SIZEOF_SEGMENT_COMMAND_64 as u32,
            segname: pack_name(SEG_PAGEZERO),
            vmsize: ctx.arg.pagezero_size,
            ..Default::default()
        };
        let mut buf = vec![0u8; SIZEOF_SEGMENT_COMMAND_64];
        buf.pwrite_with(cmd, 0, scroll::LE).unwrap();
        vec.push(buf);
    }

    for seg in &ctx.segments {
        let visible: Vec<ChunkId> = seg
            .chunks
            .iter()
            .copied()
            .filter(|&id| !crate::layout::chunk_is_hidden(ctx, id))
            .collect();
        let mut cmd = seg.cmd;
        cmd.cmdsize = (SIZEOF_SEGMENT_COMMAND_64 + SIZEOF_SECTION_64 * visible.len()) as u32;
        cmd.nsects = visible.len() as u32;

        let mut buf = vec![0u8; cmd.cmdsize as usize];
        buf.pwrite_with(cmd, 0, scroll::LE).unwrap();
        for (i, id) in visible.iter().enumerate() {
            let mut sect = crate::layout::chunk_sect(ctx, *id);
            sect.segname = cmd.segname;
            buf.pwrite_with(sect, SIZEOF_SEGMENT_COMMAND_64 + i * SIZEOF_SECTION_64, scroll::LE)
                .unwrap();
        }
        vec.push(buf);
    }

    let dyld_info = DyldInfoCommand {
        cmd: LC_DYLD_INFO_ONLY,
        cmdsize: SIZEOF_DYLD_INFO_COMMAND as u32,
        rebase_off: ctx.rebase.hdr.sect.offset,
        rebase_size: ctx.rebase.hdr.sect.size as u32,
        bind_off: ctx.bind.hdr.sect.offset,
        bind_size: ctx.bind.hdr.sect.size as u32,
        weak_bind_off: 0,
        weak_bind_size: 0,
        lazy_bind_off: ctx.lazy_bind.hdr.sect.offset,
        lazy_bind_size: ctx.lazy_bind.hdr.sect.size as u32,
        export_off: ctx.export_.hdr.sect.offset,
        export_size: ctx.export_.hdr.sect.size as u32,
    };
    vec.push(to_bytes(dyld_info, SIZEOF_DYLD_INFO_COMMAND));

    let symtab = SymtabCommand {
        cmd: LC_SYMTAB,
        cmdsize: SIZEOF_SYMTAB_COMMAND as u32,
        symoff: ctx.symtab_sec.hdr.sect.offset,
        nsyms: (ctx.symtab_sec.hdr.sect.size as usize / crate::mach::symbols::SIZEOF_NLIST_64)
            as u32,
        stroff: ctx.strtab.hdr.sect.offset,
        strsize: ctx.strtab.hdr.sect.size as u32,
    };
    vec.push(to_bytes(symtab, SIZEOF_SYMTAB_COMMAND));

    let nlocal = ctx.symtab_sec.num_locals as u32;
    let nglobal = ctx.symtab_sec.num_globals as u32;
    let nundef = ctx.symtab_sec.num_undefs as u32;
    let dysymtab = DysymtabCommand {
        cmd: LC_DYSYMTAB,
        cmdsize: SIZEOF_DYSYMTAB_COMMAND as u32,
        ilocalsym: 0,
        nlocalsym: nlocal,
        iextdefsym: nlocal,
        nextdefsym: nglobal,
        iundefsym: nlocal + nglobal,
        nundefsym: nundef,
        ..Default::default()
    };
    vec.push(to_bytes(dysymtab, SIZEOF_DYSYMTAB_COMMAND));

    if ctx.arg.uuid != crate::opt::UuidKind::None {
        let uuid = UuidCommand {
            cmd: LC_UUID,
            cmdsize: SIZEOF_UUID_COMMAND as u32,
            uuid: ctx.uuid,
        };
        vec.push(to_bytes(uuid, SIZEOF_UUID_COMMAND));
    }

    {
        let size = SIZEOF_BUILD_VERSION_COMMAND + SIZEOF_BUILD_TOOL_VERSION;
        let cmd = BuildVersionCommand {
            cmd: LC_BUILD_VERSION,
            cmdsize: size as u32,
            platform: ctx.arg.platform,
            minos: ctx.arg.platform_min_version,
            sdk: ctx.arg.platform_sdk_version,
            ntools: 1,
        };
        let tool = BuildToolVersion {
            tool: TOOL_LD,
            version: crate::opt::parse_version(crate::VERSION).unwrap_or(0),
        };
        let mut buf = vec![0u8; size];
        buf.pwrite_with(cmd, 0, scroll::LE).unwrap();
        buf.pwrite_with(tool, SIZEOF_BUILD_VERSION_COMMAND, scroll::LE).unwrap();
        vec.push(buf);
    }

    vec.push(to_bytes(
        SourceVersionCommand {
            cmd: LC_SOURCE_VERSION,
            cmdsize: SIZEOF_SOURCE_VERSION_COMMAND as u32,
            version: 0,
        },
        SIZEOF_SOURCE_VERSION_COMMAND,
    ));

    if ctx.arg.function_starts {
        vec.push(to_bytes(
            LinkeditDataCommand {
                cmd: LC_FUNCTION_STARTS,
                cmdsize: SIZEOF_LINKEDIT_DATA_COMMAND as u32,
                dataoff: ctx.function_starts.hdr.sect.offset,
                datasize: ctx.function_starts.hdr.sect.size as u32,
            },
            SIZEOF_LINKEDIT_DATA_COMMAND,
        ));
    }

    let mut dylibs: Vec<&crate::input::DylibFile> = ctx
        .dylibs
        .iter()
        .filter(|d| d.alive() && d.dylib_idx > 0)
        .collect();
    dylibs.sort_by_key(|d| d.dylib_idx);
    for dylib in dylibs {
        let cmd_kind = if dylib.is_reexported {
            LC_REEXPORT_DYLIB
        } else if dylib.is_weak {
            LC_LOAD_WEAK_DYLIB
        } else {
            LC_LOAD_DYLIB
        };
        vec.push(cmd_with_string(
            |cmdsize| DylibCommand {
                cmd: cmd_kind,
                cmdsize,
                dylib: crate::mach::load_command::Dylib {
                    name: SIZEOF_DYLIB_COMMAND as u32,
                    timestamp: 2,
                    current_version: ctx.arg.current_version,
                    compatibility_version: ctx.arg.compatibility_version,
                },
            },
            &dylib.install_name,
        ));
    }

    for rpath in &ctx.arg.rpath {
        vec.push(cmd_with_string(
            |cmdsize| RpathCommand {
                cmd: LC_RPATH,
                cmdsize,
                path: SIZEOF_RPATH_COMMAND as u32,
            },
            rpath,
        ));
    }

    if !ctx.data_in_code.entries.is_empty() {
        vec.push(to_bytes(
            LinkeditDataCommand {
                cmd: LC_DATA_IN_CODE,
                cmdsize: SIZEOF_LINKEDIT_DATA_COMMAND as u32,
                dataoff: ctx.data_in_code.hdr.sect.offset,
                datasize: ctx.data_in_code.hdr.sect.size as u32,
            },
            SIZEOF_LINKEDIT_DATA_COMMAND,
        ));
    }

    match ctx.output_type {
        MH_EXECUTE => {
            vec.push(cmd_with_string(
                |cmdsize| DylinkerCommand {
                    cmd: LC_LOAD_DYLINKER,
                    cmdsize,
                    name: SIZEOF_DYLINKER_COMMAND as u32,
                },
                "/usr/lib/dyld",
            ));
            let entry_addr = ctx
                .entry_sym
                .as_ref()
                .map(|sym| ctx.sym_addr(sym))
                .unwrap_or(ctx.arg.pagezero_size);
            // wrapping: at sizing time addresses are not assigned yet,
            // and only the command's byte count matters then
            vec.push(to_bytes(
                EntryPointCommand {
                    cmd: LC_MAIN,
                    cmdsize: SIZEOF_ENTRY_POINT_COMMAND as u32,
                    entryoff: entry_addr.wrapping_sub(ctx.arg.pagezero_size),
                    stacksize: ctx.arg.stack_size,
                },
                SIZEOF_ENTRY_POINT_COMMAND,
            ));
        }
        MH_DYLIB => {
            vec.push(cmd_with_string(
                |cmdsize| DylibCommand {
                    cmd: LC_ID_DYLIB,
                    cmdsize,
                    dylib: crate::mach::load_command::Dylib {
                        name: SIZEOF_DYLIB_COMMAND as u32,
                        timestamp: 0,
                        current_version: ctx.arg.current_version,
                        compatibility_version: ctx.arg.compatibility_version,
                    },
                },
                ctx.arg.final_output(),
            ));
        }
        MH_BUNDLE => {}
        _ => unreachable!("unexpected output type"),
    }

    if let Some(code_sig) = &ctx.code_sig {
        vec.push(to_bytes(
            LinkeditDataCommand {
                cmd: LC_CODE_SIGNATURE,
                cmdsize: SIZEOF_LINKEDIT_DATA_COMMAND as u32,
                dataoff: code_sig.sect.offset,
                datasize: code_sig.sect.size as u32,
            },
            SIZEOF_LINKEDIT_DATA_COMMAND,
        ));
    }

    vec
}

fn to_bytes<T: scroll::ctx::TryIntoCtx<scroll::Endian, Error = scroll::Error> + Copy>(
    cmd: T,
    size: usize,
) -> Vec<u8> {
    let mut buf = vec![0u8; size];
    buf.pwrite_with(cmd, 0, scroll::LE).unwrap();
    buf
}

/// Header plus load commands plus `-headerpad` slack.
pub fn compute_size<A: Arch>(ctx: &mut Context<A>) {
    let cmds = build_load_commands(&*ctx);
    let total: usize = cmds.iter().map(Vec::len).sum();
    ctx.mach_hdr.sect.size =
        (SIZEOF_MACH_HEADER_64 + total) as u64 + ctx.arg.headerpad;
}

fn has_tlv<A: Arch>(ctx: &Context<A>) -> bool {
    for seg in &ctx.segments {
        for &id in &seg.chunks {
            if crate::layout::chunk_sect(ctx, id).sect_type() == S_THREAD_LOCAL_VARIABLES {
                return true;
            }
        }
    }
    false
}

pub fn copy_mach_header<A: Arch>(ctx: &Context<A>, buf: &mut [u8]) {
    let cmds = build_load_commands(ctx);
    let total: usize = cmds.iter().map(Vec::len).sum();

    let mut flags = MH_TWOLEVEL | MH_NOUNDEFS | MH_DYLDLINK | MH_PIE;
    if has_tlv(ctx) {
        flags |= MH_HAS_TLV_DESCRIPTORS;
    }
    if ctx.output_type == MH_DYLIB && !ctx.dylibs.iter().any(|d| d.alive() && d.is_reexported) {
        flags |= MH_NO_REEXPORTED_DYLIBS;
    }
    if ctx.arg.mark_dead_strippable_dylib {
        flags |= MH_DEAD_STRIPPABLE_DYLIB;
    }

    let hdr = MachHeader64 {
        magic: MH_MAGIC_64,
        cputype: A::CPU_TYPE,
        cpusubtype: A::CPU_SUBTYPE,
        filetype: ctx.output_type,
        ncmds: cmds.len() as u32,
        sizeofcmds: total as u32,
        flags,
        reserved: 0,
    };
    buf.pwrite_with(hdr, 0, scroll::LE).unwrap();

    let mut off = SIZEOF_MACH_HEADER_64;
    for cmd in cmds {
        buf[off..off + cmd.len()].copy_from_slice(&cmd);
        off += cmd.len();
    }
}
