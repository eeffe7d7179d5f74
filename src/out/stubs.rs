//! The synthetic sections that make imported symbols callable: `__stubs`,
//! `__stub_helper`, `__la_symbol_ptr`, the GOT and the thread-pointer
//! table.
//!
//! Per imported function there is one stub (a trampoline jumping through
//! the lazy pointer), one stub-helper entry (pushing a lazy-bind offset
//! and tail-calling `dyld_stub_binder`) and one lazy pointer slot that
//! starts out pointing back at the stub-helper entry.

use crate::arch::Arch;
use crate::ctx::Context;
use crate::intern::Symbol;
use crate::mach::constants::*;
use crate::out::ChunkHdr;
use scroll::Pwrite;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[derive(Debug)]
pub struct StubsSection {
    pub hdr: ChunkHdr,
    pub syms: Vec<Arc<Symbol>>,
    /// per-stub offset into the lazy-bind stream, filled by its encoder
    pub bind_offsets: Vec<u32>,
}

impl StubsSection {
    pub fn new(stub_size: u64) -> StubsSection {
        let mut hdr = ChunkHdr::new(SEG_TEXT, "__stubs", false);
        hdr.sect.align = 4;
        hdr.sect.flags = S_SYMBOL_STUBS | S_ATTR_SOME_INSTRUCTIONS | S_ATTR_PURE_INSTRUCTIONS;
        hdr.sect.reserved2 = stub_size as u32;
        StubsSection {
            hdr,
            syms: Vec::new(),
            bind_offsets: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct GotSection {
    pub hdr: ChunkHdr,
    pub syms: Vec<Arc<Symbol>>,
}

impl GotSection {
    pub fn new() -> GotSection {
        let mut hdr = ChunkHdr::new(SEG_DATA_CONST, "__got", false);
        hdr.sect.align = 3;
        hdr.sect.flags = S_NON_LAZY_SYMBOL_POINTERS;
        GotSection {
            hdr,
            syms: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct ThreadPtrsSection {
    pub hdr: ChunkHdr,
    pub syms: Vec<Arc<Symbol>>,
}

impl ThreadPtrsSection {
    pub fn new() -> ThreadPtrsSection {
        let mut hdr = ChunkHdr::new(SEG_DATA, "__thread_ptrs", false);
        hdr.sect.align = 3;
        hdr.sect.flags = S_THREAD_LOCAL_VARIABLE_POINTERS;
        ThreadPtrsSection {
            hdr,
            syms: Vec::new(),
        }
    }
}

/// Appends `sym` to the stubs. Updates the three cooperating section
/// sizes so layout sees them without a separate sizing pass.
pub fn add_stub<A: Arch>(ctx: &mut Context<A>, sym: Arc<Symbol>) {
    debug_assert_eq!(sym.stub_idx(), -1);
    sym.stub_idx
        .store(ctx.stubs.syms.len() as i32, Ordering::Relaxed);
    ctx.stubs.syms.push(sym);

    let nsyms = ctx.stubs.syms.len() as u64;
    ctx.stubs.hdr.sect.size = nsyms * A::STUB_SIZE;
    ctx.stub_helper.sect.size = A::STUB_HELPER_HDR_SIZE + nsyms * A::STUB_HELPER_ENTRY_SIZE;
    ctx.lazy_symbol_ptr.sect.size = nsyms * 8;
}

pub fn add_got<A: Arch>(ctx: &mut Context<A>, sym: Arc<Symbol>) {
    debug_assert_eq!(sym.got_idx(), -1);
    sym.got_idx
        .store(ctx.got.syms.len() as i32, Ordering::Relaxed);
    ctx.got.syms.push(sym);
    ctx.got.hdr.sect.size = ctx.got.syms.len() as u64 * 8;
}

pub fn add_thread_ptr<A: Arch>(ctx: &mut Context<A>, sym: Arc<Symbol>) {
    debug_assert_eq!(sym.tlv_idx(), -1);
    sym.tlv_idx
        .store(ctx.thread_ptrs.syms.len() as i32, Ordering::Relaxed);
    ctx.thread_ptrs.syms.push(sym);
    ctx.thread_ptrs.hdr.sect.size = ctx.thread_ptrs.syms.len() as u64 * 8;
}

/// At link time every lazy pointer targets its stub-helper entry; dyld
/// overwrites the slot on the first call.
pub fn copy_lazy_symbol_ptr<A: Arch>(ctx: &Context<A>, buf: &mut [u8]) {
    for i in 0..ctx.stubs.syms.len() {
        let target = ctx.stub_helper.sect.addr
            + A::STUB_HELPER_HDR_SIZE
            + i as u64 * A::STUB_HELPER_ENTRY_SIZE;
        buf.pwrite_with(target, i * 8, scroll::LE).unwrap();
    }
}

/// Local GOT entries hold the target address outright (and get rebased);
/// imported ones stay zero for dyld to bind.
pub fn copy_got<A: Arch>(ctx: &Context<A>, buf: &mut [u8]) {
    for (i, sym) in ctx.got.syms.iter().enumerate() {
        if !sym.def().is_imported {
            buf.pwrite_with(ctx.sym_addr(sym), i * 8, scroll::LE).unwrap();
        }
    }
}

pub fn copy_thread_ptrs<A: Arch>(ctx: &Context<A>, buf: &mut [u8]) {
    for (i, sym) in ctx.thread_ptrs.syms.iter().enumerate() {
        if !sym.def().is_imported {
            buf.pwrite_with(ctx.sym_addr(sym), i * 8, scroll::LE).unwrap();
        }
    }
}
