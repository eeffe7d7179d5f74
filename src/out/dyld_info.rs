//! The `__LINKEDIT` opcode streams dyld consumes at load time: rebase,
//! bind and lazy-bind programs, plus the exported-symbol trie.

use crate::arch::Arch;
use crate::ctx::Context;
use crate::intern::{FileId, Scope, Symbol};
use crate::mach::constants::*;
use crate::out::ChunkId;
use crate::util::{align_to_usize, encode_sleb, encode_uleb, uleb_size};
use rayon::prelude::*;
use std::sync::Arc;

/// Run-length encoder for the rebase program. Consecutive pointer-sized
/// rebases collapse into one DO_REBASE_*_TIMES opcode.
pub struct RebaseEncoder {
    pub buf: Vec<u8>,
    cur_seg: i64,
    cur_off: u64,
    times: u64,
}

impl Default for RebaseEncoder {
    fn default() -> RebaseEncoder {
        RebaseEncoder::new()
    }
}

impl RebaseEncoder {
    pub fn new() -> RebaseEncoder {
        RebaseEncoder {
            buf: vec![REBASE_OPCODE_SET_TYPE_IMM | REBASE_TYPE_POINTER],
            cur_seg: -1,
            cur_off: 0,
            times: 0,
        }
    }

    pub fn add(&mut self, seg_idx: u8, offset: u64) {
        debug_assert!(seg_idx < 16);

        // extend the current run if this rebase is contiguous
        if seg_idx as i64 == self.cur_seg && offset == self.cur_off {
            self.cur_off += 8;
            self.times += 1;
            return;
        }

        self.flush();

        if seg_idx as i64 != self.cur_seg || offset < self.cur_off {
            self.buf
                .push(REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | seg_idx);
            encode_uleb(&mut self.buf, offset);
        } else {
            let dist = offset - self.cur_off;
            if dist % 8 == 0 && dist < 128 {
                self.buf
                    .push(REBASE_OPCODE_ADD_ADDR_IMM_SCALED | (dist >> 3) as u8);
            } else {
                self.buf.push(REBASE_OPCODE_ADD_ADDR_ULEB);
                encode_uleb(&mut self.buf, dist);
            }
        }

        self.cur_seg = seg_idx as i64;
        self.cur_off = offset + 8;
        self.times = 1;
    }

    fn flush(&mut self) {
        if self.times == 0 {
            return;
        }
        if self.times < 16 {
            self.buf
                .push(REBASE_OPCODE_DO_REBASE_IMM_TIMES | self.times as u8);
        } else {
            self.buf.push(REBASE_OPCODE_DO_REBASE_ULEB_TIMES);
            encode_uleb(&mut self.buf, self.times);
        }
        self.times = 0;
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.flush();
        self.buf.push(REBASE_OPCODE_DONE);
        let len = align_to_usize(self.buf.len(), 8);
        self.buf.resize(len, 0);
        self.buf
    }
}

/// Delta encoder for the bind program; repeated dylib/name/segment state
/// is carried over between entries.
pub struct BindEncoder {
    pub buf: Vec<u8>,
    last_name: String,
    last_flags: i64,
    last_dylib: i64,
    last_seg: i64,
    last_offset: i64,
    last_addend: i64,
}

impl Default for BindEncoder {
    fn default() -> BindEncoder {
        BindEncoder::new()
    }
}

impl BindEncoder {
    pub fn new() -> BindEncoder {
        BindEncoder {
            buf: vec![BIND_OPCODE_SET_TYPE_IMM | BIND_TYPE_POINTER],
            last_name: String::new(),
            last_flags: -1,
            last_dylib: i64::MIN,
            last_seg: -1,
            last_offset: -1,
            last_addend: 0,
        }
    }

    pub fn add(
        &mut self,
        dylib_idx: i64,
        name: &str,
        is_weak: bool,
        seg_idx: u8,
        offset: u64,
        addend: i64,
    ) {
        let flags = if is_weak {
            BIND_SYMBOL_FLAGS_WEAK_IMPORT as i64
        } else {
            0
        };

        if self.last_dylib != dylib_idx {
            emit_dylib_ordinal(&mut self.buf, dylib_idx);
        }

        if self.last_name != name || self.last_flags != flags {
            self.buf
                .push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM | flags as u8);
            self.buf.extend_from_slice(name.as_bytes());
            self.buf.push(0);
        }

        if self.last_seg != seg_idx as i64 || self.last_offset != offset as i64 {
            debug_assert!(seg_idx < 16);
            self.buf
                .push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | seg_idx);
            encode_uleb(&mut self.buf, offset);
        }

        if self.last_addend != addend {
            self.buf.push(BIND_OPCODE_SET_ADDEND_SLEB);
            encode_sleb(&mut self.buf, addend);
        }

        self.buf.push(BIND_OPCODE_DO_BIND);

        self.last_dylib = dylib_idx;
        self.last_name = name.to_string();
        self.last_flags = flags;
        self.last_seg = seg_idx as i64;
        self.last_offset = offset as i64;
        self.last_addend = addend;
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.buf.push(BIND_OPCODE_DONE);
        let len = align_to_usize(self.buf.len(), 8);
        self.buf.resize(len, 0);
        self.buf
    }
}

fn emit_dylib_ordinal(buf: &mut Vec<u8>, dylib_idx: i64) {
    if dylib_idx < 0 {
        buf.push(BIND_OPCODE_SET_DYLIB_SPECIAL_IMM | (dylib_idx as u8 & BIND_IMMEDIATE_MASK));
    } else if dylib_idx < 16 {
        buf.push(BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | dylib_idx as u8);
    } else {
        buf.push(BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB);
        encode_uleb(buf, dylib_idx as u64);
    }
}

fn dylib_ordinal<A: Arch>(ctx: &Context<A>, sym: &Symbol) -> i64 {
    match sym.def().file {
        FileId::Dylib(i) => ctx.dylibs[i as usize].dylib_idx,
        _ => BIND_SPECIAL_DYLIB_FLAT_LOOKUP,
    }
}

fn segment_of<'a, A: Arch>(ctx: &'a Context<A>, id: ChunkId) -> &'a crate::out::OutputSegment {
    ctx.segments
        .iter()
        .find(|seg| seg.chunks.contains(&id))
        .expect("chunk placed in no segment")
}

fn is_tls_osec<A: Arch>(ctx: &Context<A>, osec: u32) -> bool {
    let ty = ctx.osecs.read()[osec as usize].hdr.sect.flags & SECTION_TYPE;
    matches!(
        ty,
        S_THREAD_LOCAL_REGULAR | S_THREAD_LOCAL_ZEROFILL | S_THREAD_LOCAL_VARIABLES
    )
}

/// Walks every output-section member and feeds `f` with each relocation
/// plus its subsection's output address and owning segment ordinal.
fn for_each_osec_rel<A: Arch>(
    ctx: &Context<A>,
    mut f: impl FnMut(&crate::input::section::Relocation, u64, u8),
) {
    for seg in &ctx.segments {
        for id in &seg.chunks {
            let osec_idx = match id {
                ChunkId::Osec(i) => *i,
                _ => continue,
            };
            let members = {
                let osecs = ctx.osecs.read();
                osecs[osec_idx as usize].members.clone()
            };
            for m in members {
                let subsec = ctx.subsec(m);
                let addr = ctx.subsec_addr(m);
                let obj = &ctx.objs[m.file as usize];
                let isec = obj.sections[subsec.isec as usize].as_ref().unwrap();
                for rel in &isec.rels[subsec.rel_range()] {
                    f(rel, addr, seg.seg_idx);
                }
            }
        }
    }
}

/// The rebase program: every pointer the kernel must slide. Lazy
/// pointers, local GOT and thread-pointer slots, and absolute pointers
/// in copied sections all qualify.
pub fn build_rebase<A: Arch>(ctx: &Context<A>) -> Vec<u8> {
    let mut enc = RebaseEncoder::new();

    if !ctx.stubs.syms.is_empty() {
        let seg = segment_of(ctx, ChunkId::LazySymbolPtr);
        for i in 0..ctx.stubs.syms.len() {
            enc.add(
                seg.seg_idx,
                ctx.lazy_symbol_ptr.sect.addr + i as u64 * 8 - seg.cmd.vmaddr,
            );
        }
    }

    if !ctx.got.syms.is_empty() {
        let seg = segment_of(ctx, ChunkId::Got);
        for sym in &ctx.got.syms {
            if !sym.def().is_imported {
                enc.add(seg.seg_idx, ctx.sym_got_addr(sym) - seg.cmd.vmaddr);
            }
        }
    }

    if !ctx.thread_ptrs.syms.is_empty() {
        let seg = segment_of(ctx, ChunkId::ThreadPtrs);
        for sym in &ctx.thread_ptrs.syms {
            if !sym.def().is_imported {
                enc.add(seg.seg_idx, ctx.sym_tlv_addr(sym) - seg.cmd.vmaddr);
            }
        }
    }

    let mut slots: Vec<(u8, u64)> = Vec::new();
    for_each_osec_rel(ctx, |rel, subsec_addr, seg_idx| {
        if rel.is_pcrel || rel.is_subtracted || rel.ty != A::ABS_REL || rel.p2size != 3 {
            return;
        }
        let refers_tls = rel
            .sym()
            .map(|sym| {
                sym.def()
                    .subsec
                    .map(|s| is_tls_osec(ctx, ctx.subsec_osec(s)))
                    .unwrap_or(false)
            })
            .unwrap_or(false);
        if refers_tls {
            return;
        }
        let seg_base = ctx
            .segments
            .iter()
            .find(|s| s.seg_idx == seg_idx)
            .unwrap()
            .cmd
            .vmaddr;
        slots.push((seg_idx, subsec_addr + rel.offset as u64 - seg_base));
    });
    for (seg_idx, offset) in slots {
        enc.add(seg_idx, offset);
    }

    enc.finish()
}

/// The bind program: GOT and thread-pointer slots of imports, plus any
/// 64-bit absolute reference to an imported symbol.
pub fn build_bind<A: Arch>(ctx: &Context<A>) -> Vec<u8> {
    let mut enc = BindEncoder::new();

    if !ctx.got.syms.is_empty() {
        let seg = segment_of(ctx, ChunkId::Got);
        for sym in &ctx.got.syms {
            let def = sym.def();
            if def.is_imported {
                enc.add(
                    dylib_ordinal(ctx, sym),
                    &sym.name,
                    def.is_weak,
                    seg.seg_idx,
                    ctx.sym_got_addr(sym) - seg.cmd.vmaddr,
                    0,
                );
            }
        }
    }

    if !ctx.thread_ptrs.syms.is_empty() {
        let seg = segment_of(ctx, ChunkId::ThreadPtrs);
        for sym in &ctx.thread_ptrs.syms {
            let def = sym.def();
            if def.is_imported {
                enc.add(
                    dylib_ordinal(ctx, sym),
                    &sym.name,
                    def.is_weak,
                    seg.seg_idx,
                    ctx.sym_tlv_addr(sym) - seg.cmd.vmaddr,
                    0,
                );
            }
        }
    }

    let mut binds: Vec<(Arc<Symbol>, u8, u64, i64)> = Vec::new();
    for_each_osec_rel(ctx, |rel, subsec_addr, seg_idx| {
        if !rel.needs_dynrel {
            return;
        }
        let sym = rel.sym().expect("dynamic relocation without symbol");
        let seg_base = ctx
            .segments
            .iter()
            .find(|s| s.seg_idx == seg_idx)
            .unwrap()
            .cmd
            .vmaddr;
        binds.push((
            Arc::clone(sym),
            seg_idx,
            subsec_addr + rel.offset as u64 - seg_base,
            rel.addend,
        ));
    });
    for (sym, seg_idx, offset, addend) in binds {
        let def = sym.def();
        enc.add(
            dylib_ordinal(ctx, &sym),
            &sym.name,
            def.is_weak,
            seg_idx,
            offset,
            addend,
        );
    }

    enc.finish()
}

/// The lazy-bind program is not a single stream: each stub owns one
/// self-contained block so dyld can enter at the offset its stub-helper
/// entry pushed.
pub fn build_lazy_bind<A: Arch>(ctx: &Context<A>) -> (Vec<u8>, Vec<u32>) {
    let mut contents = Vec::new();
    let mut bind_offsets = Vec::with_capacity(ctx.stubs.syms.len());

    if !ctx.stubs.syms.is_empty() {
        let seg = segment_of(ctx, ChunkId::LazySymbolPtr);
        for sym in &ctx.stubs.syms {
            bind_offsets.push(contents.len() as u32);

            emit_dylib_ordinal(&mut contents, dylib_ordinal(ctx, sym));

            let def = sym.def();
            let flags = if def.is_weak {
                BIND_SYMBOL_FLAGS_WEAK_IMPORT
            } else {
                0
            };
            contents.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM | flags);
            contents.extend_from_slice(sym.name.as_bytes());
            contents.push(0);

            contents.push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | seg.seg_idx);
            let offset = ctx.lazy_symbol_ptr.sect.addr + sym.stub_idx() as u64 * 8
                - seg.cmd.vmaddr;
            encode_uleb(&mut contents, offset);

            contents.push(BIND_OPCODE_DO_BIND);
            contents.push(BIND_OPCODE_DONE);
        }
    }

    let len = align_to_usize(contents.len(), 8);
    contents.resize(len, 0);
    (contents, bind_offsets)
}

//
// Export trie
//

struct Entry {
    name: Arc<str>,
    flags: u32,
    addr: u64,
}

#[derive(Default)]
struct TrieNode {
    prefix: String,
    children: Vec<TrieNode>,
    addr: u64,
    flags: u32,
    offset: u32,
    is_leaf: bool,
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}

fn construct_trie(entries: &[Entry], len: usize, parallel: bool) -> TrieNode {
    let mut node = TrieNode::default();
    let new_len = common_prefix_len(&entries[0].name, &entries[entries.len() - 1].name);

    let mut rest = entries;
    if new_len > len {
        node.prefix = entries[0].name[len..new_len].to_string();
        if entries[0].name.len() == new_len {
            node.is_leaf = true;
            node.flags = entries[0].flags;
            node.addr = entries[0].addr;
            rest = &entries[1..];
        }
    }

    // group the remaining entries by their next byte
    let mut groups: Vec<&[Entry]> = Vec::new();
    let mut i = 0;
    while i < rest.len() {
        let byte = rest[i].name.as_bytes()[new_len];
        let mut j = i + 1;
        while j < rest.len() && rest[j].name.as_bytes()[new_len] == byte {
            j += 1;
        }
        groups.push(&rest[i..j]);
        i = j;
    }

    node.children = if parallel && rest.len() > 1024 {
        groups
            .par_iter()
            .map(|group| construct_trie(group, new_len, false))
            .collect()
    } else {
        groups
            .iter()
            .map(|group| construct_trie(group, new_len, false))
            .collect()
    };
    node
}

fn set_offset(node: &mut TrieNode, offset: usize) -> usize {
    node.offset = offset as u32;

    let mut size = if node.is_leaf {
        let payload = uleb_size(node.flags as u64) + uleb_size(node.addr);
        payload + uleb_size(payload as u64)
    } else {
        1
    };
    size += 1; // edge count

    for child in &node.children {
        size += child.prefix.len() + 1 + uleb_size(child.offset as u64);
    }
    for child in &mut node.children {
        size += set_offset(child, offset + size);
    }
    size
}

fn write_trie(buf: &mut [u8], node: &TrieNode) {
    let mut p = node.offset as usize;
    if node.is_leaf {
        let payload = uleb_size(node.flags as u64) + uleb_size(node.addr);
        p += crate::util::write_uleb(&mut buf[p..], payload as u64);
        p += crate::util::write_uleb(&mut buf[p..], node.flags as u64);
        p += crate::util::write_uleb(&mut buf[p..], node.addr);
    } else {
        buf[p] = 0;
        p += 1;
    }

    buf[p] = node.children.len() as u8;
    p += 1;

    for child in &node.children {
        buf[p..p + child.prefix.len()].copy_from_slice(child.prefix.as_bytes());
        p += child.prefix.len();
        buf[p] = 0;
        p += 1;
        p += crate::util::write_uleb(&mut buf[p..], child.offset as u64);
    }

    for child in &node.children {
        write_trie(buf, child);
    }
}

/// Serializes the export trie: every extern defined symbol, keyed by
/// name, with its address relative to the image base.
///
/// Because child offsets are ULEB-encoded yet may point forward, sizing
/// runs twice; the second pass is enough for the offsets to converge.
pub fn build_export<A: Arch>(ctx: &Context<A>) -> Vec<u8> {
    let mut entries: Vec<Entry> = Vec::new();
    for obj in &ctx.objs {
        if !obj.alive() {
            continue;
        }
        for sym in obj.syms.iter().flatten() {
            let def = sym.def();
            if def.file != FileId::Obj(obj.file_idx) || def.scope != Scope::Extern {
                continue;
            }
            entries.push(Entry {
                name: Arc::clone(&sym.name),
                flags: if def.is_weak {
                    EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION
                } else {
                    0
                },
                // wrapping: an absolute symbol may sit below the image base
                addr: ctx.sym_addr(sym).wrapping_sub(ctx.arg.pagezero_size),
            });
        }
    }
    if entries.is_empty() {
        return Vec::new();
    }
    entries.par_sort_by(|a, b| a.name.cmp(&b.name));

    let node = construct_trie(&entries, 0, true);
    let mut root = if node.prefix.is_empty() {
        node
    } else {
        let mut root = TrieNode::default();
        root.children.push(node);
        root
    };

    set_offset(&mut root, 0);
    let size = set_offset(&mut root, 0);

    let mut buf = vec![0u8; align_to_usize(size, 8)];
    write_trie(&mut buf, &root);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebase_runs_collapse() {
        let mut enc = RebaseEncoder::new();
        for i in 0..4 {
            enc.add(2, 0x1000 + i * 8);
        }
        let buf = enc.finish();
        assert_eq!(buf[0], REBASE_OPCODE_SET_TYPE_IMM | REBASE_TYPE_POINTER);
        assert_eq!(buf[1], REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 2);
        // 0x1000 as ULEB
        assert_eq!(&buf[2..4], &[0x80, 0x20]);
        assert_eq!(buf[4], REBASE_OPCODE_DO_REBASE_IMM_TIMES | 4);
        assert_eq!(buf[5], REBASE_OPCODE_DONE);
    }

    #[test]
    fn bind_carries_state() {
        let mut enc = BindEncoder::new();
        enc.add(1, "_malloc", false, 2, 0x10, 0);
        enc.add(1, "_malloc", false, 2, 0x20, 0);
        let buf = enc.finish();
        // the second entry reuses dylib and name, re-emitting only the
        // segment offset
        let name_count = buf
            .windows(8)
            .filter(|w| *w == b"_malloc\0")
            .count();
        assert_eq!(name_count, 1);
        assert_eq!(buf[0], BIND_OPCODE_SET_TYPE_IMM | BIND_TYPE_POINTER);
        assert_eq!(buf[1], BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | 1);
    }

    #[test]
    fn trie_offsets_converge() {
        let entries = vec![
            Entry {
                name: Arc::from("_a"),
                flags: 0,
                addr: 0x1000,
            },
            Entry {
                name: Arc::from("_ab"),
                flags: 0,
                addr: 0x2000,
            },
            Entry {
                name: Arc::from("_b"),
                flags: 0,
                addr: 0x3000,
            },
        ];
        let node = construct_trie(&entries, 0, false);
        let mut root = TrieNode::default();
        root.children.push(node);
        set_offset(&mut root, 0);
        let size = set_offset(&mut root, 0);
        let mut buf = vec![0u8; size];
        write_trie(&mut buf, &root);
        // all three names share "_", so the root is an internal node
        // with no payload and a single edge
        assert_eq!(buf[0], 0);
        assert_eq!(buf[1], 1);
        assert_eq!(buf[2], b'_');
    }
}
