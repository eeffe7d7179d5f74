//! The ad-hoc code signature: a SuperBlob wrapping one CodeDirectory
//! whose slots are SHA-256 hashes of every page up to the signature
//! itself. Mandatory on ARM64 macOS; the loader verifies the hashes on
//! first execution.
//!
//! Code-signing blobs are big-endian, unlike everything else in the
//! file.

use crate::arch::Arch;
use crate::ctx::Context;
use crate::mach::constants::*;
use crate::mach::header::MH_EXECUTE;
use crate::util::align_to;
use rayon::prelude::*;
use scroll::{IOwrite, Pread, Pwrite, SizeWith};
use sha2::{Digest, Sha256};

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, IOwrite, SizeWith)]
struct SuperBlob {
    magic: u32,
    /// total length including all sub-blobs
    length: u32,
    count: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, IOwrite, SizeWith)]
struct BlobIndex {
    typ: u32,
    offset: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, IOwrite, SizeWith)]
struct CodeDirectory {
    magic: u32,
    length: u32,
    version: u32,
    flags: u32,
    hash_offset: u32,
    ident_offset: u32,
    n_special_slots: u32,
    n_code_slots: u32,
    code_limit: u32,
    hash_size: u8,
    hash_type: u8,
    platform: u8,
    /// log2 of the hashed page size
    page_size: u8,
    spare2: u32,
    scatter_offset: u32,
    team_offset: u32,
    spare3: u32,
    code_limit_64: u64,
    exec_seg_base: u64,
    exec_seg_limit: u64,
    exec_seg_flags: u64,
}

const SIZEOF_SUPER_BLOB: usize = 12;
const SIZEOF_BLOB_INDEX: usize = 8;
const SIZEOF_CODE_DIRECTORY: usize = 88;

fn identifier(ctx_output: &str) -> String {
    ctx_output
        .rsplit('/')
        .next()
        .unwrap_or(ctx_output)
        .to_string()
}

/// The signature's size depends only on its own file offset, which fixes
/// the number of hashed pages.
pub fn compute_size<A: Arch>(ctx: &mut Context<A>) {
    let hdr = match &mut ctx.code_sig {
        Some(hdr) => hdr,
        None => return,
    };
    let filename = identifier(ctx.arg.final_output());
    let filename_size = align_to(filename.len() as u64 + 1, 16);
    let num_blocks = align_to(hdr.sect.offset as u64, A::PAGE_SIZE) / A::PAGE_SIZE;
    hdr.sect.size = (SIZEOF_SUPER_BLOB + SIZEOF_BLOB_INDEX + SIZEOF_CODE_DIRECTORY) as u64
        + filename_size
        + num_blocks * SHA256_SIZE as u64;
}

fn hash_page(buf: &[u8], limit: usize, page_size: usize, i: usize) -> [u8; SHA256_SIZE] {
    let start = i * page_size;
    let end = (start + page_size).min(limit);
    let mut hasher = Sha256::new();
    hasher.update(&buf[start..end]);
    hasher.finalize().into()
}

/// Writes the signature over the finished image, then derives the UUID
/// from it when `-uuid hash` is in effect, patching the load commands
/// and re-hashing the pages they sit on.
pub fn write_signature<A: Arch>(ctx: &mut Context<A>, buf: &mut [u8]) {
    let (sig_off, sig_size) = match &ctx.code_sig {
        Some(hdr) => (hdr.sect.offset as usize, hdr.sect.size as usize),
        None => return,
    };
    buf[sig_off..sig_off + sig_size].fill(0);

    let filename = identifier(ctx.arg.final_output());
    let filename_size = align_to(filename.len() as u64 + 1, 16) as usize;
    let page_size = A::PAGE_SIZE as usize;
    let num_blocks = align_to(sig_off as u64, A::PAGE_SIZE) as usize / page_size;

    let text_seg = ctx
        .segments
        .iter()
        .find(|seg| seg.cmd.name() == SEG_TEXT)
        .expect("no text segment");

    let sb = SuperBlob {
        magic: CSMAGIC_EMBEDDED_SIGNATURE,
        length: sig_size as u32,
        count: 1,
    };
    buf.pwrite_with(sb, sig_off, scroll::BE).unwrap();

    let idx = BlobIndex {
        typ: CSSLOT_CODEDIRECTORY,
        offset: (SIZEOF_SUPER_BLOB + SIZEOF_BLOB_INDEX) as u32,
    };
    buf.pwrite_with(idx, sig_off + SIZEOF_SUPER_BLOB, scroll::BE).unwrap();

    let dir_off = sig_off + SIZEOF_SUPER_BLOB + SIZEOF_BLOB_INDEX;
    let dir = CodeDirectory {
        magic: CSMAGIC_CODEDIRECTORY,
        length: (SIZEOF_CODE_DIRECTORY + filename_size + num_blocks * SHA256_SIZE) as u32,
        version: CS_SUPPORTSEXECSEG,
        flags: CS_ADHOC | CS_LINKER_SIGNED,
        hash_offset: (SIZEOF_CODE_DIRECTORY + filename_size) as u32,
        ident_offset: SIZEOF_CODE_DIRECTORY as u32,
        n_special_slots: 0,
        n_code_slots: num_blocks as u32,
        code_limit: sig_off as u32,
        hash_size: SHA256_SIZE as u8,
        hash_type: CS_HASHTYPE_SHA256,
        platform: 0,
        page_size: A::PAGE_SIZE.trailing_zeros() as u8,
        spare2: 0,
        scatter_offset: 0,
        team_offset: 0,
        spare3: 0,
        code_limit_64: 0,
        exec_seg_base: text_seg.cmd.fileoff,
        exec_seg_limit: text_seg.cmd.filesize,
        exec_seg_flags: if ctx.output_type == MH_EXECUTE {
            CS_EXECSEG_MAIN_BINARY
        } else {
            0
        },
    };
    buf.pwrite_with(dir, dir_off, scroll::BE).unwrap();

    let ident_off = dir_off + SIZEOF_CODE_DIRECTORY;
    buf[ident_off..ident_off + filename.len()].copy_from_slice(filename.as_bytes());

    // hash every page below the signature, in parallel
    let hash_base = dir_off + SIZEOF_CODE_DIRECTORY + filename_size;
    let hashes: Vec<[u8; SHA256_SIZE]> = {
        let readonly: &[u8] = buf;
        (0..num_blocks)
            .into_par_iter()
            .map(|i| hash_page(readonly, sig_off, page_size, i))
            .collect()
    };
    for (i, hash) in hashes.iter().enumerate() {
        buf[hash_base + i * SHA256_SIZE..hash_base + (i + 1) * SHA256_SIZE].copy_from_slice(hash);
    }

    // the UUID is a tree hash: a digest over the page digests just
    // written, shaped like a UUIDv4
    if ctx.arg.uuid == crate::opt::UuidKind::Hash {
        let mut hasher = Sha256::new();
        hasher.update(&buf[sig_off..sig_off + sig_size]);
        let digest = hasher.finalize();
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&digest[..16]);
        uuid[6] = (uuid[6] & 0b0000_1111) | 0b0101_0000;
        uuid[8] = (uuid[8] & 0b0011_1111) | 0b1000_0000;
        ctx.uuid = uuid;

        // rewrite the load commands and refresh the pages they occupy
        let hdr_off = ctx.mach_hdr.sect.offset as usize;
        let hdr_size = ctx.mach_hdr.sect.size as usize;
        crate::out::header::copy_mach_header(ctx, &mut buf[hdr_off..hdr_off + hdr_size]);
        let dirty = crate::util::align_to_usize(hdr_size, page_size) / page_size;
        for i in 0..dirty.min(num_blocks) {
            let hash = hash_page(buf, sig_off, page_size, i);
            buf[hash_base + i * SHA256_SIZE..hash_base + (i + 1) * SHA256_SIZE]
                .copy_from_slice(&hash);
        }
    }
}

/// Page verification races a lazily-synced mmap on macOS; force the
/// written pages out so the kernel sees what was hashed.
#[cfg(target_os = "macos")]
pub fn invalidate(buf: &mut [u8]) {
    unsafe {
        libc::msync(
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MS_INVALIDATE,
        );
    }
}

#[cfg(not(target_os = "macos"))]
pub fn invalidate(_buf: &mut [u8]) {}

#[cfg(test)]
mod tests {
    use super::*;
    use scroll::ctx::SizeWith;

    #[test]
    fn blob_sizes() {
        let be = scroll::BE;
        assert_eq!(SuperBlob::size_with(&be), SIZEOF_SUPER_BLOB);
        assert_eq!(BlobIndex::size_with(&be), SIZEOF_BLOB_INDEX);
        assert_eq!(CodeDirectory::size_with(&be), SIZEOF_CODE_DIRECTORY);
    }

    #[test]
    fn blobs_are_big_endian() {
        let sb = SuperBlob {
            magic: CSMAGIC_EMBEDDED_SIGNATURE,
            length: 0x100,
            count: 1,
        };
        let mut buf = [0u8; SIZEOF_SUPER_BLOB];
        buf.pwrite_with(sb, 0, scroll::BE).unwrap();
        assert_eq!(&buf[0..4], &[0xfa, 0xde, 0x0c, 0xc0]);
        assert_eq!(&buf[4..8], &[0x00, 0x00, 0x01, 0x00]);
    }
}
