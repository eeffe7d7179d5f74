//! The ad-hoc code signature: placement, magic, page hashes and
//! reproducibility.

mod common;

use common::*;
use machld::arch::Arm64;
use machld::cmdline::InputSpec;
use machld::driver;
use machld::mach::header::MH_DYLIB;
use machld::mach::load_command::{LinkeditDataCommand, LC_CODE_SIGNATURE};
use scroll::Pread;
use sha2::{Digest, Sha256};

fn link_signed(dir: &std::path::Path, name: &str) -> std::path::PathBuf {
    let ret = 0xd65f_03c0u32.to_le_bytes();
    let mut obj = ObjBuilder::arm64();
    obj.sections.push(SectionSpec::text(ret.to_vec()));
    obj.syms.push(SymSpec::global("_f", 1, 0));
    let obj_path = dir.join("f.o");
    std::fs::write(&obj_path, obj.build()).unwrap();

    let out = dir.join(name);
    let mut opts = base_opts(out.to_str().unwrap(), false);
    opts.adhoc_codesign = true;
    driver::link::<Arm64>(
        opts,
        MH_DYLIB,
        &[InputSpec::File(obj_path.to_str().unwrap().to_string())],
    )
    .unwrap();
    out
}

#[test]
fn signature_seals_every_page() {
    let dir = tempfile::tempdir().unwrap();
    let out = link_signed(dir.path(), "libf.dylib");
    let img = Image::read(&out);

    let sig_off = img.find_command(LC_CODE_SIGNATURE).unwrap();
    let sig: LinkeditDataCommand = img.bytes.pread_with(sig_off, scroll::LE).unwrap();

    // the signature is the very last thing in the file
    assert_eq!(sig.dataoff as usize + sig.datasize as usize, img.bytes.len());

    let blob = sig.dataoff as usize;
    let magic: u32 = img.bytes.pread_with(blob, scroll::BE).unwrap();
    assert_eq!(magic, 0xfade_0cc0);
    let count: u32 = img.bytes.pread_with(blob + 8, scroll::BE).unwrap();
    assert_eq!(count, 1);

    let dir_off = blob + 20;
    let dir_magic: u32 = img.bytes.pread_with(dir_off, scroll::BE).unwrap();
    assert_eq!(dir_magic, 0xfade_0c02);
    let hash_offset: u32 = img.bytes.pread_with(dir_off + 16, scroll::BE).unwrap();
    let ident_offset: u32 = img.bytes.pread_with(dir_off + 20, scroll::BE).unwrap();
    let n_code_slots: u32 = img.bytes.pread_with(dir_off + 28, scroll::BE).unwrap();
    let code_limit: u32 = img.bytes.pread_with(dir_off + 32, scroll::BE).unwrap();
    let hash_size: u8 = img.bytes.pread_with(dir_off + 36, scroll::BE).unwrap();
    let hash_type: u8 = img.bytes.pread_with(dir_off + 37, scroll::BE).unwrap();
    let page_shift: u8 = img.bytes.pread_with(dir_off + 39, scroll::BE).unwrap();

    assert_eq!(code_limit as usize, sig.dataoff as usize);
    assert_eq!(hash_size, 32);
    assert_eq!(hash_type, 2); // SHA-256
    assert_eq!(page_shift, 14); // 16 KiB pages

    // the identifier is the output's basename
    let ident: &str = img.bytes.pread(dir_off + ident_offset as usize).unwrap();
    assert_eq!(ident, "libf.dylib");

    // every page digest matches the file contents
    let page = 1usize << page_shift;
    let expected_slots = (sig.dataoff as usize + page - 1) / page;
    assert_eq!(n_code_slots as usize, expected_slots);
    for i in 0..expected_slots {
        let start = i * page;
        let end = (start + page).min(sig.dataoff as usize);
        let digest = Sha256::digest(&img.bytes[start..end]);
        let slot = dir_off + hash_offset as usize + i * 32;
        assert_eq!(
            &img.bytes[slot..slot + 32],
            digest.as_slice(),
            "hash of page {}",
            i
        );
    }
}

#[test]
fn signing_is_reproducible() {
    let dir = tempfile::tempdir().unwrap();
    let a = link_signed(dir.path(), "libf.dylib");
    let bytes_a = std::fs::read(&a).unwrap();
    std::fs::remove_file(&a).unwrap();
    let b = link_signed(dir.path(), "libf.dylib");
    assert_eq!(bytes_a, std::fs::read(&b).unwrap());
}
