//! A strong definition in an object beats a weak export from a dylib:
//! the reference resolves locally and no dynamic binding is emitted.

mod common;

use common::*;
use machld::arch::Arm64;
use machld::cmdline::InputSpec;
use machld::driver;
use machld::mach::header::MH_EXECUTE;
use machld::mach::relocation::ARM64_RELOC_BRANCH26;
use scroll::Pread;

#[test]
fn strong_definition_overrides_weak_dylib_export() {
    let dir = tempfile::tempdir().unwrap();

    // _main calls _bar; _bar is defined here AND weakly exported by the
    // stub library
    let mut text = Vec::new();
    text.extend_from_slice(&0x9400_0000u32.to_le_bytes()); // bl _bar
    text.extend_from_slice(&0xd65f_03c0u32.to_le_bytes()); // ret
    text.extend_from_slice(&0xd65f_03c0u32.to_le_bytes()); // _bar: ret

    let mut obj = ObjBuilder::arm64();
    let mut sec = SectionSpec::text(text);
    sec.relocs.push((0, r_info(1, true, 2, true, ARM64_RELOC_BRANCH26)));
    obj.sections.push(sec);
    obj.syms.push(SymSpec::global("_main", 1, 0));
    obj.syms.push(SymSpec::global("_bar", 1, 8));
    let obj_path = dir.path().join("main.o");
    std::fs::write(&obj_path, obj.build()).unwrap();

    let tbd_path = dir.path().join("libfoo.tbd");
    std::fs::write(&tbd_path, libsystem_tbd("arm64", &[], &["_bar"])).unwrap();

    let out = dir.path().join("out");
    let opts = base_opts(out.to_str().unwrap(), true);
    driver::link::<Arm64>(
        opts,
        MH_EXECUTE,
        &[
            InputSpec::File(obj_path.to_str().unwrap().to_string()),
            InputSpec::File(tbd_path.to_str().unwrap().to_string()),
        ],
    )
    .unwrap();

    let img = Image::read(&out);

    // _bar resolved to the object: no stub machinery at all, and no
    // mention of it in any bind stream
    assert!(img.find_section("__TEXT", "__stubs").is_none());
    let info = img.dyld_info();
    for (off, size) in [
        (info.bind_off, info.bind_size),
        (info.lazy_bind_off, info.lazy_bind_size),
        (info.weak_bind_off, info.weak_bind_size),
    ] {
        let stream = &img.bytes[off as usize..(off + size) as usize];
        assert!(!stream.windows(5).any(|w| w == b"_bar\0"));
    }

    // the branch lands on the local definition
    let text_sect = img.find_section("__TEXT", "__text").unwrap();
    let insn: u32 = img
        .bytes
        .pread_with(text_sect.offset as usize, scroll::LE)
        .unwrap();
    let disp = ((insn & 0x03ff_ffff) as i64) << 38 >> 36;
    assert_eq!((text_sect.addr as i64 + disp) as u64, text_sect.addr + 8);

    // _bar is still a defined extern in the symbol table
    let bar = img
        .symbols()
        .into_iter()
        .find(|(name, _)| name == "_bar")
        .unwrap()
        .1;
    assert!(bar.is_extern());
    assert_eq!(bar.n_type_bits(), machld::mach::symbols::N_SECT);
    assert_eq!(bar.n_value, text_sect.addr + 8);
}
