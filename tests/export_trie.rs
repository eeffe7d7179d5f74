//! Export trie round trip: every exported name walks to a leaf whose
//! address matches the symbol; absent names fall off the trie.

mod common;

use common::*;
use machld::arch::Arm64;
use machld::cmdline::InputSpec;
use machld::driver;
use machld::mach::header::MH_DYLIB;

#[test]
fn exported_names_walk_to_leaves() {
    let dir = tempfile::tempdir().unwrap();

    let ret = 0xd65f_03c0u32.to_le_bytes();
    let mut text = Vec::new();
    for _ in 0..4 {
        text.extend_from_slice(&ret);
    }
    let mut obj = ObjBuilder::arm64();
    obj.sections.push(SectionSpec::text(text));
    obj.syms.push(SymSpec::global("_a", 1, 0));
    obj.syms.push(SymSpec::global("_ab", 1, 4));
    obj.syms.push(SymSpec::global("_b", 1, 8));
    obj.syms.push(SymSpec::global("_bc", 1, 12));
    let obj_path = dir.path().join("exports.o");
    std::fs::write(&obj_path, obj.build()).unwrap();

    let out = dir.path().join("libexports.dylib");
    let opts = base_opts(out.to_str().unwrap(), false);
    driver::link::<Arm64>(
        opts,
        MH_DYLIB,
        &[InputSpec::File(obj_path.to_str().unwrap().to_string())],
    )
    .unwrap();

    let img = Image::read(&out);
    let info = img.dyld_info();
    let trie = &img.bytes[info.export_off as usize..(info.export_off + info.export_size) as usize];

    let text_sect = img.find_section("__TEXT", "__text").unwrap();
    // a dylib has no page zero, so leaf addresses equal the virtual
    // addresses outright
    for (name, offset) in [("_a", 0u64), ("_ab", 4), ("_b", 8), ("_bc", 12)] {
        let (flags, addr) = walk_export_trie(trie, name)
            .unwrap_or_else(|| panic!("{} not found in export trie", name));
        assert_eq!(flags, 0);
        assert_eq!(addr, text_sect.addr + offset, "address of {}", name);
    }

    for name in ["_ax", "_c", "", "_", "_abc"] {
        assert!(
            walk_export_trie(trie, name).is_none(),
            "{:?} should not resolve",
            name
        );
    }
}
