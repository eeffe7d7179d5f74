//! Dead-stripping: only subsections reachable from the entry point
//! survive.

mod common;

use common::*;
use machld::arch::Arm64;
use machld::cmdline::InputSpec;
use machld::driver;
use machld::mach::header::MH_EXECUTE;
use machld::mach::relocation::ARM64_RELOC_BRANCH26;

fn ret() -> Vec<u8> {
    0xd65f_03c0u32.to_le_bytes().to_vec()
}

/// `_main` calls `_used`; `_unused` sits in its own object.
fn build_inputs(dir: &std::path::Path) -> Vec<InputSpec> {
    let mut text_a = Vec::new();
    text_a.extend_from_slice(&0x9400_0000u32.to_le_bytes()); // bl _used
    text_a.extend_from_slice(&ret());
    let mut a = ObjBuilder::arm64();
    let mut sec = SectionSpec::text(text_a);
    sec.relocs.push((0, r_info(1, true, 2, true, ARM64_RELOC_BRANCH26)));
    a.sections.push(sec);
    a.syms.push(SymSpec::global("_main", 1, 0));
    a.syms.push(SymSpec::undef("_used"));

    let mut b = ObjBuilder::arm64();
    b.sections.push(SectionSpec::text(ret()));
    b.syms.push(SymSpec::global("_used", 1, 0));

    let mut c = ObjBuilder::arm64();
    c.sections.push(SectionSpec::text(ret()));
    c.syms.push(SymSpec::global("_unused", 1, 0));

    let mut inputs = Vec::new();
    for (name, obj) in [("a.o", a), ("b.o", b), ("c.o", c)] {
        let path = dir.join(name);
        std::fs::write(&path, obj.build()).unwrap();
        inputs.push(InputSpec::File(path.to_str().unwrap().to_string()));
    }
    inputs
}

#[test]
fn unreachable_code_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = build_inputs(dir.path());

    let out = dir.path().join("stripped");
    let mut opts = base_opts(out.to_str().unwrap(), true);
    opts.dead_strip = true;
    driver::link::<Arm64>(opts, MH_EXECUTE, &inputs).unwrap();

    let img = Image::read(&out);
    let names: Vec<String> = img.symbols().into_iter().map(|(name, _)| name).collect();
    assert!(names.iter().any(|name| name == "_main"));
    assert!(names.iter().any(|name| name == "_used"));
    assert!(!names.iter().any(|name| name == "_unused"));

    // only the two reachable functions occupy __text
    let text = img.find_section("__TEXT", "__text").unwrap();
    assert_eq!(text.size, 8 + 4);
}

#[test]
fn without_stripping_everything_survives() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = build_inputs(dir.path());

    let out = dir.path().join("full");
    let opts = base_opts(out.to_str().unwrap(), true);
    driver::link::<Arm64>(opts, MH_EXECUTE, &inputs).unwrap();

    let img = Image::read(&out);
    let names: Vec<String> = img.symbols().into_iter().map(|(name, _)| name).collect();
    assert!(names.iter().any(|name| name == "_unused"));
    let text = img.find_section("__TEXT", "__text").unwrap();
    assert_eq!(text.size, 8 + 4 + 4);
}

#[test]
fn unused_dylibs_are_stripped_on_request() {
    let dir = tempfile::tempdir().unwrap();
    let mut inputs = build_inputs(dir.path());
    let tbd = dir.path().join("libSystem.tbd");
    std::fs::write(&tbd, libsystem_tbd("arm64", &["_printf"], &[])).unwrap();
    inputs.push(InputSpec::File(tbd.to_str().unwrap().to_string()));

    // nothing references libSystem, so -dead_strip_dylibs drops it
    let out = dir.path().join("nodylib");
    let mut opts = base_opts(out.to_str().unwrap(), true);
    opts.dead_strip_dylibs = true;
    driver::link::<Arm64>(opts, MH_EXECUTE, &inputs).unwrap();
    assert!(Image::read(&out).dylib_names().is_empty());

    // without the flag the load command stays
    let out2 = dir.path().join("withdylib");
    let opts2 = base_opts(out2.to_str().unwrap(), true);
    driver::link::<Arm64>(opts2, MH_EXECUTE, &inputs).unwrap();
    assert_eq!(Image::read(&out2).dylib_names().len(), 1);
}
