//! Links a minimal "hello" executable: one object whose `_main` calls
//! `_printf` out of libSystem, then checks the import machinery end to
//! end.

mod common;

use common::*;
use machld::arch::Arm64;
use machld::cmdline::InputSpec;
use machld::driver;
use machld::mach::header::*;
use machld::mach::load_command::*;
use machld::mach::relocation::ARM64_RELOC_BRANCH26;
use scroll::Pread;

fn hello_object() -> Vec<u8> {
    let mut text = Vec::new();
    text.extend_from_slice(&0x9400_0000u32.to_le_bytes()); // bl _printf
    text.extend_from_slice(&0xd65f_03c0u32.to_le_bytes()); // ret

    let mut obj = ObjBuilder::arm64();
    let mut sec = SectionSpec::text(text);
    sec.relocs.push((0, r_info(1, true, 2, true, ARM64_RELOC_BRANCH26)));
    obj.sections.push(sec);
    obj.syms.push(SymSpec::global("_main", 1, 0));
    obj.syms.push(SymSpec::undef("_printf"));
    obj.build()
}

fn link_hello(dir: &std::path::Path, name: &str) -> std::path::PathBuf {
    let obj_path = dir.join("hello.o");
    std::fs::write(&obj_path, hello_object()).unwrap();
    let tbd_path = dir.join("libSystem.tbd");
    std::fs::write(&tbd_path, libsystem_tbd("arm64", &["_printf"], &[])).unwrap();

    let out_path = dir.join(name);
    let opts = base_opts(out_path.to_str().unwrap(), true);
    driver::link::<Arm64>(
        opts,
        MH_EXECUTE,
        &[
            InputSpec::File(obj_path.to_str().unwrap().to_string()),
            InputSpec::File(tbd_path.to_str().unwrap().to_string()),
        ],
    )
    .unwrap();
    out_path
}

#[test]
fn minimal_hello() {
    let dir = tempfile::tempdir().unwrap();
    let out = link_hello(dir.path(), "hello");
    let img = Image::read(&out);

    let hdr = img.header();
    assert_eq!(hdr.magic, MH_MAGIC_64);
    assert_eq!(hdr.filetype, MH_EXECUTE);
    assert_eq!(hdr.cputype, machld::mach::cputype::CPU_TYPE_ARM64);
    for flag in [MH_NOUNDEFS, MH_DYLDLINK, MH_TWOLEVEL, MH_PIE] {
        assert_eq!(hdr.flags & flag, flag);
    }

    // one imported function, so one stub, one helper entry, one lazy
    // pointer
    let stubs = img.find_section("__TEXT", "__stubs").unwrap();
    assert_eq!(stubs.size, 12);
    assert_eq!(stubs.reserved2, 12);
    let helper = img.find_section("__TEXT", "__stub_helper").unwrap();
    assert_eq!(helper.size, 24 + 12);
    let la = img.find_section("__DATA", "__la_symbol_ptr").unwrap();
    assert_eq!(la.size, 8);
    // dyld_stub_binder arrives through the GOT
    let got = img.find_section("__DATA_CONST", "__got").unwrap();
    assert_eq!(got.size, 8);

    assert_eq!(img.dylib_names(), vec!["/usr/lib/libSystem.B.dylib"]);

    // the entry point command names _main, which leads the text section
    let text = img.find_section("__TEXT", "__text").unwrap();
    let main_off = img.find_command(LC_MAIN).unwrap();
    let main_cmd: EntryPointCommand = img.bytes.pread_with(main_off, scroll::LE).unwrap();
    assert_eq!(main_cmd.entryoff, text.addr - 0x1_0000_0000);

    // the lazy pointer starts out aimed at its stub-helper entry
    let slot: u64 = img
        .bytes
        .pread_with(la.offset as usize, scroll::LE)
        .unwrap();
    assert_eq!(slot, helper.addr + 24);

    // the bl now targets the stub
    let insn: u32 = img
        .bytes
        .pread_with(text.offset as usize, scroll::LE)
        .unwrap();
    let disp = ((insn & 0x03ff_ffff) as i64) << 38 >> 36;
    assert_eq!((text.addr as i64 + disp) as u64, stubs.addr);
}

#[test]
fn symbol_table_groups_are_contiguous() {
    let dir = tempfile::tempdir().unwrap();
    let out = link_hello(dir.path(), "hello");
    let img = Image::read(&out);

    let (symtab, dysymtab) = img.symtab();
    assert_eq!(dysymtab.ilocalsym, 0);
    assert_eq!(dysymtab.iextdefsym, dysymtab.nlocalsym);
    assert_eq!(
        dysymtab.iundefsym,
        dysymtab.nlocalsym + dysymtab.nextdefsym
    );
    assert_eq!(
        symtab.nsyms,
        dysymtab.nlocalsym + dysymtab.nextdefsym + dysymtab.nundefsym
    );

    let syms = img.symbols();
    let names: Vec<&str> = syms.iter().map(|(name, _)| name.as_str()).collect();
    assert!(names.contains(&"_main"));
    assert!(names.contains(&"_printf"));
    assert!(names.contains(&"dyld_stub_binder"));

    // every group member matches its group's classification
    for (i, (_, nlist)) in syms.iter().enumerate() {
        let i = i as u32;
        let is_undef = nlist.n_type_bits() == machld::mach::symbols::N_UNDF;
        if i < dysymtab.iextdefsym {
            assert!(!nlist.is_extern() && !is_undef);
        } else if i < dysymtab.iundefsym {
            assert!(nlist.is_extern() && !is_undef);
        } else {
            assert!(is_undef);
        }
    }

    // imports carry their dylib's two-level namespace ordinal
    let printf = &syms.iter().find(|(name, _)| name == "_printf").unwrap().1;
    assert_eq!(printf.n_desc >> 8, 1);
}

#[test]
fn rebase_stream_covers_lazy_pointers() {
    let dir = tempfile::tempdir().unwrap();
    let out = link_hello(dir.path(), "hello");
    let img = Image::read(&out);

    let info = img.dyld_info();
    let rebase = &img.bytes
        [info.rebase_off as usize..(info.rebase_off + info.rebase_size) as usize];
    let slots = interpret_rebase(rebase);

    // exactly the lazy symbol pointer slides; the GOT slot is imported
    // and bound instead
    let la = img.find_section("__DATA", "__la_symbol_ptr").unwrap();
    let segs = img.segments();
    let (data_idx, data_seg) = segs
        .iter()
        .enumerate()
        .find(|(_, (seg, _))| seg.name() == "__DATA")
        .map(|(i, (seg, _))| (i, seg))
        .unwrap();
    assert_eq!(slots, vec![(data_idx as u8, la.addr - data_seg.vmaddr)]);

    // the bind stream names both imports' suppliers
    let bind = &img.bytes[info.bind_off as usize..(info.bind_off + info.bind_size) as usize];
    assert!(bind
        .windows(b"dyld_stub_binder\0".len())
        .any(|w| w == b"dyld_stub_binder\0"));
    let lazy =
        &img.bytes[info.lazy_bind_off as usize..(info.lazy_bind_off + info.lazy_bind_size) as usize];
    assert!(lazy.windows(b"_printf\0".len()).any(|w| w == b"_printf\0"));
}

#[test]
fn output_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let a = link_hello(dir.path(), "hello1");
    let b = link_hello(dir.path(), "hello2");
    assert_eq!(std::fs::read(a).unwrap(), std::fs::read(b).unwrap());
}
