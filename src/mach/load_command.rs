//! Load commands tell the kernel and dynamic linker how to map the file,
//! where the symbol tables live, which libraries are required, and where
//! the entry point is.
//!
//! Only the commands the linker reads from inputs or writes into its
//! output appear here.

use crate::util::name_from_padded;
use scroll::{IOwrite, Pread, Pwrite, SizeWith};

pub const LC_REQ_DYLD: u32 = 0x8000_0000;

pub const LC_SYMTAB: u32 = 0x2;
pub const LC_DYSYMTAB: u32 = 0xb;
pub const LC_LOAD_DYLIB: u32 = 0xc;
pub const LC_ID_DYLIB: u32 = 0xd;
pub const LC_LOAD_DYLINKER: u32 = 0xe;
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_UUID: u32 = 0x1b;
pub const LC_RPATH: u32 = 0x1c | LC_REQ_DYLD;
pub const LC_CODE_SIGNATURE: u32 = 0x1d;
pub const LC_SEGMENT_SPLIT_INFO: u32 = 0x1e;
pub const LC_REEXPORT_DYLIB: u32 = 0x1f | LC_REQ_DYLD;
pub const LC_LAZY_LOAD_DYLIB: u32 = 0x20;
pub const LC_DYLD_INFO: u32 = 0x22;
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
pub const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | LC_REQ_DYLD;
pub const LC_VERSION_MIN_MACOSX: u32 = 0x24;
pub const LC_VERSION_MIN_IPHONEOS: u32 = 0x25;
pub const LC_FUNCTION_STARTS: u32 = 0x26;
pub const LC_MAIN: u32 = 0x28 | LC_REQ_DYLD;
pub const LC_DATA_IN_CODE: u32 = 0x29;
pub const LC_SOURCE_VERSION: u32 = 0x2a;
pub const LC_ENCRYPTION_INFO_64: u32 = 0x2c;
pub const LC_LINKER_OPTION: u32 = 0x2d;
pub const LC_LINKER_OPTIMIZATION_HINT: u32 = 0x2e;
pub const LC_VERSION_MIN_TVOS: u32 = 0x2f;
pub const LC_VERSION_MIN_WATCHOS: u32 = 0x30;
pub const LC_BUILD_VERSION: u32 = 0x32;
pub const LC_DYLD_EXPORTS_TRIE: u32 = 0x33 | LC_REQ_DYLD;
pub const LC_DYLD_CHAINED_FIXUPS: u32 = 0x34 | LC_REQ_DYLD;

pub fn cmd_to_str(cmd: u32) -> &'static str {
    match cmd {
        LC_SYMTAB => "LC_SYMTAB",
        LC_DYSYMTAB => "LC_DYSYMTAB",
        LC_LOAD_DYLIB => "LC_LOAD_DYLIB",
        LC_ID_DYLIB => "LC_ID_DYLIB",
        LC_LOAD_DYLINKER => "LC_LOAD_DYLINKER",
        LC_LOAD_WEAK_DYLIB => "LC_LOAD_WEAK_DYLIB",
        LC_SEGMENT_64 => "LC_SEGMENT_64",
        LC_UUID => "LC_UUID",
        LC_RPATH => "LC_RPATH",
        LC_CODE_SIGNATURE => "LC_CODE_SIGNATURE",
        LC_REEXPORT_DYLIB => "LC_REEXPORT_DYLIB",
        LC_LAZY_LOAD_DYLIB => "LC_LAZY_LOAD_DYLIB",
        LC_DYLD_INFO => "LC_DYLD_INFO",
        LC_DYLD_INFO_ONLY => "LC_DYLD_INFO_ONLY",
        LC_FUNCTION_STARTS => "LC_FUNCTION_STARTS",
        LC_MAIN => "LC_MAIN",
        LC_DATA_IN_CODE => "LC_DATA_IN_CODE",
        LC_SOURCE_VERSION => "LC_SOURCE_VERSION",
        LC_BUILD_VERSION => "LC_BUILD_VERSION",
        LC_DYLD_EXPORTS_TRIE => "LC_DYLD_EXPORTS_TRIE",
        _ => "UNKNOWN LOAD COMMAND",
    }
}

/// Occurs at the beginning of every load command and serves as the tag of
/// the variant that follows.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct LoadCommandHeader {
    pub cmd: u32,
    pub cmdsize: u32,
}

pub const SIZEOF_LOAD_COMMAND: usize = 8;

/// Offset of a NUL-terminated string from the start of its load command.
pub type LcStr = u32;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, IOwrite, SizeWith)]
pub struct SegmentCommand64 {
    /// LC_SEGMENT_64
    pub cmd: u32,
    pub cmdsize: u32,
    pub segname: [u8; 16],
    /// memory address of this segment
    pub vmaddr: u64,
    /// memory size of this segment
    pub vmsize: u64,
    /// file offset of this segment
    pub fileoff: u64,
    /// amount to map from the file
    pub filesize: u64,
    /// maximum VM protection
    pub maxprot: u32,
    /// initial VM protection
    pub initprot: u32,
    /// number of sections in segment
    pub nsects: u32,
    pub flags: u32,
}

pub const SIZEOF_SEGMENT_COMMAND_64: usize = 72;

impl SegmentCommand64 {
    pub fn name(&self) -> &str {
        name_from_padded(&self.segname)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, IOwrite, SizeWith)]
pub struct Section64 {
    /// name of this section
    pub sectname: [u8; 16],
    /// segment this section goes in
    pub segname: [u8; 16],
    /// memory address of this section
    pub addr: u64,
    /// size in bytes of this section
    pub size: u64,
    /// file offset of this section
    pub offset: u32,
    /// section alignment (power of 2)
    pub align: u32,
    /// file offset of relocation entries
    pub reloff: u32,
    /// number of relocation entries
    pub nreloc: u32,
    /// flags (section type and attributes)
    pub flags: u32,
    /// reserved (for offset or index)
    pub reserved1: u32,
    /// reserved (for count or sizeof)
    pub reserved2: u32,
    pub reserved3: u32,
}

pub const SIZEOF_SECTION_64: usize = 80;

impl Section64 {
    pub fn segname(&self) -> &str {
        name_from_padded(&self.segname)
    }

    pub fn sectname(&self) -> &str {
        name_from_padded(&self.sectname)
    }

    pub fn sect_type(&self) -> u32 {
        self.flags & crate::mach::constants::SECTION_TYPE
    }

    pub fn attrs(&self) -> u32 {
        self.flags & crate::mach::constants::SECTION_ATTRIBUTES
    }

    pub fn is_zerofill(&self) -> bool {
        use crate::mach::constants::{S_GB_ZEROFILL, S_THREAD_LOCAL_ZEROFILL, S_ZEROFILL};
        matches!(
            self.sect_type(),
            S_ZEROFILL | S_GB_ZEROFILL | S_THREAD_LOCAL_ZEROFILL
        )
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, IOwrite, SizeWith)]
pub struct SymtabCommand {
    /// LC_SYMTAB
    pub cmd: u32,
    pub cmdsize: u32,
    /// symbol table offset
    pub symoff: u32,
    /// number of symbol table entries
    pub nsyms: u32,
    /// string table offset
    pub stroff: u32,
    /// string table size in bytes
    pub strsize: u32,
}

pub const SIZEOF_SYMTAB_COMMAND: usize = 24;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, IOwrite, SizeWith)]
pub struct DysymtabCommand {
    /// LC_DYSYMTAB
    pub cmd: u32,
    pub cmdsize: u32,
    /// index to local symbols
    pub ilocalsym: u32,
    /// number of local symbols
    pub nlocalsym: u32,
    /// index to externally defined symbols
    pub iextdefsym: u32,
    /// number of externally defined symbols
    pub nextdefsym: u32,
    /// index to undefined symbols
    pub iundefsym: u32,
    /// number of undefined symbols
    pub nundefsym: u32,
    pub tocoff: u32,
    pub ntoc: u32,
    pub modtaboff: u32,
    pub nmodtab: u32,
    pub extrefsymoff: u32,
    pub nextrefsyms: u32,
    pub indirectsymoff: u32,
    pub nindirectsyms: u32,
    pub extreloff: u32,
    pub nextrel: u32,
    pub locreloff: u32,
    pub nlocrel: u32,
}

pub const SIZEOF_DYSYMTAB_COMMAND: usize = 80;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, IOwrite, SizeWith)]
pub struct Dylib {
    /// library's pathname, as an offset from the command start
    pub name: LcStr,
    /// library's build timestamp
    pub timestamp: u32,
    /// library's current version number, packed nibbles xxxx.yy.zz
    pub current_version: u32,
    /// library's compatibility version number
    pub compatibility_version: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, IOwrite, SizeWith)]
pub struct DylibCommand {
    /// LC_ID_DYLIB, LC_LOAD_{,WEAK_}DYLIB, LC_REEXPORT_DYLIB
    pub cmd: u32,
    /// includes the pathname string
    pub cmdsize: u32,
    pub dylib: Dylib,
}

pub const SIZEOF_DYLIB_COMMAND: usize = 24;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, IOwrite, SizeWith)]
pub struct DylinkerCommand {
    /// LC_LOAD_DYLINKER
    pub cmd: u32,
    /// includes the pathname string
    pub cmdsize: u32,
    /// dynamic linker's path name
    pub name: LcStr,
}

pub const SIZEOF_DYLINKER_COMMAND: usize = 12;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, IOwrite, SizeWith)]
pub struct RpathCommand {
    /// LC_RPATH
    pub cmd: u32,
    /// includes the path string
    pub cmdsize: u32,
    /// path to add to the run path
    pub path: LcStr,
}

pub const SIZEOF_RPATH_COMMAND: usize = 12;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, IOwrite, SizeWith)]
pub struct DyldInfoCommand {
    /// LC_DYLD_INFO or LC_DYLD_INFO_ONLY
    pub cmd: u32,
    pub cmdsize: u32,
    /// file offset of the rebase opcode stream
    pub rebase_off: u32,
    pub rebase_size: u32,
    /// file offset of the binding opcode stream
    pub bind_off: u32,
    pub bind_size: u32,
    /// file offset of the weak binding opcode stream
    pub weak_bind_off: u32,
    pub weak_bind_size: u32,
    /// file offset of the lazy binding opcode stream
    pub lazy_bind_off: u32,
    pub lazy_bind_size: u32,
    /// file offset of the export trie
    pub export_off: u32,
    pub export_size: u32,
}

pub const SIZEOF_DYLD_INFO_COMMAND: usize = 48;

/// The offsets and sizes of an opaque blob in the `__LINKEDIT` segment.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, IOwrite, SizeWith)]
pub struct LinkeditDataCommand {
    /// LC_CODE_SIGNATURE, LC_FUNCTION_STARTS or LC_DATA_IN_CODE
    pub cmd: u32,
    pub cmdsize: u32,
    /// file offset of data in the __LINKEDIT segment
    pub dataoff: u32,
    /// file size of data in the __LINKEDIT segment
    pub datasize: u32,
}

pub const SIZEOF_LINKEDIT_DATA_COMMAND: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, IOwrite, SizeWith)]
pub struct UuidCommand {
    /// LC_UUID
    pub cmd: u32,
    pub cmdsize: u32,
    /// 128-bit unique identifier
    pub uuid: [u8; 16],
}

pub const SIZEOF_UUID_COMMAND: usize = 24;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, IOwrite, SizeWith)]
pub struct BuildVersionCommand {
    /// LC_BUILD_VERSION
    pub cmd: u32,
    /// sizeof(BuildVersionCommand) plus ntools * sizeof(BuildToolVersion)
    pub cmdsize: u32,
    pub platform: u32,
    /// minimum OS version, packed nibbles xxxx.yy.zz
    pub minos: u32,
    /// SDK version
    pub sdk: u32,
    /// number of tool entries that follow
    pub ntools: u32,
}

pub const SIZEOF_BUILD_VERSION_COMMAND: usize = 24;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, IOwrite, SizeWith)]
pub struct BuildToolVersion {
    pub tool: u32,
    pub version: u32,
}

pub const SIZEOF_BUILD_TOOL_VERSION: usize = 8;

/// `tool` value for a static linker
pub const TOOL_LD: u32 = 3;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, IOwrite, SizeWith)]
pub struct SourceVersionCommand {
    /// LC_SOURCE_VERSION
    pub cmd: u32,
    pub cmdsize: u32,
    /// A.B.C.D.E packed as a24.b10.c10.d10.e10
    pub version: u64,
}

pub const SIZEOF_SOURCE_VERSION_COMMAND: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, IOwrite, SizeWith)]
pub struct EntryPointCommand {
    /// LC_MAIN, replacement for LC_UNIXTHREAD
    pub cmd: u32,
    pub cmdsize: u32,
    /// file (__TEXT) offset of main()
    pub entryoff: u64,
    /// initial stack size if not zero
    pub stacksize: u64,
}

pub const SIZEOF_ENTRY_POINT_COMMAND: usize = 24;

/// One entry of the `LC_DATA_IN_CODE` table: a range of an instruction
/// stream that actually holds data, such as a jump table.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, IOwrite, SizeWith)]
pub struct DataInCodeEntry {
    /// offset from the start of __TEXT
    pub offset: u32,
    pub length: u16,
    /// a DICE_KIND_* value
    pub kind: u16,
}

pub const SIZEOF_DATA_IN_CODE_ENTRY: usize = 8;

// SAFETY: plain-old-data with no padding, any bit pattern is valid
unsafe impl plain::Plain for DataInCodeEntry {}

pub const DICE_KIND_DATA: u16 = 1;
pub const DICE_KIND_JUMP_TABLE8: u16 = 2;
pub const DICE_KIND_JUMP_TABLE16: u16 = 3;
pub const DICE_KIND_JUMP_TABLE32: u16 = 4;
pub const DICE_KIND_ABS_JUMP_TABLE32: u16 = 5;

#[cfg(test)]
mod tests {
    use super::*;
    use scroll::ctx::SizeWith;

    #[test]
    fn command_sizes_match_loader_h() {
        let le = scroll::LE;
        assert_eq!(SegmentCommand64::size_with(&le), SIZEOF_SEGMENT_COMMAND_64);
        assert_eq!(Section64::size_with(&le), SIZEOF_SECTION_64);
        assert_eq!(SymtabCommand::size_with(&le), SIZEOF_SYMTAB_COMMAND);
        assert_eq!(DysymtabCommand::size_with(&le), SIZEOF_DYSYMTAB_COMMAND);
        assert_eq!(DylibCommand::size_with(&le), SIZEOF_DYLIB_COMMAND);
        assert_eq!(DyldInfoCommand::size_with(&le), SIZEOF_DYLD_INFO_COMMAND);
        assert_eq!(
            LinkeditDataCommand::size_with(&le),
            SIZEOF_LINKEDIT_DATA_COMMAND
        );
        assert_eq!(UuidCommand::size_with(&le), SIZEOF_UUID_COMMAND);
        assert_eq!(EntryPointCommand::size_with(&le), SIZEOF_ENTRY_POINT_COMMAND);
        assert_eq!(DataInCodeEntry::size_with(&le), SIZEOF_DATA_IN_CODE_ENTRY);
    }
}
