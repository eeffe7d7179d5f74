//! The Mach-O file header for 64-bit objects and images.

use scroll::{IOwrite, Pread, Pwrite, SizeWith};

/// Mach header magic constant for 64-bit, little-endian
pub const MH_MAGIC_64: u32 = 0xfeed_facf;

// Constants for the filetype field of the mach_header
/// relocatable object file
pub const MH_OBJECT: u32 = 0x1;
/// demand paged executable file
pub const MH_EXECUTE: u32 = 0x2;
/// dynamically bound shared library
pub const MH_DYLIB: u32 = 0x6;
/// dynamically bound bundle file
pub const MH_BUNDLE: u32 = 0x8;
/// shared library stub for static linking only, no section contents
pub const MH_DYLIB_STUB: u32 = 0x9;
/// companion file with only debug sections
pub const MH_DSYM: u32 = 0xa;

pub fn filetype_to_str(filetype: u32) -> &'static str {
    match filetype {
        MH_OBJECT => "OBJECT",
        MH_EXECUTE => "EXECUTE",
        MH_DYLIB => "DYLIB",
        MH_BUNDLE => "BUNDLE",
        MH_DYLIB_STUB => "DYLIB_STUB",
        MH_DSYM => "DSYM",
        _ => "UNKNOWN FILETYPE",
    }
}

// Constants for the flags field of the mach_header
/// the object file has no undefined references
pub const MH_NOUNDEFS: u32 = 0x1;
/// the object file is input for the dynamic linker and can't be
/// statically link edited again
pub const MH_DYLDLINK: u32 = 0x4;
/// the image is using two-level namespace bindings
pub const MH_TWOLEVEL: u32 = 0x80;
/// safe to divide up the sections into sub-sections via symbols for dead
/// code stripping
pub const MH_SUBSECTIONS_VIA_SYMBOLS: u32 = 0x2000;
/// the final linked image contains external weak symbols
pub const MH_WEAK_DEFINES: u32 = 0x8000;
/// the final linked image uses weak symbols
pub const MH_BINDS_TO_WEAK: u32 = 0x10000;
/// the static linker does not need to examine dependent dylibs to see if
/// any are re-exported
pub const MH_NO_REEXPORTED_DYLIBS: u32 = 0x100000;
/// the OS will load the main executable at a random address
pub const MH_PIE: u32 = 0x200000;
/// when linking against this dylib, the static linker may skip the
/// LC_LOAD_DYLIB if no symbols are referenced
pub const MH_DEAD_STRIPPABLE_DYLIB: u32 = 0x400000;
/// contains a section of type S_THREAD_LOCAL_VARIABLES
pub const MH_HAS_TLV_DESCRIPTORS: u32 = 0x800000;
/// the code was linked for use in an application extension
pub const MH_APP_EXTENSION_SAFE: u32 = 0x2000000;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, IOwrite, SizeWith)]
pub struct MachHeader64 {
    /// `MH_MAGIC_64`
    pub magic: u32,
    /// cpu specifier
    pub cputype: u32,
    /// machine specifier
    pub cpusubtype: u32,
    /// type of file
    pub filetype: u32,
    /// number of load commands
    pub ncmds: u32,
    /// the size of all the load commands
    pub sizeofcmds: u32,
    pub flags: u32,
    pub reserved: u32,
}

pub const SIZEOF_MACH_HEADER_64: usize = 32;

#[cfg(test)]
mod tests {
    use super::*;
    use scroll::{Pread, Pwrite};

    #[test]
    fn header_roundtrip() {
        let hdr = MachHeader64 {
            magic: MH_MAGIC_64,
            cputype: crate::mach::cputype::CPU_TYPE_ARM64,
            cpusubtype: 0,
            filetype: MH_EXECUTE,
            ncmds: 14,
            sizeofcmds: 0x800,
            flags: MH_NOUNDEFS | MH_DYLDLINK | MH_TWOLEVEL | MH_PIE,
            reserved: 0,
        };
        let mut buf = [0u8; SIZEOF_MACH_HEADER_64];
        buf.pwrite_with(hdr, 0, scroll::LE).unwrap();
        assert_eq!(&buf[0..4], &[0xcf, 0xfa, 0xed, 0xfe]);
        let back: MachHeader64 = buf.pread_with(0, scroll::LE).unwrap();
        assert_eq!(back.ncmds, 14);
        assert_eq!(back.flags & MH_PIE, MH_PIE);
    }
}
