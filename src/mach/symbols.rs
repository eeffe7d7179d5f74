//! "Nlist" style symbol table entries, the only symbol format Mach-O
//! object files carry.

use scroll::{IOwrite, Pread, Pwrite, SizeWith};

// Masks splitting the n_type byte
/// if any of these bits are set, this is a debugging (stab) entry
pub const N_STAB: u8 = 0xe0;
/// private external symbol bit
pub const N_PEXT: u8 = 0x10;
/// mask for the type bits
pub const N_TYPE: u8 = 0x0e;
/// external symbol bit, set for externally addressable symbols
pub const N_EXT: u8 = 0x01;

// Values of the N_TYPE bits
/// undefined, n_sect == NO_SECT
pub const N_UNDF: u8 = 0x0;
/// absolute, n_sect == NO_SECT
pub const N_ABS: u8 = 0x2;
/// defined in section number n_sect
pub const N_SECT: u8 = 0xe;
/// prebound undefined (defined in a dylib)
pub const N_PBUD: u8 = 0xc;
/// indirect
pub const N_INDR: u8 = 0xa;

/// stab entry naming an AST file referenced by the debugger
pub const N_AST: u8 = 0x32;

/// symbol is not in any section
pub const NO_SECT: u8 = 0;

// n_desc bits
/// must be preserved even if it looks dead, the dynamic linker may use it
pub const REFERENCED_DYNAMICALLY: u16 = 0x10;
/// do not dead-strip this symbol's subsection
pub const N_NO_DEAD_STRIP: u16 = 0x20;
/// weak undefined reference, missing definitions are tolerated
pub const N_WEAK_REF: u16 = 0x40;
/// weak definition, may be overridden at link or load time
pub const N_WEAK_DEF: u16 = 0x80;
/// this symbol continues the previous subsection rather than starting one
pub const N_ALT_ENTRY: u16 = 0x200;

/// two-level namespace ordinal meaning "search all loaded images"
pub const DYNAMIC_LOOKUP_ORDINAL: u8 = 0xfe;
/// two-level namespace ordinal meaning "look in the main executable"
pub const EXECUTABLE_ORDINAL: u8 = 0xff;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, IOwrite, SizeWith)]
pub struct Nlist64 {
    /// index into the string table
    pub n_strx: u32,
    /// type flag, see above
    pub n_type: u8,
    /// section number (1-based) or NO_SECT
    pub n_sect: u8,
    /// see `<mach-o/stab.h>` and the n_desc bits above
    pub n_desc: u16,
    /// value of this symbol (or stab offset)
    pub n_value: u64,
}

pub const SIZEOF_NLIST_64: usize = 16;

// SAFETY: plain-old-data; u32+u8+u8+u16 pack to 8 bytes so there is no
// interior padding before n_value
unsafe impl plain::Plain for Nlist64 {}

impl Nlist64 {
    pub fn is_stab(&self) -> bool {
        self.n_type & N_STAB != 0
    }

    pub fn is_extern(&self) -> bool {
        self.n_type & N_EXT != 0
    }

    pub fn is_private_extern(&self) -> bool {
        self.n_type & N_PEXT != 0
    }

    pub fn n_type_bits(&self) -> u8 {
        self.n_type & N_TYPE
    }

    pub fn is_undefined(&self) -> bool {
        self.n_type_bits() == N_UNDF && self.n_value == 0
    }

    /// A "common" symbol: undefined but carrying a tentative size.
    pub fn is_common(&self) -> bool {
        self.n_type_bits() == N_UNDF && self.is_extern() && self.n_value != 0
    }

    pub fn is_weak_def(&self) -> bool {
        self.n_desc & N_WEAK_DEF != 0
    }

    pub fn is_weak_ref(&self) -> bool {
        self.n_desc & N_WEAK_REF != 0
    }

    pub fn is_alt_entry(&self) -> bool {
        self.n_desc & N_ALT_ENTRY != 0
    }

    pub fn no_dead_strip(&self) -> bool {
        self.n_desc & N_NO_DEAD_STRIP != 0
    }

    pub fn referenced_dynamically(&self) -> bool {
        self.n_desc & REFERENCED_DYNAMICALLY != 0
    }

    /// The alignment a common symbol requests, as log2.
    pub fn common_p2align(&self) -> u8 {
        ((self.n_desc >> 8) & 0x0f) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let undef = Nlist64 {
            n_type: N_UNDF | N_EXT,
            ..Default::default()
        };
        assert!(undef.is_undefined());
        assert!(!undef.is_common());

        let common = Nlist64 {
            n_type: N_UNDF | N_EXT,
            n_value: 24,
            n_desc: 3 << 8,
            ..Default::default()
        };
        assert!(common.is_common());
        assert_eq!(common.common_p2align(), 3);

        let stab = Nlist64 {
            n_type: N_AST,
            ..Default::default()
        };
        assert!(stab.is_stab());
    }
}
