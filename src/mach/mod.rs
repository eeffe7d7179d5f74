//! Raw Mach-O on-disk structures and constants.
//!
//! Everything here mirrors `<mach-o/loader.h>` and friends, restricted to
//! the 64-bit little-endian subset the linker consumes and produces.
//! Records derive [`scroll`] traits so they can be read from mapped input
//! and written into the output image at arbitrary offsets.

use scroll::Pread;
use std::borrow::Cow;

pub mod constants;
pub mod header;
pub mod load_command;
pub mod relocation;
pub mod symbols;

pub use constants::cputype;

/// Peeks the leading 32-bit magic of a buffer, if there is one.
pub fn peek_magic(bytes: &[u8]) -> Option<u32> {
    bytes.pread_with::<u32>(0, scroll::LE).ok()
}

/// Reinterprets `count` records of `T` at `offset` of a mapped file.
/// Borrows when the mapping happens to be aligned for `T`; archive
/// members are only 2-byte aligned, so the fallback copies into owned,
/// properly aligned storage.
pub fn pod_slice_at<T: plain::Plain + Copy>(
    data: &[u8],
    offset: usize,
    count: usize,
) -> Option<Cow<'_, [T]>> {
    let size = count.checked_mul(core::mem::size_of::<T>())?;
    let bytes = data.get(offset..offset.checked_add(size)?)?;
    match plain::slice_from_bytes_len(bytes, count) {
        Ok(slice) => Some(Cow::Borrowed(slice)),
        Err(_) => {
            let mut vec: Vec<T> = Vec::with_capacity(count);
            // SAFETY: T is plain-old-data, so any byte pattern is a
            // valid value, and the freshly allocated buffer has exactly
            // `size` bytes of capacity at a properly aligned address
            unsafe {
                core::ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    vec.as_mut_ptr() as *mut u8,
                    size,
                );
                vec.set_len(count);
            }
            Some(Cow::Owned(vec))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mach::relocation::RelocationInfo;

    #[test]
    fn pod_slice_handles_misalignment() {
        let mut bytes = vec![0u8; 20];
        bytes[4..8].copy_from_slice(&0x10u32.to_le_bytes());
        // aligned read borrows or copies; either way the values match
        let relocs: Cow<[RelocationInfo]> = pod_slice_at(&bytes, 4, 2).unwrap();
        assert_eq!(relocs[0].r_address, 0x10);
        // a deliberately odd offset still decodes
        let mut odd = vec![0u8; 17];
        odd[1..5].copy_from_slice(&0x22u32.to_le_bytes());
        let relocs: Cow<[RelocationInfo]> = pod_slice_at(&odd, 1, 2).unwrap();
        assert_eq!(relocs[0].r_address, 0x22);
        // out of bounds is caught
        assert!(pod_slice_at::<RelocationInfo>(&bytes, 16, 2).is_none());
    }
}

