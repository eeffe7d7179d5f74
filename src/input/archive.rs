//! A simple extractor for Unix `!<arch>` static archives.
//!
//! Both name conventions appear in the wild: SysV postfixes names with a
//! `/` sigil (with a `//` long-name table), while BSD spells long names
//! `#1/<len>` and stores them in front of the member data. Archive
//! symbol indexes (`__.SYMDEF`, `/`) are skipped; the linker does its
//! own member selection from the members' symbol tables.

use crate::error::{Error, Result};
use crate::input::MappedFile;
use std::ops::Range;

pub const SIZEOF_MAGIC: usize = 8;
/// The magic number of a Unix archive
pub const MAGIC: &[u8; SIZEOF_MAGIC] = b"!<arch>\x0a";

const SIZEOF_FILE_HEADER: usize = 60;

/// One extracted archive member: its name and the byte range of its
/// contents within the archive.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub name: String,
    pub range: Range<usize>,
}

fn trimmed(bytes: &[u8]) -> &str {
    core::str::from_utf8(bytes)
        .unwrap_or("")
        .trim_end_matches([' ', '\0'])
}

fn parse_decimal(bytes: &[u8], what: &str, archive: &str) -> Result<usize> {
    trimmed(bytes)
        .parse()
        .map_err(|_| Error::Malformed(format!("{}: bad archive member {}", archive, what)))
}

/// Iterates the member headers of `mf`, resolving both long-name
/// schemes. Index members are filtered out.
pub fn members(mf: &MappedFile) -> Result<Vec<Member>> {
    let data = mf.data();
    if !data.starts_with(MAGIC) {
        return Err(Error::BadMagic(u64::from_le_bytes(
            data.get(0..8)
                .and_then(|b| b.try_into().ok())
                .unwrap_or([0; 8]),
        )));
    }

    let mut vec = Vec::new();
    let mut longnames: &[u8] = &[];
    let mut pos = SIZEOF_MAGIC;

    while pos + SIZEOF_FILE_HEADER <= data.len() {
        let hdr = &data[pos..pos + SIZEOF_FILE_HEADER];
        if &hdr[58..60] != b"\x60\x0a" {
            return Err(Error::Malformed(format!(
                "{}: bad archive member terminator at {:#x}",
                mf.name, pos
            )));
        }
        let size = parse_decimal(&hdr[48..58], "size", &mf.name)?;
        let mut name = trimmed(&hdr[0..16]).to_string();
        let mut contents = pos + SIZEOF_FILE_HEADER..pos + SIZEOF_FILE_HEADER + size;
        if contents.end > data.len() {
            return Err(Error::Malformed(format!(
                "{}: truncated archive member {}",
                mf.name, name
            )));
        }

        if let Some(stripped) = name.strip_prefix("#1/") {
            // BSD: the real name leads the member contents
            let len: usize = stripped.parse().map_err(|_| {
                Error::Malformed(format!("{}: bad BSD member name length", mf.name))
            })?;
            if len > size {
                return Err(Error::Malformed(format!(
                    "{}: BSD member name overruns member",
                    mf.name
                )));
            }
            name = trimmed(&data[contents.start..contents.start + len]).to_string();
            contents.start += len;
        } else if let Some(stripped) = name.strip_prefix('/') {
            if let Ok(off) = stripped.parse::<usize>() {
                // SysV: an offset into the `//` long-name table
                let rest = longnames.get(off..).unwrap_or(&[]);
                let end = rest
                    .iter()
                    .position(|&b| b == b'/' || b == b'\n')
                    .unwrap_or(rest.len());
                name = trimmed(&rest[..end]).to_string();
            }
        } else if let Some(stripped) = name.strip_suffix('/') {
            name = stripped.to_string();
        }

        pos = crate::util::align_to_usize(contents.end, 2);

        match name.as_str() {
            "" | "/" | "__.SYMDEF" | "__.SYMDEF SORTED" | "__.SYMDEF_64" => continue,
            "//" => {
                longnames = &data[contents.clone()];
                continue;
            }
            _ => {}
        }
        vec.push(Member {
            name,
            range: contents,
        });
    }
    Ok(vec)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(name: &str, size: usize) -> Vec<u8> {
        let mut hdr = vec![b' '; SIZEOF_FILE_HEADER];
        hdr[..name.len()].copy_from_slice(name.as_bytes());
        let size = format!("{}", size);
        hdr[48..48 + size.len()].copy_from_slice(size.as_bytes());
        hdr[58] = 0x60;
        hdr[59] = 0x0a;
        hdr
    }

    #[test]
    fn short_and_bsd_names() {
        let mut bytes = MAGIC.to_vec();
        bytes.extend(header("foo.o/", 4));
        bytes.extend(b"AAAA");
        bytes.extend(header("#1/12", 16));
        bytes.extend(b"verylongname");
        bytes.extend(b"BBBB");
        let mf = MappedFile::from_vec("lib.a".into(), bytes);

        let members = members(&mf).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].name, "foo.o");
        assert_eq!(&mf.data()[members[0].range.clone()], b"AAAA");
        assert_eq!(members[1].name, "verylongname");
        assert_eq!(&mf.data()[members[1].range.clone()], b"BBBB");
    }

    #[test]
    fn symdef_is_skipped() {
        let mut bytes = MAGIC.to_vec();
        bytes.extend(header("__.SYMDEF", 4));
        bytes.extend(b"ZZZZ");
        bytes.extend(header("bar.o/", 2));
        bytes.extend(b"XY");
        let mf = MappedFile::from_vec("lib.a".into(), bytes);

        let members = members(&mf).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "bar.o");
    }
}
