//! Input files: memory-mapped bytes plus the parsers that turn them into
//! objects, dylib stubs and archive members.

use crate::error::{Error, Result};
use crate::mach::header::{MH_DSYM, MH_DYLIB, MH_DYLIB_STUB, MH_EXECUTE, MH_MAGIC_64, MH_OBJECT};
use memmap2::Mmap;
use scroll::Pread;
use std::fs::File;
use std::ops::Range;
use std::sync::Arc;

pub mod archive;
pub mod dylib;
pub mod object;
pub mod section;

pub use dylib::DylibFile;
pub use object::{ObjectFile, UnwindRecord};
pub use section::{InputSection, RelocTarget, Relocation, Subsection, SubsecRef};

/// The bytes of an input file. Files given on the command line are
/// memory mapped read-only; archive members alias a range of their
/// archive's map; synthesized inputs own their bytes.
#[derive(Debug, Clone)]
enum FileData {
    Mapped { map: Arc<Mmap>, range: Range<usize> },
    Owned(Arc<Vec<u8>>),
}

#[derive(Debug, Clone)]
pub struct MappedFile {
    pub name: String,
    data: FileData,
}

impl MappedFile {
    /// Maps `path` read-only. Demand paging makes the map cheap even for
    /// large archives.
    pub fn open(path: &str) -> Result<MappedFile> {
        let file = File::open(path)
            .map_err(|e| Error::Malformed(format!("{}: cannot open: {}", path, e)))?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Ok(MappedFile {
                name: path.to_string(),
                data: FileData::Owned(Arc::new(Vec::new())),
            });
        }
        // SAFETY: the map is read-only and outlives all slices through Arc
        let map = unsafe { Mmap::map(&file)? };
        Ok(MappedFile {
            name: path.to_string(),
            data: FileData::Mapped {
                range: 0..map.len(),
                map: Arc::new(map),
            },
        })
    }

    pub fn from_vec(name: String, bytes: Vec<u8>) -> MappedFile {
        MappedFile {
            name,
            data: FileData::Owned(Arc::new(bytes)),
        }
    }

    pub fn data(&self) -> &[u8] {
        match &self.data {
            FileData::Mapped { map, range } => &map[range.clone()],
            FileData::Owned(vec) => vec,
        }
    }

    /// A sub-file aliasing `range` of this file's bytes, e.g. an archive
    /// member.
    pub fn slice(&self, name: String, range: Range<usize>) -> MappedFile {
        match &self.data {
            FileData::Mapped { map, range: outer } => {
                let base = outer.start;
                MappedFile {
                    name,
                    data: FileData::Mapped {
                        map: Arc::clone(map),
                        range: base + range.start..base + range.end,
                    },
                }
            }
            FileData::Owned(vec) => MappedFile {
                name,
                data: FileData::Owned(Arc::new(vec[range].to_vec())),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Object,
    Dylib,
    Archive,
    Tbd,
    LlvmBitcode,
    Unknown,
}

/// Sniffs the type of an input from its leading bytes.
pub fn file_kind(data: &[u8]) -> FileKind {
    if data.starts_with(crate::input::archive::MAGIC) {
        return FileKind::Archive;
    }
    if data.starts_with(b"BC\xc0\xde") {
        return FileKind::LlvmBitcode;
    }
    if data.len() >= 20 {
        if let Ok(magic) = data.pread_with::<u32>(0, scroll::LE) {
            // a bitcode wrapper precedes raw bitcode with this magic
            if magic == 0x0b17_c0de {
                return FileKind::LlvmBitcode;
            }
            if magic == MH_MAGIC_64 {
                return match data.pread_with::<u32>(12, scroll::LE).unwrap_or(0) {
                    MH_OBJECT => FileKind::Object,
                    MH_DYLIB | MH_DYLIB_STUB => FileKind::Dylib,
                    MH_EXECUTE | MH_DSYM => FileKind::Unknown,
                    _ => FileKind::Unknown,
                };
            }
        }
    }
    // TBD files are YAML documents beginning with a separator
    if data.starts_with(b"---") {
        return FileKind::Tbd;
    }
    FileKind::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffing() {
        assert_eq!(file_kind(b"!<arch>\x0a"), FileKind::Archive);
        assert_eq!(file_kind(b"--- !tapi-tbd\n"), FileKind::Tbd);
        assert_eq!(file_kind(b"BC\xc0\xde...."), FileKind::LlvmBitcode);
        assert_eq!(file_kind(b"garbage"), FileKind::Unknown);

        let mut obj = vec![0u8; 32];
        obj[0..4].copy_from_slice(&MH_MAGIC_64.to_le_bytes());
        obj[12..16].copy_from_slice(&MH_OBJECT.to_le_bytes());
        assert_eq!(file_kind(&obj), FileKind::Object);
        obj[12..16].copy_from_slice(&MH_DYLIB.to_le_bytes());
        assert_eq!(file_kind(&obj), FileKind::Dylib);
    }
}
