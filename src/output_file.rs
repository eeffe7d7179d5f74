//! The output file: normally a fresh temporary next to the destination,
//! memory mapped read-write and renamed over the target on close. `-`
//! and special files fall back to an in-memory buffer.
//!
//! macOS caches code-signature verdicts per inode, so overwriting an
//! existing executable in place is never safe; a new inode every link
//! sidesteps that.

use crate::error::{Error, Result};
use memmap2::MmapMut;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub enum OutputFile {
    Mapped {
        map: MmapMut,
        tmp_path: PathBuf,
        final_path: PathBuf,
    },
    Buffered {
        buf: Vec<u8>,
        path: String,
        perm: u32,
    },
}

impl OutputFile {
    pub fn open(path: &str, filesize: u64, perm: u32) -> Result<OutputFile> {
        let is_special = path == "-"
            || fs::metadata(path)
                .map(|meta| !meta.is_file())
                .unwrap_or(false);
        if is_special {
            return Ok(OutputFile::Buffered {
                buf: vec![0; filesize as usize],
                path: path.to_string(),
                perm,
            });
        }

        let final_path = PathBuf::from(path);
        let dir = final_path.parent().unwrap_or_else(|| Path::new("."));
        let tmp_path = dir.join(format!(".machld-{}", std::process::id()));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| Error::Malformed(format!("cannot open {}: {}", tmp_path.display(), e)))?;
        file.set_len(filesize)?;
        set_permissions(&file, perm)?;

        // SAFETY: the mapping is private to this process until the
        // rename publishes the finished file
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(OutputFile::Mapped {
            map,
            tmp_path,
            final_path,
        })
    }

    pub fn buf_mut(&mut self) -> &mut [u8] {
        match self {
            OutputFile::Mapped { map, .. } => map,
            OutputFile::Buffered { buf, .. } => buf,
        }
    }

    pub fn close(self) -> Result<()> {
        match self {
            OutputFile::Mapped {
                map,
                tmp_path,
                final_path,
            } => {
                drop(map);
                fs::rename(&tmp_path, &final_path).map_err(|e| {
                    Error::Malformed(format!("{}: rename failed: {}", final_path.display(), e))
                })?;
            }
            OutputFile::Buffered { buf, path, perm } => {
                if path == "-" {
                    let stdout = std::io::stdout();
                    let mut lock = stdout.lock();
                    lock.write_all(&buf)?;
                    lock.flush()?;
                } else {
                    let mut file = OpenOptions::new()
                        .write(true)
                        .create(true)
                        .truncate(true)
                        .open(&path)
                        .map_err(|e| Error::Malformed(format!("cannot open {}: {}", path, e)))?;
                    set_permissions(&file, perm)?;
                    file.write_all(&buf)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn set_permissions(file: &File, perm: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(perm))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_permissions(_file: &File, _perm: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_rename() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let dest_str = dest.to_str().unwrap();

        let mut out = OutputFile::open(dest_str, 16, 0o755).unwrap();
        out.buf_mut()[0..4].copy_from_slice(b"\xcf\xfa\xed\xfe");
        out.close().unwrap();

        let bytes = fs::read(&dest).unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[0..4], b"\xcf\xfa\xed\xfe");
        // no stray temporary left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
