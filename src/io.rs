#![forbid(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use fs2::FileExt;

use crate::error::{GloamError, Result};
use crate::types::SMALLEST_PHYSICAL_BLOCK;

/// Block-aligned file abstraction for the pager. All offsets and lengths
/// must be multiples of [`SMALLEST_PHYSICAL_BLOCK`]. `sync` is a durability
/// barrier: every write issued before it is durable when it returns.
pub trait BlockFile: Send + Sync + 'static {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    fn sync(&self) -> Result<()>;
    fn len(&self) -> Result<u64>;
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn check_aligned(off: u64, len: usize) -> Result<()> {
    let block = SMALLEST_PHYSICAL_BLOCK as u64;
    if off % block != 0 || (len as u64) % block != 0 {
        return Err(GloamError::InvalidArgument("file access is not block aligned"));
    }
    Ok(())
}

/// `std::fs::File`-backed implementation using positional I/O. `open` takes
/// an exclusive advisory lock on the file, released when the last handle is
/// dropped.
#[derive(Clone)]
pub struct StdBlockFile {
    inner: Arc<File>,
}

impl StdBlockFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.try_lock_exclusive().map_err(|_| {
            GloamError::Io(std::io::Error::new(
                ErrorKind::WouldBlock,
                "data file is locked by another process",
            ))
        })?;
        Ok(Self { inner: Arc::new(file) })
    }

    fn file(&self) -> &File {
        &self.inner
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, mut off: u64, mut dst: &mut [u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt as UnixFileExt;
    while !dst.is_empty() {
        let read = UnixFileExt::read_at(file, dst, off)?;
        if read == 0 {
            return Err(std::io::Error::new(ErrorKind::UnexpectedEof, "read_at reached EOF"));
        }
        let (_, tail) = dst.split_at_mut(read);
        dst = tail;
        off += read as u64;
    }
    Ok(())
}

#[cfg(unix)]
fn write_all_at(file: &File, mut off: u64, mut src: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt as UnixFileExt;
    while !src.is_empty() {
        let written = UnixFileExt::write_at(file, src, off)?;
        if written == 0 {
            return Err(std::io::Error::new(ErrorKind::WriteZero, "write_at wrote zero bytes"));
        }
        src = &src[written..];
        off += written as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut off: u64, mut dst: &mut [u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt as WinFileExt;
    while !dst.is_empty() {
        let read = WinFileExt::seek_read(file, dst, off)?;
        if read == 0 {
            return Err(std::io::Error::new(ErrorKind::UnexpectedEof, "seek_read reached EOF"));
        }
        let (_, tail) = dst.split_at_mut(read);
        dst = tail;
        off += read as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut off: u64, mut src: &[u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt as WinFileExt;
    while !src.is_empty() {
        let written = WinFileExt::seek_write(file, src, off)?;
        if written == 0 {
            return Err(std::io::Error::new(ErrorKind::WriteZero, "seek_write wrote zero bytes"));
        }
        src = &src[written..];
        off += written as u64;
    }
    Ok(())
}

impl BlockFile for StdBlockFile {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        check_aligned(off, dst.len())?;
        read_exact_at(self.file(), off, dst).map_err(GloamError::from)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        check_aligned(off, src.len())?;
        write_all_at(self.file(), off, src).map_err(GloamError::from)
    }

    fn sync(&self) -> Result<()> {
        self.file().sync_all().map_err(GloamError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file().metadata()?.len())
    }
}
