//! Probe the size of a file or block device.
//!
//! Ported from nbdkit's `common/utils/device-size.c`. Regular files use
//! `fstat`. Block devices try the Linux `BLKGETSIZE64` ioctl, then fall
//! back to an exponential-then-binary seek search for the largest
//! readable offset (the same trick `util-linux` uses, since `lseek` past
//! the end of some device nodes is not detectable any other portable
//! way). Never requires the fd to be open for writing.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;

use nix::ioctl_read;

// Linux: _IOR(0x12, 114, size_t) — BLKGETSIZE64.
ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// Return the size in bytes of `file`, which may be a regular file or a
/// block device.
pub fn device_size(file: &File) -> io::Result<u64> {
    let metadata = file.metadata()?;
    let file_type = metadata.file_type();

    if file_type.is_file() {
        return Ok(metadata.len());
    }
    if !file_type.is_block_device() {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "not a regular file or block device",
        ));
    }

    if let Ok(size) = linux_blkgetsize64(file) {
        return Ok(size);
    }

    find_size_by_seeking(file)
}

fn linux_blkgetsize64(file: &File) -> io::Result<u64> {
    let mut size: u64 = 0;
    unsafe { blkgetsize64(file.as_raw_fd(), &mut size) }.map_err(io::Error::from)?;
    Ok(size)
}

/// Find the size of a device that doesn't answer to an ioctl by
/// exponentially growing a seek-and-read-one-byte probe, then binary
/// searching the boundary it crosses.
fn find_size_by_seeking(file: &File) -> io::Result<u64> {
    let mut file = file.try_clone()?;

    let mut low: i64 = 0;
    let mut high: i64 = 1024;
    while valid_offset(&mut file, high)? {
        if high == i64::MAX {
            return Err(io::Error::new(io::ErrorKind::FileTooLarge, "device too large"));
        }
        low = high;
        high = if high >= i64::MAX / 2 {
            i64::MAX
        } else {
            high * 2
        };
    }

    while low < high - 1 {
        let mid = low + (high - low) / 2;
        if valid_offset(&mut file, mid)? {
            low = mid;
        } else {
            high = mid;
        }
    }

    // Restore the file position. The original nbdkit code does this same
    // "seek to 0" as its last step; per the design notes, callers should
    // not otherwise rely on the file position after a size probe.
    let _ = valid_offset(&mut file, 0)?;

    Ok((low + 1) as u64)
}

fn valid_offset(file: &mut File, offset: i64) -> io::Result<bool> {
    if file.seek(SeekFrom::Start(offset as u64)).is_err() {
        return Ok(false);
    }
    let mut byte = [0u8; 1];
    Ok(matches!(file.read(&mut byte), Ok(1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn regular_file_uses_metadata_len() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0u8; 4096]).unwrap();
        let size = device_size(f.as_file()).unwrap();
        assert_eq!(size, 4096);
    }
}
