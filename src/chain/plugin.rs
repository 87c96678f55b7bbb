//! Terminal chain layers: the things that actually produce or consume
//! bytes. A plugin is a [`Layer`] like any other, but the chain
//! invariant requires it to override at least `get_size` and `pread` —
//! the default "forward to next" has nothing left to forward to.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::chain::{BlockSize, Extent, Handle, Layer, Next};
use crate::device_size::device_size;
use crate::error::{ChainError, ErrorKind, Result};

/// An in-memory export, mostly useful for tests and for `nbdkit-sparse`
/// style ephemeral scratch disks.
pub struct MemoryPlugin {
    writable: bool,
    data: Mutex<Vec<u8>>,
}

impl MemoryPlugin {
    pub fn new(data: Vec<u8>, writable: bool) -> Self {
        MemoryPlugin {
            writable,
            data: Mutex::new(data),
        }
    }
}

impl Layer for MemoryPlugin {
    fn name(&self) -> &str {
        "memory"
    }

    fn open(&self, _next: &Next, _readonly: bool) -> Result<Handle> {
        Ok(Handle::unit())
    }

    fn get_size(&self, _next: &Next, _handle: &Handle) -> Result<u64> {
        Ok(self.data.lock().unwrap().len() as u64)
    }

    fn can_write(&self, _next: &Next, _handle: &Handle) -> Result<bool> {
        Ok(self.writable)
    }

    fn can_flush(&self, _next: &Next, _handle: &Handle) -> Result<bool> {
        Ok(true)
    }

    fn can_zero(&self, _next: &Next, _handle: &Handle) -> Result<bool> {
        Ok(self.writable)
    }

    fn can_extents(&self, _next: &Next, _handle: &Handle) -> Result<bool> {
        Ok(true)
    }

    fn pread(&self, _next: &Next, _handle: &Handle, buf: &mut [u8], offset: u64) -> Result<()> {
        let data = self.data.lock().unwrap();
        let offset = offset as usize;
        let end = offset
            .checked_add(buf.len())
            .ok_or_else(|| ChainError::out_of_range("read past end of memory export"))?;
        if end > data.len() {
            return Err(ChainError::out_of_range("read past end of memory export"));
        }
        buf.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    fn pwrite(
        &self,
        _next: &Next,
        _handle: &Handle,
        buf: &[u8],
        offset: u64,
        _fua: bool,
    ) -> Result<()> {
        if !self.writable {
            return Err(ChainError::read_only("memory export is read-only"));
        }
        let mut data = self.data.lock().unwrap();
        let offset = offset as usize;
        let end = offset
            .checked_add(buf.len())
            .ok_or_else(|| ChainError::out_of_range("write past end of memory export"))?;
        if end > data.len() {
            return Err(ChainError::out_of_range("write past end of memory export"));
        }
        data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn zero(
        &self,
        _next: &Next,
        _handle: &Handle,
        offset: u64,
        len: u64,
        _fua: bool,
        _no_hole: bool,
    ) -> Result<()> {
        if !self.writable {
            return Err(ChainError::read_only("memory export is read-only"));
        }
        let mut data = self.data.lock().unwrap();
        let offset = offset as usize;
        let len = len as usize;
        let end = offset
            .checked_add(len)
            .ok_or_else(|| ChainError::out_of_range("zero past end of memory export"))?;
        if end > data.len() {
            return Err(ChainError::out_of_range("zero past end of memory export"));
        }
        data[offset..end].fill(0);
        Ok(())
    }

    fn flush(&self, _next: &Next, _handle: &Handle) -> Result<()> {
        Ok(())
    }

    fn extents(
        &self,
        _next: &Next,
        _handle: &Handle,
        offset: u64,
        len: u64,
        _req_one: bool,
    ) -> Result<Vec<Extent>> {
        // no sparseness tracking: one extent, always "allocated data".
        Ok(vec![Extent {
            offset,
            length: len,
            flags: 0,
        }])
    }
}

/// A regular-file-backed export: a sized region of a file opened once
/// per connection (`open` is cheap and stateless enough that we don't
/// bother sharing one handle across connections).
pub struct FilePlugin {
    path: PathBuf,
    writable: bool,
}

struct FileHandle(Mutex<File>);

impl FilePlugin {
    pub fn new(path: impl Into<PathBuf>, writable: bool) -> Self {
        FilePlugin {
            path: path.into(),
            writable,
        }
    }
}

impl Layer for FilePlugin {
    fn name(&self) -> &str {
        "file"
    }

    fn open(&self, _next: &Next, readonly: bool) -> Result<Handle> {
        let file = OpenOptions::new()
            .read(true)
            .write(self.writable && !readonly)
            .open(&self.path)?;
        Ok(Handle::new(FileHandle(Mutex::new(file))))
    }

    fn get_size(&self, _next: &Next, handle: &Handle) -> Result<u64> {
        let handle = handle.downcast_ref::<FileHandle>();
        let file = handle.0.lock().unwrap();
        Ok(device_size(&file)?)
    }

    fn can_write(&self, _next: &Next, _handle: &Handle) -> Result<bool> {
        Ok(self.writable)
    }

    fn can_flush(&self, _next: &Next, _handle: &Handle) -> Result<bool> {
        Ok(true)
    }

    fn can_trim(&self, _next: &Next, _handle: &Handle) -> Result<bool> {
        Ok(self.writable)
    }

    fn pread(&self, _next: &Next, handle: &Handle, buf: &mut [u8], offset: u64) -> Result<()> {
        let handle = handle.downcast_ref::<FileHandle>();
        let mut file = handle.0.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn pwrite(
        &self,
        _next: &Next,
        handle: &Handle,
        buf: &[u8],
        offset: u64,
        fua: bool,
    ) -> Result<()> {
        if !self.writable {
            return Err(ChainError::read_only("file export is read-only"));
        }
        let handle = handle.downcast_ref::<FileHandle>();
        let mut file = handle.0.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        if fua {
            file.sync_data()?;
        }
        Ok(())
    }

    fn trim(&self, _next: &Next, _handle: &Handle, _offset: u64, _len: u64, _fua: bool) -> Result<()> {
        // no portable punch-hole via std; treat as a no-op hint like
        // nbdkit's file plugin does when fallocate/hole-punching is
        // unavailable.
        Ok(())
    }

    fn flush(&self, _next: &Next, handle: &Handle) -> Result<()> {
        let handle = handle.downcast_ref::<FileHandle>();
        handle.0.lock().unwrap().sync_data()?;
        Ok(())
    }

    fn extents(
        &self,
        _next: &Next,
        _handle: &Handle,
        offset: u64,
        len: u64,
        _req_one: bool,
    ) -> Result<Vec<Extent>> {
        Ok(vec![Extent {
            offset,
            length: len,
            flags: 0,
        }])
    }
}

/// A block-device-backed export, distinguished from [`FilePlugin`] only
/// in how its size is established — worth keeping separate because the
/// device-size probe (§6) is the part that's genuinely non-portable.
pub struct DevicePlugin {
    path: PathBuf,
    writable: bool,
}

impl DevicePlugin {
    pub fn new(path: impl Into<PathBuf>, writable: bool) -> Self {
        DevicePlugin {
            path: path.into(),
            writable,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Layer for DevicePlugin {
    fn name(&self) -> &str {
        "device"
    }

    fn open(&self, _next: &Next, readonly: bool) -> Result<Handle> {
        let file = OpenOptions::new()
            .read(true)
            .write(self.writable && !readonly)
            .open(&self.path)?;
        Ok(Handle::new(FileHandle(Mutex::new(file))))
    }

    fn get_size(&self, _next: &Next, handle: &Handle) -> Result<u64> {
        let handle = handle.downcast_ref::<FileHandle>();
        let file = handle.0.lock().unwrap();
        Ok(device_size(&file)?)
    }

    fn block_size(&self, _next: &Next, _handle: &Handle) -> Result<BlockSize> {
        Ok(BlockSize {
            min: 512,
            preferred: 4096,
            max: 32 * 1024 * 1024,
        })
    }

    fn can_write(&self, _next: &Next, _handle: &Handle) -> Result<bool> {
        Ok(self.writable)
    }

    fn can_flush(&self, _next: &Next, _handle: &Handle) -> Result<bool> {
        Ok(true)
    }

    fn is_rotational(&self, _next: &Next, _handle: &Handle) -> Result<bool> {
        Ok(false)
    }

    fn pread(&self, _next: &Next, handle: &Handle, buf: &mut [u8], offset: u64) -> Result<()> {
        let handle = handle.downcast_ref::<FileHandle>();
        let mut file = handle.0.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn pwrite(
        &self,
        _next: &Next,
        handle: &Handle,
        buf: &[u8],
        offset: u64,
        fua: bool,
    ) -> Result<()> {
        if !self.writable {
            return Err(ChainError::read_only("device export is read-only"));
        }
        let handle = handle.downcast_ref::<FileHandle>();
        let mut file = handle.0.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        if fua {
            file.sync_data()?;
        }
        Ok(())
    }

    fn flush(&self, _next: &Next, handle: &Handle) -> Result<()> {
        let handle = handle.downcast_ref::<FileHandle>();
        handle.0.lock().unwrap().sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_plugin_rejects_writes_when_read_only() {
        let plugin = MemoryPlugin::new(vec![0u8; 16], false);
        let next = Next::new(&[], &[]);
        let handle = plugin.open(&next, false).unwrap();
        let err = plugin
            .pwrite(&next, &handle, &[1, 2, 3], 0, false)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReadOnly);
    }

    #[test]
    fn memory_plugin_round_trips_a_write() {
        let plugin = MemoryPlugin::new(vec![0u8; 16], true);
        let next = Next::new(&[], &[]);
        let handle = plugin.open(&next, false).unwrap();
        plugin.pwrite(&next, &handle, &[9, 9, 9], 4, false).unwrap();
        let mut buf = [0u8; 3];
        plugin.pread(&next, &handle, &mut buf, 4).unwrap();
        assert_eq!(buf, [9, 9, 9]);
    }
}
