#![forbid(unsafe_code)]

use std::{
    collections::BTreeSet,
    fs::{File, OpenOptions},
    io::{self, ErrorKind},
    path::Path,
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::warn;

use crate::types::{FsError, Result};

/// Trait for performing positioned I/O against the backing device.
pub trait FileIo: Send + Sync + 'static {
    /// Reads bytes from the device at the specified offset into the buffer.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes bytes to the device at the specified offset from the buffer.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Synchronizes all written data to stable storage.
    fn sync_all(&self) -> Result<()>;
    /// Returns the current length of the device in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the device is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the device to the specified length.
    fn truncate(&self, len: u64) -> Result<()>;
}

/// Image file or block device opened for read-write positioned I/O.
#[derive(Clone)]
pub struct FileDevice {
    inner: Arc<File>,
}

impl FileDevice {
    /// Opens an existing image for read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            inner: Arc::new(file),
        })
    }

    /// Creates (or truncates) an image of exactly `size` bytes.
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size)?;
        Ok(Self {
            inner: Arc::new(file),
        })
    }

    #[cfg(unix)]
    fn read_exact(&self, off: u64, dst: &mut [u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.inner.read_exact_at(dst, off)
    }

    #[cfg(unix)]
    fn write_all(&self, off: u64, src: &[u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.inner.write_all_at(src, off)
    }

    #[cfg(windows)]
    fn read_exact(&self, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !dst.is_empty() {
            let read = self.inner.seek_read(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "seek_read reached EOF",
                ));
            }
            dst = &mut dst[read..];
            off += read as u64;
        }
        Ok(())
    }

    #[cfg(windows)]
    fn write_all(&self, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !src.is_empty() {
            let written = self.inner.seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "seek_write wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn read_exact(&self, _off: u64, _dst: &mut [u8]) -> io::Result<()> {
        Err(io::Error::new(
            ErrorKind::Unsupported,
            "FileDevice unsupported on this platform",
        ))
    }

    #[cfg(not(any(unix, windows)))]
    fn write_all(&self, _off: u64, _src: &[u8]) -> io::Result<()> {
        Err(io::Error::new(
            ErrorKind::Unsupported,
            "FileDevice unsupported on this platform",
        ))
    }
}

impl FileIo for FileDevice {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.read_exact(off, dst).map_err(FsError::from)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        self.write_all(off, src).map_err(FsError::from)
    }

    fn sync_all(&self) -> Result<()> {
        self.inner.sync_all().map_err(FsError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.inner.set_len(len).map_err(FsError::from)
    }
}

/// Fixed-size in-memory device. Clones share the same bytes, so a test can
/// keep a handle and inspect what a session left behind.
#[derive(Clone, Default)]
pub struct MemDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemDevice {
    /// Creates a zero-filled device of `len` bytes.
    pub fn new(len: u64) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0u8; len as usize])),
        }
    }

    /// Copies the current device contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

fn range_in(len: usize, off: u64, n: usize) -> io::Result<std::ops::Range<usize>> {
    let start = usize::try_from(off)
        .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "offset overflow"))?;
    let end = start
        .checked_add(n)
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "offset overflow"))?;
    if end > len {
        return Err(io::Error::new(
            ErrorKind::UnexpectedEof,
            "access past end of device",
        ));
    }
    Ok(start..end)
}

impl FileIo for MemDevice {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        let range = range_in(bytes.len(), off, dst.len())?;
        dst.copy_from_slice(&bytes[range]);
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        let range = range_in(bytes.len(), off, src.len())?;
        bytes[range].copy_from_slice(src);
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.bytes.lock().len() as u64)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.bytes.lock().resize(len as usize, 0);
        Ok(())
    }
}

#[derive(Default, Debug)]
struct FaultPlan {
    writes_before_failure: Option<u64>,
    failing_offsets: BTreeSet<u64>,
    fail_sync: bool,
    writes_ok: u64,
    writes_failed: u64,
}

/// Wrapper that injects write and sync failures into another device.
pub struct FaultyDevice<D: FileIo> {
    inner: D,
    plan: Mutex<FaultPlan>,
}

impl<D: FileIo> FaultyDevice<D> {
    /// Wraps `inner` with no faults armed.
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            plan: Mutex::new(FaultPlan::default()),
        }
    }

    /// Lets `n` more writes through, then fails every write after them.
    pub fn fail_after_writes(&self, n: u64) {
        self.plan.lock().writes_before_failure = Some(n);
    }

    /// Fails any write that starts at `off`.
    pub fn fail_write_at(&self, off: u64) {
        self.plan.lock().failing_offsets.insert(off);
    }

    /// Makes `sync_all` fail while set.
    pub fn fail_sync(&self, fail: bool) {
        self.plan.lock().fail_sync = fail;
    }

    /// Disarms every fault.
    pub fn heal(&self) {
        let mut plan = self.plan.lock();
        plan.writes_before_failure = None;
        plan.failing_offsets.clear();
        plan.fail_sync = false;
    }

    /// Number of writes that reached the inner device.
    pub fn writes_ok(&self) -> u64 {
        self.plan.lock().writes_ok
    }

    /// Number of writes rejected by the fault plan.
    pub fn writes_failed(&self) -> u64 {
        self.plan.lock().writes_failed
    }

    /// Returns the wrapped device.
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: FileIo> FileIo for FaultyDevice<D> {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.inner.read_at(off, dst)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        {
            let mut plan = self.plan.lock();
            let exhausted = matches!(plan.writes_before_failure, Some(0));
            if exhausted || plan.failing_offsets.contains(&off) {
                plan.writes_failed += 1;
                warn!(offset = off, len = src.len(), "io.fault.write_injected");
                return Err(FsError::Io(io::Error::new(
                    ErrorKind::Other,
                    "injected write failure",
                )));
            }
            if let Some(left) = plan.writes_before_failure.as_mut() {
                *left -= 1;
            }
            plan.writes_ok += 1;
        }
        self.inner.write_at(off, src)
    }

    fn sync_all(&self) -> Result<()> {
        if self.plan.lock().fail_sync {
            warn!("io.fault.sync_injected");
            return Err(FsError::Io(io::Error::new(
                ErrorKind::Other,
                "injected sync failure",
            )));
        }
        self.inner.sync_all()
    }

    fn len(&self) -> Result<u64> {
        self.inner.len()
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.inner.truncate(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_device_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("image.bin");
        let dev = FileDevice::create(&path, 8192).unwrap();

        let payload = b"hello extent";
        dev.write_at(4096, payload).unwrap();
        dev.sync_all().unwrap();

        let reopened = FileDevice::open(&path).unwrap();
        let mut buf = vec![0u8; payload.len()];
        reopened.read_at(4096, &mut buf).unwrap();
        assert_eq!(&buf, payload);
        assert_eq!(reopened.len().unwrap(), 8192);
    }

    #[test]
    fn mem_device_rejects_access_past_end() {
        let dev = MemDevice::new(16);
        let err = dev.write_at(12, &[0u8; 8]).unwrap_err();
        match err {
            FsError::Io(inner) => assert_eq!(inner.kind(), ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other:?}"),
        }
        let mut buf = [0u8; 4];
        assert!(dev.read_at(12, &mut buf).is_ok());
    }

    #[test]
    fn faulty_device_fails_after_budget() {
        let dev = FaultyDevice::new(MemDevice::new(64));
        dev.fail_after_writes(2);
        dev.write_at(0, &[1]).unwrap();
        dev.write_at(1, &[2]).unwrap();
        assert!(dev.write_at(2, &[3]).is_err());
        assert_eq!(dev.writes_ok(), 2);
        assert_eq!(dev.writes_failed(), 1);
        assert_eq!(&dev.inner().snapshot()[..3], &[1, 2, 0]);

        dev.heal();
        dev.write_at(2, &[3]).unwrap();
        dev.fail_sync(true);
        assert!(dev.sync_all().is_err());
    }
}
