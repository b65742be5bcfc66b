use std::{
    os::fd::RawFd,
    sync::{Arc, RwLock},
};

use pomp_utils::ArrayVec;

use crate::error::{PompError, Result};

/// Maximum number of file descriptors a single buffer may carry.
pub const MAX_FD_COUNT: usize = 4;

/// Buffers grow in steps of this size, matching `POMP_BUFFER_ALIGN_ALLOC_SIZE`
/// in the reference implementation.
const ALIGN_ALLOC_SIZE: usize = 256;

#[inline]
fn align_alloc_size(capacity: usize) -> usize {
    capacity.div_ceil(ALIGN_ALLOC_SIZE) * ALIGN_ALLOC_SIZE
}

struct BufferData {
    data: Vec<u8>,
    /// Offsets in `data` at which a file descriptor integer has been written.
    fd_offsets: ArrayVec<usize, MAX_FD_COUNT>,
}

impl BufferData {
    fn fd_at(&self, off: usize) -> Option<RawFd> {
        if off + 4 > self.data.len() {
            return None;
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.data[off..off + 4]);
        Some(i32::from_ne_bytes(raw))
    }

    fn close_fds(&mut self) {
        for &off in self.fd_offsets.as_slice() {
            if let Some(fd) = self.fd_at(off) {
                if fd >= 0 {
                    unsafe {
                        libc::close(fd);
                    }
                }
            }
        }
        self.fd_offsets.clear();
    }
}

impl Drop for BufferData {
    fn drop(&mut self) {
        self.close_fds();
    }
}

/// A reference-counted, copy-on-write byte buffer that can additionally carry
/// file descriptors out-of-band (for passing over Unix sockets via
/// `SCM_RIGHTS`).
///
/// While more than one handle to the same underlying storage exists
/// (`is_shared()`), every mutating operation fails with
/// [`PompError::PermissionDenied`]. This mirrors the reference count
/// discipline of the original C buffer: a buffer becomes read-only the moment
/// it is shared.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<RwLock<BufferData>>,
}

impl Buffer {
    /// Creates an empty buffer, reserving at least `capacity` bytes up front.
    pub fn new(capacity: usize) -> Self {
        let cap = if capacity == 0 { 0 } else { align_alloc_size(capacity) };
        Self {
            inner: Arc::new(RwLock::new(BufferData {
                data: Vec::with_capacity(cap),
                fd_offsets: ArrayVec::new(),
            })),
        }
    }

    /// Creates a buffer whose contents are a copy of `data`.
    pub fn new_with_data(data: &[u8]) -> Self {
        let buf = Self::new(data.len());
        {
            let mut inner = buf.inner.write().expect("buffer lock poisoned");
            inner.data.extend_from_slice(data);
        }
        buf
    }

    /// Creates a deep copy of this buffer: the byte contents are duplicated
    /// and every carried file descriptor is `dup`'d, so the new buffer owns
    /// independent fds.
    pub fn new_copy(&self) -> Result<Self> {
        let src = self.inner.read().expect("buffer lock poisoned");
        let out = Self::new(src.data.len());
        {
            let mut dst = out.inner.write().expect("buffer lock poisoned");
            dst.data.extend_from_slice(&src.data);
            for &off in src.fd_offsets.as_slice() {
                let fd = src
                    .fd_at(off)
                    .ok_or(PompError::InvalidArgument("fd offset out of range"))?;
                let dupfd = unsafe { libc::dup(fd) };
                if dupfd < 0 {
                    drop(dst);
                    return Err(PompError::Io(std::io::Error::last_os_error()));
                }
                if let Err(e) = dst.register_fd(off, dupfd) {
                    unsafe {
                        libc::close(dupfd);
                    }
                    return Err(e);
                }
            }
        }
        Ok(out)
    }

    /// True once more than one handle to this storage exists: all mutating
    /// operations will fail until handles are dropped back down to one.
    #[inline]
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.inner) > 1
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.read().expect("buffer lock poisoned").data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.read().expect("buffer lock poisoned").data.capacity()
    }

    fn guard_mut(&self) -> Result<std::sync::RwLockWriteGuard<'_, BufferData>> {
        if self.is_shared() {
            return Err(PompError::PermissionDenied("buffer is shared"));
        }
        Ok(self.inner.write().expect("buffer lock poisoned"))
    }

    /// Grows internal storage (rounded up to a 256-byte step) so it can hold
    /// at least `capacity` bytes without reallocating.
    pub fn ensure_capacity(&self, capacity: usize) -> Result<()> {
        let mut inner = self.guard_mut()?;
        if capacity > inner.data.capacity() {
            let aligned = align_alloc_size(capacity);
            inner.data.reserve(aligned - inner.data.len());
        }
        Ok(())
    }

    /// Sets the logical length without touching contents; `n` must not
    /// exceed the current capacity.
    pub fn set_len(&self, n: usize) -> Result<()> {
        let mut inner = self.guard_mut()?;
        if n > inner.data.capacity() {
            return Err(PompError::InvalidArgument("len exceeds capacity"));
        }
        inner.data.resize(n, 0);
        Ok(())
    }

    /// Writes `data` at `*pos`, growing the buffer as needed, and advances
    /// `*pos` past the written bytes.
    pub fn write(&self, pos: &mut usize, data: &[u8]) -> Result<()> {
        let mut inner = self.guard_mut()?;
        let end = *pos + data.len();
        if end > inner.data.capacity() {
            let aligned = align_alloc_size(end);
            inner.data.reserve(aligned.saturating_sub(inner.data.len()));
        }
        if end > inner.data.len() {
            inner.data.resize(end, 0);
        }
        inner.data[*pos..end].copy_from_slice(data);
        *pos = end;
        Ok(())
    }

    #[inline]
    pub fn write_byte(&self, pos: &mut usize, b: u8) -> Result<()> {
        self.write(pos, &[b])
    }

    #[inline]
    pub fn append(&self, data: &[u8]) -> Result<()> {
        let mut pos = self.len();
        self.write(&mut pos, data)
    }

    /// Duplicates `fd` and writes it at `*pos` (a 4-byte placeholder on the
    /// wire; the real value only has meaning for local Unix-domain peers).
    pub fn write_fd(&self, pos: &mut usize, fd: RawFd) -> Result<()> {
        if fd < 0 {
            return Err(PompError::InvalidArgument("negative fd"));
        }
        let off = *pos;
        self.write(pos, &0i32.to_ne_bytes())?;
        let dupfd = unsafe { libc::dup(fd) };
        if dupfd < 0 {
            return Err(PompError::Io(std::io::Error::last_os_error()));
        }
        let mut inner = self.guard_mut()?;
        if let Err(e) = inner.register_fd(off, dupfd) {
            unsafe {
                libc::close(dupfd);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Reads `out.len()` bytes from `*pos`, advancing `*pos`.
    pub fn read(&self, pos: &mut usize, out: &mut [u8]) -> Result<()> {
        let inner = self.inner.read().expect("buffer lock poisoned");
        let end = *pos + out.len();
        if end > inner.data.len() {
            return Err(PompError::InvalidArgument("read past end of buffer"));
        }
        out.copy_from_slice(&inner.data[*pos..end]);
        *pos = end;
        Ok(())
    }

    #[inline]
    pub fn read_byte(&self, pos: &mut usize) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read(pos, &mut b)?;
        Ok(b[0])
    }

    /// Calls `f` with a borrow of `n` bytes at `*pos` without copying,
    /// advancing `*pos`. The borrow does not outlive the call.
    pub fn with_slice<R>(&self, pos: &mut usize, n: usize, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let inner = self.inner.read().expect("buffer lock poisoned");
        let end = *pos + n;
        if end > inner.data.len() {
            return Err(PompError::InvalidArgument("read past end of buffer"));
        }
        let r = f(&inner.data[*pos..end]);
        *pos = end;
        Ok(r)
    }

    /// Reads a file descriptor previously written with [`write_fd`].
    /// `*pos` must be exactly one of the offsets recorded for this buffer.
    pub fn read_fd(&self, pos: &mut usize) -> Result<RawFd> {
        let inner = self.inner.read().expect("buffer lock poisoned");
        if !inner.fd_offsets.as_slice().contains(&*pos) {
            return Err(PompError::InvalidArgument("no file descriptor at given position"));
        }
        let fd = inner.fd_at(*pos).ok_or(PompError::InvalidArgument("fd offset out of range"))?;
        *pos += 4;
        Ok(fd)
    }

    /// Records that the file descriptor `fd` (not duplicated by this call)
    /// occupies the 4 bytes at `off`. Used by the connection layer's
    /// fd-fixup pass after receiving `SCM_RIGHTS` ancillary data.
    pub fn register_fd(&self, off: usize, fd: RawFd) -> Result<()> {
        let mut inner = self.guard_mut()?;
        inner.register_fd(off, fd)
    }

    /// Releases file descriptors and truncates contents to empty. No-op
    /// (idempotent) the second time it is called.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.guard_mut()?;
        inner.close_fds();
        inner.data.clear();
        Ok(())
    }

    pub(crate) fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let inner = self.inner.read().expect("buffer lock poisoned");
        f(&inner.data)
    }
}

impl BufferData {
    fn register_fd(&mut self, off: usize, fd: RawFd) -> Result<()> {
        if off + 4 > self.data.len() {
            return Err(PompError::InvalidArgument("fd offset out of range"));
        }
        if self.fd_offsets.is_full() {
            return Err(PompError::ResourceExhausted("too many file descriptors in buffer"));
        }
        self.data[off..off + 4].copy_from_slice(&(fd as i32).to_ne_bytes());
        self.fd_offsets.push(off);
        Ok(())
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer").field("len", &self.len()).field("shared", &self.is_shared()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_is_empty() {
        let b = Buffer::new(16);
        assert_eq!(b.len(), 0);
        assert!(b.capacity() >= 16);
        assert!(!b.is_shared());
    }

    #[test]
    fn shared_rejects_mutation() {
        let b = Buffer::new(8);
        let _b2 = b.clone();
        assert!(b.is_shared());
        let mut pos = 0;
        assert!(b.write(&mut pos, b"x").is_err());
        assert!(b.clear().is_err());
    }

    #[test]
    fn write_then_read_roundtrip() {
        let b = Buffer::new(0);
        let mut pos = 0;
        b.write(&mut pos, b"hello").unwrap();
        assert_eq!(b.len(), 5);
        let mut out = [0u8; 5];
        let mut rp = 0;
        b.read(&mut rp, &mut out).unwrap();
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn clear_is_idempotent() {
        let b = Buffer::new(4);
        assert!(b.clear().is_ok());
        assert!(b.clear().is_ok());
    }

    #[test]
    fn write_fd_roundtrips_and_rejects_a_negative_fd() {
        let b = Buffer::new(0);
        let mut pos = 0;
        b.write_fd(&mut pos, libc::STDIN_FILENO).unwrap();
        let mut rp = 0;
        let got = b.read_fd(&mut rp).unwrap();
        assert!(got >= 0);
        unsafe {
            libc::close(got);
        }
        assert!(b.write_fd(&mut pos, -1).is_err());
    }

    #[test]
    fn the_fifth_write_fd_is_resource_exhausted() {
        let b = Buffer::new(0);
        let mut pos = 0;
        let mut dup_fds = Vec::new();
        for _ in 0..MAX_FD_COUNT {
            b.write_fd(&mut pos, libc::STDIN_FILENO).unwrap();
        }
        match b.write_fd(&mut pos, libc::STDIN_FILENO) {
            Err(PompError::ResourceExhausted(_)) => {}
            other => panic!("expected ResourceExhausted, got {other:?}"),
        }
        // Drain the recorded fds to avoid leaking them across test runs.
        let mut rp = 0;
        for _ in 0..MAX_FD_COUNT {
            let fd = b.read_fd(&mut rp).unwrap();
            dup_fds.push(fd);
        }
        for fd in dup_fds {
            unsafe {
                libc::close(fd);
            }
        }
    }
}
