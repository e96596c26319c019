//! File-backed memory-mapped segments.
//!
//! A [`MappedSegment`] owns one `MAP_SHARED` mapping of a regular file. Two
//! processes that map the same path see the same bytes. All accessors are
//! bounds-checked against the mapped length and fail with
//! [`Error::Closed`] once the segment has been closed.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU8};

use crate::error::{Error, Result};

/// A live mapping. Unmapped on drop.
struct Mapping {
    /// Base address of the mapping.
    ptr: *mut u8,
    /// Length of the mapping in bytes.
    len: usize,
    /// The underlying file (kept open for the lifetime of the mapping).
    _file: File,
}

// SAFETY: the mapping is plain shared memory; moving the owner to another
// thread does not invalidate it. Cross-process access is coordinated by the
// channel protocol, not by Rust.
unsafe impl Send for Mapping {}

impl Mapping {
    fn map(file: File, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty file",
            ));
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            len,
            _file: file,
        })
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr and len came from a successful mmap.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

/// One memory-mapped file of fixed size.
pub struct MappedSegment {
    path: PathBuf,
    len: usize,
    mapping: Option<Mapping>,
}

impl MappedSegment {
    /// Create a zero-filled file of exactly `capacity` bytes and map it.
    ///
    /// Fails with [`Error::AlreadyExists`] if anything is already present at
    /// `path`.
    pub fn create(path: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        let path = path.as_ref();
        if capacity == 0 {
            return Err(Error::invalid("segment capacity must be > 0"));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => Error::AlreadyExists(path.to_path_buf()),
                _ => Error::Io(e),
            })?;

        // Extending with set_len zero-fills.
        let mapping = file
            .set_len(capacity as u64)
            .and_then(|()| Mapping::map(file, capacity));
        let mapping = match mapping {
            Ok(mapping) => mapping,
            Err(e) => {
                let _ = std::fs::remove_file(path);
                return Err(Error::Io(e));
            }
        };

        tracing::debug!(path = %path.display(), capacity, "created segment");

        Ok(Self {
            path: path.to_path_buf(),
            len: capacity,
            mapping: Some(mapping),
        })
    }

    /// Map an existing file in full.
    ///
    /// Fails with [`Error::InvalidArgument`] if the file is smaller than
    /// `capacity`.
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len() as usize;

        if file_len < capacity {
            return Err(Error::invalid(format!(
                "{} holds {} bytes, smaller than the requested {}",
                path.display(),
                file_len,
                capacity
            )));
        }

        let mapping = Mapping::map(file, file_len)?;

        tracing::debug!(path = %path.display(), len = file_len, "opened segment");

        Ok(Self {
            path: path.to_path_buf(),
            len: file_len,
            mapping: Some(mapping),
        })
    }

    /// Path of the backing file.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the mapping in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the segment maps zero bytes (never the case for a
    /// successfully constructed segment).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the segment is still mapped.
    #[inline]
    pub fn is_open(&self) -> bool {
        self.mapping.is_some()
    }

    /// Unmap the segment. Does nothing if already closed.
    pub fn close(&mut self) {
        if self.mapping.take().is_some() {
            tracing::debug!(path = %self.path.display(), "closed segment");
        }
    }

    /// Close the segment and remove its backing file.
    ///
    /// Removal is best-effort: the file may already be gone.
    pub fn delete(&mut self) {
        self.close();
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "deleted segment"),
            Err(e) => {
                tracing::debug!(path = %self.path.display(), error = %e, "segment file not removed")
            }
        }
    }

    /// Resolve `[offset, offset + len)` to a pointer into the mapping.
    fn span(&self, offset: usize, len: usize) -> Result<*mut u8> {
        let mapping = self.mapping.as_ref().ok_or(Error::Closed)?;
        match offset.checked_add(len) {
            Some(end) if end <= mapping.len => {
                // SAFETY: offset + len is within the mapping.
                Ok(unsafe { mapping.ptr.add(offset) })
            }
            _ => Err(Error::OutOfBounds {
                offset,
                len,
                capacity: mapping.len,
            }),
        }
    }

    fn read_array<const N: usize>(&self, offset: usize) -> Result<[u8; N]> {
        let src = self.span(offset, N)?;
        let mut out = [0u8; N];
        // SAFETY: span checked bounds; out is a distinct local buffer.
        unsafe { std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), N) };
        Ok(out)
    }

    /// Copy `buf.len()` bytes starting at `offset` into `buf`.
    pub fn read_into(&self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let src = self.span(offset, buf.len())?;
        // SAFETY: span checked bounds; buf cannot alias the mapping mutably
        // while we hold &self.
        unsafe { std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
        Ok(offset + buf.len())
    }

    /// Read a little-endian int32.
    pub fn read_i32(&self, offset: usize) -> Result<(i32, usize)> {
        Ok((i32::from_le_bytes(self.read_array(offset)?), offset + 4))
    }

    /// Read a one-byte bool. Any non-zero byte is `true`.
    pub fn read_bool(&self, offset: usize) -> Result<(bool, usize)> {
        let [b] = self.read_array::<1>(offset)?;
        Ok((b != 0, offset + 1))
    }

    /// Read `len` raw bytes.
    pub fn read_bytes(&self, offset: usize, len: usize) -> Result<(Vec<u8>, usize)> {
        // Bounds first: `len` may come from an untrusted length prefix.
        let src = self.span(offset, len)?;
        let mut out = vec![0u8; len];
        // SAFETY: span checked bounds; out is a distinct local buffer.
        unsafe { std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), len) };
        Ok((out, offset + len))
    }

    /// Read a little-endian float32.
    pub fn read_f32(&self, offset: usize) -> Result<(f32, usize)> {
        Ok((f32::from_le_bytes(self.read_array(offset)?), offset + 4))
    }

    /// Write raw bytes.
    pub fn write_bytes(&mut self, offset: usize, data: &[u8]) -> Result<usize> {
        let dst = self.span(offset, data.len())?;
        // SAFETY: span checked bounds; data is borrowed immutably and cannot
        // alias the mapping while we hold &mut self.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(offset + data.len())
    }

    /// Write a little-endian int32.
    pub fn write_i32(&mut self, offset: usize, value: i32) -> Result<usize> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    /// Write a bool as a single `0`/`1` byte.
    pub fn write_bool(&mut self, offset: usize, value: bool) -> Result<usize> {
        self.write_bytes(offset, &[value as u8])
    }

    /// Write a little-endian float32.
    pub fn write_f32(&mut self, offset: usize, value: f32) -> Result<usize> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    /// Copy the first `len` bytes of `src` to the start of this segment.
    pub fn copy_prefix_from(&mut self, src: &MappedSegment, len: usize) -> Result<()> {
        let from = src.span(0, len)?;
        let to = self.span(0, len)?;
        // SAFETY: both spans are bounds-checked and belong to distinct
        // mappings, so they cannot overlap in our address space.
        unsafe { std::ptr::copy_nonoverlapping(from, to, len) };
        Ok(())
    }

    /// View a 4-byte aligned cell as an atomic int32.
    pub(crate) fn atomic_i32(&self, offset: usize) -> Result<&AtomicI32> {
        if offset % std::mem::align_of::<AtomicI32>() != 0 {
            return Err(Error::invalid(format!(
                "offset {} is not aligned for an atomic int32",
                offset
            )));
        }
        let ptr = self.span(offset, 4)?;
        // SAFETY: mmap returns page-aligned memory, offset is aligned, the
        // cell is in bounds and lives as long as &self keeps the mapping.
        Ok(unsafe { AtomicI32::from_ptr(ptr as *mut i32) })
    }

    /// View a single byte as an atomic.
    pub(crate) fn atomic_u8(&self, offset: usize) -> Result<&AtomicU8> {
        let ptr = self.span(offset, 1)?;
        // SAFETY: in bounds, no alignment requirement, lives as long as &self.
        Ok(unsafe { AtomicU8::from_ptr(ptr) })
    }
}

impl std::fmt::Debug for MappedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedSegment")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("open", &self.is_open())
            .finish()
    }
}
