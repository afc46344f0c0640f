//! Growable memory-mapped file handle.
//!
//! The container is written and read through a single shared mapping. The
//! handle pairs the mapping with a reader/writer *resize lock*: tile
//! writers and slide readers hold the shared side while dereferencing the
//! mapping, and a resize takes the exclusive side, so a remap can never
//! invalidate a pointer somebody is using. This lock is distinct from the
//! advisory OS file locks exposed by [`SlideFile::lock`].
//!
//! Resizes may relocate the mapping; any pointer derived from a previous
//! guard is invalid after the guard is dropped.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use memmap2::{MmapOptions, MmapRaw};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tracing::debug;

use crate::error::FileError;

/// Bytes added per over-provisioned expansion during encoding. Amortizes
/// the exclusive-lock resize across roughly 100k tile writes; the file is
/// trimmed to exact size when the header is finalized.
pub const GROWTH_INCREMENT: u64 = 500_000_000;

/// Initial size of a cache file, before page alignment.
const CACHE_INITIAL_SIZE: u64 = 500_000_000;

/// System page size, queried once at first use.
pub fn page_size() -> u64 {
    static PAGE_SIZE: OnceLock<u64> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        #[cfg(unix)]
        {
            let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if size > 0 {
                return size as u64;
            }
        }
        4096
    })
}

/// Round `size` up to the next page boundary.
pub fn page_align(size: u64) -> u64 {
    (size & !(page_size() - 1)) + page_size()
}

struct Mapping {
    raw: MmapRaw,
    len: u64,
}

/// A memory-mapped, optionally growable slide file.
pub struct SlideFile {
    file: File,
    path: Mutex<PathBuf>,
    write_access: bool,
    linked: AtomicBool,
    map: RwLock<Mapping>,
}

impl SlideFile {
    /// Create a new file of `initial_size` bytes and map it read-write.
    ///
    /// An existing file at `path` is truncated.
    pub fn create(path: impl AsRef<Path>, initial_size: u64) -> Result<Self, FileError> {
        if initial_size == 0 {
            return Err(FileError::EmptyMapping);
        }
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(initial_size)?;
        let mapping = Self::map_file(&file, initial_size, true)?;
        Ok(SlideFile {
            file,
            path: Mutex::new(path),
            write_access: true,
            linked: AtomicBool::new(true),
            map: RwLock::new(mapping),
        })
    }

    /// Open an existing file and map it, read-only unless `write_access`.
    pub fn open(path: impl AsRef<Path>, write_access: bool) -> Result<Self, FileError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(write_access)
            .open(&path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            return Err(FileError::EmptyMapping);
        }
        let mapping = Self::map_file(&file, len, write_access)?;
        Ok(SlideFile {
            file,
            path: Mutex::new(path),
            write_access,
            linked: AtomicBool::new(true),
            map: RwLock::new(mapping),
        })
    }

    /// Create a uniquely-named cache file in the system temp directory,
    /// sized to one over-provisioned page-aligned increment.
    ///
    /// With `unlink_on_close` the OS link is removed immediately: the file
    /// vanishes when the handle (and process) goes away, and it can no
    /// longer be renamed. Encoders pass `false` so the finished file can
    /// be renamed into place.
    pub fn create_cache(unlink_on_close: bool) -> Result<Self, FileError> {
        Self::create_cache_in(&std::env::temp_dir(), unlink_on_close)
    }

    /// Create a cache file inside `dir` instead of the system temp
    /// directory.
    ///
    /// The encoder places its working file in the output directory so
    /// the final rename stays on one file system and remains atomic.
    pub fn create_cache_in(dir: &Path, unlink_on_close: bool) -> Result<Self, FileError> {
        let named = tempfile::Builder::new()
            .prefix("IrisCodecCache_")
            .tempfile_in(dir)?;
        // Detach from tempfile's drop-deletion; lifetime is managed here.
        let (file, path) = named.keep().map_err(|e| FileError::Io(e.error))?;

        let linked = if unlink_on_close {
            std::fs::remove_file(&path)?;
            false
        } else {
            true
        };

        let initial = page_align(CACHE_INITIAL_SIZE);
        file.set_len(initial)?;
        let mapping = Self::map_file(&file, initial, true)?;
        debug!(path = %path.display(), size = initial, unlinked = !linked, "created cache file");
        Ok(SlideFile {
            file,
            path: Mutex::new(path),
            write_access: true,
            linked: AtomicBool::new(linked),
            map: RwLock::new(mapping),
        })
    }

    fn map_file(file: &File, len: u64, write_access: bool) -> Result<Mapping, FileError> {
        let raw = if write_access {
            MmapOptions::new().map_raw(file)?
        } else {
            MmapOptions::new().map_raw_read_only(file)?
        };
        Ok(Mapping { raw, len })
    }

    /// Current mapped size in bytes.
    pub fn size(&self) -> u64 {
        self.map.read().len
    }

    /// The file's current path.
    pub fn path(&self) -> PathBuf {
        self.path.lock().clone()
    }

    /// Whether the file still has an OS link (can be renamed / deleted).
    pub fn is_linked(&self) -> bool {
        self.linked.load(Ordering::Acquire)
    }

    /// Resize the file and remap.
    ///
    /// Takes the exclusive side of the resize lock, so all mapped readers
    /// and writers have released their guards before the mapping moves.
    /// With `align` the size is rounded up to the next page boundary.
    pub fn resize(&self, new_size: u64, align: bool) -> Result<(), FileError> {
        if !self.write_access {
            return Err(FileError::ReadOnly);
        }
        let size = if align { page_align(new_size) } else { new_size };
        if size == 0 {
            return Err(FileError::EmptyMapping);
        }
        let mut guard = self.map.write();
        if guard.len == size {
            return Ok(());
        }
        self.file.set_len(size)?;
        *guard = Self::map_file(&self.file, size, true)?;
        debug!(size, "resized mapped file");
        Ok(())
    }

    /// Acquire the shared side of the resize lock and expose the mapping.
    pub fn read_mapping(&self) -> MappedRegion<'_> {
        MappedRegion {
            guard: self.map.read(),
            write_access: self.write_access,
        }
    }

    /// Copy `bytes` into the mapping at a reserved `offset`, growing the
    /// file when the reservation extends past the current size.
    ///
    /// This is the hot-path tile write: the copy happens under the shared
    /// resize lock; if the file is too small the shared side is released,
    /// the exclusive side taken, the file grown by at least
    /// [`GROWTH_INCREMENT`], and the shared side retaken. Callers must
    /// reserve disjoint `[offset, offset + bytes.len())` ranges (the
    /// encoder's fetch-add discipline guarantees this).
    pub fn write_reserved(&self, offset: u64, bytes: &[u8]) -> Result<(), FileError> {
        if !self.write_access {
            return Err(FileError::ReadOnly);
        }
        let end = offset + bytes.len() as u64;
        loop {
            {
                let region = self.read_mapping();
                if end <= region.len() {
                    region.write_at(offset, bytes)?;
                    return Ok(());
                }
            }
            // Reservation extends past the mapping: grow under the
            // exclusive lock, rechecking in case another writer already
            // expanded the file.
            let mut guard = self.map.write();
            if end > guard.len {
                let grown = std::cmp::max(guard.len + GROWTH_INCREMENT, end);
                self.file.set_len(grown)?;
                *guard = Self::map_file(&self.file, grown, true)?;
                debug!(size = grown, "expanded mapped file for tile writes");
            }
        }
    }

    /// Flush mapped writes back to the file system.
    pub fn flush(&self) -> Result<(), FileError> {
        self.map.read().raw.flush()?;
        Ok(())
    }

    /// Rename the file on disk. Fails for unlinked cache files.
    pub fn rename(&self, new_path: impl AsRef<Path>) -> Result<(), FileError> {
        if !self.is_linked() {
            return Err(FileError::Unlinked);
        }
        let new_path = new_path.as_ref().to_path_buf();
        let mut path = self.path.lock();
        if *path == new_path {
            return Ok(());
        }
        std::fs::rename(&*path, &new_path)?;
        *path = new_path;
        Ok(())
    }

    /// Remove the file's OS link. The mapping stays usable until drop.
    pub fn delete(&self) -> Result<(), FileError> {
        if self
            .linked
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        std::fs::remove_file(&*self.path.lock())?;
        Ok(())
    }

    /// Take an advisory OS lock on the file. Returns whether the lock was
    /// acquired; with `wait` set the call blocks until it is.
    #[cfg(unix)]
    pub fn lock(&self, exclusive: bool, wait: bool) -> Result<bool, FileError> {
        use std::os::unix::io::AsRawFd;
        let mut flags = if exclusive {
            libc::LOCK_EX
        } else {
            libc::LOCK_SH
        };
        if !wait {
            flags |= libc::LOCK_NB;
        }
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), flags) };
        Ok(rc == 0)
    }

    /// Release an advisory OS lock taken with [`SlideFile::lock`].
    #[cfg(unix)]
    pub fn unlock(&self) -> Result<(), FileError> {
        use std::os::unix::io::AsRawFd;
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc == -1 {
            return Err(FileError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Advisory OS locks are not supported on this platform.
    #[cfg(not(unix))]
    pub fn lock(&self, _exclusive: bool, _wait: bool) -> Result<bool, FileError> {
        Ok(true)
    }

    /// Advisory OS locks are not supported on this platform.
    #[cfg(not(unix))]
    pub fn unlock(&self) -> Result<(), FileError> {
        Ok(())
    }
}

impl std::fmt::Debug for SlideFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlideFile")
            .field("path", &self.path())
            .field("size", &self.size())
            .field("write_access", &self.write_access)
            .field("linked", &self.is_linked())
            .finish()
    }
}

// =============================================================================
// Mapped region guard
// =============================================================================

/// Shared-lock view of the file mapping.
///
/// While a `MappedRegion` is alive no resize can proceed, so the pointers
/// and slices it hands out stay valid.
pub struct MappedRegion<'a> {
    guard: RwLockReadGuard<'a, Mapping>,
    write_access: bool,
}

impl MappedRegion<'_> {
    /// Mapped length in bytes.
    pub fn len(&self) -> u64 {
        self.guard.len
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.guard.len == 0
    }

    /// Borrow `len` bytes starting at `offset`.
    pub fn slice(&self, offset: u64, len: u64) -> Result<&[u8], FileError> {
        let end = offset.checked_add(len).ok_or(FileError::RangeOutOfBounds {
            offset,
            len,
            size: self.guard.len,
        })?;
        if end > self.guard.len {
            return Err(FileError::RangeOutOfBounds {
                offset,
                len,
                size: self.guard.len,
            });
        }
        Ok(unsafe {
            std::slice::from_raw_parts(self.guard.raw.as_ptr().add(offset as usize), len as usize)
        })
    }

    /// Borrow the whole mapping.
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.guard.raw.as_ptr(), self.guard.len as usize) }
    }

    /// Copy `bytes` into the mapping at `offset`.
    ///
    /// Concurrent callers must target disjoint ranges; the encoder's
    /// offset reservation guarantees this for tile writes.
    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<(), FileError> {
        if !self.write_access {
            return Err(FileError::ReadOnly);
        }
        let len = bytes.len() as u64;
        let end = offset.checked_add(len).ok_or(FileError::RangeOutOfBounds {
            offset,
            len,
            size: self.guard.len,
        })?;
        if end > self.guard.len {
            return Err(FileError::RangeOutOfBounds {
                offset,
                len,
                size: self.guard.len,
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.guard.raw.as_mut_ptr().add(offset as usize),
                bytes.len(),
            );
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_and_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("slide.iris");

        let file = SlideFile::create(&path, 4096).unwrap();
        assert_eq!(file.size(), 4096);

        let region = file.read_mapping();
        region.write_at(0, b"IRIS").unwrap();
        region.write_at(100, &[7u8; 16]).unwrap();
        assert_eq!(region.slice(0, 4).unwrap(), b"IRIS");
        assert_eq!(region.slice(100, 16).unwrap(), &[7u8; 16]);
    }

    #[test]
    fn test_create_zero_size_fails() {
        let dir = TempDir::new().unwrap();
        let result = SlideFile::create(dir.path().join("empty.iris"), 0);
        assert!(matches!(result, Err(FileError::EmptyMapping)));
    }

    #[test]
    fn test_open_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("slide.iris");
        {
            let file = SlideFile::create(&path, 1024).unwrap();
            file.read_mapping().write_at(10, b"payload").unwrap();
            file.flush().unwrap();
        }

        let file = SlideFile::open(&path, false).unwrap();
        assert_eq!(file.size(), 1024);
        assert_eq!(file.read_mapping().slice(10, 7).unwrap(), b"payload");
    }

    #[test]
    fn test_readonly_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("slide.iris");
        SlideFile::create(&path, 64).unwrap();

        let file = SlideFile::open(&path, false).unwrap();
        let result = file.read_mapping().write_at(0, b"x");
        assert!(matches!(result, Err(FileError::ReadOnly)));
        assert!(matches!(file.resize(128, false), Err(FileError::ReadOnly)));
    }

    #[test]
    fn test_resize_preserves_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("slide.iris");
        let file = SlideFile::create(&path, 256).unwrap();
        file.read_mapping().write_at(0, &[42u8; 256]).unwrap();

        file.resize(1024, false).unwrap();
        assert_eq!(file.size(), 1024);
        let region = file.read_mapping();
        assert_eq!(region.slice(0, 256).unwrap(), &[42u8; 256]);
        // New bytes are zeroed
        assert_eq!(region.slice(256, 16).unwrap(), &[0u8; 16]);
    }

    #[test]
    fn test_page_aligned_resize() {
        let dir = TempDir::new().unwrap();
        let file = SlideFile::create(dir.path().join("a.iris"), 100).unwrap();
        file.resize(1, true).unwrap();
        assert_eq!(file.size() % page_size(), 0);
        assert!(file.size() >= 1);
    }

    #[test]
    fn test_write_reserved_grows_file() {
        let dir = TempDir::new().unwrap();
        let file = SlideFile::create(dir.path().join("a.iris"), 64).unwrap();

        // Past the current end: must expand and land the bytes.
        file.write_reserved(1000, &[5u8; 32]).unwrap();
        assert!(file.size() >= 1032);
        assert_eq!(file.read_mapping().slice(1000, 32).unwrap(), &[5u8; 32]);
    }

    #[test]
    fn test_slice_out_of_bounds() {
        let dir = TempDir::new().unwrap();
        let file = SlideFile::create(dir.path().join("a.iris"), 64).unwrap();
        let region = file.read_mapping();
        assert!(matches!(
            region.slice(60, 8),
            Err(FileError::RangeOutOfBounds { .. })
        ));
        assert!(matches!(
            region.slice(u64::MAX, 8),
            Err(FileError::RangeOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_rename() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.iris");
        let dst = dir.path().join("b.iris");
        let file = SlideFile::create(&src, 64).unwrap();

        file.rename(&dst).unwrap();
        assert_eq!(file.path(), dst);
        assert!(dst.exists());
        assert!(!src.exists());
    }

    #[test]
    fn test_cache_file_linked_can_rename() {
        let dir = TempDir::new().unwrap();
        let file = SlideFile::create_cache(false).unwrap();
        assert!(file.is_linked());
        assert!(file.path().exists());

        let dst = dir.path().join("kept.iris");
        file.rename(&dst).unwrap();
        assert!(dst.exists());
        file.delete().unwrap();
    }

    #[test]
    fn test_cache_file_unlinked_cannot_rename() {
        let file = SlideFile::create_cache(true).unwrap();
        assert!(!file.is_linked());
        // The path no longer exists in the file system
        assert!(!file.path().exists());
        // But the mapping is still writable
        file.read_mapping().write_at(0, b"ghost").unwrap();

        let result = file.rename("/tmp/should-not-exist.iris");
        assert!(matches!(result, Err(FileError::Unlinked)));
    }

    #[test]
    fn test_delete() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.iris");
        let file = SlideFile::create(&path, 64).unwrap();
        file.delete().unwrap();
        assert!(!path.exists());
        // Second delete is a no-op
        file.delete().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_os_lock_unlock() {
        let dir = TempDir::new().unwrap();
        let file = SlideFile::create(dir.path().join("a.iris"), 64).unwrap();
        assert!(file.lock(true, false).unwrap());
        file.unlock().unwrap();
        assert!(file.lock(false, false).unwrap());
        file.unlock().unwrap();
    }

    #[test]
    fn test_concurrent_disjoint_writes() {
        use std::sync::Arc;

        let dir = TempDir::new().unwrap();
        let file = Arc::new(SlideFile::create(dir.path().join("a.iris"), 64 * 1024).unwrap());

        let mut handles = Vec::new();
        for i in 0..8u64 {
            let file = Arc::clone(&file);
            handles.push(std::thread::spawn(move || {
                let payload = vec![i as u8 + 1; 1024];
                file.write_reserved(i * 1024, &payload).unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let region = file.read_mapping();
        for i in 0..8u64 {
            assert_eq!(
                region.slice(i * 1024, 1024).unwrap(),
                vec![i as u8 + 1; 1024].as_slice()
            );
        }
    }
}
