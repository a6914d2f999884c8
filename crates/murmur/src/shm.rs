//! Shared memory segments
//!
//! Raw memory regions used to move audio between processes without copying.
//!
//! ## Lifecycle
//!
//! - **Create (private)**: anonymous `mmap(MAP_PRIVATE)`, falling back to a
//!   page-aligned heap allocation. `id == 0`, never unlinked.
//! - **Create (shared)**: random id, `shm_open(O_CREAT | O_EXCL)` +
//!   `ftruncate` + `mmap(PROT_READ | PROT_WRITE, MAP_SHARED)`. The creator
//!   owns the name and unlinks it on release.
//! - **Attach**: `shm_open(O_RDONLY)` + `fstat` + `mmap(PROT_READ)`. An
//!   attacher never unlinks.
//! - **Release**: `munmap` (or free) + `shm_unlink` when owner. Consumes the
//!   segment, so a released segment cannot be touched again.
//!
//! Segments carry no synchronization of their own. Readers and writers in
//! different processes need a protocol layered on top.

use std::alloc::{self, Layout};
use std::ffi::c_void;
use std::fmt;
use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;
use std::sync::OnceLock;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{self, MapFlags, MmapAdvise, ProtFlags};
use nix::sys::stat::{self, Mode};
use nix::unistd::{self, SysconfVar};
use thiserror::Error;
use tracing::{debug, warn};

/// Upper bound on segment size (20 MiB).
pub const MAX_SEGMENT_SIZE: usize = 20 * 1024 * 1024;

/// Owner read + write. `create` requires at least these bits in `mode`.
pub const OWNER_RW: u32 = 0o600;

const FALLBACK_PAGE_SIZE: usize = 4096;

/// Errors from shared memory operations
#[derive(Debug, Error)]
pub enum ShmError {
    #[error("named shared memory is not supported on this platform")]
    Unsupported,

    #[error("shared memory segment {name} already exists")]
    Exists { name: String },

    #[error("shared memory segment {name} not found")]
    NotFound { name: String },

    #[error("shared memory segment {name} has invalid size {size}")]
    InvalidSize { name: String, size: i64 },

    #[error("failed to allocate {size} bytes of private memory")]
    Alloc { size: usize },

    #[error("{op}() failed on {name}: {source}")]
    Os {
        op: &'static str,
        name: String,
        source: Errno,
    },
}

/// Externally visible name for a segment id. Creator and attacher both use it.
pub fn segment_name(id: u32) -> String {
    format!("/murmur-shm-{:08x}", id)
}

/// System page size, queried once.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| match unistd::sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as usize,
        _ => FALLBACK_PAGE_SIZE,
    })
}

#[derive(Debug, Clone, Copy)]
enum Backing {
    /// Anonymous private mapping
    Private,
    /// Aligned heap allocation used when anonymous mapping is unavailable
    Heap(Layout),
    /// Named POSIX shared memory
    Shared { writable: bool },
}

/// A mapped memory region, private to this process or shared by name.
pub struct ShmSegment {
    id: u32,
    size: usize,
    ptr: NonNull<u8>,
    backing: Backing,
    unlink_on_release: bool,
}

// SAFETY: the segment exclusively owns its mapping; the pointer is never
// handed out except through borrows tied to &self / &mut self.
unsafe impl Send for ShmSegment {}
// SAFETY: &self only allows reads of the mapping.
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create a read-write segment of `size` bytes.
    ///
    /// Shared segments get a random id and an exclusive name; `mode` is
    /// narrowed to owner read/write before it reaches the OS.
    ///
    /// # Panics
    ///
    /// If `size` is zero or not below [`MAX_SEGMENT_SIZE`], or `mode` lacks
    /// owner read/write.
    pub fn create(size: usize, shared: bool, mode: u32) -> Result<Self, ShmError> {
        assert_create_args(size, mode);

        if !shared {
            return Self::create_private(size);
        }

        let id = loop {
            let id: u32 = rand::random();
            if id != 0 {
                break id;
            }
        };

        Self::create_named(id, size, mode)
    }

    /// Create a named segment with a caller-chosen id.
    ///
    /// Fails with [`ShmError::Exists`] if the name is already taken; the
    /// existing segment is left untouched.
    pub fn create_named(id: u32, size: usize, mode: u32) -> Result<Self, ShmError> {
        assert_create_args(size, mode);
        assert!(id != 0, "segment id 0 is reserved for private segments");

        let name = segment_name(id);
        let perms = Mode::from_bits_truncate((mode & OWNER_RW) as libc::mode_t);

        let fd = mman::shm_open(
            name.as_str(),
            OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL,
            perms,
        )
        .map_err(|e| match e {
            Errno::EEXIST => ShmError::Exists { name: name.clone() },
            Errno::ENOSYS => ShmError::Unsupported,
            e => os_error("shm_open", &name, e),
        })?;

        // The name exists from here on; every failure path must unlink it.
        match map_shared(&fd, &name, size) {
            Ok(ptr) => {
                debug!("created shared memory segment {} ({} bytes)", name, size);
                Ok(Self {
                    id,
                    size,
                    ptr,
                    backing: Backing::Shared { writable: true },
                    unlink_on_release: true,
                })
            }
            Err(e) => {
                if let Err(unlink_err) = mman::shm_unlink(name.as_str()) {
                    warn!("shm_unlink({}) failed during rollback: {}", name, unlink_err);
                }
                Err(e)
            }
        }
    }

    /// Map an existing named segment read-only. Its size comes from the
    /// backing object and must lie in `(0, MAX_SEGMENT_SIZE]`.
    pub fn attach_read_only(id: u32) -> Result<Self, ShmError> {
        let name = segment_name(id);

        let fd = mman::shm_open(name.as_str(), OFlag::O_RDONLY, Mode::empty()).map_err(|e| match e {
            Errno::ENOENT => ShmError::NotFound { name: name.clone() },
            Errno::ENOSYS => ShmError::Unsupported,
            e => os_error("shm_open", &name, e),
        })?;

        let st = stat::fstat(&fd).map_err(|e| os_error("fstat", &name, e))?;
        let raw_size = st.st_size as i64;
        if raw_size <= 0 || raw_size as u64 > MAX_SEGMENT_SIZE as u64 {
            warn!("invalid shared memory segment size {} for {}", raw_size, name);
            return Err(ShmError::InvalidSize {
                name,
                size: raw_size,
            });
        }
        let size = raw_size as usize;

        let ptr = unsafe {
            mman::mmap(
                None,
                nonzero(size),
                ProtFlags::PROT_READ,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        }
        .map_err(|e| os_error("mmap", &name, e))?;

        debug!("attached shared memory segment {} ({} bytes, read-only)", name, size);

        Ok(Self {
            id,
            size,
            ptr: ptr.cast(),
            backing: Backing::Shared { writable: false },
            unlink_on_release: false,
        })
    }

    fn create_private(size: usize) -> Result<Self, ShmError> {
        let mapped = unsafe {
            mman::mmap_anonymous(
                None,
                nonzero(size),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        };

        match mapped {
            Ok(ptr) => Ok(Self {
                id: 0,
                size,
                ptr: ptr.cast(),
                backing: Backing::Private,
                unlink_on_release: false,
            }),
            Err(e) => {
                warn!("anonymous mmap() failed ({}), falling back to heap allocation", e);
                Self::create_heap(size)
            }
        }
    }

    /// Page-aligned zeroed heap memory standing in for a private mapping.
    fn create_heap(size: usize) -> Result<Self, ShmError> {
        let layout =
            Layout::from_size_align(size, page_size()).map_err(|_| ShmError::Alloc { size })?;
        // SAFETY: layout has non-zero size (asserted by callers).
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(ShmError::Alloc { size })?;

        Ok(Self {
            id: 0,
            size,
            ptr,
            backing: Backing::Heap(layout),
            unlink_on_release: false,
        })
    }

    /// Segment id; zero for private segments.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether other processes can attach to this segment by id.
    pub fn is_shared(&self) -> bool {
        matches!(self.backing, Backing::Shared { .. })
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.backing, Backing::Shared { writable: false })
    }

    /// Whether release removes the name (true only for the creator).
    pub fn unlinks_on_release(&self) -> bool {
        self.unlink_on_release
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for `size` readable bytes for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    /// Writable view, or `None` for read-only attachments.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        if self.is_read_only() {
            return None;
        }
        // SAFETY: mapping is writable and exclusively borrowed through &mut self.
        Some(unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) })
    }

    /// Let the OS reclaim the pages backing `offset..offset + size`.
    ///
    /// Contents of the affected pages become indeterminate; the logical size
    /// is unchanged. Only pages fully inside the range are advised: the start
    /// is rounded up to a page boundary and the end down, unless the range
    /// runs to the end of the segment.
    ///
    /// # Panics
    ///
    /// If the range exceeds the segment, or if no discard advice is accepted
    /// by the kernel.
    pub fn punch(&mut self, offset: usize, size: usize) {
        assert!(
            offset
                .checked_add(size)
                .is_some_and(|end| end <= self.size),
            "punch range {}+{} exceeds segment size {}",
            offset,
            size,
            self.size
        );

        if matches!(self.backing, Backing::Heap(_)) {
            return;
        }

        let ps = page_size();
        let start = self.ptr.as_ptr() as usize + offset;
        let aligned = (start + ps - 1) & !(ps - 1);
        let skip = aligned - start;
        if skip >= size {
            return;
        }

        let mut len = size - skip;
        if offset + size != self.size {
            len &= !(ps - 1);
        }
        if len == 0 {
            return;
        }

        let Some(ptr) = NonNull::new(aligned as *mut c_void) else {
            return;
        };

        #[cfg(target_os = "linux")]
        {
            // SAFETY: [ptr, ptr+len) lies inside our mapping.
            if unsafe { mman::madvise(ptr, len, MmapAdvise::MADV_REMOVE) }.is_ok() {
                return;
            }
            if unsafe { mman::madvise(ptr, len, MmapAdvise::MADV_FREE) }.is_ok() {
                return;
            }
        }

        if let Err(e) = unsafe { mman::madvise(ptr, len, MmapAdvise::MADV_DONTNEED) } {
            panic!(
                "madvise(MADV_DONTNEED) failed on segment {} at {}+{}: {}",
                self.id, offset, len, e
            );
        }
    }

    /// Unmap the region and, for the creator, remove its name.
    pub fn release(self) {
        drop(self)
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        match self.backing {
            Backing::Heap(layout) => {
                // SAFETY: allocated with this layout in create_private.
                unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
            }
            Backing::Private | Backing::Shared { .. } => {
                // SAFETY: ptr/size describe a mapping we own.
                if let Err(e) = unsafe { mman::munmap(self.ptr.cast(), self.size) } {
                    warn!("munmap() failed: {}", e);
                }
            }
        }

        if self.unlink_on_release {
            let name = segment_name(self.id);
            if let Err(e) = mman::shm_unlink(name.as_str()) {
                warn!("shm_unlink({}) failed: {}", name, e);
            }
        }
    }
}

impl fmt::Debug for ShmSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmSegment")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("shared", &self.is_shared())
            .field("read_only", &self.is_read_only())
            .field("unlink_on_release", &self.unlink_on_release)
            .finish()
    }
}

fn assert_create_args(size: usize, mode: u32) {
    assert!(
        size > 0 && size < MAX_SEGMENT_SIZE,
        "segment size {} outside (0, {})",
        size,
        MAX_SEGMENT_SIZE
    );
    assert!(
        mode & OWNER_RW == OWNER_RW,
        "segment mode {:o} must grant owner read/write",
        mode
    );
}

#[cfg(test)]
thread_local! {
    static FAIL_MAP_SHARED: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

fn map_shared(fd: &OwnedFd, name: &str, size: usize) -> Result<NonNull<u8>, ShmError> {
    #[cfg(test)]
    {
        if FAIL_MAP_SHARED.with(|fail| fail.replace(false)) {
            return Err(os_error("mmap", name, Errno::ENOMEM));
        }
    }

    unistd::ftruncate(fd, size as libc::off_t).map_err(|e| os_error("ftruncate", name, e))?;

    let ptr = unsafe {
        mman::mmap(
            None,
            nonzero(size),
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            fd,
            0,
        )
    }
    .map_err(|e| os_error("mmap", name, e))?;

    Ok(ptr.cast())
}

fn nonzero(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size).expect("segment size checked non-zero")
}

fn os_error(op: &'static str, name: &str, source: Errno) -> ShmError {
    warn!("{}() failed on {}: {}", op, name, source);
    ShmError::Os {
        op,
        name: name.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unused_id() -> u32 {
        loop {
            let id: u32 = rand::random();
            if id != 0 && ShmSegment::attach_read_only(id).is_err() {
                return id;
            }
        }
    }

    #[test]
    fn test_segment_name_is_fixed_width() {
        assert_eq!(segment_name(1), "/murmur-shm-00000001");
        assert_eq!(segment_name(u32::MAX), "/murmur-shm-ffffffff");
        assert_eq!(segment_name(7).len(), segment_name(0xdead_beef).len());
    }

    #[test]
    fn test_private_segment() {
        let mut seg = ShmSegment::create(8192, false, 0o600).unwrap();
        assert_eq!(seg.id(), 0);
        assert_eq!(seg.size(), 8192);
        assert!(!seg.is_shared());
        assert!(!seg.unlinks_on_release());

        let data = seg.as_mut_slice().unwrap();
        data[0] = 0x42;
        data[8191] = 0x24;
        assert_eq!(seg.as_slice()[0], 0x42);
        assert_eq!(seg.as_slice()[8191], 0x24);
        seg.release();
    }

    #[test]
    fn test_shared_segment_visible_to_reader() {
        let mut writer = ShmSegment::create(4096, true, 0o644).unwrap();
        assert_ne!(writer.id(), 0);
        assert!(writer.is_shared());
        assert!(writer.unlinks_on_release());

        writer.as_mut_slice().unwrap()[..4].copy_from_slice(b"rift");

        let mut reader = ShmSegment::attach_read_only(writer.id()).unwrap();
        assert_eq!(reader.size(), 4096);
        assert!(reader.is_read_only());
        assert!(!reader.unlinks_on_release());
        assert!(reader.as_mut_slice().is_none());
        assert_eq!(&reader.as_slice()[..4], b"rift");

        reader.release();
        // Reader release must not remove the name.
        assert!(ShmSegment::attach_read_only(writer.id()).is_ok());
        writer.release();
    }

    #[test]
    fn test_release_removes_name() {
        let seg = ShmSegment::create(1024, true, 0o600).unwrap();
        let id = seg.id();
        seg.release();

        assert!(matches!(
            ShmSegment::attach_read_only(id),
            Err(ShmError::NotFound { .. })
        ));
    }

    #[test]
    fn test_forced_collision_keeps_first_segment() {
        let id = unused_id();
        let mut first = ShmSegment::create_named(id, 2048, 0o600).unwrap();
        first.as_mut_slice().unwrap()[0] = 7;

        let second = ShmSegment::create_named(id, 4096, 0o600);
        assert!(matches!(second, Err(ShmError::Exists { .. })));

        let reader = ShmSegment::attach_read_only(id).unwrap();
        assert_eq!(reader.size(), 2048);
        assert_eq!(reader.as_slice()[0], 7);
        drop(reader);
        first.release();
    }

    #[test]
    fn test_failed_map_unlinks_name() {
        let id = unused_id();
        FAIL_MAP_SHARED.with(|fail| fail.set(true));

        let err = ShmSegment::create_named(id, 4096, 0o600).unwrap_err();
        assert!(matches!(err, ShmError::Os { op: "mmap", .. }));
        assert!(matches!(
            ShmSegment::attach_read_only(id),
            Err(ShmError::NotFound { .. })
        ));

        // The name is free again.
        ShmSegment::create_named(id, 4096, 0o600).unwrap().release();
    }

    #[test]
    fn test_heap_segment() {
        let ps = page_size();
        let mut seg = ShmSegment::create_heap(3 * ps).unwrap();
        assert_eq!(seg.id(), 0);
        assert!(!seg.is_shared());
        assert!(!seg.is_read_only());
        assert_eq!(seg.as_slice().as_ptr() as usize % ps, 0);
        assert!(seg.as_slice().iter().all(|&b| b == 0));

        seg.as_mut_slice().unwrap().fill(0x42);
        seg.punch(0, 3 * ps);
        assert!(seg.as_slice().iter().all(|&b| b == 0x42));

        seg.release();
    }

    #[test]
    fn test_attach_rejects_bad_sizes() {
        for size in [0usize, MAX_SEGMENT_SIZE + 1] {
            let id = unused_id();
            let name = segment_name(id);
            let fd = mman::shm_open(
                name.as_str(),
                OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL,
                Mode::S_IRUSR | Mode::S_IWUSR,
            )
            .unwrap();
            unistd::ftruncate(&fd, size as libc::off_t).unwrap();

            let result = ShmSegment::attach_read_only(id);
            mman::shm_unlink(name.as_str()).unwrap();

            assert!(
                matches!(result, Err(ShmError::InvalidSize { .. })),
                "size {} should be rejected",
                size
            );
        }
    }

    #[test]
    fn test_attach_missing_segment() {
        let id = unused_id();
        assert!(matches!(
            ShmSegment::attach_read_only(id),
            Err(ShmError::NotFound { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "outside")]
    fn test_create_rejects_oversize() {
        let _ = ShmSegment::create(MAX_SEGMENT_SIZE, false, 0o600);
    }

    #[test]
    #[should_panic(expected = "owner read/write")]
    fn test_create_rejects_weak_mode() {
        let _ = ShmSegment::create(4096, true, 0o400);
    }

    #[test]
    fn test_punch_preserves_partial_pages() {
        let ps = page_size();
        for shared in [false, true] {
            let mut seg = ShmSegment::create(4 * ps, shared, 0o600).unwrap();
            seg.as_mut_slice().unwrap().fill(0xAA);

            // Starts mid-page: only page 1 is fully covered.
            seg.punch(ps / 2, ps + ps / 2 + 1);

            let data = seg.as_slice();
            assert_eq!(seg.size(), 4 * ps);
            assert!(data[..ps].iter().all(|&b| b == 0xAA));
            assert!(data[2 * ps..].iter().all(|&b| b == 0xAA));
        }
    }

    #[test]
    fn test_punch_smaller_than_page_is_noop() {
        let ps = page_size();
        let mut seg = ShmSegment::create(2 * ps, false, 0o600).unwrap();
        seg.as_mut_slice().unwrap().fill(0x11);
        seg.punch(1, ps - 2);
        assert!(seg.as_slice().iter().all(|&b| b == 0x11));
    }

    #[test]
    #[should_panic(expected = "exceeds segment size")]
    fn test_punch_out_of_range() {
        let mut seg = ShmSegment::create(4096, false, 0o600).unwrap();
        seg.punch(4000, 200);
    }
}
