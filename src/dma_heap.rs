//! DMA Heap Allocator.
//!
//! Mints kernel DMA buffer objects (dma-buf file descriptors) from a named
//! kernel heap via `/dev/dma_heap/*`. The allocation ioctl is fixed kernel
//! UAPI (`linux/dma-heap.h`); we bind it by hand with `nix::ioctl_readwrite!`
//! the same way the rest of this crate binds V4L2 ioctls in `v4l2::sys` —
//! there is no vendored safe wrapper for dma-heap in the dependency stack.

use std::ffi::CString;
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::{self, NonNull};

use log::{debug, warn};

use crate::error::{PlayerError, Result};

/// Heap device paths tried in priority order by `initialize`: a video-cached
/// heap first (best for CPU-touched decoder input buffers), then the
/// general contiguous-memory heap.
pub const DEFAULT_HEAP_PATHS: &[&str] = &["/dev/dma_heap/linux,cma", "/dev/dma_heap/system"];

const DMA_BUF_SYNC_READ: u64 = 1 << 0;
const DMA_BUF_SYNC_WRITE: u64 = 1 << 1;
const DMA_BUF_SYNC_START: u64 = 0 << 2;
const DMA_BUF_SYNC_END: u64 = 1 << 2;

const DMA_HEAP_VALID_FD_FLAGS: u32 = (libc::O_CLOEXEC | libc::O_RDWR) as u32;

#[repr(C)]
#[derive(Debug, Default)]
struct DmaHeapAllocationData {
    len: u64,
    fd: u32,
    fd_flags: u32,
    heap_flags: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct DmaBufSyncData {
    flags: u64,
}

mod raw_ioctl {
    use super::{DmaBufSyncData, DmaHeapAllocationData};

    nix::ioctl_readwrite!(dma_heap_alloc, 'H', 0x0, DmaHeapAllocationData);
    nix::ioctl_readwrite!(dma_buf_sync, b'b', 0, DmaBufSyncData);
    nix::ioctl_write_ptr!(dma_buf_set_name, b'b', 1, u8);
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncDirection {
    Start,
    End,
}

/// One kernel-minted DMA buffer.
///
/// `fd` is exclusive to this object until `release`/`Drop`; `mapped_addr`
/// covers exactly `size` bytes whenever it is `Some`.
pub struct BufferObject {
    fd: Option<OwnedFd>,
    size: usize,
    mapped_addr: Option<NonNull<libc::c_void>>,
    name: Option<String>,
}

// The mapping is a plain heap-backed region shared with the kernel driver;
// no Rust aliasing rules are violated by moving the handle across threads.
unsafe impl Send for BufferObject {}

impl BufferObject {
    pub fn fd(&self) -> RawFd {
        self.fd.as_ref().map(|fd| fd.as_raw_fd()).unwrap_or(-1)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped_addr.is_some()
    }

    /// Raw pointer to the CPU mapping, or null if unmapped.
    pub fn mapped_ptr(&self) -> *mut u8 {
        self.mapped_addr
            .map(|p| p.as_ptr() as *mut u8)
            .unwrap_or(ptr::null_mut())
    }

    /// Safe-ish slice view into the mapping, for reading decoded output.
    pub fn as_slice(&self) -> &[u8] {
        match self.mapped_addr {
            Some(p) => unsafe { std::slice::from_raw_parts(p.as_ptr() as *const u8, self.size) },
            None => &[],
        }
    }

    /// Safe-ish mutable slice view into the mapping, for writing access
    /// units into an input slot.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self.mapped_addr {
            Some(p) => unsafe { std::slice::from_raw_parts_mut(p.as_ptr() as *mut u8, self.size) },
            None => &mut [],
        }
    }

    /// CPU-side cache sync bracket required before/after a CPU write that
    /// hardware will subsequently read. Failures are logged and otherwise
    /// ignored — a warn-and-proceed condition, not a hard failure.
    pub fn sync(&self, direction: SyncDirection) {
        let fd = self.fd();
        if fd < 0 {
            return;
        }
        let flags = DMA_BUF_SYNC_READ
            | DMA_BUF_SYNC_WRITE
            | match direction {
                SyncDirection::Start => DMA_BUF_SYNC_START,
                SyncDirection::End => DMA_BUF_SYNC_END,
            };
        let mut data = DmaBufSyncData { flags };
        if let Err(e) = unsafe { raw_ioctl::dma_buf_sync(fd, &mut data) } {
            warn!("DMA_BUF_IOCTL_SYNC({direction:?}) on fd={fd} failed: {e}");
        }
    }
}

impl Drop for BufferObject {
    fn drop(&mut self) {
        if let Some(addr) = self.mapped_addr.take() {
            let ret = unsafe { libc::munmap(addr.as_ptr(), self.size) };
            if ret != 0 {
                warn!(
                    "munmap of buffer {:?} (size={}) failed: {}",
                    self.name,
                    self.size,
                    io_last_error()
                );
            }
        }
        // self.fd (OwnedFd) closes itself on drop.
    }
}

fn io_last_error() -> std::io::Error {
    std::io::Error::last_os_error()
}

/// Opens a kernel DMA heap and mints buffer objects from it.
pub struct DmaHeapAllocator {
    heap_fd: Option<OwnedFd>,
    heap_path: Option<String>,
}

impl Default for DmaHeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaHeapAllocator {
    pub fn new() -> Self {
        Self {
            heap_fd: None,
            heap_path: None,
        }
    }

    /// Tries each path in `DEFAULT_HEAP_PATHS`, opening the first that
    /// succeeds. Fails with `AllocatorUnavailable` if none do.
    pub fn initialize(&mut self) -> Result<()> {
        self.initialize_from(DEFAULT_HEAP_PATHS)
    }

    pub fn initialize_with_path(&mut self, preferred_device_path: &str) -> Result<()> {
        self.initialize_from(&[preferred_device_path])
    }

    fn initialize_from(&mut self, paths: &[&str]) -> Result<()> {
        for path in paths {
            match File::options().read(true).write(true).open(path) {
                Ok(file) => {
                    debug!("opened DMA heap {path}");
                    self.heap_fd = Some(OwnedFd::from(file));
                    self.heap_path = Some((*path).to_string());
                    return Ok(());
                }
                Err(e) => {
                    debug!("could not open DMA heap {path}: {e}");
                }
            }
        }
        Err(PlayerError::AllocatorUnavailable)
    }

    /// Mints a new buffer of at least `size` bytes. The kernel may round up;
    /// `BufferObject::size` reports the actual size, which callers must
    /// honor thereafter.
    pub fn allocate(&self, size: usize) -> Result<BufferObject> {
        let heap_fd = self
            .heap_fd
            .as_ref()
            .ok_or(PlayerError::AllocatorUnavailable)?;

        if size == 0 || size > 4 * 1024 * 1024 * 1024 {
            return Err(PlayerError::AllocFailed {
                size: size as u64,
                reason: "size must be in (0, 4GiB]".to_string(),
            });
        }

        let mut data = DmaHeapAllocationData {
            len: size as u64,
            fd: 0,
            fd_flags: DMA_HEAP_VALID_FD_FLAGS,
            heap_flags: 0,
        };

        unsafe { raw_ioctl::dma_heap_alloc(heap_fd.as_raw_fd(), &mut data) }.map_err(|e| {
            PlayerError::AllocFailed {
                size: size as u64,
                reason: e.to_string(),
            }
        })?;

        let fd = unsafe { OwnedFd::from_raw_fd(data.fd as RawFd) };
        let actual_size = query_fd_size(fd.as_raw_fd()).unwrap_or(size);

        Ok(BufferObject {
            fd: Some(fd),
            size: actual_size,
            mapped_addr: None,
            name: None,
        })
    }

    /// Maps `size` bytes of `object` into the process address space.
    pub fn map(&self, object: &mut BufferObject) -> Result<()> {
        let fd = object.fd();
        if fd < 0 {
            return Err(PlayerError::MapFailed {
                fd,
                reason: "no underlying fd".to_string(),
            });
        }
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                object.size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(PlayerError::MapFailed {
                fd,
                reason: io_last_error().to_string(),
            });
        }
        object.mapped_addr = NonNull::new(addr);
        Ok(())
    }

    /// Idempotent: unmapping an already-unmapped object is a no-op.
    pub fn unmap(&self, object: &mut BufferObject) {
        if let Some(addr) = object.mapped_addr.take() {
            let ret = unsafe { libc::munmap(addr.as_ptr(), object.size) };
            if ret != 0 {
                warn!("unmap failed for fd={}: {}", object.fd(), io_last_error());
            }
        }
    }

    /// Idempotent: releasing an already-released object is a no-op. Closes
    /// the fd last, after any mapping has been torn down.
    pub fn release(&self, object: &mut BufferObject) {
        self.unmap(object);
        object.fd = None;
    }

    /// Best-effort debug label; failure is non-fatal.
    pub fn set_name(&self, object: &mut BufferObject, name: &str) {
        let fd = object.fd();
        if fd < 0 {
            return;
        }
        match CString::new(name) {
            Ok(cname) => {
                let bytes = cname.as_bytes_with_nul();
                if let Err(e) =
                    unsafe { raw_ioctl::dma_buf_set_name(fd, bytes.as_ptr()) }
                {
                    debug!("DMA_BUF_SET_NAME on fd={fd} failed (non-fatal): {e}");
                }
            }
            Err(_) => debug!("name {name:?} not representable as a C string, skipping"),
        }
        object.name = Some(name.to_string());
    }

    pub fn heap_path(&self) -> Option<&str> {
        self.heap_path.as_deref()
    }
}

/// Queries the actual byte length the kernel allocated, which may exceed
/// the request. Falls back to the requested size if the query fails.
fn query_fd_size(fd: RawFd) -> Option<usize> {
    let size = unsafe { libc::lseek(fd, 0, libc::SEEK_END) };
    if size < 0 {
        return None;
    }
    // Restore the offset; dma-buf fds are typically offset-0 mapped anyway
    // but leaving the cursor non-zero would be a footgun for future readers.
    unsafe {
        libc::lseek(fd, 0, libc::SEEK_SET);
    }
    Some(size as usize)
}

impl std::fmt::Debug for SyncDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncDirection::Start => write!(f, "start"),
            SyncDirection::End => write!(f, "end"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocator_unavailable_before_initialize() {
        let alloc = DmaHeapAllocator::new();
        let err = alloc.allocate(4096).unwrap_err();
        assert!(matches!(err, PlayerError::AllocatorUnavailable));
    }

    #[test]
    fn initialize_fails_when_no_path_opens() {
        let mut alloc = DmaHeapAllocator::new();
        let err = alloc
            .initialize_from(&["/nonexistent/heap/path/for/tests"])
            .unwrap_err();
        assert!(matches!(err, PlayerError::AllocatorUnavailable));
    }

    /// `map`/`unmap`/`set_name`/`release` only touch the fd through generic
    /// POSIX calls (`mmap`, an ioctl that silently no-ops on a non-dma-buf
    /// fd), so a regular tempfile stands in for a real dma-buf here.
    #[test]
    fn map_unmap_and_release_round_trip_on_a_plain_fd() {
        use std::io::Write;

        let mut file = tempfile::tempfile().expect("create tempfile");
        let size = 4096usize;
        file.set_len(size as u64).expect("set_len");
        file.write_all(&[0u8; 4096]).ok();

        let alloc = DmaHeapAllocator::new();
        let mut object = BufferObject {
            fd: Some(unsafe { OwnedFd::from_raw_fd(libc::dup(file.as_raw_fd())) }),
            size,
            mapped_addr: None,
            name: None,
        };

        assert!(!object.is_mapped());
        alloc.map(&mut object).expect("map");
        assert!(object.is_mapped());
        assert!(!object.mapped_ptr().is_null());

        alloc.set_name(&mut object, "test-buffer");
        assert_eq!(object.name.as_deref(), Some("test-buffer"));

        alloc.unmap(&mut object);
        assert!(!object.is_mapped());
        // Idempotent.
        alloc.unmap(&mut object);

        alloc.release(&mut object);
        assert_eq!(object.fd(), -1);
    }
}
