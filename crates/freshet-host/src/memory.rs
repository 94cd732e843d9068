//! Host memory: provenance registry and raw-allocation buffers.
//!
//! Buffers hand out raw addresses that queue workers copy through, so the
//! backing storage is raw-allocated and accessed only through explicit
//! read/write helpers; no `&mut [u8]` ever aliases bytes a worker may touch.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use freshet_core::accel::{MemoryTracker, PointerInfo, StagingBuffer};
use freshet_core::error::{FreshetError, Result};

const BUFFER_ALIGN: usize = 64;

#[derive(Debug, Clone, Copy)]
struct Region {
    len: usize,
    device: Option<usize>,
    pinned: bool,
}

/// Provenance registry over every live host allocation.
///
/// Allocations register their address range at construction and unregister
/// on drop; lookups walk a range map keyed by base address.
pub struct HostMemoryTracker {
    regions: RwLock<BTreeMap<usize, Region>>,
}

impl HostMemoryTracker {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            regions: RwLock::new(BTreeMap::new()),
        })
    }

    fn register(&self, base: usize, region: Region) {
        trace!(target: "freshet::mem", base = format_args!("{base:#x}"), len = region.len, device = ?region.device, "region registered");
        self.regions.write().insert(base, region);
    }

    fn unregister(&self, base: usize) {
        trace!(target: "freshet::mem", base = format_args!("{base:#x}"), "region unregistered");
        self.regions.write().remove(&base);
    }

    /// Number of live registrations.
    pub fn region_count(&self) -> usize {
        self.regions.read().len()
    }
}

impl MemoryTracker for HostMemoryTracker {
    fn resolve(&self, addr: usize) -> Option<PointerInfo> {
        let regions = self.regions.read();
        let (base, region) = regions.range(..=addr).next_back()?;
        if addr < base + region.len {
            Some(PointerInfo {
                base: *base,
                len: region.len,
                device: region.device,
                pinned: region.pinned,
            })
        } else {
            None
        }
    }
}

/// One host-side allocation: simulated device memory, pinned host memory or
/// plain registered host memory.
///
/// The registration lives exactly as long as the buffer; dropping the buffer
/// removes its provenance record and frees the storage.
pub struct HostBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
    device: Option<usize>,
    pinned: bool,
    tracker: Arc<HostMemoryTracker>,
}

impl HostBuffer {
    pub(crate) fn alloc(
        tracker: Arc<HostMemoryTracker>,
        len: usize,
        device: Option<usize>,
        pinned: bool,
    ) -> Result<Self> {
        if len == 0 {
            return Err(FreshetError::Accelerator(
                "cannot allocate a zero-sized buffer".to_string(),
            ));
        }
        let layout = Layout::from_size_align(len, BUFFER_ALIGN)
            .map_err(|_| FreshetError::OutOfResources(format!("layout for {len} bytes")))?;

        // Zeroed so reads of never-written bytes stay defined.
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            return Err(FreshetError::OutOfResources(format!(
                "host allocation of {len} bytes"
            )));
        };

        tracker.register(
            ptr.as_ptr() as usize,
            Region {
                len,
                device,
                pinned,
            },
        );
        Ok(Self {
            ptr,
            len,
            layout,
            device,
            pinned,
            tracker,
        })
    }

    /// Base address of the buffer.
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length buffer (never constructed today).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Owning device, or `None` for host memory.
    pub fn device(&self) -> Option<usize> {
        self.device
    }

    /// Whether this is pinned host memory.
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Copy `data` into the buffer at `offset`.
    ///
    /// Panics when the range falls outside the buffer.
    pub fn write(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.len, "write outside buffer");
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
    }

    /// Read `len` bytes starting at `offset`.
    ///
    /// Panics when the range falls outside the buffer.
    pub fn read_vec(&self, offset: usize, len: usize) -> Vec<u8> {
        assert!(offset + len <= self.len, "read outside buffer");
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), out.as_mut_ptr(), len);
        }
        out
    }

    /// Fill the whole buffer with `byte`.
    pub fn fill(&self, byte: u8) {
        unsafe {
            std::ptr::write_bytes(self.ptr.as_ptr(), byte, self.len);
        }
    }
}

impl StagingBuffer for HostBuffer {
    fn addr(&self) -> usize {
        self.addr()
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        self.tracker.unregister(self.ptr.as_ptr() as usize);
        unsafe {
            dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

// Safety: the buffer is accessed only through raw-pointer copies with caller
// provided ordering; the struct itself holds no thread-affine state.
unsafe impl Send for HostBuffer {}
unsafe impl Sync for HostBuffer {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let tracker = HostMemoryTracker::new();
        let buf = HostBuffer::alloc(Arc::clone(&tracker), 1024, None, true).unwrap();

        buf.write(16, &[1, 2, 3, 4]);
        assert_eq!(buf.read_vec(16, 4), vec![1, 2, 3, 4]);
        // Untouched bytes are zeroed.
        assert_eq!(buf.read_vec(0, 4), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_zero_sized_alloc_fails() {
        let tracker = HostMemoryTracker::new();
        assert!(HostBuffer::alloc(tracker, 0, None, false).is_err());
    }

    #[test]
    fn test_provenance_lookup() {
        let tracker = HostMemoryTracker::new();
        let buf = HostBuffer::alloc(Arc::clone(&tracker), 4096, Some(1), false).unwrap();

        let info = tracker.resolve(buf.addr() + 100).unwrap();
        assert_eq!(info.base, buf.addr());
        assert_eq!(info.device, Some(1));

        // One past the end resolves nowhere.
        assert!(tracker.resolve(buf.addr() + 4096).is_none());
    }

    #[test]
    fn test_drop_unregisters() {
        let tracker = HostMemoryTracker::new();
        let addr = {
            let buf = HostBuffer::alloc(Arc::clone(&tracker), 64, None, false).unwrap();
            assert_eq!(tracker.region_count(), 1);
            buf.addr()
        };
        assert_eq!(tracker.region_count(), 0);
        assert!(tracker.resolve(addr).is_none());
    }

    #[test]
    fn test_unknown_address_resolves_nowhere() {
        let tracker = HostMemoryTracker::new();
        let stack = [0u8; 16];
        assert!(tracker.resolve(stack.as_ptr() as usize).is_none());
    }
}
