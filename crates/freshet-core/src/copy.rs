//! Copy-direction resolution.
//!
//! Classifies a memory copy from the provenance of its two pointers plus the
//! current peer-access state, and picks the execution path: host-to-device,
//! device-to-host, same-device, direct peer, or staged through a pinned host
//! buffer. Classification is a pure function of its inputs; misclassifying a
//! pointer as device-resident can corrupt memory rather than fail, so an
//! address with no provenance record always degrades to the conservative
//! unpinned host path.

use parking_lot::Mutex;

use crate::accel::{Accelerator, PointerInfo, StagingBuffer};
use crate::error::Result;

/// Caller-supplied direction hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyHint {
    /// No hint; infer the direction from pointer provenance.
    #[default]
    Auto,
    /// Both pointers are host memory.
    HostToHost,
    /// Destination device, source host.
    HostToDevice,
    /// Destination host, source device.
    DeviceToHost,
    /// Both pointers are device memory.
    DeviceToDevice,
}

/// Resolved copy path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyKind {
    /// Plain host copy.
    HostToHost,
    /// Host memory into device memory.
    HostToDevice,
    /// Device memory into host memory.
    DeviceToHost,
    /// Both sides on the same device.
    DeviceToDevice,
    /// Different devices with peer access enabled both ways.
    DeviceToDevicePeer,
    /// Different devices without mutual peer access; staged through a host
    /// buffer.
    DeviceToDevicePeerStaged,
}

/// Outcome of classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyPlan {
    /// The resolved path.
    pub kind: CopyKind,
    /// Device whose execution queue should carry the transfer, when one side
    /// pins that choice.
    pub copy_device: Option<usize>,
    /// Set when the copy must go through an unpinned host temporary: either
    /// a pointer had no provenance record, or a staged copy has no pinned
    /// staging buffer.
    pub force_unpinned: bool,
}

impl CopyPlan {
    fn new(kind: CopyKind, copy_device: Option<usize>, force_unpinned: bool) -> Self {
        Self {
            kind,
            copy_device,
            force_unpinned,
        }
    }

    /// True when the hint disagrees with the resolved direction; provenance
    /// wins, the mismatch is only worth logging.
    pub fn contradicts(&self, hint: CopyHint) -> bool {
        match hint {
            CopyHint::Auto => false,
            CopyHint::HostToHost => self.kind != CopyKind::HostToHost,
            CopyHint::HostToDevice => self.kind != CopyKind::HostToDevice,
            CopyHint::DeviceToHost => self.kind != CopyKind::DeviceToHost,
            CopyHint::DeviceToDevice => !matches!(
                self.kind,
                CopyKind::DeviceToDevice
                    | CopyKind::DeviceToDevicePeer
                    | CopyKind::DeviceToDevicePeerStaged
            ),
        }
    }
}

/// Classify a copy.
///
/// `dst` and `src` are the provenance answers for the two addresses (`None`
/// when the address is not known to the runtime). `can_access(owner,
/// accessor)` reports whether `accessor`'s context may address memory on
/// `owner`'s device, evaluated against the caller's peer-state snapshot.
/// `staging_available` reports whether a pinned staging buffer exists for
/// staged copies.
///
/// Provenance decides the direction; a caller hint that disagrees is
/// detected afterwards through [`CopyPlan::contradicts`]. A side without a
/// provenance record is treated as unpinned host memory, never as device
/// memory.
///
/// Deterministic and side-effect-free: identical provenance answers and peer
/// snapshots produce identical plans.
pub fn classify(
    dst: Option<&PointerInfo>,
    src: Option<&PointerInfo>,
    can_access: impl Fn(usize, usize) -> bool,
    staging_available: bool,
) -> CopyPlan {
    let dst_dev = dst.and_then(|i| i.device);
    let src_dev = src.and_then(|i| i.device);
    let dst_unresolved = dst.is_none();
    let src_unresolved = src.is_none();

    match (dst_dev, src_dev) {
        (Some(d), Some(s)) if d == s => CopyPlan::new(CopyKind::DeviceToDevice, Some(d), false),
        (Some(d), Some(s)) => {
            if can_access(s, d) && can_access(d, s) {
                CopyPlan::new(CopyKind::DeviceToDevicePeer, Some(d), false)
            } else {
                CopyPlan::new(CopyKind::DeviceToDevicePeerStaged, None, !staging_available)
            }
        }
        (Some(d), None) => CopyPlan::new(CopyKind::HostToDevice, Some(d), src_unresolved),
        (None, Some(s)) => CopyPlan::new(CopyKind::DeviceToHost, Some(s), dst_unresolved),
        (None, None) => CopyPlan::new(
            CopyKind::HostToHost,
            None,
            dst_unresolved || src_unresolved,
        ),
    }
}

/// Pool of pinned staging buffers for copies that cannot go direct.
///
/// Buffers are allocated once at runtime construction; checkout failure at
/// copy time falls back to an unpinned temporary rather than blocking.
pub(crate) struct StagingPool {
    buffers: Mutex<Vec<Box<dyn StagingBuffer>>>,
    chunk: usize,
    configured: bool,
}

impl StagingPool {
    pub(crate) fn new(platform: &dyn Accelerator, chunk_kib: usize, count: usize) -> Self {
        let chunk = chunk_kib * 1024;
        let mut buffers = Vec::new();
        if chunk > 0 {
            for _ in 0..count {
                match platform.alloc_staging(chunk) {
                    Ok(buf) => buffers.push(buf),
                    Err(e) => {
                        tracing::warn!(target: "freshet::copy", error = %e, "pinned staging unavailable");
                        break;
                    }
                }
            }
        }
        let configured = !buffers.is_empty();
        Self {
            buffers: Mutex::new(buffers),
            chunk,
            configured,
        }
    }

    /// Whether a pinned staging buffer exists at all.
    pub(crate) fn available(&self) -> bool {
        self.configured
    }

    /// Staging chunk size in bytes.
    pub(crate) fn chunk(&self) -> usize {
        self.chunk
    }

    pub(crate) fn checkout(&self) -> Option<Box<dyn StagingBuffer>> {
        self.buffers.lock().pop()
    }

    pub(crate) fn restore(&self, buf: Box<dyn StagingBuffer>) {
        self.buffers.lock().push(buf);
    }
}

/// Result of acquiring staging storage for one staged copy.
pub(crate) enum Staging {
    /// A pooled pinned buffer; must be restored after use.
    Pinned(Box<dyn StagingBuffer>),
    /// An unpinned host temporary. The address is captured from the mutable
    /// pointer at acquisition, since queue workers write through it.
    Unpinned { buf: Vec<u8>, addr: usize },
}

impl Staging {
    /// Acquire staging storage of at most `chunk` bytes for a copy of `len`
    /// bytes. `force_unpinned` skips the pool.
    pub(crate) fn acquire(pool: &StagingPool, len: usize, force_unpinned: bool) -> Result<Self> {
        if !force_unpinned {
            if let Some(buf) = pool.checkout() {
                return Ok(Staging::Pinned(buf));
            }
        }
        let chunk = if pool.chunk() > 0 { pool.chunk() } else { 64 * 1024 };
        let mut buf = vec![0u8; len.min(chunk)];
        let addr = buf.as_mut_ptr() as usize;
        Ok(Staging::Unpinned { buf, addr })
    }

    pub(crate) fn addr(&self) -> usize {
        match self {
            Staging::Pinned(buf) => buf.addr(),
            Staging::Unpinned { addr, .. } => *addr,
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Staging::Pinned(buf) => buf.len(),
            Staging::Unpinned { buf, .. } => buf.len(),
        }
    }

    pub(crate) fn release(self, pool: &StagingPool) {
        if let Staging::Pinned(buf) = self {
            pool.restore(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(pinned: bool) -> PointerInfo {
        PointerInfo {
            base: 0x1000,
            len: 4096,
            device: None,
            pinned,
        }
    }

    fn device(dev: usize) -> PointerInfo {
        PointerInfo {
            base: 0x2000 + dev * 0x1000,
            len: 4096,
            device: Some(dev),
            pinned: false,
        }
    }

    fn no_peers(_owner: usize, _accessor: usize) -> bool {
        false
    }

    fn all_peers(_owner: usize, _accessor: usize) -> bool {
        true
    }

    #[test]
    fn test_infer_host_to_device() {
        let plan = classify(
            Some(&device(0)),
            Some(&host(true)),
            no_peers,
            true,
        );
        assert_eq!(plan.kind, CopyKind::HostToDevice);
        assert_eq!(plan.copy_device, Some(0));
        assert!(!plan.force_unpinned);
    }

    #[test]
    fn test_infer_device_to_host() {
        let plan = classify(
            Some(&host(false)),
            Some(&device(1)),
            no_peers,
            true,
        );
        assert_eq!(plan.kind, CopyKind::DeviceToHost);
        assert_eq!(plan.copy_device, Some(1));
    }

    #[test]
    fn test_same_device_needs_no_peer_check() {
        // can_access would panic if consulted.
        let plan = classify(
            Some(&device(2)),
            Some(&device(2)),
            |_, _| panic!("peer state consulted for a local copy"),
            true,
        );
        assert_eq!(plan.kind, CopyKind::DeviceToDevice);
        assert_eq!(plan.copy_device, Some(2));
    }

    #[test]
    fn test_cross_device_without_peers_is_staged() {
        let plan = classify(
            Some(&device(0)),
            Some(&device(1)),
            no_peers,
            true,
        );
        assert_eq!(plan.kind, CopyKind::DeviceToDevicePeerStaged);
        assert_eq!(plan.copy_device, None);
        assert!(!plan.force_unpinned);
    }

    #[test]
    fn test_staged_without_staging_buffer_forces_unpinned() {
        let plan = classify(
            Some(&device(0)),
            Some(&device(1)),
            no_peers,
            false,
        );
        assert_eq!(plan.kind, CopyKind::DeviceToDevicePeerStaged);
        assert!(plan.force_unpinned);
    }

    #[test]
    fn test_mutual_peer_access_goes_direct() {
        let plan = classify(
            Some(&device(0)),
            Some(&device(1)),
            all_peers,
            true,
        );
        assert_eq!(plan.kind, CopyKind::DeviceToDevicePeer);
        assert_eq!(plan.copy_device, Some(0));
    }

    #[test]
    fn test_one_way_peer_access_is_not_enough() {
        // Only destination may see source; the reverse read is denied.
        let plan = classify(
            Some(&device(0)),
            Some(&device(1)),
            |owner, _| owner == 1,
            true,
        );
        assert_eq!(plan.kind, CopyKind::DeviceToDevicePeerStaged);
    }

    #[test]
    fn test_unresolved_pointer_degrades_to_host() {
        // A device hint cannot promote an unknown address to device memory.
        let plan = classify(None, None, no_peers, true);
        assert_eq!(plan.kind, CopyKind::HostToHost);
        assert!(plan.force_unpinned);
        assert!(plan.contradicts(CopyHint::DeviceToDevice));

        let plan = classify(Some(&device(0)), None, no_peers, true);
        assert_eq!(plan.kind, CopyKind::HostToDevice);
        assert!(plan.force_unpinned);

        let plan = classify(None, Some(&device(0)), no_peers, true);
        assert_eq!(plan.kind, CopyKind::DeviceToHost);
        assert!(plan.force_unpinned);
    }

    #[test]
    fn test_resolved_host_sides_are_not_forced_unpinned() {
        let plan = classify(
            Some(&host(false)),
            Some(&host(true)),
            no_peers,
            true,
        );
        assert_eq!(plan.kind, CopyKind::HostToHost);
        assert!(!plan.force_unpinned);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let dst = device(0);
        let src = device(1);
        let a = classify(Some(&dst), Some(&src), no_peers, true);
        let b = classify(Some(&dst), Some(&src), no_peers, true);
        assert_eq!(a, b);
    }

    #[test]
    fn test_hint_contradiction() {
        let plan = classify(
            Some(&device(0)),
            Some(&host(true)),
            no_peers,
            true,
        );
        assert_eq!(plan.kind, CopyKind::HostToDevice);
        assert!(plan.contradicts(CopyHint::DeviceToHost));
        assert!(!plan.contradicts(CopyHint::HostToDevice));
        assert!(!plan.contradicts(CopyHint::Auto));
    }
}
