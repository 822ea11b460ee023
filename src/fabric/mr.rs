//! Local memory registration and remote-region descriptors.

use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::bindings::*;
use crate::error::TransportError;
use crate::fabric::context::FabricContext;
use crate::utils::interop::fi_error_string;

/// Access rights to register a region with. Defaults to every right this
/// crate's endpoints need: local send/recv plus remote RMA read and write.
#[derive(Debug, Clone, Copy)]
pub struct MrAccess {
    pub send: bool,
    pub recv: bool,
    pub read: bool,
    pub write: bool,
    pub remote_read: bool,
    pub remote_write: bool,
}

impl Default for MrAccess {
    fn default() -> Self {
        Self {
            send: true,
            recv: true,
            read: true,
            write: true,
            remote_read: true,
            remote_write: true,
        }
    }
}

impl MrAccess {
    fn bits(self) -> u64 {
        let mut bits = 0u64;
        if self.send {
            bits |= FI_SEND as u64;
        }
        if self.recv {
            bits |= FI_RECV as u64;
        }
        if self.read {
            bits |= FI_READ as u64;
        }
        if self.write {
            bits |= FI_WRITE as u64;
        }
        if self.remote_read {
            bits |= FI_REMOTE_READ as u64;
        }
        if self.remote_write {
            bits |= FI_REMOTE_WRITE as u64;
        }
        bits
    }
}

/// Assigns a monotonic requested key so regions can be distinguished without
/// relying on every provider's auto-assigned rkey being unique across an
/// endpoint's lifetime.
static NEXT_REQUESTED_KEY: AtomicU64 = AtomicU64::new(1);

#[allow(dead_code)]
struct MrInner<'mem> {
    ctx: FabricContext,
    mr: NonNull<fid_mr>,
    addr: u64,
    len: usize,
    /// Present for a region registered through [`MemoryRegion::register_allocated`],
    /// which owns the buffer it registers rather than borrowing a
    /// caller-supplied slice; `None` for `register`/`register_with_access`,
    /// whose buffer lifetime is tracked by `marker` instead.
    owned: Option<Box<[u8]>>,
    marker: PhantomData<&'mem UnsafeCell<[u8]>>,
}

unsafe impl Send for MrInner<'_> {}
unsafe impl Sync for MrInner<'_> {}

impl Drop for MrInner<'_> {
    fn drop(&mut self) {
        let ret = unsafe { close_fid(self.mr.as_ptr() as *mut fid) };
        if ret != 0 {
            log::warn!("failed to deregister memory region: {}", fi_error_string(ret));
        }
    }
}

/// A memory region registered with the fabric domain.
///
/// The registered memory itself does not belong to this type; the caller's
/// buffer must outlive the region's lifetime (`'mem`) or the provider is
/// left holding a dangling registration.
#[derive(Clone)]
#[repr(transparent)]
pub struct MemoryRegion<'mem> {
    inner: Arc<MrInner<'mem>>,
}

impl fmt::Debug for MemoryRegion<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("addr", &self.addr())
            .field("len", &self.len())
            .field("key", &self.key())
            .finish()
    }
}

impl<'mem> MemoryRegion<'mem> {
    /// Registers `buf` with the default access rights (send, recv, local
    /// and remote read/write). Fails with [`TransportError::InvalidArgs`]
    /// if `buf` is empty (a safe `&mut [u8]` can never be null, so only the
    /// zero-size half of the guard applies here).
    pub fn register(ctx: &FabricContext, buf: &'mem mut [u8]) -> Result<Self, TransportError> {
        Self::register_with_access(ctx, buf, MrAccess::default())
    }

    /// Registers `buf` with explicit access rights.
    ///
    /// Named distinctly from `register` (rather than taking `access` as a
    /// second always-present parameter) because most callers only ever need
    /// the default rights and the access bits only matter when a provider's
    /// `FI_MR_ALLOCATED` mode (see [`super::context::MrModeFlags`]) requires
    /// a narrower grant than this crate's default.
    pub fn register_with_access(
        ctx: &FabricContext,
        buf: &'mem mut [u8],
        access: MrAccess,
    ) -> Result<Self, TransportError> {
        if buf.is_empty() {
            return Err(TransportError::InvalidArgs(
                "memory region registration requires a non-empty buffer".to_owned(),
            ));
        }
        let len = buf.len();
        Self::register_raw(ctx, buf.as_ptr(), len, access, None)
    }

    /// Allocates an owned buffer of `size` bytes and registers it with the
    /// default access rights; the region owns the buffer for the
    /// registration's lifetime instead of borrowing a caller-supplied
    /// slice. Fails with [`TransportError::InvalidArgs`] if `size == 0`.
    pub fn register_allocated(ctx: &FabricContext, size: usize) -> Result<MemoryRegion<'static>, TransportError> {
        if size == 0 {
            return Err(TransportError::InvalidArgs(
                "register_allocated requires size > 0".to_owned(),
            ));
        }
        let buf: Box<[u8]> = vec![0u8; size].into_boxed_slice();
        MemoryRegion::register_raw(ctx, buf.as_ptr(), buf.len(), MrAccess::default(), Some(buf))
    }

    /// Shared `fi_mr_reg` plumbing for [`MemoryRegion::register_with_access`]
    /// (borrowed buffer, `owned = None`) and
    /// [`MemoryRegion::register_allocated`] (owned buffer, `owned = Some`).
    fn register_raw<'a>(
        ctx: &FabricContext,
        ptr: *const u8,
        len: usize,
        access: MrAccess,
        owned: Option<Box<[u8]>>,
    ) -> Result<MemoryRegion<'a>, TransportError> {
        let requested_key = NEXT_REQUESTED_KEY.fetch_add(1, Ordering::Relaxed);
        let addr = ptr as u64;
        let mut mr_ptr: *mut fid_mr = std::ptr::null_mut();
        let ret = unsafe {
            fi_mr_reg(
                ctx.domain_ptr(),
                ptr as *const c_void,
                len,
                access.bits(),
                0,
                requested_key,
                0,
                &mut mr_ptr,
                std::ptr::null_mut(),
            )
        };
        if ret != 0 {
            return Err(TransportError::FatalFabric {
                op: "fi_mr_reg",
                detail: fi_error_string(ret),
            });
        }
        let mr = NonNull::new(mr_ptr).expect("fi_mr_reg reported success with a null fid_mr");
        Ok(MemoryRegion {
            inner: Arc::new(MrInner {
                ctx: ctx.clone(),
                mr,
                addr,
                len,
                owned,
                marker: PhantomData::<&'a UnsafeCell<[u8]>>,
            }),
        })
    }

    /// The registered buffer's starting virtual address.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.inner.addr
    }

    /// The registered buffer's length, in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len
    }

    /// `true` if the region covers zero bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The local descriptor handed to `fi_send`/`fi_recv`/`fi_write` to
    /// identify this region as a local operand.
    #[inline]
    pub fn local_desc(&self) -> *mut c_void {
        unsafe { fi_mr_desc(self.inner.mr.as_ptr()) }
    }

    /// The remote key a peer uses to target this region over RMA.
    #[inline]
    pub fn key(&self) -> u64 {
        unsafe { fi_mr_key(self.inner.mr.as_ptr()) }
    }

    /// Packages this region's address, length, and remote key for exchange
    /// with a peer over [`super::RemoteRegionExchange`].
    pub fn as_remote(&self) -> RemoteMemoryRegion {
        RemoteMemoryRegion {
            addr: self.addr(),
            len: self.len(),
            rkey: self.key(),
        }
    }
}

impl From<&MemoryRegion<'_>> for RemoteMemoryRegion {
    fn from(mr: &MemoryRegion<'_>) -> Self {
        mr.as_remote()
    }
}

/// A remote peer's memory-region descriptor, exchanged over
/// [`super::RemoteRegionExchange`] and used as the target of an outgoing
/// RMA write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RemoteMemoryRegion {
    pub addr: u64,
    pub len: usize,
    pub rkey: u64,
}

impl RemoteMemoryRegion {
    pub fn new(addr: u64, len: usize, rkey: u64) -> Self {
        Self { addr, len, rkey }
    }

    /// A zeroed placeholder, useful before a peer's region has been
    /// received.
    pub fn dummy() -> Self {
        Self::new(0, 0, 0)
    }

    /// The wire-level RMA target address at the given byte offset into this
    /// region. If `virt_addr` is set (the provider reports
    /// `FI_MR_VIRT_ADDR`, see [`super::context::MrModeFlags`]), this is the
    /// remote's absolute virtual address plus `offset`; otherwise the
    /// provider addresses the region purely by `rkey` and expects a
    /// zero-based offset.
    #[inline]
    pub fn at(&self, offset: usize, virt_addr: bool) -> u64 {
        if virt_addr {
            self.addr + offset as u64
        } else {
            offset as u64
        }
    }

    /// A sub-region covering `range`, or `None` if `range` runs past `len`.
    /// `virt_addr` is threaded through to [`RemoteMemoryRegion::at`] the same
    /// way it is for a direct write, so the slice's `addr` field is already
    /// the correct wire-level target for `range.start`.
    pub fn get_slice(&self, range: std::ops::Range<usize>, virt_addr: bool) -> Option<Self> {
        if range.start <= range.end && range.end <= self.len {
            Some(Self {
                addr: self.at(range.start, virt_addr),
                len: range.end - range.start,
                rkey: self.rkey,
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_is_absolute_under_virt_addr_mode() {
        let region = RemoteMemoryRegion::new(0x1000, 256, 0xabcd);
        assert_eq!(region.at(16, true), 0x1010);
    }

    #[test]
    fn at_is_zero_based_without_virt_addr_mode() {
        let region = RemoteMemoryRegion::new(0x1000, 256, 0xabcd);
        assert_eq!(region.at(16, false), 16);
    }

    #[test]
    fn get_slice_rejects_out_of_bounds_range() {
        let region = RemoteMemoryRegion::new(0x1000, 256, 0xabcd);
        assert!(region.get_slice(200..300, true).is_none());
        assert!(region.get_slice(200..256, true).is_some());
    }
}
