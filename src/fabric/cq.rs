//! The shared completion queue.
//!
//! One `fid_cq` is opened by [`crate::fabric::FabricContext::initialize`]
//! and shared by every endpoint in the process; [`super::polling`] is its
//! sole reader. The queue is opened in `FI_CQ_FORMAT_DATA` rather than the
//! plainer `FI_CQ_FORMAT_CONTEXT`, since every completion needs to carry a
//! byte count and optional immediate data, which only `FI_CQ_FORMAT_DATA`
//! entries provide; see `DESIGN.md` for the tradeoff.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::bindings::*;
use crate::utils::interop::fi_error_string;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct FidCq(NonNull<fid_cq>);
impl_fid_wrapper_traits!(fid_cq, FidCq);

/// One polled work-request completion, in the shape [`super::polling`]
/// needs: the packed opaque context, whether the request succeeded, the
/// transferred byte count, and any immediate data.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CqEntry {
    pub context: u64,
    pub success: bool,
    pub len: usize,
    pub immediate: Option<u32>,
    pub flags: u64,
}

struct CqInner {
    cq: FidCq,
}

impl Drop for CqInner {
    fn drop(&mut self) {
        let ret = unsafe { close_fid(self.cq.as_ptr() as *mut fid) };
        if ret != 0 {
            log::warn!("failed to close completion queue: {}", fi_error_string(ret));
        }
    }
}

/// A polled queue of work-request completions. Shared by every
/// [`super::Endpoint`] in the process; cheaply `Clone`-able.
#[derive(Clone)]
pub struct CompletionQueue {
    inner: Arc<CqInner>,
}

impl CompletionQueue {
    pub(crate) fn open(domain: *mut fid_domain, size: usize) -> Result<Self, i32> {
        let mut attr: fi_cq_attr = unsafe { std::mem::zeroed() };
        attr.size = size;
        attr.format = fi_cq_format::FI_CQ_FORMAT_DATA;
        attr.wait_obj = fi_wait_obj::FI_WAIT_UNSPEC;

        let mut cq_ptr: *mut fid_cq = std::ptr::null_mut();
        let ret = unsafe { fi_cq_open(domain, &attr, &mut cq_ptr, std::ptr::null_mut()) };
        if ret != 0 {
            return Err(ret);
        }
        let cq = FidCq(NonNull::new(cq_ptr).expect("fi_cq_open reported success with a null fid_cq"));
        Ok(Self {
            inner: Arc::new(CqInner { cq }),
        })
    }

    pub(crate) fn as_ptr(&self) -> *mut fid_cq {
        self.inner.cq.as_ptr()
    }

    pub(crate) fn as_fid(&self) -> *mut fid {
        self.inner.cq.as_ptr() as *mut fid
    }

    /// Non-blockingly drains up to `max` completions.
    pub(crate) fn poll_batch(&self, max: usize) -> Vec<CqEntry> {
        let mut buf: Vec<fi_cq_data_entry> = Vec::with_capacity(max);
        buf.resize_with(max, || unsafe { std::mem::zeroed() });

        let ret = unsafe {
            fi_cq_read(
                self.inner.cq.as_ptr(),
                buf.as_mut_ptr() as *mut c_void,
                max,
            )
        };

        if ret == -(FI_EAGAIN as isize) {
            return Vec::new();
        }
        if ret == -(FI_EAVAIL as isize) {
            return self.read_error_entry().into_iter().collect();
        }
        if ret < 0 {
            log::warn!("fi_cq_read failed: {}", fi_error_string(ret as i32));
            return Vec::new();
        }

        buf.truncate(ret as usize);
        buf.into_iter()
            .map(|e| CqEntry {
                context: e.op_context as u64,
                success: true,
                len: e.len,
                immediate: (e.flags & FI_REMOTE_CQ_DATA as u64 != 0).then_some(e.data as u32),
                flags: e.flags,
            })
            .collect()
    }

    fn read_error_entry(&self) -> Option<CqEntry> {
        let mut err: fi_cq_err_entry = unsafe { std::mem::zeroed() };
        let ret = unsafe { fi_cq_readerr(self.inner.cq.as_ptr(), &mut err, 0) };
        if ret <= 0 {
            return None;
        }
        Some(CqEntry {
            context: err.op_context as u64,
            success: false,
            len: 0,
            immediate: None,
            flags: err.flags,
        })
    }
}
