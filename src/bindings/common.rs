//! Hand-maintained FFI surface `bindgen` cannot produce from the libfabric
//! headers.
//!
//! Most of the libfabric API is not a set of exported symbols: it is a
//! family of `static inline` functions in `<rdma/fi_endpoint.h>`,
//! `<rdma/fi_domain.h>`, `<rdma/fi_cm.h>`, `<rdma/fi_eq.h>`, and
//! `<rdma/fi_rma.h>` that each indirect through a per-object `ops` vtable
//! (`fid->ops->close`, `ep->cm->connect`, `domain->ops->cq_open`, ...).
//! `bindgen` only emits bindings for real exported symbols and for
//! type/struct/enum/const definitions, so every one of these has to be
//! reimplemented here by hand, dereferencing the same vtables the
//! generated `fid_*`/`fi_ops_*` struct definitions already describe.

use std::ffi::c_void;

use super::private::*;

/// Mirrors the `FI_VERSION(major, minor)` macro from `<rdma/fabric.h>`,
/// used to request a libfabric API version when calling `fi_getinfo`.
#[inline(always)]
pub(crate) const fn fi_version(major: u32, minor: u32) -> u32 {
    (major << 16) | minor
}

/// The API version this crate was written against.
pub(crate) const FI_VERSION_CURRENT: u32 = fi_version(1, 9);

/// `FI_ADDR_UNSPEC`: the wildcard/unknown fabric address sentinel. Exposed
/// as a `#define`d `uint64_t` in the headers, which bindgen turns into an
/// untyped integer constant; re-exposing it with an explicit type avoids a
/// cast at every call site.
pub(crate) const FI_ADDR_UNSPEC: u64 = u64::MAX;

/// Every `fid_*` resource struct (`fid_fabric`, `fid_domain`, `fid_pep`,
/// `fid_eq`, `fid_cq`, `fid_ep`, `fid_mr`) begins with an embedded `struct
/// fid fid` header field, so a pointer to any of them is also a valid `*mut
/// fid` for the purposes of the functions below.
#[inline]
pub(crate) unsafe fn fi_close(fid: *mut fid) -> i32 {
    (*(*fid).ops).close.unwrap()(fid)
}

/// `ep->fid.ops->bind`. `ep`'s embedded `fid` field sits at offset 0, so the
/// endpoint pointer doubles as the `fid` pointer the vtable call needs.
#[inline]
pub(crate) unsafe fn fi_ep_bind(ep: *mut fid_ep, bfid: *mut fid, flags: u64) -> i32 {
    (*(*ep).fid.ops).bind.unwrap()(ep as *mut fid, bfid, flags)
}

/// `pep->fid.ops->bind`, the passive-endpoint counterpart of [`fi_ep_bind`].
#[inline]
pub(crate) unsafe fn fi_pep_bind(pep: *mut fid_pep, bfid: *mut fid, flags: u64) -> i32 {
    (*(*pep).fid.ops).bind.unwrap()(pep as *mut fid, bfid, flags)
}

/// `ep->fid.ops->control(&ep->fid, FI_ENABLE, NULL)`. `FI_ENABLE` is a plain
/// enum constant in `<rdma/fabric.h>`, not a macro, so bindgen's
/// `allowlist_var` already produces it; only the dispatch through `control`
/// needs hand-writing.
#[inline]
pub(crate) unsafe fn fi_enable(ep: *mut fid_ep) -> i32 {
    (*(*ep).fid.ops).control.unwrap()(ep as *mut fid, FI_ENABLE as i32, std::ptr::null_mut())
}

#[inline]
pub(crate) unsafe fn fi_listen(pep: *mut fid_pep) -> i32 {
    (*(*pep).cm).listen.unwrap()(pep)
}

/// Dispatches through `fid_ep`'s `cm` ops regardless of whether `fid` names
/// an actual `fid_ep` or a `fid_pep`: both structs share the same `{ fid,
/// ops, cm }` prefix layout, which is exactly how libfabric itself
/// implements this call.
#[inline]
pub(crate) unsafe fn fi_getname(fid: fid_t, addr: *mut c_void, addrlen: *mut usize) -> i32 {
    let ep = fid as *mut fid_ep;
    (*(*ep).cm).getname.unwrap()(fid, addr, addrlen)
}

#[inline]
pub(crate) unsafe fn fi_connect(
    ep: *mut fid_ep,
    addr: *const c_void,
    param: *const c_void,
    paramlen: usize,
) -> i32 {
    (*(*ep).cm).connect.unwrap()(ep, addr, param, paramlen)
}

#[inline]
pub(crate) unsafe fn fi_accept(ep: *mut fid_ep, param: *const c_void, paramlen: usize) -> i32 {
    (*(*ep).cm).accept.unwrap()(ep, param, paramlen)
}

#[inline]
pub(crate) unsafe fn fi_reject(
    pep: *mut fid_pep,
    handle: fid_t,
    param: *const c_void,
    paramlen: usize,
) -> i32 {
    (*(*pep).cm).reject.unwrap()(pep, handle, param, paramlen)
}

#[inline]
pub(crate) unsafe fn fi_shutdown(ep: *mut fid_ep, flags: u64) -> i32 {
    (*(*ep).cm).shutdown.unwrap()(ep, flags)
}

#[inline]
pub(crate) unsafe fn fi_domain(
    fabric: *mut fid_fabric,
    info: *mut fi_info,
    domain: *mut *mut fid_domain,
    context: *mut c_void,
) -> i32 {
    (*(*fabric).ops).domain.unwrap()(fabric, info, domain, context)
}

#[inline]
pub(crate) unsafe fn fi_passive_ep(
    fabric: *mut fid_fabric,
    info: *mut fi_info,
    pep: *mut *mut fid_pep,
    context: *mut c_void,
) -> i32 {
    (*(*fabric).ops).passive_ep.unwrap()(fabric, info, pep, context)
}

#[inline]
pub(crate) unsafe fn fi_eq_open(
    fabric: *mut fid_fabric,
    attr: *const fi_eq_attr,
    eq: *mut *mut fid_eq,
    context: *mut c_void,
) -> i32 {
    (*(*fabric).ops).eq_open.unwrap()(fabric, attr, eq, context)
}

#[inline]
pub(crate) unsafe fn fi_endpoint(
    domain: *mut fid_domain,
    info: *mut fi_info,
    ep: *mut *mut fid_ep,
    context: *mut c_void,
) -> i32 {
    (*(*domain).ops).endpoint.unwrap()(domain, info, ep, context)
}

#[inline]
pub(crate) unsafe fn fi_cq_open(
    domain: *mut fid_domain,
    attr: *const fi_cq_attr,
    cq: *mut *mut fid_cq,
    context: *mut c_void,
) -> i32 {
    (*(*domain).ops).cq_open.unwrap()(domain, attr, cq, context)
}

#[inline]
pub(crate) unsafe fn fi_eq_sread(
    eq: *mut fid_eq,
    event: *mut u32,
    buf: *mut c_void,
    len: usize,
    timeout: i32,
    flags: u64,
) -> isize {
    (*(*eq).ops).sread.unwrap()(eq, event, buf, len, timeout, flags)
}

#[inline]
pub(crate) unsafe fn fi_cq_read(cq: *mut fid_cq, buf: *mut c_void, count: usize) -> isize {
    (*(*cq).ops).read.unwrap()(cq, buf, count)
}

#[inline]
pub(crate) unsafe fn fi_cq_readerr(cq: *mut fid_cq, buf: *mut fi_cq_err_entry, flags: u64) -> isize {
    (*(*cq).ops).readerr.unwrap()(cq, buf, flags)
}

/// Builds the `fi_mr_attr` the real `fi_mr_reg` inline wrapper constructs on
/// the caller's behalf from its simpler argument list, then dispatches
/// through `domain->mr->regattr`. Unset `fi_mr_attr` fields (anything beyond
/// `mr_iov`/`iov_count`/`access`/`offset`/`requested_key`/`context`) are left
/// at their `Default::default()` value, since this crate never needs
/// IOV-count > 1, auth keys, or an explicit `iface`.
#[inline]
#[allow(clippy::too_many_arguments)]
pub(crate) unsafe fn fi_mr_reg(
    domain: *mut fid_domain,
    buf: *const c_void,
    len: usize,
    access: u64,
    offset: u64,
    requested_key: u64,
    flags: u64,
    mr: *mut *mut fid_mr,
    context: *mut c_void,
) -> i32 {
    let iov = iovec {
        iov_base: buf as *mut c_void,
        iov_len: len,
    };
    let attr = fi_mr_attr {
        mr_iov: &iov,
        iov_count: 1,
        access,
        offset,
        requested_key,
        context,
        ..Default::default()
    };
    (*(*domain).mr).regattr.unwrap()(domain as *mut fid, &attr, flags, mr)
}

#[inline]
pub(crate) unsafe fn fi_mr_desc(mr: *mut fid_mr) -> *mut c_void {
    (*mr).mem_desc
}

#[inline]
pub(crate) unsafe fn fi_mr_key(mr: *mut fid_mr) -> u64 {
    (*mr).key
}

#[inline]
pub(crate) unsafe fn fi_sendmsg(ep: *mut fid_ep, msg: *const fi_msg, flags: u64) -> isize {
    (*(*ep).msg).sendmsg.unwrap()(ep, msg, flags)
}

#[inline]
pub(crate) unsafe fn fi_recvmsg(ep: *mut fid_ep, msg: *const fi_msg, flags: u64) -> isize {
    (*(*ep).msg).recvmsg.unwrap()(ep, msg, flags)
}

#[inline]
pub(crate) unsafe fn fi_writemsg(ep: *mut fid_ep, msg: *const fi_msg_rma, flags: u64) -> isize {
    (*(*ep).rma).writemsg.unwrap()(ep, msg, flags)
}

/// Thin name-preserving alias so every other module can keep writing
/// `close_fid(...)` at a bare `*mut fid` without re-deriving which vtable
/// field that maps to.
#[inline(always)]
pub(crate) unsafe fn close_fid(ptr: *mut fid) -> i32 {
    fi_close(ptr)
}
