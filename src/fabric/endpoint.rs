//! Per-peer reliable endpoints and the connect protocol.

use std::ffi::c_void;
use std::ops::Range;
use std::ptr::NonNull;

use crate::bindings::*;
use crate::bootstrap::NodeId;
use crate::error::{fatal, TransportError};
use crate::utils::interop::fi_error_string;

use super::context::{FabricContext, MAX_PEP_ADDR_LEN};
use super::message_type::MessageType;
use super::mr::{MemoryRegion, RemoteMemoryRegion};

/// Which side of the connect protocol an endpoint plays: the side that
/// dials in (`Client`) or the side that listens and accepts
/// (`Server`). Symmetric with `self_id < peer_id` the same way
/// [`crate::bootstrap::TcpBootstrap`] decides dial-vs-accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Fixed-size frame the connect protocol exchanges over the TCP bootstrap
/// before ever touching the fabric: a big-endian address length followed by
/// up to [`MAX_PEP_ADDR_LEN`] bytes of opaque passive-endpoint address.
#[derive(Clone, Copy)]
#[repr(C)]
struct AddrFrame {
    len: [u8; 4],
    addr: [u8; MAX_PEP_ADDR_LEN],
    _pad: [u8; 4],
}

impl AddrFrame {
    fn new(addr: &[u8]) -> Self {
        assert!(addr.len() <= MAX_PEP_ADDR_LEN);
        let mut frame = AddrFrame {
            len: (addr.len() as u32).to_be_bytes(),
            addr: [0u8; MAX_PEP_ADDR_LEN],
            _pad: [0u8; 4],
        };
        frame.addr[..addr.len()].copy_from_slice(addr);
        frame
    }

    fn bytes(&self) -> &[u8] {
        let len = u32::from_be_bytes(self.len) as usize;
        &self.addr[..len]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct FidEndpoint(NonNull<fid_ep>);
impl_fid_wrapper_traits!(fid_ep, FidEndpoint);

/// A connected, reliable point-to-point endpoint to one peer.
pub struct Endpoint {
    ctx: FabricContext,
    ep: FidEndpoint,
    peer_id: NodeId,
    role: Role,
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        let ret = unsafe { fi_shutdown(self.ep.as_ptr(), 0) };
        if ret != 0 && ret != -libc::ENOTCONN {
            log::warn!("fi_shutdown failed for peer {}: {}", self.peer_id, fi_error_string(ret));
        }
        let ret = unsafe { close_fid(self.ep.as_ptr() as *mut fid) };
        if ret != 0 {
            log::warn!("failed to close endpoint for peer {}: {}", self.peer_id, fi_error_string(ret));
        }
    }
}

impl Endpoint {
    /// Runs the full connect protocol against `peer_id`:
    ///
    /// 1. exchange local/remote passive-endpoint addresses over the TCP
    ///    bootstrap;
    /// 2. server: block for a `FI_CONNREQ` event, build the endpoint from
    ///    the request's `fi_info`, bind it, let the caller pre-post
    ///    receives, and `fi_accept`;
    ///    client: build the endpoint from the context's info template with
    ///    the peer's address attached, bind it, let the caller pre-post
    ///    receives, and `fi_connect`, then block for `FI_CONNECTED`;
    /// 3. a final 4-byte TCP rendezvous so neither side returns before the
    ///    other has finished its own half of the handshake.
    ///
    /// Any protocol failure is unrecoverable for the process: there is no
    /// way to retry a connect attempt without first tearing
    /// down the endpoint this function would otherwise have returned.
    pub fn connect(
        ctx: &FabricContext,
        peer_id: NodeId,
        role: Role,
        post_recvs: impl FnOnce(&Endpoint) -> Result<(), TransportError>,
    ) -> Self {
        let local_frame = AddrFrame::new(ctx.local_pep_addr());
        let mut remote_frame = AddrFrame::new(&[]);
        ctx.bootstrap()
            .exchange(peer_id, local_frame, &mut remote_frame)
            .unwrap_or_else(|e| fatal!("address exchange with peer {peer_id} failed: {e}"));
        let remote_addr = remote_frame.bytes().to_vec();

        let (ep, fi_info_used) = match role {
            Role::Server => Self::accept_side(ctx, peer_id),
            Role::Client => Self::connect_side(ctx, peer_id, &remote_addr),
        };

        let endpoint = Endpoint {
            ctx: ctx.clone(),
            ep,
            peer_id,
            role,
        };

        post_recvs(&endpoint).unwrap_or_else(|e| fatal!("post_recvs failed for peer {peer_id}: {e}"));

        match role {
            Role::Server => {
                let ret = unsafe { fi_accept(ep.as_ptr(), std::ptr::null(), 0) };
                if ret != 0 {
                    fatal!(ret, "fi_accept failed for peer {peer_id}");
                }
                let (event, entry) = ctx
                    .eq_ep()
                    .sread_cm()
                    .unwrap_or_else(|e| fatal!("waiting for FI_CONNECTED from peer {peer_id} failed: {e}"));
                if event != FI_CONNECTED as u32 {
                    fatal!("unexpected CM event {event} while accepting peer {peer_id}");
                }
                if entry.fid != ep.as_ptr() as fid_t {
                    fatal!("FI_CONNECTED event for peer {peer_id} carried a foreign fid; eq_ep is shared across every endpoint in the process");
                }
            }
            Role::Client => {
                let ret = unsafe {
                    fi_connect(
                        ep.as_ptr(),
                        remote_addr.as_ptr() as *const c_void,
                        std::ptr::null(),
                        0,
                    )
                };
                if ret != 0 {
                    fatal!(ret, "fi_connect failed for peer {peer_id}");
                }
                let (event, entry) = ctx
                    .eq_ep()
                    .sread_cm()
                    .unwrap_or_else(|e| fatal!("waiting for FI_CONNECTED from peer {peer_id} failed: {e}"));
                if event != FI_CONNECTED as u32 {
                    fatal!("unexpected CM event {event} while connecting to peer {peer_id}");
                }
                if entry.fid != ep.as_ptr() as fid_t {
                    fatal!("FI_CONNECTED event for peer {peer_id} carried a foreign fid; eq_ep is shared across every endpoint in the process");
                }
            }
        }
        unsafe { fi_freeinfo(fi_info_used.as_ptr()) };

        let local_token = [0u8; 4];
        let mut remote_token = [0u8; 4];
        ctx.bootstrap()
            .exchange(peer_id, local_token, &mut remote_token)
            .unwrap_or_else(|e| fatal!("final rendezvous with peer {peer_id} failed: {e}"));

        log::debug!("endpoint to peer {peer_id} connected as {:?}", role);
        endpoint
    }

    fn accept_side(ctx: &FabricContext, peer_id: NodeId) -> (FidEndpoint, NonNull<fi_info>) {
        let (event, entry) = ctx
            .eq_pep()
            .sread_cm()
            .unwrap_or_else(|e| fatal!("waiting for FI_CONNREQ from peer {peer_id} failed: {e}"));
        if event != FI_CONNREQ as u32 {
            fatal!("unexpected CM event {event} while awaiting connection from peer {peer_id}");
        }
        let info = NonNull::new(entry.info).unwrap_or_else(|| fatal!("FI_CONNREQ carried no fi_info"));

        let mut ep_ptr: *mut fid_ep = std::ptr::null_mut();
        let ret = unsafe { fi_endpoint(ctx.domain_ptr(), info.as_ptr(), &mut ep_ptr, std::ptr::null_mut()) };
        if ret != 0 {
            fatal!(ret, "fi_endpoint failed while accepting peer {peer_id}");
        }
        let ep = FidEndpoint(NonNull::new(ep_ptr).unwrap());
        bind_and_enable(ctx, ep, peer_id);
        (ep, info)
    }

    fn connect_side(ctx: &FabricContext, peer_id: NodeId, remote_addr: &[u8]) -> (FidEndpoint, NonNull<fi_info>) {
        let mut hints = ctx.dup_info_template();
        // SAFETY: `hints` is a freshly duplicated, uniquely owned `fi_info`;
        // `dest_addr` is `malloc`-ed so `fi_freeinfo` can release it later.
        unsafe {
            let node = hints.as_mut();
            node.dest_addr = libc::malloc(remote_addr.len());
            std::ptr::copy_nonoverlapping(
                remote_addr.as_ptr(),
                node.dest_addr as *mut u8,
                remote_addr.len(),
            );
            node.dest_addrlen = remote_addr.len();
        }

        // `hints` alone is not a connectable `fi_info`: it still carries the
        // passive-listen template's endpoint handle and caps. `fi_getinfo`
        // with `dest_addr` attached resolves a fresh, genuinely connectable
        // info for this specific destination.
        let mut info_ptr: *mut fi_info = std::ptr::null_mut();
        let ret = unsafe {
            fi_getinfo(
                crate::bindings::FI_VERSION_CURRENT,
                std::ptr::null(),
                std::ptr::null(),
                0,
                hints.as_ptr(),
                &mut info_ptr,
            )
        };
        unsafe { fi_freeinfo(hints.as_ptr()) };
        if ret != 0 {
            fatal!(ret, "fi_getinfo failed while connecting to peer {peer_id}");
        }
        let info = NonNull::new(info_ptr).unwrap_or_else(|| fatal!("fi_getinfo returned no info while connecting to peer {peer_id}"));

        let mut ep_ptr: *mut fid_ep = std::ptr::null_mut();
        let ret = unsafe { fi_endpoint(ctx.domain_ptr(), info.as_ptr(), &mut ep_ptr, std::ptr::null_mut()) };
        if ret != 0 {
            fatal!(ret, "fi_endpoint failed while connecting to peer {peer_id}");
        }
        let ep = FidEndpoint(NonNull::new(ep_ptr).unwrap());
        bind_and_enable(ctx, ep, peer_id);
        (ep, info)
    }

    pub fn peer_id(&self) -> NodeId {
        self.peer_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Posts a tagged send of `region[range]`. Returns `InvalidArgs` if
    /// `range` runs past the region,
    /// or if `wr_id` overlaps the message-type tag bits.
    ///
    /// Always requests a completion explicitly (`FI_COMPLETION`): the
    /// endpoint is bound with `FI_SELECTIVE_COMPLETION`, under which
    /// the simple `fi_send`/`fi_recv` calls would otherwise produce no
    /// completion at all, silently breaking `type.on_send`/`on_receive`
    /// dispatch.
    pub fn post_send(
        &self,
        mt: &MessageType,
        wr_id: u64,
        region: &MemoryRegion<'_>,
        range: Range<usize>,
        immediate: Option<u32>,
    ) -> Result<(), TransportError> {
        let buf = self.checked_slice(region, &range)?;
        let ctx = self.packed_context(mt, wr_id)?;
        let ret = self.sendmsg_raw(buf, range.len(), region.local_desc(), ctx, immediate);
        self.check_post_ret(ret, "fi_sendmsg")
    }

    /// Posts a tagged receive buffer at `region[range]`.
    pub fn post_recv(
        &self,
        mt: &MessageType,
        wr_id: u64,
        region: &MemoryRegion<'_>,
        range: Range<usize>,
    ) -> Result<(), TransportError> {
        let buf = self.checked_slice(region, &range)?;
        let ctx = self.packed_context(mt, wr_id)?;
        let ret = self.recvmsg_raw(buf as *mut c_void, range.len(), region.local_desc(), ctx);
        self.check_post_ret(ret, "fi_recvmsg")
    }

    /// Posts an RMA write of `region[range]` into `target` at
    /// `remote_offset` bytes into it, optionally carrying `immediate` data
    /// the peer's completion will expose. `InvalidArgs` if `range` runs past
    /// the local region, or if `remote_offset + range.len()` runs past
    /// `target`.
    ///
    /// The wire-level target address depends on the provider's
    /// `FI_MR_VIRT_ADDR` mode ([`super::context::MrModeFlags::virt_addr`]):
    /// when set, the provider expects `target`'s absolute registered address
    /// plus `remote_offset`; when unset, it expects a zero-based offset and
    /// resolves the region purely from `target.rkey`.
    ///
    /// `signaled` requests a local completion for this write on top of the
    /// endpoint's default selective-completion binding; without it
    /// the write still lands remotely but this side's completion queue
    /// never hears about it. `send_inline` asks the provider to copy the
    /// payload into the request itself (`FI_INJECT`) rather than reference
    /// `region`'s pages, which lets the caller reuse or drop `region`
    /// immediately, but is only honored up to the provider's inject-size
    /// limit.
    #[allow(clippy::too_many_arguments)]
    pub fn post_write(
        &self,
        mt: &MessageType,
        wr_id: u64,
        region: &MemoryRegion<'_>,
        range: Range<usize>,
        target: RemoteMemoryRegion,
        remote_offset: usize,
        immediate: Option<u32>,
        signaled: bool,
        send_inline: bool,
    ) -> Result<(), TransportError> {
        let buf = self.checked_slice(region, &range)?;
        if remote_offset.checked_add(range.len()).map_or(true, |end| end > target.len) {
            return Err(TransportError::InvalidArgs(format!(
                "write of {} bytes at remote offset {} exceeds target region of {} bytes",
                range.len(),
                remote_offset,
                target.len
            )));
        }
        let ctx = self.packed_context(mt, wr_id)?;

        let iov = iovec {
            iov_base: buf as *mut c_void,
            iov_len: range.len(),
        };
        let mut desc = region.local_desc();
        let rma_iov = fi_rma_iov {
            addr: target.at(remote_offset, self.ctx.mr_mode().virt_addr),
            len: range.len(),
            key: target.rkey,
        };
        let msg = fi_msg_rma {
            msg_iov: &iov,
            desc: &mut desc,
            iov_count: 1,
            addr: FI_ADDR_UNSPEC,
            rma_iov: &rma_iov,
            rma_iov_count: 1,
            context: ctx,
            data: immediate.unwrap_or(0) as u64,
        };

        let mut flags = 0u64;
        if signaled {
            flags |= FI_COMPLETION as u64;
        }
        if send_inline {
            flags |= FI_INJECT as u64;
        }
        if immediate.is_some() {
            flags |= FI_REMOTE_CQ_DATA as u64;
        }

        let ret = unsafe { fi_writemsg(self.ep.as_ptr(), &msg, flags) };
        self.check_post_ret(ret, "fi_writemsg")
    }

    /// Posts a zero-length send, used as a pure synchronization signal.
    /// `immediate`, if given, is exposed to the peer's matching
    /// `on_receive` dispatch as the completion's immediate data.
    pub fn post_empty_send(
        &self,
        mt: &MessageType,
        wr_id: u64,
        immediate: Option<u32>,
    ) -> Result<(), TransportError> {
        let ctx = self.packed_context(mt, wr_id)?;
        let ret = self.sendmsg_raw(std::ptr::null(), 0, std::ptr::null_mut(), ctx, immediate);
        self.check_post_ret(ret, "fi_sendmsg")
    }

    /// Posts a zero-length receive buffer, matching [`Endpoint::post_empty_send`].
    pub fn post_empty_recv(&self, mt: &MessageType, wr_id: u64) -> Result<(), TransportError> {
        let ctx = self.packed_context(mt, wr_id)?;
        let ret = self.recvmsg_raw(std::ptr::null_mut(), 0, std::ptr::null_mut(), ctx);
        self.check_post_ret(ret, "fi_recvmsg")
    }

    fn checked_slice(&self, region: &MemoryRegion<'_>, range: &Range<usize>) -> Result<*const c_void, TransportError> {
        if range.start > range.end || range.end > region.len() {
            return Err(TransportError::InvalidArgs(format!(
                "range {:?} is out of bounds for a region of {} bytes",
                range,
                region.len()
            )));
        }
        Ok((region.addr() + range.start as u64) as *const c_void)
    }

    /// Shared `fi_sendmsg` plumbing for [`Endpoint::post_send`] and
    /// [`Endpoint::post_empty_send`]; always sets `FI_COMPLETION` (see
    /// [`Endpoint::post_send`]'s doc comment) plus `FI_REMOTE_CQ_DATA` when
    /// `immediate` is given.
    fn sendmsg_raw(
        &self,
        buf: *const c_void,
        len: usize,
        mut desc: *mut c_void,
        ctx: *mut c_void,
        immediate: Option<u32>,
    ) -> isize {
        let iov = iovec {
            iov_base: buf as *mut c_void,
            iov_len: len,
        };
        let msg = fi_msg {
            msg_iov: &iov,
            desc: &mut desc,
            iov_count: 1,
            addr: FI_ADDR_UNSPEC,
            context: ctx,
            data: immediate.unwrap_or(0) as u64,
        };
        let mut flags = FI_COMPLETION as u64;
        if immediate.is_some() {
            flags |= FI_REMOTE_CQ_DATA as u64;
        }
        unsafe { fi_sendmsg(self.ep.as_ptr(), &msg, flags) }
    }

    /// Shared `fi_recvmsg` plumbing for [`Endpoint::post_recv`] and
    /// [`Endpoint::post_empty_recv`]; always sets `FI_COMPLETION`, see
    /// [`Endpoint::post_send`]'s doc comment.
    fn recvmsg_raw(&self, buf: *mut c_void, len: usize, mut desc: *mut c_void, ctx: *mut c_void) -> isize {
        let iov = iovec { iov_base: buf, iov_len: len };
        let msg = fi_msg {
            msg_iov: &iov,
            desc: &mut desc,
            iov_count: 1,
            addr: FI_ADDR_UNSPEC,
            context: ctx,
            data: 0,
        };
        unsafe { fi_recvmsg(self.ep.as_ptr(), &msg, FI_COMPLETION as u64) }
    }

    fn packed_context(&self, mt: &MessageType, wr_id: u64) -> Result<*mut c_void, TransportError> {
        mt.pack_context(wr_id).map(|ctx| ctx as usize as *mut c_void).ok_or_else(|| {
            log::warn!(
                "wr_id {wr_id:#x} overlaps message type {} tag bits for peer {}",
                mt.name(),
                self.peer_id
            );
            TransportError::InvalidArgs(format!(
                "wr_id {wr_id:#x} overlaps message type {} tag bits",
                mt.name()
            ))
        })
    }

    fn check_post_ret(&self, ret: isize, op: &'static str) -> Result<(), TransportError> {
        if ret == 0 {
            return Ok(());
        }
        let detail = fi_error_string(ret as i32);
        log::warn!("{op} failed for peer {}: {detail}", self.peer_id);
        Err(TransportError::FatalFabric { op, detail })
    }
}

fn bind_and_enable(ctx: &FabricContext, ep: FidEndpoint, peer_id: NodeId) {
    let cq_flags = (FI_TRANSMIT | FI_RECV | FI_SELECTIVE_COMPLETION) as u64;
    let ret = unsafe { fi_ep_bind(ep.as_ptr(), ctx.cq().as_fid(), cq_flags) };
    if ret != 0 {
        fatal!(ret, "fi_ep_bind (cq) failed for peer {peer_id}");
    }
    let ret = unsafe { fi_ep_bind(ep.as_ptr(), ctx.eq_ep().as_ptr() as *mut fid, 0) };
    if ret != 0 {
        fatal!(ret, "fi_ep_bind (eq) failed for peer {peer_id}");
    }
    let ret = unsafe { fi_enable(ep.as_ptr()) };
    if ret != 0 {
        fatal!(ret, "fi_enable failed for peer {peer_id}");
    }
}

