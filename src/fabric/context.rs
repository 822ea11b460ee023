//! Fabric context bootstrap.
//!
//! `FabricContext` is the per-process handle returned by [`initialize`] and
//! threaded into every other component's constructor (`MemoryRegion`,
//! `Endpoint`, `RemoteRegionExchange`). It is a plain, cheaply cloned
//! handle rather than a mutable global, so the only process-wide state left
//! is the polling task's shutdown/interrupt flags (see [`super::polling`]).

use std::collections::BTreeMap;
use std::ffi::CString;
use std::io;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use regex::Regex;

use crate::bindings::*;
use crate::bootstrap::{NodeId, TcpBootstrap};
use crate::config::Config;
use crate::error::fatal;
use crate::utils::interop::from_c_err;

use super::cq::CompletionQueue;
use super::message_type::MessageTypeRegistry;
use super::polling::PollingHandle;

/// Maximum length of a passive endpoint address this crate will carry over
/// the TCP bootstrap's fixed 120-byte frame.
pub const MAX_PEP_ADDR_LEN: usize = 112;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct FidFabric(NonNull<fid_fabric>);
impl_fid_wrapper_traits!(fid_fabric, FidFabric);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct FidDomain(NonNull<fid_domain>);
impl_fid_wrapper_traits!(fid_domain, FidDomain);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct FidPep(NonNull<fid_pep>);
impl_fid_wrapper_traits!(fid_pep, FidPep);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct FidEq(NonNull<fid_eq>);
impl_fid_wrapper_traits!(fid_eq, FidEq);

impl FidEq {
    /// Blocks with an infinite timeout until a CM event arrives. Returns
    /// the event type and, if the event carries one, the `fid_ep`
    /// handle and `fi_info` of the associated connection request.
    pub(crate) fn sread_cm(&self) -> io::Result<(u32, fi_eq_cm_entry)> {
        let mut event: u32 = 0;
        let mut entry: fi_eq_cm_entry = unsafe { std::mem::zeroed() };
        let ret = unsafe {
            fi_eq_sread(
                self.as_ptr(),
                &mut event,
                &mut entry as *mut _ as *mut std::ffi::c_void,
                std::mem::size_of::<fi_eq_cm_entry>(),
                -1,
                0,
            )
        };
        if ret < 0 {
            return from_c_err(ret as i32);
        }
        Ok((event, entry))
    }
}

/// Access mode flags a memory region was registered with, derived once at
/// initialization from the chosen `fi_info`'s `domain_attr.mr_mode`: fixed
/// for the lifetime of the context so every subsequent registration and
/// remote-write target address computation is consistent.
#[derive(Debug, Clone, Copy, Default)]
pub struct MrModeFlags {
    /// `FI_MR_LOCAL`: local send/recv buffers must be explicitly registered.
    pub local: bool,
    /// `FI_MR_ALLOCATED`: the provider requires registration of
    /// provider-allocated memory.
    pub allocated: bool,
    /// `FI_MR_VIRT_ADDR`: remote-write target addresses are the remote's
    /// absolute virtual address rather than zero-based.
    pub virt_addr: bool,
}

struct FabricContextInner {
    config: Config,
    fabric: FidFabric,
    domain: FidDomain,
    mr_mode: MrModeFlags,
    pep: FidPep,
    eq_pep: FidEq,
    eq_ep: FidEq,
    cq: CompletionQueue,
    registry: MessageTypeRegistry,
    bootstrap: TcpBootstrap,
    pep_addr: Vec<u8>,
    polling: PollingHandle,
    info_template: NonNull<fi_info>,
}

// `fi_info` is only ever accessed through `FabricContext`'s owning `Arc`,
// which is itself `Send + Sync` (see `FidEq`/`FidFabric`/... above for the
// same reasoning applied to the other provider handles).
unsafe impl Send for FabricContextInner {}
unsafe impl Sync for FabricContextInner {}

impl Drop for FabricContextInner {
    fn drop(&mut self) {
        // Reverse initialization order: polling task, then endpoints (owned
        // by callers, already released by the time we get here), completion
        // queue, event queues, domain, fabric.
        self.polling.shutdown();
        let ret = unsafe { close_fid(self.cq.as_fid()) };
        if ret != 0 {
            log::warn!("failed to close shared completion queue: {}", crate::utils::interop::fi_error_string(ret));
        }
        for (name, eq) in [("pep event queue", self.eq_pep), ("endpoint event queue", self.eq_ep)] {
            let ret = unsafe { close_fid(eq.as_ptr() as *mut fid) };
            if ret != 0 {
                log::warn!("failed to close {name}: {}", crate::utils::interop::fi_error_string(ret));
            }
        }
        let ret = unsafe { close_fid(self.pep.as_ptr() as *mut fid) };
        if ret != 0 {
            log::warn!("failed to close passive endpoint: {}", crate::utils::interop::fi_error_string(ret));
        }
        let ret = unsafe { close_fid(self.domain.as_ptr() as *mut fid) };
        if ret != 0 {
            log::warn!("failed to close domain: {}", crate::utils::interop::fi_error_string(ret));
        }
        let ret = unsafe { close_fid(self.fabric.as_ptr() as *mut fid) };
        if ret != 0 {
            log::warn!("failed to close fabric: {}", crate::utils::interop::fi_error_string(ret));
        }
        unsafe { fi_freeinfo(self.info_template.as_ptr()) };
    }
}

/// Process-wide fabric bootstrap handle. Cheaply `Clone`-able; every
/// clone refers to the same underlying fabric/domain/queues, which are torn
/// down when the last clone is dropped (equivalent to calling
/// [`FabricContext::destroy`]).
#[derive(Clone)]
pub struct FabricContext {
    inner: Arc<FabricContextInner>,
}

fn select_domain_info(info_list: NonNull<fi_info>, domain_pattern: &str) -> NonNull<fi_info> {
    let re = Regex::new(domain_pattern).unwrap_or_else(|_| Regex::new(".*").unwrap());
    let mut cur = Some(info_list);
    while let Some(node) = cur {
        // SAFETY: `fi_getinfo` returns a valid singly linked list of
        // `fi_info` nodes; each is valid until `fi_freeinfo` is called.
        let info = unsafe { node.as_ref() };
        let name_matches = unsafe {
            if info.domain_attr.is_null() {
                false
            } else {
                let name = (*info.domain_attr).name;
                if name.is_null() {
                    false
                } else {
                    let name = std::ffi::CStr::from_ptr(name).to_string_lossy();
                    re.is_match(&name)
                }
            }
        };
        if name_matches {
            return node;
        }
        cur = NonNull::new(info.next);
    }
    // No exact domain-name match: fall back to the first candidate, which
    // is what every other provider-selection call site in this crate does
    // when the hint cannot be satisfied exactly.
    info_list
}

impl FabricContext {
    /// Idempotent per process: bootstraps the TCP side-channel, queries the
    /// provider for matching fabric info, opens the fabric/domain/queues,
    /// stands up the passive endpoint, and spawns the polling task.
    ///
    /// Crashes with a precise `file:line, return code, description` message
    /// on any provider failure.
    pub fn initialize(
        members: &BTreeMap<NodeId, std::net::SocketAddrV4>,
        self_id: NodeId,
        bootstrap_port: u16,
    ) -> Self {
        let config = Config::from_env_or_default();
        log::info!(
            "initializing fabric context: provider={} domain={} tx_depth={} rx_depth={}",
            config.provider,
            config.domain,
            config.tx_depth,
            config.rx_depth
        );

        let bootstrap = TcpBootstrap::new(members, self_id, bootstrap_port)
            .unwrap_or_else(|e| fatal!("TcpBootstrap::new failed: {e}"));

        // `fi_allocinfo` mallocs an `fi_info` with every attribute
        // sub-struct (`ep_attr`, `domain_attr`, `fabric_attr`, ...)
        // pre-allocated, since those fields are pointers, not embedded
        // structs; building hints by hand would dereference nulls.
        let hints_ptr = unsafe { fi_allocinfo() };
        let hints_ptr = NonNull::new(hints_ptr).unwrap_or_else(|| fatal!("fi_allocinfo returned null"));
        {
            let hints = unsafe { hints_ptr.as_ptr().as_mut() }.unwrap();
            hints.caps =
                (FI_MSG | FI_RMA | FI_READ | FI_WRITE | FI_REMOTE_READ | FI_REMOTE_WRITE) as u64;
            unsafe { (*hints.ep_attr).type_ = fi_ep_type::FI_EP_MSG };
            unsafe { (*hints.fabric_attr).prov_name = cstring_ptr(&config.provider) };
            unsafe { (*hints.domain_attr).name = cstring_ptr(&config.domain) };
        }

        let mut info_ptr: *mut fi_info = ptr::null_mut();
        let ret = unsafe {
            fi_getinfo(
                crate::bindings::FI_VERSION_CURRENT,
                ptr::null(),
                ptr::null(),
                0,
                hints_ptr.as_ptr(),
                &mut info_ptr,
            )
        };
        unsafe { fi_freeinfo(hints_ptr.as_ptr()) };
        if ret != 0 {
            fatal!(ret, "fi_getinfo failed for provider {}", config.provider);
        }
        let info_list = NonNull::new(info_ptr).unwrap_or_else(|| fatal!("fi_getinfo returned no info"));
        let info_node = select_domain_info(info_list, &config.domain);
        let info = unsafe { info_node.as_ref() };

        // Endpoints constructed later (both server- and client-side) need
        // their own `fi_info` template to pass to `fi_endpoint`/`fi_getinfo`
        // with a destination address attached; keep a private copy alive
        // for the context's lifetime rather than re-querying the provider
        // on every `connect`.
        let info_template_ptr = unsafe { fi_dupinfo(info_node.as_ptr()) };
        let info_template = NonNull::new(info_template_ptr)
            .unwrap_or_else(|| fatal!("fi_dupinfo returned null"));

        let mut fabric_ptr: *mut fid_fabric = ptr::null_mut();
        let ret = unsafe { fi_fabric(info.fabric_attr, &mut fabric_ptr, ptr::null_mut()) };
        if ret != 0 {
            fatal!(ret, "fi_fabric failed");
        }
        let fabric = FidFabric(NonNull::new(fabric_ptr).unwrap());

        let mut domain_ptr: *mut fid_domain = ptr::null_mut();
        let ret = unsafe {
            fi_domain(
                fabric.as_ptr(),
                info_node.as_ptr(),
                &mut domain_ptr,
                ptr::null_mut(),
            )
        };
        if ret != 0 {
            fatal!(ret, "fi_domain failed");
        }
        let domain = FidDomain(NonNull::new(domain_ptr).unwrap());

        let mr_mode_bits = unsafe { (*info.domain_attr).mr_mode } as u32;
        let mr_mode = MrModeFlags {
            local: mr_mode_bits & FI_MR_LOCAL != 0,
            allocated: mr_mode_bits & FI_MR_ALLOCATED != 0,
            virt_addr: mr_mode_bits & FI_MR_VIRT_ADDR != 0,
        };

        let cq = CompletionQueue::open(domain.as_ptr(), config.tx_depth + config.rx_depth)
            .unwrap_or_else(|ret| fatal!(ret, "fi_cq_open failed"));

        let eq_pep = open_eq(fabric.as_ptr()).unwrap_or_else(|ret| fatal!(ret, "fi_eq_open (pep) failed"));
        let eq_ep = open_eq(fabric.as_ptr()).unwrap_or_else(|ret| fatal!(ret, "fi_eq_open (ep) failed"));

        let mut pep_ptr: *mut fid_pep = ptr::null_mut();
        let ret = unsafe { fi_passive_ep(fabric.as_ptr(), info_node.as_ptr(), &mut pep_ptr, ptr::null_mut()) };
        if ret != 0 {
            fatal!(ret, "fi_passive_ep failed");
        }
        let pep = FidPep(NonNull::new(pep_ptr).unwrap());

        let ret = unsafe { fi_pep_bind(pep.as_ptr(), eq_pep.as_ptr() as *mut fid, 0) };
        if ret != 0 {
            fatal!(ret, "fi_pep_bind (eq) failed");
        }
        let ret = unsafe { fi_listen(pep.as_ptr()) };
        if ret != 0 {
            fatal!(ret, "fi_listen failed");
        }

        let mut addr_buf = vec![0u8; MAX_PEP_ADDR_LEN];
        let mut addr_len = addr_buf.len();
        let ret = unsafe {
            fi_getname(
                pep.as_ptr() as *mut fid,
                addr_buf.as_mut_ptr() as *mut std::ffi::c_void,
                &mut addr_len,
            )
        };
        if ret != 0 {
            fatal!(ret, "fi_getname failed");
        }
        if addr_len > MAX_PEP_ADDR_LEN {
            fatal!(
                "passive endpoint address is {addr_len} bytes, exceeding the {MAX_PEP_ADDR_LEN}-byte limit"
            );
        }
        addr_buf.truncate(addr_len);

        unsafe { fi_freeinfo(info_ptr) };

        let registry = MessageTypeRegistry::new();
        let polling = PollingHandle::spawn(cq.clone(), registry.clone());

        log::debug!("fabric context initialized for node {self_id}, pep address is {addr_len} bytes");

        Self {
            inner: Arc::new(FabricContextInner {
                config,
                fabric,
                domain,
                mr_mode,
                pep,
                eq_pep,
                eq_ep,
                cq,
                registry,
                bootstrap,
                pep_addr: addr_buf,
                polling,
                info_template,
            }),
        }
    }

    /// Reverses initialization: releases the polling task, closes the
    /// completion queue, event queues, domain, and fabric, in that order.
    /// Equivalent to dropping the last clone of this handle.
    pub fn destroy(self) {
        drop(self);
    }

    pub(crate) fn domain_ptr(&self) -> *mut fid_domain {
        self.inner.domain.as_ptr()
    }

    pub(crate) fn fabric_ptr(&self) -> *mut fid_fabric {
        self.inner.fabric.as_ptr()
    }

    pub(crate) fn pep(&self) -> FidPep {
        self.inner.pep
    }

    pub(crate) fn eq_pep(&self) -> FidEq {
        self.inner.eq_pep
    }

    pub(crate) fn eq_ep(&self) -> FidEq {
        self.inner.eq_ep
    }

    /// A fresh `fi_dupinfo` copy of the `fi_info` template selected at
    /// initialization. The caller owns the returned pointer and must
    /// release it with `fi_freeinfo`.
    pub(crate) fn dup_info_template(&self) -> NonNull<fi_info> {
        let ptr = unsafe { fi_dupinfo(self.inner.info_template.as_ptr()) };
        NonNull::new(ptr).unwrap_or_else(|| fatal!("fi_dupinfo returned null"))
    }

    pub(crate) fn cq(&self) -> &CompletionQueue {
        &self.inner.cq
    }

    /// The provider/domain/queue-depth configuration used at
    /// initialization.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The memory-region access-mode flags fixed at initialization.
    pub fn mr_mode(&self) -> MrModeFlags {
        self.inner.mr_mode
    }

    /// The global message-type registry shared by every endpoint.
    pub fn registry(&self) -> &MessageTypeRegistry {
        &self.inner.registry
    }

    /// The TCP bootstrap channel used for address and memory-region
    /// exchange.
    pub fn bootstrap(&self) -> &TcpBootstrap {
        &self.inner.bootstrap
    }

    /// This node's own passive-endpoint address, at most
    /// [`MAX_PEP_ADDR_LEN`] bytes. Treated as opaque bytes.
    pub fn local_pep_addr(&self) -> &[u8] {
        &self.inner.pep_addr
    }

    /// Selects the polling task's wake-up strategy: busy-poll (the
    /// default, `false`) for microsecond-scale latency at full CPU cost, or
    /// a blocking-equivalent wait (`true`) between empty polls. Takes
    /// effect on the polling task's next iteration.
    pub fn set_interrupt_mode(&self, interrupt: bool) {
        self.inner.polling.set_interrupt_mode(interrupt);
    }
}

fn open_eq(fabric: *mut fid_fabric) -> Result<FidEq, i32> {
    let mut attr: fi_eq_attr = unsafe { std::mem::zeroed() };
    attr.size = 256;
    attr.wait_obj = fi_wait_obj::FI_WAIT_UNSPEC;
    let mut eq_ptr: *mut fid_eq = ptr::null_mut();
    let ret = unsafe { fi_eq_open(fabric, &attr, &mut eq_ptr, ptr::null_mut()) };
    if ret != 0 {
        return Err(ret);
    }
    Ok(FidEq(NonNull::new(eq_ptr).unwrap()))
}

/// Duplicates `s` with `libc::strdup` rather than `CString::into_raw`: the
/// `fi_info` hints structure's string fields are expected to be allocated
/// with the platform allocator, because `fi_freeinfo` frees them with
/// `free(3)` when it tears the hints struct down.
fn cstring_ptr(s: &str) -> *mut std::os::raw::c_char {
    let c = CString::new(s).expect("config value contains a NUL byte");
    // SAFETY: `c` is a valid NUL-terminated string; `strdup` copies it into
    // a freshly `malloc`-ed buffer that `fi_freeinfo` may later `free`.
    unsafe { libc::strdup(c.as_ptr()) }
}
