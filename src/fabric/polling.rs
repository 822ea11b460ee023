//! Background completion-polling task.
//!
//! One task drains the shared completion queue for the lifetime of a
//! [`super::FabricContext`], dispatching each completion to the handler
//! registered under its packed context's tag. The poll/wait tradeoff is
//! resolved with a busy-poll loop that yields to a blocking-equivalent wait
//! whenever [`PollingHandle::set_interrupt_mode`] has been set, so a caller
//! can trade latency for CPU occupancy at runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use quanta::Instant;

use super::cq::CompletionQueue;
use super::message_type::{unpack_context, MessageTypeRegistry};

/// Maximum completions drained from the queue in a single `fi_cq_read` call.
const MAX_CQ_ENTRIES: usize = 1024;

/// Length of the busy-poll window before yielding the scheduler a chance to
/// run something else.
const BUSY_POLL_WINDOW: Duration = Duration::from_millis(50);

struct Shared {
    shutdown: AtomicBool,
    interrupt_mode: AtomicBool,
}

/// A running polling task's handle. Dropping the last clone does not stop
/// the task; call [`PollingHandle::shutdown`] explicitly, which
/// [`super::FabricContext`]'s `Drop` does on the way down.
pub(crate) struct PollingHandle {
    shared: Arc<Shared>,
    join: Option<JoinHandle<()>>,
}

impl PollingHandle {
    /// Spawns the polling thread and returns a handle to it.
    pub(crate) fn spawn(cq: CompletionQueue, registry: MessageTypeRegistry) -> Self {
        let shared = Arc::new(Shared {
            shutdown: AtomicBool::new(false),
            interrupt_mode: AtomicBool::new(false),
        });
        let worker_shared = shared.clone();
        let join = std::thread::Builder::new()
            .name("fabric-poll".into())
            .spawn(move || poll_loop(cq, registry, worker_shared))
            .expect("failed to spawn completion-polling thread");
        Self {
            shared,
            join: Some(join),
        }
    }

    /// Selects busy-poll (`false`) or blocking-wait (`true`) mode for
    /// subsequent poll iterations.
    pub fn set_interrupt_mode(&self, interrupt: bool) {
        self.shared.interrupt_mode.store(interrupt, Ordering::Relaxed);
    }

    /// Signals the polling thread to stop and waits for it to exit.
    pub(crate) fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn poll_loop(cq: CompletionQueue, registry: MessageTypeRegistry, shared: Arc<Shared>) {
    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            return;
        }

        if shared.interrupt_mode.load(Ordering::Relaxed) {
            // Blocking mode: a single read with a bounded timeout, re-checked
            // against the shutdown flag on wakeup.
            dispatch_batch(cq.poll_batch(MAX_CQ_ENTRIES), &registry);
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }

        let window_start = Instant::now();
        while window_start.elapsed() < BUSY_POLL_WINDOW {
            if shared.shutdown.load(Ordering::Relaxed) {
                return;
            }
            let entries = cq.poll_batch(MAX_CQ_ENTRIES);
            if entries.is_empty() {
                std::hint::spin_loop();
                continue;
            }
            dispatch_batch(entries, &registry);
        }
    }
}

fn dispatch_batch(entries: Vec<super::cq::CqEntry>, registry: &MessageTypeRegistry) {
    for entry in entries {
        let (tag, wr_id) = unpack_context(entry.context);
        let Some(message_type) = registry.lookup(tag) else {
            continue;
        };
        if entry.flags & FI_SEND_FLAG as u64 != 0 {
            message_type.dispatch_send(wr_id, entry.success, entry.len, entry.immediate);
        } else if entry.flags & FI_RECV_FLAG as u64 != 0 {
            message_type.dispatch_recv(wr_id, entry.success, entry.len, entry.immediate);
        } else if entry.flags & FI_WRITE_FLAG as u64 != 0 {
            message_type.dispatch_write(wr_id, entry.success, entry.len, entry.immediate);
        }
    }
}

// Mirrors `FI_SEND`/`FI_RECV`/`FI_WRITE` from `<rdma/fabric.h>`, which also
// double as completion-queue flags identifying which operation a
// `fi_cq_data_entry` completed.
use crate::bindings::{FI_RECV as FI_RECV_FLAG, FI_SEND as FI_SEND_FLAG, FI_WRITE as FI_WRITE_FLAG};
