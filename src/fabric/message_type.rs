//! Message-type registry and packed work-request context.
//!
//! The registry hands out a stable, monotonic tag space so the polling loop
//! can dispatch a completion to its handler set in O(1) without a
//! per-endpoint routing table. The tag and the caller's `wr_id` are
//! bit-packed into the single opaque 64-bit context the fabric hands back
//! on completion.

use std::fmt;
use std::sync::{Arc, RwLock};

/// Number of low bits reserved for the caller-supplied `wr_id`. The
/// remaining high bits hold the message-type tag. Every [`MessageType`]
/// reports the same value through its own `shift_bits` field, because the
/// polling loop must be able to recover a handler's tag from the context
/// before it knows which message type produced it, which only works if the
/// split point is fixed process-wide rather than chosen independently per
/// type.
pub const WR_ID_BITS: u32 = 48;

const WR_ID_MASK: u64 = (1u64 << WR_ID_BITS) - 1;

/// The message-type tag. Tags are assigned sequentially from zero; the
/// maximum representable value ([`Tag::MAX`]) is reserved for
/// [`MessageTypeRegistry::ignored`].
pub type Tag = u16;

/// A completion handler: `(wr_id, success, bytes, immediate)`.
pub type CompletionHandler = Arc<dyn Fn(u64, bool, usize, Option<u32>) + Send + Sync>;

fn noop_handler() -> CompletionHandler {
    Arc::new(|_, _, _, _| {})
}

/// A caller-defined category of work request, associated with three
/// completion handlers and a unique tag.
#[derive(Clone)]
pub struct MessageType {
    tag: Tag,
    name: Arc<str>,
    /// See [`WR_ID_BITS`]; reported per-instance even though every instance
    /// currently shares the same split point.
    pub shift_bits: u32,
    on_send: CompletionHandler,
    on_receive: CompletionHandler,
    on_write: CompletionHandler,
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageType")
            .field("tag", &self.tag)
            .field("name", &self.name)
            .finish()
    }
}

impl MessageType {
    /// The assigned tag.
    #[inline]
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// The diagnostic name given at registration.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Packs `wr_id` with this type's tag into the opaque 64-bit context
    /// the fabric returns on completion. Returns `None` if `wr_id` overlaps
    /// the tag bits.
    pub fn pack_context(&self, wr_id: u64) -> Option<u64> {
        if wr_id & !WR_ID_MASK != 0 {
            return None;
        }
        Some(((self.tag as u64) << WR_ID_BITS) | wr_id)
    }

    pub(crate) fn dispatch_send(&self, wr_id: u64, success: bool, bytes: usize, imm: Option<u32>) {
        (self.on_send)(wr_id, success, bytes, imm);
    }

    pub(crate) fn dispatch_recv(&self, wr_id: u64, success: bool, bytes: usize, imm: Option<u32>) {
        (self.on_receive)(wr_id, success, bytes, imm);
    }

    pub(crate) fn dispatch_write(&self, wr_id: u64, success: bool, bytes: usize, imm: Option<u32>) {
        (self.on_write)(wr_id, success, bytes, imm);
    }
}

/// Splits a packed opaque context back into `(tag, wr_id)`.
#[inline]
pub(crate) fn unpack_context(ctx: u64) -> (Tag, u64) {
    ((ctx >> WR_ID_BITS) as Tag, ctx & WR_ID_MASK)
}

/// Global table mapping a numeric tag to a triple of completion handlers.
/// Registration is serialized by an internal mutex; the table
/// itself is append-only for the lifetime of the process, so dispatch reads
/// never contend with a registering caller beyond taking a read lock over
/// a `Vec` that is only ever pushed to.
#[derive(Clone, Default)]
pub struct MessageTypeRegistry {
    entries: Arc<RwLock<Vec<MessageType>>>,
}

impl MessageTypeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically appends an entry and returns the assigned tag.
    pub fn register(
        &self,
        name: impl Into<Arc<str>>,
        on_send: CompletionHandler,
        on_receive: CompletionHandler,
        on_write: CompletionHandler,
    ) -> MessageType {
        let mut entries = self.entries.write().expect("message type registry poisoned");
        let tag = entries.len() as Tag;
        assert!(
            (tag as usize) < Tag::MAX as usize,
            "message type registry exhausted its tag space"
        );
        let entry = MessageType {
            tag,
            name: name.into(),
            shift_bits: WR_ID_BITS,
            on_send,
            on_receive,
            on_write,
        };
        entries.push(entry.clone());
        entry
    }

    /// A sentinel whose handlers are no-ops and whose tag is [`Tag::MAX`].
    /// Work requests posted with this type complete normally but produce no
    /// callback dispatch; it is never inserted into the registry.
    pub fn ignored() -> MessageType {
        MessageType {
            tag: Tag::MAX,
            name: Arc::from("ignored"),
            shift_bits: WR_ID_BITS,
            on_send: noop_handler(),
            on_receive: noop_handler(),
            on_write: noop_handler(),
        }
    }

    /// Looks up the handler set for `tag`. Returns `None` for [`Tag::MAX`]
    /// (the `ignored` sentinel) or an out-of-range tag.
    pub(crate) fn lookup(&self, tag: Tag) -> Option<MessageType> {
        if tag == Tag::MAX {
            return None;
        }
        let entries = self.entries.read().expect("message type registry poisoned");
        entries.get(tag as usize).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_consecutive_from_zero() {
        let reg = MessageTypeRegistry::new();
        let a = reg.register("a", noop_handler(), noop_handler(), noop_handler());
        let b = reg.register("b", noop_handler(), noop_handler(), noop_handler());
        assert_eq!(a.tag(), 0);
        assert_eq!(b.tag(), 1);
    }

    #[test]
    fn ignored_tag_is_max_and_not_looked_up() {
        let reg = MessageTypeRegistry::new();
        let ignored = MessageTypeRegistry::ignored();
        assert_eq!(ignored.tag(), Tag::MAX);
        assert!(reg.lookup(Tag::MAX).is_none());
    }

    #[test]
    fn pack_and_unpack_roundtrips_wr_id() {
        let reg = MessageTypeRegistry::new();
        let t = reg.register("rpc", noop_handler(), noop_handler(), noop_handler());
        let ctx = t.pack_context(0x1234).unwrap();
        let (tag, wr_id) = unpack_context(ctx);
        assert_eq!(tag, t.tag());
        assert_eq!(wr_id, 0x1234);
    }

    #[test]
    fn wr_id_overlapping_tag_bits_is_rejected() {
        let reg = MessageTypeRegistry::new();
        let t = reg.register("rpc", noop_handler(), noop_handler(), noop_handler());
        let huge = 1u64 << WR_ID_BITS;
        assert!(t.pack_context(huge).is_none());
    }

    #[test]
    fn lookup_finds_registered_handler_by_tag() {
        let reg = MessageTypeRegistry::new();
        let t = reg.register("rpc", noop_handler(), noop_handler(), noop_handler());
        let found = reg.lookup(t.tag()).unwrap();
        assert_eq!(found.name(), "rpc");
    }
}
