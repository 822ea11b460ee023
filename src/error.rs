//! Error taxonomy for the transport layer.
//!
//! This layer draws a hard line between two dispositions: a *fatal* failure
//! (misconfiguration, a broken setup handshake, a dead provider) that no
//! caller can meaningfully recover from, and a *reported* failure (a single
//! bad work request) that is returned to the caller as an ordinary
//! `Result`. [`TransportError`] covers the latter; [`fatal!`] the former.

use thiserror::Error;

/// Reported error taxonomy. Fatal dispositions never construct this type;
/// they abort the process instead, see [`fatal!`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// A null buffer, a zero size, a `wr_id` overlapping the tag bits, or a
    /// slice that runs past the end of a memory region.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// The TCP side-channel was lost during setup or region exchange.
    #[error("TCP bootstrap connection to peer {peer} broken: {reason}")]
    ConnectionBroken {
        /// The peer whose connection broke.
        peer: crate::bootstrap::NodeId,
        /// The underlying I/O failure.
        reason: String,
    },

    /// A surface method exists but is intentionally unimplemented.
    #[error("{0} is not implemented")]
    UnsupportedFeature(&'static str),

    /// A non-zero return from the provider during a *reported* (not fatal)
    /// call path, e.g. a failed `fi_writemsg`.
    #[error("fabric provider error in {op}: {detail}")]
    FatalFabric {
        /// The operation that failed, e.g. `"fi_send"`.
        op: &'static str,
        /// A human-readable provider error string.
        detail: String,
    },
}

/// Aborts the process with a `file:line, return code, description` message.
///
/// Any error raised during initialization, passive-endpoint setup, the
/// connection-manager handshake, or the final rendezvous indicates
/// misconfiguration or partial global state this layer cannot recover from,
/// so it logs at `error` level and then aborts rather than unwinding.
macro_rules! fatal {
    ($ret:expr, $($arg:tt)*) => {{
        let ret: i32 = $ret;
        let msg = format!($($arg)*);
        let detail = $crate::utils::interop::fi_error_string(ret);
        ::log::error!(
            "{}:{}, return code {}, {}: {}",
            file!(),
            line!(),
            ret,
            msg,
            detail,
        );
        ::std::process::abort()
    }};
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        ::log::error!("{}:{}, {}", file!(), line!(), msg);
        ::std::process::abort()
    }};
}

pub(crate) use fatal;
