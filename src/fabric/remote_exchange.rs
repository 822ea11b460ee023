//! Pairwise remote-memory-region gossip over the TCP bootstrap.

use std::collections::HashMap;

use crate::bootstrap::NodeId;
use crate::error::TransportError;

use super::context::FabricContext;
use super::mr::{MemoryRegion, RemoteMemoryRegion};

/// Exchanges a locally registered region's descriptor with a set of peers
/// over the TCP bootstrap channel, so each side learns the other's
/// `(addr, len, rkey)` before either one issues an RMA write against it.
pub struct RemoteRegionExchange;

impl RemoteRegionExchange {
    /// Sends `local`'s descriptor to, and receives one back from, every
    /// peer in `peers`. A peer that is unreachable surfaces as
    /// [`TransportError::ConnectionBroken`]; every peer exchanged before
    /// the failure is discarded along with it, since a partially populated
    /// map of remote regions is not a state any caller can usefully act on.
    ///
    /// Each peer's descriptor is exchanged as three separate rounds (address,
    /// then length, then remote key), each a bare `u64`, rather than one
    /// combined struct.
    pub fn exchange(
        ctx: &FabricContext,
        local: &MemoryRegion<'_>,
        peers: &[NodeId],
    ) -> Result<HashMap<NodeId, RemoteMemoryRegion>, TransportError> {
        let local_remote = local.as_remote();
        let mut regions = HashMap::with_capacity(peers.len());
        for &peer in peers {
            let mut addr = 0u64;
            ctx.bootstrap().exchange(peer, local_remote.addr, &mut addr)?;
            let mut len = 0u64;
            ctx.bootstrap().exchange(peer, local_remote.len as u64, &mut len)?;
            let mut rkey = 0u64;
            ctx.bootstrap().exchange(peer, local_remote.rkey, &mut rkey)?;

            let theirs = RemoteMemoryRegion::new(addr, len as usize, rkey);
            log::debug!(
                "remote region from peer {peer}: addr={:#x} len={} rkey={:#x}",
                theirs.addr,
                theirs.len,
                theirs.rkey
            );
            regions.insert(peer, theirs);
        }
        Ok(regions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    use crate::bootstrap::TcpBootstrap;

    #[test]
    fn exchange_with_unreachable_peer_reports_connection_broken() {
        let members: std::collections::BTreeMap<NodeId, SocketAddrV4> = [
            (0, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 29101)),
            (1, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 29101)),
        ]
        .into_iter()
        .collect();

        let m1 = members.clone();
        let t1 = std::thread::spawn(move || {
            TcpBootstrap::new(&m1, 1, 29101).unwrap();
        });
        let bootstrap = TcpBootstrap::new(&members, 0, 29101).unwrap();
        let mut dummy = RemoteMemoryRegion::dummy();
        let err = bootstrap.exchange(42, dummy, &mut dummy).unwrap_err();
        assert!(matches!(err, TransportError::ConnectionBroken { peer: 42, .. }));
        t1.join().unwrap();
    }
}
