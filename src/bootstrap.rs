//! Out-of-band TCP bootstrap channel.
//!
//! Every member of a static group connects to every other member exactly
//! once: the side with the smaller id dials out, the side with the larger
//! id accepts, so the two sides never race each other to connect the same
//! socket pair. [`crate::fabric::FabricContext::initialize`] and
//! [`crate::fabric::RemoteRegionExchange`] both bootstrap over this
//! channel.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::TransportError;

/// Identifies a member of the static group, used consistently across
/// `initialize(members, self_id)`, `Endpoint`, and this bootstrap channel.
pub type NodeId = usize;

/// The well-known TCP port used for bootstrap when the caller does not
/// override it.
pub const DEFAULT_BOOTSTRAP_PORT: u16 = 28000;

fn broken(peer: NodeId, reason: impl ToString) -> TransportError {
    TransportError::ConnectionBroken {
        peer,
        reason: reason.to_string(),
    }
}

fn write_node_id(stream: &mut TcpStream, id: NodeId) -> io::Result<()> {
    stream.write_all(&(id as u64).to_le_bytes())
}

fn read_node_id(stream: &mut TcpStream) -> io::Result<NodeId> {
    let mut buf = [0u8; 8];
    stream.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf) as NodeId)
}

fn connect_with_retry(addr: SocketAddr) -> io::Result<TcpStream> {
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => return Err(e),
        }
    }
}

/// A connected, full-duplex TCP bootstrap channel to every other member of
/// the group.
///
/// Construction connects every pair of peers exactly once using the
/// lower-id-dials-out / higher-id-accepts rule, so that by the time
/// [`TcpBootstrap::new`] returns, a dedicated `TcpStream` exists for every
/// other member.
pub struct TcpBootstrap {
    self_id: NodeId,
    port: u16,
    streams: Mutex<BTreeMap<NodeId, TcpStream>>,
}

impl TcpBootstrap {
    /// Connects to every member named in `members` other than `self_id`,
    /// on `port`. Blocks until every connection is established.
    pub fn new(
        members: &BTreeMap<NodeId, SocketAddrV4>,
        self_id: NodeId,
        port: u16,
    ) -> io::Result<Self> {
        let lower: Vec<NodeId> = members.keys().copied().filter(|&id| id < self_id).collect();
        let higher: Vec<NodeId> = members.keys().copied().filter(|&id| id > self_id).collect();

        let acceptor = if lower.is_empty() {
            None
        } else {
            let listener = TcpListener::bind(("0.0.0.0", port))?;
            let expected = lower.len();
            Some(std::thread::spawn(move || -> io::Result<Vec<(NodeId, TcpStream)>> {
                let mut accepted = Vec::with_capacity(expected);
                while accepted.len() < expected {
                    let (mut stream, _) = listener.accept()?;
                    stream.set_nodelay(true)?;
                    let peer_id = read_node_id(&mut stream)?;
                    accepted.push((peer_id, stream));
                }
                Ok(accepted)
            }))
        };

        let mut streams = BTreeMap::new();
        for id in higher {
            let addr = *members.get(&id).expect("id came from members' own keys");
            let mut stream = connect_with_retry(SocketAddr::V4(addr))?;
            write_node_id(&mut stream, self_id)?;
            streams.insert(id, stream);
        }

        if let Some(handle) = acceptor {
            let accepted = handle
                .join()
                .unwrap_or_else(|_| panic!("bootstrap acceptor thread panicked"))?;
            streams.extend(accepted);
        }

        log::debug!(
            "TcpBootstrap: node {self_id} connected to {} peers on port {port}",
            streams.len()
        );

        Ok(Self {
            self_id,
            port,
            streams: Mutex::new(streams),
        })
    }

    /// This node's own id.
    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    /// Connects to a peer that was not known at construction time. Dials
    /// out immediately if `self_id() < id`, or blocks accepting one inbound
    /// connection otherwise.
    pub fn add_node(&self, id: NodeId, addr: SocketAddrV4) -> io::Result<()> {
        let mut streams = self.streams.lock().unwrap();
        if streams.contains_key(&id) {
            return Ok(());
        }

        let stream = if self.self_id < id {
            let mut stream = connect_with_retry(SocketAddr::V4(addr))?;
            write_node_id(&mut stream, self.self_id)?;
            stream
        } else {
            let listener = TcpListener::bind(("0.0.0.0", self.port))?;
            let (mut stream, _) = listener.accept()?;
            stream.set_nodelay(true)?;
            let _ = read_node_id(&mut stream)?;
            stream
        };

        streams.insert(id, stream);
        Ok(())
    }

    /// Synchronously swaps `out` with `peer_id`'s own value, returning it in
    /// `in_`. Each side writes before it blocks on read; since the streams
    /// are dedicated per-peer full-duplex sockets, this cannot deadlock for
    /// the small, fixed-size payloads this crate exchanges (120, 24, 0
    /// bytes).
    pub fn exchange<T: Copy>(
        &self,
        peer_id: NodeId,
        out: T,
        in_: &mut T,
    ) -> Result<(), TransportError> {
        let mut streams = self.streams.lock().unwrap();
        let stream = streams
            .get_mut(&peer_id)
            .ok_or_else(|| broken(peer_id, "no bootstrap connection to this peer"))?;

        // SAFETY: `T: Copy` types have no destructor and no interior
        // pointers we need to worry about; reinterpreting their bytes for a
        // symmetric wire exchange of plain-old-data is the documented
        // contract of this method.
        let out_bytes = unsafe {
            std::slice::from_raw_parts(&out as *const T as *const u8, std::mem::size_of::<T>())
        };
        stream
            .write_all(out_bytes)
            .map_err(|e| broken(peer_id, e))?;

        let in_bytes = unsafe {
            std::slice::from_raw_parts_mut(in_ as *mut T as *mut u8, std::mem::size_of::<T>())
        };
        stream.read_exact(in_bytes).map_err(|e| broken(peer_id, e))?;
        Ok(())
    }

    /// A zero-payload symmetric exchange used as a two-party barrier. Higher
    /// layers compose pairwise syncs into group barriers; this crate only
    /// provides the pairwise primitive.
    pub fn sync(&self, peer_id: NodeId) -> bool {
        self.exchange(peer_id, (), &mut ()).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn loopback_members(ids: &[NodeId], base_port: u16) -> BTreeMap<NodeId, SocketAddrV4> {
        ids.iter()
            .map(|&id| (id, SocketAddrV4::new(Ipv4Addr::LOCALHOST, base_port)))
            .collect()
    }

    #[test]
    fn two_node_bringup_and_exchange_roundtrip() {
        let port = 29001;
        let members = loopback_members(&[0, 1], port);

        let m0 = members.clone();
        let t0 = std::thread::spawn(move || {
            let bs = TcpBootstrap::new(&m0, 0, port).unwrap();
            let mut recvd = [0u8; 24];
            bs.exchange(1, [7u8; 24], &mut recvd).unwrap();
            assert_eq!(recvd, [9u8; 24]);
            assert!(bs.sync(1));
        });

        let bs1 = TcpBootstrap::new(&members, 1, port).unwrap();
        let mut recvd = [0u8; 24];
        bs1.exchange(0, [9u8; 24], &mut recvd).unwrap();
        assert_eq!(recvd, [7u8; 24]);
        assert!(bs1.sync(0));

        t0.join().unwrap();
    }

    #[test]
    fn exchange_with_unknown_peer_is_connection_broken() {
        let port = 29002;
        let members = loopback_members(&[0, 1], port);
        let m0 = members.clone();
        let t1 = std::thread::spawn(move || {
            TcpBootstrap::new(&m0, 1, port).unwrap();
        });
        let bs0 = TcpBootstrap::new(&members, 0, port).unwrap();
        let mut recvd = 0u32;
        let err = bs0.exchange(42, 1u32, &mut recvd).unwrap_err();
        assert!(matches!(err, TransportError::ConnectionBroken { peer: 42, .. }));
        t1.join().unwrap();
    }
}
