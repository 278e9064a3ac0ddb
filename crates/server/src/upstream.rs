//! Component A: the upstream server set.
//!
//! A read-mostly ordered list, built once at startup from configuration.
//! Order is significant — it is both the ring-walk order for fan-out and
//! the tie-break the original spec never needs because the selector
//! (component B) already picks a unique eligible subset.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bitflags::bitflags;
use tokio::net::UdpSocket;

bitflags! {
    /// Mutually exclusive *kind* bits plus orthogonal modifier bits, as
    /// the data model describes. Exactly zero or one kind bit is set per
    /// entry; `NO_ADDR`/`LITERAL_ADDRESS` may additionally be set on any
    /// kind.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UpstreamFlags: u16 {
        /// Matches single-label (no-dot) queries.
        const FOR_NODOTS = 1 << 0;
        /// Matches a configured domain suffix.
        const HAS_DOMAIN = 1 << 1;
        /// Answer with NOERROR and no data rather than forwarding.
        const NO_ADDR = 1 << 2;
        /// Answer with a fixed address from this entry rather than forwarding.
        const LITERAL_ADDRESS = 1 << 3;
    }
}

impl UpstreamFlags {
    /// The *kind* bits only, used for the eligibility comparison in
    /// `C.kind == type` (§4.D): two entries of different kinds are never
    /// interchangeable, but two plain entries (no kind bit at all) are.
    pub const KIND_MASK: UpstreamFlags = UpstreamFlags::FOR_NODOTS.union(UpstreamFlags::HAS_DOMAIN);

    pub fn kind(self) -> UpstreamFlags {
        self & Self::KIND_MASK
    }

    pub fn is_plain(self) -> bool {
        self.kind().is_empty()
    }
}

/// One configured upstream nameserver.
#[derive(Debug)]
pub struct UpstreamServer {
    pub addr: SocketAddr,
    pub flags: UpstreamFlags,
    /// Present only when `flags` has `HAS_DOMAIN` set.
    pub domain: Option<String>,
    /// Present only when `flags` has `LITERAL_ADDRESS` set.
    pub literal: Option<IpAddr>,
    /// The shared per-address-family UDP socket used to send to this
    /// upstream. Shared across every entry of the same family, mirroring
    /// how the original groups servers onto one `serverfd` per family.
    pub udp: Arc<UdpSocket>,
}

impl UpstreamServer {
    pub fn kind(&self) -> UpstreamFlags {
        self.flags.kind()
    }

    pub fn is_literal(&self) -> bool {
        self.flags.contains(UpstreamFlags::LITERAL_ADDRESS)
    }

    pub fn is_no_addr(&self) -> bool {
        self.flags.contains(UpstreamFlags::NO_ADDR)
    }

    /// Hostname equality per RFC 1035 §3.1: case-insensitive, byte-wise
    /// (no Unicode normalization — this engine deals in already-encoded
    /// ASCII/punycode labels, matching the scope of `hostname_isequal`).
    pub fn domain_matches(&self, suffix: &str) -> bool {
        self.domain
            .as_deref()
            .is_some_and(|d| d.eq_ignore_ascii_case(suffix))
    }
}

/// The ordered, read-mostly list of configured upstreams, plus the
/// "sticky server" index used as the starting point for unconstrained
/// queries.
pub struct UpstreamSet {
    servers: Vec<UpstreamServer>,
}

impl UpstreamSet {
    pub fn new(servers: Vec<UpstreamServer>) -> Self {
        Self { servers }
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn get(&self, index: usize) -> &UpstreamServer {
        &self.servers[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &UpstreamServer)> {
        self.servers.iter().enumerate()
    }

    /// Ring-walk starting at `start`, yielding `(index, server)` pairs
    /// until we loop back to `start`, inclusive of `start` itself.
    pub fn ring_from(&self, start: usize) -> RingWalk<'_> {
        RingWalk {
            set: self,
            start,
            next: Some(start),
        }
    }
}

pub struct RingWalk<'a> {
    set: &'a UpstreamSet,
    start: usize,
    next: Option<usize>,
}

impl<'a> Iterator for RingWalk<'a> {
    type Item = (usize, &'a UpstreamServer);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.next?;
        let item = (idx, self.set.get(idx));
        let advanced = (idx + 1) % self.set.len();
        self.next = if advanced == self.start { None } else { Some(advanced) };
        Some(item)
    }
}
