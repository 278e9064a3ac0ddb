//! Object-safe seams the engine calls out to before/after forwarding.
//!
//! Neither trait here does any work on its own — a DNS answer cache is
//! explicitly out of scope for this engine. They exist so a cache, or a
//! query log, or a blocklist can be wired in without the engine knowing
//! anything about how it's implemented, the same way `AuthorityObject`
//! lets the server crate call into a zone implementation it has never
//! heard of.

use std::net::SocketAddr;

/// Consulted before forwarding. Returning a length greater than zero
/// short-circuits the selector entirely — the answer is already known and
/// there is nothing to send upstream.
pub trait LocalAnswer: Send + Sync {
    /// `query` is the raw client datagram. On a hit, write the full reply
    /// into `buf` and return its length; on a miss, return `0` without
    /// touching `buf`.
    fn answer(&self, query: &[u8], buf: &mut [u8]) -> usize;
}

/// A [`LocalAnswer`] that never has anything cached, used when the
/// engine is wired up without a cache at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl LocalAnswer for NoCache {
    fn answer(&self, _query: &[u8], _buf: &mut [u8]) -> usize {
        0
    }
}

/// Consulted after an upstream reply passes the engine's own
/// recursion-available check, before it is relayed to the client.
pub trait ReplyObserver: Send + Sync {
    /// Whether `reply` looks like an upstream's bogus-NXDOMAIN-wildcard
    /// habit of answering any unknown name with an advertiser-controlled
    /// address. Consulted only for `OPCODE == QUERY` replies with
    /// `RCODE` of `NOERROR` or `NXDOMAIN`; a bogus reply is dropped
    /// rather than relayed.
    fn is_bogus_wildcard(&self, reply: &[u8]) -> bool {
        let _ = reply;
        false
    }

    /// A `NOERROR` reply carrying at least one answer passed every check
    /// and is about to be relayed; an implementation may cache it.
    fn observe_positive(&self, reply: &[u8]) {
        let _ = reply;
    }

    /// An `NXDOMAIN` or empty-`NOERROR` reply passed every check and is
    /// about to be relayed; an implementation may cache the negative
    /// result.
    fn observe_negative(&self, reply: &[u8]) {
        let _ = reply;
    }

    /// The engine rejected a reply (bad RA bit, bogus wildcard answer,
    /// truncated OPT record) before relaying it.
    fn on_rejected(&self, qdomain: &str, from: SocketAddr, reason: &str) {
        let _ = (qdomain, from, reason);
    }
}

/// A [`ReplyObserver`] that does nothing, used when no cache or logging
/// hook is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ReplyObserver for NoopObserver {}
