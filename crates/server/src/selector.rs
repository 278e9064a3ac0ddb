//! Component B: the server selector.
//!
//! Given a query's type and name, decides whether the engine can answer
//! locally (a literal address, an empty NOERROR, or NXDOMAIN) or must
//! forward, and if forwarding, which upstream *kind*/domain the query is
//! restricted to.

use dnsfwd_proto::ReplyFlags;

use crate::config::Options;
use crate::upstream::{UpstreamFlags, UpstreamSet};

/// What kind of address record the query is asking for — mirrors
/// `extract_request`'s `F_IPV4`/`F_IPV6`/`F_QUERY` result (a return of
/// `0`, meaning malformed, never reaches the selector: the caller drops
/// the datagram first).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Ipv4,
    Ipv6,
    Other,
}

/// The outcome of classification: either an answer this engine can send
/// without forwarding, or a restriction on which upstreams are eligible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    Answer(ReplyFlags),
    Forward {
        /// The winning entry's kind bits (`FOR_NODOTS`, `HAS_DOMAIN`, or
        /// plain/empty if no entry restricted the query).
        kind: UpstreamFlags,
        /// Set only when `kind == HAS_DOMAIN`.
        domain: Option<String>,
    },
}

fn family_matches(literal: std::net::IpAddr, qtype: QueryKind) -> bool {
    matches!(
        (literal, qtype),
        (std::net::IpAddr::V4(_), QueryKind::Ipv4) | (std::net::IpAddr::V6(_), QueryKind::Ipv6)
    )
}

/// Implements §4.B. `qdomain` is the first (and only) QNAME this engine
/// cares about; it is assumed already lowercased/ready for
/// `eq_ignore_ascii_case` comparison.
pub fn classify(servers: &UpstreamSet, qtype: QueryKind, qdomain: &str, options: &Options) -> SelectOutcome {
    let mut kind = UpstreamFlags::empty();
    let mut domain: Option<String> = None;
    let mut match_len = 0usize;
    let mut answer: Option<ReplyFlags> = None;
    let has_dot = qdomain.contains('.');

    for (_, server) in servers.iter() {
        if server.flags.contains(UpstreamFlags::FOR_NODOTS) && kind != UpstreamFlags::HAS_DOMAIN && !has_dot {
            kind = UpstreamFlags::FOR_NODOTS;
            answer = literal_or_noaddr(server, qtype, family_matches);
        } else if server.flags.contains(UpstreamFlags::HAS_DOMAIN) {
            let Some(suffix) = server.domain.as_deref() else { continue };
            if qdomain.len() >= suffix.len() && domain_suffix_matches(qdomain, suffix) && suffix.len() >= match_len {
                kind = UpstreamFlags::HAS_DOMAIN;
                domain = Some(suffix.to_string());
                match_len = suffix.len();
                answer = literal_or_noaddr_domain(server, qtype, family_matches);
            }
        }
    }

    if let Some(flags) = answer {
        return SelectOutcome::Answer(flags);
    }

    if kind.is_empty() && options.nodots_local && !has_dot {
        return SelectOutcome::Answer(ReplyFlags::NxDomain);
    }

    SelectOutcome::Forward { kind, domain }
}

fn literal_or_noaddr(
    server: &crate::upstream::UpstreamServer,
    qtype: QueryKind,
    family_matches: impl Fn(std::net::IpAddr, QueryKind) -> bool,
) -> Option<ReplyFlags> {
    if server.is_no_addr() {
        Some(ReplyFlags::NoError)
    } else if server.is_literal() {
        let literal = server.literal?;
        if family_matches(literal, qtype) {
            Some(to_reply(literal))
        } else {
            None
        }
    } else {
        None
    }
}

fn literal_or_noaddr_domain(
    server: &crate::upstream::UpstreamServer,
    qtype: QueryKind,
    family_matches: impl Fn(std::net::IpAddr, QueryKind) -> bool,
) -> Option<ReplyFlags> {
    if server.is_no_addr() {
        Some(ReplyFlags::NoError)
    } else if server.is_literal() {
        let literal = server.literal?;
        // Domain-restricted literals also answer non-address queries for
        // that name with an empty NOERROR, matching the original's
        // `(sflag | F_QUERY) & qtype` test.
        if family_matches(literal, qtype) {
            Some(to_reply(literal))
        } else if qtype == QueryKind::Other {
            Some(ReplyFlags::NoError)
        } else {
            None
        }
    } else {
        None
    }
}

fn to_reply(addr: std::net::IpAddr) -> ReplyFlags {
    match addr {
        std::net::IpAddr::V4(v4) => ReplyFlags::Ipv4(v4),
        std::net::IpAddr::V6(v6) => ReplyFlags::Ipv6(v6),
    }
}

/// Whole-label suffix match: `qdomain` ends in `suffix`, and the match is
/// either the whole name or immediately preceded by a label boundary.
/// Plain byte-suffix comparison would wrongly match "evilsub.org" against
/// suffix "ub.org"; requiring the preceding byte be a dot (or the match be
/// the entire name) avoids that.
fn domain_suffix_matches(qdomain: &str, suffix: &str) -> bool {
    if qdomain.len() == suffix.len() {
        return qdomain.eq_ignore_ascii_case(suffix);
    }
    if qdomain.len() < suffix.len() {
        return false;
    }
    let split = qdomain.len() - suffix.len();
    qdomain.as_bytes()[split - 1] == b'.' && qdomain[split..].eq_ignore_ascii_case(suffix)
}
